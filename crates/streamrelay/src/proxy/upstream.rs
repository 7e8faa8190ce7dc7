//! Outbound calls to the streaming completions endpoint

use std::time::Duration;

use reqwest::Client;
use url::Url;

use crate::config::{UpstreamConfig, parse_http_url};
use crate::error::{RelayError, Result};
use crate::messages::{Message, UpstreamRequest};

use super::error::ProxyError;

/// Client for the upstream streaming completions API
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    client: Client,
    url: Url,
    api_key: String,
    system_prompt: String,
}

impl UpstreamClient {
    /// Build a client from config, resolving the credential
    ///
    /// Fails with [`RelayError::Config`] when no credential is available.
    pub fn new(config: &UpstreamConfig, timeout: Duration) -> Result<Self> {
        let api_key = config.resolve_api_key()?;
        let url = parse_http_url("upstream.url", &config.url)?;

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RelayError::Config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            url,
            api_key,
            system_prompt: config.system_prompt.clone(),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Upstream body for one attempt: the system preamble followed by the caller's messages
    pub fn build_request<'a>(&self, model: &'a str, messages: &[Message]) -> UpstreamRequest<'a> {
        let mut all = Vec::with_capacity(messages.len() + 1);
        all.push(Message::system(self.system_prompt.clone()));
        all.extend_from_slice(messages);

        UpstreamRequest {
            model,
            messages: all,
            stream: true,
        }
    }

    /// Issue one streaming request; the response body is left unread
    pub async fn send(
        &self,
        model: &str,
        messages: &[Message],
    ) -> std::result::Result<reqwest::Response, ProxyError> {
        let request = self.build_request(model, messages);

        self.client
            .post(self.url.clone())
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProxyError::Network(format!("Request timed out: {e}"))
                } else if e.is_connect() {
                    ProxyError::Network(format!("Failed to connect to upstream: {e}"))
                } else {
                    ProxyError::Network(format!("Request failed: {e}"))
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Role;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn create_test_config(url: String) -> UpstreamConfig {
        UpstreamConfig {
            url,
            api_key: Some("test-key".to_string()),
            system_prompt: "Be kind.".to_string(),
            ..UpstreamConfig::default()
        }
    }

    #[test]
    fn test_new_without_key_fails() {
        let config = UpstreamConfig {
            api_key: None,
            api_key_env: "STREAMRELAY_TEST_UPSTREAM_UNSET".to_string(),
            ..UpstreamConfig::default()
        };
        let err = UpstreamClient::new(&config, Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));
    }

    #[test]
    fn test_build_request_prefixes_system_prompt() {
        let config = create_test_config("https://api.example.com/v1/chat/completions".into());
        let client = UpstreamClient::new(&config, Duration::from_secs(5)).unwrap();

        let messages = vec![Message::user("one"), Message::assistant("two")];
        let request = client.build_request("m", &messages);

        assert!(request.stream);
        assert_eq!(request.model, "m");
        assert_eq!(request.messages.len(), 3);
        assert_eq!(request.messages[0].role, Role::System);
        assert_eq!(request.messages[0].content, "Be kind.");
        assert_eq!(&request.messages[1..], &messages[..]);
    }

    #[tokio::test]
    async fn test_send_uses_bearer_and_stream_flag() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("Authorization", "Bearer test-key"))
            .and(body_partial_json(serde_json::json!({
                "model": "gpt-4o",
                "stream": true
            })))
            .respond_with(ResponseTemplate::new(200).set_body_string("data: [DONE]\n"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let config = create_test_config(format!("{}/v1/chat/completions", mock_server.uri()));
        let client = UpstreamClient::new(&config, Duration::from_secs(5)).unwrap();

        let response = client.send("gpt-4o", &[Message::user("hi")]).await.unwrap();
        assert_eq!(response.status().as_u16(), 200);
    }

    #[tokio::test]
    async fn test_send_connection_failure_is_network_error() {
        let config = create_test_config("http://127.0.0.1:1/v1/chat/completions".into());
        let client = UpstreamClient::new(&config, Duration::from_secs(5)).unwrap();

        let err = client.send("gpt-4o", &[]).await.unwrap_err();
        assert!(matches!(err, ProxyError::Network(_)));
    }
}
