//! Transport seam between the conversation driver and the relay

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use reqwest::Client;
use url::Url;

use crate::config::{ClientConfig, parse_http_url};
use crate::error::{RelayError, Result};
use crate::messages::{ChatRequest, Message};
use crate::proxy::MODEL_USED_HEADER;

/// Response body as a stream of raw chunks
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// What the relay answered for one attempt
pub struct RelayResponse {
    pub status: u16,
    /// Value of the `x-model-used` header, if present
    pub model_used: Option<String>,
    pub body: Option<ByteStream>,
}

impl std::fmt::Debug for RelayResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayResponse")
            .field("status", &self.status)
            .field("model_used", &self.model_used)
            .field("body", &self.body.as_ref().map(|_| "<stream>"))
            .finish()
    }
}

/// Issues one conversation request to the relay
#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn open(&self, messages: &[Message]) -> Result<RelayResponse>;
}

/// HTTP transport backed by reqwest
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    url: Url,
    api_key: Option<String>,
}

impl HttpTransport {
    pub fn new(url: Url, api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            url,
            api_key,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        let url = parse_http_url("client.relay_url", &config.relay_url)?;
        Ok(Self::new(url, config.resolve_api_key()))
    }
}

#[async_trait]
impl RelayTransport for HttpTransport {
    async fn open(&self, messages: &[Message]) -> Result<RelayResponse> {
        let request = ChatRequest {
            messages: messages.to_vec(),
        };

        let mut builder = self.client.post(self.url.clone()).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| RelayError::Transport(format!("Request to relay failed: {e}")))?;

        let status = response.status().as_u16();
        let model_used = response
            .headers()
            .get(MODEL_USED_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body = response
            .bytes_stream()
            .map(|chunk| {
                chunk.map_err(|e| RelayError::Transport(format!("Failed to read body: {e}")))
            })
            .boxed();

        Ok(RelayResponse {
            status,
            model_used,
            body: Some(body),
        })
    }
}
