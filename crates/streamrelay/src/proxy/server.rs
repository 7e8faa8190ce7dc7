//! HTTP relay server
//!
//! Implements the streaming relay:
//! - `POST /chat` (and `POST /`) relays a conversation upstream with retry,
//!   backoff and a single model downgrade, streaming the upstream body back
//! - preflight requests are answered before any relay logic runs
//! - `GET /health` for liveness checks

use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, State},
    http::{
        StatusCode,
        header::{CACHE_CONTROL, CONTENT_TYPE, RETRY_AFTER},
    },
    response::{IntoResponse, Response},
    routing::{get, post},
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{RelayError, Result};
use crate::messages::ChatRequest;

use super::error::ProxyError;
use super::policy::{RelayAttempt, RelayPolicy, RelayState, TerminalKind, UpstreamVerdict};
use super::upstream::UpstreamClient;

/// Response header naming the model that served the request
pub const MODEL_USED_HEADER: &str = "x-model-used";

/// Shared application state for all handlers
#[derive(Clone)]
pub struct AppState {
    /// Retry and downgrade policy
    pub policy: RelayPolicy,
    /// Upstream client; `None` when no credential is configured
    pub upstream: Option<UpstreamClient>,
}

impl AppState {
    pub fn new(policy: RelayPolicy, upstream: Option<UpstreamClient>) -> Self {
        Self { policy, upstream }
    }
}

/// The relay server
pub struct ProxyServer {
    config: Config,
}

impl ProxyServer {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Start the relay and listen for requests
    ///
    /// Refuses to start without an upstream credential.
    pub async fn serve(&self) -> Result<()> {
        let upstream = UpstreamClient::new(
            &self.config.upstream,
            Duration::from_secs(self.config.proxy.timeout_secs),
        )?;
        let policy = RelayPolicy::from_config(&self.config.proxy, &self.config.upstream);

        let addr: SocketAddr = self
            .config
            .proxy
            .listen_addr
            .parse()
            .map_err(|e| RelayError::Config(format!("Invalid listen address: {e}")))?;

        tracing::info!("Starting relay server on {addr}");
        tracing::info!("Upstream endpoint: {}", upstream.url());
        tracing::info!(
            "Models: primary={}, fallback={}, max_attempts={}, budget={:?}",
            policy.primary_model,
            policy.fallback_model,
            policy.max_attempts,
            policy.budget
        );

        let app = create_router(Arc::new(AppState::new(policy, Some(upstream))));

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| RelayError::Transport(format!("Failed to bind to {addr}: {e}")))?;

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| RelayError::Transport(format!("Server error: {e}")))?;

        tracing::info!("Relay server shut down gracefully");
        Ok(())
    }
}

/// Create the router with all routes configured
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/chat", post(relay_handler).options(preflight_handler))
        .route("/", post(relay_handler).options(preflight_handler))
        // Conversations grow without bound; size is left to the upstream
        .layer(DefaultBodyLimit::disable())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint - returns JSON status
async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

/// Bare OPTIONS requests that the CORS layer did not already answer
async fn preflight_handler() -> StatusCode {
    StatusCode::OK
}

/// Relay one conversation upstream
///
/// Any failure, including a malformed body, becomes a JSON error response.
async fn relay_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let request_id = Uuid::new_v4();
    let span = tracing::info_span!("relay", %request_id);

    match relay(&state, &body).instrument(span).await {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(
                %request_id,
                error_type = e.category(),
                error_message = %e,
                "Relay request failed"
            );
            e.into_response()
        }
    }
}

async fn relay(state: &AppState, body: &[u8]) -> std::result::Result<Response, ProxyError> {
    let upstream = state.upstream.as_ref().ok_or_else(|| {
        ProxyError::Config("Upstream API key is not configured".to_string())
    })?;

    let request: ChatRequest =
        serde_json::from_slice(body).map_err(|e| ProxyError::Request(e.to_string()))?;
    tracing::debug!("Relaying conversation with {} messages", request.messages.len());

    let mut attempt = RelayAttempt::new(&state.policy);
    let mut relay_state = RelayState::Attempting;
    let mut last_response: Option<reqwest::Response> = None;

    loop {
        relay_state = match relay_state {
            RelayState::Attempting => {
                let response = upstream.send(&attempt.model, &request.messages).await?;
                let status = response.status().as_u16();
                let retry_after = response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok());
                let verdict = UpstreamVerdict::classify(status, retry_after);
                last_response = Some(response);
                attempt.advance(&state.policy, verdict)
            }
            RelayState::BackoffWait(delay) => {
                tracing::warn!(
                    "Rate limited on attempt {}/{}, waiting {:?}",
                    attempt.attempt,
                    state.policy.max_attempts,
                    delay
                );
                tokio::time::sleep(delay).await;
                RelayState::Attempting
            }
            RelayState::Downgraded => {
                tracing::warn!(
                    "Quota exhausted, retrying with fallback model {}",
                    attempt.model
                );
                RelayState::Attempting
            }
            RelayState::Success => {
                let response = last_response.take().ok_or_else(|| {
                    ProxyError::Network("No upstream response to stream".to_string())
                })?;
                tracing::info!(model = %attempt.model, "Upstream stream opened");
                return stream_response(response, &attempt.model);
            }
            RelayState::Terminal(kind) => {
                if let (TerminalKind::Upstream { status }, Some(response)) =
                    (kind, last_response.take())
                {
                    let body = response
                        .text()
                        .await
                        .unwrap_or_else(|_| "<unreadable body>".to_string());
                    tracing::error!(
                        error_type = "upstream",
                        status,
                        body = %body,
                        "Upstream returned error"
                    );
                }
                return Err(kind.into());
            }
        };
    }
}

/// Pass the upstream body through unmodified as an event stream
fn stream_response(
    upstream: reqwest::Response,
    model: &str,
) -> std::result::Result<Response, ProxyError> {
    let status = StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::OK);

    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/event-stream")
        .header(CACHE_CONTROL, "no-cache")
        .header(MODEL_USED_HEADER, model)
        .body(Body::from_stream(upstream.bytes_stream()))
        .map_err(|e| ProxyError::Network(format!("Failed to build response: {e}")))
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use tower::ServiceExt;

    fn create_test_state() -> Arc<AppState> {
        Arc::new(AppState::new(RelayPolicy::default(), None))
    }

    async fn body_string(response: Response) -> String {
        let body_bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(body_bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = create_router(create_test_state());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_string(response).await.contains("\"status\":\"ok\""));
    }

    #[tokio::test]
    async fn test_cors_preflight_answered_without_credential() {
        let app = create_router(create_test_state());

        let response = app
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/chat")
                    .header("Origin", "https://app.example.com")
                    .header("Access-Control-Request-Method", "POST")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert!(response.status().is_success());
        assert!(
            response
                .headers()
                .contains_key("access-control-allow-origin")
        );
        assert!(body_string(response).await.is_empty());
    }

    #[tokio::test]
    async fn test_bare_options_answered_with_empty_success() {
        let app = create_router(create_test_state());

        let response = app
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/chat")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_string(response).await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_credential_is_configuration_error() {
        let app = create_router(create_test_state());

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/chat")
                    .header("Content-Type", "application/json")
                    .body(Body::from(r#"{"messages":[]}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_string(response).await;
        assert!(body.contains("configuration_error"));
    }

    #[test]
    fn test_model_used_header_name() {
        assert_eq!(MODEL_USED_HEADER, "x-model-used");
    }
}
