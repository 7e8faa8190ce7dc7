//! Terminal relay errors and their HTTP rendering
//!
//! Every request path ends either in a pass-through stream or in one of these
//! errors. The body is always `{"error": <message>, "code": <category>}`.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use super::policy::TerminalKind;

/// Errors that end a relayed request
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProxyError {
    /// Upstream credential missing
    #[error("Configuration error: {0}")]
    Config(String),

    /// Inbound request could not be parsed
    #[error("{0}")]
    Request(String),

    /// Quota still exhausted after the downgrade
    #[error("Payment required: upstream credits exhausted")]
    QuotaExceeded,

    /// Attempt budget exhausted
    #[error("Rate limit exceeded, please try again later")]
    RateLimitExhausted,

    /// Upstream returned a status that is not retried
    #[error("AI gateway error (upstream status {status})")]
    Upstream { status: u16 },

    /// Network-level error (connection, timeout, etc.)
    #[error("Network error: {0}")]
    Network(String),
}

impl ProxyError {
    /// HTTP status returned to the caller
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::QuotaExceeded => StatusCode::PAYMENT_REQUIRED,
            ProxyError::RateLimitExhausted => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable error category
    pub fn category(&self) -> &'static str {
        match self {
            ProxyError::Config(_) => "configuration_error",
            ProxyError::Request(_) => "internal_error",
            ProxyError::QuotaExceeded => "quota_exceeded",
            ProxyError::RateLimitExhausted => "rate_limited",
            ProxyError::Upstream { .. } => "gateway_error",
            ProxyError::Network(_) => "internal_error",
        }
    }
}

impl From<TerminalKind> for ProxyError {
    fn from(kind: TerminalKind) -> Self {
        match kind {
            TerminalKind::QuotaExceeded => ProxyError::QuotaExceeded,
            TerminalKind::RateLimitExhausted => ProxyError::RateLimitExhausted,
            TerminalKind::Upstream { status } => ProxyError::Upstream { status },
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.to_string(),
            "code": self.category(),
        });
        (self.status(), Json(body)).into_response()
    }
}
