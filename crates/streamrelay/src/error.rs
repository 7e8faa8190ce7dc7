//! Error types for streamrelay

use thiserror::Error;

/// Main error type for relay and client operations
#[derive(Error, Debug)]
pub enum RelayError {
    /// Configuration errors (missing credential, bad URL, unreadable file)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Rate limit persisted past the retry budget
    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    /// Payment or quota exhausted
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Network failure or unusable relay response
    #[error("Transport error: {0}")]
    Transport(String),

    /// A conversation already has a request in flight
    #[error("Conversation is busy: a reply is still streaming")]
    Busy,
}

/// Result type alias for streamrelay operations
pub type Result<T> = std::result::Result<T, RelayError>;
