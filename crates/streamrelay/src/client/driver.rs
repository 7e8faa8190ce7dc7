//! The streaming conversation routine shared by every conversation
//!
//! One [`StreamDriver`] issues a request through a [`RelayTransport`], retries
//! rate limits and transport failures according to a [`RetryPolicy`], decodes
//! the streamed body and folds deltas into a [`Transcript`].

use std::fmt;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc::UnboundedSender;

use crate::config::ClientConfig;
use crate::error::{RelayError, Result};
use crate::messages::Message;

use super::decoder::{SseDecoder, StreamEvent};
use super::transcript::Transcript;
use super::transport::RelayTransport;

/// Client-side retry budget and backoff steps
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Multiplied by the attempt number after a rate-limited response
    pub rate_limit_backoff: Duration,
    /// Multiplied by the attempt number after a transport failure
    pub failure_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            rate_limit_backoff: Duration::from_millis(config.rate_limit_backoff_ms),
            failure_backoff: Duration::from_millis(config.failure_backoff_ms),
        }
    }

    /// Same backoff steps, one attempt only
    pub fn single_attempt(&self) -> Self {
        Self {
            max_attempts: 1,
            ..self.clone()
        }
    }
}

/// User-facing notifications produced while driving a conversation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// Relay is rate limiting; another attempt follows after `wait`
    RateLimitedRetrying { attempt: u32, wait: Duration },
    /// The relay served the reply with the cheaper fallback model
    EconomyMode { model: String },
    RateLimitExhausted,
    QuotaExceeded,
    Failed(String),
}

impl Notice {
    /// Whether this notice ends the request
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Notice::RateLimitExhausted | Notice::QuotaExceeded | Notice::Failed(_)
        )
    }
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::RateLimitedRetrying { attempt, wait } => write!(
                f,
                "Rate limited, retrying in {:.1}s (attempt {attempt})",
                wait.as_secs_f64()
            ),
            Notice::EconomyMode { model } => {
                write!(f, "Economy mode: this reply was generated by {model}")
            }
            Notice::RateLimitExhausted => {
                write!(f, "Too many requests. Please wait a moment and try again.")
            }
            Notice::QuotaExceeded => write!(f, "Credits exhausted. Please add funds to continue."),
            Notice::Failed(reason) => write!(f, "Could not get a reply: {reason}"),
        }
    }
}

/// Events published while a conversation streams
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Newly received text fragment
    Delta(String),
    Notice(Notice),
}

enum AttemptError {
    RateLimited,
    Quota,
    Transport(String),
}

/// Drives one request/stream cycle against the relay
pub struct StreamDriver<T> {
    transport: T,
    fallback_model: Option<String>,
    events: Option<UnboundedSender<ClientEvent>>,
}

impl<T: RelayTransport> StreamDriver<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            fallback_model: None,
            events: None,
        }
    }

    /// Model name that marks a reply as served in economy mode
    pub fn with_fallback_model(mut self, model: impl Into<String>) -> Self {
        self.fallback_model = Some(model.into());
        self
    }

    /// Publish deltas and notices to `events`
    pub fn with_events(mut self, events: UnboundedSender<ClientEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Send `outgoing` and fold the streamed reply into `transcript`
    ///
    /// A failed attempt leaves the transcript exactly as it was when the call
    /// started.
    pub async fn run(
        &self,
        outgoing: &[Message],
        transcript: &mut Transcript,
        policy: &RetryPolicy,
    ) -> Result<()> {
        let start_len = transcript.len();
        let mut economy_announced = false;
        let max_attempts = policy.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            let last = attempt == max_attempts;

            let error = match self
                .attempt(outgoing, transcript, &mut economy_announced)
                .await
            {
                Ok(()) => return Ok(()),
                Err(error) => error,
            };
            transcript.rollback(start_len);

            match error {
                AttemptError::RateLimited if !last => {
                    let wait = policy.rate_limit_backoff * attempt;
                    tracing::warn!(
                        "Relay rate limited attempt {attempt}/{max_attempts}, waiting {wait:?}"
                    );
                    self.notify(Notice::RateLimitedRetrying { attempt, wait });
                    tokio::time::sleep(wait).await;
                }
                AttemptError::RateLimited => {
                    self.notify(Notice::RateLimitExhausted);
                    return Err(RelayError::RateLimited(format!(
                        "relay still rate limited after {max_attempts} attempts"
                    )));
                }
                AttemptError::Quota => {
                    self.notify(Notice::QuotaExceeded);
                    return Err(RelayError::QuotaExceeded(
                        "relay reported exhausted credits".to_string(),
                    ));
                }
                AttemptError::Transport(reason) if !last => {
                    let wait = policy.failure_backoff * attempt;
                    tracing::warn!(
                        "Attempt {attempt}/{max_attempts} failed, retrying in {wait:?}: {reason}"
                    );
                    tokio::time::sleep(wait).await;
                }
                AttemptError::Transport(reason) => {
                    tracing::error!("Giving up after {max_attempts} attempts: {reason}");
                    self.notify(Notice::Failed(reason.clone()));
                    return Err(RelayError::Transport(reason));
                }
            }
        }

        Err(RelayError::Transport("no attempts were made".to_string()))
    }

    async fn attempt(
        &self,
        outgoing: &[Message],
        transcript: &mut Transcript,
        economy_announced: &mut bool,
    ) -> std::result::Result<(), AttemptError> {
        let response = self
            .transport
            .open(outgoing)
            .await
            .map_err(|e| AttemptError::Transport(e.to_string()))?;

        match response.status {
            429 => return Err(AttemptError::RateLimited),
            402 => return Err(AttemptError::Quota),
            200..=299 => {}
            status => {
                return Err(AttemptError::Transport(format!(
                    "relay returned status {status}"
                )));
            }
        }

        let Some(mut body) = response.body else {
            return Err(AttemptError::Transport(
                "relay response has no body".to_string(),
            ));
        };

        if let (Some(used), Some(fallback)) = (&response.model_used, &self.fallback_model) {
            // Once per reply, even when a retry is served by the fallback again
            if used == fallback && !*economy_announced {
                *economy_announced = true;
                self.notify(Notice::EconomyMode {
                    model: used.clone(),
                });
            }
        }

        transcript.begin_reply();
        let mut decoder = SseDecoder::new();
        let mut accumulated = String::new();

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| AttemptError::Transport(e.to_string()))?;
            let events = decoder.feed(&chunk);
            self.fold_events(events, &mut accumulated, transcript);
            if decoder.is_done() {
                break;
            }
        }
        if !decoder.is_done() {
            let events = decoder.finish();
            self.fold_events(events, &mut accumulated, transcript);
        }

        transcript.finish_reply();
        tracing::debug!("Reply complete ({} chars)", accumulated.len());
        Ok(())
    }

    fn fold_events(
        &self,
        events: Vec<StreamEvent>,
        accumulated: &mut String,
        transcript: &mut Transcript,
    ) {
        for event in events {
            if let StreamEvent::Delta(text) = event {
                accumulated.push_str(&text);
                transcript.fold(accumulated);
                self.emit(ClientEvent::Delta(text));
            }
        }
    }

    fn notify(&self, notice: Notice) {
        self.emit(ClientEvent::Notice(notice));
    }

    fn emit(&self, event: ClientEvent) {
        if let Some(events) = &self.events {
            // Receiver gone means nobody is watching; the transcript still updates
            let _ = events.send(event);
        }
    }
}
