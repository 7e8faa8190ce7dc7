//! Retry, backoff and model-downgrade policy for one relayed request
//!
//! The policy is a small state machine kept free of HTTP types so the
//! interaction between the single quota downgrade and the attempt budget can
//! be exercised directly. The server feeds it one [`UpstreamVerdict`] per
//! upstream response and acts on the returned [`RelayState`].

use std::time::Duration;

use crate::config::{BudgetMode, ProxyConfig, UpstreamConfig};

/// Static retry configuration shared by every request
#[derive(Debug, Clone, PartialEq)]
pub struct RelayPolicy {
    /// Upper bound on upstream attempts per inbound request
    pub max_attempts: u32,
    /// Linear backoff step used when upstream gives no retry delay
    pub backoff_step: Duration,
    /// Model used for the first attempt
    pub primary_model: String,
    /// Cheaper model tried once after a quota failure
    pub fallback_model: String,
    /// Whether the downgrade retry consumes an attempt slot
    pub budget: BudgetMode,
}

impl Default for RelayPolicy {
    fn default() -> Self {
        Self::from_config(&ProxyConfig::default(), &UpstreamConfig::default())
    }
}

impl RelayPolicy {
    pub fn from_config(proxy: &ProxyConfig, upstream: &UpstreamConfig) -> Self {
        Self {
            max_attempts: proxy.max_attempts,
            backoff_step: Duration::from_millis(proxy.backoff_step_ms),
            primary_model: upstream.primary_model.clone(),
            fallback_model: upstream.fallback_model.clone(),
            budget: proxy.budget,
        }
    }

    /// Delay before retrying after a rate-limited attempt
    ///
    /// `attempt` is the zero-based index of the attempt that was rejected. An
    /// upstream-provided delay always wins over the linear schedule.
    pub fn backoff_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        retry_after.unwrap_or_else(|| self.backoff_step * (attempt + 1))
    }
}

/// Classification of one upstream response
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UpstreamVerdict {
    Success,
    RateLimited { retry_after: Option<Duration> },
    QuotaExhausted,
    Failed { status: u16 },
}

impl UpstreamVerdict {
    /// Classify an upstream status plus its `retry-after` header, if any
    pub fn classify(status: u16, retry_after: Option<&str>) -> Self {
        match status {
            200..=299 => UpstreamVerdict::Success,
            429 => UpstreamVerdict::RateLimited {
                retry_after: retry_after.and_then(parse_retry_after),
            },
            402 => UpstreamVerdict::QuotaExhausted,
            status => UpstreamVerdict::Failed { status },
        }
    }
}

/// Parse a `retry-after` value given in (possibly fractional) seconds
///
/// HTTP-date values and anything non-numeric are ignored.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let seconds: f64 = value.trim().parse().ok()?;
    if seconds.is_finite() && seconds >= 0.0 {
        Some(Duration::from_secs_f64(seconds))
    } else {
        None
    }
}

/// Why a relayed request ended without a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalKind {
    /// Quota failed again after the downgrade
    QuotaExceeded,
    /// Attempt budget exhausted
    RateLimitExhausted,
    /// Upstream returned a status that is never retried
    Upstream { status: u16 },
}

/// Next step for the request loop
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RelayState {
    /// Issue an attempt with the current model
    ///
    /// The loop starts here and returns here after a wait or a downgrade;
    /// [`RelayAttempt::advance`] itself never yields it.
    Attempting,
    /// Sleep, then attempt again
    BackoffWait(Duration),
    /// Switched to the fallback model; attempt again immediately
    Downgraded,
    /// Stream the upstream body back
    Success,
    Terminal(TerminalKind),
}

/// Mutable state for one inbound request
#[derive(Debug, Clone, PartialEq)]
pub struct RelayAttempt {
    /// Model the next attempt will use
    pub model: String,
    pub tried_cheaper_model: bool,
    /// Attempt slots consumed so far
    pub attempt: u32,
}

impl RelayAttempt {
    pub fn new(policy: &RelayPolicy) -> Self {
        Self {
            model: policy.primary_model.clone(),
            tried_cheaper_model: false,
            attempt: 0,
        }
    }

    /// Apply one upstream verdict and decide what happens next
    pub fn advance(&mut self, policy: &RelayPolicy, verdict: UpstreamVerdict) -> RelayState {
        match verdict {
            UpstreamVerdict::Success => RelayState::Success,
            UpstreamVerdict::RateLimited { retry_after } => {
                let delay = policy.backoff_delay(self.attempt, retry_after);
                if self.consume_slot(policy) {
                    RelayState::BackoffWait(delay)
                } else {
                    RelayState::Terminal(TerminalKind::RateLimitExhausted)
                }
            }
            UpstreamVerdict::QuotaExhausted if !self.tried_cheaper_model => {
                self.model = policy.fallback_model.clone();
                self.tried_cheaper_model = true;
                match policy.budget {
                    BudgetMode::Independent => RelayState::Downgraded,
                    BudgetMode::Shared if self.consume_slot(policy) => RelayState::Downgraded,
                    BudgetMode::Shared => RelayState::Terminal(TerminalKind::RateLimitExhausted),
                }
            }
            UpstreamVerdict::QuotaExhausted => RelayState::Terminal(TerminalKind::QuotaExceeded),
            UpstreamVerdict::Failed { status } => {
                RelayState::Terminal(TerminalKind::Upstream { status })
            }
        }
    }

    fn consume_slot(&mut self, policy: &RelayPolicy) -> bool {
        self.attempt += 1;
        self.attempt < policy.max_attempts
    }
}
