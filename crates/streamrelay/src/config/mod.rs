use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use url::Url;

use crate::error::{RelayError, Result};

/// Main configuration structure for streamrelay
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Relay server configuration
    #[serde(default)]
    pub proxy: ProxyConfig,
    /// Upstream completion API configuration
    #[serde(default)]
    pub upstream: UpstreamConfig,
    /// Conversation client configuration
    #[serde(default)]
    pub client: ClientConfig,
}

impl Config {
    /// Load configuration from an explicit path or the default search locations
    ///
    /// Search order when no path is given: `~/.streamrelay/config.toml`,
    /// `<config_dir>/streamrelay/config.toml`, `./config.toml`. Falls back to
    /// defaults when none exist.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = config_path {
            tracing::info!("Loading config from: {}", path.display());
            return Self::from_file(path);
        }

        let default_paths = [
            dirs::home_dir().map(|h| h.join(".streamrelay").join("config.toml")),
            dirs::config_dir().map(|c| c.join("streamrelay").join("config.toml")),
            Some(PathBuf::from("config.toml")),
        ];

        for path in default_paths.iter().flatten() {
            if path.exists() {
                tracing::info!("Loading config from: {}", path.display());
                return Self::from_file(path);
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Config::default())
    }

    fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RelayError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| RelayError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check URLs and numeric limits
    pub fn validate(&self) -> Result<()> {
        parse_http_url("upstream.url", &self.upstream.url)?;
        parse_http_url("client.relay_url", &self.client.relay_url)?;

        if self.proxy.max_attempts == 0 {
            return Err(RelayError::Config(
                "proxy.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.client.max_attempts == 0 {
            return Err(RelayError::Config(
                "client.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parse a URL field, accepting only http and https
pub fn parse_http_url(field: &str, value: &str) -> Result<Url> {
    let url = Url::parse(value)
        .map_err(|e| RelayError::Config(format!("Invalid {field} '{value}': {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(RelayError::Config(format!(
            "Unsupported scheme '{scheme}' in {field}: only http and https are allowed"
        ))),
    }
}

/// How quota downgrades and rate-limit retries share the attempt budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BudgetMode {
    /// One counter covers both retry reasons
    #[default]
    Shared,
    /// The single downgrade retry does not consume an attempt slot
    Independent,
}

/// HTTP relay server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Address to listen on (e.g., "127.0.0.1:8787")
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Upstream request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Maximum upstream attempts per inbound request
    #[serde(default = "default_proxy_max_attempts")]
    pub max_attempts: u32,
    /// Linear backoff step for rate-limited attempts, in milliseconds
    #[serde(default = "default_backoff_step_ms")]
    pub backoff_step_ms: u64,
    /// Attempt budget sharing between downgrade and rate-limit retries
    #[serde(default)]
    pub budget: BudgetMode,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            timeout_secs: default_timeout_secs(),
            max_attempts: default_proxy_max_attempts(),
            backoff_step_ms: default_backoff_step_ms(),
            budget: BudgetMode::default(),
        }
    }
}

fn default_listen_addr() -> String {
    "127.0.0.1:8787".to_string()
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_proxy_max_attempts() -> u32 {
    3
}

fn default_backoff_step_ms() -> u64 {
    800
}

/// Upstream streaming completions API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Streaming chat-completions endpoint
    #[serde(default = "default_upstream_url")]
    pub url: String,
    /// Inline credential (takes precedence over `api_key_env`)
    #[serde(default)]
    pub api_key: Option<String>,
    /// Environment variable holding the credential
    #[serde(default = "default_upstream_api_key_env")]
    pub api_key_env: String,
    /// Model used for the first attempt
    #[serde(default = "default_primary_model")]
    pub primary_model: String,
    /// Cheaper model used once after a quota failure
    #[serde(default = "default_fallback_model")]
    pub fallback_model: String,
    /// System instruction prepended to every relayed conversation
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: default_upstream_url(),
            api_key: None,
            api_key_env: default_upstream_api_key_env(),
            primary_model: default_primary_model(),
            fallback_model: default_fallback_model(),
            system_prompt: default_system_prompt(),
        }
    }
}

impl UpstreamConfig {
    /// Resolve the upstream credential from config or environment
    pub fn resolve_api_key(&self) -> Result<String> {
        resolve_key(self.api_key.as_deref(), &self.api_key_env).ok_or_else(|| {
            RelayError::Config(format!(
                "Upstream API key not configured: set upstream.api_key or the '{}' env var",
                self.api_key_env
            ))
        })
    }
}

fn default_upstream_url() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}

fn default_upstream_api_key_env() -> String {
    "STREAMRELAY_UPSTREAM_KEY".to_string()
}

fn default_primary_model() -> String {
    "gpt-4o".to_string()
}

fn default_fallback_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_system_prompt() -> String {
    "You are a helpful assistant. Answer clearly and concisely.".to_string()
}

/// Conversation client configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Relay endpoint the client posts conversations to
    #[serde(default = "default_relay_url")]
    pub relay_url: String,
    /// Inline client-facing credential
    #[serde(default)]
    pub api_key: Option<String>,
    /// Environment variable holding the client-facing credential
    #[serde(default = "default_client_api_key_env")]
    pub api_key_env: String,
    /// Maximum attempts per utterance
    #[serde(default = "default_client_max_attempts")]
    pub max_attempts: u32,
    /// Backoff step after a rate-limited response, in milliseconds
    #[serde(default = "default_rate_limit_backoff_ms")]
    pub rate_limit_backoff_ms: u64,
    /// Backoff step after a transport failure, in milliseconds
    #[serde(default = "default_failure_backoff_ms")]
    pub failure_backoff_ms: u64,
    /// Give the auxiliary conversation the same retry policy as the primary one
    #[serde(default = "default_auxiliary_retries")]
    pub auxiliary_retries: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: default_relay_url(),
            api_key: None,
            api_key_env: default_client_api_key_env(),
            max_attempts: default_client_max_attempts(),
            rate_limit_backoff_ms: default_rate_limit_backoff_ms(),
            failure_backoff_ms: default_failure_backoff_ms(),
            auxiliary_retries: default_auxiliary_retries(),
        }
    }
}

impl ClientConfig {
    /// Client credential, if any. The relay accepts unauthenticated calls.
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_key(self.api_key.as_deref(), &self.api_key_env)
    }
}

fn default_relay_url() -> String {
    "http://127.0.0.1:8787/chat".to_string()
}

fn default_client_api_key_env() -> String {
    "STREAMRELAY_CLIENT_KEY".to_string()
}

fn default_client_max_attempts() -> u32 {
    3
}

fn default_rate_limit_backoff_ms() -> u64 {
    700
}

fn default_failure_backoff_ms() -> u64 {
    500
}

fn default_auxiliary_retries() -> bool {
    true
}

fn resolve_key(inline: Option<&str>, env_name: &str) -> Option<String> {
    inline
        .map(str::to_string)
        .or_else(|| env::var(env_name).ok())
        .filter(|k| !k.trim().is_empty())
}
