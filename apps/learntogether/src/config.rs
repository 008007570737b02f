use crate::call::media::MediaConstraints;
use crate::call::relay::websocket_url;
use crate::call::retry::RetryPolicy;
use crate::context::Settings;
use std::env;
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:5000/relay";
pub const DEFAULT_MESSAGE_API_URL: &str = "http://127.0.0.1:5000";
pub const DEFAULT_STUN_URLS: [&str; 3] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServerConfig {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field} {value:?}: {reason}")]
    InvalidUrl {
        field: &'static str,
        value: String,
        reason: String,
    },
}

/// Call and messaging configuration.
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// Relay websocket address
    pub relay_url: String,
    /// REST message API base address
    pub message_api_url: String,
    /// STUN servers; there is no TURN fallback
    pub ice_servers: Vec<IceServerConfig>,
    pub relay_retry: RetryPolicy,
    pub media: MediaConstraints,
}

impl CallConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::load(&Settings::default())
    }

    /// Defaults, overridden by stored settings, overridden by environment
    /// variables.
    pub fn load(settings: &Settings) -> Self {
        let mut defaults = Self::default();
        if let Some(url) = &settings.relay_url {
            defaults.relay_url = url.clone();
        }
        if let Some(url) = &settings.message_api_url {
            defaults.message_api_url = url.clone();
        }
        let relay_url =
            env::var("LEARNTOGETHER_RELAY_URL").unwrap_or_else(|_| defaults.relay_url.clone());
        let message_api_url = env::var("LEARNTOGETHER_MESSAGE_API_URL")
            .unwrap_or_else(|_| defaults.message_api_url.clone());
        let ice_servers = env::var("LEARNTOGETHER_STUN_URLS")
            .map(|value| parse_stun_urls(&value))
            .unwrap_or_else(|_| defaults.ice_servers.clone());

        let mut relay_retry = defaults.relay_retry;
        if let Some(attempts) = env_parse::<u32>("LEARNTOGETHER_RELAY_RETRY_ATTEMPTS") {
            relay_retry.max_attempts = attempts;
        }
        if let Some(base_ms) = env_parse::<u64>("LEARNTOGETHER_RELAY_RETRY_BASE_MS") {
            relay_retry.initial_delay = Duration::from_millis(base_ms);
        }
        if let Some(timeout_ms) = env_parse::<u64>("LEARNTOGETHER_RELAY_CONNECT_TIMEOUT_MS") {
            relay_retry.connect_timeout = Duration::from_millis(timeout_ms);
        }

        Self {
            relay_url,
            message_api_url,
            ice_servers,
            relay_retry,
            ..defaults
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        websocket_url(&self.relay_url).map_err(|err| ConfigError::InvalidUrl {
            field: "relay url",
            value: self.relay_url.clone(),
            reason: err.to_string(),
        })?;
        let api = Url::parse(&self.message_api_url).map_err(|err| ConfigError::InvalidUrl {
            field: "message api url",
            value: self.message_api_url.clone(),
            reason: err.to_string(),
        })?;
        if !matches!(api.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidUrl {
                field: "message api url",
                value: self.message_api_url.clone(),
                reason: "expected http or https".into(),
            });
        }
        Ok(())
    }
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            message_api_url: DEFAULT_MESSAGE_API_URL.to_string(),
            ice_servers: DEFAULT_STUN_URLS
                .iter()
                .map(|url| IceServerConfig::stun(*url))
                .collect(),
            relay_retry: RetryPolicy::default(),
            media: MediaConstraints::default(),
        }
    }
}

/// Comma separated STUN urls. An empty value disables STUN (localhost only).
fn parse_stun_urls(value: &str) -> Vec<IceServerConfig> {
    value
        .split(',')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(IceServerConfig::stun)
        .collect()
}

fn env_parse<T: std::str::FromStr>(var: &str) -> Option<T> {
    let raw = env::var(var).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(variable = var, value = %raw, "ignoring unparsable setting");
            None
        }
    }
}
