use crate::channel::ReconnectPolicy;
use crate::monitor::DEFAULT_HISTORY_CAPACITY;
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const DEFAULT_API_URL: &str = "http://127.0.0.1:8000/";
pub const DEFAULT_WS_URL: &str = "ws://127.0.0.1:8001/ws";
pub const DEFAULT_SAVE_DEBOUNCE: Duration = Duration::from_millis(2000);
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(25);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{key}: invalid url {value:?}: {reason}")]
    InvalidUrl {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("{key}: expected a non-negative integer, got {value:?}")]
    InvalidNumber { key: &'static str, value: String },
    #[error("{key}: must be greater than zero")]
    Zero { key: &'static str },
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_url: Url,
    pub ws_url: Url,
    pub save_debounce: Duration,
    pub refresh_interval: Duration,
    pub history_capacity: usize,
    pub ping_interval: Duration,
    pub reconnect: ReconnectPolicy,
    /// Per-request bound for gateway calls. `None` leaves calls unbounded.
    pub request_timeout: Option<Duration>,
}

impl ClientConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup; blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let api_url = read("WEBDESK_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string());
        let ws_url = read("WEBDESK_WS_URL").unwrap_or_else(|| DEFAULT_WS_URL.to_string());
        let mut config = ClientConfig {
            api_url: parse_url("WEBDESK_API_URL", &api_url)?,
            ws_url: parse_url("WEBDESK_WS_URL", &ws_url)?,
            save_debounce: DEFAULT_SAVE_DEBOUNCE,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            ping_interval: DEFAULT_PING_INTERVAL,
            reconnect: ReconnectPolicy::default(),
            request_timeout: None,
        };

        if let Some(value) = read("WEBDESK_SAVE_DEBOUNCE_MS") {
            config.save_debounce =
                Duration::from_millis(parse_number("WEBDESK_SAVE_DEBOUNCE_MS", &value)?);
        }
        if let Some(value) = read("WEBDESK_REFRESH_SECS") {
            let secs = parse_number("WEBDESK_REFRESH_SECS", &value)?;
            if secs == 0 {
                return Err(ConfigError::Zero {
                    key: "WEBDESK_REFRESH_SECS",
                });
            }
            config.refresh_interval = Duration::from_secs(secs);
        }
        if let Some(value) = read("WEBDESK_HISTORY_CAPACITY") {
            let capacity = parse_number("WEBDESK_HISTORY_CAPACITY", &value)?;
            if capacity == 0 {
                return Err(ConfigError::Zero {
                    key: "WEBDESK_HISTORY_CAPACITY",
                });
            }
            config.history_capacity = capacity as usize;
        }
        if let Some(value) = read("WEBDESK_REQUEST_TIMEOUT_MS") {
            let millis = parse_number("WEBDESK_REQUEST_TIMEOUT_MS", &value)?;
            config.request_timeout = (millis > 0).then(|| Duration::from_millis(millis));
        }
        Ok(config)
    }
}

fn parse_url(key: &'static str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value.trim()).map_err(|err| ConfigError::InvalidUrl {
        key,
        value: value.to_string(),
        reason: err.to_string(),
    })
}

fn parse_number(key: &'static str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|_| ConfigError::InvalidNumber {
            key,
            value: value.to_string(),
        })
}
