//! Tracker configuration.
//!
//! [`TrackerConfig`] carries backend endpoints, deadlines and reconnect
//! tuning. Every field has a default; [`TrackerConfig::from_env`] overrides
//! them from environment variables.

use std::time::Duration;

use crate::backoff::ReconnectConfig;

/// Default ComfyUI HTTP endpoint.
pub const DEFAULT_API_URL: &str = "http://127.0.0.1:8188";

/// Errors raised while reading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} must be {expected} (got '{value}')")]
    Invalid {
        var: &'static str,
        value: String,
        expected: &'static str,
    },
}

/// Tracker configuration loaded from environment variables.
///
/// All fields have defaults suitable for a local ComfyUI install.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// ComfyUI HTTP base URL.
    pub api_url: String,
    /// ComfyUI WebSocket base URL.
    pub ws_url: String,
    /// Default deadline for [`await_result`](crate::tracker::JobTracker::await_result).
    pub generation_timeout: Duration,
    /// Pause between the completion event and the history fetch, giving
    /// the backend time to write its history entry.
    pub history_grace: Duration,
    /// How long terminal jobs are kept before the sweeper evicts them.
    pub job_retention: Duration,
    pub reconnect: ReconnectConfig,
}

impl TrackerConfig {
    /// Defaults for a backend at `api_url`, with the WebSocket URL derived.
    pub fn new(api_url: impl Into<String>) -> Self {
        let api_url = api_url.into().trim_end_matches('/').to_string();
        Self {
            ws_url: derive_ws_url(&api_url),
            api_url,
            generation_timeout: Duration::from_secs(600),
            history_grace: Duration::from_millis(500),
            job_retention: Duration::from_secs(3600),
            reconnect: ReconnectConfig::default(),
        }
    }

    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                      | Default                    |
    /// |------------------------------|----------------------------|
    /// | `COMFYUI_API_URL`            | `http://127.0.0.1:8188`    |
    /// | `COMFYUI_WS_URL`             | API URL with `http`->`ws`  |
    /// | `GENERATION_TIMEOUT_SECS`    | `600`                      |
    /// | `HISTORY_GRACE_MS`           | `500`                      |
    /// | `JOB_RETENTION_SECS`         | `3600`                     |
    /// | `RECONNECT_INITIAL_DELAY_MS` | `1000`                     |
    /// | `RECONNECT_MAX_DELAY_SECS`   | `30`                       |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`from_env`](Self::from_env) over an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let api_url = lookup("COMFYUI_API_URL").unwrap_or_else(|| DEFAULT_API_URL.into());
        let mut config = Self::new(api_url);

        if let Some(ws_url) = lookup("COMFYUI_WS_URL") {
            config.ws_url = ws_url.trim_end_matches('/').to_string();
        }
        if let Some(secs) = parse_u64(&lookup, "GENERATION_TIMEOUT_SECS")? {
            config.generation_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = parse_u64(&lookup, "HISTORY_GRACE_MS")? {
            config.history_grace = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_u64(&lookup, "JOB_RETENTION_SECS")? {
            config.job_retention = Duration::from_secs(secs);
        }
        if let Some(ms) = parse_u64(&lookup, "RECONNECT_INITIAL_DELAY_MS")? {
            config.reconnect.initial_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_u64(&lookup, "RECONNECT_MAX_DELAY_SECS")? {
            config.reconnect.max_delay = Duration::from_secs(secs);
        }

        Ok(config)
    }
}

fn parse_u64(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<u64>, ConfigError> {
    lookup(var)
        .map(|value| {
            value.trim().parse().map_err(|_| ConfigError::Invalid {
                var,
                value,
                expected: "a non-negative integer",
            })
        })
        .transpose()
}

/// `http://host` -> `ws://host`, `https://host` -> `wss://host`.
pub fn derive_ws_url(api_url: &str) -> String {
    let api_url = api_url.trim_end_matches('/');
    if let Some(rest) = api_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = api_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        format!("ws://{api_url}")
    }
}
