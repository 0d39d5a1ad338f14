//! Client configuration loaded from environment variables.
//!
//! Every setting has a default so a local development server can be used
//! without any configuration.

use std::time::Duration;

use m4e_net::notify::derive_notify_url;
use m4e_net::{TransportConfig, Url};
use m4e_shared::constants::{DEFAULT_SERVER_URL, DEFAULT_VOTING_TICK_SECS};
use m4e_shared::types::UserId;
use m4e_shared::ClientError;

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Base URL of the webapp; REST resources live below `<server_url>/rest`.
    /// Env: `M4E_SERVER_URL`
    /// Default: `http://localhost:8080/m4e`
    pub server_url: String,

    /// Websocket endpoint for notifications.
    /// Env: `M4E_NOTIFY_URL`
    /// Default: derived from `server_url` (`ws://<host>/<path>/ws`).
    pub notify_url: Option<String>,

    /// Identity of the signed-in user, used to recognise the session's own
    /// membership and votes.
    /// Env: `M4E_USER_ID`
    pub user_id: UserId,

    /// Per-request timeout and retry policy.
    /// Env: `M4E_TIMEOUT_MS`, `M4E_MAX_RETRIES`
    pub transport: TransportConfig,

    /// How often voting windows are re-evaluated.
    /// Env: `M4E_VOTING_TICK_SECS`
    /// Default: 5 seconds
    pub voting_tick: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            notify_url: None,
            user_id: UserId::new(""),
            transport: TransportConfig::default(),
            voting_tick: Duration::from_secs(DEFAULT_VOTING_TICK_SECS),
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = var("M4E_SERVER_URL") {
            if Url::parse(&url).is_ok() {
                config.server_url = url;
            } else {
                tracing::warn!(value = %url, "Invalid M4E_SERVER_URL, using default");
            }
        }

        if let Some(url) = var("M4E_NOTIFY_URL") {
            if !url.is_empty() {
                config.notify_url = Some(url);
            }
        }

        if let Some(user) = var("M4E_USER_ID") {
            config.user_id = UserId::new(user);
        }

        if let Some(val) = var("M4E_TIMEOUT_MS") {
            match val.parse::<u64>() {
                Ok(ms) if ms > 0 => config.transport.timeout_ms = ms,
                _ => tracing::warn!(value = %val, "Invalid M4E_TIMEOUT_MS, using default"),
            }
        }

        if let Some(val) = var("M4E_MAX_RETRIES") {
            match val.parse::<u32>() {
                Ok(n) => config.transport.max_retries = n,
                Err(_) => tracing::warn!(value = %val, "Invalid M4E_MAX_RETRIES, using default"),
            }
        }

        if let Some(val) = var("M4E_VOTING_TICK_SECS") {
            match val.parse::<u64>() {
                Ok(secs) if secs > 0 => config.voting_tick = Duration::from_secs(secs),
                _ => tracing::warn!(value = %val, "Invalid M4E_VOTING_TICK_SECS, using default"),
            }
        }

        config
    }

    pub fn server_url(&self) -> Result<Url, ClientError> {
        Url::parse(&self.server_url)
            .map_err(|e| ClientError::InvalidRequest(format!("invalid server URL: {e}")))
    }

    pub fn notify_url(&self) -> Result<Url, ClientError> {
        match &self.notify_url {
            Some(url) => Url::parse(url)
                .map_err(|e| ClientError::InvalidRequest(format!("invalid notification URL: {e}"))),
            None => derive_notify_url(&self.server_url()?),
        }
    }
}
