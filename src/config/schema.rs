use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Result, SessionError};
use crate::webrtc::WebRtcConfig;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Remote session and signaling endpoint
    pub session: SessionConfig,
    /// Reconnect policy settings
    pub reconnect: ReconnectConfig,
    /// ICE servers
    pub webrtc: WebRtcConfig,
}

impl AppConfig {
    /// Check the configuration is usable for a controller
    pub fn validate(&self) -> Result<()> {
        if self.session.session_id.trim().is_empty() {
            return Err(SessionError::Config("session_id must not be empty".into()));
        }
        if self.session.keepalive_interval_secs == 0 {
            return Err(SessionError::Config(
                "keepalive_interval_secs must be greater than 0".into(),
            ));
        }
        if self.reconnect.max_attempts == 0 {
            return Err(SessionError::Config(
                "reconnect.max_attempts must be at least 1".into(),
            ));
        }
        if self.reconnect.base_delay_ms == 0 {
            return Err(SessionError::Config(
                "reconnect.base_delay_ms must be greater than 0".into(),
            ));
        }
        self.session.signaling_url()?;
        Ok(())
    }
}

/// Session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Base server address (http, https, ws or wss)
    pub server_url: String,
    /// Remote rendering session to join
    pub session_id: String,
    /// Path of the signaling endpoint on the server
    pub signaling_path: String,
    /// Ping interval while the signaling channel is open
    pub keepalive_interval_secs: u64,
    /// Start keepalive automatically whenever signaling opens
    pub auto_keepalive: bool,
    /// Only adopt a data channel with this label for input (any label if unset)
    pub input_channel_label: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080".to_string(),
            session_id: String::new(),
            signaling_path: "/ws/signaling".to_string(),
            keepalive_interval_secs: 30,
            auto_keepalive: true,
            input_channel_label: None,
        }
    }
}

impl SessionConfig {
    /// Signaling endpoint derived from the base server address
    ///
    /// `http` becomes `ws` and `https` becomes `wss`; the path is replaced by
    /// `signaling_path`.
    pub fn signaling_url(&self) -> Result<String> {
        let mut url = Url::parse(&self.server_url).map_err(|e| {
            SessionError::Config(format!("Invalid server_url '{}': {}", self.server_url, e))
        })?;

        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(SessionError::Config(format!(
                    "Unsupported server_url scheme '{}'",
                    other
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| SessionError::Config(format!("Cannot use scheme '{}'", scheme)))?;

        let path = if self.signaling_path.starts_with('/') {
            self.signaling_path.clone()
        } else {
            format!("/{}", self.signaling_path)
        };
        url.set_path(&path);
        url.set_query(None);
        url.set_fragment(None);

        Ok(url.to_string())
    }
}

/// Reconnect policy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Reconnect attempts before giving up
    pub max_attempts: u32,
    /// Delay unit; attempt `n` waits `n * base_delay_ms`
    pub base_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1000,
        }
    }
}
