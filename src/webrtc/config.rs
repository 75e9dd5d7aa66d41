//! ICE server settings for the client peer connection

use serde::{Deserialize, Serialize};

/// Fallback STUN server
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// ICE servers offered to the peer connection
///
/// ```toml
/// [webrtc]
/// stun_servers = ["stun:stun.example.com:3478"]
///
/// [[webrtc.turn_servers]]
/// urls = ["turn:turn.example.com:3478?transport=udp"]
/// username = "user"
/// credential = "secret"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    /// `stun:` URLs, one ICE server each
    pub stun_servers: Vec<String>,
    /// Relays, used when no direct path is found
    pub turn_servers: Vec<TurnServer>,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            turn_servers: vec![],
        }
    }
}

/// One TURN relay and its long-term credentials
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnServer {
    /// Every transport variant of the same relay
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

impl TurnServer {
    /// Relay reachable at a single URL
    pub fn new(url: String, username: String, credential: String) -> Self {
        Self {
            urls: vec![url],
            username,
            credential,
        }
    }
}
