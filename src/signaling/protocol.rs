//! Signaling wire types
//!
//! One JSON object per message, discriminated by `type`:
//!
//! ```text
//! {"type":"join","session_id":"abc"}
//! {"type":"offer","offer":{"sdp":"v=0...","type":"offer"}}
//! {"type":"answer","answer":{"sdp":"v=0...","type":"answer"}}
//! {"type":"ice-candidate","candidate":{"candidate":"...","sdpMid":"0","sdpMLineIndex":0}}
//! {"type":"ready"} {"type":"error","message":"..."} {"type":"ping"} {"type":"pong"}
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};

/// Signaling message types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingMessage {
    /// Client announces which remote session it wants
    Join { session_id: String },
    /// SDP offer from the server
    Offer { offer: SessionDescription },
    /// SDP answer from the client
    Answer { answer: SessionDescription },
    /// Trickled ICE candidate, either direction
    IceCandidate { candidate: IceCandidate },
    /// Server side of the session is ready
    Ready,
    /// Server reported an error
    Error { message: String },
    Ping,
    Pong,
}

impl SignalingMessage {
    pub fn join(session_id: impl Into<String>) -> Self {
        Self::Join {
            session_id: session_id.into(),
        }
    }

    /// Message type name as it appears on the wire
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::Ready => "ready",
            Self::Error { .. } => "error",
            Self::Ping => "ping",
            Self::Pong => "pong",
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode one inbound text frame
    ///
    /// An `offer` whose body does not decode is a `Negotiation` error: the
    /// session cannot proceed without it. Anything else that fails to decode
    /// is a `Protocol` error.
    pub fn decode(text: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(text).map_err(|e| {
            SessionError::Protocol(format!("Malformed signaling message: {}", e))
        })?;
        let is_offer = value.get("type").and_then(|t| t.as_str()) == Some("offer");

        serde_json::from_value(value).map_err(|e| {
            if is_offer {
                SessionError::Negotiation(format!("Malformed offer: {}", e))
            } else {
                SessionError::Protocol(format!("Malformed signaling message: {}", e))
            }
        })
    }
}

/// SDP session description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// SDP content
    pub sdp: String,
    /// "offer" or "answer"
    #[serde(rename = "type", default)]
    pub sdp_type: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            sdp_type: "offer".to_string(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            sdp_type: "answer".to_string(),
        }
    }
}

/// ICE candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate string
    pub candidate: String,
    /// SDP mid (media ID)
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    /// SDP mline index
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    /// Username fragment
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }

    pub fn with_mid(mut self, mid: impl Into<String>, index: u16) -> Self {
        self.sdp_mid = Some(mid.into());
        self.sdp_mline_index = Some(index);
        self
    }
}
