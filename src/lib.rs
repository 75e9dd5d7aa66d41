//! session-link - transport controller for remotely rendered browser sessions
//!
//! Connects to a rendering server over WebSocket signaling, answers its WebRTC
//! offer, feeds inbound media into a caller-supplied sink and relays user
//! input back over the peer data channel. Dropped connections are rebuilt
//! with a bounded linear backoff.

pub mod config;
pub mod error;
pub mod events;
pub mod input;
pub mod session;
pub mod signaling;
pub mod utils;
pub mod webrtc;

pub use error::{Result, SessionError};
pub use session::{create_session_controller, ConnectionState, SessionController};
