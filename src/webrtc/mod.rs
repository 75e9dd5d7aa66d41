//! Peer connection layer
//!
//! ```text
//! server offer ──> PeerSession ──> PeerBackend (webrtc-rs)
//!                      │                 │
//!                      │                 ├── inbound tracks ──> MediaSink
//!                      │                 ├── data channel ───> InputChannel
//!                      └── answer / local candidates ──> signaling
//! ```

pub mod backend;
pub mod config;
pub mod peer;
pub mod track;

pub use backend::{PeerBackend, PeerEvent, PeerEventSink, PeerFactory, PeerState, RtcPeerFactory};
pub use config::{TurnServer, WebRtcConfig};
pub use peer::{NegotiationPhase, PeerSession};
pub use track::{LoggingSink, MediaKind, MediaSink, RemoteTrack};
