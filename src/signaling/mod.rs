//! Signaling channel: wire protocol and transport

pub mod protocol;
pub mod transport;

pub use protocol::{IceCandidate, SessionDescription, SignalingMessage};
pub use transport::{
    LinkEvent, SignalingConnector, SignalingLink, SignalingTransport, TransportEvent,
    WebSocketConnector,
};
