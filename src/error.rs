use thiserror::Error;

/// Crate-wide error type
#[derive(Error, Debug)]
pub enum SessionError {
    /// Signaling channel failed to open or closed unexpectedly
    #[error("Transport error: {0}")]
    Transport(String),

    /// Description/answer creation failed, or the remote sent a malformed offer
    #[error("Negotiation error: {0}")]
    Negotiation(String),

    /// Unrecognized or malformed inbound message
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Reconnect gave up after {attempts} attempts")]
    ExhaustedRetries { attempts: u32 },

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("WebRTC error: {0}")]
    WebRtc(String),
}

/// Failure classes the controller reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Negotiation,
    Protocol,
    ExhaustedRetries,
    Other,
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Transport(_) => ErrorKind::Transport,
            SessionError::Negotiation(_) => ErrorKind::Negotiation,
            SessionError::Protocol(_) | SessionError::Serialization(_) => ErrorKind::Protocol,
            SessionError::ExhaustedRetries { .. } => ErrorKind::ExhaustedRetries,
            _ => ErrorKind::Other,
        }
    }

    /// Whether this failure counts toward the reconnect budget
    pub fn triggers_reconnect(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transport | ErrorKind::Negotiation)
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, SessionError>;
