//! Input channel over the peer data channel
//!
//! Input is fire-and-forget. When the data channel is not open the event is
//! dropped with a warning: input queued across a reconnect would be replayed
//! against a remote page that has already moved on.

pub mod types;

pub use types::InputEvent;

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::Result;
use crate::utils::LogThrottler;

/// The data sub-channel of a peer connection
#[async_trait]
pub trait DataChannelTransport: Send + Sync {
    fn label(&self) -> String;

    /// Whether the channel is in the open ready state
    fn is_open(&self) -> bool;

    async fn send_text(&self, text: String) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Input protocol bound to at most one data channel
pub struct InputChannel {
    channel: Option<Arc<dyn DataChannelTransport>>,
    throttler: LogThrottler,
}

impl InputChannel {
    /// Create a detached input channel
    pub fn new() -> Self {
        Self {
            channel: None,
            throttler: LogThrottler::default(),
        }
    }

    pub fn attach(&mut self, channel: Arc<dyn DataChannelTransport>) {
        debug!("Input channel attached to '{}'", channel.label());
        self.channel = Some(channel);
        self.throttler.clear("input-dropped");
    }

    pub fn detach(&mut self) {
        self.channel = None;
    }

    pub fn is_open(&self) -> bool {
        self.channel.as_ref().is_some_and(|c| c.is_open())
    }

    /// Serialize and transmit `event`; returns whether it was transmitted
    pub async fn send(&self, event: &InputEvent) -> bool {
        let channel = match &self.channel {
            Some(channel) if channel.is_open() => channel,
            _ => {
                if self.throttler.should_log("input-dropped") {
                    warn!("Input channel not open, dropping {} event", event.kind());
                }
                return false;
            }
        };

        let text = match event.encode() {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to encode {} event: {}", event.kind(), e);
                return false;
            }
        };

        match channel.send_text(text).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to send {} event: {}", event.kind(), e);
                false
            }
        }
    }
}

impl Default for InputChannel {
    fn default() -> Self {
        Self::new()
    }
}
