//! Signaling transport
//!
//! `SignalingTransport` owns one message-oriented connection to the signaling
//! endpoint. The raw connection comes from a [`SignalingConnector`], which
//! hands back a pair of text channels; the transport decodes inbound frames
//! and forwards them as [`TransportEvent`]s.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::protocol::SignalingMessage;
use crate::error::{Result, SessionError};
use crate::utils::LogThrottler;

/// Event produced by the raw connection
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// One inbound text frame
    Text(String),
    /// Connection ended; carries a reason when one is known
    Closed(Option<String>),
}

/// Raw text channel pair for one signaling connection
pub struct SignalingLink {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<LinkEvent>,
}

/// Opens raw signaling connections
#[async_trait]
pub trait SignalingConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<SignalingLink>;
}

/// WebSocket connector backed by tokio-tungstenite
#[derive(Debug, Default, Clone)]
pub struct WebSocketConnector;

#[async_trait]
impl SignalingConnector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<SignalingLink> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| SessionError::Transport(format!("Failed to connect to {}: {}", url, e)))?;

        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        // Writer: ends (and closes the socket) once every outbound sender is gone
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = ws_tx.send(Message::Text(text)).await {
                    debug!("Signaling write failed: {}", e);
                    break;
                }
            }
            let _ = ws_tx.send(Message::Close(None)).await;
        });

        tokio::spawn(async move {
            let reason = loop {
                match ws_rx.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if in_tx.send(LinkEvent::Text(text)).is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => {
                            if in_tx.send(LinkEvent::Text(text)).is_err() {
                                return;
                            }
                        }
                        Err(_) => warn!("Dropping non-UTF-8 binary signaling frame"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        break frame.map(|f| format!("{} {}", f.code, f.reason));
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => break Some(e.to_string()),
                    None => break None,
                }
            };
            let _ = in_tx.send(LinkEvent::Closed(reason));
        });

        Ok(SignalingLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

/// Decoded transport event
#[derive(Debug)]
pub enum TransportEvent {
    Message(SignalingMessage),
    /// Inbound frame that could not be decoded
    Rejected(SessionError),
    /// Channel closed without a local `close()`
    Closed(SessionError),
}

/// One open signaling channel
pub struct SignalingTransport {
    url: String,
    outbound: Option<mpsc::UnboundedSender<String>>,
    open: Arc<AtomicBool>,
    pump: Option<JoinHandle<()>>,
    throttler: LogThrottler,
}

impl SignalingTransport {
    /// Open a channel to `url`, delivering decoded events to `on_event`
    ///
    /// Inbound payloads that fail to decode are delivered as
    /// [`TransportEvent::Rejected`]; the channel stays open.
    pub async fn open<F>(connector: &dyn SignalingConnector, url: &str, on_event: F) -> Result<Self>
    where
        F: Fn(TransportEvent) + Send + 'static,
    {
        let link = connector.connect(url).await?;
        info!("Signaling channel open: {}", url);

        let open = Arc::new(AtomicBool::new(true));
        let pump = tokio::spawn(pump_inbound(link.inbound, open.clone(), on_event));

        Ok(Self {
            url: url.to_string(),
            outbound: Some(link.outbound),
            open,
            pump: Some(pump),
            throttler: LogThrottler::default(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && self.outbound.is_some()
    }

    /// Send a message; returns whether it was handed to the connection
    ///
    /// Never fails: a closed channel only produces a warning.
    pub fn send(&self, message: &SignalingMessage) -> bool {
        let outbound = match (&self.outbound, self.is_open()) {
            (Some(tx), true) => tx,
            _ => {
                if self.throttler.should_log("signaling-send-closed") {
                    warn!(
                        "Signaling channel not open, dropping '{}' message",
                        message.kind()
                    );
                }
                return false;
            }
        };

        let text = match message.encode() {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to encode '{}' message: {}", message.kind(), e);
                return false;
            }
        };

        if outbound.send(text).is_err() {
            self.open.store(false, Ordering::Release);
            warn!("Signaling connection gone, dropped '{}' message", message.kind());
            return false;
        }

        debug!("Signaling sent: {}", message.kind());
        true
    }

    /// Close the channel; safe to call any number of times
    pub fn close(&mut self) {
        self.open.store(false, Ordering::Release);
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        if self.outbound.take().is_some() {
            info!("Signaling channel closed: {}", self.url);
        }
    }
}

impl Drop for SignalingTransport {
    fn drop(&mut self) {
        self.close();
    }
}

async fn pump_inbound<F>(
    mut inbound: mpsc::UnboundedReceiver<LinkEvent>,
    open: Arc<AtomicBool>,
    on_event: F,
) where
    F: Fn(TransportEvent) + Send + 'static,
{
    let reason = loop {
        match inbound.recv().await {
            Some(LinkEvent::Text(text)) => match SignalingMessage::decode(&text) {
                Ok(message) => on_event(TransportEvent::Message(message)),
                Err(e) => {
                    warn!("Rejected signaling frame: {}", e);
                    on_event(TransportEvent::Rejected(e));
                }
            },
            Some(LinkEvent::Closed(reason)) => break reason,
            None => break None,
        }
    };

    open.store(false, Ordering::Release);
    let detail = reason.unwrap_or_else(|| "connection closed".to_string());
    warn!("Signaling channel closed unexpectedly: {}", detail);
    on_event(TransportEvent::Closed(SessionError::Transport(detail)));
}
