//! Peer session: one negotiation cycle and the channels it produces

use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::backend::{PeerBackend, PeerEventSink, PeerFactory};
use super::config::WebRtcConfig;
use crate::error::{Result, SessionError};
use crate::input::DataChannelTransport;
use crate::signaling::{IceCandidate, SessionDescription};

/// Where the session is in its single offer/answer exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    /// No offer received yet
    AwaitingOffer,
    /// Offer accepted, answer not yet sent
    Negotiating,
    /// Answer sent; remote candidates are applied directly
    Complete,
    /// Negotiation failed; the session must be rebuilt
    Failed,
}

/// One peer connection and its negotiation state
///
/// Negotiation happens in two halves so the controller can send the answer in
/// between: [`PeerSession::accept_offer`] yields the future that installs the
/// remote description and builds the local answer, and
/// [`PeerSession::complete_negotiation`] runs once the answer is on the wire.
/// Remote candidates arriving before completion are queued and flushed in
/// arrival order.
pub struct PeerSession {
    backend: Arc<dyn PeerBackend>,
    phase: NegotiationPhase,
    pending_candidates: Vec<IceCandidate>,
    data_channel: Option<Arc<dyn DataChannelTransport>>,
    closed: bool,
}

impl PeerSession {
    pub async fn new(
        factory: &dyn PeerFactory,
        config: &WebRtcConfig,
        events: PeerEventSink,
    ) -> Result<Self> {
        let backend = factory.create(config, events).await?;
        Ok(Self::with_backend(backend))
    }

    pub fn with_backend(backend: Arc<dyn PeerBackend>) -> Self {
        Self {
            backend,
            phase: NegotiationPhase::AwaitingOffer,
            pending_candidates: vec![],
            data_channel: None,
            closed: false,
        }
    }

    pub fn phase(&self) -> NegotiationPhase {
        self.phase
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Start processing `offer`
    ///
    /// Only one offer is accepted per session. The returned future installs
    /// the remote description, creates the answer and installs it locally, in
    /// that order, and yields the answer to send. It does not borrow the
    /// session, so it can run while other events are handled.
    pub fn accept_offer(
        &mut self,
        offer: SessionDescription,
    ) -> Result<impl Future<Output = Result<SessionDescription>> + Send + 'static> {
        if self.closed {
            return Err(SessionError::Negotiation("Peer session is closed".into()));
        }
        if self.phase != NegotiationPhase::AwaitingOffer {
            return Err(SessionError::Protocol(format!(
                "Unexpected offer while {:?}",
                self.phase
            )));
        }
        if !offer.sdp_type.is_empty() && offer.sdp_type != "offer" {
            self.phase = NegotiationPhase::Failed;
            return Err(SessionError::Negotiation(format!(
                "Expected offer description, got '{}'",
                offer.sdp_type
            )));
        }

        self.phase = NegotiationPhase::Negotiating;
        let backend = self.backend.clone();

        Ok(async move {
            backend.set_remote_description(offer).await?;
            let answer = backend.create_answer().await?;
            backend.set_local_description(answer.clone()).await?;
            Ok(answer)
        })
    }

    /// Mark the answer as sent and apply queued candidates in arrival order
    ///
    /// Returns the number of queued candidates applied.
    pub async fn complete_negotiation(&mut self) -> usize {
        if self.phase != NegotiationPhase::Negotiating {
            return 0;
        }
        self.phase = NegotiationPhase::Complete;

        let queued = std::mem::take(&mut self.pending_candidates);
        let mut applied = 0;
        for candidate in queued {
            if self.apply_candidate(candidate).await {
                applied += 1;
            }
        }
        if applied > 0 {
            debug!("Applied {} queued ICE candidates", applied);
        }
        applied
    }

    /// Negotiation did not complete; queued candidates are discarded
    pub fn fail_negotiation(&mut self) {
        self.phase = NegotiationPhase::Failed;
        self.pending_candidates.clear();
    }

    /// Apply a remote candidate now, or queue it until the answer is sent
    pub async fn add_remote_candidate(&mut self, candidate: IceCandidate) {
        match self.phase {
            NegotiationPhase::Complete if !self.closed => {
                self.apply_candidate(candidate).await;
            }
            NegotiationPhase::AwaitingOffer | NegotiationPhase::Negotiating => {
                debug!("Queueing early ICE candidate");
                self.pending_candidates.push(candidate);
            }
            _ => debug!("Dropping ICE candidate for inactive peer session"),
        }
    }

    async fn apply_candidate(&self, candidate: IceCandidate) -> bool {
        match self.backend.add_ice_candidate(candidate).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to apply remote ICE candidate: {}", e);
                false
            }
        }
    }

    /// Remember the data channel so `close()` can release it
    pub fn set_data_channel(&mut self, channel: Arc<dyn DataChannelTransport>) {
        self.data_channel = Some(channel);
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Release the data channel, then the peer connection
    ///
    /// Safe to call more than once; errors are logged, never returned.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.pending_candidates.clear();

        if let Some(channel) = self.data_channel.take() {
            if let Err(e) = channel.close().await {
                debug!("Data channel close: {}", e);
            }
        }

        if let Err(e) = self.backend.close().await {
            warn!("Peer connection close: {}", e);
        }
        info!("Peer session closed");
    }
}
