//! Peer connection backends
//!
//! [`PeerBackend`] is the negotiation capability the controller consumes;
//! [`RtcPeerFactory`] provides it on top of webrtc-rs. Callback-style
//! notifications from the connection are funneled into one [`PeerEventSink`].

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

use super::config::WebRtcConfig;
use super::track::RemoteTrack;
use crate::error::{Result, SessionError};
use crate::input::DataChannelTransport;
use crate::signaling::{IceCandidate, SessionDescription};

/// Underlying peer connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl std::fmt::Display for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerState::Connecting => write!(f, "connecting"),
            PeerState::Connected => write!(f, "connected"),
            PeerState::Disconnected => write!(f, "disconnected"),
            PeerState::Failed => write!(f, "failed"),
            PeerState::Closed => write!(f, "closed"),
        }
    }
}

/// Notification from a peer connection
pub enum PeerEvent {
    /// Locally gathered candidate, to be trickled to the server
    LocalCandidate(IceCandidate),
    /// Inbound media track
    Track(RemoteTrack),
    /// A data channel reached the open state
    DataChannelOpen(Arc<dyn DataChannelTransport>),
    StateChanged(PeerState),
}

impl std::fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerEvent::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
            PeerEvent::Track(t) => f.debug_tuple("Track").field(t).finish(),
            PeerEvent::DataChannelOpen(dc) => {
                f.debug_tuple("DataChannelOpen").field(&dc.label()).finish()
            }
            PeerEvent::StateChanged(s) => f.debug_tuple("StateChanged").field(s).finish(),
        }
    }
}

pub type PeerEventSink = Arc<dyn Fn(PeerEvent) + Send + Sync>;

/// Offer/answer/ICE capability of one peer connection
#[async_trait]
pub trait PeerBackend: Send + Sync {
    async fn set_remote_description(&self, offer: SessionDescription) -> Result<()>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, answer: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Creates peer connections
#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(
        &self,
        config: &WebRtcConfig,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerBackend>>;
}

/// webrtc-rs peer factory
#[derive(Debug, Default, Clone)]
pub struct RtcPeerFactory;

#[async_trait]
impl PeerFactory for RtcPeerFactory {
    async fn create(
        &self,
        config: &WebRtcConfig,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerBackend>> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| SessionError::WebRtc(format!("Failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(|e| {
            SessionError::WebRtc(format!("Failed to register interceptors: {}", e))
        })?;

        let api = APIBuilder::new()
            .with_setting_engine(SettingEngine::default())
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: ice_servers(config),
            ..Default::default()
        };

        let pc = api.new_peer_connection(rtc_config).await.map_err(|e| {
            SessionError::WebRtc(format!("Failed to create peer connection: {}", e))
        })?;

        let peer = RtcPeer { pc: Arc::new(pc) };
        peer.register_handlers(events);
        debug!("Peer connection created");

        Ok(Arc::new(peer))
    }
}

fn ice_servers(config: &WebRtcConfig) -> Vec<RTCIceServer> {
    let mut servers = vec![];

    for stun_url in &config.stun_servers {
        servers.push(RTCIceServer {
            urls: vec![stun_url.clone()],
            ..Default::default()
        });
    }

    for turn in &config.turn_servers {
        servers.push(RTCIceServer {
            urls: turn.urls.clone(),
            username: turn.username.clone(),
            credential: turn.credential.clone(),
            ..Default::default()
        });
    }

    servers
}

struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
}

impl RtcPeer {
    fn register_handlers(&self, events: PeerEventSink) {
        let sink = events.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                let state = match s {
                    RTCPeerConnectionState::Connecting => Some(PeerState::Connecting),
                    RTCPeerConnectionState::Connected => Some(PeerState::Connected),
                    RTCPeerConnectionState::Disconnected => Some(PeerState::Disconnected),
                    RTCPeerConnectionState::Failed => Some(PeerState::Failed),
                    RTCPeerConnectionState::Closed => Some(PeerState::Closed),
                    _ => None,
                };
                if let Some(state) = state {
                    debug!("Peer connection state: {}", state);
                    sink(PeerEvent::StateChanged(state));
                }
                Box::pin(async {})
            }));

        let sink = events.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                if let Some(c) = candidate {
                    match c.to_json() {
                        Ok(init) => sink(PeerEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        })),
                        Err(e) => warn!("Failed to serialize local ICE candidate: {}", e),
                    }
                }
                Box::pin(async {})
            }));

        let sink = events.clone();
        self.pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                sink(PeerEvent::Track(RemoteTrack::from_remote(track)));
                Box::pin(async {})
            },
        ));

        self.pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let sink = events.clone();
                Box::pin(async move {
                    info!("Data channel announced: {}", dc.label());
                    let channel: Arc<dyn DataChannelTransport> =
                        Arc::new(RtcDataChannel { dc: dc.clone() });

                    if dc.ready_state() == RTCDataChannelState::Open {
                        sink(PeerEvent::DataChannelOpen(channel));
                    } else {
                        dc.on_open(Box::new(move || {
                            sink(PeerEvent::DataChannelOpen(channel));
                            Box::pin(async {})
                        }));
                    }
                })
            }));
    }
}

#[async_trait]
impl PeerBackend for RtcPeer {
    async fn set_remote_description(&self, offer: SessionDescription) -> Result<()> {
        let sdp = RTCSessionDescription::offer(offer.sdp)
            .map_err(|e| SessionError::Negotiation(format!("Invalid SDP offer: {}", e)))?;

        self.pc.set_remote_description(sdp).await.map_err(|e| {
            SessionError::Negotiation(format!("Failed to set remote description: {}", e))
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| SessionError::Negotiation(format!("Failed to create answer: {}", e)))?;

        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, answer: SessionDescription) -> Result<()> {
        let sdp = RTCSessionDescription::answer(answer.sdp)
            .map_err(|e| SessionError::Negotiation(format!("Invalid SDP answer: {}", e)))?;

        self.pc.set_local_description(sdp).await.map_err(|e| {
            SessionError::Negotiation(format!("Failed to set local description: {}", e))
        })
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };

        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| SessionError::WebRtc(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn close(&self) -> Result<()> {
        self.pc
            .close()
            .await
            .map_err(|e| SessionError::WebRtc(format!("Failed to close peer connection: {}", e)))
    }
}

struct RtcDataChannel {
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannelTransport for RtcDataChannel {
    fn label(&self) -> String {
        self.dc.label().to_string()
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: String) -> Result<()> {
        self.dc
            .send_text(text)
            .await
            .map(|_| ())
            .map_err(|e| SessionError::ChannelClosed(format!("Data channel send failed: {}", e)))
    }

    async fn close(&self) -> Result<()> {
        self.dc
            .close()
            .await
            .map_err(|e| SessionError::WebRtc(format!("Failed to close data channel: {}", e)))
    }
}
