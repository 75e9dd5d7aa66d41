//! Inbound media tracks and the caller-owned media sink

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_remote::TrackRemote;

/// Media kind of an inbound track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
    Unknown,
}

impl From<RTPCodecType> for MediaKind {
    fn from(kind: RTPCodecType) -> Self {
        match kind {
            RTPCodecType::Audio => MediaKind::Audio,
            RTPCodecType::Video => MediaKind::Video,
            _ => MediaKind::Unknown,
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
            MediaKind::Unknown => write!(f, "unknown"),
        }
    }
}

/// Inbound track handed to the media sink
#[derive(Clone)]
pub struct RemoteTrack {
    /// Track ID
    pub id: String,
    /// Stream ID
    pub stream_id: String,
    pub kind: MediaKind,
    /// Underlying RTP track; absent for non-webrtc backends
    pub handle: Option<Arc<TrackRemote>>,
}

impl RemoteTrack {
    pub fn new(id: impl Into<String>, stream_id: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            id: id.into(),
            stream_id: stream_id.into(),
            kind,
            handle: None,
        }
    }

    pub fn from_remote(track: Arc<TrackRemote>) -> Self {
        Self {
            id: track.id(),
            stream_id: track.stream_id(),
            kind: track.kind().into(),
            handle: Some(track),
        }
    }
}

impl std::fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Video/display sink supplied by the caller
///
/// The controller only ever writes tracks into the sink; the sink itself stays
/// owned by the caller across reconnects.
pub trait MediaSink: Send + Sync {
    fn attach_track(&self, track: RemoteTrack);
}

/// Sink that drains RTP and logs packet counts
///
/// Used by the CLI, which has no display surface.
#[derive(Default)]
pub struct LoggingSink {
    packets: Arc<AtomicU64>,
}

impl LoggingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total RTP packets read across all attached tracks
    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }
}

impl MediaSink for LoggingSink {
    fn attach_track(&self, track: RemoteTrack) {
        info!(
            "Media track attached: {} {} (stream {})",
            track.kind, track.id, track.stream_id
        );

        let RemoteTrack { id, handle, .. } = track;
        let Some(remote) = handle else {
            return;
        };
        let packets = self.packets.clone();
        tokio::spawn(async move {
            while let Ok((packet, _)) = remote.read_rtp().await {
                let count = packets.fetch_add(1, Ordering::Relaxed) + 1;
                if count % 1000 == 0 {
                    debug!(
                        "Received {} RTP packets (last ssrc {})",
                        count, packet.header.ssrc
                    );
                }
            }
            debug!("Media track {} ended", id);
        });
    }
}
