use super::error::MediaError;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

pub trait MediaTrack: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> TrackKind;
    fn stop(&self);
    fn is_live(&self) -> bool;

    /// The track to attach to a native peer connection, if this track has one.
    fn rtc_track(&self) -> Option<Arc<dyn TrackLocal + Send + Sync>> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

/// Captured local media. Shared read-only between the preview and the peer
/// connection; only the session stops it.
#[derive(Clone)]
pub struct LocalMedia {
    stream_id: String,
    tracks: Vec<Arc<dyn MediaTrack>>,
}

impl LocalMedia {
    pub fn new(stream_id: impl Into<String>, tracks: Vec<Arc<dyn MediaTrack>>) -> Self {
        Self {
            stream_id: stream_id.into(),
            tracks,
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn tracks(&self) -> &[Arc<dyn MediaTrack>] {
        &self.tracks
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            if track.is_live() {
                track.stop();
            }
        }
    }
}

impl fmt::Debug for LocalMedia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalMedia")
            .field("stream_id", &self.stream_id)
            .field(
                "tracks",
                &self
                    .tracks
                    .iter()
                    .map(|t| (t.id().to_string(), t.kind()))
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalMedia, MediaError>;
}

/// Native local tracks with no capture device behind them. Samples are
/// written by whoever owns the track; the session only attaches and stops it.
pub struct SyntheticMedia {
    stream_id: String,
}

impl SyntheticMedia {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
        }
    }
}

impl Default for SyntheticMedia {
    fn default() -> Self {
        Self::new("learntogether")
    }
}

#[async_trait]
impl MediaDevices for SyntheticMedia {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalMedia, MediaError> {
        if !constraints.audio && !constraints.video {
            return Err(MediaError::NoDevice("no audio or video requested".into()));
        }
        let mut tracks: Vec<Arc<dyn MediaTrack>> = Vec::new();
        if constraints.audio {
            tracks.push(Arc::new(RtcLocalTrack::new(
                TrackKind::Audio,
                MIME_TYPE_OPUS,
                &self.stream_id,
            )));
        }
        if constraints.video {
            tracks.push(Arc::new(RtcLocalTrack::new(
                TrackKind::Video,
                MIME_TYPE_VP8,
                &self.stream_id,
            )));
        }
        tracing::debug!(
            target = "call",
            stream = %self.stream_id,
            tracks = tracks.len(),
            "synthetic media acquired"
        );
        Ok(LocalMedia::new(self.stream_id.clone(), tracks))
    }
}

pub struct RtcLocalTrack {
    id: String,
    kind: TrackKind,
    track: Arc<TrackLocalStaticSample>,
    live: AtomicBool,
}

impl RtcLocalTrack {
    fn new(kind: TrackKind, mime_type: &str, stream_id: &str) -> Self {
        let id = format!("{kind}-{}", uuid::Uuid::new_v4());
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            id.clone(),
            stream_id.to_owned(),
        ));
        Self {
            id,
            kind,
            track,
            live: AtomicBool::new(true),
        }
    }
}

impl MediaTrack for RtcLocalTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn rtc_track(&self) -> Option<Arc<dyn TrackLocal + Send + Sync>> {
        if !self.is_live() {
            return None;
        }
        Some(Arc::clone(&self.track) as Arc<dyn TrackLocal + Send + Sync>)
    }
}
