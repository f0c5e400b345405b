use super::QualityProfile;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

const STREAM_ID: &str = "mesh-call";
const OPUS_CLOCK_RATE: u32 = 48_000;
const VIDEO_CLOCK_RATE: u32 = 90_000;

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

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaptureSource {
    Microphone,
    Camera,
    Screen,
}

impl CaptureSource {
    pub fn kind(self) -> TrackKind {
        match self {
            CaptureSource::Microphone => TrackKind::Audio,
            CaptureSource::Camera | CaptureSource::Screen => TrackKind::Video,
        }
    }

    fn label(self) -> &'static str {
        match self {
            CaptureSource::Microphone => "mic",
            CaptureSource::Camera => "cam",
            CaptureSource::Screen => "screen",
        }
    }
}

struct TrackInner {
    id: String,
    source: CaptureSource,
    enabled: AtomicBool,
    live: AtomicBool,
    rtp: Arc<TrackLocalStaticSample>,
}

/// Handle to one captured outgoing track. Clones share state.
#[derive(Clone)]
pub struct LocalTrack {
    inner: Arc<TrackInner>,
}

impl LocalTrack {
    pub fn new(source: CaptureSource, profile: &QualityProfile) -> Self {
        let id = format!("{}-{:08x}", source.label(), rand::random::<u32>());
        let codec = match source.kind() {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: OPUS_CLOCK_RATE,
                channels: profile.audio_channels,
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: VIDEO_CLOCK_RATE,
                ..Default::default()
            },
        };
        let rtp = Arc::new(TrackLocalStaticSample::new(codec, id.clone(), STREAM_ID.to_owned()));

        Self {
            inner: Arc::new(TrackInner {
                id,
                source,
                enabled: AtomicBool::new(true),
                live: AtomicBool::new(true),
                rtp,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.source.kind()
    }

    pub fn source(&self) -> CaptureSource {
        self.inner.source
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Muting keeps the sender in place; the track just stops producing media.
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        self.inner.live.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.inner.live.store(false, Ordering::SeqCst);
    }

    pub fn rtp(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.inner.rtp)
    }
}

impl PartialEq for LocalTrack {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.inner.id)
            .field("source", &self.inner.source)
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_identity_and_flags() {
        let profile = QualityProfile::standard();
        let cam = LocalTrack::new(CaptureSource::Camera, &profile);
        let screen = LocalTrack::new(CaptureSource::Screen, &profile);

        assert_eq!(cam.kind(), TrackKind::Video);
        assert_eq!(screen.kind(), TrackKind::Video);
        assert_ne!(cam, screen);
        assert_eq!(cam, cam.clone());
        assert!(cam.id().starts_with("cam-"));

        let shared = cam.clone();
        shared.set_enabled(false);
        assert!(!cam.is_enabled());
        cam.stop();
        assert!(!shared.is_live());
    }

    #[test]
    fn test_rtp_track_matches_kind() {
        use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
        use webrtc::track::track_local::TrackLocal;

        let profile = QualityProfile::standard();
        let mic = LocalTrack::new(CaptureSource::Microphone, &profile);
        assert_eq!(mic.kind(), TrackKind::Audio);
        assert_eq!(mic.rtp().kind(), RTPCodecType::Audio);
        assert_eq!(mic.rtp().id(), mic.id());
        assert_eq!(mic.rtp().stream_id(), STREAM_ID);
    }
}
