use super::{CaptureSource, LocalTrack, MediaAcquisitionError, QualityProfile};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::oneshot;
use tracing::debug;

/// Camera and microphone captured together.
#[derive(Debug, Clone)]
pub struct LocalStream {
    pub audio: LocalTrack,
    pub video: LocalTrack,
}

impl LocalStream {
    pub fn stop(&self) {
        self.audio.stop();
        self.video.stop();
    }
}

/// A display capture plus the source's out-of-band "capture ended" signal.
#[derive(Debug)]
pub struct DisplayCapture {
    pub track: LocalTrack,
    pub ended: oneshot::Receiver<()>,
}

/// Platform media-capture capability.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn user_media(&self, profile: &QualityProfile) -> Result<LocalStream, MediaAcquisitionError>;

    async fn display_media(&self, profile: &QualityProfile) -> Result<DisplayCapture, MediaAcquisitionError>;
}

/// Device backend that fabricates tracks. Failures can be switched on to
/// exercise the error paths.
#[derive(Default)]
pub struct SyntheticDevices {
    deny_permission: AtomicBool,
    no_camera: AtomicBool,
    no_display: AtomicBool,
    capture_end: Mutex<Option<oneshot::Sender<()>>>,
}

impl SyntheticDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny_permission(&self, deny: bool) {
        self.deny_permission.store(deny, Ordering::SeqCst);
    }

    pub fn remove_camera(&self, removed: bool) {
        self.no_camera.store(removed, Ordering::SeqCst);
    }

    pub fn disable_display_capture(&self, disabled: bool) {
        self.no_display.store(disabled, Ordering::SeqCst);
    }

    /// Fires the "capture ended" signal of the live display capture, as if the
    /// user pressed the platform's stop-sharing button.
    pub fn end_screen_capture(&self) -> bool {
        match self.capture_end.lock().take() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn user_media(&self, profile: &QualityProfile) -> Result<LocalStream, MediaAcquisitionError> {
        if self.deny_permission.load(Ordering::SeqCst) {
            return Err(MediaAcquisitionError::PermissionDenied("camera and microphone".into()));
        }
        if self.no_camera.load(Ordering::SeqCst) {
            return Err(MediaAcquisitionError::DeviceNotFound("camera".into()));
        }
        debug!(profile = %profile.name, width = profile.width, height = profile.height, "synthetic user media");
        Ok(LocalStream {
            audio: LocalTrack::new(CaptureSource::Microphone, profile),
            video: LocalTrack::new(CaptureSource::Camera, profile),
        })
    }

    async fn display_media(&self, profile: &QualityProfile) -> Result<DisplayCapture, MediaAcquisitionError> {
        if self.deny_permission.load(Ordering::SeqCst) {
            return Err(MediaAcquisitionError::PermissionDenied("display".into()));
        }
        if self.no_display.load(Ordering::SeqCst) {
            return Err(MediaAcquisitionError::Unsupported("display capture".into()));
        }
        let (tx, ended) = oneshot::channel();
        *self.capture_end.lock() = Some(tx);
        Ok(DisplayCapture {
            track: LocalTrack::new(CaptureSource::Screen, profile),
            ended,
        })
    }
}
