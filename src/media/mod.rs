//! Local capture: tracks, quality presets, device backends and the capture manager.

mod capture;
mod devices;
mod hub;
#[cfg(feature = "native-audio")]
mod native;
mod profile;
mod track;

pub use capture::MediaCaptureManager;
pub use devices::{DisplayCapture, LocalStream, MediaDevices, SyntheticDevices};
pub use hub::{AttachmentId, LocalMedia};
#[cfg(feature = "native-audio")]
pub use native::NativeAudioDevices;
pub use profile::QualityProfile;
pub use track::{CaptureSource, LocalTrack, TrackKind};

/// Why camera, microphone or display capture could not be obtained.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MediaAcquisitionError {
    #[error("permission denied for {0}")]
    PermissionDenied(String),
    #[error("no {0} device found")]
    DeviceNotFound(String),
    #[error("capture not supported: {0}")]
    Unsupported(String),
}
