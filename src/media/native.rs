use super::{DisplayCapture, LocalStream, MediaAcquisitionError, MediaDevices, QualityProfile};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait};
use tracing::info;

/// Checks the host's default microphone with cpal before handing out media
/// from the wrapped backend.
pub struct NativeAudioDevices<D> {
    inner: D,
}

impl<D: MediaDevices> NativeAudioDevices<D> {
    pub fn new(inner: D) -> Self {
        Self { inner }
    }
}

fn probe_microphone(profile_rate: u32) -> Result<(), MediaAcquisitionError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| MediaAcquisitionError::DeviceNotFound("microphone".into()))?;
    let config = device
        .default_input_config()
        .map_err(|e| MediaAcquisitionError::PermissionDenied(format!("microphone: {}", e)))?;
    let name = device.name().unwrap_or_else(|_| "unknown".to_string());

    info!(
        device = %name,
        sample_rate = config.sample_rate().0,
        requested_rate = profile_rate,
        channels = config.channels(),
        format = ?config.sample_format(),
        "microphone available"
    );
    Ok(())
}

#[async_trait]
impl<D: MediaDevices> MediaDevices for NativeAudioDevices<D> {
    async fn user_media(&self, profile: &QualityProfile) -> Result<LocalStream, MediaAcquisitionError> {
        let rate = profile.audio_sample_rate;
        tokio::task::spawn_blocking(move || probe_microphone(rate))
            .await
            .map_err(|e| MediaAcquisitionError::Unsupported(format!("device probe: {}", e)))??;
        self.inner.user_media(profile).await
    }

    async fn display_media(&self, profile: &QualityProfile) -> Result<DisplayCapture, MediaAcquisitionError> {
        self.inner.display_media(profile).await
    }
}
