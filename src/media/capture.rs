use super::{
    DisplayCapture, LocalMedia, LocalStream, LocalTrack, MediaAcquisitionError, MediaDevices,
    QualityProfile,
};
use crate::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Default)]
struct CapturedTracks {
    microphone: Option<LocalTrack>,
    camera: Option<LocalTrack>,
    screen: Option<LocalTrack>,
}

/// Owns the local capture and decides which video goes out.
///
/// Every outgoing change goes through [`LocalMedia`], which swaps the track
/// on each attached connection's sender in place.
pub struct MediaCaptureManager {
    devices: Arc<dyn MediaDevices>,
    hub: Arc<LocalMedia>,
    tracks: Mutex<CapturedTracks>,
    preview: watch::Sender<Option<LocalTrack>>,
    sharing: watch::Sender<bool>,
    capture_watcher: Mutex<Option<JoinHandle<()>>>,
}

impl MediaCaptureManager {
    pub fn new(devices: Arc<dyn MediaDevices>, hub: Arc<LocalMedia>) -> Arc<Self> {
        let (preview, _) = watch::channel(None);
        let (sharing, _) = watch::channel(false);
        Arc::new(Self {
            devices,
            hub,
            tracks: Mutex::new(CapturedTracks::default()),
            preview,
            sharing,
            capture_watcher: Mutex::new(None),
        })
    }

    pub fn hub(&self) -> &Arc<LocalMedia> {
        &self.hub
    }

    /// The track shown as the local preview.
    pub fn preview(&self) -> watch::Receiver<Option<LocalTrack>> {
        self.preview.subscribe()
    }

    pub fn sharing(&self) -> watch::Receiver<bool> {
        self.sharing.subscribe()
    }

    pub fn is_sharing(&self) -> bool {
        *self.sharing.borrow()
    }

    /// Acquires camera and microphone. Failure is fatal to the session and
    /// is not retried.
    pub async fn acquire_local_media(&self, profile: &QualityProfile) -> Result<LocalStream> {
        let stream = self.devices.user_media(profile).await?;

        let (old_mic, old_cam) = {
            let mut tracks = self.tracks.lock();
            (
                tracks.microphone.replace(stream.audio.clone()),
                tracks.camera.replace(stream.video.clone()),
            )
        };
        for old in old_mic.iter().chain(old_cam.iter()) {
            old.stop();
        }

        self.hub.set_track(stream.audio.clone()).await;
        if !self.is_sharing() {
            self.hub.set_track(stream.video.clone()).await;
            self.preview.send_replace(Some(stream.video.clone()));
        }
        info!(profile = %profile.name, "local media acquired");
        Ok(stream)
    }

    /// Starts display capture and swaps it in as the outgoing video of every
    /// connection. The capture source ending on its own restores the camera.
    pub async fn acquire_screen_capture(self: &Arc<Self>, profile: &QualityProfile) -> Result<LocalTrack> {
        let DisplayCapture { track, ended } = self.devices.display_media(profile).await?;

        let previous = self.tracks.lock().screen.replace(track.clone());
        if let Some(previous) = previous {
            previous.stop();
        }
        let updated = self.hub.set_track(track.clone()).await;
        self.preview.send_replace(Some(track.clone()));
        self.sharing.send_replace(true);
        info!(track = track.id(), links = updated, "screen sharing started");

        let manager = Arc::downgrade(self);
        let watcher = tokio::spawn(async move {
            if ended.await.is_err() {
                return;
            }
            let Some(manager) = manager.upgrade() else {
                return;
            };
            // Detach before restoring so restore_camera does not abort this task.
            manager.capture_watcher.lock().take();
            info!("screen capture ended by source");
            if let Err(e) = manager.restore_camera().await {
                warn!(error = %e, "failed to restore camera after capture ended");
            }
        });
        if let Some(old) = self.capture_watcher.lock().replace(watcher) {
            old.abort();
        }
        Ok(track)
    }

    /// Switches the outgoing video back to the camera. No-op when not sharing.
    pub async fn restore_camera(&self) -> Result<()> {
        if let Some(watcher) = self.capture_watcher.lock().take() {
            watcher.abort();
        }
        let (screen, camera) = {
            let mut tracks = self.tracks.lock();
            (tracks.screen.take(), tracks.camera.clone())
        };
        let Some(screen) = screen else {
            return Ok(());
        };
        screen.stop();

        let Some(camera) = camera else {
            self.sharing.send_replace(false);
            return Err(MediaAcquisitionError::DeviceNotFound("camera".into()).into());
        };
        let updated = self.hub.set_track(camera.clone()).await;
        self.preview.send_replace(Some(camera));
        self.sharing.send_replace(false);
        info!(links = updated, "camera restored");
        Ok(())
    }

    /// Mutes or unmutes the microphone. Returns false without a microphone.
    pub fn set_audio_enabled(&self, enabled: bool) -> bool {
        match &self.tracks.lock().microphone {
            Some(track) => {
                track.set_enabled(enabled);
                true
            }
            None => false,
        }
    }

    /// Turns the camera on or off. Returns false without a camera.
    pub fn set_video_enabled(&self, enabled: bool) -> bool {
        match &self.tracks.lock().camera {
            Some(track) => {
                track.set_enabled(enabled);
                true
            }
            None => false,
        }
    }

    pub fn microphone(&self) -> Option<LocalTrack> {
        self.tracks.lock().microphone.clone()
    }

    pub fn camera(&self) -> Option<LocalTrack> {
        self.tracks.lock().camera.clone()
    }

    /// Stops every local track and the capture-ended watcher.
    pub async fn stop_all(&self) {
        if let Some(watcher) = self.capture_watcher.lock().take() {
            watcher.abort();
        }
        let tracks = std::mem::take(&mut *self.tracks.lock());
        for track in [tracks.microphone, tracks.camera, tracks.screen].into_iter().flatten() {
            track.stop();
        }
        self.hub.clear().await;
        self.preview.send_replace(None);
        self.sharing.send_replace(false);
        info!("local media stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{CaptureSource, SyntheticDevices, TrackKind};
    use crate::testing::FakePeerConnection;
    use crate::Error;
    use std::time::Duration;

    fn manager() -> (Arc<SyntheticDevices>, Arc<MediaCaptureManager>) {
        let devices = Arc::new(SyntheticDevices::new());
        let manager = MediaCaptureManager::new(devices.clone(), Arc::new(LocalMedia::new()));
        (devices, manager)
    }

    #[tokio::test]
    async fn test_permission_denied_is_fatal() {
        let (devices, manager) = manager();
        devices.deny_permission(true);

        let err = manager
            .acquire_local_media(&QualityProfile::standard())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::MediaAcquisition(MediaAcquisitionError::PermissionDenied(_))
        ));
        assert!(err.is_fatal());
        assert!(manager.hub().tracks().await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_camera() {
        let (devices, manager) = manager();
        devices.remove_camera(true);
        let err = manager.acquire_local_media(&QualityProfile::low()).await.unwrap_err();
        assert!(matches!(
            err,
            Error::MediaAcquisition(MediaAcquisitionError::DeviceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_screen_share_and_restore() {
        let (_devices, manager) = manager();
        let stream = manager.acquire_local_media(&QualityProfile::standard()).await.unwrap();
        let (pc, _events) = FakePeerConnection::new("b");
        manager.hub().attach(pc.clone()).await.unwrap();

        let screen = manager
            .acquire_screen_capture(&QualityProfile::screen())
            .await
            .unwrap();
        assert!(manager.is_sharing());
        assert_eq!(pc.sending(TrackKind::Video).as_deref(), Some(screen.id()));
        assert_eq!(manager.preview().borrow().as_ref(), Some(&screen));

        manager.restore_camera().await.unwrap();
        assert!(!manager.is_sharing());
        assert!(!screen.is_live());
        assert_eq!(pc.sending(TrackKind::Video).as_deref(), Some(stream.video.id()));
        assert_eq!(
            manager.preview().borrow().as_ref().map(|t| t.source()),
            Some(CaptureSource::Camera)
        );
        // Restoring twice is harmless.
        manager.restore_camera().await.unwrap();
    }

    #[tokio::test]
    async fn test_capture_ended_restores_camera() {
        let (devices, manager) = manager();
        manager.acquire_local_media(&QualityProfile::standard()).await.unwrap();
        manager.acquire_screen_capture(&QualityProfile::screen()).await.unwrap();

        let mut sharing = manager.sharing();
        assert!(devices.end_screen_capture());
        tokio::time::timeout(Duration::from_secs(1), sharing.wait_for(|s| !*s))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            manager.hub().track(TrackKind::Video).await.map(|t| t.source()),
            Some(CaptureSource::Camera)
        );
    }

    #[tokio::test]
    async fn test_mute_and_stop_all() {
        let (_devices, manager) = manager();
        assert!(!manager.set_audio_enabled(false));

        let stream = manager.acquire_local_media(&QualityProfile::standard()).await.unwrap();
        assert!(manager.set_audio_enabled(false));
        assert!(!stream.audio.is_enabled());
        assert!(manager.set_video_enabled(false));
        assert!(!stream.video.is_enabled());

        manager.stop_all().await;
        assert!(!stream.audio.is_live());
        assert!(!stream.video.is_live());
        assert!(manager.hub().tracks().await.is_empty());
        assert!(manager.preview().borrow().is_none());
    }
}
