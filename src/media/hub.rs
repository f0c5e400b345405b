use super::{LocalTrack, TrackKind};
use crate::peer::PeerConnection;
use crate::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub type AttachmentId = u64;

#[derive(Default)]
struct HubState {
    audio: Option<LocalTrack>,
    video: Option<LocalTrack>,
    attached: HashMap<AttachmentId, Arc<dyn PeerConnection>>,
    next_id: AttachmentId,
}

impl HubState {
    fn slot(&mut self, kind: TrackKind) -> &mut Option<LocalTrack> {
        match kind {
            TrackKind::Audio => &mut self.audio,
            TrackKind::Video => &mut self.video,
        }
    }
}

/// Current outgoing tracks and every peer connection sending them.
///
/// Attaching and swapping serialize on one lock, so a connection attached
/// mid-swap sees either the old track followed by the replacement, or the
/// new track directly.
#[derive(Default)]
pub struct LocalMedia {
    state: Mutex<HubState>,
}

impl LocalMedia {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn track(&self, kind: TrackKind) -> Option<LocalTrack> {
        self.state.lock().await.slot(kind).clone()
    }

    pub async fn tracks(&self) -> Vec<LocalTrack> {
        let state = self.state.lock().await;
        state.audio.iter().chain(state.video.iter()).cloned().collect()
    }

    /// Adds every current track to `pc` and keeps it for later swaps.
    pub async fn attach(&self, pc: Arc<dyn PeerConnection>) -> Result<AttachmentId> {
        let mut state = self.state.lock().await;
        let tracks: Vec<LocalTrack> = state.audio.iter().chain(state.video.iter()).cloned().collect();
        for track in &tracks {
            pc.add_track(track).await?;
        }
        state.next_id += 1;
        let id = state.next_id;
        state.attached.insert(id, pc);
        Ok(id)
    }

    pub async fn detach(&self, id: AttachmentId) {
        self.state.lock().await.attached.remove(&id);
    }

    pub async fn attached_count(&self) -> usize {
        self.state.lock().await.attached.len()
    }

    /// Makes `track` the outgoing track of its kind on every attached
    /// connection. Returns how many connections took it.
    pub async fn set_track(&self, track: LocalTrack) -> usize {
        let kind = track.kind();
        let mut state = self.state.lock().await;
        let had_sender = state.slot(kind).replace(track.clone()).is_some();

        let mut updated = 0;
        for (id, pc) in &state.attached {
            let result = if had_sender {
                pc.replace_track(kind, &track).await
            } else {
                pc.add_track(&track).await
            };
            match result {
                Ok(()) => updated += 1,
                Err(e) => warn!(attachment = id, %kind, error = %e, "failed to update outgoing track"),
            }
        }
        debug!(%kind, track = track.id(), updated, "outgoing track set");
        updated
    }

    /// Forgets the outgoing tracks and returns them.
    pub async fn clear(&self) -> Vec<LocalTrack> {
        let mut state = self.state.lock().await;
        state.audio.take().into_iter().chain(state.video.take()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{CaptureSource, QualityProfile};
    use crate::testing::FakePeerConnection;

    #[tokio::test]
    async fn test_swap_reaches_every_attached_connection() {
        let hub = LocalMedia::new();
        let profile = QualityProfile::standard();
        let cam = LocalTrack::new(CaptureSource::Camera, &profile);
        let mic = LocalTrack::new(CaptureSource::Microphone, &profile);
        hub.set_track(mic.clone()).await;
        hub.set_track(cam.clone()).await;

        let (a, _ra) = FakePeerConnection::new("a");
        let (b, _rb) = FakePeerConnection::new("b");
        hub.attach(a.clone()).await.unwrap();
        let b_id = hub.attach(b.clone()).await.unwrap();
        assert_eq!(a.sending(TrackKind::Video).as_deref(), Some(cam.id()));

        let screen = LocalTrack::new(CaptureSource::Screen, &profile);
        assert_eq!(hub.set_track(screen.clone()).await, 2);
        assert_eq!(a.sending(TrackKind::Video).as_deref(), Some(screen.id()));
        assert_eq!(b.sending(TrackKind::Video).as_deref(), Some(screen.id()));
        assert_eq!(a.sending(TrackKind::Audio).as_deref(), Some(mic.id()));
        assert_eq!(a.replaced_tracks(), vec![(TrackKind::Video, screen.id().to_string())]);

        hub.detach(b_id).await;
        hub.set_track(cam.clone()).await;
        assert_eq!(b.sending(TrackKind::Video).as_deref(), Some(screen.id()));
        assert_eq!(hub.attached_count().await, 1);
    }

    #[tokio::test]
    async fn test_clear_returns_tracks() {
        let hub = LocalMedia::new();
        let profile = QualityProfile::low();
        hub.set_track(LocalTrack::new(CaptureSource::Microphone, &profile)).await;
        assert_eq!(hub.clear().await.len(), 1);
        assert!(hub.tracks().await.is_empty());
    }
}
