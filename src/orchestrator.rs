//! Client-side full mesh: one peer link per remote participant.

use crate::config::TimingConfig;
use crate::media::{LocalMedia, TrackKind};
use crate::peer::{
    spawn_link, LinkCommand, LinkContext, LinkHandle, LinkRole, LinkState, PeerConnectionFactory,
};
use crate::signaling::{
    ParticipantId, ParticipantSummary, RoomId, ServerMessage, SessionDescription, SignalSender, StateKind,
};
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 256;

/// Something the local participant's UI would care about.
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    RemoteJoined {
        participant_id: ParticipantId,
        display_name: String,
    },
    RemoteLeft {
        participant_id: ParticipantId,
    },
    LinkStateChanged {
        participant_id: ParticipantId,
        state: LinkState,
    },
    RemoteMediaChanged {
        participant_id: ParticipantId,
        kind: StateKind,
        state: bool,
    },
    RemoteTrack {
        participant_id: ParticipantId,
        kind: TrackKind,
    },
}

/// Local view of a remote participant. Media is presumed on until the first
/// toggle event says otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteParticipant {
    pub display_name: String,
    pub video_on: bool,
    pub audio_on: bool,
    pub screen_sharing: bool,
}

impl RemoteParticipant {
    fn new(display_name: &str) -> Self {
        Self {
            display_name: display_name.to_string(),
            video_on: true,
            audio_on: true,
            screen_sharing: false,
        }
    }
}

struct RemoteEntry {
    view: RemoteParticipant,
    /// Join request during which this participant was learned.
    generation: u64,
}

pub struct ConnectionOrchestrator {
    ctx: LinkContext,
    factory: Arc<dyn PeerConnectionFactory>,
    links: tokio::sync::Mutex<HashMap<ParticipantId, LinkHandle>>,
    pending_offers: Mutex<HashMap<ParticipantId, JoinHandle<()>>>,
    remotes: Mutex<HashMap<ParticipantId, RemoteEntry>>,
    sweep: Mutex<Option<JoinHandle<()>>>,
    generation: AtomicU64,
    /// Set by `close_all`; no link is created afterwards.
    closed: AtomicBool,
}

impl ConnectionOrchestrator {
    pub fn new(
        local_id: impl Into<ParticipantId>,
        room_id: impl Into<RoomId>,
        factory: Arc<dyn PeerConnectionFactory>,
        signal: Arc<dyn SignalSender>,
        media: Arc<LocalMedia>,
        timing: TimingConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            ctx: LinkContext {
                local_id: local_id.into(),
                room_id: room_id.into(),
                signal,
                media,
                timing,
                events,
            },
            factory,
            links: tokio::sync::Mutex::new(HashMap::new()),
            pending_offers: Mutex::new(HashMap::new()),
            remotes: Mutex::new(HashMap::new()),
            sweep: Mutex::new(None),
            generation: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub fn local_id(&self) -> &str {
        &self.ctx.local_id
    }

    pub fn room_id(&self) -> &str {
        &self.ctx.room_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.ctx.events.subscribe()
    }

    pub fn remote(&self, participant_id: &str) -> Option<RemoteParticipant> {
        self.remotes.lock().get(participant_id).map(|entry| entry.view.clone())
    }

    pub fn remotes(&self) -> HashMap<ParticipantId, RemoteParticipant> {
        self.remotes
            .lock()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.view.clone()))
            .collect()
    }

    pub async fn link_state(&self, remote: &str) -> Option<LinkState> {
        self.links.lock().await.get(remote).map(|link| link.state())
    }

    pub async fn link_role(&self, remote: &str) -> Option<LinkRole> {
        self.links.lock().await.get(remote).map(|link| link.role())
    }

    pub async fn link_states(&self) -> HashMap<ParticipantId, LinkState> {
        self.links
            .lock()
            .await
            .iter()
            .map(|(id, link)| (id.clone(), link.state()))
            .collect()
    }

    pub fn has_pending_offer(&self, remote: &str) -> bool {
        self.pending_offers.lock().contains_key(remote)
    }

    /// Marks a new `join-room` request. Whatever is known when its roster
    /// arrives, and was learned before this call, is treated as stale.
    pub fn expect_roster(&self) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(generation, "awaiting room roster");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Single entry point for everything the relay sends.
    pub async fn handle_signal(self: &Arc<Self>, message: ServerMessage) {
        if self.is_closed() {
            debug!("orchestrator closed, ignoring signal");
            return;
        }
        match message {
            ServerMessage::RoomParticipants { participants } => {
                info!(room = %self.ctx.room_id, count = participants.len(), "received room roster");
                self.on_roster(participants).await;
            }
            ServerMessage::UserJoined {
                participant_id,
                display_name,
            } => {
                if participant_id == self.ctx.local_id {
                    return;
                }
                info!(remote = %participant_id, name = %display_name, "participant joined");
                self.cancel_pending_offer(&participant_id);
                if self.close_link(&participant_id).await {
                    debug!(remote = %participant_id, "closed stale link on rejoin");
                }
                self.add_remote(&participant_id, &display_name, true);
                self.schedule_offer(&participant_id);
            }
            ServerMessage::UserLeft { participant_id, .. } => {
                info!(remote = %participant_id, "participant left");
                self.cancel_pending_offer(&participant_id);
                self.close_link(&participant_id).await;
                if self.remotes.lock().remove(&participant_id).is_some() {
                    let _ = self.ctx.events.send(CallEvent::RemoteLeft { participant_id });
                }
            }
            ServerMessage::Offer {
                sdp,
                sender_participant_id,
            } => self.on_offer(sender_participant_id, sdp).await,
            ServerMessage::Answer {
                sdp,
                sender_participant_id,
            } => self.post(&sender_participant_id, LinkCommand::RemoteAnswer(sdp)).await,
            ServerMessage::IceCandidate {
                candidate,
                sender_participant_id,
            } => {
                self.post(&sender_participant_id, LinkCommand::RemoteCandidate(candidate))
                    .await
            }
            ServerMessage::UserVideoToggled { participant_id, state } => {
                self.on_remote_toggle(participant_id, StateKind::Video, state)
            }
            ServerMessage::UserAudioToggled { participant_id, state } => {
                self.on_remote_toggle(participant_id, StateKind::Audio, state)
            }
            ServerMessage::UserScreenShareToggled { participant_id, state } => {
                self.on_remote_toggle(participant_id, StateKind::ScreenShare, state)
            }
            ServerMessage::Pong => {}
        }
    }

    /// Offers to `remote` once the settle delay passes, unless cancelled first.
    pub fn schedule_offer(self: &Arc<Self>, remote: &str) {
        if self.is_closed() {
            return;
        }
        let orchestrator: Weak<Self> = Arc::downgrade(self);
        let remote_id = remote.to_string();
        let delay = self.ctx.timing.offer_settle_delay();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(orchestrator) = orchestrator.upgrade() else {
                return;
            };
            orchestrator.pending_offers.lock().remove(&remote_id);
            orchestrator.start_offer(&remote_id).await;
        });
        if let Some(previous) = self.pending_offers.lock().insert(remote.to_string(), task) {
            previous.abort();
        }
    }

    pub fn cancel_pending_offer(&self, remote: &str) -> bool {
        match self.pending_offers.lock().remove(remote) {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    fn cancel_pending_offers(&self) {
        for (_, task) in self.pending_offers.lock().drain() {
            task.abort();
        }
    }

    /// Closes and forgets the link to `remote`. Returns whether one existed.
    pub async fn close_link(&self, remote: &str) -> bool {
        let link = self.links.lock().await.remove(remote);
        match link {
            Some(link) => {
                link.close().await;
                true
            }
            None => false,
        }
    }

    /// Closes every link and forgets every remote. Terminal: offers still in
    /// flight find the orchestrator closed and create nothing.
    pub async fn close_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.cancel_pending_offers();
        let links: Vec<LinkHandle> = self.links.lock().await.drain().map(|(_, link)| link).collect();
        self.remotes.lock().clear();
        let count = links.len();
        join_all(links.into_iter().map(LinkHandle::close)).await;
        info!(count, "closed all peer links");
    }

    /// Periodically re-applies the disconnected rule to every link.
    pub fn start_health_sweep(self: &Arc<Self>) {
        let orchestrator = Arc::downgrade(self);
        let period = self.ctx.timing.health_sweep_interval();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(orchestrator) = orchestrator.upgrade() else {
                    break;
                };
                orchestrator.sweep().await;
            }
        });
        if let Some(previous) = self.sweep.lock().replace(task) {
            previous.abort();
        }
    }

    pub async fn sweep(&self) {
        let links = self.links.lock().await;
        for link in links.values() {
            link.post(LinkCommand::HealthCheck);
        }
        debug!(links = links.len(), "health sweep");
    }

    /// Stops the health sweep and every pending offer timer.
    pub fn cancel_timers(&self) {
        if let Some(sweep) = self.sweep.lock().take() {
            sweep.abort();
        }
        self.cancel_pending_offers();
    }

    /// Applies a roster snapshot. Participants learned before the current
    /// join are dropped with their links; those announced since are kept.
    async fn on_roster(self: &Arc<Self>, participants: Vec<ParticipantSummary>) {
        let generation = self.generation.load(Ordering::SeqCst);
        let in_roster = |id: &str| participants.iter().any(|p| p.participant_id == id);

        let stale: Vec<ParticipantId> = {
            let mut remotes = self.remotes.lock();
            let stale: Vec<ParticipantId> = remotes
                .iter()
                .filter(|(_, entry)| entry.generation < generation)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &stale {
                remotes.remove(id);
            }
            stale
        };
        for id in &stale {
            self.cancel_pending_offer(id);
        }

        let dropped: Vec<LinkHandle> = {
            let mut links = self.links.lock().await;
            let orphaned: Vec<ParticipantId> = {
                let remotes = self.remotes.lock();
                links.keys().filter(|id| !remotes.contains_key(*id)).cloned().collect()
            };
            orphaned.iter().filter_map(|id| links.remove(id)).collect()
        };
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "closing links from a previous join");
        }
        join_all(dropped.into_iter().map(LinkHandle::close)).await;

        for id in stale.iter().filter(|id| !in_roster(id.as_str())) {
            let _ = self.ctx.events.send(CallEvent::RemoteLeft {
                participant_id: id.clone(),
            });
        }

        for participant in &participants {
            let id = &participant.participant_id;
            if *id == self.ctx.local_id {
                continue;
            }
            let announced_since_join = match self.remotes.lock().get_mut(id) {
                Some(entry) => {
                    entry.view.display_name = participant.display_name.clone();
                    true
                }
                None => false,
            };
            if announced_since_join {
                continue;
            }
            self.add_remote(id, &participant.display_name, !stale.contains(id));
            self.schedule_offer(id);
        }
    }

    fn add_remote(&self, participant_id: &str, display_name: &str, announce: bool) {
        let entry = RemoteEntry {
            view: RemoteParticipant::new(display_name),
            generation: self.generation.load(Ordering::SeqCst),
        };
        self.remotes.lock().insert(participant_id.to_string(), entry);
        if announce {
            let _ = self.ctx.events.send(CallEvent::RemoteJoined {
                participant_id: participant_id.to_string(),
                display_name: display_name.to_string(),
            });
        }
    }

    async fn start_offer(&self, remote: &str) {
        if !self.remotes.lock().contains_key(remote) {
            debug!(remote, "participant gone before offer");
            return;
        }
        let mut links = self.links.lock().await;
        if self.is_closed() {
            debug!(remote, "orchestrator closed, not offering");
            return;
        }
        if links.get(remote).is_some_and(|link| link.state() != LinkState::Closed) {
            debug!(remote, "link already exists, not offering");
            return;
        }
        let stale = links.remove(remote);

        match spawn_link(self.ctx.clone(), self.factory.as_ref(), remote, LinkRole::Offerer).await {
            Ok(link) => {
                link.post(LinkCommand::Negotiate);
                links.insert(remote.to_string(), link);
            }
            Err(e) => warn!(remote, error = %e, "failed to create peer link"),
        }
        drop(links);
        if let Some(stale) = stale {
            stale.close().await;
        }
    }

    async fn on_offer(&self, remote: ParticipantId, sdp: SessionDescription) {
        if remote == self.ctx.local_id {
            return;
        }
        if !self.remotes.lock().contains_key(&remote) {
            warn!(remote = %remote, "offer from participant never announced by the relay, dropped");
            return;
        }
        self.cancel_pending_offer(&remote);

        let mut links = self.links.lock().await;
        if self.is_closed() {
            debug!(remote = %remote, "orchestrator closed, offer dropped");
            return;
        }
        let existing = links.get(&remote).map(|link| (link.role(), link.state()));
        let displaced = match existing {
            None => None,
            Some((_, LinkState::Closed)) => links.remove(&remote),
            Some((LinkRole::Offerer, LinkState::Idle | LinkState::Offering | LinkState::AwaitingAnswer)) => {
                if self.ctx.local_id < remote {
                    info!(remote = %remote, "offer collision, yielding to remote offer");
                    links.remove(&remote)
                } else {
                    debug!(remote = %remote, "offer collision, keeping local offer");
                    return;
                }
            }
            Some(_) => {
                if let Some(link) = links.get(&remote) {
                    if !link.post(LinkCommand::RemoteOffer(sdp)) {
                        debug!(remote = %remote, "link stopped before offer");
                    }
                }
                return;
            }
        };

        match spawn_link(self.ctx.clone(), self.factory.as_ref(), &remote, LinkRole::Answerer).await {
            Ok(link) => {
                link.post(LinkCommand::RemoteOffer(sdp));
                links.insert(remote.clone(), link);
            }
            Err(e) => warn!(remote = %remote, error = %e, "failed to create peer link"),
        }
        drop(links);
        if let Some(displaced) = displaced {
            displaced.close().await;
        }
    }

    async fn post(&self, remote: &str, command: LinkCommand) {
        let links = self.links.lock().await;
        match links.get(remote) {
            Some(link) => {
                if !link.post(command) {
                    debug!(remote, "link stopped, message dropped");
                }
            }
            None => debug!(remote, "no link for message, dropped"),
        }
    }

    fn on_remote_toggle(&self, participant_id: ParticipantId, kind: StateKind, state: bool) {
        if let Some(entry) = self.remotes.lock().get_mut(&participant_id) {
            let remote = &mut entry.view;
            match kind {
                StateKind::Video => remote.video_on = state,
                StateKind::Audio => remote.audio_on = state,
                StateKind::ScreenShare => remote.screen_sharing = state,
            }
        }
        debug!(remote = %participant_id, ?kind, state, "remote media toggled");
        let _ = self.ctx.events.send(CallEvent::RemoteMediaChanged {
            participant_id,
            kind,
            state,
        });
    }
}
