use super::{LinkRole, LinkState, PeerConnection, PeerConnectionFactory, PeerConnectionState, PeerEvent};
use crate::config::TimingConfig;
use crate::media::{AttachmentId, LocalMedia};
use crate::orchestrator::CallEvent;
use crate::signaling::{ClientMessage, IceCandidate, ParticipantId, RoomId, SessionDescription, SignalSender};
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const PEER_CLOSE_TIMEOUT: Duration = Duration::from_secs(3);
const LINK_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Input to a link's dispatch loop.
#[derive(Debug)]
pub(crate) enum LinkCommand {
    /// Create and send the initial offer.
    Negotiate,
    RemoteOffer(SessionDescription),
    RemoteAnswer(SessionDescription),
    RemoteCandidate(IceCandidate),
    /// Re-apply the disconnected rule.
    HealthCheck,
}

/// What every link shares with its orchestrator.
#[derive(Clone)]
pub(crate) struct LinkContext {
    pub local_id: ParticipantId,
    pub room_id: RoomId,
    pub signal: Arc<dyn SignalSender>,
    pub media: Arc<LocalMedia>,
    pub timing: TimingConfig,
    pub events: broadcast::Sender<CallEvent>,
}

/// Orchestrator-side handle. Dropping the command sender ends the link.
pub(crate) struct LinkHandle {
    role: LinkRole,
    commands: mpsc::UnboundedSender<LinkCommand>,
    state: watch::Receiver<LinkState>,
    task: JoinHandle<()>,
}

impl LinkHandle {
    pub fn role(&self) -> LinkRole {
        self.role
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Queues a command; false once the link has stopped.
    pub fn post(&self, command: LinkCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    pub async fn close(self) {
        let LinkHandle { commands, mut task, .. } = self;
        drop(commands);
        if tokio::time::timeout(LINK_CLOSE_TIMEOUT, &mut task).await.is_err() {
            warn!("peer link did not stop in time, aborting");
            task.abort();
        }
    }
}

/// Creates the connection, attaches local media and starts the link's task.
pub(crate) async fn spawn_link(
    ctx: LinkContext,
    factory: &dyn PeerConnectionFactory,
    remote: &str,
    role: LinkRole,
) -> Result<LinkHandle> {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let pc = factory.create(remote, event_tx).await?;
    let attachment = match ctx.media.attach(Arc::clone(&pc)).await {
        Ok(id) => id,
        Err(e) => {
            let _ = pc.close().await;
            return Err(e);
        }
    };

    let (commands, command_rx) = mpsc::unbounded_channel();
    let (state_tx, state) = watch::channel(LinkState::Idle);
    let link = PeerLink {
        remote: remote.to_string(),
        role,
        pc,
        attachment,
        ctx,
        state: state_tx,
        pending_candidates: Vec::new(),
        restarts: 0,
        grace_deadline: None,
        restart_offer_outstanding: false,
    };
    let task = tokio::spawn(link.run(command_rx, event_rx));

    Ok(LinkHandle {
        role,
        commands,
        state,
        task,
    })
}

struct PeerLink {
    remote: ParticipantId,
    role: LinkRole,
    pc: Arc<dyn PeerConnection>,
    attachment: AttachmentId,
    ctx: LinkContext,
    state: watch::Sender<LinkState>,
    /// Remote candidates that arrived before the remote description.
    pending_candidates: Vec<IceCandidate>,
    /// ICE restarts since the link was last connected.
    restarts: u32,
    /// Set while waiting out a `disconnected` report.
    grace_deadline: Option<Instant>,
    restart_offer_outstanding: bool,
}

impl PeerLink {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<LinkCommand>,
        mut events: mpsc::UnboundedReceiver<PeerEvent>,
    ) {
        debug!(remote = %self.remote, role = ?self.role, "peer link started");
        loop {
            let grace = self.grace_deadline;
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => break,
                },
                Some(event) = events.recv() => self.on_event(event).await,
                _ = grace_elapsed(grace) => {
                    self.grace_deadline = None;
                    self.on_grace_expired().await;
                }
            }
            if self.current() == LinkState::Closed {
                break;
            }
        }
        self.shutdown().await;
    }

    fn current(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Validated transition. Illegal moves leave the state unchanged.
    fn transition(&self, next: LinkState) -> Result<()> {
        let from = self.current();
        if from == next {
            return Ok(());
        }
        if !from.can_transition_to(next) {
            return Err(Error::InvalidTransition { from, to: next });
        }
        self.state.send_replace(next);
        debug!(remote = %self.remote, %from, to = %next, "peer link state");
        let _ = self.ctx.events.send(CallEvent::LinkStateChanged {
            participant_id: self.remote.clone(),
            state: next,
        });
        Ok(())
    }

    async fn on_command(&mut self, command: LinkCommand) {
        let negotiate = matches!(command, LinkCommand::Negotiate);
        let result = match command {
            LinkCommand::Negotiate => self.start_negotiation().await,
            LinkCommand::RemoteOffer(sdp) => self.accept_offer(sdp).await,
            LinkCommand::RemoteAnswer(sdp) => self.accept_answer(sdp).await,
            LinkCommand::RemoteCandidate(candidate) => self.add_remote_candidate(candidate).await,
            LinkCommand::HealthCheck => {
                if self.pc.connection_state() == PeerConnectionState::Disconnected {
                    self.arm_grace();
                }
                Ok(())
            }
        };

        if let Err(e) = result {
            warn!(remote = %self.remote, state = %self.current(), error = %e, "peer link operation failed");
            if negotiate {
                // Nothing was negotiated yet; there is no session to recover.
                let _ = self.transition(LinkState::Closed);
            }
        }
    }

    async fn start_negotiation(&mut self) -> Result<()> {
        self.transition(LinkState::Offering)?;
        let offer = self.pc.create_offer(false).await?;
        self.pc.set_local_description(offer.clone()).await?;
        self.transition(LinkState::AwaitingAnswer)?;
        self.send(ClientMessage::Offer {
            target_participant_id: self.remote.clone(),
            sdp: offer,
            room_id: self.ctx.room_id.clone(),
        });
        Ok(())
    }

    async fn accept_offer(&mut self, sdp: SessionDescription) -> Result<()> {
        match self.current() {
            LinkState::Idle => self.transition(LinkState::Answering)?,
            LinkState::Connected => self.transition(LinkState::Recovering)?,
            LinkState::Recovering if self.restart_offer_outstanding => {
                // Both sides restarted at once. The smaller id yields, as for
                // the first offer.
                if self.ctx.local_id > self.remote {
                    debug!(remote = %self.remote, "restart collision, keeping local restart offer");
                    return Ok(());
                }
                info!(remote = %self.remote, "restart collision, yielding to remote restart offer");
                self.pc.rollback().await?;
                self.restart_offer_outstanding = false;
            }
            LinkState::Answering | LinkState::Recovering => {}
            state => {
                debug!(remote = %self.remote, %state, role = ?self.role, "ignoring offer");
                return Ok(());
            }
        }

        self.pc.set_remote_description(sdp).await?;
        self.flush_candidates().await;
        let answer = self.pc.create_answer().await?;
        self.pc.set_local_description(answer.clone()).await?;
        self.send(ClientMessage::Answer {
            target_participant_id: self.remote.clone(),
            sdp: answer,
            room_id: self.ctx.room_id.clone(),
        });
        self.settle_if_connected();
        Ok(())
    }

    async fn accept_answer(&mut self, sdp: SessionDescription) -> Result<()> {
        let state = self.current();
        if state != LinkState::AwaitingAnswer && !self.restart_offer_outstanding {
            debug!(remote = %self.remote, %state, "ignoring answer");
            return Ok(());
        }
        self.restart_offer_outstanding = false;
        self.pc.set_remote_description(sdp).await?;
        self.flush_candidates().await;
        self.settle_if_connected();
        Ok(())
    }

    async fn add_remote_candidate(&mut self, candidate: IceCandidate) -> Result<()> {
        if self.pc.has_remote_description().await {
            self.pc.add_ice_candidate(candidate).await
        } else {
            self.pending_candidates.push(candidate);
            debug!(remote = %self.remote, buffered = self.pending_candidates.len(), "buffered early candidate");
            Ok(())
        }
    }

    async fn flush_candidates(&mut self) {
        for candidate in std::mem::take(&mut self.pending_candidates) {
            if let Err(e) = self.pc.add_ice_candidate(candidate).await {
                warn!(remote = %self.remote, error = %e, "buffered candidate rejected");
            }
        }
    }

    async fn on_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate(candidate) => self.send(ClientMessage::IceCandidate {
                target_participant_id: self.remote.clone(),
                candidate,
                room_id: self.ctx.room_id.clone(),
            }),
            PeerEvent::RemoteTrack { kind } => {
                let _ = self.ctx.events.send(CallEvent::RemoteTrack {
                    participant_id: self.remote.clone(),
                    kind,
                });
            }
            PeerEvent::StateChanged(state) => self.on_connection_state(state).await,
        }
    }

    async fn on_connection_state(&mut self, state: PeerConnectionState) {
        debug!(remote = %self.remote, ?state, "peer connection state");
        match state {
            PeerConnectionState::Connected => {
                self.grace_deadline = None;
                self.settle_if_connected();
            }
            PeerConnectionState::Failed => self.restart("failed").await,
            PeerConnectionState::Disconnected => self.arm_grace(),
            PeerConnectionState::Closed => {
                info!(remote = %self.remote, "peer connection closed underneath link");
                let _ = self.transition(LinkState::Closed);
            }
            PeerConnectionState::New | PeerConnectionState::Connecting => {}
        }
    }

    /// Moves to connected if negotiation is done and the primitive says so.
    fn settle_if_connected(&mut self) {
        let state = self.current();
        let waiting = matches!(
            state,
            LinkState::AwaitingAnswer | LinkState::Answering | LinkState::Recovering
        );
        if !waiting || self.pc.connection_state() != PeerConnectionState::Connected {
            return;
        }
        if self.transition(LinkState::Connected).is_ok() {
            self.restarts = 0;
            self.grace_deadline = None;
            info!(remote = %self.remote, role = ?self.role, "peer link connected");
        }
    }

    fn arm_grace(&mut self) {
        if self.grace_deadline.is_none() && self.current() != LinkState::Closed {
            let grace = self.ctx.timing.disconnect_grace();
            self.grace_deadline = Some(Instant::now() + grace);
            debug!(remote = %self.remote, ?grace, "peer disconnected, waiting before restart");
        }
    }

    async fn on_grace_expired(&mut self) {
        if self.pc.connection_state() == PeerConnectionState::Disconnected {
            self.restart("disconnected").await;
        } else {
            debug!(remote = %self.remote, "peer recovered within grace period");
        }
    }

    async fn restart(&mut self, reason: &'static str) {
        let state = self.current();
        if matches!(state, LinkState::Idle | LinkState::Closed) {
            return;
        }
        if let Some(max) = self.ctx.timing.max_ice_restarts {
            if self.restarts >= max {
                warn!(remote = %self.remote, restarts = self.restarts, "ICE restart budget exhausted, closing link");
                let _ = self.transition(LinkState::Closed);
                return;
            }
        }
        if let Err(e) = self.transition(LinkState::Recovering) {
            warn!(remote = %self.remote, error = %e, "cannot enter recovery");
            return;
        }
        self.restarts += 1;
        self.grace_deadline = None;
        info!(remote = %self.remote, reason, attempt = self.restarts, role = ?self.role, "restarting ICE");

        if let Err(e) = self.send_restart_offer().await {
            warn!(remote = %self.remote, error = %e, "ICE restart offer failed");
        }
    }

    async fn send_restart_offer(&mut self) -> Result<()> {
        let offer = self.pc.create_offer(true).await?;
        self.pc.set_local_description(offer.clone()).await?;
        self.restart_offer_outstanding = true;
        self.send(ClientMessage::Offer {
            target_participant_id: self.remote.clone(),
            sdp: offer,
            room_id: self.ctx.room_id.clone(),
        });
        Ok(())
    }

    /// Signaling sends never block; a down channel drops the message.
    fn send(&self, message: ClientMessage) {
        let kind = message.kind();
        if let Err(e) = self.ctx.signal.send(message) {
            debug!(remote = %self.remote, kind, error = %e, "signaling message dropped");
        }
    }

    async fn shutdown(mut self) {
        self.grace_deadline = None;
        let _ = self.transition(LinkState::Closed);
        self.ctx.media.detach(self.attachment).await;
        match tokio::time::timeout(PEER_CLOSE_TIMEOUT, self.pc.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(remote = %self.remote, error = %e, "peer connection close failed"),
            Err(_) => warn!(remote = %self.remote, "peer connection close timed out"),
        }
        info!(remote = %self.remote, local = %self.ctx.local_id, "peer link closed");
    }
}

async fn grace_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
