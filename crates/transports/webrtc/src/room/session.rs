//! Session loop
//!
//! One task per open room view. User commands, signaling events, peer
//! backend events, reconnect results and status-sync results are consumed by a
//! single `select!` loop, so negotiator and channel state are only ever
//! touched from here.

use super::state::{CallPhase, Presence, SessionEvent, SessionSnapshot};
use super::status_sync::StatusSync;
use crate::chat::{ChatEntry, ChatReceipt, ChatSubchannel};
use crate::config::SessionConfig;
use crate::media::MediaController;
use crate::peer::{NegotiationNotice, NegotiationState, Negotiator, PeerEvent, Step};
use crate::signaling::{
    ChannelEvent, CloseReason, JoinParams, SignalingChannel, SignalingConnector, SignalingMessage,
};
use crate::{Error, Result};
use chrono::Utc;
use std::sync::Arc;
use teleconsult_core::{elapsed_minutes, ParticipantContext, ParticipantRole, RoomRecord};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// Request from a [`RoomSessionHandle`](super::RoomSessionHandle)
pub(crate) enum Command {
    StartCall(oneshot::Sender<Result<()>>),
    SendChat(String, oneshot::Sender<Result<()>>),
    SetVideo(bool),
    SetAudio(bool),
    ChatHistory(oneshot::Sender<Vec<ChatEntry>>),
    Leave(oneshot::Sender<()>),
}

/// Everything `open` hands over to the loop
pub(crate) struct SessionParts {
    pub ctx: ParticipantContext,
    pub config: SessionConfig,
    pub room: RoomRecord,
    pub local_role: ParticipantRole,
    pub join: JoinParams,
    pub room_service: Arc<dyn teleconsult_core::RoomService>,
    pub connector: Arc<dyn SignalingConnector>,
    pub media: MediaController,
    pub negotiator: Negotiator,
    pub channel: SignalingChannel,
    pub chat: ChatSubchannel,
}

pub(crate) struct RoomSession {
    ctx: ParticipantContext,
    config: SessionConfig,
    room: RoomRecord,
    local_role: ParticipantRole,
    counterpart: String,
    join: JoinParams,
    connector: Arc<dyn SignalingConnector>,

    media: MediaController,
    negotiator: Negotiator,
    channel: Option<SignalingChannel>,
    chat: ChatSubchannel,
    status: StatusSync,
    status_results: mpsc::UnboundedReceiver<RoomRecord>,

    presence: Presence,

    /// Host asked to start the call; honoured once the guest is present
    call_requested: bool,

    /// Offer/answer exchange was cut off before `Connected`
    interrupted: bool,

    reconnect: Option<JoinHandle<Result<SignalingChannel>>>,
    reconnect_attempt: u32,
    connection_lost: bool,

    last_error: Option<String>,
    ended: bool,

    snapshot: watch::Sender<SessionSnapshot>,
    events: broadcast::Sender<SessionEvent>,
}

impl RoomSession {
    pub(crate) fn new(
        parts: SessionParts,
        snapshot: watch::Sender<SessionSnapshot>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        let counterpart = parts
            .room
            .counterpart_of(&parts.ctx.user_id)
            .unwrap_or_default()
            .to_string();
        let (status, status_results) = StatusSync::new(
            parts.room_service,
            &parts.room.id,
            parts.config.status_sync.clone(),
        );

        Self {
            ctx: parts.ctx,
            config: parts.config,
            room: parts.room,
            local_role: parts.local_role,
            counterpart,
            join: parts.join,
            connector: parts.connector,
            media: parts.media,
            negotiator: parts.negotiator,
            channel: Some(parts.channel),
            chat: parts.chat,
            status,
            status_results,
            presence: Presence::Unknown,
            call_requested: false,
            interrupted: false,
            reconnect: None,
            reconnect_attempt: 0,
            connection_lost: false,
            last_error: None,
            ended: false,
            snapshot,
            events,
        }
    }

    #[instrument(skip_all, fields(room_id = %self.room.id, user_id = %self.ctx.user_id))]
    pub(crate) async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        info!("Session started as {:?}", self.local_role);
        self.publish();

        while !self.ended {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Leave(reply)) => {
                        self.end().await;
                        let _ = reply.send(());
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("All session handles dropped, leaving");
                        self.end().await;
                    }
                },
                event = next_channel_event(&mut self.channel) => self.handle_channel_event(event).await,
                event = self.negotiator.next_event() => self.handle_peer_event(event).await,
                result = join_reconnect(&mut self.reconnect) => self.handle_reconnect(result).await,
                Some(record) = self.status_results.recv() => self.handle_room_update(record),
            }
        }

        info!("Session finished");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::StartCall(reply) => {
                let result = self.request_call().await;
                let _ = reply.send(result);
            }
            Command::SendChat(text, reply) => {
                let _ = reply.send(self.send_chat(&text));
            }
            Command::SetVideo(enabled) => {
                self.media.set_video_enabled(enabled);
                self.publish();
            }
            Command::SetAudio(enabled) => {
                self.media.set_audio_enabled(enabled);
                self.publish();
            }
            Command::ChatHistory(reply) => {
                let _ = reply.send(self.chat.entries().to_vec());
            }
            Command::Leave(reply) => {
                self.end().await;
                let _ = reply.send(());
            }
        }
    }

    async fn request_call(&mut self) -> Result<()> {
        if !self.local_role.can_initiate() {
            return Err(Error::InvalidState(
                "only the host can start the call".to_string(),
            ));
        }
        if !self.room.status.allows_call_start() {
            return Err(Error::RoomEnded(self.room.id.clone()));
        }
        if self.connection_lost {
            return Err(Error::ConnectionLost(
                "signaling reconnect attempts exhausted".to_string(),
            ));
        }

        self.call_requested = true;
        let result = self.try_start_call().await;
        self.publish();
        result
    }

    async fn try_start_call(&mut self) -> Result<()> {
        if !self.call_requested {
            return Ok(());
        }
        if self.presence != Presence::Present || self.channel.is_none() {
            info!("Call start deferred until the participant is present");
            return Ok(());
        }
        if self.negotiator.state() == NegotiationState::Idle {
            debug!("Call start deferred until a fresh peer connection is bound");
            return Ok(());
        }

        match self.negotiator.start_call().await {
            Ok(step) => {
                self.apply_step(step).await;
                Ok(())
            }
            Err(e @ Error::NegotiationFailed(_)) => {
                let reported = e.to_string();
                self.fail(e).await;
                Err(Error::NegotiationFailed(reported))
            }
            Err(e) => Err(e),
        }
    }

    fn send_chat(&mut self, text: &str) -> Result<()> {
        let Some(channel) = &self.channel else {
            return Err(Error::InvalidState(
                "chat unavailable while signaling is disconnected".to_string(),
            ));
        };
        let frame = self.chat.compose(text)?;
        if !channel.send(frame) {
            self.chat.withdraw_last();
            warn!("Chat line for room {} not sent, signaling writer is gone", self.room.id);
            return Err(Error::ConnectionLost("signaling writer is gone".to_string()));
        }
        Ok(())
    }

    async fn handle_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Message(message) => self.handle_message(message).await,
            ChannelEvent::Closed(reason) => self.handle_channel_closed(reason).await,
        }
        self.publish();
    }

    async fn handle_message(&mut self, message: SignalingMessage) {
        match message {
            SignalingMessage::PresenceJoined { user_id, .. } => self.on_presence_joined(user_id).await,
            SignalingMessage::PresenceLeft { user_id, .. } => self.on_presence_left(user_id),
            SignalingMessage::Chat { .. } => match self.chat.receive(&message) {
                Some(ChatReceipt::Delivered(line)) => self.emit(SessionEvent::ChatDelivered(line)),
                Some(ChatReceipt::Received(line)) => self.emit(SessionEvent::ChatReceived(line)),
                None => {}
            },
            negotiation => {
                if let Some(from) = negotiation.sender() {
                    if from != self.counterpart {
                        warn!("Ignoring {} from non-participant {}", negotiation.kind(), from);
                        return;
                    }
                }
                if self.is_host_restart(&negotiation) {
                    info!("Host sent a new offer, restarting negotiation");
                    if let Err(e) = self.renegotiate().await {
                        self.fail(e).await;
                        return;
                    }
                }
                match self.negotiator.handle_signal(negotiation).await {
                    Ok(step) => self.apply_step(step).await,
                    Err(e) => self.fail(e).await,
                }
            }
        }
    }

    /// Guest got an offer while still holding an earlier exchange
    fn is_host_restart(&self, message: &SignalingMessage) -> bool {
        if self.local_role.can_initiate() || !matches!(message, SignalingMessage::Offer { .. }) {
            return false;
        }
        let state = self.negotiator.state();
        state.is_negotiating() || state.is_established()
    }

    async fn on_presence_joined(&mut self, user_id: String) {
        if user_id == self.ctx.user_id {
            return;
        }
        if user_id != self.counterpart {
            warn!("Presence from {} who is not in this room", user_id);
            return;
        }

        info!("{} joined", user_id);
        self.presence = Presence::Present;
        self.emit(SessionEvent::PresenceJoined(user_id));

        if self.interrupted || self.negotiator.state() == NegotiationState::Idle {
            if let Err(e) = self.renegotiate().await {
                self.fail(e).await;
                return;
            }
        }

        if let Err(e) = self.try_start_call().await {
            warn!("Deferred call start failed: {}", e);
        }
    }

    fn on_presence_left(&mut self, user_id: String) {
        if user_id != self.counterpart {
            return;
        }

        info!("{} left", user_id);
        self.presence = Presence::Absent;
        if self.negotiator.state().is_negotiating() {
            debug!("Negotiation interrupted by participant leaving");
            self.interrupted = true;
        }
        self.emit(SessionEvent::PresenceLeft(user_id));
    }

    /// Fresh peer connection for a new offer/answer exchange
    async fn renegotiate(&mut self) -> Result<()> {
        info!("Preparing a fresh peer connection");
        self.negotiator.reset().await;
        self.interrupted = false;

        let Some(stream) = self.media.stream() else {
            return Err(Error::InvalidState("local media already released".to_string()));
        };
        self.negotiator.bind_media(stream).await
    }

    async fn handle_channel_closed(&mut self, reason: CloseReason) {
        self.channel = None;
        self.presence = Presence::Unknown;

        match reason {
            CloseReason::Local => debug!("Signaling channel closed locally"),
            CloseReason::Rejected(why) => {
                self.fail(Error::AuthRejected(format!("relay closed the session: {}", why)))
                    .await;
            }
            CloseReason::Dropped(why) => {
                warn!("Signaling dropped: {}", why);
                if self.negotiator.state().is_negotiating() {
                    self.interrupted = true;
                }
                self.schedule_reconnect().await;
            }
        }
    }

    async fn schedule_reconnect(&mut self) {
        let policy = &self.config.reconnect;
        if !policy.should_retry(self.reconnect_attempt) {
            self.reconnect_exhausted().await;
            return;
        }

        let delay = policy.calculate_backoff(self.reconnect_attempt);
        self.reconnect_attempt += 1;
        info!(
            "Reconnecting signaling in {:?} (attempt {}/{})",
            delay, self.reconnect_attempt, policy.max_retries
        );

        let connector = Arc::clone(&self.connector);
        let params = self.join.clone();
        let timeout = self.config.connect_timeout();
        self.reconnect = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            tokio::time::timeout(timeout, connector.connect(&params))
                .await
                .map_err(|_| Error::ConnectFailed(format!("reconnect timed out after {:?}", timeout)))?
        }));
    }

    /// Stay in the room view, but with no call and no devices
    async fn reconnect_exhausted(&mut self) {
        error!("Signaling reconnect attempts exhausted");
        self.connection_lost = true;
        self.media.release();
        self.negotiator.close().await;
        self.record_error(Error::ConnectionLost(format!(
            "gave up after {} reconnect attempts",
            self.reconnect_attempt
        )));
    }

    async fn handle_reconnect(&mut self, result: Result<SignalingChannel>) {
        match result {
            Ok(channel) => {
                info!("Signaling reconnected");
                self.channel = Some(channel);
                self.reconnect_attempt = 0;
            }
            Err(e) if e.is_retryable() => {
                warn!("Reconnect attempt {} failed: {}", self.reconnect_attempt, e);
                self.schedule_reconnect().await;
            }
            Err(e) => self.fail(e).await,
        }
        self.publish();
    }

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        let step = self.negotiator.handle_peer_event(event).await;
        self.apply_step(step).await;

        // Link failure rebinds to MediaBound; a host still in the call re-offers
        if !self.ended && self.negotiator.state() == NegotiationState::MediaBound {
            if let Err(e) = self.try_start_call().await {
                warn!("Re-offer after link failure failed: {}", e);
            }
        }
        self.publish();
    }

    async fn apply_step(&mut self, step: Step) {
        for message in step.outbound {
            match &self.channel {
                Some(channel) => {
                    channel.send(message);
                }
                None => debug!("No signaling channel, dropping outbound {}", message.kind()),
            }
        }

        for notice in step.notices {
            match notice {
                NegotiationNotice::Connected => {
                    info!("Call connected");
                    self.emit(SessionEvent::CallConnected);
                    if self.local_role.can_initiate() {
                        self.status.notify_active();
                    }
                }
                NegotiationNotice::Degraded => self.emit(SessionEvent::Degraded),
                NegotiationNotice::Recovered => self.emit(SessionEvent::Recovered),
                NegotiationNotice::RemoteTrack { kind, id } => {
                    self.emit(SessionEvent::RemoteTrack { kind, id })
                }
                NegotiationNotice::Closed(reason) => {
                    warn!("Peer connection lost ({}), waiting for a new negotiation", reason);
                    self.emit(SessionEvent::Error(reason));
                    if let Err(e) = self.renegotiate().await {
                        self.fail(e).await;
                        return;
                    }
                }
            }
        }
    }

    fn handle_room_update(&mut self, record: RoomRecord) {
        if self.room.status.can_transition_to(record.status) {
            debug!("Cached room status {} -> {}", self.room.status, record.status);
            self.room = record;
            self.publish();
        }
    }

    /// Fatal error: tear down without touching the room status
    async fn fail(&mut self, err: Error) {
        error!("Session failed: {}", err);
        self.record_error(err);
        self.teardown().await;
        self.ended = true;
        self.publish();
    }

    /// Leave: tear down, then report the room ended
    #[instrument(skip(self), fields(room_id = %self.room.id))]
    async fn end(&mut self) {
        if self.ended {
            return;
        }
        self.ended = true;
        self.teardown().await;

        if !self.room.status.is_terminal() {
            let minutes = elapsed_minutes(self.room.created_at, Utc::now());
            info!("Leaving room after {} minutes", minutes);
            self.status.notify_ended(minutes);
        }
        self.status.flush(self.config.status_flush_timeout()).await;
        self.publish();
    }

    /// Media, then negotiator, then transport; each step is idempotent
    async fn teardown(&mut self) {
        if let Some(reconnect) = self.reconnect.take() {
            reconnect.abort();
        }
        self.media.release();
        self.negotiator.close().await;
        if let Some(mut channel) = self.channel.take() {
            channel.close();
        }
    }

    fn record_error(&mut self, err: Error) {
        let message = err.to_string();
        self.last_error = Some(message.clone());
        self.emit(SessionEvent::Error(message));
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn phase(&self) -> CallPhase {
        if self.ended {
            return CallPhase::Ended;
        }
        if self.connection_lost {
            return CallPhase::ConnectionLost;
        }
        if self.channel.is_none() {
            return CallPhase::Reconnecting {
                attempt: self.reconnect_attempt,
            };
        }

        let negotiation = self.negotiator.state();
        if negotiation.is_established() {
            CallPhase::InCall
        } else if negotiation.is_negotiating() {
            CallPhase::Connecting
        } else if self.presence == Presence::Present {
            CallPhase::Ready
        } else {
            CallPhase::WaitingForParticipant
        }
    }

    fn publish(&self) {
        let next = SessionSnapshot {
            room_id: self.room.id.clone(),
            local_role: self.local_role,
            phase: self.phase(),
            negotiation: self.negotiator.state(),
            remote_presence: self.presence,
            video_enabled: self.media.video_enabled(),
            audio_enabled: self.media.audio_enabled(),
            room_status: self.room.status,
            last_error: self.last_error.clone(),
        };

        self.snapshot.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            if current.phase != next.phase {
                info!("Call phase: {} -> {}", current.phase, next.phase);
            }
            *current = next;
            true
        });
    }
}

async fn next_channel_event(channel: &mut Option<SignalingChannel>) -> ChannelEvent {
    match channel {
        Some(channel) => channel.recv().await,
        None => std::future::pending().await,
    }
}

async fn join_reconnect(slot: &mut Option<JoinHandle<Result<SignalingChannel>>>) -> Result<SignalingChannel> {
    let Some(handle) = slot.as_mut() else {
        return std::future::pending().await;
    };
    let joined = handle.await;
    *slot = None;
    joined.map_err(|e| Error::ConnectFailed(format!("reconnect task failed: {}", e)))?
}
