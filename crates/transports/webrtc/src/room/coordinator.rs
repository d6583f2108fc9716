//! Room Lifecycle Coordinator
//!
//! Opening a room runs the join sequence in order: fetch and validate the
//! room, acquire local media, bind it to a fresh peer connection, load chat
//! history, connect signaling. Any failure before the session task starts
//! unwinds whatever was already set up. The spawned session is then driven
//! through a cloneable [`RoomSessionHandle`].

use super::session::{Command, RoomSession, SessionParts};
use super::state::{ChatLog, SessionEvent, SessionSnapshot};
use crate::chat::ChatSubchannel;
use crate::config::SessionConfig;
use crate::media::{CaptureDevice, MediaController, SampleSourceDevice};
use crate::peer::{Negotiator, PeerBackendFactory, RtcBackendFactory};
use crate::signaling::{JoinParams, SignalingConnector, WebSocketConnector};
use crate::{Error, Result};
use std::future::Future;
use std::sync::Arc;
use teleconsult_core::{ParticipantContext, RoomService, RoomStatus};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{info, instrument, warn};

const COMMAND_CAPACITY: usize = 64;
const EVENT_CAPACITY: usize = 64;

/// Opens room sessions for one local participant
pub struct RoomCoordinator {
    ctx: ParticipantContext,
    config: SessionConfig,
    room_service: Arc<dyn RoomService>,
    connector: Arc<dyn SignalingConnector>,
    device: Arc<dyn CaptureDevice>,
    peer_factory: Arc<dyn PeerBackendFactory>,
}

impl RoomCoordinator {
    /// Coordinator with explicit collaborators
    ///
    /// Capture uses a [`SampleSourceDevice`] and peers use real WebRTC
    /// connections unless replaced with the `with_*` builders.
    pub fn new(
        ctx: ParticipantContext,
        config: SessionConfig,
        room_service: Arc<dyn RoomService>,
        connector: Arc<dyn SignalingConnector>,
    ) -> Self {
        let peer_factory = Arc::new(RtcBackendFactory::from_config(&config));
        Self {
            ctx,
            config,
            room_service,
            connector,
            device: Arc::new(SampleSourceDevice::new()),
            peer_factory,
        }
    }

    /// Coordinator that signals over WebSocket at `config.signaling_url`
    pub fn with_websocket(
        ctx: ParticipantContext,
        config: SessionConfig,
        room_service: Arc<dyn RoomService>,
    ) -> Result<Self> {
        config.validate()?;
        let connector = WebSocketConnector::new(&config.signaling_url, config.connect_timeout())?;
        Ok(Self::new(ctx, config, room_service, Arc::new(connector)))
    }

    /// Use `device` for local capture
    pub fn with_capture_device(mut self, device: Arc<dyn CaptureDevice>) -> Self {
        self.device = device;
        self
    }

    /// Use `factory` for peer connections
    pub fn with_peer_factory(mut self, factory: Arc<dyn PeerBackendFactory>) -> Self {
        self.peer_factory = factory;
        self
    }

    /// Local participant
    pub fn participant(&self) -> &ParticipantContext {
        &self.ctx
    }

    /// Join `room_id` with its join token
    pub async fn open(&self, room_id: &str, token: &str) -> Result<RoomSessionHandle> {
        self.open_until(room_id, token, std::future::pending()).await
    }

    /// Join `room_id`, abandoning the join if `cancelled` resolves first
    ///
    /// Cancellation is observed while waiting for devices and while
    /// connecting; anything acquired so far is released.
    #[instrument(skip(self, token, cancelled), fields(user_id = %self.ctx.user_id))]
    pub async fn open_until<F>(&self, room_id: &str, token: &str, cancelled: F) -> Result<RoomSessionHandle>
    where
        F: Future<Output = ()>,
    {
        self.config.validate()?;

        let view = self
            .room_service
            .get_room(room_id, token)
            .await
            .map_err(|e| Error::from_room_lookup(room_id, e))?;
        let room = view.room;

        if room.status == RoomStatus::Ended {
            info!("Room {} already ended, not joining", room_id);
            return Err(Error::RoomEnded(room_id.to_string()));
        }
        let local_role = room.role_of(&self.ctx.user_id).ok_or_else(|| {
            Error::AuthRejected(format!("{} is not a member of room {}", self.ctx.user_id, room_id))
        })?;

        tokio::pin!(cancelled);

        let mut media = MediaController::new(Arc::clone(&self.device), self.config.media);
        let mut negotiator = Negotiator::new(Arc::clone(&self.peer_factory));
        {
            let stream = media.acquire_until(cancelled.as_mut()).await?;
            if let Err(e) = negotiator.bind_media(stream).await {
                media.release();
                return Err(e);
            }
        }

        let mut chat = ChatSubchannel::new(self.ctx.user_id.clone());
        match self.room_service.get_messages(room_id).await {
            Ok(history) => chat.load_history(history),
            Err(e) => warn!("Chat history unavailable for room {}: {}", room_id, e),
        }

        let join = JoinParams::new(room_id, token, &self.ctx);
        let timeout = self.config.connect_timeout();
        let connected = tokio::select! {
            result = tokio::time::timeout(timeout, self.connector.connect(&join)) => match result {
                Ok(connected) => connected,
                Err(_) => Err(Error::ConnectFailed(format!("signaling connect timed out after {:?}", timeout))),
            },
            _ = cancelled.as_mut() => Err(Error::Cancelled("join abandoned while connecting".to_string())),
        };
        let channel = match connected {
            Ok(channel) => channel,
            Err(e) => {
                warn!("Join failed while connecting signaling: {}", e);
                negotiator.close().await;
                media.release();
                return Err(e);
            }
        };

        let (snapshot_tx, snapshot_rx) =
            watch::channel(SessionSnapshot::new(room_id, local_role, room.status));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (commands, commands_rx) = mpsc::channel(COMMAND_CAPACITY);

        let session = RoomSession::new(
            SessionParts {
                ctx: self.ctx.clone(),
                config: self.config.clone(),
                room,
                local_role,
                join,
                room_service: Arc::clone(&self.room_service),
                connector: Arc::clone(&self.connector),
                media,
                negotiator,
                channel,
                chat,
            },
            snapshot_tx,
            events.clone(),
        );
        tokio::spawn(session.run(commands_rx));

        info!("Joined room {} as {:?}", room_id, local_role);
        Ok(RoomSessionHandle {
            room_id: room_id.to_string(),
            commands,
            snapshot: snapshot_rx,
            events,
        })
    }
}

/// Handle to a running room session
#[derive(Clone)]
pub struct RoomSessionHandle {
    room_id: String,
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<SessionSnapshot>,
    events: broadcast::Sender<SessionEvent>,
}

impl RoomSessionHandle {
    /// Room this session belongs to
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Host only: offer the call, now or as soon as the guest is present
    pub async fn start_call(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::StartCall(reply)).await?;
        rx.await.map_err(|_| session_gone())?
    }

    /// Send a chat line to the room
    pub async fn send_chat(&self, text: impl Into<String>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::SendChat(text.into(), reply)).await?;
        rx.await.map_err(|_| session_gone())?
    }

    /// Enable or disable the camera track without renegotiating
    pub async fn set_video_enabled(&self, enabled: bool) -> Result<()> {
        self.request(Command::SetVideo(enabled)).await
    }

    /// Enable or disable the microphone track without renegotiating
    pub async fn set_audio_enabled(&self, enabled: bool) -> Result<()> {
        self.request(Command::SetAudio(enabled)).await
    }

    /// Copy of the local chat log
    pub async fn chat_history(&self) -> Result<ChatLog> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::ChatHistory(reply)).await?;
        rx.await.map_err(|_| session_gone())
    }

    /// Leave the room; safe to call more than once
    pub async fn leave(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Leave(reply)).await.is_err() {
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }

    /// Current snapshot
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Watch snapshot changes
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    /// Subscribe to session events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    async fn request(&self, command: Command) -> Result<()> {
        self.commands.send(command).await.map_err(|_| session_gone())
    }
}

impl std::fmt::Debug for RoomSessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomSessionHandle")
            .field("room_id", &self.room_id)
            .field("phase", &self.snapshot.borrow().phase)
            .finish()
    }
}

fn session_gone() -> Error {
    Error::InvalidState("session has ended".to_string())
}
