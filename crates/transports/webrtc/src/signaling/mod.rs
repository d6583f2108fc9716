//! Signaling Transport
//!
//! One ordered, bidirectional channel per participant per room, carrying
//! [`SignalingMessage`]s. A [`SignalingConnector`] opens channels; the
//! coordinator owns reconnection, the channel never retries on its own.
//!
//! Disconnection is delivered as a final [`ChannelEvent::Closed`] on the
//! inbound stream. After that every `recv()` returns the same event, so a
//! consumption loop never hangs on a dead channel.

pub mod loopback;
pub mod protocol;
pub mod websocket;

pub use loopback::{LoopbackRelay, RelayRecord};
pub use protocol::{IceCandidate, SdpType, SessionDescription, SignalingMessage};
pub use websocket::WebSocketConnector;

use crate::Result;
use async_trait::async_trait;
use teleconsult_core::{ParticipantContext, UserRole};
use tokio::sync::mpsc;
use tracing::debug;

/// Parameters of a signaling connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinParams {
    /// Room to join
    pub room_id: String,
    /// Room-scoped join token
    pub token: String,
    /// Local user id
    pub user_id: String,
    /// Local platform role
    pub user_role: UserRole,
}

impl JoinParams {
    /// Join parameters for `ctx`
    pub fn new(room_id: impl Into<String>, token: impl Into<String>, ctx: &ParticipantContext) -> Self {
        Self {
            room_id: room_id.into(),
            token: token.into(),
            user_id: ctx.user_id.clone(),
            user_role: ctx.role,
        }
    }
}

/// Why a channel stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by the local side
    Local,
    /// Server refused or revoked admission; reconnecting will not help
    Rejected(String),
    /// Transport failure; reconnect may succeed
    Dropped(String),
}

impl CloseReason {
    /// Whether a reconnect attempt makes sense
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CloseReason::Dropped(_))
    }
}

/// Item of the inbound stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Decoded message
    Message(SignalingMessage),
    /// Terminal event; nothing follows
    Closed(CloseReason),
}

/// Open signaling channel
///
/// Built by a connector from an outbound queue and an inbound event queue.
/// Whatever sits behind those queues (socket tasks, an in-process relay) is
/// expected to push a `Closed` event when it goes away; a silently dropped
/// inbound queue is reported as `Closed(Dropped)`.
#[derive(Debug)]
pub struct SignalingChannel {
    outbound: Option<mpsc::UnboundedSender<SignalingMessage>>,
    inbound: mpsc::UnboundedReceiver<ChannelEvent>,
    closed: Option<CloseReason>,
}

impl SignalingChannel {
    /// Assemble a channel from its queues
    pub fn from_parts(
        outbound: mpsc::UnboundedSender<SignalingMessage>,
        inbound: mpsc::UnboundedReceiver<ChannelEvent>,
    ) -> Self {
        Self {
            outbound: Some(outbound),
            inbound,
            closed: None,
        }
    }

    /// Queue a message for delivery
    ///
    /// Best effort: returns `false` when the channel is already closed.
    pub fn send(&self, message: SignalingMessage) -> bool {
        match &self.outbound {
            Some(tx) => tx.send(message).is_ok(),
            None => {
                debug!("Dropping outbound {} on closed channel", message.kind());
                false
            }
        }
    }

    /// Next inbound event
    ///
    /// Once a `Closed` event has been observed it is returned again on every
    /// later call.
    pub async fn recv(&mut self) -> ChannelEvent {
        if let Some(reason) = &self.closed {
            return ChannelEvent::Closed(reason.clone());
        }

        let event = self.inbound.recv().await.unwrap_or_else(|| {
            ChannelEvent::Closed(CloseReason::Dropped("signaling stream ended".to_string()))
        });

        if let ChannelEvent::Closed(reason) = &event {
            self.closed = Some(reason.clone());
        }
        event
    }

    /// Close the channel; later calls are no-ops
    pub fn close(&mut self) {
        if self.outbound.take().is_some() {
            debug!("Signaling channel closed locally");
        }
        self.inbound.close();
        if self.closed.is_none() {
            self.closed = Some(CloseReason::Local);
        }
    }

    /// Whether a terminal event has been seen or `close()` was called
    pub fn is_closed(&self) -> bool {
        self.closed.is_some()
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        self.close();
    }
}

/// Opens signaling channels
#[async_trait]
pub trait SignalingConnector: Send + Sync {
    /// Connect to the room's relay
    ///
    /// Fails with [`Error::AuthRejected`](crate::Error::AuthRejected) when the
    /// token is refused and [`Error::ConnectFailed`](crate::Error::ConnectFailed)
    /// on transport failure.
    async fn connect(&self, params: &JoinParams) -> Result<SignalingChannel>;
}
