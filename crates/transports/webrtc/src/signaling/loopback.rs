//! In-process signaling relay
//!
//! Runs the relay side of the signaling protocol without a network:
//! admission is checked against an [`InMemoryRoomService`], negotiation
//! messages go to everyone in the room except the sender, chat goes to
//! everyone (sender included) and is persisted to the room's history, and
//! presence events are emitted on join and leave.
//!
//! A newcomer is also told about every participant already present, so a
//! reconnecting session always sees a fresh `user_joined` for its peer.

use super::{ChannelEvent, CloseReason, JoinParams, SignalingChannel, SignalingConnector, SignalingMessage};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use teleconsult_core::{ChatMessage, InMemoryRoomService, UserRole};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

type ConnId = u64;

struct Member {
    conn_id: ConnId,
    role: UserRole,
    tx: mpsc::UnboundedSender<ChannelEvent>,
}

/// One message accepted from a participant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayRecord {
    /// Room the message was sent in
    pub room_id: String,
    /// Sending user
    pub from: String,
    /// Message as sent by the client
    pub message: SignalingMessage,
}

#[derive(Default)]
struct RelayState {
    rooms: HashMap<String, HashMap<String, Member>>,
    log: Vec<RelayRecord>,
    next_conn_id: ConnId,
}

impl RelayState {
    fn broadcast(&self, room_id: &str, except: Option<&str>, message: &SignalingMessage) {
        let Some(members) = self.rooms.get(room_id) else {
            return;
        };
        for (user_id, member) in members {
            if Some(user_id.as_str()) == except {
                continue;
            }
            let _ = member.tx.send(ChannelEvent::Message(message.clone()));
        }
    }

    fn is_current(&self, room_id: &str, user_id: &str, conn_id: ConnId) -> bool {
        self.rooms
            .get(room_id)
            .and_then(|members| members.get(user_id))
            .is_some_and(|m| m.conn_id == conn_id)
    }

    /// Remove `user_id` if `conn_id` is still its live connection
    fn remove(&mut self, room_id: &str, user_id: &str, conn_id: Option<ConnId>) -> Option<Member> {
        let members = self.rooms.get_mut(room_id)?;
        if conn_id.is_some_and(|id| members.get(user_id).map(|m| m.conn_id) != Some(id)) {
            return None;
        }
        let member = members.remove(user_id)?;
        if members.is_empty() {
            self.rooms.remove(room_id);
        }

        self.broadcast(
            room_id,
            None,
            &SignalingMessage::PresenceLeft {
                user_id: user_id.to_string(),
                timestamp: Some(relay_timestamp(Utc::now())),
            },
        );
        Some(member)
    }
}

/// Relay time format: naive ISO-8601 with microseconds
fn relay_timestamp(at: DateTime<Utc>) -> String {
    at.naive_utc().format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

/// In-process relay usable as a [`SignalingConnector`]
#[derive(Clone)]
pub struct LoopbackRelay {
    rooms: InMemoryRoomService,
    state: Arc<Mutex<RelayState>>,
}

impl LoopbackRelay {
    /// Relay admitting participants of `rooms`
    pub fn new(rooms: InMemoryRoomService) -> Self {
        Self {
            rooms,
            state: Arc::new(Mutex::new(RelayState::default())),
        }
    }

    /// Room Service backing admission and chat history
    pub fn room_service(&self) -> &InMemoryRoomService {
        &self.rooms
    }

    /// Drop a participant's channel as if the transport failed
    ///
    /// Returns `false` when the participant is not connected.
    pub fn disconnect(&self, room_id: &str, user_id: &str) -> bool {
        let mut state = self.state.lock();
        match state.remove(room_id, user_id, None) {
            Some(member) => {
                info!("Relay dropping {} from room {}", user_id, room_id);
                let _ = member.tx.send(ChannelEvent::Closed(CloseReason::Dropped(
                    "relay connection reset".to_string(),
                )));
                true
            }
            None => false,
        }
    }

    /// Users currently connected to `room_id`, sorted
    pub fn members(&self, room_id: &str) -> Vec<String> {
        let state = self.state.lock();
        let mut members: Vec<String> = state
            .rooms
            .get(room_id)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    /// Every message accepted from participants, in order
    pub fn traffic(&self) -> Vec<RelayRecord> {
        self.state.lock().log.clone()
    }

    /// Number of accepted messages of wire type `kind` in `room_id`
    pub fn count(&self, room_id: &str, kind: &str) -> usize {
        self.state
            .lock()
            .log
            .iter()
            .filter(|r| r.room_id == room_id && r.message.kind() == kind)
            .count()
    }

    fn route(&self, room_id: &str, from: &str, conn_id: ConnId, message: SignalingMessage) {
        let mut state = self.state.lock();
        if !state.is_current(room_id, from, conn_id) {
            debug!("Discarding {} from stale connection of {}", message.kind(), from);
            return;
        }

        state.log.push(RelayRecord {
            room_id: room_id.to_string(),
            from: from.to_string(),
            message: message.clone(),
        });

        match message {
            SignalingMessage::Offer { .. }
            | SignalingMessage::Answer { .. }
            | SignalingMessage::IceCandidate { .. } => {
                state.broadcast(room_id, Some(from), &message.stamped(from));
            }
            SignalingMessage::Chat { message: text, .. } => {
                let stored = self.rooms.record_message(room_id, ChatMessage::new(from, text));
                let relayed = SignalingMessage::Chat {
                    message: stored.text,
                    from: Some(from.to_string()),
                    timestamp: Some(relay_timestamp(stored.timestamp)),
                    from_email: stored.sender_email,
                };
                state.broadcast(room_id, None, &relayed);
            }
            SignalingMessage::PresenceJoined { .. } | SignalingMessage::PresenceLeft { .. } => {
                debug!("Ignoring client-sent {} from {}", message.kind(), from);
            }
        }
    }

    async fn forward(
        self,
        room_id: String,
        user_id: String,
        conn_id: ConnId,
        mut rx: mpsc::UnboundedReceiver<SignalingMessage>,
    ) {
        while let Some(message) = rx.recv().await {
            self.route(&room_id, &user_id, conn_id, message);
        }

        if self.state.lock().remove(&room_id, &user_id, Some(conn_id)).is_some() {
            info!("{} left room {}", user_id, room_id);
        }
    }
}

#[async_trait]
impl SignalingConnector for LoopbackRelay {
    #[instrument(skip(self, params), fields(room_id = %params.room_id, user_id = %params.user_id))]
    async fn connect(&self, params: &JoinParams) -> Result<SignalingChannel> {
        self.rooms
            .authorize_join(&params.room_id, &params.token, &params.user_id)
            .map_err(|e| Error::AuthRejected(e.to_string()))?;

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        let conn_id = {
            let mut state = self.state.lock();
            state.next_conn_id += 1;
            let conn_id = state.next_conn_id;

            if let Some(old) = state
                .rooms
                .get_mut(&params.room_id)
                .and_then(|members| members.remove(&params.user_id))
            {
                warn!("{} reconnected, dropping previous connection", params.user_id);
                let _ = old.tx.send(ChannelEvent::Closed(CloseReason::Dropped(
                    "replaced by a newer connection".to_string(),
                )));
            }

            let now = relay_timestamp(Utc::now());
            state.broadcast(
                &params.room_id,
                None,
                &SignalingMessage::PresenceJoined {
                    user_id: params.user_id.clone(),
                    user_role: Some(params.user_role),
                    timestamp: Some(now.clone()),
                },
            );

            let members = state.rooms.entry(params.room_id.clone()).or_default();
            for (user_id, member) in members.iter() {
                let _ = in_tx.send(ChannelEvent::Message(SignalingMessage::PresenceJoined {
                    user_id: user_id.clone(),
                    user_role: Some(member.role),
                    timestamp: Some(now.clone()),
                }));
            }
            members.insert(
                params.user_id.clone(),
                Member {
                    conn_id,
                    role: params.user_role,
                    tx: in_tx,
                },
            );
            conn_id
        };

        info!("{} joined room {} on relay", params.user_id, params.room_id);
        tokio::spawn(self.clone().forward(
            params.room_id.clone(),
            params.user_id.clone(),
            conn_id,
            out_rx,
        ));

        Ok(SignalingChannel::from_parts(out_tx, in_rx))
    }
}
