//! User-visible session state

use crate::chat::ChatEntry;
use crate::media::TrackKind;
use crate::peer::NegotiationState;
use serde::Serialize;
use std::fmt;
use teleconsult_core::{ChatMessage, ParticipantRole, RoomStatus};

/// Call phase shown to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum CallPhase {
    /// Fetching the room, opening devices, connecting
    Joining,
    /// In the room, the other participant is not (or the host asked to call before they arrived)
    WaitingForParticipant,
    /// Both present; the host may start the call, the guest waits for the offer
    Ready,
    /// Offer/answer exchange in progress
    Connecting,
    /// Media connected
    InCall,
    /// Signaling dropped; reconnect attempt `attempt` pending
    Reconnecting {
        /// 1-based attempt number
        attempt: u32,
    },
    /// Reconnect attempts exhausted or the media link failed
    ConnectionLost,
    /// Session over
    Ended,
}

impl CallPhase {
    /// No further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallPhase::Ended)
    }
}

impl fmt::Display for CallPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallPhase::Joining => f.write_str("joining"),
            CallPhase::WaitingForParticipant => f.write_str("waiting for participant"),
            CallPhase::Ready => f.write_str("ready"),
            CallPhase::Connecting => f.write_str("connecting"),
            CallPhase::InCall => f.write_str("in call"),
            CallPhase::Reconnecting { attempt } => write!(f, "connection lost, retrying ({})", attempt),
            CallPhase::ConnectionLost => f.write_str("connection lost"),
            CallPhase::Ended => f.write_str("call ended"),
        }
    }
}

/// What we know about the other participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    /// Not known since the last (re)connect
    Unknown,
    /// Connected to the relay
    Present,
    /// Left the relay
    Absent,
}

/// Snapshot published on every change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// Room id
    pub room_id: String,
    /// Local role in the room
    pub local_role: ParticipantRole,
    /// Call phase
    pub phase: CallPhase,
    /// Negotiator state
    pub negotiation: NegotiationState,
    /// Other participant's presence
    pub remote_presence: Presence,
    /// Camera toggle
    pub video_enabled: bool,
    /// Microphone toggle
    pub audio_enabled: bool,
    /// Cached room status
    pub room_status: RoomStatus,
    /// Last error surfaced to the user
    pub last_error: Option<String>,
}

impl SessionSnapshot {
    pub(crate) fn new(room_id: &str, local_role: ParticipantRole, room_status: RoomStatus) -> Self {
        Self {
            room_id: room_id.to_string(),
            local_role,
            phase: CallPhase::Joining,
            negotiation: NegotiationState::Idle,
            remote_presence: Presence::Unknown,
            video_enabled: true,
            audio_enabled: true,
            room_status,
            last_error: None,
        }
    }
}

/// Discrete session events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Chat line from anyone else
    ChatReceived(ChatMessage),
    /// Our own line confirmed by the relay
    ChatDelivered(ChatMessage),
    /// Other participant connected to the relay
    PresenceJoined(String),
    /// Other participant left the relay
    PresenceLeft(String),
    /// Remote media arrived
    RemoteTrack {
        /// Audio or video
        kind: TrackKind,
        /// Remote track id
        id: String,
    },
    /// Media connected
    CallConnected,
    /// Media path regressed
    Degraded,
    /// Media path recovered
    Recovered,
    /// Error surfaced to the user
    Error(String),
}

/// Chat log copy handed out by the session handle
pub type ChatLog = Vec<ChatEntry>;
