//! Room Service contract
//!
//! The Room Service is the authority for rooms: it creates them, issues join
//! tokens, validates signaling connections, persists status, chat history and
//! recordings. This module defines the narrow contract a participant's session
//! needs from it; [`http::HttpRoomService`] talks to the real REST API and
//! [`memory::InMemoryRoomService`] keeps everything in process.
//!
//! Every client is scoped to one caller ([`crate::ParticipantContext`]), so no
//! operation takes an implicit "current user".

pub mod http;
pub mod memory;

use crate::chat::ChatMessage;
use crate::room::{RoomRecord, RoomStatus, RoomType, RoomView};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Parameters for creating a room (caller becomes host)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateRoomRequest {
    /// User id of the invited participant
    pub participant_id: String,

    /// Encounter kind
    pub room_type: RoomType,

    /// Scheduled duration in minutes
    pub duration_minutes: u32,

    /// Optional scheduled start
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_start: Option<String>,

    /// Linked consultation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consultation_id: Option<String>,

    /// Linked appointment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub appointment_id: Option<String>,
}

impl CreateRoomRequest {
    /// Consultation room for `participant_id` with the default 30 minute slot
    pub fn new(participant_id: impl Into<String>) -> Self {
        Self {
            participant_id: participant_id.into(),
            room_type: RoomType::Consultation,
            duration_minutes: 30,
            scheduled_start: None,
            consultation_id: None,
            appointment_id: None,
        }
    }

    /// Set the room type
    pub fn room_type(mut self, room_type: RoomType) -> Self {
        self.room_type = room_type;
        self
    }

    /// Set the scheduled duration
    pub fn duration_minutes(mut self, minutes: u32) -> Self {
        self.duration_minutes = minutes;
        self
    }

    /// Set the scheduled start
    pub fn scheduled_start(mut self, start: impl Into<String>) -> Self {
        self.scheduled_start = Some(start.into());
        self
    }
}

/// Status change sent to the Room Service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    /// Target status
    pub status: RoomStatus,

    /// Actual duration in whole minutes (sent with `ended`)
    #[serde(
        rename = "actual_duration",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub actual_duration_minutes: Option<u32>,

    /// Recording reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recording_url: Option<String>,

    /// Post-call summary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl StatusUpdate {
    /// Room became active
    pub fn active() -> Self {
        Self {
            status: RoomStatus::Active,
            actual_duration_minutes: None,
            recording_url: None,
            summary: None,
        }
    }

    /// Room ended after `minutes`
    pub fn ended(minutes: u32) -> Self {
        Self {
            status: RoomStatus::Ended,
            actual_duration_minutes: Some(minutes),
            recording_url: None,
            summary: None,
        }
    }
}

/// Emergency room together with the assigned doctor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencyRoom {
    /// Created room (`status = emergency_pending`)
    pub room: RoomRecord,

    /// Display name of the assigned doctor
    #[serde(default)]
    pub doctor_name: Option<String>,

    /// Relative join URL
    pub join_url: String,
}

/// Recording availability
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recording {
    /// Whether a recording exists
    pub available: bool,

    /// Recording location
    #[serde(default, rename = "recording_url", skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Invitation produced for the participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomInvite {
    /// Room id
    pub room_id: String,

    /// Relative join URL
    pub join_url: String,
}

/// Filter for listing the caller's rooms
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomListFilter {
    /// Only rooms with this status
    pub status: Option<RoomStatus>,

    /// Maximum number of rooms (default: 20)
    pub limit: usize,
}

impl Default for RoomListFilter {
    fn default() -> Self {
        Self {
            status: None,
            limit: 20,
        }
    }
}

/// Video usage statistics (platform-wide for admins, own rooms otherwise)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageStats {
    /// Rooms counted
    pub total_sessions: u64,

    /// Rooms that ended
    pub completed_sessions: u64,

    /// Emergency rooms
    pub emergency_sessions: u64,

    /// Average actual duration of ended rooms, two decimals
    pub avg_duration_minutes: f64,
}

/// Room Service operations needed by a video session
#[async_trait]
pub trait RoomService: Send + Sync {
    /// Create a room hosted by the caller
    async fn create_room(&self, request: CreateRoomRequest) -> Result<RoomRecord>;

    /// Fetch the authoritative room record, validating the join token
    async fn get_room(&self, room_id: &str, token: &str) -> Result<RoomView>;

    /// Move the room to a new status
    async fn update_room_status(&self, room_id: &str, update: StatusUpdate) -> Result<RoomRecord>;

    /// Create an emergency room for `patient_id` (must be the caller)
    async fn create_emergency_room(&self, patient_id: &str) -> Result<EmergencyRoom>;

    /// Chat history, oldest first
    async fn get_messages(&self, room_id: &str) -> Result<Vec<ChatMessage>>;

    /// Recording availability
    async fn get_recording(&self, room_id: &str) -> Result<Recording>;

    /// Rooms the caller hosts or participates in, newest first
    async fn list_rooms(&self, filter: RoomListFilter) -> Result<Vec<RoomView>>;

    /// Produce an invitation for the room's participant (host only)
    async fn send_invite(&self, room_id: &str, message: Option<String>) -> Result<RoomInvite>;

    /// Usage statistics visible to the caller
    async fn usage_stats(&self) -> Result<UsageStats>;
}
