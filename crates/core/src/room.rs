//! Room record and status rules
//!
//! The Room Service owns rooms; clients hold a read-mostly cached copy that is
//! refreshed on join and on explicit status updates. Status only ever moves
//! forward: `scheduled | emergency_pending -> active -> ended`.

use crate::identity::ParticipantRole;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of encounter a room was created for
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomType {
    /// Follow-up on a consultation request
    #[default]
    Consultation,
    /// Booked appointment
    Appointment,
    /// Patient-initiated emergency room; skips the scheduled state
    Emergency,
}

impl RoomType {
    /// Whether this room takes the emergency fast-path
    pub fn is_emergency(&self) -> bool {
        matches!(self, RoomType::Emergency)
    }
}

/// Authoritative room status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomStatus {
    /// Created, call not started yet
    Scheduled,
    /// Emergency room waiting for the assigned doctor
    EmergencyPending,
    /// Media session established
    Active,
    /// Finished; the room is immutable from here on
    Ended,
}

impl RoomStatus {
    /// Position in the forward-only lifecycle
    fn rank(&self) -> u8 {
        match self {
            RoomStatus::Scheduled | RoomStatus::EmergencyPending => 0,
            RoomStatus::Active => 1,
            RoomStatus::Ended => 2,
        }
    }

    /// Whether moving to `next` goes strictly forward
    pub fn can_transition_to(&self, next: RoomStatus) -> bool {
        next.rank() > self.rank()
    }

    /// Whether no further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, RoomStatus::Ended)
    }

    /// Whether a host may start (or restart, after rejoining) the call
    ///
    /// `emergency_pending` is treated exactly like `scheduled`.
    pub fn allows_call_start(&self) -> bool {
        !self.is_terminal()
    }

    /// Wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            RoomStatus::Scheduled => "scheduled",
            RoomStatus::EmergencyPending => "emergency_pending",
            RoomStatus::Active => "active",
            RoomStatus::Ended => "ended",
        }
    }
}

impl fmt::Display for RoomStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Room record as stored by the Room Service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomRecord {
    /// Room id
    pub id: String,

    /// Room-scoped join token (only returned to members)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// User id of the host
    pub host_id: String,

    /// User id of the invited participant
    pub participant_id: String,

    /// Linked consultation, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consultation_id: Option<String>,

    /// Linked appointment, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub appointment_id: Option<String>,

    /// Encounter kind
    #[serde(default)]
    pub room_type: RoomType,

    /// Scheduled duration in minutes
    #[serde(default)]
    pub duration_minutes: u32,

    /// Scheduled start, as sent by the creator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_start: Option<String>,

    /// Current status
    pub status: RoomStatus,

    /// Priority marker (`high` for emergency rooms)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,

    /// Creation time; the base for the actual-duration computation
    pub created_at: DateTime<Utc>,

    /// Last update time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,

    /// When the room went `active`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// When the room went `ended`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,

    /// Actual duration in whole minutes, set when the room ends
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_duration: Option<u32>,

    /// Recording reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recording_url: Option<String>,

    /// Free-text summary written after the call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl RoomRecord {
    /// Role of `user_id` in this room, if it is a member at all
    pub fn role_of(&self, user_id: &str) -> Option<ParticipantRole> {
        if self.host_id == user_id {
            Some(ParticipantRole::Host)
        } else if self.participant_id == user_id {
            Some(ParticipantRole::Guest)
        } else {
            None
        }
    }

    /// The other member's user id, as seen from `user_id`
    pub fn counterpart_of(&self, user_id: &str) -> Option<&str> {
        match self.role_of(user_id)? {
            ParticipantRole::Host => Some(&self.participant_id),
            ParticipantRole::Guest => Some(&self.host_id),
        }
    }

    /// Move the cached status forward
    ///
    /// Returns `false` (and leaves the record untouched) when `next` would not
    /// be a forward transition; the cache never regresses.
    pub fn advance_status(&mut self, next: RoomStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        true
    }

    /// Relative join URL for this room
    pub fn join_url(&self) -> Option<String> {
        self.token
            .as_ref()
            .map(|token| format!("/video/room/{}?token={}", self.id, token))
    }
}

/// Room record as seen by one member
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomView {
    /// Room record
    pub room: RoomRecord,

    /// Host e-mail
    #[serde(default)]
    pub host_email: Option<String>,

    /// Participant e-mail
    #[serde(default)]
    pub participant_email: Option<String>,

    /// Whether the caller is the host
    pub is_host: bool,
}

impl RoomView {
    /// Local participant role derived from `is_host`
    pub fn local_role(&self) -> ParticipantRole {
        if self.is_host {
            ParticipantRole::Host
        } else {
            ParticipantRole::Guest
        }
    }
}

/// Whole minutes between room creation and `now`, rounded to nearest
///
/// Clock skew that puts `now` before `created_at` yields 0.
pub fn elapsed_minutes(created_at: DateTime<Utc>, now: DateTime<Utc>) -> u32 {
    let millis = (now - created_at).num_milliseconds().max(0);
    (millis as f64 / 60_000.0).round() as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(status: RoomStatus) -> RoomRecord {
        RoomRecord {
            id: "room-1".to_string(),
            token: Some("tok".to_string()),
            host_id: "doc-1".to_string(),
            participant_id: "pat-1".to_string(),
            consultation_id: None,
            appointment_id: None,
            room_type: RoomType::Consultation,
            duration_minutes: 30,
            scheduled_start: None,
            status,
            priority: None,
            created_at: Utc::now(),
            updated_at: None,
            started_at: None,
            ended_at: None,
            actual_duration: None,
            recording_url: None,
            summary: None,
        }
    }

    #[test]
    fn test_status_is_monotonic() {
        assert!(RoomStatus::Scheduled.can_transition_to(RoomStatus::Active));
        assert!(RoomStatus::EmergencyPending.can_transition_to(RoomStatus::Active));
        assert!(RoomStatus::Active.can_transition_to(RoomStatus::Ended));
        assert!(RoomStatus::Scheduled.can_transition_to(RoomStatus::Ended));

        assert!(!RoomStatus::Active.can_transition_to(RoomStatus::Scheduled));
        assert!(!RoomStatus::Ended.can_transition_to(RoomStatus::Active));
        assert!(!RoomStatus::Active.can_transition_to(RoomStatus::Active));
        assert!(!RoomStatus::Scheduled.can_transition_to(RoomStatus::EmergencyPending));
    }

    #[test]
    fn test_emergency_pending_allows_call_start() {
        assert!(RoomStatus::EmergencyPending.allows_call_start());
        assert!(RoomStatus::Scheduled.allows_call_start());
        assert!(!RoomStatus::Ended.allows_call_start());
    }

    #[test]
    fn test_advance_status_never_regresses() {
        let mut room = record(RoomStatus::Active);
        assert!(!room.advance_status(RoomStatus::Scheduled));
        assert_eq!(room.status, RoomStatus::Active);

        assert!(room.advance_status(RoomStatus::Ended));
        assert_eq!(room.status, RoomStatus::Ended);
        assert!(!room.advance_status(RoomStatus::Active));
    }

    #[test]
    fn test_role_of() {
        let room = record(RoomStatus::Scheduled);
        assert_eq!(room.role_of("doc-1"), Some(ParticipantRole::Host));
        assert_eq!(room.role_of("pat-1"), Some(ParticipantRole::Guest));
        assert_eq!(room.role_of("stranger"), None);
        assert_eq!(room.counterpart_of("pat-1"), Some("doc-1"));
    }

    #[test]
    fn test_join_url() {
        let room = record(RoomStatus::Scheduled);
        assert_eq!(room.join_url().as_deref(), Some("/video/room/room-1?token=tok"));
    }

    #[test]
    fn test_elapsed_minutes_rounds_to_nearest() {
        let start = Utc::now();
        assert_eq!(elapsed_minutes(start, start + Duration::seconds(29)), 0);
        assert_eq!(elapsed_minutes(start, start + Duration::seconds(30)), 1);
        assert_eq!(elapsed_minutes(start, start + Duration::seconds(89)), 1);
        assert_eq!(elapsed_minutes(start, start + Duration::minutes(42)), 42);
        assert_eq!(elapsed_minutes(start, start - Duration::minutes(5)), 0);
    }

    #[test]
    fn test_record_parses_service_payload() {
        let json = r#"{
            "id": "r-9",
            "token": "abc",
            "host_id": "p-1",
            "participant_id": "d-1",
            "room_type": "emergency",
            "duration_minutes": 60,
            "status": "emergency_pending",
            "priority": "high",
            "created_at": "2024-05-01T10:00:00.123456+00:00",
            "updated_at": "2024-05-01T10:00:00.123456+00:00"
        }"#;

        let room: RoomRecord = serde_json::from_str(json).unwrap();
        assert_eq!(room.room_type, RoomType::Emergency);
        assert_eq!(room.status, RoomStatus::EmergencyPending);
        assert_eq!(room.priority.as_deref(), Some("high"));
        assert!(room.consultation_id.is_none());
    }
}
