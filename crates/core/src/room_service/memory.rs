//! In-process Room Service
//!
//! [`InMemoryRoomService`] is the shared store; callers talk to it through an
//! [`InMemoryRoomClient`] obtained with [`InMemoryRoomService::client_for`], so
//! the access rules (membership, host-only invites, patient-only emergency
//! rooms) are applied per caller exactly as the HTTP service applies them.
//!
//! The store also exposes hooks the loopback signaling relay and tests use:
//! token validation, chat persistence, a log of accepted status updates and
//! injectable status-update failures.

use super::{
    CreateRoomRequest, EmergencyRoom, Recording, RoomInvite, RoomListFilter, RoomService,
    StatusUpdate, UsageStats,
};
use crate::chat::ChatMessage;
use crate::identity::{ParticipantContext, ParticipantRole, UserRole};
use crate::room::{RoomRecord, RoomStatus, RoomType, RoomView};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct UserEntry {
    role: UserRole,
    email: Option<String>,
}

#[derive(Default)]
struct Store {
    /// Rooms in creation order
    rooms: Vec<RoomRecord>,
    users: HashMap<String, UserEntry>,
    /// On-call doctors as (user id, display name)
    emergency_doctors: Vec<(String, String)>,
    messages: HashMap<String, Vec<ChatMessage>>,
    status_log: Vec<(String, StatusUpdate)>,
    /// Every status update received, including rejected ones
    status_attempts: Vec<(String, StatusUpdate)>,
    failing_status_updates: u32,
}

impl Store {
    fn room(&self, room_id: &str) -> Result<&RoomRecord> {
        self.rooms
            .iter()
            .find(|r| r.id == room_id)
            .ok_or_else(|| Error::NotFound(room_id.to_string()))
    }

    fn room_mut(&mut self, room_id: &str) -> Result<&mut RoomRecord> {
        self.rooms
            .iter_mut()
            .find(|r| r.id == room_id)
            .ok_or_else(|| Error::NotFound(room_id.to_string()))
    }

    fn email_of(&self, user_id: &str) -> Option<String> {
        self.users.get(user_id).and_then(|u| u.email.clone())
    }

    fn view(&self, room: &RoomRecord, caller: &str) -> RoomView {
        RoomView {
            room: room.clone(),
            host_email: self.email_of(&room.host_id),
            participant_email: self.email_of(&room.participant_id),
            is_host: room.host_id == caller,
        }
    }
}

/// Shared in-memory Room Service store
#[derive(Clone, Default)]
pub struct InMemoryRoomService {
    store: Arc<Mutex<Store>>,
}

impl InMemoryRoomService {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Client acting on behalf of `caller`
    ///
    /// The caller is registered as a user as a side effect.
    pub fn client_for(&self, caller: ParticipantContext) -> InMemoryRoomClient {
        self.register_user(&caller);
        InMemoryRoomClient {
            service: self.clone(),
            caller,
        }
    }

    /// Record a user's role and e-mail
    pub fn register_user(&self, ctx: &ParticipantContext) {
        let mut store = self.store.lock();
        let entry = store.users.entry(ctx.user_id.clone()).or_insert(UserEntry {
            role: ctx.role,
            email: None,
        });
        entry.role = ctx.role;
        if ctx.email.is_some() {
            entry.email = ctx.email.clone();
        }
    }

    /// Make a doctor available for emergency assignment
    pub fn register_emergency_doctor(&self, doctor_id: impl Into<String>, name: impl Into<String>) {
        let doctor_id = doctor_id.into();
        let mut store = self.store.lock();
        store.users.entry(doctor_id.clone()).or_insert(UserEntry {
            role: UserRole::Doctor,
            email: None,
        });
        store.emergency_doctors.push((doctor_id, name.into()));
    }

    /// Current record for `room_id`
    pub fn room(&self, room_id: &str) -> Option<RoomRecord> {
        self.store.lock().room(room_id).ok().cloned()
    }

    /// Validate a signaling join: room exists, token matches, user is a member
    pub fn authorize_join(&self, room_id: &str, token: &str, user_id: &str) -> Result<RoomRecord> {
        let store = self.store.lock();
        let room = store.room(room_id)?;
        if room.token.as_deref() != Some(token) {
            return Err(Error::InvalidToken(format!("token mismatch for room {}", room_id)));
        }
        if room.role_of(user_id).is_none() {
            return Err(Error::InvalidToken(format!(
                "{} is not a member of room {}",
                user_id, room_id
            )));
        }
        Ok(room.clone())
    }

    /// Persist a relayed chat message, assigning id, timestamp and sender e-mail
    pub fn record_message(&self, room_id: &str, mut message: ChatMessage) -> ChatMessage {
        let mut store = self.store.lock();
        message.id = Some(Uuid::new_v4().to_string());
        message.timestamp = Utc::now();
        if message.sender_email.is_none() {
            message.sender_email = store.email_of(&message.sender_id);
        }
        store
            .messages
            .entry(room_id.to_string())
            .or_default()
            .push(message.clone());
        message
    }

    /// Attach a recording reference to a room
    pub fn set_recording(&self, room_id: &str, url: impl Into<String>) -> Result<()> {
        let mut store = self.store.lock();
        store.room_mut(room_id)?.recording_url = Some(url.into());
        Ok(())
    }

    /// Status updates accepted so far, in order
    pub fn status_updates(&self) -> Vec<(String, StatusUpdate)> {
        self.store.lock().status_log.clone()
    }

    /// Status updates received so far, including failed and rejected ones
    pub fn status_attempts(&self) -> Vec<(String, StatusUpdate)> {
        self.store.lock().status_attempts.clone()
    }

    /// Make the next `count` status updates fail with HTTP 503
    pub fn fail_status_updates(&self, count: u32) {
        self.store.lock().failing_status_updates = count;
    }
}

/// [`RoomService`] view of an [`InMemoryRoomService`] for one caller
#[derive(Clone)]
pub struct InMemoryRoomClient {
    service: InMemoryRoomService,
    caller: ParticipantContext,
}

impl InMemoryRoomClient {
    /// Caller identity this client acts for
    pub fn caller(&self) -> &ParticipantContext {
        &self.caller
    }

    /// Underlying shared store
    pub fn service(&self) -> &InMemoryRoomService {
        &self.service
    }

    fn require_member(&self, room: &RoomRecord) -> Result<ParticipantRole> {
        room.role_of(&self.caller.user_id).ok_or_else(|| {
            Error::Unauthorized(format!(
                "{} is not a member of room {}",
                self.caller.user_id, room.id
            ))
        })
    }
}

#[async_trait]
impl RoomService for InMemoryRoomClient {
    async fn create_room(&self, request: CreateRoomRequest) -> Result<RoomRecord> {
        if request.participant_id.is_empty() {
            return Err(Error::InvalidRequest("participant_id is empty".to_string()));
        }
        if request.participant_id == self.caller.user_id {
            return Err(Error::InvalidRequest(
                "host and participant must differ".to_string(),
            ));
        }

        let now = Utc::now();
        let room = RoomRecord {
            id: Uuid::new_v4().to_string(),
            token: Some(Uuid::new_v4().simple().to_string()),
            host_id: self.caller.user_id.clone(),
            participant_id: request.participant_id,
            consultation_id: request.consultation_id,
            appointment_id: request.appointment_id,
            room_type: request.room_type,
            duration_minutes: request.duration_minutes,
            scheduled_start: request.scheduled_start,
            status: RoomStatus::Scheduled,
            priority: None,
            created_at: now,
            updated_at: Some(now),
            started_at: None,
            ended_at: None,
            actual_duration: None,
            recording_url: None,
            summary: None,
        };

        info!("Created room {} ({} -> {})", room.id, room.host_id, room.participant_id);
        self.service.store.lock().rooms.push(room.clone());
        Ok(room)
    }

    async fn get_room(&self, room_id: &str, token: &str) -> Result<RoomView> {
        let store = self.service.store.lock();
        let room = store.room(room_id)?;
        if room.token.as_deref() != Some(token) || room.role_of(&self.caller.user_id).is_none() {
            return Err(Error::InvalidToken(format!("access denied to room {}", room_id)));
        }
        Ok(store.view(room, &self.caller.user_id))
    }

    async fn update_room_status(&self, room_id: &str, update: StatusUpdate) -> Result<RoomRecord> {
        let mut store = self.service.store.lock();
        store
            .status_attempts
            .push((room_id.to_string(), update.clone()));
        if store.failing_status_updates > 0 {
            store.failing_status_updates -= 1;
            warn!("Injected status update failure for room {}", room_id);
            return Err(Error::ServerError {
                status: 503,
                body: "injected failure".to_string(),
            });
        }

        let room = store.room(room_id)?;
        self.require_member(room)?;
        if !room.status.can_transition_to(update.status) {
            return Err(Error::InvalidTransition {
                from: room.status,
                to: update.status,
            });
        }

        let now = Utc::now();
        let room = store.room_mut(room_id)?;
        room.status = update.status;
        room.updated_at = Some(now);
        match update.status {
            RoomStatus::Active => room.started_at = Some(now),
            RoomStatus::Ended => room.ended_at = Some(now),
            _ => {}
        }
        if let Some(minutes) = update.actual_duration_minutes {
            room.actual_duration = Some(minutes);
        }
        if update.recording_url.is_some() {
            room.recording_url = update.recording_url.clone();
        }
        if update.summary.is_some() {
            room.summary = update.summary.clone();
        }

        let room = room.clone();
        debug!("Room {} is now {}", room_id, room.status);
        store.status_log.push((room_id.to_string(), update));
        Ok(room)
    }

    async fn create_emergency_room(&self, patient_id: &str) -> Result<EmergencyRoom> {
        if self.caller.role != UserRole::Patient || patient_id != self.caller.user_id {
            return Err(Error::Unauthorized(
                "only patients can create emergency rooms for themselves".to_string(),
            ));
        }

        let mut store = self.service.store.lock();
        let (doctor_id, doctor_name) = store
            .emergency_doctors
            .first()
            .cloned()
            .ok_or(Error::NoDoctorAvailable)?;

        let now = Utc::now();
        let room = RoomRecord {
            id: Uuid::new_v4().to_string(),
            token: Some(Uuid::new_v4().simple().to_string()),
            host_id: patient_id.to_string(),
            participant_id: doctor_id,
            consultation_id: None,
            appointment_id: None,
            room_type: RoomType::Emergency,
            duration_minutes: 60,
            scheduled_start: None,
            status: RoomStatus::EmergencyPending,
            priority: Some("high".to_string()),
            created_at: now,
            updated_at: Some(now),
            started_at: None,
            ended_at: None,
            actual_duration: None,
            recording_url: None,
            summary: None,
        };

        warn!("Emergency room {} created for patient {}", room.id, patient_id);
        store.rooms.push(room.clone());
        let join_url = room.join_url().unwrap_or_default();
        Ok(EmergencyRoom {
            room,
            doctor_name: Some(doctor_name),
            join_url,
        })
    }

    async fn get_messages(&self, room_id: &str) -> Result<Vec<ChatMessage>> {
        let store = self.service.store.lock();
        self.require_member(store.room(room_id)?)?;
        let mut messages = store.messages.get(room_id).cloned().unwrap_or_default();
        messages.sort_by_key(|m| m.timestamp);
        Ok(messages)
    }

    async fn get_recording(&self, room_id: &str) -> Result<Recording> {
        let store = self.service.store.lock();
        let room = store.room(room_id)?;
        self.require_member(room)?;
        Ok(Recording {
            available: room.recording_url.is_some(),
            url: room.recording_url.clone(),
        })
    }

    async fn list_rooms(&self, filter: RoomListFilter) -> Result<Vec<RoomView>> {
        let store = self.service.store.lock();
        let caller = &self.caller.user_id;
        Ok(store
            .rooms
            .iter()
            .rev()
            .filter(|r| r.role_of(caller).is_some())
            .filter(|r| filter.status.map_or(true, |s| r.status == s))
            .take(filter.limit)
            .map(|r| store.view(r, caller))
            .collect())
    }

    async fn send_invite(&self, room_id: &str, message: Option<String>) -> Result<RoomInvite> {
        let store = self.service.store.lock();
        let room = store.room(room_id)?;
        if self.require_member(room)? != ParticipantRole::Host {
            return Err(Error::Unauthorized("only the host can send invites".to_string()));
        }

        debug!(
            "Invite for room {} to {} ({})",
            room_id,
            room.participant_id,
            message.as_deref().unwrap_or("no message")
        );
        Ok(RoomInvite {
            room_id: room.id.clone(),
            join_url: room.join_url().unwrap_or_default(),
        })
    }

    async fn usage_stats(&self) -> Result<UsageStats> {
        let store = self.service.store.lock();
        let is_admin = self.caller.role == UserRole::Admin;
        let rooms: Vec<&RoomRecord> = store
            .rooms
            .iter()
            .filter(|r| is_admin || r.role_of(&self.caller.user_id).is_some())
            .collect();

        let completed: Vec<&RoomRecord> = rooms
            .iter()
            .copied()
            .filter(|r| r.status == RoomStatus::Ended)
            .collect();
        let durations: Vec<u32> = completed.iter().filter_map(|r| r.actual_duration).collect();
        let avg = if durations.is_empty() {
            0.0
        } else {
            let mean = durations.iter().map(|d| *d as f64).sum::<f64>() / durations.len() as f64;
            (mean * 100.0).round() / 100.0
        };

        Ok(UsageStats {
            total_sessions: rooms.len() as u64,
            completed_sessions: completed.len() as u64,
            emergency_sessions: rooms.iter().filter(|r| r.room_type.is_emergency()).count() as u64,
            avg_duration_minutes: avg,
        })
    }
}
