//! Core types for teleconsult video sessions
//!
//! This crate holds everything that is shared between a participant's local
//! session and the external Room Service:
//!
//! - **Room model**: [`RoomRecord`], [`RoomStatus`], [`RoomType`] with the
//!   monotonic status rules (`scheduled|emergency_pending -> active -> ended`)
//! - **Chat model**: [`ChatMessage`], the append-only per-room history entry
//! - **Participant context**: [`ParticipantContext`], the explicit identity
//!   passed to every component that needs to know who the caller is
//! - **Room Service contract**: the [`RoomService`] trait, with an HTTP client
//!   ([`HttpRoomService`]) and an in-memory implementation
//!   ([`InMemoryRoomService`]) for local development and tests
//!
//! # Example
//!
//! ```
//! use teleconsult_core::{RoomStatus, RoomType};
//!
//! assert!(RoomStatus::Scheduled.can_transition_to(RoomStatus::Active));
//! assert!(!RoomStatus::Ended.can_transition_to(RoomStatus::Active));
//! assert!(RoomType::Emergency.is_emergency());
//! ```

#![warn(clippy::all)]

pub mod chat;
pub mod error;
pub mod identity;
pub mod room;
pub mod room_service;
pub mod timestamp;

pub use chat::ChatMessage;
pub use error::{Error, Result};
pub use identity::{ParticipantContext, ParticipantRole, UserRole};
pub use room::{elapsed_minutes, RoomRecord, RoomStatus, RoomType, RoomView};
pub use room_service::{
    http::HttpRoomService,
    memory::{InMemoryRoomClient, InMemoryRoomService},
    CreateRoomRequest, EmergencyRoom, Recording, RoomInvite, RoomListFilter, RoomService,
    StatusUpdate, UsageStats,
};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        let ver = version();
        assert!(!ver.is_empty());
    }
}
