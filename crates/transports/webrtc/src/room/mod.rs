//! Room Lifecycle Coordinator
//!
//! Sequences join, call and leave for one participant in one room, owns the
//! session's media, negotiator and signaling channel, and translates their
//! failures into the user-visible [`CallPhase`].

mod coordinator;
mod session;
mod state;
mod status_sync;

pub use coordinator::{RoomCoordinator, RoomSessionHandle};
pub use state::{CallPhase, ChatLog, Presence, SessionEvent, SessionSnapshot};
