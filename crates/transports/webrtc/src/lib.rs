//! Two-party video consultation sessions
//!
//! This crate runs one participant's side of a consultation room: local
//! media, a WebRTC peer connection negotiated over a signaling relay, room
//! chat, and the room lifecycle against the Room Service.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  RoomCoordinator::open()                                 │
//! │  ↓ (spawns one task per joined room)                     │
//! │  RoomSession select! loop  ←── RoomSessionHandle         │
//! │  ├─ MediaController (camera/mic, toggles)                │
//! │  ├─ Negotiator (offer/answer/candidates, PeerBackend)    │
//! │  ├─ SignalingChannel (WebSocket or loopback relay)       │
//! │  ├─ ChatSubchannel (history + live chat)                 │
//! │  └─ StatusSync (active/ended → RoomService)              │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use teleconsult_webrtc::SessionConfig;
//!
//! let config = SessionConfig {
//!     signaling_url: "wss://clinic.example.com".to_string(),
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! assert_eq!(config.reconnect.max_retries, 5);
//! ```
//!
//! ## Async Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use teleconsult_core::{HttpRoomService, ParticipantContext, UserRole};
//! use teleconsult_webrtc::{RoomCoordinator, SessionConfig};
//!
//! # async fn example() -> teleconsult_webrtc::Result<()> {
//! let me = ParticipantContext::new("doc-1", UserRole::Doctor);
//! let rooms = HttpRoomService::new("https://clinic.example.com", "bearer-token", me.clone())?;
//! let coordinator = RoomCoordinator::with_websocket(me, SessionConfig::default(), Arc::new(rooms))?;
//!
//! let session = coordinator.open("room-1", "join-token").await?;
//! session.start_call().await?;
//! session.send_chat("Hello, can you hear me?").await?;
//! session.leave().await?;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod chat;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod media;
pub mod peer;
pub mod room;
pub mod signaling;

pub use chat::{ChatEntry, ChatReceipt, ChatSubchannel};
pub use config::{MediaConstraints, SessionConfig, TurnServerConfig};
pub use error::{Error, Result};
pub use lifecycle::ReconnectionPolicy;
pub use media::{CaptureDevice, LocalStream, MediaController, SampleSourceDevice, TrackKind};
pub use peer::{NegotiationState, Negotiator, PeerBackend, PeerBackendFactory, PeerEvent};
pub use room::{CallPhase, Presence, RoomCoordinator, RoomSessionHandle, SessionEvent, SessionSnapshot};
pub use signaling::{
    JoinParams, LoopbackRelay, SignalingChannel, SignalingConnector, SignalingMessage,
    WebSocketConnector,
};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
