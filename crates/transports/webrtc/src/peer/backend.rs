//! Peer connection backend seam
//!
//! The negotiator never sees backend callbacks. A backend pushes everything it
//! observes (gathered candidates, link state changes, remote tracks) into the
//! event queue returned by its factory, and the session loop feeds those
//! events back to the negotiator one at a time.

use crate::media::{LocalTrack, TrackKind};
use crate::signaling::{IceCandidate, SessionDescription};
use crate::Result;
use async_trait::async_trait;
use std::fmt;
use tokio::sync::mpsc;

/// Connectivity of the underlying peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Not started
    New,
    /// Checking candidate pairs
    Connecting,
    /// Media path established
    Connected,
    /// Path lost, may recover on its own
    Disconnected,
    /// Path failed permanently
    Failed,
    /// Connection closed
    Closed,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkState::New => "new",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Disconnected => "disconnected",
            LinkState::Failed => "failed",
            LinkState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Something the backend observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// Local candidate gathered; to be sent to the remote side
    LocalCandidate(IceCandidate),
    /// Link state changed
    LinkState(LinkState),
    /// Remote media arrived
    RemoteTrack {
        /// Audio or video
        kind: TrackKind,
        /// Remote track id
        id: String,
    },
}

/// One peer connection
#[async_trait]
pub trait PeerBackend: Send + Sync {
    /// Add local tracks to the connection
    async fn attach_local(&self, tracks: &[LocalTrack]) -> Result<()>;

    /// Create an offer and set it as the local description; returns the SDP
    async fn create_offer(&self) -> Result<String>;

    /// Create an answer to the applied remote offer and set it locally
    async fn create_answer(&self) -> Result<String>;

    /// Apply the remote offer or answer
    async fn set_remote_description(&self, description: &SessionDescription) -> Result<()>;

    /// Apply a remote candidate; only valid after the remote description
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()>;

    /// Close the connection
    async fn close(&self) -> Result<()>;
}

/// Creates fresh peer connections
#[async_trait]
pub trait PeerBackendFactory: Send + Sync {
    /// New connection plus the queue its events are delivered on
    async fn create(&self) -> Result<(Box<dyn PeerBackend>, mpsc::UnboundedReceiver<PeerEvent>)>;
}
