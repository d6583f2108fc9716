//! Peer Session Negotiator and its connection backends

pub mod backend;
pub mod negotiator;
pub mod rtc;

pub use backend::{LinkState, PeerBackend, PeerBackendFactory, PeerEvent};
pub use negotiator::{NegotiationNotice, NegotiationState, Negotiator, Step};
pub use rtc::{RtcBackendFactory, RtcPeerBackend};
