//! Peer Session Negotiator
//!
//! Event-to-transition table for one peer connection:
//!
//! | state            | input                         | next              | effect                         |
//! |------------------|-------------------------------|-------------------|--------------------------------|
//! | `Idle`           | `bind_media`                  | `MediaBound`      | fresh backend, tracks attached |
//! | `MediaBound`     | `start_call`                  | `Offering`        | offer created and sent         |
//! | `Offering`       | offer sent                    | `AwaitingRemote`  |                                |
//! | `MediaBound`     | remote offer                  | `Answering`       | offer applied, answer sent     |
//! | `Answering`      | answer sent                   | `AwaitingRemote`  |                                |
//! | `AwaitingRemote` | remote answer (own offer)     | `AwaitingRemote`  | answer applied                 |
//! | `AwaitingRemote` | link connected                | `Connected`       | `Connected` notice (once)      |
//! | `Connected`      | link disconnected             | `Degraded`        | media stays attached           |
//! | `Degraded`       | link connected                | `Connected`       | `Recovered` notice             |
//! | any              | link failed, fatal error, end | `Closed`          | backend closed                 |
//!
//! Remote candidates that arrive before the remote description is applied are
//! queued and replayed in arrival order right after it is applied.

use super::backend::{LinkState, PeerBackend, PeerBackendFactory, PeerEvent};
use crate::media::{LocalStream, TrackKind};
use crate::signaling::{IceCandidate, SdpType, SessionDescription, SignalingMessage};
use crate::{Error, Result};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

/// Negotiation state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationState {
    /// No peer connection
    Idle,
    /// Local tracks attached to a fresh peer connection
    MediaBound,
    /// Waiting for the remote side (answer or connectivity)
    AwaitingRemote,
    /// Creating the local offer
    Offering,
    /// Applying a remote offer and creating the answer
    Answering,
    /// Media path established
    Connected,
    /// Media path regressed; may recover
    Degraded,
    /// Finished; a new negotiation needs a reset
    Closed,
}

impl NegotiationState {
    /// Offer/answer exchange in flight
    pub fn is_negotiating(&self) -> bool {
        matches!(
            self,
            NegotiationState::Offering | NegotiationState::Answering | NegotiationState::AwaitingRemote
        )
    }

    /// Connected or degraded
    pub fn is_established(&self) -> bool {
        matches!(self, NegotiationState::Connected | NegotiationState::Degraded)
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Something the coordinator should react to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationNotice {
    /// First `Connected` of this negotiation
    Connected,
    /// `Connected -> Degraded`
    Degraded,
    /// `Degraded -> Connected`
    Recovered,
    /// Remote media arrived
    RemoteTrack {
        /// Audio or video
        kind: TrackKind,
        /// Remote track id
        id: String,
    },
    /// Backend reported the link as failed or closed
    Closed(String),
}

/// Outcome of feeding one input to the negotiator
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Step {
    /// Messages to send on the signaling channel, in order
    pub outbound: Vec<SignalingMessage>,
    /// Notices for the coordinator
    pub notices: Vec<NegotiationNotice>,
}

impl Step {
    fn send(message: SignalingMessage) -> Self {
        Self {
            outbound: vec![message],
            notices: Vec::new(),
        }
    }

    fn notice(notice: NegotiationNotice) -> Self {
        Self {
            outbound: Vec::new(),
            notices: vec![notice],
        }
    }

    /// Nothing to do
    pub fn is_empty(&self) -> bool {
        self.outbound.is_empty() && self.notices.is_empty()
    }
}

/// Drives one peer connection through offer/answer and candidate exchange
pub struct Negotiator {
    factory: Arc<dyn PeerBackendFactory>,
    backend: Option<Box<dyn PeerBackend>>,
    events: Option<mpsc::UnboundedReceiver<PeerEvent>>,
    state: NegotiationState,

    /// Our offer was sent and its answer has not arrived
    offer_outstanding: bool,

    /// Remote description applied on the current backend
    remote_applied: bool,

    /// Remote candidates waiting for the remote description
    pending_candidates: VecDeque<IceCandidate>,

    /// `Connected` notice already emitted for this negotiation
    announced: bool,
}

impl Negotiator {
    /// Negotiator creating peer connections through `factory`
    pub fn new(factory: Arc<dyn PeerBackendFactory>) -> Self {
        Self {
            factory,
            backend: None,
            events: None,
            state: NegotiationState::Idle,
            offer_outstanding: false,
            remote_applied: false,
            pending_candidates: VecDeque::new(),
            announced: false,
        }
    }

    /// Current state
    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// Number of queued remote candidates
    pub fn queued_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Whether our offer is waiting for its answer
    pub fn has_outstanding_offer(&self) -> bool {
        self.offer_outstanding
    }

    fn transition(&mut self, next: NegotiationState) {
        if self.state != next {
            debug!("Negotiation {} -> {}", self.state, next);
            self.state = next;
        }
    }

    fn backend(&self) -> Result<&dyn PeerBackend> {
        self.backend
            .as_deref()
            .ok_or_else(|| Error::InvalidState(format!("no peer connection in state {}", self.state)))
    }

    /// Attach `stream` to a fresh peer connection (`Idle -> MediaBound`)
    #[instrument(skip(self, stream), fields(stream_id = %stream.id()))]
    pub async fn bind_media(&mut self, stream: &LocalStream) -> Result<()> {
        if self.state != NegotiationState::Idle {
            return Err(Error::InvalidState(format!(
                "media can only be bound from Idle, not {}",
                self.state
            )));
        }

        let (backend, events) = self.factory.create().await?;
        if let Err(e) = backend.attach_local(stream.tracks()).await {
            let _ = backend.close().await;
            return Err(e);
        }

        self.backend = Some(backend);
        self.events = Some(events);
        self.transition(NegotiationState::MediaBound);
        Ok(())
    }

    /// Initiator action: create and send an offer
    ///
    /// A no-op while an offer/answer exchange is in flight or the call is up,
    /// so at most one offer is ever outstanding.
    #[instrument(skip(self))]
    pub async fn start_call(&mut self) -> Result<Step> {
        match self.state {
            NegotiationState::MediaBound => {}
            state if state.is_negotiating() || state.is_established() => {
                debug!("Start call ignored in state {}", state);
                return Ok(Step::default());
            }
            state => {
                return Err(Error::InvalidState(format!(
                    "cannot start a call in state {}",
                    state
                )))
            }
        }

        self.transition(NegotiationState::Offering);
        let offer = self.backend()?.create_offer().await;
        let sdp = match offer {
            Ok(sdp) => sdp,
            Err(e) => return Err(self.fail(e).await),
        };

        self.offer_outstanding = true;
        self.transition(NegotiationState::AwaitingRemote);
        info!("Offer sent");
        Ok(Step::send(SignalingMessage::offer(sdp)))
    }

    /// Feed one inbound signaling message
    ///
    /// Errors are fatal to this negotiation: the negotiator is already
    /// `Closed` when one is returned.
    pub async fn handle_signal(&mut self, message: SignalingMessage) -> Result<Step> {
        match message {
            SignalingMessage::Offer { offer, from } => self.on_offer(offer, from).await,
            SignalingMessage::Answer { answer, .. } => self.on_answer(answer).await,
            SignalingMessage::IceCandidate { candidate, .. } => self.on_candidate(candidate).await,
            other => {
                debug!("Negotiator ignoring {}", other.kind());
                Ok(Step::default())
            }
        }
    }

    async fn on_offer(&mut self, offer: SessionDescription, from: Option<String>) -> Result<Step> {
        let from = from.as_deref().unwrap_or("unknown");
        match self.state {
            NegotiationState::MediaBound => {}
            NegotiationState::AwaitingRemote if self.offer_outstanding => {
                warn!(
                    "Ignoring offer from {} while our own offer is outstanding (both sides acting as host?)",
                    from
                );
                return Ok(Step::default());
            }
            state => {
                warn!("Ignoring offer from {} in state {}", from, state);
                return Ok(Step::default());
            }
        }

        self.transition(NegotiationState::Answering);
        let result = self.answer(&offer).await;
        match result {
            Ok(sdp) => {
                self.transition(NegotiationState::AwaitingRemote);
                info!("Answered offer from {}", from);
                Ok(Step::send(SignalingMessage::answer(sdp)))
            }
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn answer(&mut self, offer: &SessionDescription) -> Result<String> {
        if offer.sdp_type != SdpType::Offer {
            return Err(Error::NegotiationFailed(
                "offer message carried a non-offer description".to_string(),
            ));
        }
        self.backend()?.set_remote_description(offer).await?;
        self.remote_applied = true;
        self.replay_candidates().await?;
        self.backend()?.create_answer().await
    }

    async fn on_answer(&mut self, answer: SessionDescription) -> Result<Step> {
        if self.state == NegotiationState::Closed {
            debug!("Ignoring answer after close");
            return Ok(Step::default());
        }

        if self.state != NegotiationState::AwaitingRemote || !self.offer_outstanding {
            let err = Error::NegotiationFailed(format!(
                "unexpected answer in state {}",
                self.state
            ));
            return Err(self.fail(err).await);
        }
        if answer.sdp_type != SdpType::Answer {
            let err = Error::NegotiationFailed(
                "answer message carried a non-answer description".to_string(),
            );
            return Err(self.fail(err).await);
        }

        let applied = async {
            self.backend()?.set_remote_description(&answer).await?;
            self.remote_applied = true;
            self.offer_outstanding = false;
            self.replay_candidates().await
        }
        .await;

        match applied {
            Ok(()) => {
                info!("Answer applied");
                Ok(Step::default())
            }
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn on_candidate(&mut self, candidate: IceCandidate) -> Result<Step> {
        if candidate.is_end_of_candidates() {
            debug!("Remote end of candidates");
            return Ok(Step::default());
        }

        if self.state == NegotiationState::Closed {
            debug!("Dropping candidate after close");
            return Ok(Step::default());
        }

        if !self.remote_applied {
            self.pending_candidates.push_back(candidate);
            debug!(
                "Queued remote candidate until the remote description is set ({} queued)",
                self.pending_candidates.len()
            );
            return Ok(Step::default());
        }

        let added = self.backend()?.add_ice_candidate(&candidate).await;
        match added {
            Ok(()) => Ok(Step::default()),
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn replay_candidates(&mut self) -> Result<()> {
        if self.pending_candidates.is_empty() {
            return Ok(());
        }

        debug!("Replaying {} queued candidates", self.pending_candidates.len());
        while let Some(candidate) = self.pending_candidates.pop_front() {
            self.backend()?.add_ice_candidate(&candidate).await?;
        }
        Ok(())
    }

    /// Feed one backend event
    pub async fn handle_peer_event(&mut self, event: PeerEvent) -> Step {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                if self.state == NegotiationState::Closed {
                    return Step::default();
                }
                Step::send(SignalingMessage::candidate(candidate))
            }
            PeerEvent::RemoteTrack { kind, id } => {
                info!("Remote {} track {}", kind, id);
                Step::notice(NegotiationNotice::RemoteTrack { kind, id })
            }
            PeerEvent::LinkState(link) => self.on_link_state(link).await,
        }
    }

    async fn on_link_state(&mut self, link: LinkState) -> Step {
        debug!("Link state {} in {}", link, self.state);
        match (link, self.state) {
            (_, NegotiationState::Closed) => Step::default(),
            (LinkState::Connected, NegotiationState::Degraded) => {
                self.transition(NegotiationState::Connected);
                info!("Peer connection recovered");
                Step::notice(NegotiationNotice::Recovered)
            }
            (LinkState::Connected, state) if state.is_negotiating() => {
                self.transition(NegotiationState::Connected);
                if self.announced {
                    return Step::default();
                }
                self.announced = true;
                info!("Peer connection established");
                Step::notice(NegotiationNotice::Connected)
            }
            (LinkState::Disconnected, NegotiationState::Connected) => {
                self.transition(NegotiationState::Degraded);
                warn!("Peer connection degraded");
                Step::notice(NegotiationNotice::Degraded)
            }
            (LinkState::Failed | LinkState::Closed, _) => {
                error!("Peer connection {}", link);
                self.close().await;
                Step::notice(NegotiationNotice::Closed(format!("peer connection {}", link)))
            }
            _ => Step::default(),
        }
    }

    /// Next backend event; pending while there is no peer connection
    pub async fn next_event(&mut self) -> PeerEvent {
        if let Some(events) = &mut self.events {
            if let Some(event) = events.recv().await {
                return event;
            }
            debug!("Peer event stream ended");
            self.events = None;
        }
        std::future::pending().await
    }

    async fn fail(&mut self, err: Error) -> Error {
        error!("Negotiation failed in state {}: {}", self.state, err);
        self.close().await;
        if matches!(err, Error::NegotiationFailed(_)) {
            err
        } else {
            Error::NegotiationFailed(err.to_string())
        }
    }

    async fn teardown(&mut self) {
        self.events = None;
        self.pending_candidates.clear();
        self.offer_outstanding = false;
        self.remote_applied = false;
        self.announced = false;
        if let Some(backend) = self.backend.take() {
            if let Err(e) = backend.close().await {
                warn!("Failed to close peer connection: {}", e);
            }
        }
    }

    /// Close the peer connection; later calls are no-ops
    pub async fn close(&mut self) {
        if self.state == NegotiationState::Closed {
            return;
        }
        self.teardown().await;
        self.transition(NegotiationState::Closed);
    }

    /// Drop the current peer connection and return to `Idle` for a new negotiation
    pub async fn reset(&mut self) {
        self.teardown().await;
        self.transition(NegotiationState::Idle);
    }
}

impl fmt::Debug for Negotiator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Negotiator")
            .field("state", &self.state)
            .field("offer_outstanding", &self.offer_outstanding)
            .field("remote_applied", &self.remote_applied)
            .field("queued_candidates", &self.pending_candidates.len())
            .finish()
    }
}
