//! Test harness for room session scenarios
//!
//! Two participants run real [`RoomCoordinator`] sessions against the
//! in-process [`LoopbackRelay`] and the in-memory Room Service. Peer
//! connections are simulated by [`SimNetwork`] so scenarios run without
//! sockets, and capture devices are scripted by [`ScriptedDevice`].

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use teleconsult_core::{
    CreateRoomRequest, InMemoryRoomService, ParticipantContext, RoomService, UserRole,
};
use teleconsult_webrtc::media::{DeviceLease, LocalTrack};
use teleconsult_webrtc::peer::LinkState;
use teleconsult_webrtc::signaling::{ChannelEvent, IceCandidate, SessionDescription};
use teleconsult_webrtc::{
    CaptureDevice, Error, JoinParams, LocalStream, LoopbackRelay, MediaConstraints, PeerBackend,
    PeerBackendFactory, PeerEvent, ReconnectionPolicy, Result, RoomCoordinator, RoomSessionHandle,
    SessionConfig, SessionEvent, SessionSnapshot, SignalingChannel, SignalingConnector, TrackKind,
};
use tokio::sync::{broadcast, mpsc};

/// Upper bound for any single wait in a scenario
pub const WAIT: Duration = Duration::from_secs(5);

/// Initialize tracing for tests (call once per test)
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,teleconsult_webrtc=debug")
        .with_test_writer()
        .try_init();
}

/// Retry policy fast enough for tests
pub fn fast_policy(max_retries: u32, initial_ms: u64) -> ReconnectionPolicy {
    ReconnectionPolicy {
        max_retries,
        backoff_initial_ms: initial_ms,
        backoff_max_ms: initial_ms * 4,
        backoff_multiplier: 2.0,
        jitter_enabled: false,
    }
}

/// Session config with short timeouts and retries
pub fn test_config() -> SessionConfig {
    SessionConfig {
        connect_timeout_ms: 2_000,
        reconnect: fast_policy(5, 10),
        status_sync: fast_policy(3, 5),
        status_flush_timeout_ms: 1_000,
        ..SessionConfig::default()
    }
}

// ============================================================================
// Simulated peer connections
// ============================================================================

struct SimPeerState {
    events: mpsc::UnboundedSender<PeerEvent>,
    kinds: Vec<TrackKind>,
    has_local: bool,
    remote: Option<String>,
    applied_candidates: Vec<String>,
    connected: bool,
    closed: bool,
}

#[derive(Default)]
struct SimState {
    next_id: u64,
    created: Vec<String>,
    peers: HashMap<String, SimPeerState>,
}

impl SimState {
    fn emit(&self, id: &str, event: PeerEvent) {
        if let Some(peer) = self.peers.get(id) {
            let _ = peer.events.send(event);
        }
    }

    /// Connect once both descriptions are set and a remote candidate arrived
    fn check_connected(&mut self, id: &str) {
        let Some(peer) = self.peers.get(id) else {
            return;
        };
        if peer.connected || peer.closed || !peer.has_local || peer.applied_candidates.is_empty() {
            return;
        }
        let Some(remote) = peer.remote.clone() else {
            return;
        };
        let remote_kinds = self
            .peers
            .get(&remote)
            .map(|p| p.kinds.clone())
            .unwrap_or_default();

        if let Some(peer) = self.peers.get_mut(id) {
            peer.connected = true;
        }
        self.emit(id, PeerEvent::LinkState(LinkState::Connecting));
        self.emit(id, PeerEvent::LinkState(LinkState::Connected));
        for kind in remote_kinds {
            self.emit(
                id,
                PeerEvent::RemoteTrack {
                    kind,
                    id: format!("{}-{}", remote, kind),
                },
            );
        }
    }
}

/// In-memory stand-in for WebRTC peer connections
///
/// SDP is `o=sim <peer id>`, so applying a remote description pairs two
/// simulated peers. Each local description produces a host and a srflx
/// candidate. Closing a connected peer fails its remote's link, like a consent
/// timeout would.
#[derive(Clone, Default)]
pub struct SimNetwork {
    state: Arc<Mutex<SimState>>,
}

impl SimNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Peer ids in creation order
    pub fn peers(&self) -> Vec<String> {
        self.state.lock().created.clone()
    }

    /// Peers not yet closed
    pub fn open_peers(&self) -> usize {
        self.state.lock().peers.values().filter(|p| !p.closed).count()
    }

    /// Remote candidates applied to `peer_id`, in order
    pub fn applied_candidates(&self, peer_id: &str) -> Vec<String> {
        self.state
            .lock()
            .peers
            .get(peer_id)
            .map(|p| p.applied_candidates.clone())
            .unwrap_or_default()
    }

    /// Push a link state change to one peer
    pub fn set_link(&self, peer_id: &str, link: LinkState) {
        self.state.lock().emit(peer_id, PeerEvent::LinkState(link));
    }

    /// Fail every connected link
    pub fn fail_all(&self) {
        let mut state = self.state.lock();
        let connected: Vec<String> = state
            .peers
            .iter()
            .filter(|(_, p)| p.connected && !p.closed)
            .map(|(id, _)| id.clone())
            .collect();
        for id in connected {
            if let Some(peer) = state.peers.get_mut(&id) {
                peer.connected = false;
            }
            state.emit(&id, PeerEvent::LinkState(LinkState::Failed));
        }
    }
}

#[async_trait]
impl PeerBackendFactory for SimNetwork {
    async fn create(&self) -> Result<(Box<dyn PeerBackend>, mpsc::UnboundedReceiver<PeerEvent>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = format!("sim-{}", state.next_id);
        state.created.push(id.clone());
        state.peers.insert(
            id.clone(),
            SimPeerState {
                events: tx,
                kinds: Vec::new(),
                has_local: false,
                remote: None,
                applied_candidates: Vec::new(),
                connected: false,
                closed: false,
            },
        );

        let peer = SimPeer {
            id,
            network: self.clone(),
        };
        Ok((Box::new(peer), rx))
    }
}

struct SimPeer {
    id: String,
    network: SimNetwork,
}

impl SimPeer {
    fn with_state<T>(&self, f: impl FnOnce(&mut SimState, &str) -> Result<T>) -> Result<T> {
        let mut state = self.network.state.lock();
        match state.peers.get(&self.id) {
            Some(peer) if !peer.closed => {}
            _ => return Err(Error::WebRtc(format!("{} is closed", self.id))),
        }
        f(&mut *state, &self.id)
    }

    fn set_local(&self) -> Result<String> {
        self.with_state(|state, id| {
            if let Some(peer) = state.peers.get_mut(id) {
                peer.has_local = true;
            }
            for candidate in [
                format!("candidate:{} 1 udp 2130706431 10.0.0.1 9 typ host", id),
                format!("candidate:{} 1 udp 1694498815 203.0.113.7 9 typ srflx", id),
            ] {
                state.emit(
                    id,
                    PeerEvent::LocalCandidate(IceCandidate {
                        candidate,
                        sdp_mid: Some("0".to_string()),
                        sdp_mline_index: Some(0),
                    }),
                );
            }
            state.check_connected(id);
            Ok(format!("o=sim {}", id))
        })
    }
}

#[async_trait]
impl PeerBackend for SimPeer {
    async fn attach_local(&self, tracks: &[LocalTrack]) -> Result<()> {
        self.with_state(|state, id| {
            if let Some(peer) = state.peers.get_mut(id) {
                peer.kinds.extend(tracks.iter().map(LocalTrack::kind));
            }
            Ok(())
        })
    }

    async fn create_offer(&self) -> Result<String> {
        self.set_local()
    }

    async fn create_answer(&self) -> Result<String> {
        let has_remote = self.with_state(|state, id| Ok(state.peers[id].remote.is_some()))?;
        if !has_remote {
            return Err(Error::NegotiationFailed("answer without remote offer".to_string()));
        }
        self.set_local()
    }

    async fn set_remote_description(&self, description: &SessionDescription) -> Result<()> {
        let remote = description
            .sdp
            .strip_prefix("o=sim ")
            .ok_or_else(|| Error::NegotiationFailed(format!("unparseable SDP: {}", description.sdp)))?
            .to_string();
        self.with_state(|state, id| {
            if let Some(peer) = state.peers.get_mut(id) {
                peer.remote = Some(remote);
            }
            state.check_connected(id);
            Ok(())
        })
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        self.with_state(|state, id| {
            let Some(peer) = state.peers.get_mut(id) else {
                return Ok(());
            };
            if peer.remote.is_none() {
                return Err(Error::NegotiationFailed(
                    "candidate before remote description".to_string(),
                ));
            }
            peer.applied_candidates.push(candidate.candidate.clone());
            state.check_connected(id);
            Ok(())
        })
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.network.state.lock();
        let Some(peer) = state.peers.get_mut(&self.id) else {
            return Ok(());
        };
        if peer.closed {
            return Ok(());
        }
        peer.closed = true;
        let was_connected = std::mem::replace(&mut peer.connected, false);
        let remote = peer.remote.clone();

        if let (true, Some(remote)) = (was_connected, remote) {
            let remote_linked = state
                .peers
                .get(&remote)
                .is_some_and(|p| p.connected && !p.closed && p.remote.as_deref() == Some(self.id.as_str()));
            if remote_linked {
                if let Some(p) = state.peers.get_mut(&remote) {
                    p.connected = false;
                }
                state.emit(&remote, PeerEvent::LinkState(LinkState::Failed));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Capture devices and connectors
// ============================================================================

/// What a [`ScriptedDevice`] does on open
#[derive(Debug, Clone, Copy)]
pub enum DeviceScript {
    Grant,
    Deny,
    Unavailable,
    Delay(Duration),
}

#[derive(Default)]
struct DeviceCounters {
    opens: AtomicUsize,
    releases: AtomicUsize,
}

struct CountingLease(Arc<DeviceCounters>);

impl DeviceLease for CountingLease {
    fn release(self: Box<Self>) {
        self.0.releases.fetch_add(1, Ordering::SeqCst);
    }
}

/// Capture device with scripted behavior and open/release counters
#[derive(Clone)]
pub struct ScriptedDevice {
    script: DeviceScript,
    counters: Arc<DeviceCounters>,
}

impl ScriptedDevice {
    pub fn new(script: DeviceScript) -> Self {
        Self {
            script,
            counters: Arc::default(),
        }
    }

    pub fn granting() -> Self {
        Self::new(DeviceScript::Grant)
    }

    /// Streams handed out
    pub fn opens(&self) -> usize {
        self.counters.opens.load(Ordering::SeqCst)
    }

    /// Leases returned
    pub fn releases(&self) -> usize {
        self.counters.releases.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CaptureDevice for ScriptedDevice {
    async fn open(&self, constraints: &MediaConstraints) -> Result<LocalStream> {
        match self.script {
            DeviceScript::Deny => return Err(Error::DeviceDenied("permission dismissed".to_string())),
            DeviceScript::Unavailable => {
                return Err(Error::DeviceUnavailable("no camera".to_string()))
            }
            DeviceScript::Delay(delay) => tokio::time::sleep(delay).await,
            DeviceScript::Grant => {}
        }

        let stream_id = format!("scripted-{}", self.opens() + 1);
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(LocalTrack::new(TrackKind::Audio, &stream_id));
        }
        if constraints.video {
            tracks.push(LocalTrack::new(TrackKind::Video, &stream_id));
        }
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        Ok(LocalStream::new(
            stream_id,
            tracks,
            Some(Box::new(CountingLease(Arc::clone(&self.counters)))),
        ))
    }
}

/// Relay connector that can be told to refuse connects
#[derive(Clone)]
pub struct FlakyConnector {
    relay: LoopbackRelay,
    refuse: Arc<AtomicBool>,
    attempts: Arc<AtomicUsize>,
}

impl FlakyConnector {
    pub fn new(relay: LoopbackRelay) -> Self {
        Self {
            relay,
            refuse: Arc::default(),
            attempts: Arc::default(),
        }
    }

    pub fn refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Connect calls so far
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SignalingConnector for FlakyConnector {
    async fn connect(&self, params: &JoinParams) -> Result<SignalingChannel> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(Error::ConnectFailed("relay unreachable".to_string()));
        }
        self.relay.connect(params).await
    }
}

/// Connector whose channels stay open but can no longer queue outbound frames
#[derive(Clone, Default)]
pub struct DeadWriterConnector {
    inbound: Arc<Mutex<Vec<mpsc::UnboundedSender<ChannelEvent>>>>,
}

#[async_trait]
impl SignalingConnector for DeadWriterConnector {
    async fn connect(&self, _params: &JoinParams) -> Result<SignalingChannel> {
        let (outbound, _) = mpsc::unbounded_channel();
        let (events, inbound) = mpsc::unbounded_channel();
        self.inbound.lock().push(events);
        Ok(SignalingChannel::from_parts(outbound, inbound))
    }
}

// ============================================================================
// Clinic fixture
// ============================================================================

/// A doctor, a patient and one scheduled room between them
pub struct Clinic {
    pub rooms: InMemoryRoomService,
    pub relay: LoopbackRelay,
    pub network: SimNetwork,
    pub doctor: ParticipantContext,
    pub patient: ParticipantContext,
    pub room_id: String,
    pub token: String,
}

impl Clinic {
    pub async fn new() -> Self {
        let rooms = InMemoryRoomService::new();
        let doctor = ParticipantContext::new("doc-1", UserRole::Doctor);
        let patient = ParticipantContext::new("pat-1", UserRole::Patient);
        rooms.register_user(&doctor);
        rooms.register_user(&patient);

        let record = rooms
            .client_for(doctor.clone())
            .create_room(CreateRoomRequest::new("pat-1"))
            .await
            .expect("create room");
        let token = record.token.clone().expect("room token");

        Self {
            relay: LoopbackRelay::new(rooms.clone()),
            rooms,
            network: SimNetwork::new(),
            doctor,
            patient,
            room_id: record.id,
            token,
        }
    }

    /// Coordinator for `ctx` over the loopback relay
    pub fn coordinator(&self, ctx: &ParticipantContext, device: &ScriptedDevice) -> RoomCoordinator {
        self.coordinator_with(ctx, device, test_config(), Arc::new(self.relay.clone()))
    }

    pub fn coordinator_with(
        &self,
        ctx: &ParticipantContext,
        device: &ScriptedDevice,
        config: SessionConfig,
        connector: Arc<dyn SignalingConnector>,
    ) -> RoomCoordinator {
        RoomCoordinator::new(
            ctx.clone(),
            config,
            Arc::new(self.rooms.client_for(ctx.clone())),
            connector,
        )
        .with_capture_device(Arc::new(device.clone()))
        .with_peer_factory(Arc::new(self.network.clone()))
    }

    /// Both participants joined, call started and connected
    pub async fn connected_pair(&self) -> (RoomSessionHandle, RoomSessionHandle) {
        let host = self
            .coordinator(&self.doctor, &ScriptedDevice::granting())
            .open(&self.room_id, &self.token)
            .await
            .expect("host joins");
        let guest = self
            .coordinator(&self.patient, &ScriptedDevice::granting())
            .open(&self.room_id, &self.token)
            .await
            .expect("guest joins");

        host.start_call().await.expect("start call");
        wait_in_call(&host).await;
        wait_in_call(&guest).await;
        (host, guest)
    }

    /// Relay traffic of `kind` in this room
    pub fn sent(&self, kind: &str) -> usize {
        self.relay.count(&self.room_id, kind)
    }
}

// ============================================================================
// Waiting
// ============================================================================

/// Wait until the session snapshot satisfies `pred`
pub async fn wait_snapshot(
    handle: &RoomSessionHandle,
    what: &str,
    mut pred: impl FnMut(&SessionSnapshot) -> bool,
) -> SessionSnapshot {
    let mut rx = handle.watch();
    let result = match tokio::time::timeout(WAIT, rx.wait_for(|s| pred(s))).await {
        Ok(Ok(snapshot)) => snapshot.clone(),
        Ok(Err(_)) => panic!("session closed while waiting for {}", what),
        Err(_) => panic!("timed out waiting for {}; last snapshot {:?}", what, handle.snapshot()),
    };
    result
}

pub async fn wait_in_call(handle: &RoomSessionHandle) -> SessionSnapshot {
    wait_snapshot(handle, "in call", |s| {
        s.phase == teleconsult_webrtc::CallPhase::InCall
    })
    .await
}

/// Poll `cond` until it holds
pub async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let polled = tokio::time::timeout(WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {}", what);
}

/// Next event matching `pred`, skipping others
pub async fn next_event(
    events: &mut broadcast::Receiver<SessionEvent>,
    what: &str,
    mut pred: impl FnMut(&SessionEvent) -> bool,
) -> SessionEvent {
    let found = tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return Some(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await;
    match found {
        Ok(Some(event)) => event,
        Ok(None) => panic!("event stream closed waiting for {}", what),
        Err(_) => panic!("timed out waiting for {}", what),
    }
}
