//! `webrtc` crate backend

use super::backend::{LinkState, PeerBackend, PeerBackendFactory, PeerEvent};
use crate::config::SessionConfig;
use crate::media::{LocalTrack, TrackKind};
use crate::signaling::{IceCandidate, SdpType, SessionDescription};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Builds [`RtcPeerBackend`]s with the configured ICE servers
#[derive(Debug, Clone)]
pub struct RtcBackendFactory {
    ice_servers: Vec<RTCIceServer>,
}

impl RtcBackendFactory {
    /// Factory using the STUN/TURN servers of `config`
    pub fn from_config(config: &SessionConfig) -> Self {
        let ice_servers = config
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .chain(config.turn_servers.iter().map(|turn| {
                #[allow(clippy::needless_update)]
                RTCIceServer {
                    urls: vec![turn.url.clone()],
                    username: turn.username.clone(),
                    credential: turn.credential.clone(),
                    ..Default::default()
                }
            }))
            .collect();

        Self { ice_servers }
    }
}

#[async_trait]
impl PeerBackendFactory for RtcBackendFactory {
    #[instrument(skip(self))]
    async fn create(&self) -> Result<(Box<dyn PeerBackend>, mpsc::UnboundedReceiver<PeerEvent>)> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtc(format!("Failed to register codecs: {}", e)))?;

        let registry = register_default_interceptors(Default::default(), &mut media_engine)
            .map_err(|e| Error::WebRtc(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(|e| Error::WebRtc(format!("Failed to create peer connection: {}", e)))?,
        );

        let (tx, rx) = mpsc::unbounded_channel();
        install_handlers(&pc, tx);

        info!("Created peer connection");
        Ok((
            Box::new(RtcPeerBackend {
                pc,
                senders: Mutex::new(Vec::new()),
            }),
            rx,
        ))
    }
}

/// Forward connection callbacks into the event queue
fn install_handlers(pc: &RTCPeerConnection, tx: mpsc::UnboundedSender<PeerEvent>) {
    let candidates = tx.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let tx = candidates.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                debug!("Candidate gathering complete");
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    let _ = tx.send(PeerEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                    }));
                }
                Err(e) => warn!("Failed to serialize local candidate: {}", e),
            }
        })
    }));

    let states = tx.clone();
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        let tx = states.clone();
        Box::pin(async move {
            let state = match s {
                RTCPeerConnectionState::New => LinkState::New,
                RTCPeerConnectionState::Connecting => LinkState::Connecting,
                RTCPeerConnectionState::Connected => LinkState::Connected,
                RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
                RTCPeerConnectionState::Failed => LinkState::Failed,
                RTCPeerConnectionState::Closed => LinkState::Closed,
                _ => return,
            };
            let _ = tx.send(PeerEvent::LinkState(state));
        })
    }));

    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>, _: Arc<RTCRtpReceiver>, _: Arc<RTCRtpTransceiver>| {
            let tx = tx.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Audio => TrackKind::Audio,
                    RTPCodecType::Video => TrackKind::Video,
                    _ => return,
                };
                let _ = tx.send(PeerEvent::RemoteTrack {
                    kind,
                    id: track.id(),
                });
            })
        },
    ));
}

/// Peer connection backed by `webrtc::RTCPeerConnection`
pub struct RtcPeerBackend {
    pc: Arc<RTCPeerConnection>,

    /// Kept so attached tracks are not cleaned up
    senders: Mutex<Vec<Arc<RTCRtpSender>>>,
}

impl RtcPeerBackend {
    async fn local_sdp(&self) -> Result<String> {
        self.pc
            .local_description()
            .await
            .map(|desc| desc.sdp)
            .ok_or_else(|| Error::WebRtc("No local description after setting it".to_string()))
    }
}

#[async_trait]
impl PeerBackend for RtcPeerBackend {
    async fn attach_local(&self, tracks: &[LocalTrack]) -> Result<()> {
        for track in tracks {
            let sender = self
                .pc
                .add_track(track.rtc_track() as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| Error::WebRtc(format!("Failed to add {} track: {}", track.kind(), e)))?;
            self.senders.lock().push(sender);
            debug!("Attached {} track {}", track.kind(), track.id());
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<String> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| Error::NegotiationFailed(format!("Failed to create offer: {}", e)))?;
        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| Error::NegotiationFailed(format!("Failed to set local offer: {}", e)))?;
        self.local_sdp().await
    }

    async fn create_answer(&self) -> Result<String> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| Error::NegotiationFailed(format!("Failed to create answer: {}", e)))?;
        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| Error::NegotiationFailed(format!("Failed to set local answer: {}", e)))?;
        self.local_sdp().await
    }

    async fn set_remote_description(&self, description: &SessionDescription) -> Result<()> {
        let sdp = description.sdp.clone();
        let parsed = match description.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(sdp),
            SdpType::Answer => RTCSessionDescription::answer(sdp),
        }
        .map_err(|e| Error::NegotiationFailed(format!("Malformed remote SDP: {}", e)))?;

        self.pc
            .set_remote_description(parsed)
            .await
            .map_err(|e| Error::NegotiationFailed(format!("Failed to set remote description: {}", e)))
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| Error::NegotiationFailed(format!("Failed to add candidate: {}", e)))
    }

    async fn close(&self) -> Result<()> {
        self.senders.lock().clear();
        self.pc
            .close()
            .await
            .map_err(|e| Error::WebRtc(format!("Failed to close peer connection: {}", e)))
    }
}
