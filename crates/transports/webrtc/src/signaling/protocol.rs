//! Signaling envelope
//!
//! Every frame on the signaling channel is a JSON object with a `type`
//! discriminator. The relay stamps `from` on relayed negotiation and chat
//! messages; clients leave it out.

use serde::{Deserialize, Serialize};
use teleconsult_core::UserRole;

/// SDP type carried inside an offer/answer payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Session offer
    Offer,
    /// Session answer
    Answer,
}

/// Session description as exchanged over signaling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    #[serde(rename = "type")]
    pub sdp_type: SdpType,

    /// Raw SDP
    pub sdp: String,
}

impl SessionDescription {
    /// Offer description
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// Answer description
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Connectivity candidate (browser `RTCIceCandidateInit` shape)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate line
    pub candidate: String,

    /// Media stream identification tag
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,

    /// Media line index
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    /// Candidate without media-line hints
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }

    /// Empty candidate line (end-of-candidates marker)
    pub fn is_end_of_candidates(&self) -> bool {
        self.candidate.trim().is_empty()
    }
}

/// Message carried by the signaling channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalingMessage {
    /// A participant joined the room
    #[serde(rename = "user_joined")]
    PresenceJoined {
        /// Joining user
        user_id: String,
        /// Their platform role
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_role: Option<UserRole>,
        /// Relay time
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<String>,
    },

    /// A participant left the room
    #[serde(rename = "user_left")]
    PresenceLeft {
        /// Leaving user
        user_id: String,
        /// Relay time
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<String>,
    },

    /// Session offer
    #[serde(rename = "offer")]
    Offer {
        /// Offer description
        offer: SessionDescription,
        /// Sender (stamped by the relay)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
    },

    /// Session answer
    #[serde(rename = "answer")]
    Answer {
        /// Answer description
        answer: SessionDescription,
        /// Sender (stamped by the relay)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
    },

    /// Connectivity candidate
    #[serde(rename = "ice-candidate")]
    IceCandidate {
        /// Candidate
        candidate: IceCandidate,
        /// Sender (stamped by the relay)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
    },

    /// Chat line
    #[serde(rename = "chat")]
    Chat {
        /// Text
        message: String,
        /// Sender (stamped by the relay)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        /// Relay time
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<String>,
        /// Sender e-mail, when the relay knows it
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_email: Option<String>,
    },
}

impl SignalingMessage {
    /// Outbound offer
    pub fn offer(sdp: impl Into<String>) -> Self {
        SignalingMessage::Offer {
            offer: SessionDescription::offer(sdp),
            from: None,
        }
    }

    /// Outbound answer
    pub fn answer(sdp: impl Into<String>) -> Self {
        SignalingMessage::Answer {
            answer: SessionDescription::answer(sdp),
            from: None,
        }
    }

    /// Outbound candidate
    pub fn candidate(candidate: IceCandidate) -> Self {
        SignalingMessage::IceCandidate {
            candidate,
            from: None,
        }
    }

    /// Outbound chat line
    pub fn chat(text: impl Into<String>) -> Self {
        SignalingMessage::Chat {
            message: text.into(),
            from: None,
            timestamp: None,
            from_email: None,
        }
    }

    /// Wire `type` value
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::PresenceJoined { .. } => "user_joined",
            SignalingMessage::PresenceLeft { .. } => "user_left",
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::IceCandidate { .. } => "ice-candidate",
            SignalingMessage::Chat { .. } => "chat",
        }
    }

    /// Whether this message belongs to the offer/answer/candidate exchange
    pub fn is_negotiation(&self) -> bool {
        matches!(
            self,
            SignalingMessage::Offer { .. }
                | SignalingMessage::Answer { .. }
                | SignalingMessage::IceCandidate { .. }
        )
    }

    /// Sender stamped by the relay
    pub fn sender(&self) -> Option<&str> {
        match self {
            SignalingMessage::Offer { from, .. }
            | SignalingMessage::Answer { from, .. }
            | SignalingMessage::IceCandidate { from, .. }
            | SignalingMessage::Chat { from, .. } => from.as_deref(),
            SignalingMessage::PresenceJoined { user_id, .. }
            | SignalingMessage::PresenceLeft { user_id, .. } => Some(user_id),
        }
    }

    /// Copy with the relay's `from` stamp
    pub fn stamped(mut self, sender: &str) -> Self {
        match &mut self {
            SignalingMessage::Offer { from, .. }
            | SignalingMessage::Answer { from, .. }
            | SignalingMessage::IceCandidate { from, .. }
            | SignalingMessage::Chat { from, .. } => *from = Some(sender.to_string()),
            SignalingMessage::PresenceJoined { .. } | SignalingMessage::PresenceLeft { .. } => {}
        }
        self
    }

    /// Serialize to a JSON frame
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a JSON frame; unknown `type` values are an error
    pub fn from_json(json: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
