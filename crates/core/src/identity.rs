//! Participant identity passed explicitly into session components

use serde::{Deserialize, Serialize};
use std::fmt;

/// Platform-level role of an authenticated user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    /// Patient account
    Patient,
    /// Doctor account
    Doctor,
    /// Platform administrator
    Admin,
}

impl UserRole {
    /// Wire representation (`user_role` query parameter, presence events)
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Patient => "patient",
            UserRole::Doctor => "doctor",
            UserRole::Admin => "admin",
        }
    }
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role of the local participant within one room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    /// Room creator; the only side allowed to start the call
    Host,
    /// Invited participant; answers the host's offer
    Guest,
}

impl ParticipantRole {
    /// Whether this participant may initiate the call
    pub fn can_initiate(&self) -> bool {
        matches!(self, ParticipantRole::Host)
    }
}

/// Identity of the caller, handed to every component that needs it
///
/// There is no ambient "current user": the Room Service client, the signaling
/// transport and the room coordinator each receive this context explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantContext {
    /// Stable user id
    pub user_id: String,

    /// Platform role
    pub role: UserRole,

    /// Display e-mail, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl ParticipantContext {
    /// Create a context without an e-mail
    pub fn new(user_id: impl Into<String>, role: UserRole) -> Self {
        Self {
            user_id: user_id.into(),
            role,
            email: None,
        }
    }

    /// Attach a display e-mail
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }
}
