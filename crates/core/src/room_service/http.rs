//! HTTP/REST Room Service client
//!
//! Talks to the video-conference REST API:
//!
//! | Operation | Request |
//! |-----------|---------|
//! | create room | `POST /video/rooms/create` |
//! | get room | `GET /video/rooms/{id}?token=` |
//! | update status | `PUT /video/rooms/{id}/status` |
//! | emergency room | `POST /video/emergency/create` |
//! | chat history | `GET /video/rooms/{id}/messages` |
//! | recording | `GET /video/rooms/{id}/recording` |
//! | my rooms | `GET /video/rooms/my-rooms?status=&limit=` |
//! | invite | `POST /video/rooms/{id}/invite` |
//! | usage stats | `GET /video/stats/usage` |
//!
//! Requests carry the caller's bearer token.

use super::{
    CreateRoomRequest, EmergencyRoom, Recording, RoomInvite, RoomListFilter, RoomService,
    StatusUpdate, UsageStats,
};
use crate::chat::ChatMessage;
use crate::identity::ParticipantContext;
use crate::room::{RoomRecord, RoomView};
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use url::Url;

/// Which "access denied" flavour a 401/403 maps to
#[derive(Debug, Clone, Copy)]
enum AccessKind {
    /// Token-validated read (`get_room`)
    Token,
    /// Identity-checked operation
    Caller,
}

/// Room Service client over HTTP
pub struct HttpRoomService {
    /// Base URL, e.g. `http://localhost:8002`
    base_url: Url,

    /// Bearer token of the caller
    auth_token: String,

    /// Caller identity
    caller: ParticipantContext,

    /// Reqwest HTTP client
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct RoomEnvelope {
    room: RoomRecord,
}

#[derive(Debug, Deserialize)]
struct AssignedDoctor {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EmergencyEnvelope {
    room: RoomRecord,
    #[serde(default)]
    assigned_doctor: Option<AssignedDoctor>,
    join_url: String,
}

#[derive(Debug, Deserialize)]
struct MessagesEnvelope {
    #[serde(default)]
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct RoomsEnvelope {
    #[serde(default)]
    rooms: Vec<RoomView>,
}

#[derive(Debug, Deserialize)]
struct StatsEnvelope {
    video_stats: UsageStats,
}

impl HttpRoomService {
    /// Create a new client
    ///
    /// # Arguments
    ///
    /// * `base_url` - Server base URL (must start with `http://` or `https://`)
    /// * `auth_token` - Bearer token for the caller
    /// * `caller` - Identity the token belongs to
    pub fn new(
        base_url: &str,
        auth_token: impl Into<String>,
        caller: ParticipantContext,
    ) -> Result<Self> {
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(Error::InvalidRequest(format!(
                "Room Service base_url must start with http:// or https://, got: {}",
                base_url
            )));
        }

        let base_url = Url::parse(base_url)
            .map_err(|e| Error::InvalidRequest(format!("Invalid base_url: {}", e)))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            base_url,
            auth_token: auth_token.into(),
            caller,
            client,
        })
    }

    /// Caller identity this client acts for
    pub fn caller(&self) -> &ParticipantContext {
        &self.caller
    }

    /// Build `{base}/{segments...}` with each segment percent-encoded
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| Error::InvalidRequest(format!("Cannot-be-a-base URL: {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.auth_token)
    }

    /// Map a non-success response to the contract's error taxonomy
    async fn check(response: Response, subject: &str, access: AccessKind) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        debug!("Room Service returned HTTP {} for {}: {}", status, subject, body);

        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => match access {
                AccessKind::Token => Error::InvalidToken(format!("{}: {}", subject, body)),
                AccessKind::Caller => Error::Unauthorized(format!("{}: {}", subject, body)),
            },
            StatusCode::NOT_FOUND => Error::NotFound(subject.to_string()),
            StatusCode::SERVICE_UNAVAILABLE if subject == "emergency" => Error::NoDoctorAvailable,
            _ => Error::ServerError {
                status: status.as_u16(),
                body,
            },
        })
    }

    async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T> {
        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl RoomService for HttpRoomService {
    #[instrument(skip(self, request), fields(participant = %request.participant_id))]
    async fn create_room(&self, request: CreateRoomRequest) -> Result<RoomRecord> {
        let url = self.endpoint(&["video", "rooms", "create"])?;
        let response = self
            .client
            .post(url)
            .header("authorization", self.bearer())
            .json(&request)
            .send()
            .await?;

        let response = Self::check(response, "create room", AccessKind::Caller).await?;
        let envelope: RoomEnvelope = Self::read_json(response).await?;
        Ok(envelope.room)
    }

    #[instrument(skip(self, token))]
    async fn get_room(&self, room_id: &str, token: &str) -> Result<RoomView> {
        let url = self.endpoint(&["video", "rooms", room_id])?;
        let response = self
            .client
            .get(url)
            .query(&[("token", token)])
            .header("authorization", self.bearer())
            .send()
            .await?;

        let response = Self::check(response, room_id, AccessKind::Token).await?;
        Self::read_json(response).await
    }

    #[instrument(skip(self, update), fields(status = %update.status))]
    async fn update_room_status(&self, room_id: &str, update: StatusUpdate) -> Result<RoomRecord> {
        let url = self.endpoint(&["video", "rooms", room_id, "status"])?;
        let response = self
            .client
            .put(url)
            .header("authorization", self.bearer())
            .json(&update)
            .send()
            .await?;

        let response = Self::check(response, room_id, AccessKind::Caller).await?;
        let envelope: RoomEnvelope = Self::read_json(response).await?;
        Ok(envelope.room)
    }

    #[instrument(skip(self))]
    async fn create_emergency_room(&self, patient_id: &str) -> Result<EmergencyRoom> {
        if patient_id != self.caller.user_id {
            warn!(
                "Refusing emergency room for {} on behalf of {}",
                patient_id, self.caller.user_id
            );
            return Err(Error::Unauthorized(
                "emergency rooms can only be created by the patient themselves".to_string(),
            ));
        }

        let url = self.endpoint(&["video", "emergency", "create"])?;
        let response = self
            .client
            .post(url)
            .header("authorization", self.bearer())
            .send()
            .await?;

        let response = Self::check(response, "emergency", AccessKind::Caller).await?;
        let envelope: EmergencyEnvelope = Self::read_json(response).await?;
        Ok(EmergencyRoom {
            room: envelope.room,
            doctor_name: envelope.assigned_doctor.and_then(|d| d.name),
            join_url: envelope.join_url,
        })
    }

    async fn get_messages(&self, room_id: &str) -> Result<Vec<ChatMessage>> {
        let url = self.endpoint(&["video", "rooms", room_id, "messages"])?;
        let response = self
            .client
            .get(url)
            .header("authorization", self.bearer())
            .send()
            .await?;

        let response = Self::check(response, room_id, AccessKind::Caller).await?;
        let envelope: MessagesEnvelope = Self::read_json(response).await?;
        Ok(envelope.messages)
    }

    async fn get_recording(&self, room_id: &str) -> Result<Recording> {
        let url = self.endpoint(&["video", "rooms", room_id, "recording"])?;
        let response = self
            .client
            .get(url)
            .header("authorization", self.bearer())
            .send()
            .await?;

        let response = Self::check(response, room_id, AccessKind::Caller).await?;
        Self::read_json(response).await
    }

    async fn list_rooms(&self, filter: RoomListFilter) -> Result<Vec<RoomView>> {
        let url = self.endpoint(&["video", "rooms", "my-rooms"])?;
        let mut request = self
            .client
            .get(url)
            .header("authorization", self.bearer())
            .query(&[("limit", filter.limit.to_string())]);
        if let Some(status) = filter.status {
            request = request.query(&[("status", status.as_str())]);
        }

        let response = Self::check(request.send().await?, "my-rooms", AccessKind::Caller).await?;
        let envelope: RoomsEnvelope = Self::read_json(response).await?;
        Ok(envelope.rooms)
    }

    async fn send_invite(&self, room_id: &str, message: Option<String>) -> Result<RoomInvite> {
        let url = self.endpoint(&["video", "rooms", room_id, "invite"])?;
        let mut request = self.client.post(url).header("authorization", self.bearer());
        if let Some(message) = message {
            request = request.query(&[("invite_message", message)]);
        }

        let response = Self::check(request.send().await?, room_id, AccessKind::Caller).await?;
        Self::read_json(response).await
    }

    async fn usage_stats(&self) -> Result<UsageStats> {
        let url = self.endpoint(&["video", "stats", "usage"])?;
        let response = self
            .client
            .get(url)
            .header("authorization", self.bearer())
            .send()
            .await?;

        let response = Self::check(response, "usage", AccessKind::Caller).await?;
        let envelope: StatsEnvelope = Self::read_json(response).await?;
        Ok(envelope.video_stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::UserRole;

    fn caller() -> ParticipantContext {
        ParticipantContext::new("doc-1", UserRole::Doctor)
    }

    #[test]
    fn test_rejects_non_http_base_url() {
        let result = HttpRoomService::new("ws://localhost:8002", "tok", caller());
        assert!(matches!(result, Err(Error::InvalidRequest(_))));
    }

    #[test]
    fn test_endpoint_encodes_segments() {
        let service = HttpRoomService::new("http://localhost:8002/api/", "tok", caller()).unwrap();
        let url = service.endpoint(&["video", "rooms", "a b", "status"]).unwrap();
        assert_eq!(url.as_str(), "http://localhost:8002/api/video/rooms/a%20b/status");
    }

    #[tokio::test]
    async fn test_emergency_room_requires_self() {
        let service = HttpRoomService::new("http://localhost:8002", "tok", caller()).unwrap();
        let result = service.create_emergency_room("someone-else").await;
        assert!(matches!(result, Err(Error::Unauthorized(_))));
    }
}
