//! HttpRoomService against a local axum server
//!
//! The server mimics the video-conference REST API closely enough to check
//! request shapes and the status-code to error mapping.

use axum::extract::{Path, Query};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::collections::HashMap;
use teleconsult_core::{
    Error, HttpRoomService, ParticipantContext, RoomService, RoomStatus, StatusUpdate, UserRole,
};

const TOKEN: &str = "join-token";

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,teleconsult_core=debug")
        .try_init();
}

fn room_json(id: &str, status: &str) -> Value {
    json!({
        "id": id,
        "token": TOKEN,
        "host_id": "doc-1",
        "participant_id": "pat-1",
        "room_type": "consultation",
        "duration_minutes": 30,
        "status": status,
        "created_at": "2024-05-01T10:00:00.000000+00:00"
    })
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map_or(false, |v| v == "Bearer secret")
}

async fn get_room(
    Path(id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if id == "missing" {
        return (StatusCode::NOT_FOUND, "Room not found").into_response();
    }
    if query.get("token").map(String::as_str) != Some(TOKEN) {
        return (StatusCode::FORBIDDEN, "Invalid room token").into_response();
    }
    Json(json!({
        "room": room_json(&id, "scheduled"),
        "host_email": "doc@example.com",
        "participant_email": "pat@example.com",
        "is_host": false
    }))
    .into_response()
}

async fn update_status(Path(id): Path<String>, Json(body): Json<Value>) -> Response {
    let status = body["status"].as_str().unwrap_or_default().to_string();
    if id == "broken" {
        return (StatusCode::INTERNAL_SERVER_ERROR, "database down").into_response();
    }
    let mut room = room_json(&id, &status);
    if let Some(minutes) = body.get("actual_duration") {
        room["actual_duration"] = minutes.clone();
    }
    Json(json!({ "room": room })).into_response()
}

async fn create_emergency() -> Response {
    (StatusCode::SERVICE_UNAVAILABLE, "No emergency doctors available").into_response()
}

async fn get_messages(Path(id): Path<String>) -> Json<Value> {
    Json(json!({
        "messages": [
            {
                "id": "m-1",
                "room_id": id,
                "sender_id": "pat-1",
                "message": "hello",
                "timestamp": "2024-05-01T10:01:00.000000+00:00",
                "sender_email": "pat@example.com"
            },
            {
                "id": "m-2",
                "room_id": id,
                "sender_id": "doc-1",
                "message": "hi there",
                "timestamp": "2024-05-01T10:02:00.000000+00:00",
                "sender_email": null
            }
        ]
    }))
}

async fn invite(Path(id): Path<String>, Query(query): Query<HashMap<String, String>>) -> Json<Value> {
    assert_eq!(query.get("invite_message").map(String::as_str), Some("join please"));
    Json(json!({
        "success": true,
        "message": "Invitation sent successfully",
        "join_url": format!("/video/room/{}?token={}", id, TOKEN),
        "room_id": id
    }))
}

async fn usage() -> Json<Value> {
    Json(json!({
        "video_stats": {
            "total_sessions": 4,
            "completed_sessions": 3,
            "emergency_sessions": 1,
            "avg_duration_minutes": 21.33
        }
    }))
}

async fn spawn_server() -> String {
    let app = Router::new()
        .route("/video/rooms/:id", get(get_room))
        .route("/video/rooms/:id/status", put(update_status))
        .route("/video/rooms/:id/messages", get(get_messages))
        .route("/video/rooms/:id/invite", post(invite))
        .route("/video/emergency/create", post(create_emergency))
        .route("/video/stats/usage", get(usage));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn client(base: &str, role: UserRole, user_id: &str) -> HttpRoomService {
    HttpRoomService::new(base, "secret", ParticipantContext::new(user_id, role)).unwrap()
}

#[tokio::test]
async fn test_get_room_maps_access_errors() {
    init_logging();
    let base = spawn_server().await;
    let service = client(&base, UserRole::Patient, "pat-1");

    let view = service.get_room("room-1", TOKEN).await.unwrap();
    assert_eq!(view.room.id, "room-1");
    assert_eq!(view.room.status, RoomStatus::Scheduled);
    assert_eq!(view.host_email.as_deref(), Some("doc@example.com"));

    let err = service.get_room("room-1", "bad").await.unwrap_err();
    assert!(matches!(err, Error::InvalidToken(_)), "got {:?}", err);

    let err = service.get_room("missing", TOKEN).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)), "got {:?}", err);
}

#[tokio::test]
async fn test_bad_bearer_token_is_rejected() {
    init_logging();
    let base = spawn_server().await;
    let service = HttpRoomService::new(
        &base,
        "stale",
        ParticipantContext::new("pat-1", UserRole::Patient),
    )
    .unwrap();

    let err = service.get_room("room-1", TOKEN).await.unwrap_err();
    assert!(err.is_access_error());
}

#[tokio::test]
async fn test_update_status_sends_actual_duration() {
    init_logging();
    let base = spawn_server().await;
    let service = client(&base, UserRole::Doctor, "doc-1");

    let room = service
        .update_room_status("room-1", StatusUpdate::ended(17))
        .await
        .unwrap();
    assert_eq!(room.status, RoomStatus::Ended);
    assert_eq!(room.actual_duration, Some(17));

    let err = service
        .update_room_status("broken", StatusUpdate::active())
        .await
        .unwrap_err();
    assert!(err.is_retryable(), "5xx should be retryable: {:?}", err);
}

#[tokio::test]
async fn test_emergency_without_doctor() {
    init_logging();
    let base = spawn_server().await;
    let service = client(&base, UserRole::Patient, "pat-1");

    let err = service.create_emergency_room("pat-1").await.unwrap_err();
    assert!(matches!(err, Error::NoDoctorAvailable), "got {:?}", err);
}

#[tokio::test]
async fn test_history_invite_and_stats() {
    init_logging();
    let base = spawn_server().await;
    let service = client(&base, UserRole::Doctor, "doc-1");

    let history = service.get_messages("room-1").await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].text, "hello");
    assert!(history[1].sender_email.is_none());

    let invite = service
        .send_invite("room-1", Some("join please".to_string()))
        .await
        .unwrap();
    assert_eq!(invite.room_id, "room-1");
    assert!(invite.join_url.ends_with(TOKEN));

    let stats = service.usage_stats().await.unwrap();
    assert_eq!(stats.total_sessions, 4);
    assert_eq!(stats.avg_duration_minutes, 21.33);
}
