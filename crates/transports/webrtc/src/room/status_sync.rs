//! Fire-and-forget room status updates
//!
//! Each update runs on its own task with a bounded retry policy. Failures are
//! logged and never reach the call. Records the Room Service returns are sent
//! back to the session loop so it can refresh its cached room.
//!
//! Once `ended` is dispatched, a pending `active` retry is dropped and `ended`
//! goes out only after the `active` task has settled, so the Room Service never
//! sees `active` after `ended` from this client.

use crate::lifecycle::ReconnectionPolicy;
use std::sync::Arc;
use std::time::Duration;
use teleconsult_core::{Error as RoomError, RoomRecord, RoomService, StatusUpdate};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub(crate) struct StatusSync {
    service: Arc<dyn RoomService>,
    room_id: String,
    policy: ReconnectionPolicy,
    results: mpsc::UnboundedSender<RoomRecord>,
    ending: watch::Sender<bool>,
    active: Option<JoinHandle<()>>,
    ended: Option<JoinHandle<()>>,
}

impl StatusSync {
    pub(crate) fn new(
        service: Arc<dyn RoomService>,
        room_id: &str,
        policy: ReconnectionPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<RoomRecord>) {
        let (results, rx) = mpsc::unbounded_channel();
        let (ending, _) = watch::channel(false);
        (
            Self {
                service,
                room_id: room_id.to_string(),
                policy,
                results,
                ending,
                active: None,
                ended: None,
            },
            rx,
        )
    }

    /// Mark the room active; only the first call does anything
    pub(crate) fn notify_active(&mut self) {
        if self.active.is_some() || self.ended.is_some() {
            return;
        }
        let update = self.update_task(StatusUpdate::active(), Some(self.ending.subscribe()));
        self.active = Some(tokio::spawn(update));
    }

    /// Mark the room ended; only the first call does anything
    pub(crate) fn notify_ended(&mut self, minutes: u32) {
        if self.ended.is_some() {
            return;
        }
        self.ending.send_replace(true);
        let active = self.active.take();
        let update = self.update_task(StatusUpdate::ended(minutes), None);
        self.ended = Some(tokio::spawn(async move {
            if let Some(active) = active {
                let _ = active.await;
            }
            update.await;
        }));
    }

    /// Wait up to `timeout` for the `ended` update to finish
    pub(crate) async fn flush(&mut self, timeout: Duration) {
        let Some(handle) = self.ended.as_mut() else {
            return;
        };
        if handle.is_finished() {
            return;
        }
        if tokio::time::timeout(timeout, handle).await.is_err() {
            warn!(
                "Ended status for room {} still pending after {:?}; leaving it to finish in the background",
                self.room_id, timeout
            );
        }
    }

    fn update_task(
        &self,
        update: StatusUpdate,
        ending: Option<watch::Receiver<bool>>,
    ) -> impl std::future::Future<Output = ()> + Send + 'static {
        push(
            Arc::clone(&self.service),
            self.room_id.clone(),
            update,
            self.policy.clone(),
            self.results.clone(),
            ending,
        )
    }
}

async fn push(
    service: Arc<dyn RoomService>,
    room_id: String,
    update: StatusUpdate,
    policy: ReconnectionPolicy,
    results: mpsc::UnboundedSender<RoomRecord>,
    mut ending: Option<watch::Receiver<bool>>,
) {
    let mut attempt = 0;
    loop {
        if ending.as_ref().is_some_and(|rx| *rx.borrow()) {
            debug!("Room {} is ending, dropping {}", room_id, update.status);
            return;
        }
        match service.update_room_status(&room_id, update.clone()).await {
            Ok(record) => {
                info!("Room {} is now {}", room_id, record.status);
                let _ = results.send(record);
                return;
            }
            Err(RoomError::InvalidTransition { from, to }) => {
                debug!("Room {} already {}, skipping {}", room_id, from, to);
                return;
            }
            Err(e) if e.is_retryable() && policy.should_retry(attempt) => {
                let delay = policy.calculate_backoff(attempt);
                warn!(
                    "Status update {} for room {} failed (attempt {}), retrying in {:?}: {}",
                    update.status,
                    room_id,
                    attempt + 1,
                    delay,
                    e
                );
                match ending.as_mut() {
                    Some(rx) => {
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = ending_dispatched(rx) => {
                                debug!("Room {} is ending, dropping {}", room_id, update.status);
                                return;
                            }
                        }
                    }
                    None => tokio::time::sleep(delay).await,
                }
                attempt += 1;
            }
            Err(e) => {
                warn!(
                    "Giving up on status update {} for room {}: {}",
                    update.status, room_id, e
                );
                return;
            }
        }
    }
}

async fn ending_dispatched(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use teleconsult_core::{
        CreateRoomRequest, InMemoryRoomService, ParticipantContext, RoomStatus, UserRole,
    };

    fn fast_policy(max_retries: u32) -> ReconnectionPolicy {
        ReconnectionPolicy {
            max_retries,
            backoff_initial_ms: 1,
            backoff_max_ms: 5,
            backoff_multiplier: 2.0,
            jitter_enabled: false,
        }
    }

    async fn room() -> (InMemoryRoomService, Arc<dyn RoomService>, String) {
        let rooms = InMemoryRoomService::new();
        let host = rooms.client_for(ParticipantContext::new("doc-1", UserRole::Doctor));
        rooms.register_user(&ParticipantContext::new("pat-1", UserRole::Patient));
        let record = host.create_room(CreateRoomRequest::new("pat-1")).await.unwrap();
        (rooms, Arc::new(host), record.id)
    }

    #[tokio::test]
    async fn test_active_then_ended_once() {
        let (rooms, client, room_id) = room().await;
        let (mut sync, mut results) = StatusSync::new(client, &room_id, fast_policy(3));

        sync.notify_active();
        sync.notify_active();
        assert_eq!(results.recv().await.unwrap().status, RoomStatus::Active);

        sync.notify_ended(7);
        sync.notify_ended(9);
        sync.flush(Duration::from_secs(1)).await;

        let updates = rooms.status_updates();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[1].1, StatusUpdate::ended(7));
        assert_eq!(rooms.room(&room_id).unwrap().actual_duration, Some(7));
    }

    #[tokio::test]
    async fn test_retries_transient_failures() {
        let (rooms, client, room_id) = room().await;
        rooms.fail_status_updates(2);
        let (mut sync, _results) = StatusSync::new(client, &room_id, fast_policy(3));

        sync.notify_ended(1);
        sync.flush(Duration::from_secs(1)).await;

        assert_eq!(rooms.room(&room_id).unwrap().status, RoomStatus::Ended);
    }

    #[tokio::test]
    async fn test_gives_up_after_policy() {
        let (rooms, client, room_id) = room().await;
        rooms.fail_status_updates(5);
        let (mut sync, _results) = StatusSync::new(client, &room_id, fast_policy(1));

        sync.notify_ended(1);
        sync.flush(Duration::from_secs(1)).await;

        assert_eq!(rooms.room(&room_id).unwrap().status, RoomStatus::Scheduled);
        assert!(rooms.status_updates().is_empty());
    }

    #[tokio::test]
    async fn test_active_suppressed_after_end() {
        let (rooms, client, room_id) = room().await;
        let (mut sync, _results) = StatusSync::new(client, &room_id, fast_policy(0));

        sync.notify_ended(0);
        sync.notify_active();
        sync.flush(Duration::from_secs(1)).await;

        assert_eq!(rooms.status_updates().len(), 1);
    }

    #[tokio::test]
    async fn test_pending_active_retry_dropped_once_ended() {
        let (rooms, client, room_id) = room().await;
        rooms.fail_status_updates(1);
        let policy = ReconnectionPolicy {
            backoff_initial_ms: 200,
            backoff_max_ms: 200,
            ..fast_policy(3)
        };
        let (mut sync, _results) = StatusSync::new(client, &room_id, policy);

        sync.notify_active();
        tokio::time::sleep(Duration::from_millis(10)).await;
        sync.notify_ended(3);
        sync.flush(Duration::from_secs(1)).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        let sent: Vec<RoomStatus> = rooms
            .status_attempts()
            .into_iter()
            .map(|(_, update)| update.status)
            .collect();
        assert_eq!(sent, vec![RoomStatus::Active, RoomStatus::Ended]);
        assert_eq!(rooms.room(&room_id).unwrap().status, RoomStatus::Ended);
    }
}
