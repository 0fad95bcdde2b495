//! services/api/src/web/teardown_task.rs
//!
//! Delayed, cancellable deletion of a connection and everything it owns.
//!
//! Each connection has at most one slot. A slot is `Pending` while its grace
//! timer runs and `Firing` while the cleanup itself runs. Requests, rollbacks
//! and the timer all move slots under one mutex.

use crate::error::TeardownError;
use crate::web::{question_task::QuestionEngine, registry::SessionRegistry};
use couple_chat_core::{
    ports::{BlobStore, MessageStore, PairingDirectory},
    ConnectionId,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackOutcome {
    /// A pending teardown was cancelled.
    Cancelled,
    /// Nothing was pending, or the teardown had already run.
    NothingPending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum TeardownState {
    Absent,
    Pending,
    /// The grace period elapsed and the cleanup is running.
    Fired,
}

enum Phase {
    Pending { cancel: CancellationToken },
    Firing { done: watch::Receiver<bool> },
}

struct Slot {
    generation: u64,
    phase: Phase,
}

pub struct TeardownScheduler {
    grace: Duration,
    directory: Arc<dyn PairingDirectory>,
    messages: Arc<dyn MessageStore>,
    blobs: Arc<dyn BlobStore>,
    questions: Arc<QuestionEngine>,
    registry: Arc<SessionRegistry>,
    slots: Mutex<HashMap<ConnectionId, Slot>>,
    next_generation: AtomicU64,
}

impl TeardownScheduler {
    pub fn new(
        grace: Duration,
        directory: Arc<dyn PairingDirectory>,
        messages: Arc<dyn MessageStore>,
        blobs: Arc<dyn BlobStore>,
        questions: Arc<QuestionEngine>,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            grace,
            directory,
            messages,
            blobs,
            questions,
            registry,
            slots: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Arms the grace timer for the connection. Fails if one is already armed or firing.
    pub async fn request_disconnect(
        self: &Arc<Self>,
        connection_id: ConnectionId,
    ) -> Result<(), TeardownError> {
        let mut slots = self.slots.lock().await;
        if slots.contains_key(&connection_id) {
            return Err(TeardownError::AlreadyPending(connection_id));
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        slots.insert(
            connection_id,
            Slot {
                generation,
                phase: Phase::Pending {
                    cancel: cancel.clone(),
                },
            },
        );
        drop(slots);

        info!(connection_id = %connection_id, grace_secs = self.grace.as_secs(), "Teardown scheduled");
        let scheduler = self.clone();
        tokio::spawn(async move {
            scheduler.run_timer(connection_id, generation, cancel).await;
        });
        Ok(())
    }

    /// Cancels a pending teardown. A teardown already firing is waited for and
    /// then reported as nothing pending.
    pub async fn rollback(&self, connection_id: ConnectionId) -> RollbackOutcome {
        let mut done = {
            let mut slots = self.slots.lock().await;
            match slots.get(&connection_id).map(|slot| &slot.phase) {
                None => {
                    debug!(connection_id = %connection_id, "Rollback with no pending teardown");
                    return RollbackOutcome::NothingPending;
                }
                Some(Phase::Pending { cancel }) => {
                    cancel.cancel();
                    slots.remove(&connection_id);
                    info!(connection_id = %connection_id, "Teardown rolled back");
                    return RollbackOutcome::Cancelled;
                }
                Some(Phase::Firing { done }) => done.clone(),
            }
        };

        info!(connection_id = %connection_id, "Rollback arrived while teardown is firing; waiting");
        // The sender is dropped only after the flag is set, so an error here also means done.
        let _ = done.wait_for(|finished| *finished).await;
        RollbackOutcome::NothingPending
    }

    pub async fn state(&self, connection_id: ConnectionId) -> TeardownState {
        match self.slots.lock().await.get(&connection_id).map(|slot| &slot.phase) {
            None => TeardownState::Absent,
            Some(Phase::Pending { .. }) => TeardownState::Pending,
            Some(Phase::Firing { .. }) => TeardownState::Fired,
        }
    }

    async fn run_timer(&self, connection_id: ConnectionId, generation: u64, cancel: CancellationToken) {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(connection_id = %connection_id, "Teardown timer cancelled");
                return;
            }
            _ = tokio::time::sleep(self.grace) => {}
        }

        let (done_tx, done_rx) = watch::channel(false);
        {
            let mut slots = self.slots.lock().await;
            match slots.get_mut(&connection_id) {
                Some(slot) if slot.generation == generation && matches!(slot.phase, Phase::Pending { .. }) => {
                    slot.phase = Phase::Firing { done: done_rx };
                }
                _ => {
                    debug!(connection_id = %connection_id, "Teardown slot changed before firing");
                    return;
                }
            }
        }

        self.fire(connection_id).await;

        self.slots.lock().await.remove(&connection_id);
        let _ = done_tx.send(true);
    }

    /// Deletes the file blobs of the connection's messages, then the connection
    /// with its messages and answers, then closes both parties' live sessions.
    /// Failures are logged and the remaining steps still run.
    async fn fire(&self, connection_id: ConnectionId) {
        info!(connection_id = %connection_id, "Teardown firing");

        let pairing = match self.directory.pairing_by_connection(connection_id).await {
            Ok(pairing) => pairing,
            Err(e) => {
                error!(connection_id = %connection_id, "Teardown could not load connection: {}", e);
                return;
            }
        };

        let messages = match self
            .messages
            .list_by_connection(pairing.first, pairing.second)
            .await
        {
            Ok(messages) => messages,
            Err(e) => {
                error!(connection_id = %connection_id, "Teardown could not list messages: {}", e);
                Vec::new()
            }
        };

        for message in &messages {
            if !message.is_file {
                continue;
            }
            match self.blobs.remove_for_message(message.id).await {
                Ok(count) => debug!(chat_id = %message.id, "Removed {} blob(s)", count),
                Err(e) => warn!(chat_id = %message.id, "Failed to remove blob: {}", e),
            }
        }

        if let Err(e) = self.directory.delete_connection(&pairing).await {
            error!(connection_id = %connection_id, "Failed to delete connection: {}", e);
            return;
        }
        self.questions.forget_connection(connection_id).await;

        // Their cached pairing is gone; they must reconnect to learn that.
        for member in pairing.members() {
            if self.registry.unregister(member).await.is_some() {
                debug!(identity = %member, connection_id = %connection_id, "Closed session of torn-down connection");
            }
        }

        info!(connection_id = %connection_id, "Teardown complete");
    }
}
