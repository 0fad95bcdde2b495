//! services/api/src/web/registry.rs
//!
//! The live-session registry: the single authoritative map from identity to the
//! session that can currently be written to.
//!
//! Every read and write goes through one `RwLock`. Callers never hold the lock
//! across a socket write; they clone the handle out and write through its channel.

use crate::error::SessionError;
use crate::web::protocol::Outbound;
use couple_chat_core::Identity;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

//=========================================================================================
// SessionHandle
//=========================================================================================

/// A cloneable, writable reference to one live session.
///
/// Frames are queued on an unbounded channel drained by the session's writer
/// worker, so every frame for one session reaches the socket in send order.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    id: u64,
    identity: Identity,
    tx: mpsc::UnboundedSender<Outbound>,
    token: CancellationToken,
}

impl SessionHandle {
    /// Creates a handle and the receiver its writer worker drains.
    pub fn new(identity: Identity) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            identity,
            tx,
            token: CancellationToken::new(),
        };
        (handle, rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    /// Cancelled when the session ends for any reason, including being superseded.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled() || self.tx.is_closed()
    }

    /// Queues a frame. Fails once the session is closed, superseded, or its writer is gone.
    pub fn send(&self, frame: Outbound) -> Result<(), SessionError> {
        if self.token.is_cancelled() {
            return Err(SessionError::Closed(self.identity.to_string()));
        }
        self.tx
            .send(frame)
            .map_err(|_| SessionError::Closed(self.identity.to_string()))
    }

    /// Ends the session: its read loop, writer and keep-alive all observe the token.
    pub fn close(&self) {
        self.token.cancel();
    }
}

//=========================================================================================
// SessionRegistry
//=========================================================================================

#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<Identity, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the session for its identity. A previously registered session is
    /// closed and returned; it must not be written to again.
    pub async fn register(&self, handle: SessionHandle) -> Option<SessionHandle> {
        let identity = handle.identity();
        let previous = self.sessions.write().await.insert(identity, handle);
        if let Some(old) = &previous {
            info!(identity = %identity, old_session = old.id(), "Session superseded by a new connection");
            old.close();
        }
        previous
    }

    /// Removes and closes whatever session is registered for the identity.
    /// A missing entry is fine.
    pub async fn unregister(&self, identity: Identity) -> Option<SessionHandle> {
        let removed = self.sessions.write().await.remove(&identity);
        match &removed {
            Some(handle) => handle.close(),
            None => debug!(identity = %identity, "Unregister for identity with no live session"),
        }
        removed
    }

    /// Removes the handle only if it is still the registered one, so a superseded
    /// session's cleanup never evicts its replacement.
    pub async fn release(&self, handle: &SessionHandle) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(&handle.identity()) {
            Some(current) if current.id() == handle.id() => {
                sessions.remove(&handle.identity());
                true
            }
            _ => false,
        }
    }

    /// The most recently registered session for the identity, if any.
    pub async fn lookup(&self, identity: Identity) -> Option<SessionHandle> {
        self.sessions.read().await.get(&identity).cloned()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
