//! crates/couple_chat_core/src/ports.rs
//!
//! Defines the collaborator contracts (traits) the real-time core consumes.
//! These traits form the boundary of the hexagonal architecture, keeping the
//! relay, trigger engine and teardown scheduler independent of Postgres or the
//! filesystem.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use std::pin::Pin;

use crate::domain::{
    AnswerRecord, ChatMessage, ConnectionId, Identity, MessageId, NewChatMessage, PairOrder,
    Pairing, Question, QuestionId,
};

//=========================================================================================
// Generic Port Error and Result Types
//=========================================================================================

/// A generic error type for all port operations.
/// This abstracts away the specific errors from external services (database, disk).
#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("Item not found: {0}")]
    NotFound(String),
    #[error("Persistence failure: {0}")]
    Persistence(String),
    #[error("Unauthorized")]
    Unauthorized,
}

/// A convenience type alias for `Result<T, PortError>`.
pub type PortResult<T> = Result<T, PortError>;

/// A lazy, restartable sequence of catalog questions.
pub type QuestionStream = Pin<Box<dyn Stream<Item = PortResult<Question>> + Send>>;

//=========================================================================================
// Collaborator Ports (Traits)
//=========================================================================================

/// Resolves the pre-authenticated identity token carried by a request.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve_identity(&self, token: &str) -> PortResult<Identity>;
}

#[async_trait]
pub trait PairingDirectory: Send + Sync {
    /// Returns the pairing the identity belongs to, or `NotFound` when unpaired.
    async fn resolve_pairing(&self, identity: Identity) -> PortResult<Pairing>;

    async fn order_of(&self, identity: Identity) -> PortResult<PairOrder>;

    async fn pairing_by_connection(&self, connection_id: ConnectionId) -> PortResult<Pairing>;

    /// Deletes the connection record and everything the store considers owned by it.
    async fn delete_connection(&self, pairing: &Pairing) -> PortResult<()>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn insert(&self, message: NewChatMessage) -> PortResult<MessageId>;

    async fn find_message(&self, message_id: MessageId) -> PortResult<Option<ChatMessage>>;

    async fn soft_delete(&self, message_id: MessageId) -> PortResult<()>;

    /// All messages written by either party, oldest first.
    async fn list_by_connection(
        &self,
        first: Identity,
        second: Identity,
    ) -> PortResult<Vec<ChatMessage>>;

    /// The question asked in this connection whose answer column for `order` is still empty.
    async fn pending_question_for_order(
        &self,
        order: PairOrder,
        connection_id: ConnectionId,
    ) -> PortResult<Option<QuestionId>>;

    /// The most recent file-bearing message written by `sender`.
    async fn latest_file_message(&self, sender: Identity) -> PortResult<Option<ChatMessage>>;
}

#[async_trait]
pub trait QuestionCatalog: Send + Sync {
    /// Streams the whole catalog in its stable iteration order.
    async fn stream_questions(&self) -> PortResult<QuestionStream>;

    async fn find_question(&self, question_id: QuestionId) -> PortResult<Question>;
}

#[async_trait]
pub trait AnswerStore: Send + Sync {
    async fn exists(&self, connection_id: ConnectionId, question_id: QuestionId)
        -> PortResult<bool>;

    async fn insert(
        &self,
        asked_at: DateTime<Utc>,
        connection_id: ConnectionId,
        question_id: QuestionId,
    ) -> PortResult<()>;

    async fn update_first(
        &self,
        text: &str,
        connection_id: ConnectionId,
        question_id: QuestionId,
    ) -> PortResult<()>;

    async fn update_second(
        &self,
        text: &str,
        connection_id: ConnectionId,
        question_id: QuestionId,
    ) -> PortResult<()>;

    async fn list_for_connection(&self, connection_id: ConnectionId)
        -> PortResult<Vec<AnswerRecord>>;
}

/// Binary storage addressed by the `"{messageId}-{originalName}"` naming convention.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Removes every blob belonging to the message and returns how many were removed.
    /// Attempts all matches before reporting a failure.
    async fn remove_for_message(&self, message_id: MessageId) -> PortResult<usize>;
}
