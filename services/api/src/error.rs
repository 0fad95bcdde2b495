//! services/api/src/error.rs
//!
//! Defines the error types for the chat service.

use crate::config::ConfigError;
use couple_chat_core::ConnectionId;

/// The primary error type for the `api` service.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Represents an error that occurred during configuration loading.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Represents an error from the underlying database library.
    #[error("Database Error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration Error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// Represents a standard Input/Output error (e.g., binding to a network socket).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A catch-all for any other unexpected errors.
    #[error("An unexpected internal error occurred: {0}")]
    Internal(String),
}

/// A write to a live session failed. The session is torn down; its peer is not.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session for {0} is closed or superseded")]
    Closed(String),
}

/// Rejections from the teardown scheduler.
#[derive(Debug, thiserror::Error)]
pub enum TeardownError {
    #[error("A teardown is already pending for connection {0}")]
    AlreadyPending(ConnectionId),
}
