//! Error types for pawtrail-tracker
//!
//! Every failure the core surfaces resolves to one of six kinds (see
//! [`ErrorKind`]). Transient network and location errors are retried where
//! they occur and never reach the caller individually.

use pawtrail_common::WalkState;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// Caller-facing failure category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Illegal state change attempted; not retried
    InvalidTransition,
    /// Business-rule guard not met; actionable by the user
    PreconditionFailed,
    /// Location provider failed; degraded tracking
    LocationUnavailable,
    /// Local storage exhausted; needs user intervention
    BufferFull,
    /// Retries exhausted; walk continues with a reporting gap
    PermanentFailure,
    /// Session unknown; client state needs re-sync
    NotFound,
}

/// Main error type for the tracker core
#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("Invalid transition for walk {session_id}: {from} -> {attempted}")]
    InvalidTransition {
        session_id: Uuid,
        from: WalkState,
        attempted: WalkState,
    },

    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Location unavailable: {0}")]
    LocationUnavailable(String),

    #[error("Sample buffer full: {0}")]
    BufferFull(String),

    #[error("Walk {session_id}: giving up after {attempts} attempts: {last_error}")]
    PermanentFailure {
        session_id: Uuid,
        attempts: u32,
        last_error: String,
    },

    #[error("Walk session not found: {0}")]
    NotFound(Uuid),

    /// Local database failure other than exhaustion
    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl TrackerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TrackerError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            TrackerError::PreconditionFailed(_) => ErrorKind::PreconditionFailed,
            TrackerError::LocationUnavailable(_) => ErrorKind::LocationUnavailable,
            TrackerError::BufferFull(_) => ErrorKind::BufferFull,
            TrackerError::PermanentFailure { .. } => ErrorKind::PermanentFailure,
            TrackerError::NotFound(_) => ErrorKind::NotFound,
            // Local storage that cannot be written is handled like exhaustion
            TrackerError::Storage(_) => ErrorKind::BufferFull,
            TrackerError::Config(_) => ErrorKind::PreconditionFailed,
        }
    }
}

/// Classify a sqlx error, turning SQLITE_FULL into `BufferFull`
pub(crate) fn storage_error(err: sqlx::Error) -> TrackerError {
    if let sqlx::Error::Database(db_err) = &err {
        // SQLITE_FULL = 13
        if db_err.code().as_deref() == Some("13") {
            return TrackerError::BufferFull(db_err.message().to_string());
        }
    }
    TrackerError::Storage(err)
}

/// Convenience Result type using the tracker error
pub type Result<T> = std::result::Result<T, TrackerError>;
