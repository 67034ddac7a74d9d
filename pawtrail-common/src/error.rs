//! Errors raised by the shared PawTrail layer
//!
//! Only setup and parsing fail here: opening the local database, reading the
//! config file, and decoding stored walk states. Runtime walk failures live in
//! the tracker's own error type.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// SQLite open, pragma or schema failure
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Cannot create data directory {}: {}", .path.display(), .source)]
    DataDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown walk state: {0}")]
    UnknownWalkState(String),
}
