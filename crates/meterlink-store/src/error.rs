//! Error types for meterlink-store.

use std::path::PathBuf;

/// Result type for meterlink-store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in meterlink-store.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Database error from SQLite.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Failed to create database directory.
    #[error("Failed to create database directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Device not found in database.
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// A stored value could not be turned back into its type.
    #[error("Corrupt {column} in database: {reason}")]
    Corrupt { column: &'static str, reason: String },

    /// The database was written by a newer schema.
    #[error("Database schema version {found} is newer than supported version {supported}")]
    UnsupportedSchema { found: i32, supported: i32 },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn corrupt(column: &'static str, reason: impl std::fmt::Display) -> Self {
        Self::Corrupt {
            column,
            reason: reason.to_string(),
        }
    }
}
