// src/error.rs

use std::path::PathBuf;
use thiserror::Error;

/// Core error types for Stevedore
#[derive(Error, Debug)]
pub enum Error {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// I/O errors with the offending path already folded into the message
    #[error("I/O error: {0}")]
    IoError(String),

    /// Database or state directory initialization error
    #[error("Failed to initialize: {0}")]
    InitError(String),

    /// Database not found
    #[error("Database not found at path: {0}")]
    DatabaseNotFound(String),

    /// Malformed record, control file or index stanza
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Lookup of a package, mapping or setting failed
    #[error("Not found: {0}")]
    NotFoundError(String),

    /// Request contradicts existing state
    #[error("Conflict: {0}")]
    ConflictError(String),

    /// Transport failure while fetching an index or archive
    #[error("Download error: {0}")]
    DownloadError(String),

    /// Cached archive does not match the index checksum
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// One or more packages use an unsupported standards version or environment
    #[error("Cannot process packages: {}", .0.join(", "))]
    CannotProcess(Vec<String>),

    /// Destination objects block installation and are not being removed
    #[error("File conflict: {}", display_paths(.0))]
    FileConflict(Vec<PathBuf>),

    /// Archive is missing an entry its manifest requires
    #[error("File info not found: {path} in package {package}")]
    FileInfoNotFound { package: String, path: String },

    /// A trigger script reported an error
    #[error("Trigger {point} for {package} failed: {message}")]
    TriggerFailed {
        package: String,
        point: String,
        message: String,
    },

    /// Status, manifest or control data could not be durably written
    #[error("Persistence error: {0}")]
    PersistenceError(String),
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type alias using Stevedore's Error type
pub type Result<T> = std::result::Result<T, Error>;
