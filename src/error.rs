// src/error.rs

use thiserror::Error;

/// Core error types for the catalog
#[derive(Error, Debug)]
pub enum Error {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding/decoding of stored lists or index files
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration file could not be parsed
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// Database initialization error
    #[error("Failed to initialize database: {0}")]
    InitError(String),

    /// Database not found
    #[error("Database not found at path: {0}")]
    DatabaseNotFound(String),

    /// A requested record does not exist
    #[error("Not found: {0}")]
    NotFoundError(String),

    /// A record with the same identity already exists
    #[error("Conflict: {0}")]
    ConflictError(String),

    /// A single index record failed validation
    #[error("Invalid record for {package}: {reason}")]
    InvalidRecord { package: String, reason: String },

    /// Timestamps and other textual values that fail to parse
    #[error("Parse error: {0}")]
    ParseError(String),

    /// The index source failed before it was terminated
    #[error("Sync aborted: {0}")]
    SyncAborted(String),
}

/// Result type alias using the catalog's Error type
pub type Result<T> = std::result::Result<T, Error>;
