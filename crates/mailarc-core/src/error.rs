//! Error types for mailarc

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using mailarc's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for mailarc
#[derive(Error, Debug)]
pub enum Error {
    // Mail server errors
    #[error("Connection failed to {host}: {reason}")]
    ConnectionFailed { host: String, reason: String },

    #[error("Authentication failed for {login}: {reason}")]
    Auth { login: String, reason: String },

    #[error("IMAP protocol error: {0}")]
    Protocol(String),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    // Store errors
    #[error("Storage error at {path:?}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Indexing errors
    #[error("Failed to parse message {path:?}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("Failed to apply index batch: {0}")]
    IndexApply(String),

    #[error("Index error: {0}")]
    Index(#[from] tantivy::TantivyError),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cannot read configuration {path:?}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot decode configuration {path:?}: {reason}")]
    ConfigParse { path: PathBuf, reason: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Generic errors
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Wrap an I/O failure on a store path
    pub fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Storage {
            path: path.into(),
            source,
        }
    }

    /// Returns true if a failed message fetch may be skipped without aborting the mailbox
    pub fn is_recoverable_fetch(&self) -> bool {
        matches!(self, Error::MalformedMessage(_))
    }

    /// Short label used in structured log fields
    pub fn kind(&self) -> &'static str {
        match self {
            Error::ConnectionFailed { .. } => "connection",
            Error::Auth { .. } => "auth",
            Error::Protocol(_) => "protocol",
            Error::MalformedMessage(_) => "malformed_message",
            Error::Storage { .. } => "storage",
            Error::Parse { .. } => "parse",
            Error::IndexApply(_) | Error::Index(_) => "index",
            Error::Config(_) | Error::ConfigRead { .. } | Error::ConfigParse { .. } => "config",
            Error::Io(_) => "io",
            Error::Json(_) => "serialization",
            Error::Other(_) => "other",
        }
    }
}
