//! Error types for the chatsync engine
//!
//! Domain errors use thiserror. Event-level lookup misses are not errors at
//! all: the reducer treats them as no-ops, so nothing here models them.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Top-level engine error
#[derive(Debug, Error)]
pub enum EngineError {
    /// Event vocabulary errors
    #[error("Vocabulary error: {0}")]
    Vocabulary(#[from] VocabularyError),

    /// Transport errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Conversation directory errors
    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),
}

/// Errors raised while decoding the closed event vocabulary
#[derive(Debug, Error)]
pub enum VocabularyError {
    /// The event carries no `type` discriminator
    #[error("event is missing its type discriminator")]
    MissingKind,

    /// The event kind is outside the closed vocabulary
    #[error("unknown event kind '{0}'")]
    UnknownKind(String),

    /// A known event kind with a body that does not match its schema
    #[error("malformed '{kind}' event: {detail}")]
    Malformed {
        /// Event kind that failed to decode
        kind: String,
        /// Decoder message
        detail: String,
    },
}

/// Errors raised by the transport adapter
///
/// Every variant is transport-fatal: the engine never retries on its own.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Socket I/O failed
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// A frame could not be parsed as JSON or has an unknown frame type
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// A frame arrived that is not valid at this point of the protocol
    #[error("unexpected '{0}' frame")]
    UnexpectedFrame(&'static str),

    /// The server answered with an `error` frame
    #[error("server error: {0}")]
    Remote(String),

    /// The socket closed before the snapshot arrived
    #[error("connection closed before snapshot")]
    ClosedBeforeSnapshot,

    /// The subscription was closed before the snapshot arrived
    #[error("subscription cancelled")]
    Cancelled,

    /// An event frame carried an event outside the vocabulary
    #[error(transparent)]
    Vocabulary(#[from] VocabularyError),
}

/// Configuration file errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read or written
    #[error("config file {path}: {source}")]
    Io {
        /// Path of the config file
        path: PathBuf,
        /// Underlying I/O error
        source: io::Error,
    },

    /// Config file content is not valid JSON for [`crate::engine::ClientConfig`]
    #[error("invalid config {path}: {source}")]
    Parse {
        /// Path of the config file
        path: PathBuf,
        /// Underlying JSON error
        source: serde_json::Error,
    },

    /// A config value is present but unusable
    #[error("invalid value for '{field}': {detail}")]
    InvalidValue {
        /// Offending field
        field: &'static str,
        /// Why it was rejected
        detail: String,
    },
}

/// Errors surfaced by a conversation directory
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// Conversation not found
    #[error("conversation '{0}' not found")]
    NotFound(String),

    /// Backend-specific failure
    #[error("directory backend failed: {0}")]
    Backend(String),
}

/// Convenience result alias for transport operations
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Convenience result alias for directory operations
pub type DirectoryResult<T> = std::result::Result<T, DirectoryError>;

/// Result type using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;
