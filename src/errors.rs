//! Error types for modelvault
//!
//! This module defines comprehensive error types for all components of the
//! engine. Errors are designed to be actionable and provide clear context for
//! debugging and user feedback. Transient errors are distinguished from
//! terminal ones so the chunk scheduler can retry without surfacing noise.

use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

/// Transfer and HTTP client errors
#[derive(Error, Debug)]
pub enum TransferError {
    /// HTTP request error
    #[error("HTTP request failed")]
    Http(#[from] reqwest::Error),

    /// Invalid URL provided
    #[error("Invalid URL: {url} - {error}")]
    InvalidUrl { url: String, error: String },

    /// Server returned error status
    #[error("Server error: HTTP {status}")]
    ServerError { status: u16 },

    /// Source reported a size that does not match the request
    #[error("Source size mismatch. Expected: {expected} bytes, reported: {reported} bytes")]
    SizeMismatch { expected: u64, reported: u64 },

    /// Range request answered with a full-body response
    #[error("Server ignored range request and returned the full body")]
    RangeNotHonored,

    /// Transfer timed out
    #[error("Transfer timed out after {seconds} seconds")]
    Timeout { seconds: u64 },
}

/// Chunk scheduling and range-fetch errors
#[derive(Error, Debug)]
pub enum ChunkError {
    /// Transfer-level failure for a chunk fetch
    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// I/O error writing chunk data to the partial file
    #[error("Chunk I/O error")]
    Io(#[from] std::io::Error),

    /// A chunk exhausted its retry budget
    #[error("Chunk {index} exhausted its retry budget ({attempts} attempts): {last_error}")]
    RetriesExhausted {
        index: usize,
        attempts: u32,
        last_error: String,
    },

    /// Chunk state could not be persisted
    #[error("Failed to persist chunk state for session {session_id}")]
    Persist { session_id: Uuid },

    /// Partial file is missing or truncated relative to chunk state
    #[error("Partial file inconsistent with chunk state: {path}")]
    PartialInconsistent { path: PathBuf },
}

/// Integrity verification errors
#[derive(Error, Debug)]
pub enum VerifyError {
    /// Content hash does not match the expected value
    #[error("Content hash mismatch. Expected: {expected}, got: {actual}")]
    HashMismatch { expected: String, actual: String },

    /// Artifact header is structurally invalid
    #[error("Invalid artifact header: {reason}")]
    InvalidHeader { reason: String },

    /// Artifact header declares an unsupported format version
    #[error("Unsupported format version: {version}")]
    UnsupportedVersion { version: u32 },

    /// I/O error while streaming the artifact
    #[error("I/O error during verification")]
    Io(#[from] std::io::Error),
}

/// Content-addressed storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// Storage root not found or inaccessible
    #[error("Storage root not accessible: {path}")]
    RootNotAccessible { path: PathBuf },

    /// Manifest record not found
    #[error("No installed model named '{model_id}'")]
    ManifestNotFound { model_id: String },

    /// Manifest record could not be parsed
    #[error("Manifest corrupted: {path}")]
    ManifestCorrupted { path: PathBuf },

    /// Blob referenced by a manifest is missing
    #[error("Blob missing for hash {hash}")]
    BlobMissing { hash: String },

    /// Insufficient disk space
    #[error("Insufficient disk space. Required: {required} bytes, available: {available} bytes")]
    InsufficientSpace { required: u64, available: u64 },

    /// Atomic commit failed
    #[error("Atomic commit failed: could not rename {temp_path} to {final_path}")]
    CommitFailed {
        temp_path: PathBuf,
        final_path: PathBuf,
    },

    /// I/O error during storage operations
    #[error("Storage I/O error")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error for manifests and records
    #[error("Record serialization error")]
    Serde(#[from] serde_json::Error),
}

/// Admission queue and concurrency limiter errors
#[derive(Error, Debug)]
pub enum QueueError {
    /// Queue reached its configured capacity
    #[error("Admission queue full. Capacity: {capacity}")]
    QueueFull { capacity: usize },

    /// Session is not present in the queue
    #[error("Session not queued: {session_id}")]
    NotQueued { session_id: Uuid },
}

/// Session lifecycle errors
#[derive(Error, Debug)]
pub enum SessionError {
    /// Session id is unknown
    #[error("Session not found: {session_id}")]
    NotFound { session_id: Uuid },

    /// Operation is not valid for the session's current status
    #[error("Invalid transition: {operation} is not allowed from {status}")]
    InvalidTransition {
        operation: &'static str,
        status: String,
    },

    /// Request was rejected before admission
    #[error("Download request rejected: {reason}")]
    Rejected { reason: String },

    /// Quota or license gate denied the download
    #[error("Download denied by quota gate: {reason}")]
    QuotaDenied { reason: String },

    /// Chunk scheduling failed
    #[error(transparent)]
    Chunk(#[from] ChunkError),

    /// Verification failed
    #[error(transparent)]
    Verify(#[from] VerifyError),

    /// Storage commit failed
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Queue operation failed
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    NotFound { path: PathBuf },

    /// Invalid configuration format
    #[error("Invalid configuration format")]
    InvalidFormat(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration value for {field}: {value}. {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    /// I/O error reading or writing configuration
    #[error("Configuration I/O error")]
    Io(#[from] std::io::Error),
}

/// Top-level application error that can represent any error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Transfer error
    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// Chunk scheduling error
    #[error(transparent)]
    Chunk(#[from] ChunkError),

    /// Verification error
    #[error(transparent)]
    Verify(#[from] VerifyError),

    /// Storage error
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Queue error
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Session error
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Configuration error
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Generic I/O error
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Generic application error with context
    #[error("Application error: {message}")]
    Generic { message: String },
}

impl AppError {
    /// Create a generic application error with a message
    pub fn generic(message: impl Into<String>) -> Self {
        Self::Generic {
            message: message.into(),
        }
    }

    /// Check if the error is recoverable (transient)
    ///
    /// Recoverable errors are retried by the chunk scheduler; non-recoverable
    /// errors surface as session failures immediately.
    pub fn is_recoverable(&self) -> bool {
        match self {
            AppError::Transfer(TransferError::Http(_))
            | AppError::Transfer(TransferError::ServerError { .. })
            | AppError::Transfer(TransferError::Timeout { .. })
            | AppError::Chunk(ChunkError::Transfer(_))
            | AppError::Chunk(ChunkError::Io(_)) => true,

            AppError::Verify(_)
            | AppError::Transfer(TransferError::SizeMismatch { .. })
            | AppError::Storage(StorageError::InsufficientSpace { .. })
            | AppError::Session(SessionError::QuotaDenied { .. })
            | AppError::Chunk(ChunkError::RetriesExhausted { .. }) => false,

            _ => false,
        }
    }

    /// Get error category for logging and metrics
    pub fn category(&self) -> &'static str {
        match self {
            AppError::Transfer(_) => "transfer",
            AppError::Chunk(_) => "chunk",
            AppError::Verify(_) => "verify",
            AppError::Storage(_) => "storage",
            AppError::Queue(_) => "queue",
            AppError::Session(_) => "session",
            AppError::Config(_) => "config",
            AppError::Io(_) => "io",
            AppError::Generic { .. } => "generic",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, AppError>;

/// Transfer result type alias
pub type TransferResult<T> = std::result::Result<T, TransferError>;

/// Chunk result type alias
pub type ChunkResult<T> = std::result::Result<T, ChunkError>;

/// Verification result type alias
pub type VerifyResult<T> = std::result::Result<T, VerifyError>;

/// Storage result type alias
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Queue result type alias
pub type QueueResult<T> = std::result::Result<T, QueueError>;

/// Session result type alias
pub type SessionResult<T> = std::result::Result<T, SessionError>;

/// Configuration result type alias
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
