//! Error types for objstore
//!
//! Provides a unified error type for all operations, plus the
//! classification used by the retrying clients.

use thiserror::Error;

/// Result type alias using ObjStoreError
pub type Result<T> = std::result::Result<T, ObjStoreError>;

/// Unified error type for objstore operations
#[derive(Debug, Error)]
pub enum ObjStoreError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Wire Protocol Errors
    // -------------------------------------------------------------------------
    #[error("Protocol error: {0}")]
    Protocol(String),

    // -------------------------------------------------------------------------
    // Backend Errors
    // -------------------------------------------------------------------------
    /// The backend is up but still loading its dataset
    #[error("Backend busy: {0}")]
    Busy(String),

    /// The backend rejected the command itself (wrong type, bad arguments)
    #[error("Backend command error: {0}")]
    Command(String),

    /// The backend failed while executing an otherwise valid command
    #[error("Backend internal error: {0}")]
    BackendInternal(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    // -------------------------------------------------------------------------
    // Transaction Errors
    // -------------------------------------------------------------------------
    #[error("Transaction conflict on {keys:?} after {attempts} attempts")]
    TransactionConflict { keys: Vec<String>, attempts: u32 },

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Change Bus Errors
    // -------------------------------------------------------------------------
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ObjStoreError {
    /// Backend is warming up; retried on the busy schedule
    pub fn is_busy(&self) -> bool {
        matches!(self, ObjStoreError::Busy(_))
    }

    /// Errors worth retrying with exponential backoff
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ObjStoreError::Io(_)
                | ObjStoreError::Connection(_)
                | ObjStoreError::Timeout(_)
                | ObjStoreError::BackendInternal(_)
        )
    }
}

impl From<bincode::Error> for ObjStoreError {
    fn from(e: bincode::Error) -> Self {
        match *e {
            bincode::ErrorKind::Io(io) => ObjStoreError::Io(io),
            other => ObjStoreError::Protocol(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for ObjStoreError {
    fn from(e: serde_json::Error) -> Self {
        ObjStoreError::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for ObjStoreError {
    fn from(e: toml::de::Error) -> Self {
        ObjStoreError::Config(e.to_string())
    }
}

/// A stored payload could not be turned back into a typed record.
///
/// Always a hard failure: it means the data and the code disagree on the
/// schema.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unknown record type `{tag}` at key {key}")]
    UnknownType { key: String, tag: String },

    #[error("record at key {key} is a {tag}, expected a {expected} record")]
    WrongFamily {
        key: String,
        tag: String,
        expected: &'static str,
    },

    #[error("malformed record at key {key}: {reason}")]
    Malformed { key: String, reason: String },
}

/// Failures changing the subscription state of a change bus
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscriptionError {
    #[error("timed out after {timeout_ms} ms waiting for {action} ack on {pattern}")]
    Timeout {
        pattern: String,
        action: &'static str,
        timeout_ms: u64,
    },

    #[error("could not {action} {pattern}: {reason}")]
    Backend {
        pattern: String,
        action: &'static str,
        reason: String,
    },

    #[error("change bus worker for `{0}` has stopped")]
    WorkerGone(String),

    #[error("blocking call on the `{0}` change bus from one of its own handlers")]
    OnWorkerThread(String),
}
