//! Error types for memwarden

use std::time::Duration;

use thiserror::Error;

/// Main error type for memwarden operations
#[derive(Error, Debug)]
pub enum WardenError {
    /// Operation on an id that is not registered
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Resource type is not present in the type catalog
    #[error("Unknown resource type: {0}")]
    UnknownType(String),

    /// Resource id does not follow the `<type>:<instance>` format
    #[error("Invalid resource id: {0}")]
    InvalidId(String),

    /// Resource id is already registered
    #[error("Resource already registered: {0}")]
    Duplicate(String),

    /// Resource is held by another consumer and cannot be mutated right now
    #[error("Resource is locked: {0}")]
    AlreadyLocked(String),

    /// The calling thread already holds a lock on this resource
    #[error("Self-deadlock: current thread already holds a lock on {0}")]
    SelfDeadlock(String),

    /// The calling thread does not own the lock it tried to release
    #[error("Lock on {0} is not owned by the current thread")]
    NotOwner(String),

    /// A lock was held past the configured timeout and was force-released
    #[error("Lock on {id} held for {held:?}, force-released")]
    LockTimeoutViolation { id: String, held: Duration },

    /// Type-specific release logic failed
    #[error("Release handler for {type_name} failed on {id}: {message}")]
    ReleaseHandlerFailure {
        id: String,
        type_name: String,
        message: String,
    },

    /// Best-effort backup could not be taken
    #[error("Snapshot unavailable for {0}")]
    SnapshotUnavailable(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Background runtime errors (no tokio runtime, task already running, ...)
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for memwarden operations
pub type Result<T> = std::result::Result<T, WardenError>;
