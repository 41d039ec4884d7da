//! Error types for store access and controller operation.

use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by the replicated stores.
///
/// All variants except `InvalidEntity` are transient from the reconciler's
/// point of view: the work queue requeues the change with backoff.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("entity not found: {0}")]
    NotFound(String),

    #[error("entity already exists: {0}")]
    AlreadyExists(String),

    #[error("stale revision for {id}: expected {expected}, got {actual}")]
    Conflict {
        id: String,
        expected: u64,
        actual: u64,
    },

    #[error("invalid entity: {0}")]
    InvalidEntity(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type ControllerResult<T> = Result<T, ControllerError>;

/// Errors surfaced by the controller framework and reconcilers.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("watch stream closed: {0}")]
    WatchClosed(String),

    #[error("controller not configured: {0}")]
    NotConfigured(String),
}
