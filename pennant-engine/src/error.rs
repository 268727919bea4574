//! Engine error taxonomy
//!
//! Transient errors (lock contention, store trouble) are retried by the
//! worker with the work item re-queued; data-integrity errors drop the item
//! since retrying cannot make a missing row reappear.

use thiserror::Error;
use uuid::Uuid;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by engine components
#[derive(Debug, Error)]
pub enum EngineError {
    /// Lock not acquired within the bounded wait
    #[error("lock busy: {0}")]
    LockBusy(String),

    /// Persistent store failure
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    /// A row the work item refers to does not exist
    #[error("missing {entity} {id}")]
    MissingRow { entity: &'static str, id: Uuid },

    /// The external job dispatcher rejected or failed a dispatch
    #[error("dispatch failed: {0}")]
    Dispatch(String),

    /// Every data lookup a pipeline evaluation depends on failed
    #[error("policy evaluation degraded beyond recovery: {0}")]
    EvaluationFailed(String),

    /// Malformed input (bad selector, bad event envelope)
    #[error("invalid input: {0}")]
    Invalid(String),
}

impl EngineError {
    pub fn missing(entity: &'static str, id: Uuid) -> Self {
        EngineError::MissingRow { entity, id }
    }

    /// Transient errors are retried with the work item re-queued.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::LockBusy(_) | EngineError::Store(_) | EngineError::EvaluationFailed(_)
        )
    }
}
