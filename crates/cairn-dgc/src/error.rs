//! Error types for the garbage collection coordinator

use crate::ids::ObjectId;
use std::time::Duration;
use thiserror::Error;

/// Result alias used throughout the crate
pub type DgcResult<T> = Result<T, DgcError>;

/// Errors raised by the coordinator and its collaborators.
///
/// Disconnect races are not errors: registry operations on unknown nodes are
/// logged and ignored. Listener panics are caught and logged where they occur.
#[derive(Debug, Error)]
pub enum DgcError {
    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration could not be parsed
    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),

    /// Quiescence was not acknowledged in time; the cycle was canceled
    #[error("GC iteration {iteration}: pause not acknowledged within {waited:?}")]
    PauseTimeout {
        /// Iteration of the canceled cycle
        iteration: u64,
        /// How long the coordinator waited
        waited: Duration,
    },

    /// A candidate vanished from the store before deletion
    #[error("GC iteration {iteration}: candidate {id} is no longer present in the store")]
    CandidateMissing {
        /// Iteration of the aborted cycle
        iteration: u64,
        /// The missing candidate
        id: ObjectId,
    },

    /// Internal bookkeeping no longer holds; deleting anything could remove a live object
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// The object store failed to perform an operation
    #[error("Object store error: {0}")]
    Store(String),
}

impl DgcError {
    /// True for errors that mean the safety property may be at risk.
    ///
    /// The coordinator disables itself after one of these.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            DgcError::InvariantViolation(_) | DgcError::CandidateMissing { .. }
        )
    }
}
