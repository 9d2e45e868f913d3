// SPDX-License-Identifier: MIT OR Apache-2.0
//! Engine error surface.

use reach_core::{ErrorKind, ReachError};
use reach_store::StoreError;

/// Errors from DAG validation and execution.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The pack DAG or a node reference is invalid.
    #[error("invalid pack: {0}")]
    Validation(String),

    /// A node action is not resolvable through the tool client.
    #[error("action {action:?} on node {node_id:?} is not registered")]
    UnknownAction {
        /// The offending node.
        node_id: String,
        /// The unresolvable action name.
        action: String,
    },

    /// A node's action failed; the run halts.
    #[error("node {node_id} failed: {message}")]
    NodeFailed {
        /// The failing node.
        node_id: String,
        /// Structured failure description.
        message: String,
    },

    /// An AI proposal did not validate against its schema.
    #[error("proposal for node {node_id} violates its schema: {message}")]
    SchemaViolation {
        /// The node whose proposal failed validation.
        node_id: String,
        /// Validator output.
        message: String,
    },

    /// Underlying storage failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Canonical serialization failure.
    #[error(transparent)]
    Canonical(#[from] reach_hash::CanonicalError),

    /// The execution context was cancelled.
    #[error("execution cancelled")]
    Cancelled,
}

impl EngineError {
    /// Map onto the Reach error taxonomy.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation(_) | EngineError::UnknownAction { .. } => {
                ErrorKind::ValidationFailure
            }
            // Node failures are nacked by the scheduler and retried with
            // backoff at the job level.
            EngineError::NodeFailed { .. } => ErrorKind::TransientIo,
            EngineError::SchemaViolation { .. } => ErrorKind::ValidationFailure,
            EngineError::Store(e) => e.kind(),
            EngineError::Canonical(_) => ErrorKind::ValidationFailure,
            EngineError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

impl From<EngineError> for ReachError {
    fn from(err: EngineError) -> Self {
        ReachError::new(err.kind(), err.to_string())
    }
}
