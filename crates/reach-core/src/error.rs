// SPDX-License-Identifier: MIT OR Apache-2.0

//! Structured error taxonomy for Reach.
//!
//! Every surfaced error carries an [`ErrorKind`] (a stable, machine-readable
//! classification), a human-readable message, a correlation id, and arbitrary
//! key-value context. Local recovery is confined to [`ErrorKind::TransientIo`];
//! every other kind propagates to the caller. User-facing surfaces render
//! `{error_code, message, correlation_id}` and never a raw backtrace.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Stable error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Hash mismatch, replay divergence, missing snapshot before prune,
    /// signature failure. Surfaced, never silently recovered.
    InvariantViolation,
    /// Stored content hash and recomputed hash disagree.
    IntegrityMismatch,
    /// Malformed manifest, unsupported version, schema incompatibility.
    ValidationFailure,
    /// Archive path traversal, entry cap, or size cap exceeded.
    ArchiveRejected,
    /// Peer not trusted, envelope missing for a proof, peer quarantined.
    TrustRefused,
    /// Storage busy or network timeout; the only retryable kind.
    TransientIo,
    /// The same job killed its worker on every attempt.
    DeterministicCrash,
    /// Context cancelled; propagates without a failure event.
    Cancelled,
    /// Governance evaluation denied the run under enforcement.
    PolicyDenied,
}

impl ErrorKind {
    /// Stable snake_case code string.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::InvariantViolation => "invariant_violation",
            ErrorKind::IntegrityMismatch => "integrity_mismatch",
            ErrorKind::ValidationFailure => "validation_failure",
            ErrorKind::ArchiveRejected => "archive_rejected",
            ErrorKind::TrustRefused => "trust_refused",
            ErrorKind::TransientIo => "transient_io",
            ErrorKind::DeterministicCrash => "deterministic_crash",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::PolicyDenied => "policy_denied",
        }
    }

    /// Whether local retry with backoff is permitted.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::TransientIo)
    }

    /// Process exit code for a CLI surfacing this kind.
    ///
    /// Invariant and integrity violations exit 2; everything else is an
    /// operational failure and exits 1.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorKind::InvariantViolation | ErrorKind::IntegrityMismatch => 2,
            _ => 1,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A structured Reach error.
///
/// Construct with [`ReachError::new`] and attach context fluently:
///
/// ```
/// use reach_core::{ErrorKind, ReachError};
///
/// let err = ReachError::new(ErrorKind::TrustRefused, "peer is quarantined")
///     .with_context("peer", "node-b");
/// assert_eq!(err.kind, ErrorKind::TrustRefused);
/// assert_eq!(err.context.get("peer").map(String::as_str), Some("node-b"));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReachError {
    /// Stable classification.
    pub kind: ErrorKind,
    /// Human-readable description.
    pub message: String,
    /// Correlation id for tracing an error across subsystems.
    pub correlation_id: Uuid,
    /// Arbitrary key-value context.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, String>,
}

impl ReachError {
    /// Create an error with a fresh correlation id.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            correlation_id: Uuid::new_v4(),
            context: BTreeMap::new(),
        }
    }

    /// Attach a context key-value pair.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Re-tag the error with an explicit correlation id, e.g. one inherited
    /// from an incoming request.
    #[must_use]
    pub fn with_correlation_id(mut self, id: Uuid) -> Self {
        self.correlation_id = id;
        self
    }

    /// Shorthand for a cancellation error.
    #[must_use]
    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "operation cancelled")
    }

    /// The user-facing wire form `{error_code, message, correlation_id}`.
    #[must_use]
    pub fn to_wire(&self) -> serde_json::Value {
        serde_json::json!({
            "error_code": self.kind.code(),
            "message": self.message,
            "correlation_id": self.correlation_id,
        })
    }
}

impl fmt::Display for ReachError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.code(), self.message)?;
        if !self.context.is_empty() {
            write!(f, " (")?;
            for (i, (k, v)) in self.context.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{k}={v}")?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

impl std::error::Error for ReachError {}

impl From<reach_hash::CanonicalError> for ReachError {
    fn from(err: reach_hash::CanonicalError) -> Self {
        ReachError::new(ErrorKind::ValidationFailure, err.to_string())
    }
}
