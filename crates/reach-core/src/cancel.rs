// SPDX-License-Identifier: MIT OR Apache-2.0
//! Cancellation primitives propagated through every I/O path.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

use crate::ReachError;

/// A cloneable, cheaply-shareable token used to signal cancellation.
///
/// All clones share the same underlying state; cancelling one immediately
/// makes every clone observe `is_cancelled() == true`. Tight loops over
/// datasets check the token at iteration boundaries via
/// [`ensure_live`](CancelToken::ensure_live).
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

#[derive(Default)]
struct TokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    /// Create a new token that is **not** cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Returns `true` if [`cancel`](Self::cancel) has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Fail fast with [`crate::ErrorKind::Cancelled`] if the token is cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`ReachError::cancelled`] when cancellation has been signalled.
    pub fn ensure_live(&self) -> Result<(), ReachError> {
        if self.is_cancelled() {
            return Err(ReachError::cancelled());
        }
        Ok(())
    }

    /// Resolve when the token is cancelled; immediately if it already is.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        loop {
            self.inner.notify.notified().await;
            if self.is_cancelled() {
                return;
            }
        }
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Why a shutdown or cancellation was initiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// The operator requested cancellation.
    UserRequested,
    /// A lease deadline lapsed.
    DeadlineExpired,
    /// The host is shutting down gracefully.
    Shutdown,
}

impl CancelReason {
    /// Human-readable description.
    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            CancelReason::UserRequested => "cancelled by user request",
            CancelReason::DeadlineExpired => "cancelled because the lease deadline expired",
            CancelReason::Shutdown => "cancelled because the host is shutting down",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[test]
    fn token_starts_not_cancelled() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(token.ensure_live().is_ok());
    }

    #[test]
    fn cancel_flips_state_and_ensure_live_fails() {
        let token = CancelToken::new();
        token.cancel();
        assert!(token.is_cancelled());
        let err = token.ensure_live().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Cancelled);
    }

    #[test]
    fn clone_shares_state() {
        let a = CancelToken::new();
        let b = a.clone();
        a.cancel();
        assert!(b.is_cancelled());
    }

    #[test]
    fn repeated_cancels_are_idempotent() {
        let token = CancelToken::new();
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_future_resolves() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
            true
        });
        token.cancel();
        assert!(handle.await.unwrap());
    }

    #[test]
    fn reasons_have_descriptions() {
        for reason in [
            CancelReason::UserRequested,
            CancelReason::DeadlineExpired,
            CancelReason::Shutdown,
        ] {
            assert!(!reason.description().is_empty());
        }
    }
}
