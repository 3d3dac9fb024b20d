//! Cancellation tokens for search operations.
//!
//! A token is shared between the caller and the engine working on its
//! behalf. Cancelling is idempotent and synchronous from the caller's view;
//! the engine observes it at its next check and winds down.
//!
//! ## Sparse Checking
//!
//! For tight loops over many candidates, `is_cancelled_sparse()` only reads
//! the flag every 1,024 iterations to keep atomic-load overhead out of the
//! hot path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// How often long-running loops should check whether execution was cancelled.
/// A power of 2 allows efficient modulo via bitwise AND.
pub const CANCEL_CHECK_INTERVAL: usize = 0x400;

/// A cancellation token for terminating long-running operations.
///
/// Clones share the same underlying flag. `is_cancelled` returns `Option<()>`
/// so engine code can bail out with the `?` operator.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Creates a fresh, uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a token that is never cancelled.
    ///
    /// Used for operations that must run to completion, such as the walk
    /// backing a cache row, and for tests.
    pub fn noop() -> Self {
        Self::new()
    }

    /// Requests cancellation. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Checks if this token is still active.
    ///
    /// Returns `Some(())` if still active, `None` if cancelled. This enables
    /// use with the `?` operator for early returns.
    #[inline]
    pub fn is_cancelled(&self) -> Option<()> {
        if self.cancelled.load(Ordering::Acquire) {
            None
        } else {
            Some(())
        }
    }

    /// Sparse cancellation check, reading the flag every
    /// `CANCEL_CHECK_INTERVAL` iterations.
    #[inline]
    pub fn is_cancelled_sparse(&self, counter: usize) -> Option<()> {
        if counter & (CANCEL_CHECK_INTERVAL - 1) == 0 {
            self.is_cancelled()
        } else {
            Some(())
        }
    }

    /// Plain boolean view for callers that do not use the `Option` form.
    #[inline]
    pub fn cancelled(&self) -> bool {
        self.is_cancelled().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_token_is_active() {
        let token = CancellationToken::new();
        assert!(token.is_cancelled().is_some());
        assert!(!token.cancelled());
    }

    #[test]
    fn cancel_is_observed_by_clones() {
        let token = CancellationToken::new();
        let clone = token.clone();
        token.cancel();
        assert!(clone.is_cancelled().is_none());
        assert!(clone.cancelled());
    }

    #[test]
    fn cancel_is_idempotent() {
        let token = CancellationToken::new();
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled().is_none());
    }

    #[test]
    fn sparse_check_skips_off_interval_counters() {
        let token = CancellationToken::new();
        token.cancel();
        // Off-interval counters do not consult the flag.
        assert!(token.is_cancelled_sparse(1).is_some());
        assert!(token.is_cancelled_sparse(CANCEL_CHECK_INTERVAL - 1).is_some());
        // Interval boundaries do.
        assert!(token.is_cancelled_sparse(0).is_none());
        assert!(token.is_cancelled_sparse(CANCEL_CHECK_INTERVAL).is_none());
    }
}
