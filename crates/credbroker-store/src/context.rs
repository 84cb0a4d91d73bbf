//! Per-operation cancellation and deadline.
//!
//! Every repository call takes a [`Context`]. It is checked before any work
//! starts, again once the database connection has been acquired, and a last
//! time right before commit. A canceled or expired context aborts the
//! transaction, which rolls back with no partial effects.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::error::{StoreError, StoreResult};

/// Cancellation signal plus an optional deadline for one operation.
#[derive(Debug, Clone)]
pub struct Context {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that is never canceled and has no deadline.
    pub fn background() -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    /// A context that expires `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    /// A context that expires at `deadline`.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: Some(deadline),
        }
    }

    /// A child context: canceled when this one is, with the earlier of the
    /// two deadlines.
    pub fn child(&self, timeout: Option<Duration>) -> Self {
        let own = timeout.map(|t| Instant::now() + t);
        let deadline = match (self.deadline, own) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Self {
            cancel: self.cancel.child_token(),
            deadline,
        }
    }

    /// Cancel this context and every child derived from it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether the context was canceled or its deadline has passed.
    pub fn is_done(&self) -> bool {
        self.cancel.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Fail with [`StoreError::Canceled`] if the context is done.
    pub fn check(&self, op: &'static str) -> StoreResult<()> {
        if self.cancel.is_cancelled() {
            return Err(StoreError::Canceled {
                op,
                msg: "context canceled".into(),
            });
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(StoreError::Canceled {
                op,
                msg: "deadline exceeded".into(),
            });
        }
        Ok(())
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}
