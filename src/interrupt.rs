//! Cancellation and per-call deadlines for provider calls.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Reason a guarded call did not complete.
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
pub enum Interrupted {
    /// The operation was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,
    /// The call exceeded its deadline.
    #[error("call did not finish within {0:?}")]
    TimedOut(Duration),
}

/// Races every wrapped future against a cancellation token and a deadline.
#[derive(Clone, Debug)]
pub struct CallGuard {
    token: CancellationToken,
    timeout: Duration,
}

impl CallGuard {
    /// Creates a guard observing `token` with the given per-call timeout.
    #[must_use]
    pub const fn new(token: CancellationToken, timeout: Duration) -> Self {
        Self { token, timeout }
    }

    /// Creates a guard that only enforces the deadline.
    #[must_use]
    pub fn deadline_only(timeout: Duration) -> Self {
        Self::new(CancellationToken::new(), timeout)
    }

    /// Same token with a different deadline.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self::new(self.token.clone(), timeout)
    }

    /// Guard that keeps the deadline but ignores cancellation.
    ///
    /// Used for clean-up calls that must still run after the operation
    /// was cancelled.
    #[must_use]
    pub fn detached(&self) -> Self {
        Self::deadline_only(self.timeout)
    }

    /// Per-call timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Returns true once the token has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Runs `call` unless cancellation or the deadline wins first.
    ///
    /// A token that is already cancelled prevents the call from starting.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupted`] when the call was abandoned.
    pub async fn run<F>(&self, call: F) -> Result<F::Output, Interrupted>
    where
        F: Future,
    {
        if self.token.is_cancelled() {
            return Err(Interrupted::Cancelled);
        }
        tokio::select! {
            biased;
            () = self.token.cancelled() => Err(Interrupted::Cancelled),
            outcome = tokio::time::timeout(self.timeout, call) => {
                outcome.map_err(|_| Interrupted::TimedOut(self.timeout))
            }
        }
    }
}
