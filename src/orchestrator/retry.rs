//! Explicit retry policy for conflicting registry writes.
//!
//! Registry backends never retry a compare-and-swap conflict themselves.
//! Every orchestrator write goes through [`ConflictRetry::run`], which
//! re-issues the whole read-mutate-write call after a backoff. A conflict
//! means the write did not land, so re-issuing is safe.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::debug;

use crate::registry::RegistryError;

const DEFAULT_ATTEMPTS: u32 = 3;
const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(200);
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Retry policy applied to registry writes that hit a concurrent
/// modification.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ConflictRetry {
    /// Total attempts including the first; values below one count as one.
    pub max_attempts: u32,
    /// Delay before the first retry; doubled for each further retry.
    pub initial_backoff: Duration,
    /// Upper bound for any single delay.
    pub max_backoff: Duration,
}

impl Default for ConflictRetry {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_ATTEMPTS,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

impl ConflictRetry {
    /// Policy that surfaces the first conflict.
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Policy with `max_attempts` attempts and the default backoff.
    #[must_use]
    pub fn with_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Delay before the given retry (1-based).
    #[must_use]
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2_u32.saturating_pow(retry.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Runs `call` until it succeeds, fails with a non-conflict error, or
    /// the attempts are used up.
    ///
    /// # Errors
    ///
    /// Returns the last error from `call`.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, RegistryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RegistryError>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match call().await {
                Err(err) if err.is_conflict() && attempt < attempts => {
                    let delay = self.backoff(attempt);
                    debug!(operation, attempt, ?delay, "registry write conflicted; retrying");
                    sleep(delay).await;
                    attempt += 1;
                }
                outcome => return outcome,
            }
        }
    }
}
