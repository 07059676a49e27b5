//! Retry policy: bounded retries with a linearly growing delay.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::LedgerError;
use crate::shutdown::ShutdownSignal;

/// Classifies failures that are worth retrying.
///
/// Only connectivity-class failures qualify. Constraint violations and
/// domain conflicts must return `false` so they surface immediately.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

/// Retry policy for storage and network calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Additional attempts after the first one.
    pub max_attempts: u32,

    /// Wait before the first retry.
    pub initial_delay: Duration,

    /// Added to the wait after every failed retry.
    pub delay_increment: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            delay_increment: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Wait before retry number `retry` (1-indexed).
    ///
    /// With the default policy: 1s, 3s, 5s.
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.initial_delay + self.delay_increment * retry.saturating_sub(1)
    }
}

/// Runs `op` under `policy`.
///
/// Returns the first success, the first non-transient failure, or the last
/// transient failure once the attempts are used up. A shutdown request while
/// waiting returns the last failure right away.
pub async fn retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    shutdown: &ShutdownSignal,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Transient + std::fmt::Display,
{
    let mut last = op().await;

    for retry in 1..=policy.max_attempts {
        let delay = match &last {
            Err(e) if e.is_transient() => {
                let delay = policy.delay_for(retry);
                warn!(
                    retry,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient failure, retrying"
                );
                delay
            }
            _ => return last,
        };

        let mut shutdown = shutdown.clone();
        tokio::select! {
            biased;
            _ = shutdown.wait() => return last,
            _ = tokio::time::sleep(delay) => {}
        }

        last = op().await;
    }

    last
}

impl Transient for sqlx::Error {
    fn is_transient(&self) -> bool {
        match self {
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
            // SQLSTATE class 08: connection exception
            sqlx::Error::Database(db) => db.code().is_some_and(|code| code.starts_with("08")),
            _ => false,
        }
    }
}

impl Transient for LedgerError {
    fn is_transient(&self) -> bool {
        match self {
            LedgerError::Storage(e) => e.is_transient(),
            _ => false,
        }
    }
}
