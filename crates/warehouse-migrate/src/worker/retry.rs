//! Transient-error retry with exponential backoff.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::config::MigrationConfig;
use crate::error::{ErrorKind, Result};

/// Bounded exponential backoff for transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, first one included.
    pub max_attempts: u32,
    pub min_wait: Duration,
    pub max_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_wait: Duration::from_secs(4),
            max_wait: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(migration: &MigrationConfig) -> Self {
        Self {
            max_attempts: migration.get_max_retry_attempts().max(1),
            min_wait: Duration::from_secs(migration.get_retry_min_wait_secs()),
            max_wait: Duration::from_secs(migration.get_retry_max_wait_secs()),
        }
    }

    /// No waiting between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            min_wait: Duration::ZERO,
            max_wait: Duration::ZERO,
        }
    }

    /// Wait before attempt `attempt + 1`, where `attempt` starts at 1.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.min_wait.saturating_mul(factor).min(self.max_wait)
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or the
    /// attempts run out. `on_retry` is told about each failed attempt that
    /// will be retried.
    pub async fn run<T, F, Fut, R>(&self, label: &str, mut op: F, mut on_retry: R) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        R: FnMut(u32),
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.kind() == ErrorKind::Transient && attempt < self.max_attempts => {
                    let wait = self.backoff(attempt);
                    warn!(
                        "{}: attempt {}/{} failed, retrying in {:?}: {}",
                        label, attempt, self.max_attempts, wait, e
                    );
                    on_retry(attempt);
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
