//! Retry with exponential backoff for transient fetch failures

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::warn;

use pocket_core::{PocketError, PocketResult};

/// `wait = clamp(base * 2^(attempt-1), min_delay, max_delay)`
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base: Duration,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base: Duration::from_secs(1),
            min_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(15),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no waiting
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Wait before the attempt following failed attempt number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let raw = self.base.saturating_mul(1u32 << exponent);
        raw.clamp(self.min_delay, self.max_delay.max(self.min_delay))
    }

    /// Run `op` until it succeeds, fails permanently or attempts run out
    ///
    /// Only transient errors are retried. Exhausting every attempt surfaces
    /// a `TransientFetch` carrying the last error.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> PocketResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = PocketResult<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) if attempt >= attempts => {
                    return Err(if attempts == 1 {
                        e
                    } else {
                        PocketError::transient(format!(
                            "{} failed after {} attempts: {}",
                            label, attempts, e
                        ))
                    });
                }
                Err(e) => {
                    let wait = self.delay_for(attempt);
                    warn!(
                        "[PO Fetch] {} attempt {}/{} failed: {} (retrying in {:?})",
                        label, attempt, attempts, e, wait
                    );
                    sleep(wait).await;
                    attempt += 1;
                }
            }
        }
    }
}
