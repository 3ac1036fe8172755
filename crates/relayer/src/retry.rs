//! Bounded retry with jittered exponential backoff

use l1_contracts::L1Error;
use rand::Rng;
use std::{future::Future, time::Duration};

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Attempts including the first one
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 50,
            max_backoff_ms: 2_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`: half the exponential step plus a
    /// random share of the other half
    pub fn backoff(&self, attempt: u32) -> Duration {
        let step = self
            .initial_backoff_ms
            .saturating_mul(1u64 << attempt.saturating_sub(1).min(20))
            .min(self.max_backoff_ms);
        let half = step / 2;
        let jitter = if half > 0 {
            rand::thread_rng().gen_range(0..=half)
        } else {
            0
        };
        Duration::from_millis(step - half + jitter)
    }
}

/// Why a retried call gave up
#[derive(Debug)]
pub enum RetryError {
    /// Contract decision; never retried
    Rejected(L1Error),
    /// Transport kept failing
    Exhausted { attempts: u32, last: L1Error },
}

/// Run `op` until it succeeds, fails with a non-transport error, or the
/// policy runs out of attempts
pub async fn retry_transport<T, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut op: F,
) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, L1Error>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_transport() => return Err(RetryError::Rejected(e)),
            Err(e) if attempt >= max_attempts => {
                tracing::error!("{} failed after {} attempts: {}", what, attempt, e);
                return Err(RetryError::Exhausted { attempts: attempt, last: e });
            }
            Err(e) => {
                let delay = policy.backoff(attempt);
                tracing::warn!(
                    "{} attempt {}/{} failed: {} (retrying in {:?})",
                    what,
                    attempt,
                    max_attempts,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
