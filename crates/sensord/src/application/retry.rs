//! Bounded retry with backoff.
//!
//! Session operations that talk to a sensor (ping, disable) may fail
//! transiently while the board boots or the line is noisy.  Call sites wrap
//! them in [`retry`] with an explicit [`RetryPolicy`] and a predicate naming
//! the failures worth retrying; anything else is returned immediately.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// Delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// The same pause before every retry.
    Constant(Duration),
}

impl Backoff {
    /// Pause before retry number `attempt` (1-based).
    pub fn delay(&self, _attempt: u32) -> Duration {
        match self {
            Backoff::Constant(delay) => *delay,
        }
    }
}

/// How many times to try and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first; at least 1.
    pub max_tries: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn constant(max_tries: u32, delay: Duration) -> Self {
        Self {
            max_tries: max_tries.max(1),
            backoff: Backoff::Constant(delay),
        }
    }
}

/// Runs `op` until it succeeds, fails with an error `should_retry` rejects,
/// or `policy.max_tries` attempts have been made.  The last error is returned.
pub async fn retry<T, E, F, Fut>(
    policy: RetryPolicy,
    should_retry: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_tries = policy.max_tries.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < max_tries && should_retry(&e) => {
                debug!(attempt, max_tries, "retrying after error: {e}");
                tokio::time::sleep(policy.backoff.delay(attempt)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
