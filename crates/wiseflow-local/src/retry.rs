//! Retry policy for every outbound call (LLM chat, vision, image download).
//!
//! Defaults: 3 attempts; the wait after attempt `n` is `multiplier * 2^(n-1)`
//! clamped to `[min_wait, max_wait]` (1s multiplier, 2s..10s bounds).

use std::future::Future;
use std::time::Duration;
use wiseflow_core::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub multiplier: Duration,
    pub min_wait: Duration,
    pub max_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            multiplier: Duration::from_secs(1),
            min_wait: Duration::from_secs(2),
            max_wait: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no waiting.
    pub fn none() -> Self {
        Self::immediate(1)
    }

    /// `max_attempts` attempts with zero backoff (tests, local fixtures).
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            multiplier: Duration::ZERO,
            min_wait: Duration::ZERO,
            max_wait: Duration::ZERO,
        }
    }

    /// Default policy with `WISEFLOW_RETRY_ATTEMPTS` applied (clamped to 1..=10).
    pub fn from_env() -> Self {
        let max_attempts = crate::env("WISEFLOW_RETRY_ATTEMPTS")
            .and_then(|s| s.parse::<u32>().ok())
            .map(|n| n.clamp(1, 10))
            .unwrap_or(3);
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Wait applied after the 1-based attempt `attempt` failed.
    pub fn wait_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.multiplier
            .saturating_mul(factor)
            .max(self.min_wait)
            .min(self.max_wait.max(self.min_wait))
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or attempts run out.
    ///
    /// The last error is returned unchanged.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1u32;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if attempt < attempts && e.retryable() => {
                    let wait = self.wait_after(attempt);
                    tracing::debug!(
                        call = what,
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        error = %e,
                        "retrying"
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(e) => {
                    if attempt > 1 {
                        tracing::warn!(call = what, attempts = attempt, error = %e, "giving up");
                    }
                    return Err(e);
                }
            }
        }
    }
}
