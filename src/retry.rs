// src/retry.rs
use eyre::{eyre, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// Bounded retry for one call site: `attempts` tries, waiting `delay` after the
/// first failure and growing by `delay` per failure up to `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub const fn fixed(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts,
            delay,
            max_delay: delay,
        }
    }

    pub const fn linear(attempts: u32, delay: Duration, max_delay: Duration) -> Self {
        Self {
            attempts,
            delay,
            max_delay,
        }
    }

    fn delay_after(&self, failures: u32) -> Duration {
        self.delay.saturating_mul(failures).min(self.max_delay)
    }
}

pub async fn retry<T, F, Fut>(policy: &RetryPolicy, title: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                warn!("[{}] attempt {}/{} failed: {:#}", title, attempt, attempts, e);
                last_error = Some(e);
            }
        }
        if attempt < attempts {
            sleep(policy.delay_after(attempt)).await;
        }
    }

    let e = last_error.unwrap_or_else(|| eyre!("no attempts made"));
    Err(e.wrap_err(format!("{title} failed after {attempts} attempts")))
}
