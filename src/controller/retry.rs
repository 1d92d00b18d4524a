//! Bounded fixed-delay retry policies
//!
//! Every wait in the operator goes through a `Sleeper`, so tests can swap in
//! a recording clock and assert on attempt counts and delays without
//! actually sleeping.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

/// Source of delays
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Sleeper backed by the tokio timer
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Retry at most `max_attempts` times with a fixed delay between attempts
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub const fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Run `op` until it succeeds, `retry_on` rejects the error, or attempts
    /// run out. The last error is returned unchanged.
    ///
    /// No delay follows the final attempt.
    pub async fn retry<T, E, F, Fut, P>(
        &self,
        sleeper: &dyn Sleeper,
        label: &str,
        mut op: F,
        retry_on: P,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: fmt::Display,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.max_attempts && retry_on(&e) => {
                    debug!(
                        "{}: attempt {}/{} failed ({}), retrying in {:?}",
                        label, attempt, self.max_attempts, e, self.delay
                    );
                    if !self.delay.is_zero() {
                        sleeper.sleep(self.delay).await;
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// `retry` for any error
    pub async fn retry_all<T, E, F, Fut>(
        &self,
        sleeper: &dyn Sleeper,
        label: &str,
        op: F,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        self.retry(sleeper, label, op, |_| true).await
    }
}
