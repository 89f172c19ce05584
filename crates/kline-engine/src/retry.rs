//! Bounded retries with exponential backoff for transient page failures.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, warn};

use crate::error::JobError;

/// Something that can wait. Production code sleeps on the tokio timer; tests
/// substitute a recorder so no real time passes.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff_multiplier: f64,
    /// Ceiling for a single computed delay. A server `Retry-After` may exceed it.
    pub max_delay: Duration,
    /// Draw each delay uniformly from its upper half.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Un-jittered wait after failed attempt number `attempt` (1-based):
    /// `base_delay * multiplier^(attempt-1)`, capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.backoff_multiplier.max(1.0).powi(exponent);
        let secs = self.base_delay.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// Runs one fallible operation with bounded retries on transient failures.
#[derive(Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    sleeper: Arc<dyn Sleeper>,
}

impl RetryPolicy {
    pub fn with_sleeper(config: RetryConfig, sleeper: Arc<dyn Sleeper>) -> Self {
        Self { config, sleeper }
    }

    fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let mut delay = self.config.backoff(attempt);
        if self.config.jitter && !delay.is_zero() {
            let half = delay / 2;
            let spread = rand::thread_rng().gen_range(0.0..=1.0);
            delay = half + half.mul_f64(spread);
        }
        match retry_after {
            Some(floor) if floor > delay => floor,
            _ => delay,
        }
    }

    /// Invoke `operation` (given the 1-based attempt number) until it succeeds,
    /// fails with a non-retryable error, or `max_attempts` is used up.
    pub async fn execute<T, F, Fut>(&self, mut operation: F) -> Result<T, JobError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, JobError>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match operation(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("succeeded on attempt {attempt}/{max_attempts}");
                    }
                    return Ok(value);
                }
                Err(JobError::Transient {
                    message,
                    retry_after,
                }) => {
                    if attempt >= max_attempts {
                        return Err(JobError::ExhaustedRetries {
                            attempts: attempt,
                            last: message,
                        });
                    }
                    let delay = self.delay_for(attempt, retry_after);
                    warn!(
                        "attempt {attempt}/{max_attempts} failed: {message}; retrying in {}ms",
                        delay.as_millis()
                    );
                    self.sleeper.sleep(delay).await;
                    attempt += 1;
                }
                Err(other) => return Err(other),
            }
        }
    }
}
