use std::time::Duration;

use kline_core::error::KlineError;

use crate::retry::RetryConfig;

/// Tuning for the fetch-assemble-commit pipeline. Built once and passed into
/// the scheduler; nothing reads it from global state.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Klines requested per page; clamped to what the source allows.
    pub page_limit: usize,
    /// Upper bound for a single page request.
    pub request_timeout: Duration,
    pub retry: RetryConfig,
    /// Total write attempts per committed series.
    pub commit_attempts: u32,
    /// Pause between failed write attempts.
    pub commit_retry_delay: Duration,
    /// After a short page, issue one more request and stop only on an empty
    /// page. When off, any short page ends the job.
    pub confirm_exhaustion: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page_limit: 1000,
            request_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
            commit_attempts: 3,
            commit_retry_delay: Duration::from_millis(500),
            confirm_exhaustion: true,
        }
    }
}

impl EngineConfig {
    pub fn validated(self) -> Result<Self, KlineError> {
        if self.page_limit == 0 {
            return Err(KlineError::Config("page limit must be at least 1".into()));
        }
        if self.request_timeout.is_zero() {
            return Err(KlineError::Config("request timeout must be positive".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(KlineError::Config("max attempts must be at least 1".into()));
        }
        if !self.retry.backoff_multiplier.is_finite() || self.retry.backoff_multiplier < 1.0 {
            return Err(KlineError::Config(format!(
                "backoff multiplier must be a finite number >= 1, got {}",
                self.retry.backoff_multiplier
            )));
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(KlineError::Config(format!(
                "base delay {:?} exceeds max delay {:?}",
                self.retry.base_delay, self.retry.max_delay
            )));
        }
        if self.commit_attempts == 0 {
            return Err(KlineError::Config("commit attempts must be at least 1".into()));
        }
        Ok(self)
    }
}
