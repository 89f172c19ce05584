use std::sync::Arc;
use std::time::Duration;

use kline_core::series::{Series, SeriesSummary};
use tracing::{info, warn};

use crate::error::JobError;
use crate::job::Job;
use crate::retry::Sleeper;
use crate::sink::SeriesSink;

/// Proof that a series reached the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReceipt {
    pub summary: SeriesSummary,
    pub attempts: u32,
}

/// A series the sink refused. The series is handed back so the caller can
/// report or retry it.
#[derive(Debug)]
pub struct CommitFailure {
    pub series: Series,
    pub error: JobError,
}

/// The single point where a finished series is handed to persistence.
pub struct CommitGate {
    sink: Arc<dyn SeriesSink>,
    max_attempts: u32,
    retry_delay: Duration,
    sleeper: Arc<dyn Sleeper>,
}

impl CommitGate {
    pub fn new(
        sink: Arc<dyn SeriesSink>,
        max_attempts: u32,
        retry_delay: Duration,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self {
            sink,
            max_attempts: max_attempts.max(1),
            retry_delay,
            sleeper,
        }
    }

    pub async fn commit(&self, job: &Job, series: Series) -> Result<CommitReceipt, CommitFailure> {
        if series.symbol() != job.symbol() || series.interval() != job.interval() {
            let error = JobError::Persistence(format!(
                "series {} {} does not belong to job {job}",
                series.symbol(),
                series.interval()
            ));
            return Err(CommitFailure { series, error });
        }

        let summary = series.summary();
        let mut last_error = String::new();
        for attempt in 1..=self.max_attempts {
            match self.sink.write(&series).await {
                Ok(()) => {
                    info!("{job}: committed {} kline(s)", summary.candles);
                    return Ok(CommitReceipt {
                        summary,
                        attempts: attempt,
                    });
                }
                Err(e) => {
                    warn!("{job}: write attempt {attempt}/{} failed: {e}", self.max_attempts);
                    last_error = e.to_string();
                    if attempt < self.max_attempts {
                        self.sleeper.sleep(self.retry_delay).await;
                    }
                }
            }
        }

        Err(CommitFailure {
            series,
            error: JobError::Persistence(last_error),
        })
    }
}
