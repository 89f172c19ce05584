use std::fmt;

use kline_core::interval::Interval;
use kline_core::series::SeriesSummary;

use crate::error::{ErrorKind, JobError};

/// One (symbol, interval, window) unit of work. Windows are inclusive
/// Unix-millisecond bounds.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Job {
    symbol: String,
    interval: Interval,
    window_start: i64,
    window_end: i64,
}

impl Job {
    pub fn new(symbol: impl Into<String>, interval: Interval, window_start: i64, window_end: i64) -> Self {
        Self {
            symbol: symbol.into(),
            interval,
            window_start,
            window_end,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn interval(&self) -> Interval {
        self.interval
    }

    pub fn window_start(&self) -> i64 {
        self.window_start
    }

    pub fn window_end(&self) -> i64 {
        self.window_end
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.symbol, self.interval)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    /// The series was assembled and committed; the summary describes what was written.
    Success(SeriesSummary),
    Failure { kind: ErrorKind, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub job: Job,
    pub result: JobResult,
}

impl JobOutcome {
    pub fn success(job: Job, summary: SeriesSummary) -> Self {
        Self {
            job,
            result: JobResult::Success(summary),
        }
    }

    pub fn failure(job: Job, error: &JobError) -> Self {
        Self {
            job,
            result: JobResult::Failure {
                kind: error.kind(),
                message: error.to_string(),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.result, JobResult::Success(_))
    }

    /// Failure kind, `None` on success.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match &self.result {
            JobResult::Success(_) => None,
            JobResult::Failure { kind, .. } => Some(*kind),
        }
    }
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.result {
            JobResult::Success(summary) => write!(
                f,
                "{}: ok, {} kline(s), {} gap(s)",
                self.job, summary.candles, summary.gaps
            ),
            JobResult::Failure { kind, message } => {
                write!(f, "{}: FAILED [{kind}] {message}", self.job)
            }
        }
    }
}

/// Outcomes of one scheduler run, in the order the jobs were submitted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    outcomes: Vec<JobOutcome>,
}

impl RunReport {
    pub fn new(outcomes: Vec<JobOutcome>) -> Self {
        Self { outcomes }
    }

    pub fn outcomes(&self) -> &[JobOutcome] {
        &self.outcomes
    }

    /// True only when every job succeeded. An empty run counts as success.
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(JobOutcome::is_success)
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failures(&self) -> Vec<&JobOutcome> {
        self.outcomes.iter().filter(|o| !o.is_success()).collect()
    }

    pub fn total_candles(&self) -> usize {
        self.outcomes
            .iter()
            .map(|o| match &o.result {
                JobResult::Success(summary) => summary.candles,
                JobResult::Failure { .. } => 0,
            })
            .sum()
    }
}
