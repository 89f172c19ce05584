use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use kline_core::interval::Interval;
use kline_providers::provider::KlineSource;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::assembler::SeriesAssembler;
use crate::commit::CommitGate;
use crate::config::EngineConfig;
use crate::error::JobError;
use crate::fetcher::PageFetcher;
use crate::job::{Job, JobOutcome, RunReport};
use crate::retry::{RetryPolicy, Sleeper, TokioSleeper};
use crate::sink::SeriesSink;

type Queue = Arc<Mutex<VecDeque<(usize, Job)>>>;

/// Runs independent jobs on a fixed pool of workers. Each worker takes one job
/// from the shared queue, assembles and commits it, reports the outcome and
/// only then takes the next.
pub struct JobScheduler {
    assembler: Arc<SeriesAssembler>,
    gate: Arc<CommitGate>,
}

impl JobScheduler {
    pub fn new(config: EngineConfig, source: Arc<dyn KlineSource>, sink: Arc<dyn SeriesSink>) -> Self {
        Self::with_sleeper(config, source, sink, Arc::new(TokioSleeper))
    }

    /// Same as [`JobScheduler::new`] with a custom way of waiting between
    /// page and write retries.
    pub fn with_sleeper(
        config: EngineConfig,
        source: Arc<dyn KlineSource>,
        sink: Arc<dyn SeriesSink>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        let retry = RetryPolicy::with_sleeper(config.retry.clone(), sleeper.clone());
        let fetcher = PageFetcher::new(source, config.request_timeout);
        let assembler = SeriesAssembler::new(fetcher, retry, config.page_limit, config.confirm_exhaustion);
        let gate = CommitGate::new(sink, config.commit_attempts, config.commit_retry_delay, sleeper);
        Self {
            assembler: Arc::new(assembler),
            gate: Arc::new(gate),
        }
    }

    /// Every symbol × interval pair over the same window, interval-major.
    pub fn plan(symbols: &[String], intervals: &[Interval], window_start: i64, window_end: i64) -> Vec<Job> {
        intervals
            .iter()
            .flat_map(|interval| {
                symbols
                    .iter()
                    .map(move |symbol| Job::new(symbol.clone(), *interval, window_start, window_end))
            })
            .collect()
    }

    /// Run `jobs` on `concurrency` workers and return one outcome per job, in
    /// submission order. A failing job never stops the others.
    pub async fn run(&self, jobs: Vec<Job>, concurrency: usize) -> RunReport {
        let total = jobs.len();
        if total == 0 {
            return RunReport::default();
        }
        let workers = concurrency.clamp(1, total);
        info!("running {total} job(s) on {workers} worker(s)");

        let queue: Queue = Arc::new(Mutex::new(jobs.iter().cloned().enumerate().collect()));
        let (tx, mut rx) = mpsc::unbounded_channel::<(usize, JobOutcome)>();

        let mut set = JoinSet::new();
        for worker in 0..workers {
            let queue = queue.clone();
            let tx = tx.clone();
            let assembler = self.assembler.clone();
            let gate = self.gate.clone();
            set.spawn(async move {
                loop {
                    let next = queue.lock().unwrap_or_else(PoisonError::into_inner).pop_front();
                    let Some((index, job)) = next else {
                        break;
                    };
                    debug!("worker {worker}: starting {job}");
                    let outcome = run_job(&assembler, &gate, job).await;
                    if tx.send((index, outcome)).is_err() {
                        break;
                    }
                }
                debug!("worker {worker}: queue drained");
            });
        }
        drop(tx);

        let mut slots: Vec<Option<JobOutcome>> = vec![None; total];
        while let Some((index, outcome)) = rx.recv().await {
            slots[index] = Some(outcome);
        }
        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                error!("worker terminated abnormally: {e}");
            }
        }

        let outcomes: Vec<JobOutcome> = slots
            .into_iter()
            .zip(jobs)
            .map(|(slot, job)| {
                slot.unwrap_or_else(|| {
                    let err = JobError::Permanent("worker terminated before reporting an outcome".into());
                    JobOutcome::failure(job, &err)
                })
            })
            .collect();

        let report = RunReport::new(outcomes);
        let failed = report.failures().len();
        if failed == 0 {
            info!("all {total} job(s) succeeded, {} kline(s) committed", report.total_candles());
        } else {
            warn!("{failed} of {total} job(s) failed");
        }
        report
    }
}

async fn run_job(assembler: &SeriesAssembler, gate: &CommitGate, job: Job) -> JobOutcome {
    let series = match assembler.assemble(&job).await {
        Ok(series) => series,
        Err(e) => {
            warn!("{job}: {} failure, nothing written: {e}", e.kind());
            return JobOutcome::failure(job, &e);
        }
    };

    match gate.commit(&job, series).await {
        Ok(receipt) => JobOutcome::success(job, receipt.summary),
        Err(failure) => {
            error!(
                "{job}: {} assembled kline(s) not persisted: {}",
                failure.series.len(),
                failure.error
            );
            JobOutcome::failure(job, &failure.error)
        }
    }
}
