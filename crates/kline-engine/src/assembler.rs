//! The per-job pagination loop.
//!
//! A job walks forward from `window_start`: each page is requested for
//! `[cursor, window_end]`, its klines are merged into the builder, and the
//! cursor moves to one millisecond past the last kline's close time. Nothing
//! leaves this module until the whole window has been walked.

use kline_core::series::{Series, SeriesBuilder};
use tracing::{debug, info, warn};

use crate::error::JobError;
use crate::fetcher::PageFetcher;
use crate::job::Job;
use crate::retry::RetryPolicy;

/// What the loop does after a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Request the next page starting here.
    Advance(i64),
    Done,
}

/// Pure transition after receiving a page of `page_len` klines whose last
/// kline closes at `last_close_time`.
pub fn next_step(
    cursor: i64,
    page_len: usize,
    last_close_time: Option<i64>,
    page_limit: usize,
    window_end: i64,
    confirm_exhaustion: bool,
) -> Result<Step, JobError> {
    let Some(last_close) = last_close_time else {
        return Ok(Step::Done);
    };

    let next = last_close
        .checked_add(1)
        .ok_or_else(|| JobError::Malformed(format!("close time {last_close} overflows")))?;
    if next <= cursor {
        return Err(JobError::Malformed(format!(
            "page ending at {last_close} does not advance cursor {cursor}"
        )));
    }
    if next > window_end {
        return Ok(Step::Done);
    }
    if page_len < page_limit && !confirm_exhaustion {
        return Ok(Step::Done);
    }
    Ok(Step::Advance(next))
}

pub struct SeriesAssembler {
    fetcher: PageFetcher,
    retry: RetryPolicy,
    page_limit: usize,
    confirm_exhaustion: bool,
}

impl SeriesAssembler {
    pub fn new(fetcher: PageFetcher, retry: RetryPolicy, page_limit: usize, confirm_exhaustion: bool) -> Self {
        let page_limit = page_limit.clamp(1, fetcher.max_page_size().max(1));
        Self {
            fetcher,
            retry,
            page_limit,
            confirm_exhaustion,
        }
    }

    pub fn page_limit(&self) -> usize {
        self.page_limit
    }

    /// Walk the job's whole window. Any page failure fails the job and the
    /// partial series is dropped.
    pub async fn assemble(&self, job: &Job) -> Result<Series, JobError> {
        let fetcher = &self.fetcher;
        let symbol = job.symbol();
        let interval = job.interval();
        let window_end = job.window_end();
        let limit = self.page_limit;

        let mut builder = SeriesBuilder::new(symbol, interval);
        let mut cursor = job.window_start();
        let mut pages = 0usize;
        let mut total = 0usize;

        while cursor <= window_end {
            let page = self
                .retry
                .execute(move |_| fetcher.fetch(symbol, interval, cursor, window_end, limit))
                .await?;
            pages += 1;

            let page_len = page.candles.len();
            let last_close = page.last_close_time;
            let added = builder.extend(page.candles);
            total += added;
            debug!("{job}: page {pages} from {cursor}: {page_len} kline(s), {added} new, {total} total");

            match next_step(
                cursor,
                page_len,
                last_close,
                limit,
                window_end,
                self.confirm_exhaustion,
            )? {
                Step::Advance(next) => cursor = next,
                Step::Done => break,
            }
        }

        let series = builder.finish();
        let gaps = series.gaps();
        if !gaps.is_empty() {
            let missing: i64 = gaps.iter().map(|g| g.missing).sum();
            warn!(
                "{job}: {} gap(s) in source data, {missing} kline(s) missing, first after {}",
                gaps.len(),
                gaps[0].after
            );
        }
        info!(
            "{job}: assembled {} kline(s) from {} in {pages} page(s)",
            series.len(),
            fetcher.source_name()
        );
        Ok(series)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::error::ErrorKind;
    use crate::retry::testing::fast_policy;
    use crate::testing::{ScriptedSource, SyntheticSource, raw_kline};
    use kline_core::interval::Interval;
    use kline_providers::error::SourceError;
    use kline_providers::provider::{KlineSource, RawKline};

    const T0: i64 = 1_725_148_800_000;
    const MIN: i64 = 60_000;
    const DAY: i64 = 86_400_000;

    fn rows(from: i64, n: i64) -> Vec<RawKline> {
        (from..from + n)
            .map(|i| raw_kline(T0 + i * MIN, Interval::M1))
            .collect()
    }

    fn assembler(source: Arc<dyn KlineSource>, confirm: bool) -> SeriesAssembler {
        SeriesAssembler::new(
            PageFetcher::new(source, Duration::from_secs(5)),
            fast_policy(3),
            1000,
            confirm,
        )
    }

    fn two_days(symbol: &str) -> Job {
        Job::new(symbol, Interval::M1, T0, T0 + 2 * DAY - 1)
    }

    #[test]
    fn step_rules() {
        // empty page ends the job
        assert_eq!(next_step(T0, 0, None, 1000, T0 + DAY, true).unwrap(), Step::Done);
        // full page advances past the last close
        assert_eq!(
            next_step(T0, 1000, Some(T0 + 1000 * MIN - 1), 1000, T0 + DAY, false).unwrap(),
            Step::Advance(T0 + 1000 * MIN)
        );
        // short page: stop, or confirm with one more request
        assert_eq!(
            next_step(T0, 10, Some(T0 + 10 * MIN - 1), 1000, T0 + DAY, false).unwrap(),
            Step::Done
        );
        assert_eq!(
            next_step(T0, 10, Some(T0 + 10 * MIN - 1), 1000, T0 + DAY, true).unwrap(),
            Step::Advance(T0 + 10 * MIN)
        );
        // cursor past the window
        assert_eq!(
            next_step(T0, 1000, Some(T0 + DAY), 1000, T0 + DAY, true).unwrap(),
            Step::Done
        );
        // a page that does not move the cursor forward
        let err = next_step(T0, 1, Some(T0 - 1), 1000, T0 + DAY, true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Malformed);
    }

    #[tokio::test]
    async fn pages_are_stitched_into_one_series() {
        let source = Arc::new(SyntheticSource::new().with_series("BTCUSDT", Interval::M1, T0, 2200));
        let series = assembler(source.clone(), true)
            .assemble(&two_days("BTCUSDT"))
            .await
            .unwrap();

        assert_eq!(series.len(), 2200);
        assert!(series.gaps().is_empty());
        assert!(series.candles().windows(2).all(|w| w[0].open_time < w[1].open_time));
        assert_eq!(series.first_open_time(), Some(T0));
        // the trailing empty page confirms exhaustion
        assert_eq!(source.page_sizes("BTCUSDT"), vec![1000, 1000, 200, 0]);
    }

    #[tokio::test]
    async fn short_page_ends_job_without_confirmation() {
        let source = Arc::new(SyntheticSource::new().with_series("BTCUSDT", Interval::M1, T0, 2200));
        let series = assembler(source.clone(), false)
            .assemble(&two_days("BTCUSDT"))
            .await
            .unwrap();

        assert_eq!(series.len(), 2200);
        assert_eq!(source.page_sizes("BTCUSDT"), vec![1000, 1000, 200]);
    }

    #[tokio::test]
    async fn early_truncation_is_caught_by_confirmation() {
        let scripted = || {
            Arc::new(ScriptedSource::new(vec![
                Ok(rows(0, 600)),
                Ok(rows(600, 400)),
                Ok(Vec::new()),
            ]))
        };

        let source = scripted();
        let series = assembler(source.clone(), true)
            .assemble(&two_days("BTCUSDT"))
            .await
            .unwrap();
        assert_eq!(series.len(), 1000);
        assert_eq!(source.calls().len(), 3);
        assert_eq!(source.calls()[1].0, T0 + 600 * MIN);

        let source = scripted();
        let series = assembler(source.clone(), false)
            .assemble(&two_days("BTCUSDT"))
            .await
            .unwrap();
        assert_eq!(series.len(), 600);
        assert_eq!(source.calls().len(), 1);
    }

    #[tokio::test]
    async fn window_end_stops_without_extra_request() {
        let source = Arc::new(SyntheticSource::new().with_series("BTCUSDT", Interval::M1, T0, 5000));
        let job = Job::new("BTCUSDT", Interval::M1, T0, T0 + 1000 * MIN - 1);
        let series = assembler(source.clone(), true).assemble(&job).await.unwrap();

        assert_eq!(series.len(), 1000);
        assert_eq!(source.page_sizes("BTCUSDT"), vec![1000]);
    }

    #[tokio::test]
    async fn empty_window_is_an_empty_success() {
        let source = Arc::new(SyntheticSource::new());
        let series = assembler(source.clone(), true)
            .assemble(&two_days("NEWUSDT"))
            .await
            .unwrap();

        assert!(series.is_empty());
        assert_eq!(series.symbol(), "NEWUSDT");
        assert_eq!(source.page_sizes("NEWUSDT"), vec![0]);
    }

    #[tokio::test]
    async fn permanent_error_mid_walk_fails_job() {
        let source = Arc::new(ScriptedSource::new(vec![
            Ok(rows(0, 1000)),
            Err(SourceError::UnknownSymbol("BTCUSDT".into())),
        ]));
        let err = assembler(source.clone(), true)
            .assemble(&two_days("BTCUSDT"))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Permanent);
        assert_eq!(source.calls().len(), 2);
    }

    #[tokio::test]
    async fn transient_page_failure_is_retried_in_place() {
        let source = Arc::new(ScriptedSource::new(vec![
            Ok(rows(0, 1000)),
            Err(SourceError::Api {
                status: 502,
                message: "bad gateway".into(),
            }),
            Ok(rows(1000, 5)),
        ]));
        let series = assembler(source.clone(), true)
            .assemble(&two_days("BTCUSDT"))
            .await
            .unwrap();

        assert_eq!(series.len(), 1005);
        let calls = source.calls();
        // the retry repeats the same window
        assert_eq!(calls[1].0, calls[2].0);
        assert_eq!(calls[1].0, T0 + 1000 * MIN);
    }

    #[tokio::test]
    async fn persistent_transient_failure_exhausts_retries() {
        let unavailable = || {
            Err(SourceError::Api {
                status: 503,
                message: "unavailable".into(),
            })
        };
        let source = Arc::new(ScriptedSource::new(vec![unavailable(), unavailable(), unavailable()]));
        let err = assembler(source.clone(), true)
            .assemble(&two_days("BTCUSDT"))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ExhaustedRetries);
        assert_eq!(source.calls().len(), 3);
    }

    #[tokio::test]
    async fn malformed_page_fails_without_retry() {
        let mut page = rows(0, 3);
        page.swap(0, 1);
        let source = Arc::new(ScriptedSource::new(vec![Ok(page)]));
        let err = assembler(source.clone(), true)
            .assemble(&two_days("BTCUSDT"))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Malformed);
        assert_eq!(source.calls().len(), 1);
    }

    #[tokio::test]
    async fn reassembly_is_idempotent() {
        let source = Arc::new(SyntheticSource::new().with_series("ETHUSDT", Interval::M1, T0 + 77 * MIN, 1750));
        let assembler = assembler(source, true);

        let first = assembler.assemble(&two_days("ETHUSDT")).await.unwrap();
        let second = assembler.assemble(&two_days("ETHUSDT")).await.unwrap();
        assert_eq!(first.len(), 1750);
        assert_eq!(first, second);
    }

    #[test]
    fn page_limit_is_clamped_to_source_maximum() {
        let source = Arc::new(SyntheticSource::new());
        let assembler = SeriesAssembler::new(
            PageFetcher::new(source, Duration::from_secs(1)),
            fast_policy(1),
            10_000,
            true,
        );
        assert_eq!(assembler.page_limit(), 1500);
    }
}
