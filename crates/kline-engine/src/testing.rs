//! In-memory sources and sinks shared by the engine's unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use kline_core::error::KlineError;
use kline_core::interval::Interval;
use kline_core::series::Series;
use kline_providers::error::SourceError;
use kline_providers::provider::{KlineSource, RawKline};

use crate::sink::{SeriesSink, run_blocking};

pub fn raw_kline(open_time: i64, interval: Interval) -> RawKline {
    RawKline {
        open_time,
        open: "58969.90".into(),
        high: "58990.00".into(),
        low: "58950.10".into(),
        close: "58960.00".into(),
        volume: "152.311".into(),
        close_time: open_time + interval.duration_ms() - 1,
        quote_volume: "8981234.5610".into(),
        trade_count: 1893,
        taker_buy_base_volume: "70.004".into(),
        taker_buy_quote_volume: "4127781.0020".into(),
    }
}

/// Replays a fixed list of responses; once exhausted it returns empty pages.
pub struct ScriptedSource {
    responses: Mutex<VecDeque<Result<Vec<RawKline>, SourceError>>>,
    calls: Mutex<Vec<(i64, i64, usize)>>,
    delay: Option<Duration>,
}

impl ScriptedSource {
    pub fn new(responses: Vec<Result<Vec<RawKline>, SourceError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            calls: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// `(start, end, limit)` of every request so far.
    pub fn calls(&self) -> Vec<(i64, i64, usize)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl KlineSource for ScriptedSource {
    fn name(&self) -> &str {
        "scripted"
    }

    fn max_page_size(&self) -> usize {
        1500
    }

    async fn get_page(
        &self,
        _symbol: &str,
        _interval: Interval,
        start_ms: i64,
        end_ms: i64,
        limit: usize,
    ) -> Result<Vec<RawKline>, SourceError> {
        self.calls.lock().unwrap().push((start_ms, end_ms, limit));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.responses.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(Vec::new()))
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Failure {
    /// Unknown symbol on every request.
    Permanent,
    /// HTTP 503 for the first `n` requests, then normal service.
    TransientTimes(usize),
    /// HTTP 503 forever.
    AlwaysTransient,
}

/// Serves contiguous synthetic klines per (symbol, interval); pairs it does not
/// know return empty pages, like a symbol not yet listed.
#[derive(Default)]
pub struct SyntheticSource {
    series: HashMap<(String, Interval), (i64, i64)>,
    failures: Mutex<HashMap<String, Failure>>,
    page_sizes: Mutex<HashMap<String, Vec<usize>>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    delay: Option<Duration>,
}

impl SyntheticSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// `count` contiguous klines starting at `first_open`.
    pub fn with_series(mut self, symbol: &str, interval: Interval, first_open: i64, count: i64) -> Self {
        self.series.insert((symbol.to_string(), interval), (first_open, count));
        self
    }

    pub fn with_failure(self, symbol: &str, failure: Failure) -> Self {
        self.failures.lock().unwrap().insert(symbol.to_string(), failure);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Sizes of the successful pages served for `symbol`, in order.
    pub fn page_sizes(&self, symbol: &str) -> Vec<usize> {
        self.page_sizes
            .lock()
            .unwrap()
            .get(symbol)
            .cloned()
            .unwrap_or_default()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn failure_for(&self, symbol: &str) -> Option<SourceError> {
        let mut failures = self.failures.lock().unwrap();
        let unavailable = SourceError::Api {
            status: 503,
            message: "service unavailable".into(),
        };
        match failures.get_mut(symbol) {
            Some(Failure::Permanent) => Some(SourceError::UnknownSymbol(symbol.to_string())),
            Some(Failure::AlwaysTransient) => Some(unavailable),
            Some(Failure::TransientTimes(n)) if *n > 0 => {
                *n -= 1;
                Some(unavailable)
            }
            _ => None,
        }
    }

    fn page(&self, symbol: &str, interval: Interval, start: i64, end: i64, limit: usize) -> Vec<RawKline> {
        let Some(&(first, count)) = self.series.get(&(symbol.to_string(), interval)) else {
            return Vec::new();
        };
        let step = interval.duration_ms();
        (0..count)
            .map(|i| first + i * step)
            .filter(|t| *t >= start && *t <= end)
            .take(limit)
            .map(|t| raw_kline(t, interval))
            .collect()
    }
}

#[async_trait]
impl KlineSource for SyntheticSource {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn max_page_size(&self) -> usize {
        1500
    }

    async fn get_page(
        &self,
        symbol: &str,
        interval: Interval,
        start_ms: i64,
        end_ms: i64,
        limit: usize,
    ) -> Result<Vec<RawKline>, SourceError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let result = match self.failure_for(symbol) {
            Some(err) => Err(err),
            None => {
                let page = self.page(symbol, interval, start_ms, end_ms, limit);
                self.page_sizes
                    .lock()
                    .unwrap()
                    .entry(symbol.to_string())
                    .or_default()
                    .push(page.len());
                Ok(page)
            }
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Keeps every series it is given; can be told to fail for chosen symbols.
#[derive(Default)]
pub struct RecordingSink {
    written: Mutex<Vec<Series>>,
    failing: Mutex<HashMap<String, usize>>,
    attempts: AtomicUsize,
}

impl RecordingSink {
    /// Fail the next `times` writes for `symbol` (`usize::MAX` for always).
    pub fn fail(self, symbol: &str, times: usize) -> Self {
        self.failing.lock().unwrap().insert(symbol.to_string(), times);
        self
    }

    pub fn written(&self) -> Vec<Series> {
        self.written.lock().unwrap().clone()
    }

    pub fn writes_for(&self, symbol: &str) -> usize {
        self.written
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.symbol() == symbol)
            .count()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SeriesSink for RecordingSink {
    async fn write(&self, series: &Series) -> Result<(), KlineError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        {
            let mut failing = self.failing.lock().unwrap();
            if let Some(left) = failing.get_mut(series.symbol())
                && *left > 0
            {
                *left = left.saturating_sub(1);
                return Err(KlineError::InvalidData("disk full".into()));
            }
        }
        self.written.lock().unwrap().push(series.clone());
        Ok(())
    }
}

/// Holds the write for one symbol on the blocking pool for `hold`, and counts
/// how many other series were committed in the meantime.
pub struct SlowSink {
    symbol: String,
    hold: Duration,
    inner: Arc<RecordingSink>,
    committed_meanwhile: AtomicUsize,
}

impl SlowSink {
    pub fn new(symbol: &str, hold: Duration) -> Self {
        Self {
            symbol: symbol.to_string(),
            hold,
            inner: Arc::new(RecordingSink::default()),
            committed_meanwhile: AtomicUsize::new(0),
        }
    }

    pub fn committed_meanwhile(&self) -> usize {
        self.committed_meanwhile.load(Ordering::SeqCst)
    }

    pub fn recorded(&self) -> &RecordingSink {
        &self.inner
    }
}

#[async_trait]
impl SeriesSink for SlowSink {
    async fn write(&self, series: &Series) -> Result<(), KlineError> {
        if series.symbol() == self.symbol {
            let inner = self.inner.clone();
            let hold = self.hold;
            let meanwhile = run_blocking(move || {
                let before = inner.written().len();
                std::thread::sleep(hold);
                Ok(inner.written().len() - before)
            })
            .await?;
            self.committed_meanwhile.store(meanwhile, Ordering::SeqCst);
        }
        self.inner.write(series).await
    }
}
