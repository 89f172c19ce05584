use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use kline_core::candle::Candle;
use kline_core::interval::Interval;
use kline_providers::provider::{KlineSource, RawKline};
use rust_decimal::Decimal;

use crate::error::JobError;

/// One validated batch of klines, ascending by open time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub candles: Vec<Candle>,
    /// Close time of the last kline, `None` for an empty page.
    pub last_close_time: Option<i64>,
}

/// Issues single bounded page requests against a [`KlineSource`] and turns
/// whatever comes back into a validated [`Page`] or a classified [`JobError`].
pub struct PageFetcher {
    source: Arc<dyn KlineSource>,
    timeout: Duration,
}

impl PageFetcher {
    pub fn new(source: Arc<dyn KlineSource>, timeout: Duration) -> Self {
        Self { source, timeout }
    }

    pub fn source_name(&self) -> &str {
        self.source.name()
    }

    pub fn max_page_size(&self) -> usize {
        self.source.max_page_size()
    }

    pub async fn fetch(
        &self,
        symbol: &str,
        interval: Interval,
        window_start: i64,
        window_end: i64,
        max_records: usize,
    ) -> Result<Page, JobError> {
        let request = self
            .source
            .get_page(symbol, interval, window_start, window_end, max_records);

        let raw = match tokio::time::timeout(self.timeout, request).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(JobError::transient(format!(
                    "{symbol} {interval}: request timed out after {}ms",
                    self.timeout.as_millis()
                )));
            }
        };

        validate_page(raw, window_start, window_end, max_records)
    }
}

fn decimal(value: &str, field: &str, open_time: i64) -> Result<Decimal, JobError> {
    Decimal::from_str(value).map_err(|e| {
        JobError::Malformed(format!("kline {open_time}: invalid {field} '{value}': {e}"))
    })
}

fn to_candle(raw: RawKline) -> Result<Candle, JobError> {
    let t = raw.open_time;
    Ok(Candle {
        open_time: raw.open_time,
        open: decimal(&raw.open, "open", t)?,
        high: decimal(&raw.high, "high", t)?,
        low: decimal(&raw.low, "low", t)?,
        close: decimal(&raw.close, "close", t)?,
        volume: decimal(&raw.volume, "volume", t)?,
        close_time: raw.close_time,
        quote_volume: decimal(&raw.quote_volume, "quote volume", t)?,
        trade_count: raw.trade_count,
        taker_buy_base_volume: decimal(&raw.taker_buy_base_volume, "taker buy base volume", t)?,
        taker_buy_quote_volume: decimal(&raw.taker_buy_quote_volume, "taker buy quote volume", t)?,
    })
}

/// Structural checks only: row count, numeric fields, time ordering and window
/// bounds. Price sanity is out of scope.
pub fn validate_page(
    raw: Vec<RawKline>,
    window_start: i64,
    window_end: i64,
    max_records: usize,
) -> Result<Page, JobError> {
    if raw.len() > max_records {
        return Err(JobError::Malformed(format!(
            "page has {} rows, requested at most {max_records}",
            raw.len()
        )));
    }

    let mut candles: Vec<Candle> = Vec::with_capacity(raw.len());
    for row in raw {
        if row.open_time < window_start || row.open_time > window_end {
            return Err(JobError::Malformed(format!(
                "kline {} outside requested window [{window_start}, {window_end}]",
                row.open_time
            )));
        }
        if row.close_time < row.open_time {
            return Err(JobError::Malformed(format!(
                "kline {} closes before it opens ({})",
                row.open_time, row.close_time
            )));
        }
        if let Some(prev) = candles.last()
            && row.open_time <= prev.open_time
        {
            return Err(JobError::Malformed(format!(
                "open times not ascending: {} after {}",
                row.open_time, prev.open_time
            )));
        }
        candles.push(to_candle(row)?);
    }

    let last_close_time = candles.last().map(|c| c.close_time);
    Ok(Page {
        candles,
        last_close_time,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::testing::{ScriptedSource, raw_kline};
    use kline_providers::error::SourceError;
    use rust_decimal_macros::dec;

    const T0: i64 = 1_725_148_800_000;
    const MIN: i64 = 60_000;

    fn rows(n: i64) -> Vec<RawKline> {
        (0..n).map(|i| raw_kline(T0 + i * MIN, Interval::M1)).collect()
    }

    #[test]
    fn valid_page_is_parsed() {
        let page = validate_page(rows(3), T0, T0 + 10 * MIN, 1000).unwrap();
        assert_eq!(page.candles.len(), 3);
        assert_eq!(page.last_close_time, Some(T0 + 3 * MIN - 1));
        assert_eq!(page.candles[0].open, dec!(58969.90));
        assert_eq!(page.candles[0].taker_buy_quote_volume, dec!(4127781.0020));
    }

    #[test]
    fn empty_page_has_no_boundary() {
        let page = validate_page(Vec::new(), T0, T0 + MIN, 1000).unwrap();
        assert!(page.candles.is_empty());
        assert_eq!(page.last_close_time, None);
    }

    #[test]
    fn too_many_rows_is_malformed() {
        let err = validate_page(rows(5), T0, T0 + 10 * MIN, 4).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Malformed);
    }

    #[test]
    fn unordered_rows_are_malformed() {
        let mut page = rows(3);
        page.swap(0, 2);
        let err = validate_page(page, T0, T0 + 10 * MIN, 1000).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Malformed);

        let mut page = rows(2);
        page[1].open_time = page[0].open_time;
        assert!(validate_page(page, T0, T0 + 10 * MIN, 1000).is_err());
    }

    #[test]
    fn rows_outside_window_are_malformed() {
        let err = validate_page(rows(3), T0 + MIN, T0 + 10 * MIN, 1000).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Malformed);

        let err = validate_page(rows(3), T0, T0 + MIN, 1000).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Malformed);
    }

    #[test]
    fn bad_numbers_are_malformed() {
        let mut page = rows(1);
        page[0].close = "NaN-ish".into();
        let err = validate_page(page, T0, T0 + MIN, 1000).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Malformed);
        assert!(err.to_string().contains("close"));
    }

    #[test]
    fn close_before_open_is_malformed() {
        let mut page = rows(1);
        page[0].close_time = T0 - 1;
        assert!(validate_page(page, T0, T0 + MIN, 1000).is_err());
    }

    #[tokio::test]
    async fn source_errors_are_classified() {
        let source = Arc::new(ScriptedSource::new(vec![
            Err(SourceError::RateLimited {
                retry_after_secs: 1,
            }),
            Err(SourceError::UnknownSymbol("FOOUSDT".into())),
            Err(SourceError::Parse("truncated body".into())),
        ]));
        let fetcher = PageFetcher::new(source, Duration::from_secs(5));

        let kinds: Vec<ErrorKind> = [
            fetcher.fetch("FOOUSDT", Interval::M1, T0, T0 + MIN, 1000).await,
            fetcher.fetch("FOOUSDT", Interval::M1, T0, T0 + MIN, 1000).await,
            fetcher.fetch("FOOUSDT", Interval::M1, T0, T0 + MIN, 1000).await,
        ]
        .into_iter()
        .map(|r| r.unwrap_err().kind())
        .collect();

        assert_eq!(
            kinds,
            vec![ErrorKind::Transient, ErrorKind::Permanent, ErrorKind::Malformed]
        );
    }

    #[tokio::test]
    async fn slow_source_times_out_as_transient() {
        let source = Arc::new(
            ScriptedSource::new(vec![Ok(rows(1))]).with_delay(Duration::from_millis(500)),
        );
        let fetcher = PageFetcher::new(source, Duration::from_millis(20));

        let err = fetcher
            .fetch("BTCUSDT", Interval::M1, T0, T0 + MIN, 1000)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert!(err.to_string().contains("timed out"));
    }
}
