use std::collections::BTreeMap;

use crate::candle::Candle;
use crate::interval::Interval;

/// In-progress accumulation of klines for one (symbol, interval) pair.
///
/// Deduplicates by `open_time` (first occurrence wins) and keeps klines ordered.
/// Owned by exactly one assembler until [`SeriesBuilder::finish`] freezes it.
#[derive(Debug)]
pub struct SeriesBuilder {
    symbol: String,
    interval: Interval,
    candles: BTreeMap<i64, Candle>,
}

impl SeriesBuilder {
    pub fn new(symbol: impl Into<String>, interval: Interval) -> Self {
        Self {
            symbol: symbol.into(),
            interval,
            candles: BTreeMap::new(),
        }
    }

    /// Append a page of klines. Returns how many were new.
    pub fn extend(&mut self, candles: impl IntoIterator<Item = Candle>) -> usize {
        let mut added = 0;
        for candle in candles {
            if let std::collections::btree_map::Entry::Vacant(slot) =
                self.candles.entry(candle.open_time)
            {
                slot.insert(candle);
                added += 1;
            }
        }
        added
    }

    pub fn finish(self) -> Series {
        Series {
            symbol: self.symbol,
            interval: self.interval,
            candles: self.candles.into_values().collect(),
        }
    }
}

/// A fully assembled, immutable series, ascending by `open_time` with no
/// duplicate keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Series {
    symbol: String,
    interval: Interval,
    candles: Vec<Candle>,
}

/// A hole between two consecutive klines wider than one interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gap {
    /// Open time of the kline before the hole.
    pub after: i64,
    /// Open time of the kline after the hole.
    pub before: i64,
    /// Klines missing in between.
    pub missing: i64,
}

/// What a job reports about the series it committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesSummary {
    pub candles: usize,
    pub first_open_time: Option<i64>,
    pub last_close_time: Option<i64>,
    pub gaps: usize,
}

impl Series {
    /// Build a series from klines in any order, dropping duplicate open times.
    pub fn from_candles(
        symbol: impl Into<String>,
        interval: Interval,
        candles: impl IntoIterator<Item = Candle>,
    ) -> Self {
        let mut builder = SeriesBuilder::new(symbol, interval);
        builder.extend(candles);
        builder.finish()
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn interval(&self) -> Interval {
        self.interval
    }

    pub fn candles(&self) -> &[Candle] {
        &self.candles
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn first_open_time(&self) -> Option<i64> {
        self.candles.first().map(|c| c.open_time)
    }

    pub fn last_close_time(&self) -> Option<i64> {
        self.candles.last().map(|c| c.close_time)
    }

    pub fn into_candles(self) -> Vec<Candle> {
        self.candles
    }

    /// Holes wider than one interval between consecutive klines.
    pub fn gaps(&self) -> Vec<Gap> {
        let step = self.interval.duration_ms();
        self.candles
            .windows(2)
            .filter_map(|pair| {
                let delta = pair[1].open_time - pair[0].open_time;
                (delta > step).then(|| Gap {
                    after: pair[0].open_time,
                    before: pair[1].open_time,
                    missing: delta / step - 1,
                })
            })
            .collect()
    }

    pub fn summary(&self) -> SeriesSummary {
        SeriesSummary {
            candles: self.len(),
            first_open_time: self.first_open_time(),
            last_close_time: self.last_close_time(),
            gaps: self.gaps().len(),
        }
    }
}
