use async_trait::async_trait;
use kline_core::interval::Interval;

use crate::error::SourceError;

/// One kline exactly as the source returned it. Numeric fields are kept as the
/// source's decimal strings; validation and parsing happen in the fetch engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawKline {
    pub open_time: i64,
    pub open: String,
    pub high: String,
    pub low: String,
    pub close: String,
    pub volume: String,
    pub close_time: i64,
    pub quote_volume: String,
    pub trade_count: u64,
    pub taker_buy_base_volume: String,
    pub taker_buy_quote_volume: String,
}

/// A paginated source of historical klines.
#[async_trait]
pub trait KlineSource: Send + Sync {
    /// Provider name (for logging/display).
    fn name(&self) -> &str;

    /// Largest `limit` a single request may ask for.
    fn max_page_size(&self) -> usize;

    /// Fetch at most `limit` klines whose open time lies in the inclusive
    /// window `[start_ms, end_ms]`, oldest first.
    async fn get_page(
        &self,
        symbol: &str,
        interval: Interval,
        start_ms: i64,
        end_ms: i64,
        limit: usize,
    ) -> Result<Vec<RawKline>, SourceError>;
}

/// Discovery of the tradable symbol universe.
#[async_trait]
pub trait SymbolSource: Send + Sync {
    async fn list_symbols(&self) -> Result<Vec<String>, SourceError>;
}
