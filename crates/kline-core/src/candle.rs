use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A single OHLCV kline. Timestamps are Unix milliseconds (UTC).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    #[serde(with = "rust_decimal::serde::str")]
    pub open: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub high: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub low: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub close: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub volume: Decimal,
    pub close_time: i64,
    #[serde(with = "rust_decimal::serde::str")]
    pub quote_volume: Decimal,
    pub trade_count: u64,
    #[serde(with = "rust_decimal::serde::str")]
    pub taker_buy_base_volume: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub taker_buy_quote_volume: Decimal,
}

/// Exchange row layout used by the JSON output:
/// `[open_time, open, high, low, close, volume, close_time, quote_volume,
///   trades, taker_buy_base, taker_buy_quote, ignore]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandleRow(
    pub i64,
    #[serde(with = "rust_decimal::serde::str")] pub Decimal,
    #[serde(with = "rust_decimal::serde::str")] pub Decimal,
    #[serde(with = "rust_decimal::serde::str")] pub Decimal,
    #[serde(with = "rust_decimal::serde::str")] pub Decimal,
    #[serde(with = "rust_decimal::serde::str")] pub Decimal,
    pub i64,
    #[serde(with = "rust_decimal::serde::str")] pub Decimal,
    pub u64,
    #[serde(with = "rust_decimal::serde::str")] pub Decimal,
    #[serde(with = "rust_decimal::serde::str")] pub Decimal,
    pub String,
);

impl Candle {
    pub fn to_row(&self) -> CandleRow {
        CandleRow(
            self.open_time,
            self.open,
            self.high,
            self.low,
            self.close,
            self.volume,
            self.close_time,
            self.quote_volume,
            self.trade_count,
            self.taker_buy_base_volume,
            self.taker_buy_quote_volume,
            "0".to_string(),
        )
    }
}

impl From<CandleRow> for Candle {
    fn from(row: CandleRow) -> Self {
        Self {
            open_time: row.0,
            open: row.1,
            high: row.2,
            low: row.3,
            close: row.4,
            volume: row.5,
            close_time: row.6,
            quote_volume: row.7,
            trade_count: row.8,
            taker_buy_base_volume: row.9,
            taker_buy_quote_volume: row.10,
        }
    }
}
