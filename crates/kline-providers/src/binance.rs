use std::time::Duration;

use async_trait::async_trait;
use kline_core::interval::Interval;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde::de::IgnoredAny;
use tracing::debug;

use crate::error::SourceError;
use crate::provider::{KlineSource, RawKline, SymbolSource};

const BINANCE_FUTURES_BASE_URL: &str = "https://fapi.binance.com";

/// Upper bound on `limit` for `/fapi/v1/klines`.
pub const MAX_KLINES_PER_REQUEST: usize = 1500;

/// Fallback wait when a rate-limit response carries no `Retry-After`.
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// Binance error code for an unknown trading pair.
const INVALID_SYMBOL_CODE: i64 = -1121;

/// Binance USD-M futures market data client. No authentication required.
pub struct BinanceFuturesClient {
    client: Client,
    base_url: String,
}

impl BinanceFuturesClient {
    /// Build a client whose requests give up after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, SourceError> {
        let client = Client::builder()
            .user_agent("kline-fetch/0.1")
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: BINANCE_FUTURES_BASE_URL.to_string(),
        })
    }

    /// Point the client at another host (for testing or a mirror).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    async fn check_status(response: Response, context: &str) -> Result<Response, SourceError> {
        let status = response.status();

        // 418 means the IP was banned for ignoring 429s; both are rate limits
        if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::IM_A_TEAPOT {
            let retry_after_secs = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after)
                .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
            return Err(SourceError::RateLimited { retry_after_secs });
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(api_error(status.as_u16(), &body, context));
        }

        Ok(response)
    }
}

/// Row layout of `/fapi/v1/klines`; the trailing field is unused.
#[derive(Debug, Deserialize)]
struct WireKline(
    i64,
    String,
    String,
    String,
    String,
    String,
    i64,
    String,
    u64,
    String,
    String,
    IgnoredAny,
);

impl From<WireKline> for RawKline {
    fn from(w: WireKline) -> Self {
        Self {
            open_time: w.0,
            open: w.1,
            high: w.2,
            low: w.3,
            close: w.4,
            volume: w.5,
            close_time: w.6,
            quote_volume: w.7,
            trade_count: w.8,
            taker_buy_base_volume: w.9,
            taker_buy_quote_volume: w.10,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: i64,
    msg: String,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
struct SymbolInfo {
    symbol: String,
    status: String,
}

fn parse_retry_after(value: &str) -> Option<u64> {
    value.trim().parse::<u64>().ok()
}

fn api_error(status: u16, body: &str, context: &str) -> SourceError {
    match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(err) if err.code == INVALID_SYMBOL_CODE => SourceError::UnknownSymbol(context.to_string()),
        Ok(err) => SourceError::Api {
            status,
            message: format!("{} ({})", err.msg, err.code),
        },
        Err(_) => SourceError::Api {
            status,
            message: body.to_string(),
        },
    }
}

fn parse_klines(body: &str) -> Result<Vec<RawKline>, SourceError> {
    let rows: Vec<WireKline> = serde_json::from_str(body)
        .map_err(|e| SourceError::Parse(format!("failed to parse klines: {e}")))?;
    Ok(rows.into_iter().map(RawKline::from).collect())
}

fn trading_symbols(info: ExchangeInfo) -> Vec<String> {
    let mut symbols: Vec<String> = info
        .symbols
        .into_iter()
        .filter(|s| s.status == "TRADING")
        .map(|s| s.symbol)
        .collect();
    symbols.sort();
    symbols
}

#[async_trait]
impl KlineSource for BinanceFuturesClient {
    fn name(&self) -> &str {
        "binance-futures"
    }

    fn max_page_size(&self) -> usize {
        MAX_KLINES_PER_REQUEST
    }

    async fn get_page(
        &self,
        symbol: &str,
        interval: Interval,
        start_ms: i64,
        end_ms: i64,
        limit: usize,
    ) -> Result<Vec<RawKline>, SourceError> {
        if limit == 0 || limit > MAX_KLINES_PER_REQUEST {
            return Err(SourceError::Config(format!(
                "limit must be within 1..={MAX_KLINES_PER_REQUEST}, got {limit}"
            )));
        }

        let response = self
            .client
            .get(format!("{}/fapi/v1/klines", self.base_url))
            .query(&[
                ("symbol", symbol.to_string()),
                ("interval", interval.to_string()),
                ("startTime", start_ms.to_string()),
                ("endTime", end_ms.to_string()),
                ("limit", limit.to_string()),
            ])
            .send()
            .await?;

        let response = Self::check_status(response, symbol).await?;
        let body = response.text().await?;
        let klines = parse_klines(&body)?;

        debug!(
            "{symbol} {interval}: {} kline(s) from {start_ms} (limit {limit})",
            klines.len()
        );
        Ok(klines)
    }
}

#[async_trait]
impl SymbolSource for BinanceFuturesClient {
    async fn list_symbols(&self) -> Result<Vec<String>, SourceError> {
        let response = self
            .client
            .get(format!("{}/fapi/v1/exchangeInfo", self.base_url))
            .send()
            .await?;

        let response = Self::check_status(response, "exchangeInfo").await?;
        let info: ExchangeInfo = response
            .json()
            .await
            .map_err(|e| SourceError::Parse(format!("failed to parse exchange info: {e}")))?;

        Ok(trading_symbols(info))
    }
}
