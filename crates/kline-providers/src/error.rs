use thiserror::Error;

/// Failures talking to a kline source. Rate limits are kept apart from other
/// HTTP failures so callers can honour the server's wait hint.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unparseable response: {0}")]
    Parse(String),

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("unknown symbol {0}")]
    UnknownSymbol(String),

    #[error("invalid request: {0}")]
    Config(String),

    #[error("exchange returned HTTP {status}: {message}")]
    Api { status: u16, message: String },
}
