use async_trait::async_trait;
use kline_core::error::KlineError;
use kline_core::series::Series;
use kline_core::store::KlineStore;

/// Where committed series end up. A write either lands the whole series or
/// leaves the previous artifact untouched.
#[async_trait]
pub trait SeriesSink: Send + Sync {
    async fn write(&self, series: &Series) -> Result<(), KlineError>;
}

#[async_trait]
impl SeriesSink for KlineStore {
    async fn write(&self, series: &Series) -> Result<(), KlineError> {
        let store = self.clone();
        let series = series.clone();
        run_blocking(move || store.write_series(&series)).await
    }
}

/// Runs filesystem work on tokio's blocking pool, off the workers that are
/// still fetching.
pub(crate) async fn run_blocking<T, F>(work: F) -> Result<T, KlineError>
where
    F: FnOnce() -> Result<T, KlineError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| KlineError::Task(e.to_string()))?
}
