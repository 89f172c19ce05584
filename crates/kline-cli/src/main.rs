use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use kline_core::config::{FetchConfig, OutputFormat, SymbolSelection};
use kline_core::interval::Interval;
use kline_core::series::Series;
use kline_core::store::KlineStore;
use kline_engine::retry::RetryConfig;
use kline_engine::{EngineConfig, JobScheduler};
use kline_providers::binance::BinanceFuturesClient;
use kline_providers::provider::SymbolSource;
use tracing::info;

#[derive(Parser)]
#[command(
    name = "kline-fetch",
    about = "Download and manage Binance USD-M futures klines"
)]
struct Cli {
    /// Root directory for data storage
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Storage format: json, csv, parquet
    #[arg(long, global = true, default_value = "json")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch klines for every symbol x interval and commit complete series
    Fetch(FetchArgs),

    /// Show what series exist in the store
    Status {
        /// Filter by symbol (shows all if omitted)
        #[arg(short, long)]
        symbol: Option<String>,
    },

    /// Re-read stored series and report ordering, duplicate and gap issues
    Validate {
        /// Symbols to validate (all if omitted, comma-separated)
        #[arg(short, long, value_delimiter = ',')]
        symbols: Option<Vec<String>>,
    },
}

#[derive(Args)]
struct FetchArgs {
    /// Symbols to fetch (comma-separated)
    #[arg(
        short,
        long,
        value_delimiter = ',',
        required_unless_present = "all_symbols",
        conflicts_with = "all_symbols"
    )]
    symbols: Vec<String>,

    /// Fetch every symbol currently trading on the exchange
    #[arg(long)]
    all_symbols: bool,

    /// Intervals (comma-separated)
    #[arg(
        short,
        long,
        value_delimiter = ',',
        default_values_t = [Interval::M1, Interval::M30, Interval::H1]
    )]
    intervals: Vec<Interval>,

    /// First day to fetch (YYYY-MM-DD, UTC)
    #[arg(long)]
    start: NaiveDate,

    /// Last day to fetch (YYYY-MM-DD, UTC, defaults to yesterday)
    #[arg(long)]
    end: Option<NaiveDate>,

    /// Concurrent jobs
    #[arg(long, default_value_t = 5)]
    threads: usize,

    /// Re-download series that already exist
    #[arg(long)]
    force: bool,

    /// Klines per request
    #[arg(long, default_value_t = 1000)]
    page_limit: usize,

    /// Attempts per page before giving up
    #[arg(long, default_value_t = 5)]
    max_attempts: u32,

    /// First retry delay in milliseconds, doubled on each further attempt
    #[arg(long, default_value_t = 1000)]
    base_delay_ms: u64,

    /// Per-request timeout in seconds
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,

    /// Treat any short page as the end of the data
    #[arg(long)]
    no_confirm_exhaustion: bool,

    /// Override the exchange REST endpoint
    #[arg(long)]
    base_url: Option<String>,
}

impl FetchArgs {
    fn fetch_config(&self, data_dir: PathBuf, format: OutputFormat) -> Result<FetchConfig> {
        let symbols = if self.all_symbols {
            SymbolSelection::AllTrading
        } else {
            SymbolSelection::List(self.symbols.clone())
        };
        let end_day = self
            .end
            .unwrap_or_else(|| (Utc::now() - chrono::Duration::days(1)).date_naive());

        let config = FetchConfig {
            symbols,
            intervals: self.intervals.clone(),
            start_day: self.start,
            end_day,
            output_format: format,
            thread_count: self.threads,
            data_dir,
        };
        Ok(config.validated()?)
    }

    fn engine_config(&self) -> Result<EngineConfig> {
        let defaults = EngineConfig::default();
        let config = EngineConfig {
            page_limit: self.page_limit,
            request_timeout: Duration::from_secs(self.timeout_secs),
            retry: RetryConfig {
                max_attempts: self.max_attempts,
                base_delay: Duration::from_millis(self.base_delay_ms),
                ..defaults.retry.clone()
            },
            confirm_exhaustion: !self.no_confirm_exhaustion,
            ..defaults
        };
        Ok(config.validated()?)
    }
}

fn format_ms(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ms.to_string())
}

async fn cmd_fetch(data_dir: PathBuf, format: OutputFormat, args: &FetchArgs) -> Result<()> {
    let config = args
        .fetch_config(data_dir, format)
        .context("invalid fetch configuration")?;
    let engine = args.engine_config().context("invalid engine configuration")?;

    let mut client = BinanceFuturesClient::new(engine.request_timeout)
        .context("failed to create Binance client")?;
    if let Some(url) = &args.base_url {
        client = client.with_base_url(url.clone());
    }
    let client = Arc::new(client);

    let symbols = match &config.symbols {
        SymbolSelection::List(symbols) => symbols.clone(),
        SymbolSelection::AllTrading => client
            .list_symbols()
            .await
            .context("failed to list trading symbols")?,
    };
    info!("{} symbol(s), intervals {:?}", symbols.len(), config.intervals);

    let store = Arc::new(KlineStore::new(&config.data_dir, config.output_format));
    let (window_start, window_end) = config.window();

    let mut jobs = JobScheduler::plan(&symbols, &config.intervals, window_start, window_end);
    if !args.force {
        let before = jobs.len();
        jobs.retain(|job| {
            let exists = store.has_series(job.symbol(), job.interval());
            if exists {
                info!("{job}: already stored, skipping");
            }
            !exists
        });
        if jobs.len() < before {
            info!("skipped {} existing series (use --force to re-fetch)", before - jobs.len());
        }
    }

    if jobs.is_empty() {
        println!("Nothing to fetch.");
        return Ok(());
    }

    info!(
        "fetching {} job(s) from {} to {} into {}",
        jobs.len(),
        config.start_day,
        config.end_day,
        config.data_dir.display()
    );
    let scheduler = JobScheduler::new(engine, client, store);
    let report = scheduler.run(jobs, config.thread_count).await;

    for outcome in report.outcomes() {
        println!("{outcome}");
    }
    println!(
        "{}/{} job(s) succeeded, {} kline(s) committed.",
        report.succeeded(),
        report.outcomes().len(),
        report.total_candles()
    );

    if !report.is_success() {
        anyhow::bail!("{} job(s) failed", report.failures().len());
    }
    Ok(())
}

fn cmd_status(store: &KlineStore, symbol: Option<&str>) -> Result<()> {
    let filter = symbol.map(str::to_uppercase);
    let pairs: Vec<(String, Interval)> = store
        .list_series()
        .context("failed to list series")?
        .into_iter()
        .filter(|(sym, _)| filter.as_ref().is_none_or(|f| f == sym))
        .collect();

    if pairs.is_empty() {
        println!("No data in store.");
        return Ok(());
    }

    for (sym, interval) in &pairs {
        let candles = store
            .read_series(sym, *interval)
            .with_context(|| format!("failed to read {sym} {interval}"))?;
        match (candles.first(), candles.last()) {
            (Some(first), Some(last)) => println!(
                "{sym} {interval}: {} kline(s), {} to {}",
                candles.len(),
                format_ms(first.open_time),
                format_ms(last.close_time)
            ),
            _ => println!("{sym} {interval}: no data"),
        }
    }

    Ok(())
}

fn cmd_validate(store: &KlineStore, symbols: Option<&[String]>) -> Result<()> {
    let wanted: Option<Vec<String>> = symbols.map(|list| list.iter().map(|s| s.to_uppercase()).collect());
    let pairs: Vec<(String, Interval)> = store
        .list_series()
        .context("failed to list series")?
        .into_iter()
        .filter(|(sym, _)| wanted.as_ref().is_none_or(|w| w.contains(sym)))
        .collect();

    if pairs.is_empty() {
        println!("No data to validate.");
        return Ok(());
    }

    let mut issues = 0;

    for (sym, interval) in &pairs {
        let candles = match store.read_series(sym, *interval) {
            Ok(candles) => candles,
            Err(e) => {
                println!("ERROR: {sym} {interval}: failed to read: {e}");
                issues += 1;
                continue;
            }
        };

        if candles.is_empty() {
            println!("WARN: {sym} {interval}: empty series");
            issues += 1;
            continue;
        }

        let duplicates = candles
            .windows(2)
            .filter(|w| w[0].open_time == w[1].open_time)
            .count();
        if duplicates > 0 {
            println!("WARN: {sym} {interval}: {duplicates} duplicate open time(s)");
            issues += 1;
        }

        let inverted = candles.iter().filter(|c| c.close_time < c.open_time).count();
        let overlapping = candles
            .windows(2)
            .filter(|w| w[0].open_time != w[1].open_time && w[0].close_time >= w[1].open_time)
            .count();
        if inverted + overlapping > 0 {
            println!(
                "WARN: {sym} {interval}: {inverted} kline(s) close before they open, {overlapping} overlap the next"
            );
            issues += 1;
        }

        let series = Series::from_candles(sym.as_str(), *interval, candles);
        let gaps = series.gaps();
        if !gaps.is_empty() {
            let missing: i64 = gaps.iter().map(|g| g.missing).sum();
            println!(
                "WARN: {sym} {interval}: {} gap(s), {missing} kline(s) missing, first after {}",
                gaps.len(),
                format_ms(gaps[0].after)
            );
            issues += 1;
        }
    }

    if issues == 0 {
        println!("All series valid.");
    } else {
        println!("{issues} issue(s) found.");
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .init();

    let store = KlineStore::new(&cli.data_dir, cli.format);

    match &cli.command {
        Commands::Fetch(args) => {
            cmd_fetch(cli.data_dir.clone(), cli.format, args).await?;
        }
        Commands::Status { symbol } => {
            cmd_status(&store, symbol.as_deref())?;
        }
        Commands::Validate { symbols } => {
            cmd_validate(&store, symbols.as_deref())?;
        }
    }

    Ok(())
}
