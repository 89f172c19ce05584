use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::NaiveDate;

use crate::calendar;
use crate::error::KlineError;
use crate::interval::Interval;

/// On-disk layout for committed series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// One JSON array per symbol/interval, newest first.
    #[default]
    Json,
    /// One folder per symbol/interval holding a CSV file per UTC day.
    Csv,
    /// One Parquet file per symbol/interval.
    Parquet,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OutputFormat::Json => "json",
            OutputFormat::Csv => "csv",
            OutputFormat::Parquet => "parquet",
        })
    }
}

impl FromStr for OutputFormat {
    type Err = KlineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "csv" => Ok(OutputFormat::Csv),
            "parquet" => Ok(OutputFormat::Parquet),
            other => Err(KlineError::Config(format!(
                "unsupported output format: '{other}'. Expected: json, csv, parquet"
            ))),
        }
    }
}

/// Where the symbol universe comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SymbolSelection {
    /// Exactly these symbols.
    List(Vec<String>),
    /// Every symbol the exchange currently lists as trading.
    AllTrading,
}

/// Run configuration. Built once at startup and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchConfig {
    pub symbols: SymbolSelection,
    pub intervals: Vec<Interval>,
    pub start_day: NaiveDate,
    pub end_day: NaiveDate,
    pub output_format: OutputFormat,
    pub thread_count: usize,
    pub data_dir: PathBuf,
}

impl FetchConfig {
    /// Check the configuration and normalise it: symbols are upper-cased and
    /// duplicate symbols or intervals are dropped, preserving first occurrence.
    pub fn validated(mut self) -> Result<Self, KlineError> {
        if self.start_day > self.end_day {
            return Err(KlineError::Config(format!(
                "start day {} is after end day {}",
                self.start_day, self.end_day
            )));
        }
        if self.intervals.is_empty() {
            return Err(KlineError::Config("at least one interval is required".into()));
        }
        if self.thread_count == 0 {
            return Err(KlineError::Config("thread count must be at least 1".into()));
        }
        if self.data_dir.as_os_str().is_empty() {
            return Err(KlineError::Config("data directory must not be empty".into()));
        }

        if let SymbolSelection::List(symbols) = &self.symbols {
            let mut normalised: Vec<String> = Vec::with_capacity(symbols.len());
            for symbol in symbols {
                let symbol = symbol.trim().to_uppercase();
                if symbol.is_empty() {
                    continue;
                }
                if !symbol.chars().all(|c| c.is_ascii_alphanumeric()) {
                    return Err(KlineError::Config(format!("invalid symbol: '{symbol}'")));
                }
                if !normalised.contains(&symbol) {
                    normalised.push(symbol);
                }
            }
            if normalised.is_empty() {
                return Err(KlineError::Config("no symbols configured".into()));
            }
            self.symbols = SymbolSelection::List(normalised);
        }

        let mut intervals = Vec::with_capacity(self.intervals.len());
        for interval in &self.intervals {
            if !intervals.contains(interval) {
                intervals.push(*interval);
            }
        }
        self.intervals = intervals;

        Ok(self)
    }

    /// Inclusive millisecond window covering `start_day` 00:00 through the
    /// last millisecond of `end_day` (UTC).
    pub fn window(&self) -> (i64, i64) {
        (
            calendar::day_start_ms(self.start_day),
            calendar::day_end_ms(self.end_day),
        )
    }
}
