use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use tracing::{debug, warn};

use crate::calendar;
use crate::candle::{Candle, CandleRow};
use crate::config::OutputFormat;
use crate::error::KlineError;
use crate::interval::Interval;
use crate::schema;
use crate::series::Series;

/// Filesystem-backed store for committed kline series.
///
/// Layouts, relative to the data directory:
/// - JSON: `{SYMBOL}_{INTERVAL}.json`, exchange rows, newest first
/// - CSV: `{SYMBOL}/{INTERVAL}/{SYMBOL}-{INTERVAL}-{YYYY-MM-DD}.csv`, one file per UTC day
/// - Parquet: `{SYMBOL}_{INTERVAL}.parquet`
///
/// Every write goes to a temporary sibling first and is renamed into place, so a
/// failed write never leaves a truncated artifact behind.
#[derive(Debug, Clone)]
pub struct KlineStore {
    data_dir: PathBuf,
    format: OutputFormat,
}

impl KlineStore {
    pub fn new(data_dir: impl AsRef<Path>, format: OutputFormat) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            format,
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    pub fn json_path(&self, symbol: &str, interval: Interval) -> PathBuf {
        self.data_dir.join(format!("{symbol}_{interval}.json"))
    }

    pub fn parquet_path(&self, symbol: &str, interval: Interval) -> PathBuf {
        self.data_dir.join(format!("{symbol}_{interval}.parquet"))
    }

    pub fn csv_dir(&self, symbol: &str, interval: Interval) -> PathBuf {
        self.data_dir.join(symbol).join(interval.as_str())
    }

    pub fn csv_file_name(symbol: &str, interval: Interval, date: NaiveDate) -> String {
        format!("{symbol}-{interval}-{}.csv", date.format("%Y-%m-%d"))
    }

    /// Whether a series for this pair has already been stored.
    pub fn has_series(&self, symbol: &str, interval: Interval) -> bool {
        match self.format {
            OutputFormat::Json => self.json_path(symbol, interval).exists(),
            OutputFormat::Parquet => self.parquet_path(symbol, interval).exists(),
            OutputFormat::Csv => csv_files(&self.csv_dir(symbol, interval))
                .map(|files| !files.is_empty())
                .unwrap_or(false),
        }
    }

    /// Persist a complete series, merging it with whatever is already stored
    /// for the pair (new klines replace stored ones with the same open time).
    ///
    /// An empty series with nothing stored yet writes nothing.
    pub fn write_series(&self, series: &Series) -> Result<(), KlineError> {
        if series.is_empty() && !self.has_series(series.symbol(), series.interval()) {
            debug!(
                "{} {}: empty series, nothing to write",
                series.symbol(),
                series.interval()
            );
            return Ok(());
        }

        match self.format {
            OutputFormat::Json => self.write_json(series),
            OutputFormat::Csv => self.write_csv(series),
            OutputFormat::Parquet => self.write_parquet(series),
        }
    }

    /// Read a stored series, ascending by open time.
    pub fn read_series(&self, symbol: &str, interval: Interval) -> Result<Vec<Candle>, KlineError> {
        let mut candles = match self.format {
            OutputFormat::Json => {
                let path = self.json_path(symbol, interval);
                if !path.exists() {
                    return Err(no_data(symbol, interval));
                }
                read_json(&path)?
            }
            OutputFormat::Parquet => {
                let path = self.parquet_path(symbol, interval);
                if !path.exists() {
                    return Err(no_data(symbol, interval));
                }
                schema::read_parquet(&path)?
            }
            OutputFormat::Csv => {
                let files = csv_files(&self.csv_dir(symbol, interval))?;
                if files.is_empty() {
                    return Err(no_data(symbol, interval));
                }
                let mut all = Vec::new();
                for file in files {
                    all.append(&mut read_csv(&file)?);
                }
                all
            }
        };

        candles.sort_by_key(|c| c.open_time);
        Ok(candles)
    }

    /// List every stored (symbol, interval) pair, sorted.
    pub fn list_series(&self) -> Result<Vec<(String, Interval)>, KlineError> {
        if !self.data_dir.exists() {
            return Ok(Vec::new());
        }

        let mut pairs = Vec::new();
        match self.format {
            OutputFormat::Json | OutputFormat::Parquet => {
                let extension = if self.format == OutputFormat::Json {
                    "json"
                } else {
                    "parquet"
                };
                for entry in fs::read_dir(&self.data_dir)? {
                    let entry = entry?;
                    if !entry.file_type()?.is_file() {
                        continue;
                    }
                    let file_name = entry.file_name();
                    let name = file_name.to_string_lossy();
                    if name.starts_with('.') {
                        continue;
                    }
                    if let Some(stem) = name.strip_suffix(&format!(".{extension}"))
                        && let Some((symbol, interval)) = stem.rsplit_once('_')
                        && let Ok(interval) = interval.parse::<Interval>()
                    {
                        pairs.push((symbol.to_string(), interval));
                    }
                }
            }
            OutputFormat::Csv => {
                for symbol_entry in fs::read_dir(&self.data_dir)? {
                    let symbol_entry = symbol_entry?;
                    if !symbol_entry.file_type()?.is_dir() {
                        continue;
                    }
                    let Some(symbol) = symbol_entry.file_name().to_str().map(str::to_string) else {
                        continue;
                    };
                    if symbol.starts_with('.') {
                        continue;
                    }
                    for interval_entry in fs::read_dir(symbol_entry.path())? {
                        let interval_entry = interval_entry?;
                        if interval_entry.file_type()?.is_dir()
                            && let Some(name) = interval_entry.file_name().to_str()
                            && let Ok(interval) = name.parse::<Interval>()
                            && self.has_series(&symbol, interval)
                        {
                            pairs.push((symbol.clone(), interval));
                        }
                    }
                }
            }
        }

        pairs.sort();
        Ok(pairs)
    }

    fn write_json(&self, series: &Series) -> Result<(), KlineError> {
        let path = self.json_path(series.symbol(), series.interval());
        let mut merged = BTreeMap::new();

        if path.exists() {
            match read_json(&path) {
                Ok(existing) => merged.extend(existing.into_iter().map(|c| (c.open_time, c))),
                Err(e) => warn!(
                    "{}: existing file unreadable, replacing it: {e}",
                    path.display()
                ),
            }
        }
        merged.extend(series.candles().iter().map(|c| (c.open_time, c.clone())));

        let rows: Vec<CandleRow> = merged.values().rev().map(Candle::to_row).collect();
        write_atomic(&path, |w| Ok(serde_json::to_writer_pretty(w, &rows)?))?;

        debug!("{}: wrote {} row(s)", path.display(), rows.len());
        Ok(())
    }

    fn write_parquet(&self, series: &Series) -> Result<(), KlineError> {
        let path = self.parquet_path(series.symbol(), series.interval());
        let mut merged = BTreeMap::new();

        if path.exists() {
            match schema::read_parquet(&path) {
                Ok(existing) => merged.extend(existing.into_iter().map(|c| (c.open_time, c))),
                Err(e) => warn!(
                    "{}: existing file unreadable, replacing it: {e}",
                    path.display()
                ),
            }
        }
        merged.extend(series.candles().iter().map(|c| (c.open_time, c.clone())));

        let candles: Vec<Candle> = merged.into_values().collect();
        write_atomic(&path, |w| schema::write_parquet(w, &candles))?;

        debug!("{}: wrote {} row(s)", path.display(), candles.len());
        Ok(())
    }

    /// Day files are assembled in a staging directory next to the target and the
    /// whole directory is swapped in at the end.
    fn write_csv(&self, series: &Series) -> Result<(), KlineError> {
        let symbol = series.symbol();
        let interval = series.interval();
        let target = self.csv_dir(symbol, interval);
        let parent = target
            .parent()
            .ok_or_else(|| KlineError::InvalidData(format!("no parent for {}", target.display())))?;
        fs::create_dir_all(parent)?;

        let mut by_day: BTreeMap<NaiveDate, BTreeMap<i64, Candle>> = BTreeMap::new();
        for candle in series.candles() {
            let date = calendar::date_of_ms(candle.open_time).ok_or_else(|| {
                KlineError::InvalidData(format!("invalid open time: {}", candle.open_time))
            })?;
            by_day
                .entry(date)
                .or_default()
                .insert(candle.open_time, candle.clone());
        }

        let staging = tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(parent)?;

        for (date, candles) in &by_day {
            let name = Self::csv_file_name(symbol, interval, *date);
            let existing = target.join(&name);
            let mut day = BTreeMap::new();
            if existing.exists() {
                match read_csv(&existing) {
                    Ok(stored) => day.extend(stored.into_iter().map(|c| (c.open_time, c))),
                    Err(e) => warn!("{}: existing file unreadable, replacing it: {e}", existing.display()),
                }
            }
            day.extend(candles.iter().map(|(k, c)| (*k, c.clone())));

            let mut writer = csv::WriterBuilder::new()
                .has_headers(false)
                .from_writer(BufWriter::new(File::create(staging.path().join(&name))?));
            writer.write_record(CSV_HEADER)?;
            for candle in day.values() {
                writer.serialize(candle.to_row())?;
            }
            writer.flush()?;
        }

        // days outside the new series are carried over untouched
        for file in csv_files(&target)? {
            if let Some(name) = file.file_name() {
                let staged = staging.path().join(name);
                if !staged.exists() {
                    fs::copy(&file, staged)?;
                }
            }
        }

        swap_dir(staging.path(), &target)?;
        debug!("{}: wrote {} day file(s)", target.display(), by_day.len());
        Ok(())
    }
}

fn no_data(symbol: &str, interval: Interval) -> KlineError {
    KlineError::NoData {
        symbol: symbol.to_string(),
        interval: interval.to_string(),
    }
}

fn read_json(path: &Path) -> Result<Vec<Candle>, KlineError> {
    let reader = BufReader::new(File::open(path)?);
    let rows: Vec<CandleRow> = serde_json::from_reader(reader)?;
    Ok(rows.into_iter().map(Candle::from).collect())
}

/// Column names of the exchange's daily kline archives.
const CSV_HEADER: [&str; 12] = [
    "open_time",
    "open",
    "high",
    "low",
    "close",
    "volume",
    "close_time",
    "quote_volume",
    "count",
    "taker_buy_volume",
    "taker_buy_quote_volume",
    "ignore",
];

fn read_csv(path: &Path) -> Result<Vec<Candle>, KlineError> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut candles = Vec::new();
    for record in reader.deserialize::<CandleRow>() {
        candles.push(Candle::from(record?));
    }
    Ok(candles)
}

/// CSV files directly inside `dir`, sorted by name. Missing directory is empty.
fn csv_files(dir: &Path) -> Result<Vec<PathBuf>, KlineError> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_file() && path.extension().is_some_and(|ext| ext == "csv") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Write through a temporary file in the destination directory, then rename.
fn write_atomic<F>(path: &Path, write: F) -> Result<(), KlineError>
where
    F: FnOnce(&mut BufWriter<&mut File>) -> Result<(), KlineError>,
{
    let parent = path
        .parent()
        .ok_or_else(|| KlineError::InvalidData(format!("no parent for {}", path.display())))?;
    fs::create_dir_all(parent)?;

    let mut tmp = tempfile::Builder::new().prefix(".tmp-").tempfile_in(parent)?;
    {
        let mut writer = BufWriter::new(tmp.as_file_mut());
        write(&mut writer)?;
        writer.flush()?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| KlineError::Io(e.error))?;
    Ok(())
}

/// Replace `target` with `staged`. On failure the previous directory is restored.
fn swap_dir(staged: &Path, target: &Path) -> Result<(), KlineError> {
    if !target.exists() {
        fs::rename(staged, target)?;
        return Ok(());
    }

    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let backup = target.with_file_name(format!(".{name}.replaced-{}", std::process::id()));

    fs::rename(target, &backup)?;
    if let Err(e) = fs::rename(staged, target) {
        if let Err(restore) = fs::rename(&backup, target) {
            warn!(
                "{}: could not restore previous data from {}: {restore}",
                target.display(),
                backup.display()
            );
        }
        return Err(e.into());
    }
    if let Err(e) = fs::remove_dir_all(&backup) {
        warn!("{}: could not remove {e}", backup.display());
    }
    Ok(())
}
