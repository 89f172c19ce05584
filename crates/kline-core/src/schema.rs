use std::path::Path;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, Int64Array, StringArray, UInt64Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use rust_decimal::Decimal;

use crate::candle::Candle;
use crate::error::KlineError;

const DECIMAL_COLUMNS: [(usize, &str); 8] = [
    (1, "open"),
    (2, "high"),
    (3, "low"),
    (4, "close"),
    (5, "volume"),
    (7, "quote_volume"),
    (9, "taker_buy_base_volume"),
    (10, "taker_buy_quote_volume"),
];

/// Decimal columns are stored as strings so no precision is lost.
pub fn candle_schema() -> Schema {
    Schema::new(vec![
        Field::new("open_time", DataType::Int64, false),
        Field::new("open", DataType::Utf8, false),
        Field::new("high", DataType::Utf8, false),
        Field::new("low", DataType::Utf8, false),
        Field::new("close", DataType::Utf8, false),
        Field::new("volume", DataType::Utf8, false),
        Field::new("close_time", DataType::Int64, false),
        Field::new("quote_volume", DataType::Utf8, false),
        Field::new("trade_count", DataType::UInt64, false),
        Field::new("taker_buy_base_volume", DataType::Utf8, false),
        Field::new("taker_buy_quote_volume", DataType::Utf8, false),
    ])
}

fn decimal_column(candles: &[Candle], field: impl Fn(&Candle) -> Decimal) -> ArrayRef {
    let values: Vec<String> = candles.iter().map(|c| field(c).to_string()).collect();
    Arc::new(StringArray::from(values))
}

pub fn candles_to_record_batch(candles: &[Candle]) -> Result<RecordBatch, KlineError> {
    let schema = Arc::new(candle_schema());

    let columns: Vec<ArrayRef> = vec![
        Arc::new(Int64Array::from(
            candles.iter().map(|c| c.open_time).collect::<Vec<i64>>(),
        )),
        decimal_column(candles, |c| c.open),
        decimal_column(candles, |c| c.high),
        decimal_column(candles, |c| c.low),
        decimal_column(candles, |c| c.close),
        decimal_column(candles, |c| c.volume),
        Arc::new(Int64Array::from(
            candles.iter().map(|c| c.close_time).collect::<Vec<i64>>(),
        )),
        decimal_column(candles, |c| c.quote_volume),
        Arc::new(UInt64Array::from(
            candles.iter().map(|c| c.trade_count).collect::<Vec<u64>>(),
        )),
        decimal_column(candles, |c| c.taker_buy_base_volume),
        decimal_column(candles, |c| c.taker_buy_quote_volume),
    ];

    Ok(RecordBatch::try_new(schema, columns)?)
}

fn int64_column<'a>(batch: &'a RecordBatch, idx: usize, name: &str) -> Result<&'a Int64Array, KlineError> {
    batch
        .column(idx)
        .as_any()
        .downcast_ref::<Int64Array>()
        .ok_or_else(|| KlineError::InvalidData(format!("expected {name} column")))
}

pub fn record_batch_to_candles(batch: &RecordBatch) -> Result<Vec<Candle>, KlineError> {
    let open_times = int64_column(batch, 0, "open_time")?;
    let close_times = int64_column(batch, 6, "close_time")?;
    let trade_counts = batch
        .column(8)
        .as_any()
        .downcast_ref::<UInt64Array>()
        .ok_or_else(|| KlineError::InvalidData("expected trade_count column".into()))?;

    let mut decimals: Vec<&StringArray> = Vec::with_capacity(DECIMAL_COLUMNS.len());
    for (idx, name) in DECIMAL_COLUMNS {
        let column = batch
            .column(idx)
            .as_any()
            .downcast_ref::<StringArray>()
            .ok_or_else(|| KlineError::InvalidData(format!("expected {name} column")))?;
        decimals.push(column);
    }

    let parse = |col: usize, row: usize| -> Result<Decimal, KlineError> {
        let (_, name) = DECIMAL_COLUMNS[col];
        decimals[col]
            .value(row)
            .parse()
            .map_err(|e| KlineError::InvalidData(format!("invalid {name}: {e}")))
    };

    let mut candles = Vec::with_capacity(batch.num_rows());
    for i in 0..batch.num_rows() {
        if open_times.is_null(i) || close_times.is_null(i) || trade_counts.is_null(i) {
            return Err(KlineError::InvalidData(format!("null value in row {i}")));
        }
        candles.push(Candle {
            open_time: open_times.value(i),
            open: parse(0, i)?,
            high: parse(1, i)?,
            low: parse(2, i)?,
            close: parse(3, i)?,
            volume: parse(4, i)?,
            close_time: close_times.value(i),
            quote_volume: parse(5, i)?,
            trade_count: trade_counts.value(i),
            taker_buy_base_volume: parse(6, i)?,
            taker_buy_quote_volume: parse(7, i)?,
        });
    }

    Ok(candles)
}

/// Encode candles into `writer` as a single Snappy-compressed row group.
pub fn write_parquet<W: std::io::Write + Send>(writer: W, candles: &[Candle]) -> Result<(), KlineError> {
    let batch = candles_to_record_batch(candles)?;

    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();

    let mut writer = ArrowWriter::try_new(writer, batch.schema(), Some(props))?;
    writer.write(&batch)?;
    writer.close()?;

    Ok(())
}

pub fn read_parquet(path: &Path) -> Result<Vec<Candle>, KlineError> {
    let file = std::fs::File::open(path)?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
    let reader = builder.build()?;

    let mut all_candles = Vec::new();
    for batch in reader {
        let batch = batch?;
        let mut candles = record_batch_to_candles(&batch)?;
        all_candles.append(&mut candles);
    }

    Ok(all_candles)
}
