// =============================================================================
// Parquet Sink -- partitioned columnar output for bar records
// =============================================================================
//
// Bars land under `year=Y/month=M/day=D` below the symbol root, one freshly
// named file per partition per run. Re-runs therefore add files instead of
// rewriting; readers deduplicate by (symbol, window_start) taking the latest
// write. The `window_start` column is a timezone-aware UTC timestamp.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow::array::{ArrayRef, Float64Array, StringArray, TimestampMillisecondArray, UInt64Array};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::NaiveDate;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, GzipLevel, ZstdLevel};
use parquet::file::properties::WriterProperties;
use parquet::file::reader::FileReader;
use parquet::file::serialized_reader::SerializedFileReader;
use rand::Rng;
use tracing::{debug, warn};

use crate::lake;

use super::bars::BarRecord;

/// Map the configured codec name onto a parquet compression. Unrecognised
/// names fall back to snappy with a warning.
pub fn compression_from_name(name: &str) -> Compression {
    match name.to_lowercase().as_str() {
        "snappy" => Compression::SNAPPY,
        "zstd" => Compression::ZSTD(ZstdLevel::default()),
        "gzip" => Compression::GZIP(GzipLevel::default()),
        "none" | "uncompressed" => Compression::UNCOMPRESSED,
        other => {
            warn!(codec = %other, "unknown parquet compression; using snappy");
            Compression::SNAPPY
        }
    }
}

/// Bar schema. Price columns are nullable: seconds before the first trade of
/// a range have no price to carry.
pub fn bar_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("symbol", DataType::Utf8, false),
        Field::new(
            "window_start",
            DataType::Timestamp(TimeUnit::Millisecond, Some("UTC".into())),
            false,
        ),
        Field::new("open", DataType::Float64, true),
        Field::new("high", DataType::Float64, true),
        Field::new("low", DataType::Float64, true),
        Field::new("close", DataType::Float64, true),
        Field::new("volume_base", DataType::Float64, false),
        Field::new("volume_quote", DataType::Float64, false),
        Field::new("trade_count", DataType::UInt64, false),
        Field::new("vwap", DataType::Float64, true),
        Field::new("bid", DataType::Float64, true),
        Field::new("ask", DataType::Float64, true),
        Field::new("spread", DataType::Float64, true),
    ]))
}

fn bars_to_batch(rows: &[&BarRecord]) -> Result<RecordBatch> {
    let symbol: ArrayRef = Arc::new(StringArray::from(
        rows.iter().map(|b| b.symbol.as_str()).collect::<Vec<_>>(),
    ));
    let window_start: ArrayRef = Arc::new(
        TimestampMillisecondArray::from(
            rows.iter().map(|b| b.window_start_ms).collect::<Vec<_>>(),
        )
        .with_timezone("UTC"),
    );

    let opt_f64 = |pick: fn(&BarRecord) -> Option<f64>| -> ArrayRef {
        Arc::new(Float64Array::from(
            rows.iter().map(|b| pick(b)).collect::<Vec<_>>(),
        ))
    };

    let volume_base: ArrayRef = Arc::new(Float64Array::from(
        rows.iter().map(|b| b.volume_base).collect::<Vec<_>>(),
    ));
    let volume_quote: ArrayRef = Arc::new(Float64Array::from(
        rows.iter().map(|b| b.volume_quote).collect::<Vec<_>>(),
    ));
    let trade_count: ArrayRef = Arc::new(UInt64Array::from(
        rows.iter().map(|b| b.trade_count).collect::<Vec<_>>(),
    ));

    RecordBatch::try_new(
        bar_schema(),
        vec![
            symbol,
            window_start,
            opt_f64(|b| b.open),
            opt_f64(|b| b.high),
            opt_f64(|b| b.low),
            opt_f64(|b| b.close),
            volume_base,
            volume_quote,
            trade_count,
            opt_f64(|b| b.vwap),
            opt_f64(|b| b.bid),
            opt_f64(|b| b.ask),
            opt_f64(|b| b.spread),
        ],
    )
    .context("failed to assemble bar record batch")
}

/// Fresh, collision-free file name for one write.
pub(crate) fn unique_parquet_name() -> String {
    format!(
        "part-{}-{:08x}.parquet",
        chrono::Utc::now().timestamp_millis(),
        rand::thread_rng().gen::<u32>()
    )
}

/// Write one record batch into `dir` as a new parquet file.
pub(crate) fn write_batch(dir: &Path, batch: &RecordBatch, compression: Compression) -> Result<()> {
    lake::ensure_dir(dir).with_context(|| format!("failed to create {}", dir.display()))?;

    let path = dir.join(unique_parquet_name());
    let file =
        File::create(&path).with_context(|| format!("failed to create {}", path.display()))?;

    let props = WriterProperties::builder()
        .set_compression(compression)
        .build();
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))
        .context("failed to open parquet writer")?;
    writer.write(batch).context("failed to write batch")?;
    writer.close().context("failed to finalise parquet file")?;

    debug!(path = %path.display(), rows = batch.num_rows(), "wrote parquet file");
    Ok(())
}

/// Append `bars` to the partition tree under `root`. Returns rows written.
pub fn write_bars_partitioned(
    root: &Path,
    bars: &[BarRecord],
    compression: Compression,
) -> Result<usize> {
    if bars.is_empty() {
        return Ok(0);
    }

    let mut by_day: BTreeMap<NaiveDate, Vec<&BarRecord>> = BTreeMap::new();
    for bar in bars {
        by_day
            .entry(lake::date_from_ms(bar.window_start_ms))
            .or_default()
            .push(bar);
    }

    let mut written = 0usize;
    for (date, rows) in by_day {
        let dir = lake::partition_dir(root, date);
        let batch = bars_to_batch(&rows)?;
        write_batch(&dir, &batch, compression)?;
        written += rows.len();
    }
    Ok(written)
}

/// Total rows across every parquet file directly inside `dir`, from file
/// footers alone. Missing or empty directories count as zero.
pub fn count_rows_in_partition(dir: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };

    let mut rows = 0u64;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("parquet") {
            continue;
        }
        let Ok(file) = File::open(&path) else { continue };
        match SerializedFileReader::new(file) {
            Ok(reader) => rows += reader.metadata().file_metadata().num_rows().max(0) as u64,
            Err(e) => warn!(path = %path.display(), error = %e, "unreadable parquet footer"),
        }
    }
    rows
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
