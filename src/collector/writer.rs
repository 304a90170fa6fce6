// =============================================================================
// Rotating Raw Writer -- per-symbol append-only JSONL journal
// =============================================================================
//
// One writer per (exchange, symbol). Each event becomes one JSON line in the
// current part file. Rotation happens at the next multiple of the configured
// interval past the file's open time; the first write of a new UTC day
// resets the part counter to the next unused index found on disk. Lines are
// flushed through to the OS per write, so a crash loses at most the line in
// flight.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::lake;
use crate::types::CanonicalEvent;

pub struct RotatingRawWriter {
    symbol_root: PathBuf,
    symbol: String,
    interval_sec: i64,
    current_date: String,
    part_index: u32,
    next_rotation_epoch: i64,
    file: Option<BufWriter<File>>,
}

impl RotatingRawWriter {
    pub fn new(base: &Path, exchange: &str, symbol: &str, interval_sec: i64) -> Self {
        Self {
            symbol_root: lake::raw_exchange_dir(base, exchange).join(lake::symbol_component(symbol)),
            symbol: symbol.to_string(),
            interval_sec,
            current_date: String::new(),
            part_index: 0,
            next_rotation_epoch: 0,
            file: None,
        }
    }

    /// Append one event as a JSON line, opening or rotating first as needed.
    ///
    /// I/O failures drop the event and leave the writer ready to retry on the
    /// next call; the live stream never stalls on one symbol's disk fault.
    pub fn write(&mut self, event: &CanonicalEvent, now_ms: i64) {
        let line = match serde_json::to_string(event) {
            Ok(l) => l,
            Err(e) => {
                warn!(symbol = %self.symbol, error = %e, "failed to serialise event; dropping");
                return;
            }
        };

        if let Err(e) = self.write_line(&line, now_ms) {
            warn!(symbol = %self.symbol, error = %e, "raw write failed; dropping event");
        }
    }

    fn write_line(&mut self, line: &str, now_ms: i64) -> Result<()> {
        let now_sec = now_ms.div_euclid(1000);
        self.rotate_if_needed(now_sec)?;

        let file = self
            .file
            .as_mut()
            .context("raw file not open after rotation")?;
        writeln!(file, "{line}").context("append failed")?;
        // Write-through to the OS buffer so a flushed line survives a crash.
        file.flush().context("flush failed")?;
        Ok(())
    }

    /// Flush and close the current part file. Idempotent.
    pub fn close(&mut self) {
        if let Some(mut file) = self.file.take() {
            if let Err(e) = file.flush() {
                warn!(symbol = %self.symbol, error = %e, "flush on close failed");
            }
            debug!(symbol = %self.symbol, "raw writer closed");
        }
    }

    fn rotate_if_needed(&mut self, now_sec: i64) -> Result<()> {
        if self.file.is_none() {
            return self.open_new_file(now_sec);
        }
        if now_sec >= self.next_rotation_epoch {
            self.part_index += 1;
            return self.open_new_file(now_sec);
        }
        Ok(())
    }

    fn open_new_file(&mut self, now_sec: i64) -> Result<()> {
        let date_str = lake::day_str_from_ms(now_sec * 1000);
        if date_str != self.current_date {
            // Day rollover: rediscover the part counter for the new day.
            self.current_date = date_str;
            self.part_index = 0;
        }

        let day_dir = self.symbol_root.join(&self.current_date);
        lake::ensure_dir(&day_dir)
            .with_context(|| format!("failed to create {}", day_dir.display()))?;

        if self.part_index == 0 {
            self.part_index = next_part_index(&day_dir);
        }

        let path = day_dir.join(format!("part_{:03}.jsonl", self.part_index));

        // Close the previous part before opening the next.
        self.close();

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        self.file = Some(BufWriter::new(file));

        self.next_rotation_epoch = lake::next_rotation_boundary(now_sec, self.interval_sec);
        info!(
            symbol = %self.symbol,
            path = %path.display(),
            next_rotation_epoch = self.next_rotation_epoch,
            "opened raw part file"
        );
        Ok(())
    }
}

impl Drop for RotatingRawWriter {
    fn drop(&mut self) {
        self.close();
    }
}

/// Next unused part number in `day_dir`: one past the highest existing
/// `part_NNN.jsonl`, or 1 for a fresh day.
fn next_part_index(day_dir: &Path) -> u32 {
    let Ok(entries) = std::fs::read_dir(day_dir) else {
        return 1;
    };

    let mut max_part = 0u32;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(stem) = name.strip_suffix(".jsonl") else {
            continue;
        };
        if let Some(idx) = stem.strip_prefix("part_") {
            if let Ok(idx) = idx.parse::<u32>() {
                max_part = max_part.max(idx);
            }
        }
    }
    max_part + 1
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
