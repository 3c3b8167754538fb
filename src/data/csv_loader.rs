//! CSV ingestion into an [`InMemoryBarStore`]
//!
//! Reads long-format daily files with one bar per line:
//! `date,sid,open,high,low,close,volume`.

use crate::data::{DailyBar, InMemoryBarStore};
use crate::error::{PipelineError, Result};
use crate::types::{AssetId, Date};
use csv::ReaderBuilder;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::io::Read;
use std::path::Path;

#[derive(Debug, Deserialize)]
struct CsvBarRow {
    date: Date,
    sid: AssetId,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

/// Loader for long-format daily bar files
#[derive(Debug, Clone)]
pub struct CsvBarLoader {
    delimiter: u8,
    /// Skip rows failing OHLC validation instead of erroring
    skip_invalid: bool,
}

impl CsvBarLoader {
    pub fn new() -> Self {
        Self {
            delimiter: b',',
            skip_invalid: false,
        }
    }

    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    pub fn skip_invalid(mut self, skip: bool) -> Self {
        self.skip_invalid = skip;
        self
    }

    /// Load a CSV file from disk
    pub fn load_path(&self, path: &Path) -> Result<InMemoryBarStore> {
        let file = std::fs::File::open(path)?;
        self.load_reader(file)
    }

    /// Load CSV content from any reader
    pub fn load_reader<R: Read>(&self, reader: R) -> Result<InMemoryBarStore> {
        let mut csv_reader = ReaderBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let mut bars: Vec<(AssetId, DailyBar)> = Vec::new();
        for record in csv_reader.deserialize() {
            let row: CsvBarRow = record?;
            let bar = DailyBar::new(row.date, row.open, row.high, row.low, row.close, row.volume);
            if !bar.is_valid() {
                if self.skip_invalid {
                    log::warn!("Skipping invalid bar for asset {} at {}", row.sid, row.date);
                    continue;
                }
                return Err(PipelineError::InvalidData(format!(
                    "Invalid bar for asset {} at {}",
                    row.sid, row.date
                )));
            }
            bars.push((row.sid, bar));
        }

        let sessions: BTreeSet<Date> = bars.iter().map(|(_, bar)| bar.date).collect();
        let mut store = InMemoryBarStore::new(sessions.into_iter().collect());
        for (sid, bar) in &bars {
            store.add_bar(*sid, bar)?;
        }

        log::info!(
            "Loaded {} bars for {} assets over {} sessions",
            bars.len(),
            store.assets().len(),
            store.sessions().len()
        );
        Ok(store)
    }
}

impl Default for CsvBarLoader {
    fn default() -> Self {
        Self::new()
    }
}
