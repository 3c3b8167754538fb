//! Bar Store - historical price/volume windows
//!
//! The engine only talks to the [`BarStore`] trait. [`InMemoryBarStore`] is a
//! dense, session-aligned implementation used for tests and small universes,
//! and [`csv_loader`] fills one from long-format CSV files.

pub mod csv_loader;

use crate::error::{PipelineError, Result};
use crate::matrix::{AssetIndex, LabeledMatrix};
use crate::types::{AssetId, Date};
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

pub use csv_loader::CsvBarLoader;

/// Bar frequency served by a bar store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Frequency {
    /// One bar per calendar session
    Daily,
}

/// Standard OHLCV fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BarField {
    Open,
    High,
    Low,
    Close,
    Volume,
}

impl BarField {
    pub fn as_str(&self) -> &'static str {
        match self {
            BarField::Open => "open",
            BarField::High => "high",
            BarField::Low => "low",
            BarField::Close => "close",
            BarField::Volume => "volume",
        }
    }

    /// All available fields
    pub fn all() -> [BarField; 5] {
        [
            BarField::Open,
            BarField::High,
            BarField::Low,
            BarField::Close,
            BarField::Volume,
        ]
    }
}

impl fmt::Display for BarField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BarField {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "open" => Ok(BarField::Open),
            "high" => Ok(BarField::High),
            "low" => Ok(BarField::Low),
            "close" => Ok(BarField::Close),
            "volume" => Ok(BarField::Volume),
            other => Err(PipelineError::InvalidData(format!("Unknown bar field: {}", other))),
        }
    }
}

/// Daily OHLCV bar
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DailyBar {
    pub date: Date,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl DailyBar {
    pub fn new(date: Date, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            date,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// Value of a single field
    pub fn field(&self, field: BarField) -> f64 {
        match field {
            BarField::Open => self.open,
            BarField::High => self.high,
            BarField::Low => self.low,
            BarField::Close => self.close,
            BarField::Volume => self.volume,
        }
    }

    /// Check OHLC relationships
    pub fn is_valid(&self) -> bool {
        self.high >= self.low
            && self.high >= self.open
            && self.high >= self.close
            && self.low <= self.open
            && self.low <= self.close
            && self.volume >= 0.0
    }
}

/// Source of historical bar windows
///
/// Implementations are shared read-only across evaluator threads for the
/// duration of a request.
pub trait BarStore: Send + Sync {
    /// Values of `field` for `bar_count` sessions ending at `end_date`
    /// (inclusive), one row per session, columns in `assets` order.
    ///
    /// Missing values are NaN. Fails with `DataUnavailable` when fewer than
    /// `bar_count` sessions exist up to `end_date`; such failures carry the
    /// number of bars that do exist in `available`.
    ///
    /// A fetch is not interrupted once started. The engine checks the
    /// request's cancellation token before and after every fetch and
    /// discards the window of a cancelled request.
    fn fetch(
        &self,
        assets: &Arc<AssetIndex>,
        field: &str,
        end_date: Date,
        bar_count: usize,
        frequency: Frequency,
    ) -> Result<LabeledMatrix<f64>>;

    /// Earliest session this store can serve
    fn first_session(&self) -> Option<Date>;
}

/// Dense, session-aligned bar store held in memory
#[derive(Debug, Clone, Default)]
pub struct InMemoryBarStore {
    sessions: Vec<Date>,
    /// field -> asset -> values aligned to `sessions`
    fields: HashMap<String, HashMap<AssetId, Vec<f64>>>,
}

impl InMemoryBarStore {
    /// Create a store over the given sessions (sorted and deduplicated)
    pub fn new(mut sessions: Vec<Date>) -> Self {
        sessions.sort();
        sessions.dedup();
        Self {
            sessions,
            fields: HashMap::new(),
        }
    }

    pub fn sessions(&self) -> &[Date] {
        &self.sessions
    }

    /// Insert a full series for one asset and field
    pub fn insert_series(
        &mut self,
        field: impl Into<String>,
        asset: AssetId,
        values: Vec<f64>,
    ) -> Result<()> {
        if values.len() != self.sessions.len() {
            return Err(PipelineError::InvalidData(format!(
                "Series for asset {} has {} values, store has {} sessions",
                asset,
                values.len(),
                self.sessions.len()
            )));
        }
        self.fields
            .entry(field.into())
            .or_insert_with(HashMap::new)
            .insert(asset, values);
        Ok(())
    }

    /// Insert one OHLCV bar for an asset
    pub fn add_bar(&mut self, asset: AssetId, bar: &DailyBar) -> Result<()> {
        if !bar.is_valid() {
            return Err(PipelineError::InvalidData(format!(
                "Invalid bar for asset {} at {}",
                asset, bar.date
            )));
        }
        let row = self.sessions.binary_search(&bar.date).map_err(|_| {
            PipelineError::InvalidData(format!("{} is not a session of this store", bar.date))
        })?;
        let nrows = self.sessions.len();
        for field in BarField::all() {
            let series = self
                .fields
                .entry(field.as_str().to_string())
                .or_insert_with(HashMap::new)
                .entry(asset)
                .or_insert_with(|| vec![f64::NAN; nrows]);
            series[row] = bar.field(field);
        }
        Ok(())
    }

    /// Whether any asset has values for the field
    pub fn has_field(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    /// Assets with data for any field, ascending
    pub fn assets(&self) -> Vec<AssetId> {
        let mut assets: Vec<AssetId> = self
            .fields
            .values()
            .flat_map(|by_asset| by_asset.keys().copied())
            .collect();
        assets.sort_unstable();
        assets.dedup();
        assets
    }
}

impl BarStore for InMemoryBarStore {
    fn fetch(
        &self,
        assets: &Arc<AssetIndex>,
        field: &str,
        end_date: Date,
        bar_count: usize,
        frequency: Frequency,
    ) -> Result<LabeledMatrix<f64>> {
        let unavailable = |reason: String, available: Option<usize>| {
            PipelineError::DataUnavailable {
                field: field.to_string(),
                end_date,
                bar_count,
                available,
                reason,
            }
        };

        let Frequency::Daily = frequency;
        let by_asset = self
            .fields
            .get(field)
            .ok_or_else(|| unavailable("unknown field".to_string(), None))?;
        let end = self
            .sessions
            .binary_search(&end_date)
            .map_err(|_| unavailable("end date is not a session".to_string(), None))?;
        if bar_count > end + 1 {
            return Err(unavailable(
                format!("only {} bars available", end + 1),
                Some(end + 1),
            ));
        }

        let start = end + 1 - bar_count;
        let series: Vec<Option<&Vec<f64>>> =
            assets.assets().iter().map(|a| by_asset.get(a)).collect();

        let mut values = Vec::with_capacity(bar_count * assets.len());
        for row in start..=end {
            values.extend(
                series
                    .iter()
                    .map(|s| s.map_or(f64::NAN, |values| values[row])),
            );
        }

        let dates: Arc<[Date]> = self.sessions[start..=end].iter().copied().collect();
        LabeledMatrix::new(dates, Arc::clone(assets), values)
    }

    fn first_session(&self) -> Option<Date> {
        self.sessions.first().copied()
    }
}
