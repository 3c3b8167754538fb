//! Lifetimes resolution
//!
//! Asks the asset registry once per request which assets existed on each
//! session of the extended date range. The resulting table fixes the
//! working universe (its columns) and masks every term's output.

use crate::assets::AssetRegistry;
use crate::error::{PipelineError, Result};
use crate::matrix::{AssetIndex, LabeledMatrix};
use crate::types::{AssetId, Date};
use std::sync::Arc;

/// Read-only `(session, asset)` existence table for one request
#[derive(Debug, Clone)]
pub struct LifetimesTable {
    matrix: LabeledMatrix<bool>,
}

impl LifetimesTable {
    /// Resolve lifetimes for `sessions` (oldest first, non-empty)
    pub fn resolve(registry: &dyn AssetRegistry, sessions: &[Date]) -> Result<Self> {
        let (Some(first), Some(last)) = (sessions.first(), sessions.last()) else {
            return Err(PipelineError::InvalidData(
                "cannot resolve lifetimes for an empty session range".to_string(),
            ));
        };

        let mut matrix = registry.lifetimes(sessions)?;
        if matrix.dates() != sessions {
            return Err(PipelineError::RegistryUnavailable {
                start: *first,
                end: *last,
                reason: format!(
                    "registry answered for {} sessions, {} requested",
                    matrix.nrows(),
                    sessions.len()
                ),
            });
        }
        // Result rows are keyed (date, asset) and searched in that order
        if !matrix.is_asset_sorted() {
            log::debug!("Registry universe is not in asset order, reordering columns");
            matrix = matrix.sorted_by_asset()?;
        }

        log::debug!(
            "Resolved lifetimes for {} assets over {} sessions ({} to {})",
            matrix.ncols(),
            matrix.nrows(),
            first,
            last
        );
        Ok(Self { matrix })
    }

    /// Working universe, ascending asset id
    pub fn universe(&self) -> &Arc<AssetIndex> {
        self.matrix.asset_index()
    }

    pub fn assets(&self) -> &[AssetId] {
        self.matrix.assets()
    }

    pub fn sessions(&self) -> &[Date] {
        self.matrix.dates()
    }

    /// Mask row for the session at `row`
    pub fn row(&self, row: usize) -> &[bool] {
        self.matrix.row(row)
    }

    pub fn is_alive(&self, date: Date, asset: AssetId) -> bool {
        self.matrix
            .get_by_label(date, asset)
            .copied()
            .unwrap_or(false)
    }

    /// Assets alive on the session at `row`
    pub fn alive_count(&self, row: usize) -> usize {
        self.row(row).iter().filter(|alive| **alive).count()
    }

    pub fn matrix(&self) -> &LabeledMatrix<bool> {
        &self.matrix
    }
}
