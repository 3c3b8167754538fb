//! Asset Finder - in-memory asset registry
//!
//! Provides:
//! - SID -> Asset retrieval
//! - Point-in-time symbol lookups
//! - Lifetimes tables for the pipeline engine

use crate::asset::{Asset, AssetType};
use crate::assets::AssetRegistry;
use crate::error::{PipelineError, Result};
use crate::matrix::{AssetIndex, LabeledMatrix};
use crate::types::{AssetId, Date};
use hashbrown::HashMap;
use std::collections::BTreeMap;
use std::sync::Arc;

/// AssetFinder - central asset lookup
#[derive(Debug, Clone, Default)]
pub struct AssetFinder {
    /// Assets by SID, ordered
    assets: BTreeMap<AssetId, Asset>,
    /// Symbol -> SIDs that have carried it, by listing start
    symbol_index: HashMap<String, Vec<AssetId>>,
    /// Sessions the registry can answer for (None = unbounded)
    coverage: Option<(Date, Date)>,
}

impl AssetFinder {
    /// Create a new empty finder
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict the sessions this registry is able to answer for
    pub fn with_coverage(mut self, first: Date, last: Date) -> Self {
        self.coverage = Some((first, last));
        self
    }

    /// Insert an asset; SIDs must be unique
    pub fn insert_asset(&mut self, asset: Asset) -> Result<()> {
        if self.assets.contains_key(&asset.id) {
            return Err(PipelineError::InvalidData(format!(
                "Asset {} already registered",
                asset.id
            )));
        }

        let symbol = asset.symbol.to_uppercase();
        let sid = asset.id;
        self.assets.insert(sid, asset);

        let entries = self.symbol_index.entry(symbol).or_insert_with(Vec::new);
        entries.push(sid);
        let assets = &self.assets;
        entries.sort_by_key(|id| assets.get(id).and_then(|a| a.start_date));
        Ok(())
    }

    /// Insert multiple assets
    pub fn insert_assets(&mut self, assets: impl IntoIterator<Item = Asset>) -> Result<()> {
        for asset in assets {
            self.insert_asset(asset)?;
        }
        Ok(())
    }

    /// Retrieve asset by SID
    pub fn retrieve_asset(&self, sid: AssetId) -> Option<&Asset> {
        self.assets.get(&sid)
    }

    /// Look up a symbol at a point in time (None = latest listing)
    pub fn lookup_symbol(&self, symbol: &str, as_of: Option<Date>) -> Option<&Asset> {
        let entries = self.symbol_index.get(&symbol.to_uppercase())?;
        let mut candidates = entries.iter().filter_map(|sid| self.assets.get(sid));
        match as_of {
            Some(date) => candidates.find(|a| a.is_alive_on(date)),
            None => candidates.last(),
        }
    }

    /// All assets of a given type
    pub fn assets_by_type(&self, asset_type: AssetType) -> Vec<&Asset> {
        self.assets
            .values()
            .filter(|a| a.asset_type == asset_type)
            .collect()
    }

    pub fn asset_count(&self) -> usize {
        self.assets.len()
    }

    fn check_coverage(&self, sessions: &[Date]) -> Result<()> {
        let (Some(first), Some(last)) = (sessions.first(), sessions.last()) else {
            return Ok(());
        };
        if let Some((lo, hi)) = self.coverage {
            if *first < lo || *last > hi {
                return Err(PipelineError::RegistryUnavailable {
                    start: *first,
                    end: *last,
                    reason: format!("registry covers {} to {}", lo, hi),
                });
            }
        }
        Ok(())
    }
}

impl AssetRegistry for AssetFinder {
    fn lifetimes(&self, sessions: &[Date]) -> Result<LabeledMatrix<bool>> {
        self.check_coverage(sessions)?;

        let alive: Vec<&Asset> = self
            .assets
            .values()
            .filter(|a| sessions.iter().any(|d| a.is_alive_on(*d)))
            .collect();
        let index = Arc::new(AssetIndex::sorted(alive.iter().map(|a| a.id).collect()));

        let mut values = Vec::with_capacity(sessions.len() * alive.len());
        for date in sessions {
            values.extend(alive.iter().map(|a| a.is_alive_on(*date)));
        }
        LabeledMatrix::new(sessions.iter().copied().collect(), index, values)
    }
}
