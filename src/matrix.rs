//! Dense `Date x AssetId` matrices
//!
//! Values live in one contiguous row-major buffer (one row per session, one
//! column per asset). Labels are resolved through a shared [`AssetIndex`] and
//! a sorted date vector, so per-cell access never hashes.

use crate::error::{PipelineError, Result};
use crate::types::{AssetId, Date};
use hashbrown::HashMap;
use std::ops::Range;
use std::sync::Arc;

/// Ordered asset universe with O(1) id -> column lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetIndex {
    assets: Vec<AssetId>,
    positions: HashMap<AssetId, usize>,
}

impl AssetIndex {
    /// Build an index over the given assets, in the given order
    pub fn new(assets: Vec<AssetId>) -> Result<Self> {
        let mut positions = HashMap::with_capacity(assets.len());
        for (col, asset) in assets.iter().enumerate() {
            if positions.insert(*asset, col).is_some() {
                return Err(PipelineError::InvalidData(format!(
                    "Asset {} appears twice in universe",
                    asset
                )));
            }
        }
        Ok(Self { assets, positions })
    }

    /// Build an index over the given assets in ascending id order
    pub fn sorted(mut assets: Vec<AssetId>) -> Self {
        assets.sort_unstable();
        assets.dedup();
        let positions = assets.iter().enumerate().map(|(i, a)| (*a, i)).collect();
        Self { assets, positions }
    }

    /// Column position of an asset
    pub fn position(&self, asset: AssetId) -> Option<usize> {
        self.positions.get(&asset).copied()
    }

    /// Assets in column order
    pub fn assets(&self) -> &[AssetId] {
        &self.assets
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }
}

/// Row-major matrix labelled by session dates and assets
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledMatrix<T> {
    dates: Arc<[Date]>,
    assets: Arc<AssetIndex>,
    values: Vec<T>,
}

impl<T> LabeledMatrix<T> {
    /// Create a matrix from row-major values
    pub fn new(dates: Arc<[Date]>, assets: Arc<AssetIndex>, values: Vec<T>) -> Result<Self> {
        let expected = dates.len() * assets.len();
        if values.len() != expected {
            return Err(PipelineError::InvalidData(format!(
                "Matrix shape mismatch: {} dates x {} assets needs {} values, got {}",
                dates.len(),
                assets.len(),
                expected,
                values.len()
            )));
        }
        Ok(Self {
            dates,
            assets,
            values,
        })
    }

    /// Number of rows (sessions)
    pub fn nrows(&self) -> usize {
        self.dates.len()
    }

    /// Number of columns (assets)
    pub fn ncols(&self) -> usize {
        self.assets.len()
    }

    pub fn dates(&self) -> &[Date] {
        &self.dates
    }

    /// Shared handle on the row labels
    pub fn shared_dates(&self) -> Arc<[Date]> {
        Arc::clone(&self.dates)
    }

    pub fn asset_index(&self) -> &Arc<AssetIndex> {
        &self.assets
    }

    pub fn assets(&self) -> &[AssetId] {
        self.assets.assets()
    }

    /// Raw row-major values
    pub fn values(&self) -> &[T] {
        &self.values
    }

    /// Row position of a session
    pub fn date_position(&self, date: Date) -> Option<usize> {
        self.dates.binary_search(&date).ok()
    }

    /// One row as a slice
    pub fn row(&self, row: usize) -> &[T] {
        let ncols = self.ncols();
        &self.values[row * ncols..(row + 1) * ncols]
    }

    /// Cell by position
    pub fn get(&self, row: usize, col: usize) -> Option<&T> {
        if row < self.nrows() && col < self.ncols() {
            self.values.get(row * self.ncols() + col)
        } else {
            None
        }
    }

    /// Cell by label
    pub fn get_by_label(&self, date: Date, asset: AssetId) -> Option<&T> {
        let row = self.date_position(date)?;
        let col = self.assets.position(asset)?;
        self.get(row, col)
    }

    /// Borrow a contiguous block of rows
    pub fn view(&self, rows: Range<usize>) -> MatrixView<'_, T> {
        let ncols = self.ncols();
        MatrixView {
            dates: &self.dates[rows.clone()],
            ncols,
            values: &self.values[rows.start * ncols..rows.end * ncols],
        }
    }

    /// Borrow the last `count` rows
    pub fn tail(&self, count: usize) -> MatrixView<'_, T> {
        let nrows = self.nrows();
        self.view(nrows - count.min(nrows)..nrows)
    }
}

impl<T: Clone> LabeledMatrix<T> {
    /// Whether columns run in strictly ascending asset id order
    pub fn is_asset_sorted(&self) -> bool {
        self.assets().windows(2).all(|pair| pair[0] < pair[1])
    }

    /// Copy of this matrix with columns reordered by ascending asset id
    pub fn sorted_by_asset(&self) -> Result<Self> {
        let mut order: Vec<usize> = (0..self.ncols()).collect();
        order.sort_by_key(|col| self.assets()[*col]);

        let index = AssetIndex::new(order.iter().map(|col| self.assets()[*col]).collect())?;
        let mut values = Vec::with_capacity(self.values.len());
        for row in 0..self.nrows() {
            let cells = self.row(row);
            values.extend(order.iter().map(|col| cells[*col].clone()));
        }
        Self::new(self.shared_dates(), Arc::new(index), values)
    }
}

/// Borrowed block of consecutive rows of a [`LabeledMatrix`]
#[derive(Debug, Clone, Copy)]
pub struct MatrixView<'a, T> {
    dates: &'a [Date],
    ncols: usize,
    values: &'a [T],
}

impl<'a, T> MatrixView<'a, T> {
    pub fn nrows(&self) -> usize {
        self.dates.len()
    }

    pub fn ncols(&self) -> usize {
        self.ncols
    }

    pub fn dates(&self) -> &'a [Date] {
        self.dates
    }

    pub fn row(&self, row: usize) -> &'a [T] {
        &self.values[row * self.ncols..(row + 1) * self.ncols]
    }

    /// Most recent row of the view
    pub fn last_row(&self) -> &'a [T] {
        self.row(self.nrows() - 1)
    }

    pub fn get(&self, row: usize, col: usize) -> &'a T {
        &self.values[row * self.ncols + col]
    }

    /// One asset's values, oldest first
    pub fn column(&self, col: usize) -> impl Iterator<Item = &'a T> + 'a {
        let values = self.values;
        values.iter().skip(col).step_by(self.ncols.max(1))
    }
}
