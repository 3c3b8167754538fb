//! Asset registry and lifetimes

pub mod asset_finder;

use crate::error::Result;
use crate::matrix::LabeledMatrix;
use crate::types::Date;

pub use asset_finder::AssetFinder;

/// Source of asset existence metadata
///
/// Shared read-only across evaluator threads for the duration of a request.
pub trait AssetRegistry: Send + Sync {
    /// Boolean `(session, asset)` table, true iff the asset was known and
    /// tradable on that session.
    ///
    /// Columns are every asset alive on at least one of `sessions`, ideally
    /// in ascending id order; the engine reorders any other order. Fails
    /// with `RegistryUnavailable` when the registry cannot answer for part
    /// of the range.
    fn lifetimes(&self, sessions: &[Date]) -> Result<LabeledMatrix<bool>>;
}
