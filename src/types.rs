//! Core types and constants

use chrono::NaiveDate;

/// Session label used throughout the engine (one trading day)
pub type Date = NaiveDate;

/// Symbol identifier for assets
pub type Symbol = String;

/// Unique identifier for assets
pub type AssetId = u64;

/// Unique identifier for a term in the computational graph
pub type TermId = u64;

/// Unique identifier for one execution request
pub type RequestId = uuid::Uuid;

/// Trading sessions per year, used to annualize daily statistics
pub const SESSIONS_PER_YEAR: f64 = 252.0;
