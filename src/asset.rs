//! Asset representations

use crate::types::{AssetId, Date, Symbol};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Type of asset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssetType {
    /// Common stock
    Equity,
    /// Exchange traded fund
    Etf,
    /// Futures contract
    Future,
}

/// Asset representation with its listing lifetime
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Asset {
    /// Unique asset identifier
    pub id: AssetId,
    /// Trading symbol
    pub symbol: Symbol,
    /// Exchange where asset is traded
    pub exchange: String,
    /// Type of asset
    pub asset_type: AssetType,
    /// First session the asset traded (None = always known)
    pub start_date: Option<Date>,
    /// Last session the asset traded (None = still listed)
    pub end_date: Option<Date>,
}

impl Asset {
    /// Create a new asset
    pub fn new(id: AssetId, symbol: Symbol, exchange: String, asset_type: AssetType) -> Self {
        Self {
            id,
            symbol,
            exchange,
            asset_type,
            start_date: None,
            end_date: None,
        }
    }

    /// Create an equity asset
    pub fn equity(id: AssetId, symbol: impl Into<Symbol>, exchange: impl Into<String>) -> Self {
        Self::new(id, symbol.into(), exchange.into(), AssetType::Equity)
    }

    /// Restrict the asset to a listing window
    pub fn with_lifetime(mut self, start: Option<Date>, end: Option<Date>) -> Self {
        self.start_date = start;
        self.end_date = end;
        self
    }

    /// Whether the asset existed on the given session
    pub fn is_alive_on(&self, date: Date) -> bool {
        self.start_date.map_or(true, |start| start <= date)
            && self.end_date.map_or(true, |end| date <= end)
    }

    /// Get the full identifier (symbol@exchange)
    pub fn full_id(&self) -> String {
        format!("{}@{}", self.symbol, self.exchange)
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Asset({}, {}, {:?})", self.symbol, self.exchange, self.asset_type)
    }
}
