//! # Rusty Pipeline
//!
//! A windowed factor-computation engine in the style of the Zipline
//! Pipeline API.
//!
//! Factors and filters form a DAG of terms. For a session range the engine
//! orders the graph, resolves which assets existed on each session, evaluates
//! every term once over trailing windows of bar data, and returns one row per
//! `(date, asset)` that is alive and passes the screen.
//!
//! ## Example
//!
//! ```rust,no_run
//! use rusty_pipeline::prelude::*;
//! use std::sync::Arc;
//!
//! # fn main() -> rusty_pipeline::error::Result<()> {
//! let store = CsvBarLoader::new().load_path(std::path::Path::new("bars.csv"))?;
//! let mut finder = AssetFinder::new();
//! for sid in store.assets() {
//!     finder.insert_asset(Asset::equity(sid, format!("SID{}", sid), "NYSE"))?;
//! }
//! let calendar = SessionCalendar::new(store.sessions().to_vec());
//!
//! let mean_close = Factor::from(SimpleMovingAverage::new(BarField::Close, 15));
//! let mut pipeline = Pipeline::new();
//! pipeline.add(&mean_close, "mean_close_15")?;
//! pipeline.add(mean_close.gt(100.0), "price_gt_100")?;
//! pipeline.set_screen(Factor::from(AverageDollarVolume::new(60)).top(10));
//!
//! let engine = PipelineEngine::new(Arc::new(calendar), Arc::new(store), Arc::new(finder));
//! let start = chrono::NaiveDate::from_ymd_opt(2020, 6, 1).unwrap();
//! let end = chrono::NaiveDate::from_ymd_opt(2020, 6, 30).unwrap();
//! let table = engine.run_pipeline(&pipeline, start, end)?;
//! table.to_csv(std::io::stdout())?;
//! # Ok(())
//! # }
//! ```

pub mod asset;
pub mod assets;
pub mod calendar;
pub mod config;
pub mod data;
pub mod error;
pub mod matrix;
pub mod pipeline;
pub mod types;

pub mod prelude {
    //! Commonly used types and traits
    pub use crate::asset::{Asset, AssetType};
    pub use crate::assets::{AssetFinder, AssetRegistry};
    pub use crate::calendar::{SessionCalendar, TradingCalendar, WeekdayCalendar};
    pub use crate::config::EngineConfig;
    pub use crate::data::{BarField, BarStore, CsvBarLoader, DailyBar, Frequency, InMemoryBarStore};
    pub use crate::error::{PipelineError, Result};
    pub use crate::matrix::{AssetIndex, LabeledMatrix};
    pub use crate::pipeline::{
        AllPresent, AnnualizedVolatility, AverageDollarVolume, CancellationToken,
        ExponentialWeightedMovingAverage, Factor, Filter, Input, Latest, Pipeline,
        PipelineEngine, ResultTable, Returns, SimpleMovingAverage, StaticAssets, Term, TermRef,
    };
    pub use crate::types::*;
}
