//! Pipeline system: term graphs evaluated over an asset universe and a
//! session range
//!
//! - [`term`]: the `Term` trait, inputs/windows and operator terms
//! - [`factors`] / [`filters`]: typed handles and built-in terms
//! - [`graph`]: dependency ordering and look-back computation
//! - [`lifetimes`]: asset existence mask
//! - [`cache`]: per-request, write-once term outputs
//! - [`engine`]: request execution
//! - [`output`]: screening and result materialization

pub mod cache;
pub mod cancel;
pub mod definition;
pub mod engine;
pub mod factors;
pub mod filters;
pub mod graph;
pub mod lifetimes;
pub mod output;
pub mod term;

pub use cancel::CancellationToken;
pub use definition::Pipeline;
pub use engine::{PipelineEngine, RequestState, RunReport};
pub use factors::{
    AnnualizedVolatility, AverageDollarVolume, CrossSectional, CrossSectionalOp,
    ExponentialWeightedMovingAverage, Factor, FactorOperand, Latest, Returns,
    SimpleMovingAverage,
};
pub use filters::{AllPresent, Filter, PercentileBetween, StaticAssets, TopN};
pub use graph::{GraphDump, GraphEdge, GraphNode, TermGraph};
pub use lifetimes::LifetimesTable;
pub use output::{Cell, ColumnData, ResultColumn, ResultRow, ResultTable, RowKey};
pub use term::{
    BinOp, BinaryOpTerm, ComputeContext, DType, Input, KernelTerm, Operand, OutputRow, Term,
    TermRef, UnaryOp, UnaryOpTerm, Window,
};
