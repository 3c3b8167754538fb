//! Pipeline execution engine
//!
//! Runs one execution request through
//! `BUILD_GRAPH -> RESOLVE_LIFETIMES -> EVALUATE_TERMS -> MATERIALIZE_OUTPUT`.
//! Any failure aborts the whole request; no partial result is returned and
//! nothing is retried.

use crate::assets::AssetRegistry;
use crate::calendar::TradingCalendar;
use crate::config::EngineConfig;
use crate::data::{BarStore, Frequency};
use crate::error::{PipelineError, Result};
use crate::matrix::LabeledMatrix;
use crate::pipeline::cache::{TermCache, TermOutput};
use crate::pipeline::cancel::CancellationToken;
use crate::pipeline::definition::Pipeline;
use crate::pipeline::graph::TermGraph;
use crate::pipeline::lifetimes::LifetimesTable;
use crate::pipeline::output::{materialize, MaterializeInput, ResultTable};
use crate::pipeline::term::{ComputeContext, DType, Input, OutputRow, TermRef, Window};
use crate::types::{Date, RequestId, TermId};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Stage of an execution request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RequestState {
    Pending,
    BuildGraph,
    ResolveLifetimes,
    EvaluateTerms,
    MaterializeOutput,
    Done,
    Failed,
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestState::Done | RequestState::Failed)
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestState::Pending => "PENDING",
            RequestState::BuildGraph => "BUILD_GRAPH",
            RequestState::ResolveLifetimes => "RESOLVE_LIFETIMES",
            RequestState::EvaluateTerms => "EVALUATE_TERMS",
            RequestState::MaterializeOutput => "MATERIALIZE_OUTPUT",
            RequestState::Done => "DONE",
            RequestState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Summary of a completed execution request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub request_id: RequestId,
    pub state: RequestState,
    pub start_date: Date,
    pub end_date: Date,
    /// Requested sessions
    pub sessions: usize,
    /// Sessions the range was extended backward by
    pub lookback: usize,
    pub universe_size: usize,
    pub terms_evaluated: usize,
    pub bar_fetches: usize,
    pub rows: usize,
}

struct RequestTracker {
    report: RunReport,
}

impl RequestTracker {
    fn new(start_date: Date, end_date: Date) -> Self {
        Self {
            report: RunReport {
                request_id: Uuid::new_v4(),
                state: RequestState::Pending,
                start_date,
                end_date,
                sessions: 0,
                lookback: 0,
                universe_size: 0,
                terms_evaluated: 0,
                bar_fetches: 0,
                rows: 0,
            },
        }
    }

    fn id(&self) -> RequestId {
        self.report.request_id
    }

    fn advance(&mut self, next: RequestState) {
        log::debug!("[{}] {} -> {}", self.id(), self.report.state, next);
        self.report.state = next;
    }

    fn fail(&mut self, err: &PipelineError) {
        match err {
            PipelineError::Cancelled => {
                log::info!("[{}] Cancelled during {}", self.id(), self.report.state)
            }
            _ => log::warn!(
                "[{}] Failed during {}: {}",
                self.id(),
                self.report.state,
                err
            ),
        }
        self.report.state = RequestState::Failed;
    }
}

/// Everything a term evaluation reads, fixed for the whole request
struct EvalContext<'a> {
    request_id: RequestId,
    /// Look-back sessions followed by the requested sessions
    sessions: &'a [Date],
    lookback: usize,
    requested: usize,
    end_date: Date,
    lifetimes: &'a LifetimesTable,
    fetches: &'a AtomicUsize,
    cancel: &'a CancellationToken,
}

/// Input of one term evaluation
enum Source<'c> {
    Fetched(LabeledMatrix<f64>),
    Cached { output: &'c TermOutput, offset: usize },
}

impl Source<'_> {
    fn window(&self, rows: std::ops::Range<usize>) -> Window<'_> {
        match self {
            Source::Fetched(matrix) => Window::Float(matrix.view(rows)),
            Source::Cached { output, offset } => {
                output.window(offset + rows.start..offset + rows.end)
            }
        }
    }
}

/// Evaluates pipelines against a calendar, a bar store and an asset registry
pub struct PipelineEngine {
    calendar: Arc<dyn TradingCalendar>,
    bar_store: Arc<dyn BarStore>,
    registry: Arc<dyn AssetRegistry>,
    config: EngineConfig,
    pool: Option<ThreadPool>,
}

impl fmt::Debug for PipelineEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineEngine")
            .field("config", &self.config)
            .field("dedicated_pool", &self.pool.is_some())
            .finish()
    }
}

impl PipelineEngine {
    /// Sequential engine with the default configuration
    pub fn new(
        calendar: Arc<dyn TradingCalendar>,
        bar_store: Arc<dyn BarStore>,
        registry: Arc<dyn AssetRegistry>,
    ) -> Self {
        Self {
            calendar,
            bar_store,
            registry,
            config: EngineConfig::default(),
            pool: None,
        }
    }

    /// Apply a configuration, building a dedicated thread pool when
    /// `max_threads` is set for parallel evaluation
    pub fn with_config(mut self, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        self.pool = match (config.parallel, config.max_threads) {
            (true, Some(threads)) => Some(
                ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .thread_name(|i| format!("pipeline-eval-{}", i))
                    .build()
                    .map_err(|e| PipelineError::ConfigError(e.to_string()))?,
            ),
            _ => None,
        };
        self.config = config;
        Ok(self)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Compute `pipeline` for every session in `[start_date, end_date]`
    pub fn run_pipeline(
        &self,
        pipeline: &Pipeline,
        start_date: Date,
        end_date: Date,
    ) -> Result<ResultTable> {
        let cancel = CancellationToken::new();
        self.execute(pipeline, start_date, end_date, &cancel)
            .map(|(table, _)| table)
    }

    /// As [`run_pipeline`](Self::run_pipeline), aborting with `Cancelled`
    /// once `cancel` fires
    pub fn run_pipeline_with_cancel(
        &self,
        pipeline: &Pipeline,
        start_date: Date,
        end_date: Date,
        cancel: &CancellationToken,
    ) -> Result<ResultTable> {
        self.execute(pipeline, start_date, end_date, cancel)
            .map(|(table, _)| table)
    }

    /// As [`run_pipeline`](Self::run_pipeline), also returning a summary
    pub fn run_pipeline_with_report(
        &self,
        pipeline: &Pipeline,
        start_date: Date,
        end_date: Date,
    ) -> Result<(ResultTable, RunReport)> {
        let cancel = CancellationToken::new();
        self.execute(pipeline, start_date, end_date, &cancel)
    }

    fn execute(
        &self,
        pipeline: &Pipeline,
        start_date: Date,
        end_date: Date,
        cancel: &CancellationToken,
    ) -> Result<(ResultTable, RunReport)> {
        let mut tracker = RequestTracker::new(start_date, end_date);
        log::info!(
            "[{}] Running pipeline ({} columns, screen: {}) from {} to {}",
            tracker.id(),
            pipeline.len(),
            pipeline.screen().is_some(),
            start_date,
            end_date
        );

        match self.execute_stages(pipeline, start_date, end_date, cancel, &mut tracker) {
            Ok(table) => {
                tracker.report.rows = table.len();
                tracker.advance(RequestState::Done);
                log::info!(
                    "[{}] Pipeline complete: {} rows, {} terms, {} bar fetches",
                    tracker.id(),
                    table.len(),
                    tracker.report.terms_evaluated,
                    tracker.report.bar_fetches
                );
                Ok((table, tracker.report))
            }
            Err(err) => {
                tracker.fail(&err);
                Err(err)
            }
        }
    }

    fn execute_stages(
        &self,
        pipeline: &Pipeline,
        start_date: Date,
        end_date: Date,
        cancel: &CancellationToken,
        tracker: &mut RequestTracker,
    ) -> Result<ResultTable> {
        self.validate_range(start_date, end_date)?;
        let requested = self.calendar.sessions(start_date, end_date)?;
        tracker.report.sessions = requested.len();

        tracker.advance(RequestState::BuildGraph);
        let graph = pipeline.graph()?;
        let lookback = graph.max_lookback();
        let history = self.history_sessions(&graph, start_date, lookback)?;
        tracker.report.lookback = lookback;
        cancel.check()?;

        tracker.advance(RequestState::ResolveLifetimes);
        let sessions: Vec<Date> = history.into_iter().chain(requested.iter().copied()).collect();
        let lifetimes = LifetimesTable::resolve(self.registry.as_ref(), &sessions)?;
        tracker.report.universe_size = lifetimes.assets().len();
        cancel.check()?;

        tracker.advance(RequestState::EvaluateTerms);
        let fetches = AtomicUsize::new(0);
        let ctx = EvalContext {
            request_id: tracker.id(),
            sessions: &sessions,
            lookback,
            requested: requested.len(),
            end_date,
            lifetimes: &lifetimes,
            fetches: &fetches,
            cancel,
        };
        let cache = self.evaluate(&graph, &ctx)?;
        tracker.report.terms_evaluated = cache.len();
        tracker.report.bar_fetches = fetches.load(Ordering::SeqCst);
        cancel.check()?;

        tracker.advance(RequestState::MaterializeOutput);
        let screen = match pipeline.screen() {
            Some(filter) => Some(cache.require(filter.id())?.as_bool().ok_or_else(|| {
                PipelineError::InvalidTerm(format!("screen {} is not boolean", filter.name()))
            })?),
            None => None,
        };
        let outputs = pipeline
            .columns()
            .map(|(name, term)| cache.require(term.id()).map(|output| (name, output)))
            .collect::<Result<Vec<_>>>()?;

        materialize(MaterializeInput {
            sessions: &requested,
            assets: lifetimes.assets(),
            lifetimes: (lookback..sessions.len()).map(|r| lifetimes.row(r)).collect(),
            screen,
            outputs,
        })
    }

    fn validate_range(&self, start_date: Date, end_date: Date) -> Result<()> {
        let invalid = start_date > end_date
            || !self.calendar.is_session(start_date)
            || !self.calendar.is_session(end_date);
        if invalid {
            return Err(PipelineError::InvalidDateRange {
                start: start_date,
                end: end_date,
            });
        }
        Ok(())
    }

    /// The `lookback` sessions before `start_date`, checked against the
    /// bar store's history
    fn history_sessions(
        &self,
        graph: &TermGraph,
        start_date: Date,
        lookback: usize,
    ) -> Result<Vec<Date>> {
        let term_name = || {
            graph
                .deepest_lookback_term()
                .map(|t| t.name())
                .unwrap_or_default()
        };

        let history = if lookback == 0 {
            Vec::new()
        } else {
            self.calendar
                .sessions_before(start_date, lookback)
                .map_err(|e| PipelineError::InsufficientHistory {
                    term: term_name(),
                    required_start: format!("{} sessions before {}", lookback, start_date),
                    earliest: e.to_string(),
                })?
        };

        if self.config.check_history {
            let required = history.first().copied().unwrap_or(start_date);
            if let Some(earliest) = self.bar_store.first_session() {
                if required < earliest {
                    return Err(PipelineError::InsufficientHistory {
                        term: term_name(),
                        required_start: required.to_string(),
                        earliest: earliest.to_string(),
                    });
                }
            }
        }
        Ok(history)
    }

    fn evaluate(&self, graph: &TermGraph, ctx: &EvalContext<'_>) -> Result<TermCache> {
        let mut cache = TermCache::new();

        if self.config.parallel {
            // Ranks only depend on earlier ranks, so each one can fan out
            // once the previous rank's outputs are cached.
            for rank in graph.ranks() {
                for (id, output) in self.evaluate_rank(graph, &rank, ctx, &cache)? {
                    cache.insert(id, output)?;
                }
            }
        } else {
            for term in graph.ordered_terms() {
                let output = self.evaluate_term(term, graph, ctx, &cache)?;
                cache.insert(term.id(), output)?;
            }
        }
        Ok(cache)
    }

    fn evaluate_rank(
        &self,
        graph: &TermGraph,
        rank: &[TermId],
        ctx: &EvalContext<'_>,
        cache: &TermCache,
    ) -> Result<Vec<(TermId, TermOutput)>> {
        let run = || {
            rank.par_iter()
                .map(|id| {
                    graph
                        .get_term(*id)
                        .ok_or_else(|| {
                            PipelineError::InvalidTerm(format!("term {} missing from graph", id))
                        })
                        .and_then(|term| self.evaluate_term(term, graph, ctx, cache))
                        .map(|output| (*id, output))
                })
                .collect::<Result<Vec<_>>>()
        };
        match &self.pool {
            Some(pool) => pool.install(run),
            None => run(),
        }
    }

    fn evaluate_term(
        &self,
        term: &TermRef,
        graph: &TermGraph,
        ctx: &EvalContext<'_>,
        cache: &TermCache,
    ) -> Result<TermOutput> {
        ctx.cancel.check()?;

        let id = term.id();
        let window_length = term.window_length();
        let extra = graph.extra_rows(id);
        let rows = ctx.requested + extra;
        let span = rows + window_length - 1;
        // Row of `sessions` holding this term's first output / first input
        let first_row = ctx.lookback - extra;
        let fetch_start = ctx.lookback - graph.lookback(id);
        let universe = ctx.lifetimes.universe();

        let mut sources = Vec::new();
        for input in term.inputs() {
            ctx.cancel.check()?;
            let source = match input {
                Input::Column(field) => {
                    let fetched = self.bar_store.fetch(
                        universe,
                        &field,
                        ctx.end_date,
                        span,
                        Frequency::Daily,
                    );
                    ctx.fetches.fetch_add(1, Ordering::SeqCst);
                    ctx.cancel.check()?;
                    let matrix = fetched.map_err(|err| match err {
                        PipelineError::DataUnavailable {
                            available: Some(available),
                            bar_count,
                            ..
                        } if available < bar_count => {
                            insufficient_history(term, ctx, fetch_start, available)
                        }
                        other => other,
                    })?;
                    if matrix.nrows() < span {
                        return Err(insufficient_history(term, ctx, fetch_start, matrix.nrows()));
                    }
                    let expected = &ctx.sessions[fetch_start..first_row + rows];
                    if matrix.dates() != expected || matrix.assets() != universe.assets() {
                        return Err(PipelineError::DataUnavailable {
                            field,
                            end_date: ctx.end_date,
                            bar_count: span,
                            available: None,
                            reason: "bar store window does not match the calendar and universe"
                                .to_string(),
                        });
                    }
                    Source::Fetched(matrix)
                }
                Input::Term(dep) => {
                    let output = cache.require(dep.id())?;
                    let offset = output.nrows().checked_sub(span).ok_or_else(|| {
                        PipelineError::InvalidTerm(format!(
                            "{} produced {} rows, {} needs {}",
                            dep.name(),
                            output.nrows(),
                            term.name(),
                            span
                        ))
                    })?;
                    Source::Cached { output, offset }
                }
            };
            sources.push(source);
        }

        let ncols = universe.len();
        let dates: Arc<[Date]> = Arc::from(&ctx.sessions[first_row..first_row + rows]);
        let (mut float_values, mut bool_values) = match term.dtype() {
            DType::Float64 => (vec![f64::NAN; rows * ncols], Vec::new()),
            DType::Bool => (Vec::new(), vec![false; rows * ncols]),
        };

        for r in 0..rows {
            ctx.cancel.check()?;
            let windows: Vec<Window<'_>> = sources
                .iter()
                .map(|s| s.window(r..r + window_length))
                .collect();
            let compute_ctx = ComputeContext {
                date: ctx.sessions[first_row + r],
                assets: universe.assets(),
                mask: ctx.lifetimes.row(first_row + r),
            };
            let cells = r * ncols..(r + 1) * ncols;
            let out = match term.dtype() {
                DType::Float64 => OutputRow::Float(&mut float_values[cells]),
                DType::Bool => OutputRow::Bool(&mut bool_values[cells]),
            };
            term.compute(&compute_ctx, &windows, out)?;
        }

        log::debug!(
            "[{}] Evaluated {} ({} rows x {} assets)",
            ctx.request_id,
            term.name(),
            rows,
            ncols
        );

        Ok(match term.dtype() {
            DType::Float64 => {
                TermOutput::Float(LabeledMatrix::new(dates, Arc::clone(universe), float_values)?)
            }
            DType::Bool => {
                TermOutput::Bool(LabeledMatrix::new(dates, Arc::clone(universe), bool_values)?)
            }
        })
    }
}

/// Short-history failure for `term`, whose fetch starts at `fetch_start`
/// and found only `available` bars up to the request's end date
fn insufficient_history(
    term: &TermRef,
    ctx: &EvalContext<'_>,
    fetch_start: usize,
    available: usize,
) -> PipelineError {
    let earliest = match ctx.sessions.len().checked_sub(available) {
        Some(row) if available > 0 => ctx.sessions[row].to_string(),
        _ => "none".to_string(),
    };
    PipelineError::InsufficientHistory {
        term: term.name(),
        required_start: ctx.sessions[fetch_start].to_string(),
        earliest,
    }
}
