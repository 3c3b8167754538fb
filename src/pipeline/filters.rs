//! Filters - boolean pipeline terms
//!
//! A [`Filter`] yields true/false per asset per date. Filters gate which
//! rows reach the result table (the screen) and can also be requested as
//! ordinary output columns. They combine with `&`, `|` and `!`.

use crate::error::{PipelineError, Result};
use crate::pipeline::factors::ranked_columns;
use crate::pipeline::term::{
    next_term_id, BinOp, BinaryOpTerm, ComputeContext, DType, Input, KernelTerm, Operand,
    OutputRow, Term, TermRef, UnaryOp, UnaryOpTerm, Window,
};
use crate::types::{AssetId, TermId};
use hashbrown::HashSet;
use statrs::statistics::{Data, OrderStatistics};
use std::ops::{BitAnd, BitOr, Not};
use std::sync::Arc;

/// Handle on a boolean term
#[derive(Debug, Clone)]
pub struct Filter(TermRef);

impl Filter {
    /// Wrap a term, checking that it is boolean
    pub fn new<T: Term + 'static>(term: T) -> Result<Self> {
        Self::from_term(Arc::new(term))
    }

    pub fn from_term(term: TermRef) -> Result<Self> {
        if term.dtype() != DType::Bool {
            return Err(PipelineError::InvalidTerm(format!(
                "{} is not boolean and cannot be used as a filter",
                term.name()
            )));
        }
        Ok(Self(term))
    }

    pub(crate) fn wrap<T: Term + 'static>(term: T) -> Self {
        Self(Arc::new(term))
    }

    /// Filter computed by a closure over one window per input
    pub fn custom<F>(
        name: impl Into<String>,
        inputs: Vec<Input>,
        window_length: usize,
        f: F,
    ) -> Self
    where
        F: Fn(&ComputeContext<'_>, &[Window<'_>], &mut [bool]) -> Result<()>
            + Send
            + Sync
            + 'static,
    {
        Self::wrap(KernelTerm::filter(name, inputs, window_length, f))
    }

    /// True where the input has a defined value on the date
    pub fn not_null(input: impl Into<Input>) -> Self {
        Self::wrap(AllPresent::new(input, 1))
    }

    pub fn term(&self) -> &TermRef {
        &self.0
    }

    pub fn id(&self) -> TermId {
        self.0.id()
    }

    pub fn name(&self) -> String {
        self.0.name()
    }

    pub fn and(&self, other: &Filter) -> Filter {
        Filter::wrap(BinaryOpTerm::typed(
            BinOp::And,
            Operand::Term(Arc::clone(&self.0)),
            Operand::Term(Arc::clone(&other.0)),
        ))
    }

    pub fn or(&self, other: &Filter) -> Filter {
        Filter::wrap(BinaryOpTerm::typed(
            BinOp::Or,
            Operand::Term(Arc::clone(&self.0)),
            Operand::Term(Arc::clone(&other.0)),
        ))
    }

    pub fn invert(&self) -> Filter {
        Filter::wrap(UnaryOpTerm::typed(UnaryOp::Not, Arc::clone(&self.0)))
    }
}

impl From<Filter> for TermRef {
    fn from(filter: Filter) -> Self {
        filter.0
    }
}

impl From<&Filter> for TermRef {
    fn from(filter: &Filter) -> Self {
        Arc::clone(&filter.0)
    }
}

impl From<Filter> for Input {
    fn from(filter: Filter) -> Self {
        Input::Term(filter.0)
    }
}

impl From<&Filter> for Input {
    fn from(filter: &Filter) -> Self {
        Input::Term(Arc::clone(&filter.0))
    }
}

impl BitAnd for Filter {
    type Output = Filter;

    fn bitand(self, rhs: Filter) -> Filter {
        Filter::and(&self, &rhs)
    }
}

impl BitAnd for &Filter {
    type Output = Filter;

    fn bitand(self, rhs: &Filter) -> Filter {
        Filter::and(self, rhs)
    }
}

impl BitOr for Filter {
    type Output = Filter;

    fn bitor(self, rhs: Filter) -> Filter {
        Filter::or(&self, &rhs)
    }
}

impl BitOr for &Filter {
    type Output = Filter;

    fn bitor(self, rhs: &Filter) -> Filter {
        Filter::or(self, rhs)
    }
}

impl Not for Filter {
    type Output = Filter;

    fn not(self) -> Filter {
        self.invert()
    }
}

impl Not for &Filter {
    type Output = Filter;

    fn not(self) -> Filter {
        self.invert()
    }
}

fn bool_output<'o>(out: OutputRow<'o>, name: &str) -> Result<&'o mut [bool]> {
    match out {
        OutputRow::Bool(row) => Ok(row),
        OutputRow::Float(_) => Err(PipelineError::InvalidTerm(format!(
            "{} produces booleans, got a numeric output row",
            name
        ))),
    }
}

fn first_window<'a>(windows: &[Window<'a>]) -> Result<Window<'a>> {
    windows
        .first()
        .copied()
        .ok_or_else(|| PipelineError::InvalidTerm("missing input window".to_string()))
}

/// The `n` largest (or smallest) alive, defined values per date.
///
/// Ties are broken by asset order so the selection is deterministic.
#[derive(Debug, Clone)]
pub struct TopN {
    id: TermId,
    input: TermRef,
    n: usize,
    largest: bool,
}

impl TopN {
    pub fn new(input: TermRef, n: usize, largest: bool) -> Self {
        Self {
            id: next_term_id(),
            input,
            n,
            largest,
        }
    }
}

impl Term for TopN {
    fn id(&self) -> TermId {
        self.id
    }

    fn name(&self) -> String {
        let which = if self.largest { "Top" } else { "Bottom" };
        format!("{}({}, {})", which, self.input.name(), self.n)
    }

    fn dtype(&self) -> DType {
        DType::Bool
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::Term(Arc::clone(&self.input))]
    }

    fn compute(
        &self,
        ctx: &ComputeContext<'_>,
        windows: &[Window<'_>],
        out: OutputRow<'_>,
    ) -> Result<()> {
        let row = bool_output(out, "TopN")?;
        let values = first_window(windows)?.floats()?.last_row();
        row.fill(false);
        for col in ranked_columns(values, ctx.mask, !self.largest)
            .into_iter()
            .take(self.n)
        {
            row[col] = true;
        }
        Ok(())
    }
}

/// Values within the `[min, max]` percentile band of each date's alive,
/// defined cross-section
#[derive(Debug, Clone)]
pub struct PercentileBetween {
    id: TermId,
    input: TermRef,
    min_percentile: f64,
    max_percentile: f64,
}

impl PercentileBetween {
    pub fn new(input: TermRef, min_percentile: f64, max_percentile: f64) -> Result<Self> {
        let valid = (0.0..=100.0).contains(&min_percentile)
            && (0.0..=100.0).contains(&max_percentile)
            && min_percentile <= max_percentile;
        if !valid {
            return Err(PipelineError::InvalidTerm(format!(
                "percentile bounds must satisfy 0 <= min <= max <= 100, got {} and {}",
                min_percentile, max_percentile
            )));
        }
        Ok(Self {
            id: next_term_id(),
            input,
            min_percentile,
            max_percentile,
        })
    }
}

impl Term for PercentileBetween {
    fn id(&self) -> TermId {
        self.id
    }

    fn name(&self) -> String {
        format!(
            "PercentileBetween({}, {}, {})",
            self.input.name(),
            self.min_percentile,
            self.max_percentile
        )
    }

    fn dtype(&self) -> DType {
        DType::Bool
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::Term(Arc::clone(&self.input))]
    }

    fn compute(
        &self,
        ctx: &ComputeContext<'_>,
        windows: &[Window<'_>],
        out: OutputRow<'_>,
    ) -> Result<()> {
        let row = bool_output(out, "PercentileBetween")?;
        let values = first_window(windows)?.floats()?.last_row();
        row.fill(false);

        let cols = ranked_columns(values, ctx.mask, true);
        if cols.is_empty() {
            return Ok(());
        }
        let mut data = Data::new(cols.iter().map(|c| values[*c]).collect::<Vec<f64>>());
        let low = data.quantile(self.min_percentile / 100.0);
        let high = data.quantile(self.max_percentile / 100.0);
        for col in cols {
            row[col] = values[col] >= low && values[col] <= high;
        }
        Ok(())
    }
}

/// Fixed set of assets
#[derive(Debug, Clone)]
pub struct StaticAssets {
    id: TermId,
    assets: HashSet<AssetId>,
}

impl StaticAssets {
    pub fn new(assets: impl IntoIterator<Item = AssetId>) -> Self {
        Self {
            id: next_term_id(),
            assets: assets.into_iter().collect(),
        }
    }
}

impl Term for StaticAssets {
    fn id(&self) -> TermId {
        self.id
    }

    fn name(&self) -> String {
        let mut assets: Vec<&AssetId> = self.assets.iter().collect();
        assets.sort_unstable();
        format!("StaticAssets({:?})", assets)
    }

    fn dtype(&self) -> DType {
        DType::Bool
    }

    fn inputs(&self) -> Vec<Input> {
        Vec::new()
    }

    fn compute(
        &self,
        ctx: &ComputeContext<'_>,
        _windows: &[Window<'_>],
        out: OutputRow<'_>,
    ) -> Result<()> {
        let row = bool_output(out, "StaticAssets")?;
        for (value, asset) in row.iter_mut().zip(ctx.assets) {
            *value = self.assets.contains(asset);
        }
        Ok(())
    }
}

impl From<StaticAssets> for Filter {
    fn from(term: StaticAssets) -> Self {
        Filter::wrap(term)
    }
}

/// True where the input is defined on every session of the window
#[derive(Debug, Clone)]
pub struct AllPresent {
    id: TermId,
    input: Input,
    window_length: usize,
}

impl AllPresent {
    pub fn new(input: impl Into<Input>, window_length: usize) -> Self {
        Self {
            id: next_term_id(),
            input: input.into(),
            window_length,
        }
    }
}

impl Term for AllPresent {
    fn id(&self) -> TermId {
        self.id
    }

    fn name(&self) -> String {
        format!("AllPresent({}, {})", self.input.label(), self.window_length)
    }

    fn dtype(&self) -> DType {
        DType::Bool
    }

    fn inputs(&self) -> Vec<Input> {
        vec![self.input.clone()]
    }

    fn window_length(&self) -> usize {
        self.window_length
    }

    fn compute(
        &self,
        _ctx: &ComputeContext<'_>,
        windows: &[Window<'_>],
        out: OutputRow<'_>,
    ) -> Result<()> {
        let row = bool_output(out, "AllPresent")?;
        let window = first_window(windows)?.floats()?;
        for (col, value) in row.iter_mut().enumerate() {
            *value = window.column(col).all(|x| !x.is_nan());
        }
        Ok(())
    }
}

impl From<AllPresent> for Filter {
    fn from(term: AllPresent) -> Self {
        Filter::wrap(term)
    }
}
