//! Factors - numeric pipeline terms
//!
//! [`Factor`] is the typed handle for numeric terms. It supports arithmetic
//! (`+ - * /`), comparisons producing [`Filter`]s and cross-sectional
//! operations such as `top`, `rank` and `zscore`.
//!
//! Windowed built-ins skip missing (NaN) observations instead of letting
//! them poison the aggregate. A window with no usable observation yields NaN,
//! which surfaces as an undefined cell in the result table.

use crate::error::{PipelineError, Result};
use crate::matrix::MatrixView;
use crate::pipeline::filters::{Filter, PercentileBetween, TopN};
use crate::pipeline::term::{
    next_term_id, BinOp, BinaryOpTerm, ComputeContext, DType, Input, KernelTerm, Operand,
    OutputRow, Term, TermRef, UnaryOp, UnaryOpTerm, Window,
};
use crate::types::{TermId, SESSIONS_PER_YEAR};
use statrs::statistics::{Data, Distribution};
use std::ops::{Add, Div, Mul, Neg, Sub};
use std::sync::Arc;

/// Handle on a numeric term
#[derive(Debug, Clone)]
pub struct Factor(TermRef);

impl Factor {
    /// Wrap a term, checking that it is numeric
    pub fn new<T: Term + 'static>(term: T) -> Result<Self> {
        Self::from_term(Arc::new(term))
    }

    pub fn from_term(term: TermRef) -> Result<Self> {
        if term.dtype() != DType::Float64 {
            return Err(PipelineError::InvalidTerm(format!(
                "{} is not numeric and cannot be used as a factor",
                term.name()
            )));
        }
        Ok(Self(term))
    }

    pub(crate) fn wrap<T: Term + 'static>(term: T) -> Self {
        Self(Arc::new(term))
    }

    /// Factor computed by a closure over one window per input
    pub fn custom<F>(
        name: impl Into<String>,
        inputs: Vec<Input>,
        window_length: usize,
        f: F,
    ) -> Self
    where
        F: Fn(&ComputeContext<'_>, &[Window<'_>], &mut [f64]) -> Result<()>
            + Send
            + Sync
            + 'static,
    {
        Self::wrap(KernelTerm::factor(name, inputs, window_length, f))
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

    pub fn window_length(&self) -> usize {
        self.0.window_length()
    }

    fn binary(&self, op: BinOp, rhs: FactorOperand) -> BinaryOpTerm {
        BinaryOpTerm::typed(op, Operand::Term(Arc::clone(&self.0)), rhs.into())
    }

    fn unary(&self, op: UnaryOp) -> UnaryOpTerm {
        UnaryOpTerm::typed(op, Arc::clone(&self.0))
    }

    pub fn pow(&self, exponent: impl Into<FactorOperand>) -> Factor {
        Factor::wrap(self.binary(BinOp::Power, exponent.into()))
    }

    pub fn abs(&self) -> Factor {
        Factor::wrap(self.unary(UnaryOp::Abs))
    }

    pub fn sqrt(&self) -> Factor {
        Factor::wrap(self.unary(UnaryOp::Sqrt))
    }

    /// Natural logarithm
    pub fn log(&self) -> Factor {
        Factor::wrap(self.unary(UnaryOp::Log))
    }

    pub fn exp(&self) -> Factor {
        Factor::wrap(self.unary(UnaryOp::Exp))
    }

    pub fn gt(&self, other: impl Into<FactorOperand>) -> Filter {
        Filter::wrap(self.binary(BinOp::Greater, other.into()))
    }

    pub fn ge(&self, other: impl Into<FactorOperand>) -> Filter {
        Filter::wrap(self.binary(BinOp::GreaterEqual, other.into()))
    }

    pub fn lt(&self, other: impl Into<FactorOperand>) -> Filter {
        Filter::wrap(self.binary(BinOp::Less, other.into()))
    }

    pub fn le(&self, other: impl Into<FactorOperand>) -> Filter {
        Filter::wrap(self.binary(BinOp::LessEqual, other.into()))
    }

    pub fn equal_to(&self, other: impl Into<FactorOperand>) -> Filter {
        Filter::wrap(self.binary(BinOp::Equal, other.into()))
    }

    pub fn not_equal_to(&self, other: impl Into<FactorOperand>) -> Filter {
        Filter::wrap(self.binary(BinOp::NotEqual, other.into()))
    }

    /// True where the factor has a defined value
    pub fn notnan(&self) -> Filter {
        Filter::wrap(self.unary(UnaryOp::NotNaN))
    }

    pub fn isnan(&self) -> Filter {
        Filter::wrap(self.unary(UnaryOp::IsNaN))
    }

    /// The `n` largest values among alive assets on each date
    pub fn top(&self, n: usize) -> Filter {
        Filter::wrap(TopN::new(Arc::clone(&self.0), n, true))
    }

    /// The `n` smallest values among alive assets on each date
    pub fn bottom(&self, n: usize) -> Filter {
        Filter::wrap(TopN::new(Arc::clone(&self.0), n, false))
    }

    /// Values between two percentiles (0-100, inclusive) of each date's
    /// cross-section
    pub fn percentile_between(&self, min_percentile: f64, max_percentile: f64) -> Result<Filter> {
        Ok(Filter::wrap(PercentileBetween::new(
            Arc::clone(&self.0),
            min_percentile,
            max_percentile,
        )?))
    }

    /// 1-based ordinal rank within each date's cross-section
    pub fn rank(&self, ascending: bool) -> Factor {
        Factor::wrap(CrossSectional::new(
            Arc::clone(&self.0),
            CrossSectionalOp::Rank { ascending },
        ))
    }

    pub fn zscore(&self) -> Factor {
        Factor::wrap(CrossSectional::new(Arc::clone(&self.0), CrossSectionalOp::ZScore))
    }

    pub fn demean(&self) -> Factor {
        Factor::wrap(CrossSectional::new(Arc::clone(&self.0), CrossSectionalOp::Demean))
    }
}

impl From<Factor> for TermRef {
    fn from(factor: Factor) -> Self {
        factor.0
    }
}

impl From<&Factor> for TermRef {
    fn from(factor: &Factor) -> Self {
        Arc::clone(&factor.0)
    }
}

impl From<Factor> for Input {
    fn from(factor: Factor) -> Self {
        Input::Term(factor.0)
    }
}

impl From<&Factor> for Input {
    fn from(factor: &Factor) -> Self {
        Input::Term(Arc::clone(&factor.0))
    }
}

/// Right-hand side of factor arithmetic and comparisons
#[derive(Debug, Clone)]
pub enum FactorOperand {
    Factor(Factor),
    Scalar(f64),
}

impl From<f64> for FactorOperand {
    fn from(value: f64) -> Self {
        FactorOperand::Scalar(value)
    }
}

impl From<Factor> for FactorOperand {
    fn from(factor: Factor) -> Self {
        FactorOperand::Factor(factor)
    }
}

impl From<&Factor> for FactorOperand {
    fn from(factor: &Factor) -> Self {
        FactorOperand::Factor(factor.clone())
    }
}

impl From<FactorOperand> for Operand {
    fn from(operand: FactorOperand) -> Self {
        match operand {
            FactorOperand::Factor(factor) => Operand::Term(factor.0),
            FactorOperand::Scalar(value) => Operand::Scalar(value),
        }
    }
}

macro_rules! factor_arithmetic {
    ($trait:ident, $method:ident, $op:expr) => {
        impl<R: Into<FactorOperand>> $trait<R> for Factor {
            type Output = Factor;

            fn $method(self, rhs: R) -> Factor {
                Factor::wrap(self.binary($op, rhs.into()))
            }
        }

        impl<R: Into<FactorOperand>> $trait<R> for &Factor {
            type Output = Factor;

            fn $method(self, rhs: R) -> Factor {
                Factor::wrap(self.binary($op, rhs.into()))
            }
        }
    };
}

factor_arithmetic!(Add, add, BinOp::Add);
factor_arithmetic!(Sub, sub, BinOp::Subtract);
factor_arithmetic!(Mul, mul, BinOp::Multiply);
factor_arithmetic!(Div, div, BinOp::Divide);

impl Neg for Factor {
    type Output = Factor;

    fn neg(self) -> Factor {
        Factor::wrap(self.unary(UnaryOp::Negate))
    }
}

impl Neg for &Factor {
    type Output = Factor;

    fn neg(self) -> Factor {
        Factor::wrap(self.unary(UnaryOp::Negate))
    }
}

/// Mean of the non-NaN values, NaN when there are none
pub fn nanmean<'a>(values: impl Iterator<Item = &'a f64>) -> f64 {
    let (sum, count) = values
        .filter(|v| !v.is_nan())
        .fold((0.0_f64, 0usize), |(sum, count), v| (sum + *v, count + 1));
    if count == 0 {
        f64::NAN
    } else {
        sum / count as f64
    }
}

/// Sum of the non-NaN values, NaN when there are none
pub fn nansum<'a>(values: impl Iterator<Item = &'a f64>) -> f64 {
    let mut valid = values.filter(|v| !v.is_nan()).peekable();
    if valid.peek().is_none() {
        return f64::NAN;
    }
    valid.sum()
}

fn single_float_window<'a>(windows: &[Window<'a>]) -> Result<MatrixView<'a, f64>> {
    windows
        .first()
        .ok_or_else(|| PipelineError::InvalidTerm("missing input window".to_string()))?
        .floats()
}

fn float_output<'o>(out: OutputRow<'o>, name: &str) -> Result<&'o mut [f64]> {
    match out {
        OutputRow::Float(row) => Ok(row),
        OutputRow::Bool(_) => Err(PipelineError::InvalidTerm(format!(
            "{} produces numbers, got a boolean output row",
            name
        ))),
    }
}

/// Most recent value of a column or factor
#[derive(Debug, Clone)]
pub struct Latest {
    id: TermId,
    input: Input,
}

impl Latest {
    pub fn new(input: impl Into<Input>) -> Self {
        Self {
            id: next_term_id(),
            input: input.into(),
        }
    }
}

impl Term for Latest {
    fn id(&self) -> TermId {
        self.id
    }

    fn name(&self) -> String {
        format!("Latest({})", self.input.label())
    }

    fn dtype(&self) -> DType {
        DType::Float64
    }

    fn inputs(&self) -> Vec<Input> {
        vec![self.input.clone()]
    }

    fn compute(
        &self,
        _ctx: &ComputeContext<'_>,
        windows: &[Window<'_>],
        out: OutputRow<'_>,
    ) -> Result<()> {
        let row = float_output(out, "Latest")?;
        row.copy_from_slice(single_float_window(windows)?.last_row());
        Ok(())
    }
}

impl From<Latest> for Factor {
    fn from(term: Latest) -> Self {
        Factor::wrap(term)
    }
}

/// Trailing mean over `window_length` sessions, ignoring missing values
#[derive(Debug, Clone)]
pub struct SimpleMovingAverage {
    id: TermId,
    input: Input,
    window_length: usize,
}

impl SimpleMovingAverage {
    pub fn new(input: impl Into<Input>, window_length: usize) -> Self {
        Self {
            id: next_term_id(),
            input: input.into(),
            window_length,
        }
    }
}

impl Term for SimpleMovingAverage {
    fn id(&self) -> TermId {
        self.id
    }

    fn name(&self) -> String {
        format!("SimpleMovingAverage({}, {})", self.input.label(), self.window_length)
    }

    fn dtype(&self) -> DType {
        DType::Float64
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
        let row = float_output(out, "SimpleMovingAverage")?;
        let window = single_float_window(windows)?;
        for (col, value) in row.iter_mut().enumerate() {
            *value = nanmean(window.column(col));
        }
        Ok(())
    }
}

impl From<SimpleMovingAverage> for Factor {
    fn from(term: SimpleMovingAverage) -> Self {
        Factor::wrap(term)
    }
}

/// Average daily `close * volume` over the window.
///
/// The sum skips missing sessions but is divided by the full window length,
/// so sparse trading histories are penalised.
#[derive(Debug, Clone)]
pub struct AverageDollarVolume {
    id: TermId,
    window_length: usize,
}

impl AverageDollarVolume {
    pub fn new(window_length: usize) -> Self {
        Self {
            id: next_term_id(),
            window_length,
        }
    }
}

impl Term for AverageDollarVolume {
    fn id(&self) -> TermId {
        self.id
    }

    fn name(&self) -> String {
        format!("AverageDollarVolume({})", self.window_length)
    }

    fn dtype(&self) -> DType {
        DType::Float64
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::column("close"), Input::column("volume")]
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
        let row = float_output(out, "AverageDollarVolume")?;
        let [close, volume] = windows else {
            return Err(PipelineError::InvalidTerm(
                "AverageDollarVolume expects close and volume windows".to_string(),
            ));
        };
        let (close, volume) = (close.floats()?, volume.floats()?);
        for (col, value) in row.iter_mut().enumerate() {
            let dollars: Vec<f64> = close
                .column(col)
                .zip(volume.column(col))
                .map(|(c, v)| c * v)
                .collect();
            *value = nansum(dollars.iter()) / self.window_length as f64;
        }
        Ok(())
    }
}

impl From<AverageDollarVolume> for Factor {
    fn from(term: AverageDollarVolume) -> Self {
        Factor::wrap(term)
    }
}

/// Percent change from the first to the last session of the window
#[derive(Debug, Clone)]
pub struct Returns {
    id: TermId,
    input: Input,
    window_length: usize,
}

impl Returns {
    /// Returns of `close` over `window_length` sessions (2 = daily returns)
    pub fn new(window_length: usize) -> Self {
        Self::of(Input::column("close"), window_length)
    }

    pub fn of(input: impl Into<Input>, window_length: usize) -> Self {
        Self {
            id: next_term_id(),
            input: input.into(),
            window_length,
        }
    }
}

impl Term for Returns {
    fn id(&self) -> TermId {
        self.id
    }

    fn name(&self) -> String {
        format!("Returns({}, {})", self.input.label(), self.window_length)
    }

    fn dtype(&self) -> DType {
        DType::Float64
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
        let row = float_output(out, "Returns")?;
        let window = single_float_window(windows)?;
        let (first, last) = (window.row(0), window.last_row());
        for (col, value) in row.iter_mut().enumerate() {
            *value = (last[col] - first[col]) / first[col];
        }
        Ok(())
    }
}

impl From<Returns> for Factor {
    fn from(term: Returns) -> Self {
        Factor::wrap(term)
    }
}

/// Exponentially weighted mean, newest observation weighted 1
#[derive(Debug, Clone)]
pub struct ExponentialWeightedMovingAverage {
    id: TermId,
    input: Input,
    window_length: usize,
    decay_rate: f64,
}

impl ExponentialWeightedMovingAverage {
    pub fn new(input: impl Into<Input>, window_length: usize, decay_rate: f64) -> Result<Self> {
        if !(decay_rate > 0.0 && decay_rate <= 1.0) {
            return Err(PipelineError::InvalidTerm(format!(
                "decay_rate must be in (0, 1], got {}",
                decay_rate
            )));
        }
        Ok(Self {
            id: next_term_id(),
            input: input.into(),
            window_length,
            decay_rate,
        })
    }

    /// Decay from a pandas-style span: `1 - 2 / (span + 1)`
    pub fn from_span(input: impl Into<Input>, window_length: usize, span: f64) -> Result<Self> {
        if span < 1.0 {
            return Err(PipelineError::InvalidTerm(format!(
                "span must be at least 1, got {}",
                span
            )));
        }
        // span 1 means no memory at all
        let decay = (1.0 - 2.0 / (span + 1.0)).max(f64::MIN_POSITIVE);
        Self::new(input, window_length, decay)
    }

    pub fn decay_rate(&self) -> f64 {
        self.decay_rate
    }
}

impl Term for ExponentialWeightedMovingAverage {
    fn id(&self) -> TermId {
        self.id
    }

    fn name(&self) -> String {
        format!(
            "EWMA({}, {}, {:.4})",
            self.input.label(),
            self.window_length,
            self.decay_rate
        )
    }

    fn dtype(&self) -> DType {
        DType::Float64
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
        let row = float_output(out, "EWMA")?;
        let window = single_float_window(windows)?;
        let nrows = window.nrows();
        let weights: Vec<f64> = (0..nrows)
            .map(|r| self.decay_rate.powi((nrows - 1 - r) as i32))
            .collect();

        for (col, value) in row.iter_mut().enumerate() {
            let (total, weight) = window
                .column(col)
                .zip(&weights)
                .filter(|(x, _)| !x.is_nan())
                .fold((0.0_f64, 0.0_f64), |(total, weight), (x, w)| {
                    (total + x * w, weight + w)
                });
            *value = if weight > 0.0 { total / weight } else { f64::NAN };
        }
        Ok(())
    }
}

impl From<ExponentialWeightedMovingAverage> for Factor {
    fn from(term: ExponentialWeightedMovingAverage) -> Self {
        Factor::wrap(term)
    }
}

/// Sample standard deviation of an input (usually daily returns) over the
/// window, scaled by the square root of `annualization_factor`
#[derive(Debug, Clone)]
pub struct AnnualizedVolatility {
    id: TermId,
    input: Input,
    window_length: usize,
    annualization_factor: f64,
}

impl AnnualizedVolatility {
    pub fn new(input: impl Into<Input>, window_length: usize) -> Self {
        Self {
            id: next_term_id(),
            input: input.into(),
            window_length,
            annualization_factor: SESSIONS_PER_YEAR,
        }
    }

    pub fn with_annualization_factor(mut self, factor: f64) -> Self {
        self.annualization_factor = factor;
        self
    }
}

impl Term for AnnualizedVolatility {
    fn id(&self) -> TermId {
        self.id
    }

    fn name(&self) -> String {
        format!(
            "AnnualizedVolatility({}, {})",
            self.input.label(),
            self.window_length
        )
    }

    fn dtype(&self) -> DType {
        DType::Float64
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
        let row = float_output(out, "AnnualizedVolatility")?;
        let window = single_float_window(windows)?;
        let scale = self.annualization_factor.sqrt();
        for (col, value) in row.iter_mut().enumerate() {
            let observed: Vec<f64> = window.column(col).copied().filter(|x| !x.is_nan()).collect();
            *value = if observed.len() < 2 {
                f64::NAN
            } else {
                Data::new(observed).std_dev().map_or(f64::NAN, |sd| sd * scale)
            };
        }
        Ok(())
    }
}

impl From<AnnualizedVolatility> for Factor {
    fn from(term: AnnualizedVolatility) -> Self {
        Factor::wrap(term)
    }
}

/// Cross-sectional transform applied per date
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CrossSectionalOp {
    Rank { ascending: bool },
    ZScore,
    Demean,
}

/// Per-date transform across alive assets with defined values; every other
/// cell is NaN
#[derive(Debug, Clone)]
pub struct CrossSectional {
    id: TermId,
    input: TermRef,
    op: CrossSectionalOp,
}

impl CrossSectional {
    pub fn new(input: TermRef, op: CrossSectionalOp) -> Self {
        Self {
            id: next_term_id(),
            input,
            op,
        }
    }
}

/// Columns that are alive and defined, ordered by value (ties by column)
pub(crate) fn ranked_columns(values: &[f64], mask: &[bool], ascending: bool) -> Vec<usize> {
    let mut cols: Vec<usize> = (0..values.len())
        .filter(|c| mask[*c] && !values[*c].is_nan())
        .collect();
    cols.sort_by(|a, b| {
        let ord = values[*a].total_cmp(&values[*b]);
        if ascending {
            ord
        } else {
            ord.reverse()
        }
    });
    cols
}

impl Term for CrossSectional {
    fn id(&self) -> TermId {
        self.id
    }

    fn name(&self) -> String {
        match self.op {
            CrossSectionalOp::Rank { ascending } => {
                format!("Rank({}, ascending={})", self.input.name(), ascending)
            }
            CrossSectionalOp::ZScore => format!("ZScore({})", self.input.name()),
            CrossSectionalOp::Demean => format!("Demean({})", self.input.name()),
        }
    }

    fn dtype(&self) -> DType {
        DType::Float64
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
        let row = float_output(out, "CrossSectional")?;
        let values = single_float_window(windows)?.last_row();
        row.fill(f64::NAN);

        match self.op {
            CrossSectionalOp::Rank { ascending } => {
                let ranked = ranked_columns(values, ctx.mask, ascending);
                for (rank, col) in ranked.into_iter().enumerate() {
                    row[col] = (rank + 1) as f64;
                }
            }
            CrossSectionalOp::ZScore | CrossSectionalOp::Demean => {
                let cols = ranked_columns(values, ctx.mask, true);
                let sample: Vec<f64> = cols.iter().map(|c| values[*c]).collect();
                if sample.is_empty() {
                    return Ok(());
                }
                let data = Data::new(sample);
                let mean = data.mean().unwrap_or(f64::NAN);
                let scale = match self.op {
                    CrossSectionalOp::ZScore => data.std_dev().unwrap_or(f64::NAN),
                    _ => 1.0,
                };
                for col in cols {
                    row[col] = (values[col] - mean) / scale;
                }
            }
        }
        Ok(())
    }
}
