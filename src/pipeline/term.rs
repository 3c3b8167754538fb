//! Pipeline Term - Core computational expression system
//!
//! Terms represent computational nodes in the pipeline dependency graph.
//! A term declares its inputs (raw bar store columns or other terms), a
//! trailing window length, and an evaluation function that maps one window
//! of input rows to one output row covering every asset.

use crate::data::BarField;
use crate::error::{PipelineError, Result};
use crate::matrix::MatrixView;
use crate::types::{AssetId, Date, TermId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_TERM_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique term identity
pub fn next_term_id() -> TermId {
    NEXT_TERM_ID.fetch_add(1, Ordering::Relaxed)
}

/// Shared handle on a term
pub type TermRef = Arc<dyn Term>;

/// Data types that can be computed by terms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    /// Boolean values (filters)
    Bool,
    /// 64-bit float (factors)
    Float64,
}

impl DType {
    /// Whether this dtype supports arithmetic and ordering
    pub fn is_numeric(&self) -> bool {
        matches!(self, DType::Float64)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::Bool => write!(f, "bool"),
            DType::Float64 => write!(f, "float64"),
        }
    }
}

/// One declared input of a term
#[derive(Debug, Clone)]
pub enum Input {
    /// Raw field served by the bar store (e.g. "close")
    Column(String),
    /// Output of another term
    Term(TermRef),
}

impl Input {
    pub fn column(field: impl Into<String>) -> Self {
        Input::Column(field.into())
    }

    /// The upstream term, if this input is one
    pub fn as_term(&self) -> Option<&TermRef> {
        match self {
            Input::Term(term) => Some(term),
            Input::Column(_) => None,
        }
    }

    /// DType this input delivers
    pub fn dtype(&self) -> DType {
        match self {
            Input::Column(_) => DType::Float64,
            Input::Term(term) => term.dtype(),
        }
    }

    /// Short label used in term names
    pub fn label(&self) -> String {
        match self {
            Input::Column(field) => field.clone(),
            Input::Term(term) => term.name(),
        }
    }
}

impl From<BarField> for Input {
    fn from(field: BarField) -> Self {
        Input::Column(field.as_str().to_string())
    }
}

impl From<&str> for Input {
    fn from(field: &str) -> Self {
        Input::Column(field.to_string())
    }
}

impl From<String> for Input {
    fn from(field: String) -> Self {
        Input::Column(field)
    }
}

impl From<TermRef> for Input {
    fn from(term: TermRef) -> Self {
        Input::Term(term)
    }
}

/// Trailing window of one input: `window_length` rows x all assets
#[derive(Debug, Clone, Copy)]
pub enum Window<'a> {
    Float(MatrixView<'a, f64>),
    Bool(MatrixView<'a, bool>),
}

impl<'a> Window<'a> {
    /// Numeric view, or an error for boolean inputs
    pub fn floats(&self) -> Result<MatrixView<'a, f64>> {
        match self {
            Window::Float(view) => Ok(*view),
            Window::Bool(_) => Err(PipelineError::InvalidTerm(
                "expected a numeric input, got a boolean one".to_string(),
            )),
        }
    }

    /// Boolean view, or an error for numeric inputs
    pub fn bools(&self) -> Result<MatrixView<'a, bool>> {
        match self {
            Window::Bool(view) => Ok(*view),
            Window::Float(_) => Err(PipelineError::InvalidTerm(
                "expected a boolean input, got a numeric one".to_string(),
            )),
        }
    }

    pub fn nrows(&self) -> usize {
        match self {
            Window::Float(view) => view.nrows(),
            Window::Bool(view) => view.nrows(),
        }
    }
}

/// Destination row for one evaluation step
#[derive(Debug)]
pub enum OutputRow<'a> {
    Float(&'a mut [f64]),
    Bool(&'a mut [bool]),
}

/// Per-row evaluation context
#[derive(Debug, Clone, Copy)]
pub struct ComputeContext<'a> {
    /// Session the output row is labelled with
    pub date: Date,
    /// Assets in column order
    pub assets: &'a [AssetId],
    /// Lifetimes row for `date` (true = asset exists)
    pub mask: &'a [bool],
}

/// Trait for all pipeline terms
///
/// Terms are immutable once constructed; `id` is the cache key and graph
/// node identity.
pub trait Term: Send + Sync + fmt::Debug {
    /// Unique identifier for this term
    fn id(&self) -> TermId;

    /// Human-readable name for debugging and graph dumps
    fn name(&self) -> String;

    /// Data type of this term's output
    fn dtype(&self) -> DType;

    /// Declared inputs, in the order windows are passed to `compute`
    fn inputs(&self) -> Vec<Input>;

    /// Trailing sessions consumed to produce one output row
    fn window_length(&self) -> usize {
        1
    }

    /// Produce one output row from one window per input
    fn compute(
        &self,
        ctx: &ComputeContext<'_>,
        windows: &[Window<'_>],
        out: OutputRow<'_>,
    ) -> Result<()>;
}

type FactorKernel =
    dyn Fn(&ComputeContext<'_>, &[Window<'_>], &mut [f64]) -> Result<()> + Send + Sync;
type FilterKernel =
    dyn Fn(&ComputeContext<'_>, &[Window<'_>], &mut [bool]) -> Result<()> + Send + Sync;

#[derive(Clone)]
enum Kernel {
    Factor(Arc<FactorKernel>),
    Filter(Arc<FilterKernel>),
}

/// Term whose evaluation function is a closure
#[derive(Clone)]
pub struct KernelTerm {
    id: TermId,
    name: String,
    inputs: Vec<Input>,
    window_length: usize,
    kernel: Kernel,
}

impl KernelTerm {
    /// Numeric term
    pub fn factor<F>(
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
        Self {
            id: next_term_id(),
            name: name.into(),
            inputs,
            window_length,
            kernel: Kernel::Factor(Arc::new(f)),
        }
    }

    /// Boolean term
    pub fn filter<F>(
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
        Self {
            id: next_term_id(),
            name: name.into(),
            inputs,
            window_length,
            kernel: Kernel::Filter(Arc::new(f)),
        }
    }
}

impl fmt::Debug for KernelTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelTerm")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("window_length", &self.window_length)
            .field("inputs", &self.inputs.len())
            .finish()
    }
}

impl Term for KernelTerm {
    fn id(&self) -> TermId {
        self.id
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn dtype(&self) -> DType {
        match self.kernel {
            Kernel::Factor(_) => DType::Float64,
            Kernel::Filter(_) => DType::Bool,
        }
    }

    fn inputs(&self) -> Vec<Input> {
        self.inputs.clone()
    }

    fn window_length(&self) -> usize {
        self.window_length
    }

    fn compute(
        &self,
        ctx: &ComputeContext<'_>,
        windows: &[Window<'_>],
        out: OutputRow<'_>,
    ) -> Result<()> {
        match (&self.kernel, out) {
            (Kernel::Factor(f), OutputRow::Float(row)) => f(ctx, windows, row),
            (Kernel::Filter(f), OutputRow::Bool(row)) => f(ctx, windows, row),
            _ => Err(PipelineError::InvalidTerm(format!(
                "{} was handed an output row of the wrong type",
                self.name
            ))),
        }
    }
}

/// Binary operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Power,
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    And,
    Or,
}

impl BinOp {
    /// Whether the operation produces a number rather than a boolean
    pub fn is_arithmetic(&self) -> bool {
        matches!(
            self,
            BinOp::Add | BinOp::Subtract | BinOp::Multiply | BinOp::Divide | BinOp::Power
        )
    }

    /// Result dtype for this operation on given input types
    pub fn result_dtype(&self, left: DType, right: DType) -> Result<DType> {
        match self {
            BinOp::Add | BinOp::Subtract | BinOp::Multiply | BinOp::Divide | BinOp::Power => {
                if !left.is_numeric() || !right.is_numeric() {
                    return Err(PipelineError::InvalidTerm(format!(
                        "Arithmetic operation requires numeric types, got {} and {}",
                        left, right
                    )));
                }
                Ok(DType::Float64)
            }
            BinOp::Equal
            | BinOp::NotEqual
            | BinOp::Less
            | BinOp::LessEqual
            | BinOp::Greater
            | BinOp::GreaterEqual => {
                if !left.is_numeric() || !right.is_numeric() {
                    return Err(PipelineError::InvalidTerm(format!(
                        "Comparison requires numeric types, got {} and {}",
                        left, right
                    )));
                }
                Ok(DType::Bool)
            }
            BinOp::And | BinOp::Or => {
                if left != DType::Bool || right != DType::Bool {
                    return Err(PipelineError::InvalidTerm(format!(
                        "Logical operation requires bool types, got {} and {}",
                        left, right
                    )));
                }
                Ok(DType::Bool)
            }
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Subtract => "-",
            BinOp::Multiply => "*",
            BinOp::Divide => "/",
            BinOp::Power => "**",
            BinOp::Equal => "==",
            BinOp::NotEqual => "!=",
            BinOp::Less => "<",
            BinOp::LessEqual => "<=",
            BinOp::Greater => ">",
            BinOp::GreaterEqual => ">=",
            BinOp::And => "&",
            BinOp::Or => "|",
        }
    }

    fn apply_numeric(&self, a: f64, b: f64) -> f64 {
        match self {
            BinOp::Add => a + b,
            BinOp::Subtract => a - b,
            BinOp::Multiply => a * b,
            BinOp::Divide => a / b,
            BinOp::Power => a.powf(b),
            _ => f64::NAN,
        }
    }

    // NaN compares false against everything, so undefined inputs never pass.
    fn apply_compare(&self, a: f64, b: f64) -> bool {
        match self {
            BinOp::Equal => a == b,
            BinOp::NotEqual => !a.is_nan() && !b.is_nan() && a != b,
            BinOp::Less => a < b,
            BinOp::LessEqual => a <= b,
            BinOp::Greater => a > b,
            BinOp::GreaterEqual => a >= b,
            _ => false,
        }
    }
}

/// Unary operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Negate,
    Abs,
    Sqrt,
    Log,
    Exp,
    Not,
    IsNaN,
    NotNaN,
}

impl UnaryOp {
    /// Result dtype for this operation on given input type
    pub fn result_dtype(&self, input: DType) -> Result<DType> {
        match self {
            UnaryOp::Negate | UnaryOp::Abs | UnaryOp::Sqrt | UnaryOp::Log | UnaryOp::Exp => {
                if !input.is_numeric() {
                    return Err(PipelineError::InvalidTerm(format!(
                        "{:?} requires numeric type, got {}",
                        self, input
                    )));
                }
                Ok(DType::Float64)
            }
            UnaryOp::Not => {
                if input != DType::Bool {
                    return Err(PipelineError::InvalidTerm(format!(
                        "Not operation requires bool type, got {}",
                        input
                    )));
                }
                Ok(DType::Bool)
            }
            UnaryOp::IsNaN | UnaryOp::NotNaN => {
                if !input.is_numeric() {
                    return Err(PipelineError::InvalidTerm(format!(
                        "{:?} requires numeric type, got {}",
                        self, input
                    )));
                }
                Ok(DType::Bool)
            }
        }
    }
}

/// Operand of a binary operation
#[derive(Debug, Clone)]
pub enum Operand {
    Term(TermRef),
    Scalar(f64),
}

impl Operand {
    fn dtype(&self) -> DType {
        match self {
            Operand::Term(term) => term.dtype(),
            Operand::Scalar(_) => DType::Float64,
        }
    }

    fn label(&self) -> String {
        match self {
            Operand::Term(term) => term.name(),
            Operand::Scalar(value) => value.to_string(),
        }
    }
}

impl From<f64> for Operand {
    fn from(value: f64) -> Self {
        Operand::Scalar(value)
    }
}

impl From<TermRef> for Operand {
    fn from(term: TermRef) -> Self {
        Operand::Term(term)
    }
}

/// Current row of one operand
enum OperandRow<'a> {
    Float(&'a [f64]),
    Bool(&'a [bool]),
    Scalar(f64),
}

impl OperandRow<'_> {
    fn float(&self, col: usize) -> f64 {
        match self {
            OperandRow::Float(row) => row[col],
            OperandRow::Scalar(value) => *value,
            OperandRow::Bool(row) => f64::from(u8::from(row[col])),
        }
    }

    fn boolean(&self, col: usize) -> bool {
        match self {
            OperandRow::Bool(row) => row[col],
            OperandRow::Float(row) => row[col] != 0.0 && !row[col].is_nan(),
            OperandRow::Scalar(value) => *value != 0.0,
        }
    }
}

fn operand_rows<'a>(
    operands: [&Operand; 2],
    windows: &[Window<'a>],
) -> Result<[OperandRow<'a>; 2]> {
    let mut next = 0;
    let mut resolve = |operand: &Operand| -> Result<OperandRow<'a>> {
        match operand {
            Operand::Scalar(value) => Ok(OperandRow::Scalar(*value)),
            Operand::Term(_) => {
                let window = windows.get(next).ok_or_else(|| {
                    PipelineError::InvalidTerm("missing operand window".to_string())
                })?;
                next += 1;
                Ok(match window {
                    Window::Float(view) => OperandRow::Float(view.last_row()),
                    Window::Bool(view) => OperandRow::Bool(view.last_row()),
                })
            }
        }
    };
    let left = resolve(operands[0])?;
    let right = resolve(operands[1])?;
    Ok([left, right])
}

/// Term representing a binary operation
#[derive(Debug, Clone)]
pub struct BinaryOpTerm {
    id: TermId,
    op: BinOp,
    left: Operand,
    right: Operand,
    dtype: DType,
}

impl BinaryOpTerm {
    pub fn new(op: BinOp, left: Operand, right: Operand) -> Result<Self> {
        let dtype = op.result_dtype(left.dtype(), right.dtype())?;
        Ok(Self {
            id: next_term_id(),
            op,
            left,
            right,
            dtype,
        })
    }

    /// Operands whose dtypes are already known to fit `op`
    pub(crate) fn typed(op: BinOp, left: Operand, right: Operand) -> Self {
        let dtype = if op.is_arithmetic() {
            DType::Float64
        } else {
            DType::Bool
        };
        Self {
            id: next_term_id(),
            op,
            left,
            right,
            dtype,
        }
    }

    pub fn op(&self) -> BinOp {
        self.op
    }
}

impl Term for BinaryOpTerm {
    fn id(&self) -> TermId {
        self.id
    }

    fn name(&self) -> String {
        format!("({} {} {})", self.left.label(), self.op.symbol(), self.right.label())
    }

    fn dtype(&self) -> DType {
        self.dtype
    }

    fn inputs(&self) -> Vec<Input> {
        [&self.left, &self.right]
            .into_iter()
            .filter_map(|operand| match operand {
                Operand::Term(term) => Some(Input::Term(Arc::clone(term))),
                Operand::Scalar(_) => None,
            })
            .collect()
    }

    fn compute(
        &self,
        _ctx: &ComputeContext<'_>,
        windows: &[Window<'_>],
        out: OutputRow<'_>,
    ) -> Result<()> {
        let [left, right] = operand_rows([&self.left, &self.right], windows)?;
        match out {
            OutputRow::Float(row) => {
                for (col, value) in row.iter_mut().enumerate() {
                    *value = self.op.apply_numeric(left.float(col), right.float(col));
                }
            }
            OutputRow::Bool(row) => {
                for (col, value) in row.iter_mut().enumerate() {
                    *value = match self.op {
                        BinOp::And => left.boolean(col) && right.boolean(col),
                        BinOp::Or => left.boolean(col) || right.boolean(col),
                        op => op.apply_compare(left.float(col), right.float(col)),
                    };
                }
            }
        }
        Ok(())
    }
}

/// Term representing a unary operation
#[derive(Debug, Clone)]
pub struct UnaryOpTerm {
    id: TermId,
    op: UnaryOp,
    input: TermRef,
    dtype: DType,
}

impl UnaryOpTerm {
    pub fn new(op: UnaryOp, input: TermRef) -> Result<Self> {
        let dtype = op.result_dtype(input.dtype())?;
        Ok(Self {
            id: next_term_id(),
            op,
            input,
            dtype,
        })
    }

    /// Input whose dtype is already known to fit `op`
    pub(crate) fn typed(op: UnaryOp, input: TermRef) -> Self {
        let dtype = match op {
            UnaryOp::Not | UnaryOp::IsNaN | UnaryOp::NotNaN => DType::Bool,
            _ => DType::Float64,
        };
        Self {
            id: next_term_id(),
            op,
            input,
            dtype,
        }
    }

    pub fn op(&self) -> UnaryOp {
        self.op
    }
}

impl Term for UnaryOpTerm {
    fn id(&self) -> TermId {
        self.id
    }

    fn name(&self) -> String {
        format!("{:?}({})", self.op, self.input.name())
    }

    fn dtype(&self) -> DType {
        self.dtype
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::Term(Arc::clone(&self.input))]
    }

    fn compute(
        &self,
        _ctx: &ComputeContext<'_>,
        windows: &[Window<'_>],
        out: OutputRow<'_>,
    ) -> Result<()> {
        let window = windows
            .first()
            .ok_or_else(|| PipelineError::InvalidTerm("missing operand window".to_string()))?;
        match (self.op, out) {
            (UnaryOp::Not, OutputRow::Bool(row)) => {
                let input = window.bools()?.last_row();
                for (value, x) in row.iter_mut().zip(input) {
                    *value = !*x;
                }
            }
            (UnaryOp::IsNaN | UnaryOp::NotNaN, OutputRow::Bool(row)) => {
                let want_nan = self.op == UnaryOp::IsNaN;
                let input = window.floats()?.last_row();
                for (value, x) in row.iter_mut().zip(input) {
                    *value = x.is_nan() == want_nan;
                }
            }
            (op, OutputRow::Float(row)) => {
                let input = window.floats()?.last_row();
                for (value, x) in row.iter_mut().zip(input) {
                    *value = match op {
                        UnaryOp::Negate => -x,
                        UnaryOp::Abs => x.abs(),
                        UnaryOp::Sqrt => x.sqrt(),
                        UnaryOp::Log => x.ln(),
                        UnaryOp::Exp => x.exp(),
                        _ => f64::NAN,
                    };
                }
            }
            (op, OutputRow::Bool(_)) => {
                return Err(PipelineError::InvalidTerm(format!(
                    "{:?} does not produce a boolean output",
                    op
                )))
            }
        }
        Ok(())
    }
}
