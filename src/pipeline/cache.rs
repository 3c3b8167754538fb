//! Per-request term cache
//!
//! Holds each evaluated term's full output, keyed by term identity. Entries
//! are write-once and the whole cache is dropped when the request returns.

use crate::error::{PipelineError, Result};
use crate::matrix::LabeledMatrix;
use crate::pipeline::term::{DType, Window};
use crate::types::{Date, TermId};
use hashbrown::HashMap;
use std::ops::Range;

/// Full output of one term: one row per session it covers
#[derive(Debug, Clone)]
pub enum TermOutput {
    Float(LabeledMatrix<f64>),
    Bool(LabeledMatrix<bool>),
}

impl TermOutput {
    pub fn dtype(&self) -> DType {
        match self {
            TermOutput::Float(_) => DType::Float64,
            TermOutput::Bool(_) => DType::Bool,
        }
    }

    pub fn nrows(&self) -> usize {
        match self {
            TermOutput::Float(m) => m.nrows(),
            TermOutput::Bool(m) => m.nrows(),
        }
    }

    pub fn dates(&self) -> &[Date] {
        match self {
            TermOutput::Float(m) => m.dates(),
            TermOutput::Bool(m) => m.dates(),
        }
    }

    /// Window over a row range, typed by output
    pub fn window(&self, rows: Range<usize>) -> Window<'_> {
        match self {
            TermOutput::Float(m) => Window::Float(m.view(rows)),
            TermOutput::Bool(m) => Window::Bool(m.view(rows)),
        }
    }

    pub fn as_float(&self) -> Option<&LabeledMatrix<f64>> {
        match self {
            TermOutput::Float(m) => Some(m),
            TermOutput::Bool(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<&LabeledMatrix<bool>> {
        match self {
            TermOutput::Bool(m) => Some(m),
            TermOutput::Float(_) => None,
        }
    }
}

/// Write-once store of term outputs for one execution request
#[derive(Debug, Default)]
pub struct TermCache {
    entries: HashMap<TermId, TermOutput>,
}

impl TermCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a term's output; a second write for the same term is an error
    pub fn insert(&mut self, id: TermId, output: TermOutput) -> Result<()> {
        if self.entries.contains_key(&id) {
            return Err(PipelineError::InvalidTerm(format!(
                "term {} was already evaluated in this request",
                id
            )));
        }
        self.entries.insert(id, output);
        Ok(())
    }

    pub fn get(&self, id: TermId) -> Option<&TermOutput> {
        self.entries.get(&id)
    }

    /// Cached output of an input term, which must already be evaluated
    pub fn require(&self, id: TermId) -> Result<&TermOutput> {
        self.entries.get(&id).ok_or_else(|| {
            PipelineError::InvalidTerm(format!("term {} read before it was evaluated", id))
        })
    }

    pub fn contains(&self, id: TermId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
