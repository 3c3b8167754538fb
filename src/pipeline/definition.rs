//! Pipeline definition: named output terms plus an optional screen

use crate::error::{PipelineError, Result};
use crate::pipeline::filters::Filter;
use crate::pipeline::graph::{GraphDump, TermGraph};
use crate::pipeline::term::TermRef;
use crate::types::TermId;
use std::sync::Arc;

/// Named mapping of output columns to terms, plus an optional screen.
///
/// A pipeline is borrowed immutably for the whole of an execution request
/// and can be reused for any number of requests.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    /// Output columns in insertion order
    columns: Vec<(String, TermRef)>,
    screen: Option<Filter>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an output column; names must be unique
    pub fn add(&mut self, term: impl Into<TermRef>, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        if self.columns.iter().any(|(existing, _)| *existing == name) {
            return Err(PipelineError::DuplicateName { name });
        }
        log::debug!("Adding pipeline column '{}'", name);
        self.columns.push((name, term.into()));
        Ok(())
    }

    /// Remove a column, returning its term
    pub fn remove(&mut self, name: &str) -> Option<TermRef> {
        let index = self.columns.iter().position(|(existing, _)| existing == name)?;
        Some(self.columns.remove(index).1)
    }

    /// Restrict result rows to assets passing `filter`, replacing any
    /// previous screen
    pub fn set_screen(&mut self, filter: Filter) {
        self.screen = Some(filter);
    }

    pub fn clear_screen(&mut self) {
        self.screen = None;
    }

    pub fn screen(&self) -> Option<&Filter> {
        self.screen.as_ref()
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &TermRef)> + '_ {
        self.columns.iter().map(|(name, term)| (name.as_str(), term))
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Graph roots: outputs in insertion order, then the screen
    pub fn roots(&self) -> Vec<TermRef> {
        let mut roots: Vec<TermRef> = self.columns.iter().map(|(_, t)| Arc::clone(t)).collect();
        if let Some(screen) = &self.screen {
            roots.push(Arc::clone(screen.term()));
        }
        roots
    }

    /// Build and validate the dependency graph
    pub fn graph(&self) -> Result<TermGraph> {
        TermGraph::build(&self.roots())
    }

    /// Read-only dump of the term graph
    pub fn show_graph(&self) -> Result<GraphDump> {
        let graph = self.graph()?;
        let names: Vec<(String, TermId)> = self
            .columns
            .iter()
            .map(|(name, term)| (name.clone(), term.id()))
            .collect();
        Ok(graph.dump(&names, self.screen.as_ref().map(Filter::id)))
    }
}
