//! Pipeline Graph - Computational dependency graph
//!
//! Collects every term reachable from the pipeline roots, orders them so
//! that inputs always precede their dependents, and works out how many
//! extra leading rows each term must produce so that its dependents get
//! full windows on the first requested session.

use crate::error::{PipelineError, Result};
use crate::pipeline::term::{DType, Input, TermRef};
use crate::types::TermId;
use hashbrown::HashMap;
use serde::Serialize;
use std::fmt::Write;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Visit {
    InProgress,
    Done,
}

/// Dependency graph of one pipeline, in evaluation order
#[derive(Debug, Clone, Default)]
pub struct TermGraph {
    /// All terms in the graph
    terms: HashMap<TermId, TermRef>,
    /// Dependencies: term_id -> [input term ids], declaration order
    dependencies: HashMap<TermId, Vec<TermId>>,
    /// Reverse dependencies: term_id -> [dependent ids]
    dependents: HashMap<TermId, Vec<TermId>>,
    /// Execution order (topologically sorted)
    execution_order: Vec<TermId>,
    /// Rows each term produces before the first requested session
    extra_rows: HashMap<TermId, usize>,
    /// Longest input chain below each term (leaves are 0)
    depths: HashMap<TermId, usize>,
}

impl TermGraph {
    /// Build the graph reachable from `roots`.
    ///
    /// Roots are walked in the given order and inputs in declaration order,
    /// so the resulting execution order is the depth-first post-order and is
    /// identical across runs. Fails on cycles and invalid window lengths.
    pub fn build(roots: &[TermRef]) -> Result<Self> {
        let mut graph = Self::default();
        let mut state: HashMap<TermId, Visit> = HashMap::new();

        for root in roots {
            graph.visit(root, &mut state)?;
        }

        graph.compute_depths();
        graph.compute_extra_rows(roots);

        log::debug!(
            "Built term graph: {} terms, max depth {}, max lookback {}",
            graph.len(),
            graph.max_depth(),
            graph.max_lookback()
        );
        Ok(graph)
    }

    fn visit(&mut self, term: &TermRef, state: &mut HashMap<TermId, Visit>) -> Result<()> {
        let term_id = term.id();
        match state.get(&term_id) {
            Some(Visit::Done) => return Ok(()),
            Some(Visit::InProgress) => {
                return Err(PipelineError::CyclicDependency { term: term.name() })
            }
            None => {}
        }

        if term.window_length() == 0 {
            return Err(PipelineError::InvalidTerm(format!(
                "{} has window_length 0, must be at least 1",
                term.name()
            )));
        }

        state.insert(term_id, Visit::InProgress);

        let mut deps = Vec::new();
        for input in term.inputs() {
            if let Input::Term(dep) = input {
                self.visit(&dep, state)?;
                let dep_id = dep.id();
                if !deps.contains(&dep_id) {
                    deps.push(dep_id);
                    self.dependents.entry(dep_id).or_default().push(term_id);
                }
            }
        }

        state.insert(term_id, Visit::Done);
        self.dependencies.insert(term_id, deps);
        self.terms.insert(term_id, Arc::clone(term));
        self.execution_order.push(term_id);
        Ok(())
    }

    fn compute_depths(&mut self) {
        for term_id in &self.execution_order {
            let depth = self.dependencies[term_id]
                .iter()
                .map(|dep| self.depths[dep] + 1)
                .max()
                .unwrap_or(0);
            self.depths.insert(*term_id, depth);
        }
    }

    // Walk dependents before inputs so every dependent's requirement is known
    // when an input is reached.
    fn compute_extra_rows(&mut self, roots: &[TermRef]) {
        for root in roots {
            self.extra_rows.insert(root.id(), 0);
        }
        for term_id in self.execution_order.iter().rev() {
            let extra = self.extra_rows.get(term_id).copied().unwrap_or(0);
            let window = self.terms[term_id].window_length();
            for dep in &self.dependencies[term_id] {
                let needed = extra + window - 1;
                let entry = self.extra_rows.entry(*dep).or_insert(0);
                *entry = (*entry).max(needed);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn contains(&self, id: TermId) -> bool {
        self.terms.contains_key(&id)
    }

    /// Get a term by ID
    pub fn get_term(&self, id: TermId) -> Option<&TermRef> {
        self.terms.get(&id)
    }

    /// Get dependencies of a term
    pub fn dependencies_of(&self, id: TermId) -> Option<&[TermId]> {
        self.dependencies.get(&id).map(|v| v.as_slice())
    }

    /// Get dependents of a term
    pub fn dependents_of(&self, id: TermId) -> Option<&[TermId]> {
        self.dependents.get(&id).map(|v| v.as_slice())
    }

    /// Term ids, inputs before dependents
    pub fn execution_order(&self) -> &[TermId] {
        &self.execution_order
    }

    /// Terms in execution order
    pub fn ordered_terms(&self) -> impl Iterator<Item = &TermRef> + '_ {
        self.execution_order.iter().map(move |id| &self.terms[id])
    }

    /// Leading rows the term must produce beyond the requested range
    pub fn extra_rows(&self, id: TermId) -> usize {
        self.extra_rows.get(&id).copied().unwrap_or(0)
    }

    pub fn depth(&self, id: TermId) -> usize {
        self.depths.get(&id).copied().unwrap_or(0)
    }

    pub fn max_depth(&self) -> usize {
        self.depths.values().copied().max().unwrap_or(0)
    }

    /// Sessions before the first requested session that the term reads
    pub fn lookback(&self, id: TermId) -> usize {
        match self.terms.get(&id) {
            Some(term) => self.extra_rows(id) + term.window_length() - 1,
            None => 0,
        }
    }

    /// Largest lookback of any term: how far the date range is extended
    pub fn max_lookback(&self) -> usize {
        self.execution_order
            .iter()
            .map(|id| self.lookback(*id))
            .max()
            .unwrap_or(0)
    }

    /// First term (in execution order) reaching the maximum lookback
    pub fn deepest_lookback_term(&self) -> Option<&TermRef> {
        let max = self.max_lookback();
        self.execution_order
            .iter()
            .find(|id| self.lookback(**id) == max)
            .map(|id| &self.terms[id])
    }

    /// Terms grouped by depth, each group in execution order.
    ///
    /// Terms within a group never depend on each other, so a group can be
    /// evaluated concurrently once all earlier groups are cached.
    pub fn ranks(&self) -> Vec<Vec<TermId>> {
        if self.is_empty() {
            return Vec::new();
        }
        let mut ranks = vec![Vec::new(); self.max_depth() + 1];
        for id in &self.execution_order {
            ranks[self.depths[id]].push(*id);
        }
        ranks
    }

    /// Read-only snapshot of the graph for diagnostics
    pub fn dump(&self, names: &[(String, TermId)], screen: Option<TermId>) -> GraphDump {
        let nodes = self
            .ordered_terms()
            .map(|term| {
                let id = term.id();
                GraphNode {
                    id,
                    name: term.name(),
                    dtype: term.dtype(),
                    window_length: term.window_length(),
                    extra_rows: self.extra_rows(id),
                    depth: self.depth(id),
                    columns: term
                        .inputs()
                        .into_iter()
                        .filter_map(|input| match input {
                            Input::Column(field) => Some(field),
                            Input::Term(_) => None,
                        })
                        .collect(),
                    outputs: names
                        .iter()
                        .filter(|(_, term_id)| *term_id == id)
                        .map(|(name, _)| name.clone())
                        .collect(),
                    is_screen: screen == Some(id),
                }
            })
            .collect();

        let edges = self
            .execution_order
            .iter()
            .flat_map(|to| {
                self.dependencies[to]
                    .iter()
                    .map(move |from| GraphEdge { from: *from, to: *to })
            })
            .collect();

        GraphDump { nodes, edges }
    }
}

/// One node of a [`GraphDump`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphNode {
    pub id: TermId,
    pub name: String,
    pub dtype: DType,
    pub window_length: usize,
    pub extra_rows: usize,
    pub depth: usize,
    /// Raw bar store fields read directly
    pub columns: Vec<String>,
    /// Pipeline output names bound to this term
    pub outputs: Vec<String>,
    pub is_screen: bool,
}

/// Input edge: `from` feeds `to`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GraphEdge {
    pub from: TermId,
    pub to: TermId,
}

/// Diagnostic export of a pipeline's term graph
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphDump {
    /// Nodes in execution order
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

impl GraphDump {
    /// Graphviz rendering
    pub fn to_dot(&self) -> String {
        let mut dot = String::from("digraph pipeline {\n    rankdir=LR;\n");
        for node in &self.nodes {
            let shape = if node.is_screen {
                "diamond"
            } else if node.outputs.is_empty() {
                "ellipse"
            } else {
                "box"
            };
            let mut label = node.name.replace('"', "\\\"");
            if !node.outputs.is_empty() {
                let _ = write!(label, "\\n[{}]", node.outputs.join(", "));
            }
            let _ = writeln!(
                dot,
                "    t{} [label=\"{}\", shape={}];",
                node.id, label, shape
            );
            for column in &node.columns {
                let _ = writeln!(dot, "    \"{}\" -> t{} [style=dashed];", column, node.id);
            }
        }
        for edge in &self.edges {
            let _ = writeln!(dot, "    t{} -> t{};", edge.from, edge.to);
        }
        dot.push_str("}\n");
        dot
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
