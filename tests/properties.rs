//! Property tests for graph ordering and result row counts

mod common;

use common::*;
use proptest::prelude::*;
use proptest::sample::Index;
use rusty_pipeline::pipeline::{KernelTerm, TermGraph};
use rusty_pipeline::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;

/// Random DAG: term `i` reads up to three of the terms before it
fn build_dag(shape: &[(usize, Vec<Index>)]) -> Vec<TermRef> {
    let mut terms: Vec<TermRef> = Vec::with_capacity(shape.len());
    for (i, (window, picks)) in shape.iter().enumerate() {
        let mut inputs: Vec<Input> = if i == 0 {
            vec![Input::from(BarField::Close)]
        } else {
            picks
                .iter()
                .map(|pick| Input::from(Arc::clone(&terms[pick.index(i)])))
                .collect()
        };
        if inputs.is_empty() {
            inputs.push(Input::from(BarField::Close));
        }
        let term = KernelTerm::factor(format!("t{}", i), inputs, *window, |_, _, out| {
            out.fill(0.0);
            Ok(())
        });
        terms.push(Arc::new(term));
    }
    terms
}

fn dag_strategy() -> impl Strategy<Value = Vec<(usize, Vec<Index>)>> {
    prop::collection::vec(
        (1usize..5, prop::collection::vec(any::<Index>(), 0..4)),
        1..16,
    )
}

proptest! {
    #[test]
    fn prop_execution_order_is_topological(shape in dag_strategy()) {
        let terms = build_dag(&shape);
        let graph = TermGraph::build(&terms).unwrap();

        prop_assert_eq!(graph.len(), terms.len());
        let position: HashMap<TermId, usize> = graph
            .execution_order()
            .iter()
            .enumerate()
            .map(|(i, id)| (*id, i))
            .collect();
        prop_assert_eq!(position.len(), terms.len());

        for term in &terms {
            for dep in graph.dependencies_of(term.id()).unwrap() {
                prop_assert!(position[dep] < position[&term.id()]);
                // a dependency covers every row its dependent will read
                prop_assert!(
                    graph.extra_rows(*dep) >= graph.extra_rows(term.id()) + term.window_length() - 1
                );
            }
        }
    }

    #[test]
    fn prop_build_is_deterministic(shape in dag_strategy()) {
        let terms = build_dag(&shape);
        let first = TermGraph::build(&terms).unwrap();
        let second = TermGraph::build(&terms).unwrap();
        prop_assert_eq!(first.execution_order(), second.execution_order());
    }

    #[test]
    fn prop_row_count_is_alive_and_screened(
        lifetimes in prop::collection::vec((0usize..4, 0usize..4), 1..6),
        closes in prop::collection::vec(prop::collection::vec(0.0f64..100.0, 4), 6),
        threshold in 0.0f64..100.0,
    ) {
        let days = sessions();
        let mut store = InMemoryBarStore::new(days.clone());
        let mut finder = AssetFinder::new();
        for (i, (a, b)) in lifetimes.iter().enumerate() {
            let sid = i as AssetId + 1;
            let (first, last) = (*a.min(b), *a.max(b));
            finder
                .insert_asset(
                    Asset::equity(sid, format!("S{}", sid), "NYSE")
                        .with_lifetime(Some(days[first]), Some(days[last])),
                )
                .unwrap();
            store.insert_series("close", sid, closes[i].clone()).unwrap();
        }
        let fx = fixture_with(CountingStore::new(store), finder);

        let close = Factor::from(Latest::new(BarField::Close));
        let mut pipeline = Pipeline::new();
        pipeline.add(&close, "close").unwrap();
        pipeline.set_screen(close.gt(threshold));

        let table = fx.engine.run_pipeline(&pipeline, days[0], days[3]).unwrap();

        let mut expected = 0;
        for (row, date) in days.iter().enumerate() {
            for (i, (a, b)) in lifetimes.iter().enumerate() {
                let alive = days[*a.min(b)] <= *date && *date <= days[*a.max(b)];
                if alive && closes[i][row] > threshold {
                    expected += 1;
                }
            }
        }
        prop_assert_eq!(table.len(), expected);
        prop_assert_eq!(fx.store.fetches(), 1);
    }
}
