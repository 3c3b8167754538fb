//! End-to-end tests for pipeline execution requests

mod common;

use common::*;
use rusty_pipeline::pipeline::{
    ColumnData, ComputeContext, DType, Input, OutputRow, RequestState, Window,
};
use rusty_pipeline::prelude::*;
use std::io::Write;
use std::sync::{Arc, OnceLock};

fn avg_close_3() -> Factor {
    Factor::from(SimpleMovingAverage::new(BarField::Close, 3))
}

#[test]
fn test_avg_close_3_without_screen() {
    init_logging();
    let fx = fixture();
    let mut pipeline = Pipeline::new();
    pipeline.add(avg_close_3(), "avg_close_3").unwrap();

    let table = fx.engine.run_pipeline(&pipeline, d(4), d(5)).unwrap();

    let keys: Vec<(Date, AssetId)> = table.keys().iter().map(|k| (k.date, k.asset)).collect();
    assert_eq!(keys, vec![(d(4), 1), (d(4), 2), (d(5), 1), (d(5), 2)]);
    assert_eq!(
        table.factor_column("avg_close_3").unwrap(),
        &[Some(12.0), Some(18.0), Some(14.0), Some(16.0)]
    );
}

#[test]
fn test_avg_close_3_with_screen() {
    init_logging();
    let fx = fixture();
    let avg = avg_close_3();
    let mut pipeline = Pipeline::new();
    pipeline.add(&avg, "avg_close_3").unwrap();
    pipeline.set_screen(avg.gt(13.0));

    let table = fx.engine.run_pipeline(&pipeline, d(4), d(5)).unwrap();

    assert_eq!(table.len(), 3);
    assert_eq!(table.assets_on(d(4)), vec![2]);
    assert_eq!(table.assets_on(d(5)), vec![1, 2]);
    assert_eq!(
        table.get(d(4), 2, "avg_close_3").unwrap().as_f64(),
        Some(18.0)
    );
    assert!(table.get(d(4), 1, "avg_close_3").is_none());
}

#[test]
fn test_dead_asset_excluded_despite_screen() {
    init_logging();
    let mut finder = AssetFinder::new();
    finder
        .insert_assets(vec![
            Asset::equity(1, "A", "NYSE"),
            Asset::equity(2, "B", "NYSE").with_lifetime(None, Some(d(4))),
        ])
        .unwrap();
    let fx = fixture_with(CountingStore::new(two_asset_store()), finder);

    let avg = avg_close_3();
    let mut pipeline = Pipeline::new();
    pipeline.add(&avg, "avg_close_3").unwrap();
    pipeline.set_screen(avg.gt(0.0));

    let table = fx.engine.run_pipeline(&pipeline, d(4), d(5)).unwrap();
    assert_eq!(table.assets_on(d(4)), vec![1, 2]);
    // B would pass the screen on the 5th but is no longer listed
    assert_eq!(table.assets_on(d(5)), vec![1]);
}

#[test]
fn test_window_longer_than_history() {
    init_logging();
    let fx = fixture();
    let mut pipeline = Pipeline::new();
    pipeline
        .add(Factor::from(SimpleMovingAverage::new(BarField::Close, 10)), "avg_10")
        .unwrap();

    let err = fx.engine.run_pipeline(&pipeline, d(4), d(5)).unwrap_err();
    assert!(matches!(err, PipelineError::InsufficientHistory { .. }));
    assert!(err.is_data_error());
    assert_eq!(fx.store.fetches(), 0);
}

#[test]
fn test_history_before_bar_store_start() {
    // The weekday calendar has no holidays, so it reaches back past the
    // store's first session
    let store = Arc::new(CountingStore::new(two_asset_store()));
    let engine = PipelineEngine::new(
        Arc::new(WeekdayCalendar::new()),
        store.clone(),
        Arc::new(two_asset_finder()),
    );
    let mut pipeline = Pipeline::new();
    pipeline.add(avg_close_3(), "avg_close_3").unwrap();

    let err = engine.run_pipeline(&pipeline, d(3), d(5)).unwrap_err();
    match err {
        PipelineError::InsufficientHistory {
            term,
            required_start,
            earliest,
        } => {
            assert!(term.contains("SimpleMovingAverage"));
            // two weekdays before the 3rd: New Year's Day and the 2nd
            assert_eq!(required_start, "2024-01-01");
            assert_eq!(earliest, "2024-01-02");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(store.fetches(), 0);
}

/// Bar store that cannot name its earliest session
struct UnboundedStore(InMemoryBarStore);

impl BarStore for UnboundedStore {
    fn fetch(
        &self,
        assets: &Arc<AssetIndex>,
        field: &str,
        end_date: Date,
        bar_count: usize,
        frequency: Frequency,
    ) -> Result<LabeledMatrix<f64>> {
        self.0.fetch(assets, field, end_date, bar_count, frequency)
    }

    fn first_session(&self) -> Option<Date> {
        None
    }
}

fn assert_short_history(err: PipelineError) {
    match err {
        PipelineError::InsufficientHistory {
            term,
            required_start,
            earliest,
        } => {
            assert!(term.contains("SimpleMovingAverage"));
            // nine weekdays before the 4th
            assert_eq!(required_start, "2023-12-22");
            assert_eq!(earliest, "2024-01-02");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_short_fetch_is_insufficient_history() {
    init_logging();
    let mut pipeline = Pipeline::new();
    pipeline
        .add(Factor::from(SimpleMovingAverage::new(BarField::Close, 10)), "avg_10")
        .unwrap();

    let unbounded = PipelineEngine::new(
        Arc::new(WeekdayCalendar::new()),
        Arc::new(UnboundedStore(two_asset_store())),
        Arc::new(two_asset_finder()),
    );
    assert_short_history(unbounded.run_pipeline(&pipeline, d(4), d(5)).unwrap_err());

    let unchecked = PipelineEngine::new(
        Arc::new(WeekdayCalendar::new()),
        Arc::new(two_asset_store()),
        Arc::new(two_asset_finder()),
    )
    .with_config(EngineConfig {
        check_history: false,
        ..EngineConfig::default()
    })
    .unwrap();
    assert_short_history(unchecked.run_pipeline(&pipeline, d(4), d(5)).unwrap_err());
}

/// Registry answering with its universe in descending asset order
struct ReversedRegistry(AssetFinder);

impl AssetRegistry for ReversedRegistry {
    fn lifetimes(&self, sessions: &[Date]) -> Result<LabeledMatrix<bool>> {
        let table = self.0.lifetimes(sessions)?;
        let assets: Vec<AssetId> = table.assets().iter().rev().copied().collect();
        let values = (0..table.nrows())
            .flat_map(|row| table.row(row).iter().rev().copied().collect::<Vec<_>>())
            .collect();
        LabeledMatrix::new(
            table.dates().iter().copied().collect(),
            Arc::new(AssetIndex::new(assets)?),
            values,
        )
    }
}

#[test]
fn test_registry_order_does_not_change_row_order() {
    let engine = PipelineEngine::new(
        Arc::new(SessionCalendar::new(sessions())),
        Arc::new(two_asset_store()),
        Arc::new(ReversedRegistry(two_asset_finder())),
    );
    let mut pipeline = Pipeline::new();
    pipeline.add(avg_close_3(), "avg_close_3").unwrap();

    let table = engine.run_pipeline(&pipeline, d(4), d(5)).unwrap();
    let keys: Vec<(Date, AssetId)> = table.keys().iter().map(|k| (k.date, k.asset)).collect();
    assert_eq!(keys, vec![(d(4), 1), (d(4), 2), (d(5), 1), (d(5), 2)]);
    assert_eq!(
        table.get(d(4), 2, "avg_close_3").unwrap().as_f64(),
        Some(18.0)
    );
    assert_eq!(
        table.get(d(5), 1, "avg_close_3").unwrap().as_f64(),
        Some(14.0)
    );
    assert_eq!(table.assets_on(d(5)), vec![1, 2]);
}

/// Term whose input is itself once wired up
#[derive(Debug)]
struct Feedback {
    id: TermId,
    input: OnceLock<TermRef>,
}

impl Term for Feedback {
    fn id(&self) -> TermId {
        self.id
    }

    fn name(&self) -> String {
        "Feedback".to_string()
    }

    fn dtype(&self) -> DType {
        DType::Float64
    }

    fn inputs(&self) -> Vec<Input> {
        let mut inputs = vec![Input::from(BarField::Close)];
        inputs.extend(self.input.get().cloned().map(Input::Term));
        inputs
    }

    fn compute(
        &self,
        _ctx: &ComputeContext<'_>,
        _windows: &[Window<'_>],
        _out: OutputRow<'_>,
    ) -> Result<()> {
        Ok(())
    }
}

#[test]
fn test_cycle_fails_before_any_fetch() {
    init_logging();
    let fx = fixture();
    let feedback = Arc::new(Feedback {
        id: 9_000_001,
        input: OnceLock::new(),
    });
    let as_term: TermRef = feedback.clone();
    feedback.input.set(as_term.clone()).unwrap();

    let mut pipeline = Pipeline::new();
    pipeline.add(as_term, "feedback").unwrap();

    let err = fx.engine.run_pipeline(&pipeline, d(4), d(5)).unwrap_err();
    assert!(matches!(err, PipelineError::CyclicDependency { .. }));
    assert!(err.is_construction_error());
    assert!(!err.is_retryable());
    assert_eq!(fx.store.fetches(), 0);
}

#[test]
fn test_shared_term_evaluated_once() {
    init_logging();
    let fx = fixture();
    let avg = avg_close_3();
    let mut pipeline = Pipeline::new();
    pipeline.add(&avg, "avg").unwrap();
    pipeline.add(avg.gt(13.0), "above_13").unwrap();
    pipeline.add(avg.rank(true), "avg_rank").unwrap();
    pipeline.set_screen(avg.notnan());

    let (table, report) = fx
        .engine
        .run_pipeline_with_report(&pipeline, d(4), d(5))
        .unwrap();

    assert_eq!(fx.store.fetches(), 1);
    assert_eq!(report.bar_fetches, 1);
    assert_eq!(report.terms_evaluated, 4);
    assert_eq!(report.state, RequestState::Done);
    assert_eq!(
        table.filter_column("above_13").unwrap(),
        &[false, true, true, true]
    );
    assert_eq!(
        table.factor_column("avg_rank").unwrap(),
        &[Some(1.0), Some(2.0), Some(1.0), Some(2.0)]
    );
}

#[test]
fn test_equal_terms_with_distinct_identity_fetch_twice() {
    let fx = fixture();
    let mut pipeline = Pipeline::new();
    pipeline.add(avg_close_3(), "first").unwrap();
    pipeline.add(avg_close_3(), "second").unwrap();

    let table = fx.engine.run_pipeline(&pipeline, d(4), d(5)).unwrap();
    assert_eq!(fx.store.fetches(), 2);
    assert_eq!(table.column("first"), table.column("second"));
}

#[test]
fn test_row_count_matches_lifetimes_and_screen() {
    let mut finder = AssetFinder::new();
    finder
        .insert_assets(vec![
            Asset::equity(1, "A", "NYSE").with_lifetime(Some(d(3)), None),
            Asset::equity(2, "B", "NYSE").with_lifetime(None, Some(d(4))),
        ])
        .unwrap();
    let fx = fixture_with(CountingStore::new(two_asset_store()), finder);

    let close = Factor::from(Latest::new(BarField::Close));
    let mut pipeline = Pipeline::new();
    pipeline.add(&close, "close").unwrap();
    pipeline.set_screen(close.gt(11.0));

    let table = fx.engine.run_pipeline(&pipeline, d(2), d(5)).unwrap();
    // d2: A not listed, B 20 | d3: A 12, B 18 | d4: A 14, B 16 | d5: A 16, B delisted
    let expected = 1 + 2 + 2 + 1;
    assert_eq!(table.len(), expected);
    assert_eq!(table.dates(), vec![d(2), d(3), d(4), d(5)]);
}

#[test]
fn test_repeated_runs_are_byte_identical() {
    let fx = fixture();
    let avg = avg_close_3();
    let mut pipeline = Pipeline::new();
    pipeline.add(&avg, "avg").unwrap();
    pipeline.add(avg.zscore(), "avg_z").unwrap();
    pipeline
        .add(Factor::from(AverageDollarVolume::new(2)), "adv_2")
        .unwrap();

    let first = fx.engine.run_pipeline(&pipeline, d(4), d(5)).unwrap();
    let second = fx.engine.run_pipeline(&pipeline, d(4), d(5)).unwrap();
    assert_eq!(first.to_json().unwrap(), second.to_json().unwrap());

    let mut a = Vec::new();
    let mut b = Vec::new();
    first.to_csv(&mut a).unwrap();
    second.to_csv(&mut b).unwrap();
    assert_eq!(a, b);
}

#[test]
fn test_parallel_matches_sequential() {
    init_logging();
    let avg = avg_close_3();
    let returns = Factor::from(Returns::new(2));
    let adv = Factor::from(AverageDollarVolume::new(2));
    let mut pipeline = Pipeline::new();
    pipeline.add(&avg, "avg").unwrap();
    pipeline.add(&returns, "returns").unwrap();
    pipeline.add(&adv / &avg, "ratio").unwrap();
    pipeline.add(returns.demean(), "returns_demeaned").unwrap();
    pipeline.set_screen(adv.top(1) | avg.gt(15.0));

    let sequential = fixture()
        .engine
        .run_pipeline(&pipeline, d(4), d(5))
        .unwrap();
    let parallel = fixture()
        .engine
        .with_config(EngineConfig::parallel(Some(3)))
        .unwrap()
        .run_pipeline(&pipeline, d(4), d(5))
        .unwrap();

    assert_eq!(sequential, parallel);
    assert!(!sequential.is_empty());
}

#[test]
fn test_cancelled_before_start() {
    let fx = fixture();
    let mut pipeline = Pipeline::new();
    pipeline.add(avg_close_3(), "avg").unwrap();

    let token = CancellationToken::new();
    token.cancel();
    let err = fx
        .engine
        .run_pipeline_with_cancel(&pipeline, d(4), d(5), &token)
        .unwrap_err();
    assert!(matches!(err, PipelineError::Cancelled));
    assert_eq!(fx.store.fetches(), 0);
}

#[test]
fn test_cancelled_during_fetch_stops_remaining_terms() {
    init_logging();
    let token = CancellationToken::new();
    let fx = fixture_with(
        CountingStore::cancelling(two_asset_store(), token.clone()),
        two_asset_finder(),
    );
    let mut pipeline = Pipeline::new();
    pipeline.add(avg_close_3(), "avg").unwrap();
    pipeline
        .add(Factor::from(Latest::new(BarField::Volume)), "volume")
        .unwrap();

    let result = fx
        .engine
        .run_pipeline_with_cancel(&pipeline, d(4), d(5), &token);
    assert!(matches!(result, Err(PipelineError::Cancelled)));
    assert_eq!(fx.store.fetches(), 1);
}

#[test]
fn test_parallel_cancel_during_fetch() {
    init_logging();
    let token = CancellationToken::new();
    let fx = fixture_with(
        CountingStore::cancelling(two_asset_store(), token.clone()),
        two_asset_finder(),
    );
    let engine = fx
        .engine
        .with_config(EngineConfig::parallel(Some(2)))
        .unwrap();
    let avg = avg_close_3();
    let mut pipeline = Pipeline::new();
    pipeline.add(&avg, "avg").unwrap();
    pipeline
        .add(Factor::from(Latest::new(BarField::Volume)), "volume")
        .unwrap();
    pipeline.set_screen(avg.gt(13.0));

    let result = engine.run_pipeline_with_cancel(&pipeline, d(4), d(5), &token);
    assert!(matches!(result, Err(PipelineError::Cancelled)));
    // both leaves may have started before the token fired, nothing after them
    let fetches = fx.store.fetches();
    assert!((1..=2).contains(&fetches), "{} fetches", fetches);
}

#[test]
fn test_parallel_cancelled_before_start() {
    let fx = fixture();
    let engine = fx
        .engine
        .with_config(EngineConfig::parallel(Some(2)))
        .unwrap();
    let mut pipeline = Pipeline::new();
    pipeline.add(avg_close_3(), "avg").unwrap();

    let token = CancellationToken::new();
    token.cancel();
    let result = engine.run_pipeline_with_cancel(&pipeline, d(4), d(5), &token);
    assert!(matches!(result, Err(PipelineError::Cancelled)));
    assert_eq!(fx.store.fetches(), 0);
}

#[test]
fn test_parallel_collaborator_failure_returns_no_table() {
    let fx = fixture();
    let engine = fx
        .engine
        .with_config(EngineConfig::parallel(Some(2)))
        .unwrap();
    let mut pipeline = Pipeline::new();
    pipeline.add(avg_close_3(), "avg").unwrap();
    pipeline
        .add(Factor::from(Latest::new("dividend")), "dividend")
        .unwrap();

    let err = engine.run_pipeline(&pipeline, d(4), d(5)).unwrap_err();
    assert!(err.is_data_error());
    match err {
        PipelineError::DataUnavailable { field, .. } => assert_eq!(field, "dividend"),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_registry_outside_coverage() {
    let finder = two_asset_finder().with_coverage(d(4), d(5));
    let fx = fixture_with(CountingStore::new(two_asset_store()), finder);
    let mut pipeline = Pipeline::new();
    pipeline.add(avg_close_3(), "avg").unwrap();

    // The look-back extends the range to the 2nd
    let err = fx.engine.run_pipeline(&pipeline, d(4), d(5)).unwrap_err();
    assert!(matches!(err, PipelineError::RegistryUnavailable { .. }));
    assert_eq!(fx.store.fetches(), 0);

    // Latest needs no look-back, so the same range is answerable
    let mut latest = Pipeline::new();
    latest
        .add(Factor::from(Latest::new(BarField::Close)), "close")
        .unwrap();
    assert_eq!(fx.engine.run_pipeline(&latest, d(4), d(5)).unwrap().len(), 4);
}

#[test]
fn test_unknown_field_is_data_unavailable() {
    let fx = fixture();
    let mut pipeline = Pipeline::new();
    pipeline
        .add(Factor::from(Latest::new("dividend")), "dividend")
        .unwrap();

    let err = fx.engine.run_pipeline(&pipeline, d(4), d(5)).unwrap_err();
    match err {
        PipelineError::DataUnavailable { field, .. } => assert_eq!(field, "dividend"),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_missing_values_are_undefined_cells() {
    let mut store = two_asset_store();
    store
        .insert_series("close", 3, vec![f64::NAN, f64::NAN, f64::NAN, 30.0])
        .unwrap();
    let mut finder = two_asset_finder();
    finder.insert_asset(Asset::equity(3, "C", "NYSE")).unwrap();
    let fx = fixture_with(CountingStore::new(store), finder);

    let mut pipeline = Pipeline::new();
    pipeline.add(avg_close_3(), "avg").unwrap();

    let table = fx.engine.run_pipeline(&pipeline, d(4), d(5)).unwrap();
    assert_eq!(table.len(), 6);
    // all-missing window: row kept, value undefined
    assert_eq!(table.get(d(4), 3, "avg").unwrap().as_f64(), None);
    // partially missing window: missing values are ignored
    assert_eq!(table.get(d(5), 3, "avg").unwrap().as_f64(), Some(30.0));
}

#[test]
fn test_duplicate_name_rejected() {
    let mut pipeline = Pipeline::new();
    pipeline.add(avg_close_3(), "avg").unwrap();
    let err = pipeline.add(avg_close_3(), "avg").unwrap_err();
    assert!(matches!(err, PipelineError::DuplicateName { .. }));
    assert!(err.is_construction_error());
}

#[test]
fn test_custom_factor_and_filter_kernels() {
    let fx = fixture();
    let spread = Factor::custom(
        "CloseSpread",
        vec![Input::from(BarField::Close)],
        2,
        |_ctx, windows, out| {
            let closes = windows[0].floats()?;
            for (col, value) in out.iter_mut().enumerate() {
                *value = closes.get(1, col) - closes.get(0, col);
            }
            Ok(())
        },
    );
    let only_a = Filter::custom("OnlyA", Vec::new(), 1, |ctx, _windows, out| {
        for (slot, asset) in out.iter_mut().zip(ctx.assets) {
            *slot = *asset == 1;
        }
        Ok(())
    });

    let mut pipeline = Pipeline::new();
    pipeline.add(&spread, "spread").unwrap();
    pipeline.set_screen(only_a);

    let table = fx.engine.run_pipeline(&pipeline, d(3), d(5)).unwrap();
    assert_eq!(table.len(), 3);
    assert!(table
        .factor_column("spread")
        .unwrap()
        .iter()
        .all(|v| *v == Some(2.0)));
}

#[test]
fn test_csv_end_to_end() -> anyhow::Result<()> {
    init_logging();
    let mut file = tempfile::NamedTempFile::new()?;
    writeln!(file, "date,sid,open,high,low,close,volume")?;
    for (i, day) in [2, 3, 4, 5].iter().enumerate() {
        let close = 10.0 + 2.0 * i as f64;
        writeln!(file, "2024-01-0{day},1,{close},{close},{close},{close},1000")?;
        let close = 20.0 - 2.0 * i as f64;
        writeln!(file, "2024-01-0{day},2,{close},{close},{close},{close},500")?;
    }
    file.flush()?;

    let store = CsvBarLoader::new().load_path(file.path())?;
    let mut finder = AssetFinder::new();
    for sid in store.assets() {
        finder.insert_asset(Asset::equity(sid, format!("SID{sid}"), "NYSE"))?;
    }
    let calendar = SessionCalendar::new(store.sessions().to_vec());
    let engine = PipelineEngine::new(Arc::new(calendar), Arc::new(store), Arc::new(finder));

    let avg = avg_close_3();
    let mut pipeline = Pipeline::new();
    pipeline.add(&avg, "avg_close_3")?;
    pipeline.set_screen(avg.gt(13.0));
    let table = engine.run_pipeline(&pipeline, d(4), d(5))?;

    let mut csv = Vec::new();
    table.to_csv(&mut csv)?;
    let csv = String::from_utf8(csv)?;
    assert_eq!(
        csv,
        "date,asset,avg_close_3\n2024-01-04,2,18\n2024-01-05,1,14\n2024-01-05,2,16\n"
    );
    Ok(())
}

#[test]
fn test_show_graph_exports() {
    let avg = avg_close_3();
    let mut pipeline = Pipeline::new();
    pipeline.add(&avg, "mean_close_15").unwrap();
    pipeline.set_screen(Factor::from(AverageDollarVolume::new(60)).top(10));

    let dump = pipeline.show_graph().unwrap();
    assert_eq!(dump.nodes.len(), 3);
    assert_eq!(dump.edges.len(), 1);
    let dot = dump.to_dot();
    assert!(dot.starts_with("digraph pipeline"));
    assert!(dot.contains("mean_close_15"));

    let json: serde_json::Value = serde_json::from_str(&dump.to_json().unwrap()).unwrap();
    assert_eq!(json["nodes"].as_array().unwrap().len(), 3);
}

#[test]
fn test_result_json_shape() {
    let fx = fixture();
    let avg = avg_close_3();
    let mut pipeline = Pipeline::new();
    pipeline.add(&avg, "avg").unwrap();
    pipeline.add(avg.gt(13.0), "above").unwrap();

    let table = fx.engine.run_pipeline(&pipeline, d(5), d(5)).unwrap();
    assert!(matches!(table.column("above"), Some(ColumnData::Filter(_))));

    let json: serde_json::Value = serde_json::from_str(&table.to_json().unwrap()).unwrap();
    assert_eq!(json["rows"].as_array().unwrap().len(), 2);
    assert_eq!(json["columns"][0]["name"], "avg");
    assert_eq!(json["columns"][0]["data"]["kind"], "factor");
}
