//! Shared fixtures for integration tests

#![allow(dead_code)]

use chrono::NaiveDate;
use rusty_pipeline::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn d(day: u32) -> Date {
    NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
}

/// Four sessions, 2nd to 5th of January
pub fn sessions() -> Vec<Date> {
    vec![d(2), d(3), d(4), d(5)]
}

/// Bar store wrapper counting `fetch` calls
pub struct CountingStore {
    inner: InMemoryBarStore,
    fetches: AtomicUsize,
    cancel_on_fetch: Option<CancellationToken>,
}

impl CountingStore {
    pub fn new(inner: InMemoryBarStore) -> Self {
        Self {
            inner,
            fetches: AtomicUsize::new(0),
            cancel_on_fetch: None,
        }
    }

    /// Fire `token` as soon as the first fetch starts
    pub fn cancelling(inner: InMemoryBarStore, token: CancellationToken) -> Self {
        Self {
            cancel_on_fetch: Some(token),
            ..Self::new(inner)
        }
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl BarStore for CountingStore {
    fn fetch(
        &self,
        assets: &Arc<AssetIndex>,
        field: &str,
        end_date: Date,
        bar_count: usize,
        frequency: Frequency,
    ) -> Result<LabeledMatrix<f64>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(token) = &self.cancel_on_fetch {
            token.cancel();
        }
        self.inner
            .fetch(assets, field, end_date, bar_count, frequency)
    }

    fn first_session(&self) -> Option<Date> {
        self.inner.first_session()
    }
}

/// Closes A:[10,12,14,16], B:[20,18,16,14] over [`sessions`]
pub fn two_asset_store() -> InMemoryBarStore {
    let mut store = InMemoryBarStore::new(sessions());
    store
        .insert_series("close", 1, vec![10.0, 12.0, 14.0, 16.0])
        .unwrap();
    store
        .insert_series("close", 2, vec![20.0, 18.0, 16.0, 14.0])
        .unwrap();
    store
        .insert_series("volume", 1, vec![1000.0, 1100.0, 1200.0, 1300.0])
        .unwrap();
    store
        .insert_series("volume", 2, vec![500.0, 400.0, 300.0, 200.0])
        .unwrap();
    store
}

pub fn two_asset_finder() -> AssetFinder {
    let mut finder = AssetFinder::new();
    finder
        .insert_assets(vec![
            Asset::equity(1, "A", "NYSE"),
            Asset::equity(2, "B", "NYSE"),
        ])
        .unwrap();
    finder
}

pub struct Fixture {
    pub engine: PipelineEngine,
    pub store: Arc<CountingStore>,
}

pub fn fixture_with(store: CountingStore, finder: AssetFinder) -> Fixture {
    let store = Arc::new(store);
    let engine = PipelineEngine::new(
        Arc::new(SessionCalendar::new(sessions())),
        store.clone(),
        Arc::new(finder),
    );
    Fixture { engine, store }
}

pub fn fixture() -> Fixture {
    fixture_with(CountingStore::new(two_asset_store()), two_asset_finder())
}
