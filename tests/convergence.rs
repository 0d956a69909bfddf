//! Convergence coordinator against a live mock engine

mod common;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{fast_session_config, sample_dsp_config, MockEngine};
use dsp_remote::convergence::{Coordinator, SyncStatus};
use dsp_remote::error::{Error, PersistenceError};
use dsp_remote::persistence::{MemoryStore, PersistenceStore};
use dsp_remote::protocol::DspConfig;
use dsp_remote::session::Session;
use dsp_remote::Result;

const DEBOUNCE: Duration = Duration::from_millis(60);

struct Fixture {
    engine: MockEngine,
    session: Arc<Session>,
    store: Arc<MemoryStore>,
    coordinator: Coordinator,
}

async fn fixture() -> Fixture {
    let engine = MockEngine::start().await;
    let session = Session::new(fast_session_config());
    session.connect(&engine.endpoints()).await.unwrap();

    let store = Arc::new(MemoryStore::new());
    let coordinator = Coordinator::new(
        session.clone(),
        Some(store.clone() as Arc<dyn PersistenceStore>),
        DEBOUNCE,
    );
    coordinator.load().await.unwrap();

    Fixture {
        engine,
        session,
        store,
        coordinator,
    }
}

/// Store that is down: every write fails
#[derive(Default)]
struct UnavailableStore {
    writes: AtomicUsize,
}

impl PersistenceStore for UnavailableStore {
    fn get_recovery(&self) -> BoxFuture<'_, Result<Option<DspConfig>>> {
        async { Ok(None) }.boxed()
    }

    fn put_recovery<'a>(&'a self, _config: &'a DspConfig) -> BoxFuture<'a, Result<()>> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        async { Err(Error::from(PersistenceError::Status(503))) }.boxed()
    }

    fn get_preset<'a>(&'a self, _name: &'a str) -> BoxFuture<'a, Result<Option<DspConfig>>> {
        async { Ok(None) }.boxed()
    }

    fn put_preset<'a>(&'a self, _name: &'a str, _config: &'a DspConfig) -> BoxFuture<'a, Result<()>> {
        async { Err(Error::from(PersistenceError::Status(503))) }.boxed()
    }

    fn list_presets(&self) -> BoxFuture<'_, Result<Vec<String>>> {
        async { Ok(Vec::new()) }.boxed()
    }
}

fn set_gain(config: &mut DspConfig, gain: f64) {
    if let Some(filter) = config.filters.get_mut("bass") {
        filter.set_parameter("gain", gain);
    }
}

fn engine_gain(engine: &MockEngine) -> Option<f64> {
    engine.config()["filters"]["bass"]["parameters"]["gain"].as_f64()
}

#[tokio::test]
async fn test_load_derives_view() {
    let f = fixture().await;
    let state = f.coordinator.state();
    assert_eq!(state.status, SyncStatus::InSync);
    assert!(!state.pending);
    assert_eq!(state.view.steps, 2);
    assert_eq!(state.view.bands.len(), 2);
    assert_eq!(state.view.band("bass").unwrap().gain, Some(3.0));
    assert_eq!(f.coordinator.working_copy(), Some(sample_dsp_config()));
}

#[tokio::test]
async fn test_burst_of_edits_commits_once() {
    let f = fixture().await;

    for step in 1..=5 {
        f.coordinator
            .apply_local_edit(|config| set_gain(config, step as f64))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Optimistic: visible before anything reaches the engine
    let state = f.coordinator.state();
    assert_eq!(state.status, SyncStatus::Pending);
    assert!(state.pending);
    assert_eq!(state.view.band("bass").unwrap().gain, Some(5.0));
    assert_eq!(f.engine.count("SetConfigJson"), 0);

    tokio::time::sleep(DEBOUNCE * 5).await;

    assert_eq!(f.engine.count("SetConfigJson"), 1);
    assert_eq!(engine_gain(&f.engine), Some(5.0));
    let state = f.coordinator.state();
    assert_eq!(state.status, SyncStatus::InSync);
    assert!(!state.pending);
}

#[tokio::test]
async fn test_commit_now_flushes_without_waiting() {
    let f = fixture().await;
    f.coordinator
        .apply_local_edit(|config| set_gain(config, -4.0))
        .unwrap();
    f.coordinator.commit_now().await.unwrap();

    assert_eq!(engine_gain(&f.engine), Some(-4.0));
    assert_eq!(f.coordinator.state().status, SyncStatus::InSync);

    // The debounce timer was superseded
    tokio::time::sleep(DEBOUNCE * 3).await;
    assert_eq!(f.engine.count("SetConfigJson"), 1);
}

#[tokio::test]
async fn test_confirmed_snapshot_replaces_working_copy() {
    let f = fixture().await;
    f.engine.set_normalize(true);

    f.coordinator
        .apply_local_edit(|config| set_gain(config, 1.5))
        .unwrap();
    f.coordinator.commit_now().await.unwrap();

    let working = f.coordinator.working_copy().unwrap();
    assert_eq!(working.title.as_deref(), Some("engine"));
    assert_eq!(Some(working.clone()), f.coordinator.confirmed());
    assert_eq!(Some(working), f.session.confirmed_config());
}

#[tokio::test]
async fn test_cancel_pending_reverts() {
    let f = fixture().await;
    f.coordinator
        .apply_local_edit(|config| set_gain(config, 9.0))
        .unwrap();
    f.coordinator.cancel_pending();

    let state = f.coordinator.state();
    assert_eq!(state.status, SyncStatus::InSync);
    assert!(!state.pending);
    assert_eq!(state.view.band("bass").unwrap().gain, Some(3.0));

    tokio::time::sleep(DEBOUNCE * 3).await;
    assert_eq!(f.engine.count("SetConfigJson"), 0);
}

#[tokio::test]
async fn test_rejected_commit_resyncs_to_engine() {
    let f = fixture().await;
    f.engine.reject("SetConfigJson");

    f.coordinator
        .apply_local_edit(|config| set_gain(config, 12.0))
        .unwrap();
    let err = f.coordinator.commit_now().await.unwrap_err();
    assert!(matches!(err, Error::Rejected { .. }));

    let state = f.coordinator.state();
    assert!(matches!(state.status, SyncStatus::Resynced(_)));
    assert!(!state.pending);
    assert_eq!(state.view.band("bass").unwrap().gain, Some(3.0));
    assert_eq!(f.coordinator.working_copy(), Some(sample_dsp_config()));
}

#[tokio::test]
async fn test_failed_resync_keeps_local_edits() {
    let f = fixture().await;
    f.engine.silence("SetConfigJson");
    f.engine.silence("GetConfigJson");

    f.coordinator
        .apply_local_edit(|config| set_gain(config, 7.0))
        .unwrap();
    let err = f.coordinator.commit_now().await.unwrap_err();
    assert!(err.is_timeout());

    let state = f.coordinator.state();
    assert!(matches!(state.status, SyncStatus::Failed(_)));
    assert!(state.pending);
    assert_eq!(state.view.band("bass").unwrap().gain, Some(7.0));

    // Next successful round trip converges
    f.engine.clear_faults();
    f.coordinator.commit_now().await.unwrap();
    assert_eq!(engine_gain(&f.engine), Some(7.0));
    assert_eq!(f.coordinator.state().status, SyncStatus::InSync);
}

#[tokio::test]
async fn test_edits_during_commit_are_kept() {
    let f = fixture().await;
    f.engine.delay("SetConfigJson", Duration::from_millis(100));

    f.coordinator
        .apply_local_edit(|config| set_gain(config, 1.0))
        .unwrap();
    let committing = {
        let coordinator = f.coordinator.clone();
        tokio::spawn(async move { coordinator.commit_now().await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(f.coordinator.state().status, SyncStatus::Committing);

    f.coordinator
        .apply_local_edit(|config| set_gain(config, 2.0))
        .unwrap();
    committing.await.unwrap().unwrap();

    // First commit landed but did not clobber the newer edit
    assert_eq!(f.coordinator.confirmed().unwrap().filters["bass"].parameter("gain"), Some(1.0));
    assert_eq!(
        f.coordinator.working_copy().unwrap().filters["bass"].parameter("gain"),
        Some(2.0)
    );

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(engine_gain(&f.engine), Some(2.0));
    assert_eq!(f.engine.count("SetConfigJson"), 2);
    assert_eq!(f.coordinator.state().status, SyncStatus::InSync);
}

#[tokio::test]
async fn test_write_through_after_commit() {
    let f = fixture().await;
    f.coordinator
        .apply_local_edit(|config| set_gain(config, 2.5))
        .unwrap();
    f.coordinator.commit_now().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let recovery = f.store.get_recovery().await.unwrap().unwrap();
    assert_eq!(Some(recovery), f.coordinator.confirmed());
}

#[tokio::test]
async fn test_failed_write_through_leaves_commit_alone() {
    let engine = MockEngine::start().await;
    let session = Session::new(fast_session_config());
    session.connect(&engine.endpoints()).await.unwrap();
    let store = Arc::new(UnavailableStore::default());
    let coordinator = Coordinator::new(
        session,
        Some(store.clone() as Arc<dyn PersistenceStore>),
        DEBOUNCE,
    );
    coordinator.load().await.unwrap();

    coordinator
        .apply_local_edit(|config| set_gain(config, 4.5))
        .unwrap();
    coordinator.commit_now().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(store.writes.load(Ordering::SeqCst), 1);
    assert_eq!(engine_gain(&engine), Some(4.5));

    let state = coordinator.state();
    assert_eq!(state.status, SyncStatus::InSync);
    assert!(!state.pending);
    assert_eq!(state.view.band("bass").unwrap().gain, Some(4.5));
    assert_eq!(coordinator.working_copy(), coordinator.confirmed());
}

#[tokio::test]
async fn test_presets_round_trip_through_engine() {
    let f = fixture().await;
    f.coordinator.save_preset("flat").await.unwrap();

    f.coordinator
        .apply_local_edit(|config| set_gain(config, 10.0))
        .unwrap();
    f.coordinator.commit_now().await.unwrap();
    assert_eq!(engine_gain(&f.engine), Some(10.0));

    f.coordinator.load_preset("flat").await.unwrap();
    assert_eq!(engine_gain(&f.engine), Some(3.0));
    assert_eq!(f.coordinator.list_presets().await.unwrap(), vec!["flat"]);

    let err = f.coordinator.load_preset("missing").await.unwrap_err();
    assert!(matches!(
        err,
        Error::Persistence(PersistenceError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_resync_discards_local_edits() {
    let f = fixture().await;
    f.coordinator
        .apply_local_edit(|config| set_gain(config, -9.0))
        .unwrap();
    f.coordinator.resync().await.unwrap();

    assert_eq!(f.coordinator.working_copy(), Some(sample_dsp_config()));
    tokio::time::sleep(DEBOUNCE * 3).await;
    assert_eq!(f.engine.count("SetConfigJson"), 0);
}

#[tokio::test]
async fn test_edit_before_load_and_missing_store() {
    let engine = MockEngine::start().await;
    let session = Session::new(fast_session_config());
    session.connect(&engine.endpoints()).await.unwrap();
    let coordinator = Coordinator::new(session, None, DEBOUNCE);

    let err = coordinator
        .apply_local_edit(|config| set_gain(config, 1.0))
        .unwrap_err();
    assert!(matches!(err, Error::NotConnected));

    let err = coordinator.list_presets().await.unwrap_err();
    assert!(matches!(
        err,
        Error::Persistence(PersistenceError::Unavailable)
    ));
}
