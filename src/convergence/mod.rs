//! Convergence coordinator
//!
//! Keeps an optimistic working copy of the engine configuration for the
//! editor. Edits apply to the working copy at once and are coalesced into a
//! single commit after a short quiet period. Whatever the engine confirms
//! replaces the working copy; on failure the coordinator reads engine truth
//! back before giving up.

pub mod view;

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{Error, PersistenceError, Result};
use crate::persistence::PersistenceStore;
use crate::protocol::DspConfig;
use crate::session::Session;

pub use view::{Band, EqView};

/// Where the working copy stands relative to the engine
#[derive(Debug, Clone, PartialEq)]
pub enum SyncStatus {
    /// Working copy equals the last confirmed snapshot
    InSync,
    /// Local edits waiting for the debounce window
    Pending,
    /// A commit is on the wire
    Committing,
    /// A commit failed and engine truth was read back
    Resynced(String),
    /// A commit failed and so did the read-back; local edits are kept
    Failed(String),
}

/// Snapshot published to the editor on every change
#[derive(Debug, Clone, PartialEq)]
pub struct EditState {
    pub view: EqView,
    pub status: SyncStatus,
    /// Whether the working copy holds uncommitted edits
    pub pending: bool,
}

impl Default for EditState {
    fn default() -> Self {
        Self {
            view: EqView::default(),
            status: SyncStatus::InSync,
            pending: false,
        }
    }
}

struct EditInner {
    working: Option<DspConfig>,
    confirmed: Option<DspConfig>,
    dirty: bool,
    status: SyncStatus,
    /// Bumped by every edit; lets a commit notice edits made while it ran
    edit_seq: u64,
    /// Bumped by every edit, flush and cancel; a debounce timer only fires
    /// if it still matches
    timer_generation: u64,
}

struct Shared {
    session: Arc<Session>,
    store: Option<Arc<dyn PersistenceStore>>,
    debounce: Duration,
    inner: Mutex<EditInner>,
    /// Serializes commits
    commit_lock: tokio::sync::Mutex<()>,
    state: watch::Sender<EditState>,
}

/// Editor-side owner of the working copy
#[derive(Clone)]
pub struct Coordinator {
    shared: Arc<Shared>,
}

impl Coordinator {
    pub fn new(
        session: Arc<Session>,
        store: Option<Arc<dyn PersistenceStore>>,
        debounce: Duration,
    ) -> Self {
        let (state, _) = watch::channel(EditState::default());
        Self {
            shared: Arc::new(Shared {
                session,
                store,
                debounce,
                inner: Mutex::new(EditInner {
                    working: None,
                    confirmed: None,
                    dirty: false,
                    status: SyncStatus::InSync,
                    edit_seq: 0,
                    timer_generation: 0,
                }),
                commit_lock: tokio::sync::Mutex::new(()),
                state,
            }),
        }
    }

    /// Seed the working copy from the session's confirmed snapshot, reading
    /// it from the engine if none is cached.
    pub async fn load(&self) -> Result<()> {
        let confirmed = match self.shared.session.confirmed_config() {
            Some(config) => config,
            None => self.shared.session.get_config().await?,
        };
        self.adopt(confirmed);
        Ok(())
    }

    /// Replace the working copy with engine truth, dropping local edits
    pub async fn resync(&self) -> Result<()> {
        let truth = self.shared.session.get_config().await?;
        self.adopt(truth);
        info!("Working copy resynchronized with engine");
        Ok(())
    }

    /// Mutate the working copy and schedule a debounced commit.
    ///
    /// Fails with [`Error::NotConnected`] before the first successful load.
    pub fn apply_local_edit<F>(&self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut DspConfig),
    {
        let generation = {
            let mut inner = self.shared.inner.lock();
            let working = inner.working.as_mut().ok_or(Error::NotConnected)?;
            mutate(working);
            inner.dirty = true;
            inner.edit_seq += 1;
            inner.timer_generation += 1;
            if inner.status != SyncStatus::Committing {
                inner.status = SyncStatus::Pending;
            }
            inner.timer_generation
        };
        self.publish();

        let coordinator = self.clone();
        let debounce = self.shared.debounce;
        tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            if coordinator.shared.inner.lock().timer_generation != generation {
                return;
            }
            if let Err(e) = coordinator.commit().await {
                debug!("Debounced commit failed: {}", e);
            }
        });
        Ok(())
    }

    /// Commit pending edits immediately instead of waiting for the window
    pub async fn commit_now(&self) -> Result<()> {
        self.shared.inner.lock().timer_generation += 1;
        self.commit().await
    }

    /// Drop the scheduled commit and revert the working copy to the last
    /// confirmed snapshot.
    pub fn cancel_pending(&self) {
        {
            let mut inner = self.shared.inner.lock();
            inner.timer_generation += 1;
            if !inner.dirty {
                return;
            }
            inner.working = inner.confirmed.clone();
            inner.dirty = false;
            if inner.status != SyncStatus::Committing {
                inner.status = SyncStatus::InSync;
            }
        }
        debug!("Pending edits discarded");
        self.publish();
    }

    pub fn subscribe(&self) -> watch::Receiver<EditState> {
        self.shared.state.subscribe()
    }

    pub fn state(&self) -> EditState {
        self.shared.state.borrow().clone()
    }

    pub fn working_copy(&self) -> Option<DspConfig> {
        self.shared.inner.lock().working.clone()
    }

    pub fn confirmed(&self) -> Option<DspConfig> {
        self.shared.inner.lock().confirmed.clone()
    }

    /// Store the confirmed snapshot under `name`
    pub async fn save_preset(&self, name: &str) -> Result<()> {
        let store = self.store()?;
        let confirmed = self.confirmed().ok_or(Error::NotConnected)?;
        store.put_preset(name, &confirmed).await?;
        info!("Saved preset '{}'", name);
        Ok(())
    }

    /// Fetch a preset and commit it through the normal edit path
    pub async fn load_preset(&self, name: &str) -> Result<()> {
        let store = self.store()?;
        let preset = store
            .get_preset(name)
            .await?
            .ok_or_else(|| PersistenceError::NotFound(name.to_string()))?;

        self.apply_local_edit(move |working| *working = preset)?;
        self.commit_now().await?;
        info!("Loaded preset '{}'", name);
        Ok(())
    }

    pub async fn list_presets(&self) -> Result<Vec<String>> {
        self.store()?.list_presets().await
    }

    fn store(&self) -> Result<Arc<dyn PersistenceStore>> {
        self.shared
            .store
            .clone()
            .ok_or_else(|| PersistenceError::Unavailable.into())
    }

    async fn commit(&self) -> Result<()> {
        let _serial = self.shared.commit_lock.lock().await;

        let (snapshot, seq) = {
            let mut inner = self.shared.inner.lock();
            let Some(working) = inner.working.clone().filter(|_| inner.dirty) else {
                return Ok(());
            };
            inner.status = SyncStatus::Committing;
            (working, inner.edit_seq)
        };
        self.publish();
        debug!("Committing working copy");

        match self.shared.session.set_config(&snapshot).await {
            Ok(confirmed) => {
                {
                    let mut inner = self.shared.inner.lock();
                    inner.confirmed = Some(confirmed.clone());
                    if inner.edit_seq == seq {
                        inner.working = Some(confirmed.clone());
                        inner.dirty = false;
                        inner.status = SyncStatus::InSync;
                    } else {
                        // Newer edits arrived mid-commit; their timer commits them
                        inner.status = SyncStatus::Pending;
                    }
                }
                self.publish();
                self.write_through(confirmed);
                Ok(())
            }
            Err(e) => {
                warn!("Commit failed, reading engine state back: {}", e);
                match self.shared.session.get_config().await {
                    Ok(truth) => {
                        let mut inner = self.shared.inner.lock();
                        inner.confirmed = Some(truth.clone());
                        if inner.edit_seq == seq {
                            inner.working = Some(truth);
                            inner.dirty = false;
                        }
                        inner.status = SyncStatus::Resynced(e.to_string());
                    }
                    Err(read_err) => {
                        warn!("Read-back failed, keeping local edits: {}", read_err);
                        let mut inner = self.shared.inner.lock();
                        inner.status = SyncStatus::Failed(e.to_string());
                    }
                }
                self.publish();
                Err(e)
            }
        }
    }

    fn adopt(&self, confirmed: DspConfig) {
        {
            let mut inner = self.shared.inner.lock();
            inner.timer_generation += 1;
            inner.working = Some(confirmed.clone());
            inner.confirmed = Some(confirmed);
            inner.dirty = false;
            inner.status = SyncStatus::InSync;
        }
        self.publish();
    }

    fn publish(&self) {
        let state = {
            let inner = self.shared.inner.lock();
            EditState {
                view: inner
                    .working
                    .as_ref()
                    .map(EqView::from_config)
                    .unwrap_or_default(),
                status: inner.status.clone(),
                pending: inner.dirty,
            }
        };
        self.shared.state.send_replace(state);
    }

    fn write_through(&self, confirmed: DspConfig) {
        let Some(store) = self.shared.store.clone() else {
            return;
        };
        tokio::spawn(async move {
            match store.put_recovery(&confirmed).await {
                Ok(()) => debug!("Recovery snapshot stored"),
                Err(e) => warn!("Recovery write-through failed: {}", e),
            }
        });
    }
}
