//! Persistence collaborator
//!
//! Best-effort storage for the recovery snapshot and named presets. Nothing
//! here is on the critical path: callers log failures and carry on.

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::PersistenceConfig;
use crate::error::{PersistenceError, Result};
use crate::protocol::DspConfig;

/// Document store for recovery and preset snapshots
pub trait PersistenceStore: Send + Sync {
    /// Last snapshot written through after a successful commit
    fn get_recovery(&self) -> BoxFuture<'_, Result<Option<DspConfig>>>;

    fn put_recovery<'a>(&'a self, config: &'a DspConfig) -> BoxFuture<'a, Result<()>>;

    fn get_preset<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Option<DspConfig>>>;

    fn put_preset<'a>(&'a self, name: &'a str, config: &'a DspConfig) -> BoxFuture<'a, Result<()>>;

    /// Preset names, sorted
    fn list_presets(&self) -> BoxFuture<'_, Result<Vec<String>>>;
}

/// Build the store named by the configuration
pub fn from_config(config: &PersistenceConfig) -> Result<Arc<dyn PersistenceStore>> {
    match &config.base_url {
        Some(base) => {
            info!("Using persistence store at {}", base);
            Ok(Arc::new(HttpStore::new(
                base,
                Duration::from_millis(config.timeout_ms),
            )?))
        }
        None => {
            info!("No persistence store configured, keeping documents in memory");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

/// HTTP adapter: `{base}/api/recovery`, `{base}/api/presets[/{name}]`
pub struct HttpStore {
    client: reqwest::Client,
    base: Url,
}

impl HttpStore {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base = Url::parse(base_url)
            .map_err(|e| PersistenceError::Request(format!("{}: {}", base_url, e)))?;
        if base.cannot_be_a_base() {
            return Err(PersistenceError::Request(format!("{} cannot be a base URL", base_url)).into());
        }

        let client = reqwest::Client::builder()
            .user_agent(concat!("dsp-remote/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| PersistenceError::Request(e.to_string()))?;

        Ok(Self { client, base })
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| PersistenceError::Request(format!("{} cannot be a base URL", self.base)))?;
            path.pop_if_empty();
            path.extend(segments);
        }
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<Option<T>> {
        debug!("GET {}", url);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| PersistenceError::Request(e.to_string()))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(PersistenceError::Status(response.status().as_u16()).into());
        }

        let document = response
            .json::<T>()
            .await
            .map_err(|e| PersistenceError::Document(e.to_string()))?;
        Ok(Some(document))
    }

    async fn preset_names(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .get_json(self.url(&["api", "presets"])?)
            .await?
            .unwrap_or_default();
        names.sort();
        Ok(names)
    }

    async fn put_json(&self, url: Url, config: &DspConfig) -> Result<()> {
        debug!("PUT {}", url);
        let response = self
            .client
            .put(url)
            .json(config)
            .send()
            .await
            .map_err(|e| PersistenceError::Request(e.to_string()))?;

        if !response.status().is_success() {
            return Err(PersistenceError::Status(response.status().as_u16()).into());
        }
        Ok(())
    }
}

impl PersistenceStore for HttpStore {
    fn get_recovery(&self) -> BoxFuture<'_, Result<Option<DspConfig>>> {
        async move { self.get_json(self.url(&["api", "recovery"])?).await }.boxed()
    }

    fn put_recovery<'a>(&'a self, config: &'a DspConfig) -> BoxFuture<'a, Result<()>> {
        async move { self.put_json(self.url(&["api", "recovery"])?, config).await }.boxed()
    }

    fn get_preset<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Option<DspConfig>>> {
        async move { self.get_json(self.url(&["api", "presets", name])?).await }.boxed()
    }

    fn put_preset<'a>(&'a self, name: &'a str, config: &'a DspConfig) -> BoxFuture<'a, Result<()>> {
        async move { self.put_json(self.url(&["api", "presets", name])?, config).await }.boxed()
    }

    fn list_presets(&self) -> BoxFuture<'_, Result<Vec<String>>> {
        self.preset_names().boxed()
    }
}

#[derive(Default)]
struct MemoryDocuments {
    recovery: Option<DspConfig>,
    presets: BTreeMap<String, DspConfig>,
}

/// In-process store
#[derive(Default)]
pub struct MemoryStore {
    documents: Mutex<MemoryDocuments>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistenceStore for MemoryStore {
    fn get_recovery(&self) -> BoxFuture<'_, Result<Option<DspConfig>>> {
        let recovery = self.documents.lock().recovery.clone();
        async move { Ok(recovery) }.boxed()
    }

    fn put_recovery<'a>(&'a self, config: &'a DspConfig) -> BoxFuture<'a, Result<()>> {
        self.documents.lock().recovery = Some(config.clone());
        async { Ok(()) }.boxed()
    }

    fn get_preset<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Option<DspConfig>>> {
        let preset = self.documents.lock().presets.get(name).cloned();
        async move { Ok(preset) }.boxed()
    }

    fn put_preset<'a>(&'a self, name: &'a str, config: &'a DspConfig) -> BoxFuture<'a, Result<()>> {
        self.documents
            .lock()
            .presets
            .insert(name.to_string(), config.clone());
        async { Ok(()) }.boxed()
    }

    fn list_presets(&self) -> BoxFuture<'_, Result<Vec<String>>> {
        let names: Vec<String> = self.documents.lock().presets.keys().cloned().collect();
        async move { Ok(names) }.boxed()
    }
}
