//! Application configuration
//!
//! Stored as TOML in the platform config directory. The file doubles as the
//! persisted local preference store: the auto-reconnect flag and the last
//! endpoints used live here.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::{Error, Result};

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub connection: Endpoints,
    pub session: SessionConfig,
    pub reconnect: ReconnectConfig,
    pub edit: EditConfig,
    pub analyzer: AnalyzerConfig,
    pub persistence: PersistenceConfig,
}

/// Engine address and the two channel ports
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    pub host: String,
    pub control_port: u16,
    pub telemetry_port: u16,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            control_port: DEFAULT_CONTROL_PORT,
            telemetry_port: DEFAULT_TELEMETRY_PORT,
        }
    }
}

impl Endpoints {
    pub fn new(host: impl Into<String>, control_port: u16, telemetry_port: u16) -> Self {
        Self {
            host: host.into(),
            control_port,
            telemetry_port,
        }
    }

    pub fn control_url(&self) -> String {
        format!("ws://{}:{}", self.host, self.control_port)
    }

    pub fn telemetry_url(&self) -> String {
        format!("ws://{}:{}", self.host, self.telemetry_port)
    }
}

/// Channel deadlines and session bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub connect_timeout_ms: u64,
    pub control_timeout_ms: u64,
    pub telemetry_timeout_ms: u64,
    pub telemetry_poll_ms: u64,
    pub failure_log_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            control_timeout_ms: DEFAULT_CONTROL_TIMEOUT_MS,
            telemetry_timeout_ms: DEFAULT_TELEMETRY_TIMEOUT_MS,
            telemetry_poll_ms: DEFAULT_TELEMETRY_POLL_MS,
            failure_log_capacity: FAILURE_LOG_CAPACITY,
        }
    }
}

impl SessionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.control_timeout_ms)
    }

    pub fn telemetry_timeout(&self) -> Duration {
        Duration::from_millis(self.telemetry_timeout_ms)
    }

    pub fn telemetry_poll_interval(&self) -> Duration {
        Duration::from_millis(self.telemetry_poll_ms)
    }
}

/// Automatic reconnection preference and backoff
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Whether the reconnection controller may run at all
    pub enabled: bool,
    /// Delay before each attempt; the last entry applies to every later attempt
    pub schedule_ms: Vec<u64>,
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            schedule_ms: RECONNECT_SCHEDULE_MS.to_vec(),
            max_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
        }
    }
}

/// Edit coalescing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EditConfig {
    pub debounce_ms: u64,
}

impl Default for EditConfig {
    fn default() -> Self {
        Self {
            debounce_ms: DEFAULT_DEBOUNCE_MS,
        }
    }
}

impl EditConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// Spectrum analyzer time constants, all in seconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Short-term average time constant
    pub short_tau: f64,
    /// Long-term average time constant
    pub long_tau: f64,
    /// How long a peak is held before it starts to fall
    pub peak_hold: f64,
    /// Peak fall rate in dB per second
    pub peak_decay_db_per_s: f64,
    /// Largest frame interval fed into the decay formulas
    pub max_dt: f64,
    /// Frame age after which the display is considered stale
    pub stale_after: f64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            short_tau: 0.8,
            long_tau: 8.0,
            peak_hold: 2.0,
            peak_decay_db_per_s: 12.0,
            max_dt: 0.15,
            stale_after: 1.0,
        }
    }
}

/// Persistence collaborator location
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Base URL of the store; `None` keeps documents in memory
    pub base_url: Option<String>,
    pub timeout_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_ms: 3000,
        }
    }
}

impl AppConfig {
    /// Default config file location for this platform
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "dsp-remote").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    /// Load from the default location, falling back to defaults
    pub fn load_or_default() -> Self {
        let Some(path) = Self::default_path() else {
            return Self::default();
        };
        if !path.exists() {
            return Self::default();
        }
        match Self::load(&path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Ignoring unreadable config {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Write as TOML, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Save to the default location
    pub fn save_default(&self) -> Result<()> {
        let path = Self::default_path()
            .ok_or_else(|| Error::Config("no config directory on this platform".to_string()))?;
        self.save(&path)
    }

    /// Remember the endpoints of a successful connect
    pub fn remember_endpoints(&mut self, endpoints: &Endpoints) {
        self.connection = endpoints.clone();
    }
}
