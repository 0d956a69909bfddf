//! # DSP Remote
//!
//! Session client for editing the processing pipeline of a networked DSP
//! engine from a remote UI.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────────┐
//! │                                REMOTE UI                               │
//! │                                                                        │
//! │   UI edit ──► ┌──────────────────────────┐      ┌──────────────────┐   │
//! │               │ Convergence Coordinator  │─────►│ Persistence      │   │
//! │   EqView ◄─── │ (convergence)            │      │ (recovery/preset)│   │
//! │               └────────────┬─────────────┘      └──────────────────┘   │
//! │                            │ set_config / get_config                   │
//! │                            ▼                                           │
//! │  ┌──────────────┐   ┌──────────────────────────┐                       │
//! │  │ Reconnection │──►│ Session Client (session) │──► SessionEvent bus   │
//! │  │ Controller   │◄──│                          │                       │
//! │  └──────────────┘   └──────┬────────────┬──────┘                       │
//! │                            │            │                              │
//! │                 ┌──────────▼───┐  ┌─────▼──────────┐                   │
//! │                 │ Control      │  │ Telemetry      │──► Spectrum       │
//! │                 │ Channel      │  │ Channel        │    Analyzer       │
//! │                 │ (FIFO, 1 in  │  │ (FIFO, 1 in    │    (STA/LTA/peak) │
//! │                 │  flight)     │  │  flight)       │                   │
//! │                 └──────┬───────┘  └──────┬─────────┘                   │
//! └────────────────────────┼─────────────────┼─────────────────────────────┘
//!                          │ WebSocket       │ WebSocket
//!                          ▼                 ▼
//!                 ┌────────────────────────────────────┐
//!                 │             DSP ENGINE             │
//!                 └────────────────────────────────────┘
//! ```

pub mod analyzer;
pub mod config;
pub mod convergence;
pub mod error;
pub mod network;
pub mod persistence;
pub mod protocol;
pub mod reconnect;
pub mod session;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Default engine control port
    pub const DEFAULT_CONTROL_PORT: u16 = 1234;

    /// Default engine telemetry port
    pub const DEFAULT_TELEMETRY_PORT: u16 = 1235;

    /// Socket open deadline in milliseconds
    pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;

    /// Control request deadline in milliseconds
    pub const DEFAULT_CONTROL_TIMEOUT_MS: u64 = 5000;

    /// Telemetry request deadline in milliseconds
    pub const DEFAULT_TELEMETRY_TIMEOUT_MS: u64 = 1000;

    /// Telemetry poll interval in milliseconds
    pub const DEFAULT_TELEMETRY_POLL_MS: u64 = 100;

    /// Reconnect delays per attempt; the last entry repeats
    pub const RECONNECT_SCHEDULE_MS: [u64; 5] = [1000, 2000, 5000, 10_000, 30_000];

    /// Reconnect attempts before giving up
    pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;

    /// Edit coalescing window in milliseconds
    pub const DEFAULT_DEBOUNCE_MS: u64 = 200;

    /// Failure log ring size
    pub const FAILURE_LOG_CAPACITY: usize = 50;

    /// Smallest valid spectrum frame; two values is the legacy stereo format
    pub const MIN_SPECTRUM_BINS: usize = 3;

    /// Buffered events per broadcast subscriber
    pub const EVENT_CHANNEL_CAPACITY: usize = 256;
}
