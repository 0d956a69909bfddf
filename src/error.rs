//! Error types for the DSP remote session client

use thiserror::Error;

use crate::protocol::ChannelKind;

/// Main error type for the library
#[derive(Error, Debug)]
pub enum Error {
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Engine rejected {command}: {result}")]
    Rejected {
        command: String,
        result: String,
    },

    #[error("Session is not connected")]
    NotConnected,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the request never reached the engine.
    ///
    /// These failures are rejected locally and never enter the failure log.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            Error::Validation(_) | Error::NotConnected | Error::Channel(ChannelError::NotOpen(_))
        )
    }

    /// Whether this is a request timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Channel(ChannelError::Timeout { .. }))
    }
}

/// Socket-level errors for a single channel
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("{0} channel is not open")]
    NotOpen(ChannelKind),

    #[error("Connection to {url} failed: {reason}")]
    ConnectFailed { url: String, reason: String },

    #[error("Connection to {0} timed out")]
    ConnectTimeout(String),

    #[error("No reply to {command} within {timeout_ms} ms")]
    Timeout { command: String, timeout_ms: u64 },

    #[error("Channel closed")]
    Closed,

    #[error("Transport failure: {0}")]
    Transport(String),
}

/// Wire format errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Failed to encode request: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Malformed reply: {0}")]
    MalformedReply(String),

    #[error("Reply to {0} carried no value")]
    MissingValue(String),

    #[error("Unexpected value for {command}: {reason}")]
    UnexpectedValue { command: String, reason: String },

    #[error("Legacy two-value peak frame rejected")]
    LegacyFrame,

    #[error("Invalid telemetry frame: {0}")]
    InvalidFrame(String),
}

/// Local referential-integrity failures of a configuration snapshot
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Pipeline step {step} references unknown filter '{name}'")]
    UnknownFilter { step: usize, name: String },

    #[error("Pipeline step {step} references unknown mixer '{name}'")]
    UnknownMixer { step: usize, name: String },

    #[error("Pipeline step {step} references unknown processor '{name}'")]
    UnknownProcessor { step: usize, name: String },
}

/// Persistence collaborator errors
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Request failed: {0}")]
    Request(String),

    #[error("Store returned status {0}")]
    Status(u16),

    #[error("Invalid document: {0}")]
    Document(String),

    #[error("No persistence store configured")]
    Unavailable,

    #[error("Preset '{0}' not found")]
    NotFound(String),
}

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;
