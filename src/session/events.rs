//! Typed lifecycle and outcome events

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::protocol::ChannelKind;
use crate::session::SessionState;

/// Why a channel closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()` was called
    Requested,
    /// The engine closed the socket
    Remote,
    /// The socket failed
    Error(String),
}

impl CloseReason {
    /// Anything other than a requested close
    pub fn is_unexpected(&self) -> bool {
        !matches!(self, CloseReason::Requested)
    }
}

/// Channel lifecycle transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lifecycle {
    Opened,
    OpenFailed(String),
    Closed(CloseReason),
}

/// Lifecycle notification emitted by a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelEvent {
    pub kind: ChannelKind,
    pub lifecycle: Lifecycle,
}

impl ChannelEvent {
    pub fn new(kind: ChannelKind, lifecycle: Lifecycle) -> Self {
        Self { kind, lifecycle }
    }

    /// A previously open control socket went away without being asked to
    pub fn is_control_loss(&self) -> bool {
        self.kind == ChannelKind::Control
            && matches!(&self.lifecycle, Lifecycle::Closed(reason) if reason.is_unexpected())
    }
}

/// One failed round trip
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureEntry {
    pub timestamp: DateTime<Utc>,
    pub channel: ChannelKind,
    pub command: String,
    /// Request as sent on the wire
    pub request: String,
    /// Engine reply or local error description
    pub error: String,
}

impl FailureEntry {
    pub fn new(
        channel: ChannelKind,
        command: impl Into<String>,
        request: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            channel,
            command: command.into(),
            request: request.into(),
            error: error.into(),
        }
    }
}

/// Everything a session reports to its observers
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    Channel(ChannelEvent),
    OperationSucceeded {
        channel: ChannelKind,
        command: String,
    },
    OperationFailed(FailureEntry),
}
