//! Bounded history of failed round trips

use std::collections::VecDeque;

use crate::protocol::ChannelKind;
use crate::session::events::{FailureEntry, SessionEvent};

/// Ring buffer of the most recent failures.
///
/// The log is a pure reducer over [`SessionEvent`]s. A single successful
/// control round trip wipes the whole history, not just the entry it might
/// correspond to, so the log always describes failures since the engine last
/// answered correctly.
#[derive(Debug, Clone)]
pub struct FailureLog {
    entries: VecDeque<FailureEntry>,
    capacity: usize,
}

impl FailureLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Fold one event into the log
    pub fn apply(&mut self, event: &SessionEvent) {
        match event {
            SessionEvent::OperationSucceeded {
                channel: ChannelKind::Control,
                ..
            } => self.entries.clear(),
            SessionEvent::OperationFailed(entry) => self.push(entry.clone()),
            _ => {}
        }
    }

    fn push(&mut self, entry: FailureEntry) {
        if self.capacity == 0 {
            return;
        }
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// Entries, oldest first
    pub fn entries(&self) -> Vec<FailureEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<&FailureEntry> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
