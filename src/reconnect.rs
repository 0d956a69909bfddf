//! Automatic reconnection
//!
//! Watches a session for unexpected control-channel loss and retries the last
//! endpoints on a fixed backoff table. Manual connect and disconnect always win
//! over a scheduled retry.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{Endpoints, ReconnectConfig};
use crate::constants::{DEFAULT_MAX_RECONNECT_ATTEMPTS, EVENT_CHANNEL_CAPACITY, RECONNECT_SCHEDULE_MS};
use crate::error::Result;
use crate::session::{Session, SessionEvent, SessionState};

/// Something that can be (re)connected and reports its lifecycle
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, endpoints: &Endpoints) -> impl Future<Output = Result<SessionState>> + Send;

    fn disconnect(&self) -> impl Future<Output = ()> + Send;

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent>;
}

impl Connector for Session {
    async fn connect(&self, endpoints: &Endpoints) -> Result<SessionState> {
        Session::connect(self, endpoints).await
    }

    async fn disconnect(&self) {
        Session::disconnect(self).await
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events()
    }
}

/// Backoff table and attempt ceiling
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    schedule: Vec<Duration>,
    max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(schedule: Vec<Duration>, max_attempts: u32) -> Self {
        Self {
            schedule,
            max_attempts,
        }
    }

    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self::new(
            config
                .schedule_ms
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
            config.max_attempts,
        )
    }

    /// Delay before the given 1-based attempt; saturates at the last entry
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let index = (attempt.max(1) - 1) as usize;
        self.schedule
            .get(index)
            .or_else(|| self.schedule.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(
            RECONNECT_SCHEDULE_MS
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
            DEFAULT_MAX_RECONNECT_ATTEMPTS,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPhase {
    Idle,
    /// Retry sequence running; holds the current 1-based attempt
    Attempting(u32),
    Connected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectEvent {
    Scheduled { attempt: u32, delay: Duration },
    AttemptFailed { attempt: u32, error: String },
    Reconnected { attempt: u32 },
    /// Terminal: no further attempts until a manual connect
    Exhausted { attempts: u32 },
}

struct ControllerInner {
    enabled: bool,
    phase: ReconnectPhase,
    endpoints: Option<Endpoints>,
    /// Bumped on every manual action so a stale retry task can tell
    generation: u64,
    retry: Option<JoinHandle<()>>,
}

/// Reconnection state machine over a [`Connector`]
pub struct ReconnectController<C: Connector> {
    connector: Arc<C>,
    policy: ReconnectPolicy,
    inner: Mutex<ControllerInner>,
    events: broadcast::Sender<ReconnectEvent>,
}

impl<C: Connector> ReconnectController<C> {
    pub fn new(connector: Arc<C>, policy: ReconnectPolicy, enabled: bool) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            connector,
            policy,
            inner: Mutex::new(ControllerInner {
                enabled,
                phase: ReconnectPhase::Idle,
                endpoints: None,
                generation: 0,
                retry: None,
            }),
            events,
        })
    }

    /// Start observing the connector for unexpected control loss.
    ///
    /// The subscription is taken before this returns, so no loss reported
    /// afterwards is missed.
    pub fn spawn_watcher(self: &Arc<Self>) -> JoinHandle<()> {
        let mut events = self.connector.subscribe();
        let controller: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Reconnect watcher skipped {} session events", skipped);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let Some(controller) = controller.upgrade() else {
                    break;
                };
                if let SessionEvent::Channel(channel) = &event {
                    if channel.is_control_loss() {
                        controller.on_connection_lost();
                    }
                }
            }
            debug!("Reconnect watcher stopped");
        })
    }

    /// Manual connect. Cancels any scheduled retry first.
    pub async fn connect(&self, endpoints: &Endpoints) -> Result<SessionState> {
        let generation = {
            let mut inner = self.inner.lock();
            Self::cancel_locked(&mut inner);
            inner.endpoints = Some(endpoints.clone());
            inner.generation
        };

        let result = self.connector.connect(endpoints).await;

        let mut inner = self.inner.lock();
        if inner.generation == generation && result.is_ok() {
            inner.phase = ReconnectPhase::Connected;
        }
        result
    }

    /// Manual disconnect. Cancels any scheduled retry and suppresses new ones.
    pub async fn disconnect(&self) {
        {
            let mut inner = self.inner.lock();
            Self::cancel_locked(&mut inner);
        }
        self.connector.disconnect().await;
    }

    /// Mirror the persisted auto-reconnect preference
    pub fn set_enabled(&self, enabled: bool) {
        let mut inner = self.inner.lock();
        inner.enabled = enabled;
        if !enabled && matches!(inner.phase, ReconnectPhase::Attempting(_)) {
            info!("Auto-reconnect disabled, cancelling retries");
            Self::cancel_locked(&mut inner);
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.lock().enabled
    }

    pub fn phase(&self) -> ReconnectPhase {
        self.inner.lock().phase
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReconnectEvent> {
        self.events.subscribe()
    }

    fn on_connection_lost(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        if inner.phase != ReconnectPhase::Connected {
            return;
        }
        let Some(endpoints) = inner.endpoints.clone() else {
            return;
        };
        if !inner.enabled {
            info!("Connection lost; auto-reconnect is disabled");
            inner.phase = ReconnectPhase::Idle;
            return;
        }

        warn!("Connection to {} lost, scheduling reconnect", endpoints.host);
        inner.generation += 1;
        inner.phase = ReconnectPhase::Attempting(1);
        let generation = inner.generation;
        inner.retry = Some(tokio::spawn(Arc::clone(self).run_retries(generation, endpoints)));
    }

    async fn run_retries(self: Arc<Self>, generation: u64, endpoints: Endpoints) {
        let max_attempts = self.policy.max_attempts;
        let mut attempt = 0;

        loop {
            attempt += 1;
            if attempt > max_attempts {
                break;
            }

            let delay = self.policy.delay_for(attempt);
            if !self.advance(generation, ReconnectPhase::Attempting(attempt)) {
                return;
            }
            debug!("Reconnect attempt {} in {:?}", attempt, delay);
            self.emit(ReconnectEvent::Scheduled { attempt, delay });

            tokio::time::sleep(delay).await;
            if !self.is_current(generation) {
                return;
            }

            match self.connector.connect(&endpoints).await {
                Ok(state) => {
                    if !self.finish(generation, ReconnectPhase::Connected) {
                        return;
                    }
                    info!("Reconnected on attempt {} ({:?})", attempt, state);
                    self.emit(ReconnectEvent::Reconnected { attempt });
                    return;
                }
                Err(e) => {
                    if !self.is_current(generation) {
                        return;
                    }
                    warn!("Reconnect attempt {} failed: {}", attempt, e);
                    self.emit(ReconnectEvent::AttemptFailed {
                        attempt,
                        error: e.to_string(),
                    });
                }
            }
        }

        if self.finish(generation, ReconnectPhase::Idle) {
            error!("Giving up after {} reconnect attempts", max_attempts);
            self.emit(ReconnectEvent::Exhausted {
                attempts: max_attempts,
            });
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.inner.lock().generation == generation
    }

    fn advance(&self, generation: u64, phase: ReconnectPhase) -> bool {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return false;
        }
        inner.phase = phase;
        true
    }

    /// Leave the retry sequence; the task handle is dropped, not aborted
    fn finish(&self, generation: u64, phase: ReconnectPhase) -> bool {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return false;
        }
        inner.phase = phase;
        inner.retry = None;
        true
    }

    fn cancel_locked(inner: &mut ControllerInner) {
        inner.generation += 1;
        inner.phase = ReconnectPhase::Idle;
        if let Some(retry) = inner.retry.take() {
            debug!("Cancelling scheduled reconnect");
            retry.abort();
        }
    }

    fn emit(&self, event: ReconnectEvent) {
        let _ = self.events.send(event);
    }
}
