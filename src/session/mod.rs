//! Session client
//!
//! Owns the control and telemetry channels of one engine connection and
//! exposes typed operations over them. Outcomes and lifecycle transitions are
//! published on a broadcast channel of [`SessionEvent`]s; the failure log is
//! folded from that same event stream.

pub mod events;
pub mod failure_log;

use parking_lot::Mutex;
use serde_json::Value;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::config::{Endpoints, SessionConfig};
use crate::constants::EVENT_CHANNEL_CAPACITY;
use crate::error::{ChannelError, Error, ProtocolError, Result};
use crate::network::Channel;
use crate::protocol::{
    decode_devices, ChannelKind, Command, ControlCommand, DeviceDirection, DeviceInfo, DspConfig,
    Reply, SpectrumFrame, TelemetryCommand,
};

pub use events::{ChannelEvent, CloseReason, FailureEntry, Lifecycle, SessionEvent};
pub use failure_log::FailureLog;

/// Composite connection state as seen by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    /// Both channels up
    Connected,
    /// Control up, telemetry unavailable
    Degraded,
    /// Control channel failed; a fresh connect is needed
    Error,
}

impl SessionState {
    /// Whether control operations can be issued
    pub fn is_usable(self) -> bool {
        matches!(self, SessionState::Connected | SessionState::Degraded)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

struct SessionInner {
    phase: Phase,
    telemetry_available: bool,
    confirmed: Option<DspConfig>,
    volume: Option<f32>,
    endpoints: Option<Endpoints>,
    failures: FailureLog,
    /// Last state published as an event
    reported: SessionState,
    /// Bumped by every connect and disconnect; a connect that sees it move
    /// has been superseded
    generation: u64,
}

impl SessionInner {
    fn state(&self) -> SessionState {
        match self.phase {
            Phase::Disconnected => SessionState::Disconnected,
            Phase::Connecting => SessionState::Connecting,
            Phase::Error => SessionState::Error,
            Phase::Connected if self.telemetry_available => SessionState::Connected,
            Phase::Connected => SessionState::Degraded,
        }
    }
}

/// Connection to one engine
pub struct Session {
    control: Channel,
    telemetry: Channel,
    inner: Mutex<SessionInner>,
    events: broadcast::Sender<SessionEvent>,
}

impl Session {
    /// Create a disconnected session.
    ///
    /// Must be called from within a Tokio runtime: a task is spawned to
    /// observe channel lifecycle notifications.
    pub fn new(config: SessionConfig) -> Arc<Self> {
        let (channel_tx, channel_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let session = Arc::new(Self {
            control: Channel::new(
                ChannelKind::Control,
                config.connect_timeout(),
                config.control_timeout(),
                channel_tx.clone(),
            ),
            telemetry: Channel::new(
                ChannelKind::Telemetry,
                config.connect_timeout(),
                config.telemetry_timeout(),
                channel_tx,
            ),
            inner: Mutex::new(SessionInner {
                phase: Phase::Disconnected,
                telemetry_available: false,
                confirmed: None,
                volume: None,
                endpoints: None,
                failures: FailureLog::new(config.failure_log_capacity),
                reported: SessionState::Disconnected,
                generation: 0,
            }),
            events,
        });

        tokio::spawn(observe_channels(Arc::downgrade(&session), channel_rx));
        session
    }

    /// Open the control channel, then the telemetry channel.
    ///
    /// A control failure aborts the attempt. A telemetry failure only leaves
    /// the session degraded. Any previous connection is torn down first.
    ///
    /// A `disconnect` issued while this is running wins: whatever this call
    /// opened is closed again and it fails with [`ChannelError::Closed`].
    pub async fn connect(&self, endpoints: &Endpoints) -> Result<SessionState> {
        self.close_channels().await;
        let generation = {
            let mut inner = self.inner.lock();
            inner.generation += 1;
            inner.generation
        };
        self.set_phase(Phase::Connecting);
        info!(
            "Connecting to engine at {} (control {}, telemetry {})",
            endpoints.host, endpoints.control_port, endpoints.telemetry_port
        );

        let control = self.control.open(&endpoints.control_url()).await;
        self.ensure_current(generation).await?;
        if let Err(e) = control {
            error!("Control channel unavailable: {}", e);
            self.set_phase(Phase::Error);
            return Err(e.into());
        }

        let telemetry_available = match self.telemetry.open(&endpoints.telemetry_url()).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Telemetry unavailable, continuing degraded: {}", e);
                false
            }
        };
        self.ensure_current(generation).await?;

        let initial = self.get_config().await;
        self.ensure_current(generation).await?;
        match initial {
            Ok(config) => self.inner.lock().confirmed = Some(config),
            Err(e) => warn!("Initial configuration read failed: {}", e),
        }

        if !self.control.is_open() {
            self.set_phase(Phase::Error);
            return Err(ChannelError::Closed.into());
        }

        {
            let mut inner = self.inner.lock();
            inner.telemetry_available = telemetry_available && self.telemetry.is_open();
            inner.endpoints = Some(endpoints.clone());
            inner.phase = Phase::Connected;
        }
        self.publish_state();

        let state = self.state();
        info!("Session {:?}", state);
        Ok(state)
    }

    /// Close both channels, rejecting anything still waiting on them.
    ///
    /// Safe to call on a session that is already disconnected.
    pub async fn disconnect(&self) {
        {
            let mut inner = self.inner.lock();
            inner.generation += 1;
            inner.phase = Phase::Disconnected;
            inner.confirmed = None;
            inner.telemetry_available = false;
        }
        let changed = self.publish_state();
        self.close_channels().await;
        if changed {
            info!("Session disconnected");
        }
    }

    /// Engine version string
    pub async fn version(&self) -> Result<String> {
        self.call(ControlCommand::GetVersion, |command, reply| {
            as_string(command, reply.into_value(command)?)
        })
        .await
    }

    /// Read the configuration the engine currently holds
    pub async fn get_config(&self) -> Result<DspConfig> {
        self.call(ControlCommand::GetConfigJson, |command, reply| {
            let text = as_string(command, reply.into_value(command)?)?;
            Ok(DspConfig::from_json(&text)?)
        })
        .await
    }

    /// Submit a full configuration and return what the engine confirms.
    ///
    /// The snapshot is validated locally first; an invalid one never reaches
    /// the engine. On success the returned value comes from a read-back, not
    /// from the submitted document.
    pub async fn set_config(&self, config: &DspConfig) -> Result<DspConfig> {
        config.validate()?;
        let json = config.to_json()?;

        self.call(ControlCommand::SetConfigJson(json), |_, _| Ok(()))
            .await?;

        let confirmed = self.get_config().await?;
        self.inner.lock().confirmed = Some(confirmed.clone());
        Ok(confirmed)
    }

    /// Main volume in dB
    pub async fn get_volume(&self) -> Result<f32> {
        let volume = self
            .call(ControlCommand::GetVolume, |command, reply| {
                as_f32(command, reply.into_value(command)?)
            })
            .await?;
        self.inner.lock().volume = Some(volume);
        Ok(volume)
    }

    pub async fn set_volume(&self, db: f32) -> Result<()> {
        self.call(ControlCommand::SetVolume(db), |_, _| Ok(())).await?;
        self.inner.lock().volume = Some(db);
        Ok(())
    }

    /// Devices the engine can open with the given backend
    pub async fn list_devices(
        &self,
        direction: DeviceDirection,
        backend: &str,
    ) -> Result<Vec<DeviceInfo>> {
        self.call(direction.command(backend), |command, reply| {
            Ok(decode_devices(command, reply.into_value(command)?)?)
        })
        .await
    }

    /// Ask the engine to reload and apply its configuration
    pub async fn reload(&self) -> Result<()> {
        self.call(ControlCommand::Reload, |_, _| Ok(())).await
    }

    /// Fetch one telemetry frame
    pub async fn poll_telemetry(&self) -> Result<SpectrumFrame> {
        self.call(TelemetryCommand::GetPlaybackSignalPeak, |command, reply| {
            Ok(SpectrumFrame::from_value(&reply.into_value(command)?)?)
        })
        .await
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state()
    }

    /// Subscribe to lifecycle and outcome events
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Failure history, oldest first
    pub fn failures(&self) -> Vec<FailureEntry> {
        self.inner.lock().failures.entries()
    }

    /// Last snapshot confirmed by the engine
    pub fn confirmed_config(&self) -> Option<DspConfig> {
        self.inner.lock().confirmed.clone()
    }

    pub fn last_volume(&self) -> Option<f32> {
        self.inner.lock().volume
    }

    pub fn telemetry_available(&self) -> bool {
        self.inner.lock().telemetry_available
    }

    pub fn endpoints(&self) -> Option<Endpoints> {
        self.inner.lock().endpoints.clone()
    }

    /// One round trip: send, check the result code, decode, and record the
    /// outcome.
    async fn call<C, T, F>(&self, command: C, decode: F) -> Result<T>
    where
        C: Command,
        F: FnOnce(&'static str, Reply) -> Result<T>,
    {
        let name = command.name();
        let channel = match C::CHANNEL {
            ChannelKind::Control => &self.control,
            ChannelKind::Telemetry => &self.telemetry,
        };

        let result = match channel.send(&command).await {
            Ok(reply) if reply.is_ok() => decode(name, reply),
            Ok(reply) => Err(Error::Rejected {
                command: name.to_string(),
                result: describe_rejection(&reply),
            }),
            Err(e) => Err(e),
        };

        match &result {
            Ok(_) => self.record(SessionEvent::OperationSucceeded {
                channel: C::CHANNEL,
                command: name.to_string(),
            }),
            Err(e) if e.is_local() => {
                debug!("{} not sent: {}", name, e);
            }
            Err(e) => {
                let request = command.encode().unwrap_or_else(|e| e.to_string());
                self.record(SessionEvent::OperationFailed(FailureEntry::new(
                    C::CHANNEL,
                    name,
                    request,
                    e.to_string(),
                )));
            }
        }
        result
    }

    fn record(&self, event: SessionEvent) {
        self.inner.lock().failures.apply(&event);
        let _ = self.events.send(event);
    }

    /// Fail a connect that a later connect or disconnect has overtaken.
    ///
    /// If a disconnect overtook it, the channels it opened meanwhile are
    /// closed again.
    async fn ensure_current(&self, generation: u64) -> Result<()> {
        let (current, disconnected) = {
            let inner = self.inner.lock();
            (
                inner.generation == generation,
                inner.phase == Phase::Disconnected,
            )
        };
        if current {
            return Ok(());
        }

        info!("Connect attempt superseded");
        if disconnected {
            self.close_channels().await;
        }
        Err(ChannelError::Closed.into())
    }

    async fn close_channels(&self) {
        self.control.close().await;
        self.telemetry.close().await;

        let mut inner = self.inner.lock();
        inner.confirmed = None;
        inner.telemetry_available = false;
    }

    /// Returns whether the published state changed
    fn set_phase(&self, phase: Phase) -> bool {
        self.inner.lock().phase = phase;
        self.publish_state()
    }

    fn publish_state(&self) -> bool {
        let changed = {
            let mut inner = self.inner.lock();
            let state = inner.state();
            if state == inner.reported {
                None
            } else {
                inner.reported = state;
                Some(state)
            }
        };

        match changed {
            Some(state) => {
                debug!("Session state -> {:?}", state);
                let _ = self.events.send(SessionEvent::StateChanged(state));
                true
            }
            None => false,
        }
    }

    fn on_channel_event(&self, event: ChannelEvent) {
        if let Lifecycle::Closed(reason) = &event.lifecycle {
            if reason.is_unexpected() {
                let mut inner = self.inner.lock();
                match event.kind {
                    ChannelKind::Control => {
                        if inner.phase == Phase::Connected && !self.control.is_open() {
                            error!("Control channel lost: {:?}", reason);
                            inner.phase = Phase::Error;
                            inner.confirmed = None;
                        }
                    }
                    ChannelKind::Telemetry => {
                        if inner.telemetry_available && !self.telemetry.is_open() {
                            warn!("Telemetry channel lost: {:?}", reason);
                            inner.telemetry_available = false;
                        }
                    }
                }
            }
        }

        let _ = self.events.send(SessionEvent::Channel(event));
        self.publish_state();
    }
}

async fn observe_channels(session: Weak<Session>, mut events: mpsc::UnboundedReceiver<ChannelEvent>) {
    while let Some(event) = events.recv().await {
        let Some(session) = session.upgrade() else {
            break;
        };
        session.on_channel_event(event);
    }
}

fn describe_rejection(reply: &Reply) -> String {
    match &reply.value {
        Some(value) => format!("{} ({})", reply.result, value),
        None => reply.result.clone(),
    }
}

fn as_string(command: &str, value: Value) -> Result<String> {
    match value {
        Value::String(text) => Ok(text),
        other => Err(ProtocolError::UnexpectedValue {
            command: command.to_string(),
            reason: format!("expected a string, got {}", other),
        }
        .into()),
    }
}

fn as_f32(command: &str, value: Value) -> Result<f32> {
    value.as_f64().map(|v| v as f32).ok_or_else(|| {
        ProtocolError::UnexpectedValue {
            command: command.to_string(),
            reason: format!("expected a number, got {}", value),
        }
        .into()
    })
}
