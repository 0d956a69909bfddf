#![allow(dead_code)]
//! Test harness for dsp-remote integration tests.
//!
//! `MockEngine` speaks the engine's WebSocket protocol on two loopback ports
//! and can be told to misbehave per command.

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

use dsp_remote::config::{Endpoints, SessionConfig};
use dsp_remote::protocol::DspConfig;

pub const MOCK_VERSION: &str = "3.0.0-mock";

/// Session settings with short deadlines so failures surface quickly
pub fn fast_session_config() -> SessionConfig {
    SessionConfig {
        connect_timeout_ms: 500,
        control_timeout_ms: 300,
        telemetry_timeout_ms: 200,
        telemetry_poll_ms: 20,
        failure_log_capacity: 50,
    }
}

/// A small but complete pipeline
pub fn sample_config() -> Value {
    json!({
        "devices": {"samplerate": 48000, "chunksize": 1024},
        "filters": {
            "bass": {"type": "Biquad", "parameters": {"type": "Lowshelf", "freq": 80.0, "gain": 3.0, "q": 0.7}},
            "presence": {"type": "Biquad", "parameters": {"type": "Peaking", "freq": 3000.0, "gain": -2.0, "q": 1.2}}
        },
        "mixers": {"stereo": {"channels": {"in": 2, "out": 2}, "mapping": []}},
        "pipeline": [
            {"type": "Mixer", "name": "stereo"},
            {"type": "Filter", "channels": [0, 1], "names": ["bass", "presence"]}
        ]
    })
}

pub fn sample_dsp_config() -> DspConfig {
    serde_json::from_value(sample_config()).unwrap()
}

/// A port nothing is listening on
pub fn unused_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

#[derive(Default)]
struct Faults {
    /// Never reply
    silent: HashSet<String>,
    /// Reply with a non-Ok result
    reject: HashSet<String>,
    /// Reply with an `Invalid` frame
    invalid: HashSet<String>,
    /// Reply with text that is not JSON
    malformed: HashSet<String>,
    /// Send a reply for another command first
    stale: HashSet<String>,
    delays: HashMap<String, Duration>,
}

struct EngineState {
    config: Value,
    volume: f64,
    peaks: Value,
    received: Vec<String>,
    /// Engine rewrites the title of every submitted config
    normalize: bool,
    /// Hold back the telemetry WebSocket handshake
    telemetry_handshake_delay: Option<Duration>,
    faults: Faults,
}

/// Scripted engine on two loopback ports
pub struct MockEngine {
    pub control_addr: SocketAddr,
    pub telemetry_addr: SocketAddr,
    state: Arc<Mutex<EngineState>>,
    kill: broadcast::Sender<()>,
    listeners: Vec<JoinHandle<()>>,
}

impl MockEngine {
    pub async fn start() -> Self {
        let state = Arc::new(Mutex::new(EngineState {
            config: sample_config(),
            volume: -10.0,
            peaks: json!([-20.0, -30.0, -40.0, -50.0]),
            received: Vec::new(),
            normalize: false,
            telemetry_handshake_delay: None,
            faults: Faults::default(),
        }));
        let (kill, _) = broadcast::channel(4);

        let control = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let telemetry = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let control_addr = control.local_addr().unwrap();
        let telemetry_addr = telemetry.local_addr().unwrap();

        let listeners = vec![
            tokio::spawn(listen(control, false, state.clone(), kill.clone())),
            tokio::spawn(listen(telemetry, true, state.clone(), kill.clone())),
        ];

        Self {
            control_addr,
            telemetry_addr,
            state,
            kill,
            listeners,
        }
    }

    pub fn endpoints(&self) -> Endpoints {
        Endpoints::new("127.0.0.1", self.control_addr.port(), self.telemetry_addr.port())
    }

    /// Control reachable, telemetry not
    pub fn endpoints_without_telemetry(&self) -> Endpoints {
        Endpoints::new("127.0.0.1", self.control_addr.port(), unused_port())
    }

    pub fn config(&self) -> Value {
        self.state.lock().config.clone()
    }

    pub fn set_config(&self, config: Value) {
        self.state.lock().config = config;
    }

    pub fn set_peaks(&self, peaks: Value) {
        self.state.lock().peaks = peaks;
    }

    pub fn set_normalize(&self, normalize: bool) {
        self.state.lock().normalize = normalize;
    }

    /// Delay answering the telemetry upgrade request
    pub fn slow_telemetry_handshake(&self, delay: Duration) {
        self.state.lock().telemetry_handshake_delay = Some(delay);
    }

    /// Command names received so far, in arrival order
    pub fn received(&self) -> Vec<String> {
        self.state.lock().received.clone()
    }

    pub fn count(&self, command: &str) -> usize {
        self.state.lock().received.iter().filter(|c| *c == command).count()
    }

    pub fn silence(&self, command: &str) {
        self.state.lock().faults.silent.insert(command.to_string());
    }

    pub fn reject(&self, command: &str) {
        self.state.lock().faults.reject.insert(command.to_string());
    }

    pub fn invalid(&self, command: &str) {
        self.state.lock().faults.invalid.insert(command.to_string());
    }

    pub fn malform(&self, command: &str) {
        self.state.lock().faults.malformed.insert(command.to_string());
    }

    pub fn stale_before(&self, command: &str) {
        self.state.lock().faults.stale.insert(command.to_string());
    }

    pub fn delay(&self, command: &str, delay: Duration) {
        self.state
            .lock()
            .faults
            .delays
            .insert(command.to_string(), delay);
    }

    pub fn clear_faults(&self) {
        self.state.lock().faults = Faults::default();
    }

    /// Drop every open socket without a close handshake
    pub fn kill_connections(&self) {
        let _ = self.kill.send(());
    }

    /// Stop listening and drop every open socket
    pub async fn stop(&mut self) {
        for listener in self.listeners.drain(..) {
            listener.abort();
            let _ = listener.await;
        }
        self.kill_connections();
    }
}

impl Drop for MockEngine {
    fn drop(&mut self) {
        for listener in &self.listeners {
            listener.abort();
        }
        let _ = self.kill.send(());
    }
}

async fn listen(
    listener: TcpListener,
    telemetry: bool,
    state: Arc<Mutex<EngineState>>,
    kill: broadcast::Sender<()>,
) {
    while let Ok((stream, _)) = listener.accept().await {
        tokio::spawn(serve(stream, telemetry, state.clone(), kill.subscribe()));
    }
}

async fn serve(
    stream: TcpStream,
    telemetry: bool,
    state: Arc<Mutex<EngineState>>,
    mut kill: broadcast::Receiver<()>,
) {
    let handshake_delay = if telemetry {
        state.lock().telemetry_handshake_delay
    } else {
        None
    };
    if let Some(delay) = handshake_delay {
        tokio::time::sleep(delay).await;
    }

    let Ok(mut ws) = accept_async(stream).await else {
        return;
    };

    loop {
        let message = tokio::select! {
            _ = kill.recv() => return,
            message = ws.next() => message,
        };
        let text = match message {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
            Some(Ok(_)) => continue,
        };

        let (delay, frames) = respond(&state, &text);
        if let Some(delay) = delay {
            tokio::select! {
                _ = kill.recv() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        for frame in frames {
            if ws.send(Message::Text(frame)).await.is_err() {
                return;
            }
        }
    }
}

/// `{command: body}` as a text frame
fn keyed(command: &str, body: Value) -> String {
    let mut map = serde_json::Map::new();
    map.insert(command.to_string(), body);
    Value::Object(map).to_string()
}

fn reply(command: &str, value: Option<Value>) -> String {
    let body = match value {
        Some(value) => json!({"result": "Ok", "value": value}),
        None => json!({"result": "Ok"}),
    };
    keyed(command, body)
}

/// Decide what to send back for one request
fn respond(state: &Mutex<EngineState>, text: &str) -> (Option<Duration>, Vec<String>) {
    let request: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(_) => return (None, vec![json!({"Invalid": {"error": "bad json"}}).to_string()]),
    };
    let (command, argument) = match request {
        Value::String(name) => (name, None),
        Value::Object(map) if map.len() == 1 => match map.into_iter().next() {
            Some((name, argument)) => (name, Some(argument)),
            None => return (None, Vec::new()),
        },
        _ => return (None, vec![json!({"Invalid": {"error": "bad request"}}).to_string()]),
    };

    let mut state = state.lock();
    state.received.push(command.clone());

    let delay = state.faults.delays.get(&command).copied();
    if state.faults.silent.contains(&command) {
        return (delay, Vec::new());
    }
    if state.faults.malformed.contains(&command) {
        return (delay, vec!["this is not json".to_string()]);
    }
    if state.faults.invalid.contains(&command) {
        return (delay, vec![json!({"Invalid": {"error": "refused"}}).to_string()]);
    }
    if state.faults.reject.contains(&command) {
        let body = json!({"result": "Error", "value": "rejected by mock"});
        return (delay, vec![keyed(&command, body)]);
    }

    let mut frames = Vec::new();
    if state.faults.stale.contains(&command) {
        frames.push(reply("Reload", None));
    }

    let answer = match command.as_str() {
        "GetVersion" => reply(&command, Some(json!(MOCK_VERSION))),
        "GetConfigJson" => reply(&command, Some(Value::String(state.config.to_string()))),
        "SetConfigJson" => {
            let submitted = argument
                .as_ref()
                .and_then(Value::as_str)
                .and_then(|text| serde_json::from_str::<Value>(text).ok());
            match submitted {
                Some(mut config) => {
                    if state.normalize {
                        config["title"] = json!("engine");
                    }
                    state.config = config;
                    reply(&command, None)
                }
                None => keyed(&command, json!({"result": "Error", "value": "unparseable config"})),
            }
        }
        "GetVolume" => reply(&command, Some(json!(state.volume))),
        "SetVolume" => {
            if let Some(volume) = argument.as_ref().and_then(Value::as_f64) {
                state.volume = volume;
            }
            reply(&command, None)
        }
        "GetAvailableCaptureDevices" => {
            reply(&command, Some(json!([["hw:0", "Mock capture"], ["default", null]])))
        }
        "GetAvailablePlaybackDevices" => reply(&command, Some(json!([["hw:1", "Mock playback"]]))),
        "Reload" => reply(&command, None),
        "GetPlaybackSignalPeak" => reply(&command, Some(state.peaks.clone())),
        _ => json!({"Invalid": {"error": "unknown command"}}).to_string(),
    };
    frames.push(answer);
    (delay, frames)
}
