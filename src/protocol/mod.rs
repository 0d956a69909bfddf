//! Protocol definitions for engine communication
//!
//! Every request is a serde externally-tagged enum variant: a command without
//! an argument goes out as a bare JSON string (`"GetVersion"`), a command with
//! one goes out as a one-key object (`{"SetVolume": -12.0}`). Replies come back
//! keyed by the command name:
//!
//! ```text
//! {"GetConfigJson": {"result": "Ok", "value": "<json-string>"}}
//! ```
//!
//! Each channel has its own closed set of commands so the protocol surface
//! stays auditable.

pub mod dsp_config;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::constants::MIN_SPECTRUM_BINS;
use crate::error::ProtocolError;

pub use dsp_config::{DspConfig, FilterDef, PipelineStep};

/// Result string the engine uses for a successful command
pub const RESULT_OK: &str = "Ok";

/// Reply key the engine uses when it could not parse a request
pub const INVALID_REPLY: &str = "Invalid";

/// Which of the two sockets a request travels on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    /// Configuration and metadata commands
    Control,
    /// High-frequency signal level polling
    Telemetry,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::Control => f.write_str("control"),
            ChannelKind::Telemetry => f.write_str("telemetry"),
        }
    }
}

/// A request that can be issued on a channel
pub trait Command: Serialize {
    /// Channel this command belongs to
    const CHANNEL: ChannelKind;

    /// Command name, which is also the key of the matching reply
    fn name(&self) -> &'static str;

    /// Encode as a wire text frame
    fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }
}

/// Commands accepted on the control channel
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ControlCommand {
    GetVersion,
    GetConfigJson,
    SetConfigJson(String),
    GetVolume,
    SetVolume(f32),
    GetAvailableCaptureDevices(String),
    GetAvailablePlaybackDevices(String),
    Reload,
}

impl Command for ControlCommand {
    const CHANNEL: ChannelKind = ChannelKind::Control;

    fn name(&self) -> &'static str {
        match self {
            ControlCommand::GetVersion => "GetVersion",
            ControlCommand::GetConfigJson => "GetConfigJson",
            ControlCommand::SetConfigJson(_) => "SetConfigJson",
            ControlCommand::GetVolume => "GetVolume",
            ControlCommand::SetVolume(_) => "SetVolume",
            ControlCommand::GetAvailableCaptureDevices(_) => "GetAvailableCaptureDevices",
            ControlCommand::GetAvailablePlaybackDevices(_) => "GetAvailablePlaybackDevices",
            ControlCommand::Reload => "Reload",
        }
    }
}

/// Commands accepted on the telemetry channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TelemetryCommand {
    /// Current per-bin peak levels in dB
    GetPlaybackSignalPeak,
}

impl Command for TelemetryCommand {
    const CHANNEL: ChannelKind = ChannelKind::Telemetry;

    fn name(&self) -> &'static str {
        match self {
            TelemetryCommand::GetPlaybackSignalPeak => "GetPlaybackSignalPeak",
        }
    }
}

/// Body of a reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub result: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl Reply {
    pub fn ok(value: Option<Value>) -> Self {
        Self {
            result: RESULT_OK.to_string(),
            value,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.result == RESULT_OK
    }

    /// Take the value, failing if the engine sent none
    pub fn into_value(self, command: &str) -> Result<Value, ProtocolError> {
        self.value
            .ok_or_else(|| ProtocolError::MissingValue(command.to_string()))
    }
}

/// A decoded incoming text frame
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// Reply keyed by command name
    Reply { command: String, reply: Reply },
    /// The engine could not parse the request it received
    Invalid(String),
}

/// Decode one incoming text frame
pub fn decode_incoming(text: &str) -> Result<Incoming, ProtocolError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| ProtocolError::MalformedReply(e.to_string()))?;

    let Value::Object(map) = value else {
        return Err(ProtocolError::MalformedReply(
            "reply is not a JSON object".to_string(),
        ));
    };
    if map.len() != 1 {
        return Err(ProtocolError::MalformedReply(format!(
            "expected exactly one key, got {}",
            map.len()
        )));
    }
    let Some((command, body)) = map.into_iter().next() else {
        return Err(ProtocolError::MalformedReply("empty reply".to_string()));
    };

    if command == INVALID_REPLY {
        let reason = body
            .get("error")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| body.to_string());
        return Ok(Incoming::Invalid(reason));
    }

    let reply: Reply = serde_json::from_value(body)
        .map_err(|e| ProtocolError::MalformedReply(format!("{}: {}", command, e)))?;
    Ok(Incoming::Reply { command, reply })
}

/// One telemetry poll result: per-bin levels in dB
#[derive(Debug, Clone, PartialEq)]
pub struct SpectrumFrame {
    pub levels: Vec<f32>,
}

impl SpectrumFrame {
    /// Parse the value of a `GetPlaybackSignalPeak` reply.
    ///
    /// Exactly two values is the legacy stereo-peak format and is rejected
    /// as a whole, as is anything shorter than [`MIN_SPECTRUM_BINS`].
    pub fn from_value(value: &Value) -> Result<Self, ProtocolError> {
        let Value::Array(items) = value else {
            return Err(ProtocolError::InvalidFrame(format!(
                "expected an array, got {}",
                value
            )));
        };

        if items.len() == 2 {
            return Err(ProtocolError::LegacyFrame);
        }
        if items.len() < MIN_SPECTRUM_BINS {
            return Err(ProtocolError::InvalidFrame(format!(
                "{} bins, need at least {}",
                items.len(),
                MIN_SPECTRUM_BINS
            )));
        }

        let levels = items
            .iter()
            .enumerate()
            .map(|(i, v)| {
                v.as_f64().map(|db| db as f32).ok_or_else(|| {
                    ProtocolError::InvalidFrame(format!("bin {} is not a number: {}", i, v))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { levels })
    }

    pub fn bins(&self) -> usize {
        self.levels.len()
    }
}

/// Device direction for enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceDirection {
    Capture,
    Playback,
}

impl DeviceDirection {
    pub fn command(self, backend: &str) -> ControlCommand {
        match self {
            DeviceDirection::Capture => ControlCommand::GetAvailableCaptureDevices(backend.to_string()),
            DeviceDirection::Playback => {
                ControlCommand::GetAvailablePlaybackDevices(backend.to_string())
            }
        }
    }
}

/// Audio device reported by the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    pub description: Option<String>,
}

/// Parse a device enumeration value.
///
/// Entries are `[name, description|null]` pairs; a bare string is a name.
pub fn decode_devices(command: &str, value: Value) -> Result<Vec<DeviceInfo>, ProtocolError> {
    let unexpected = |reason: String| ProtocolError::UnexpectedValue {
        command: command.to_string(),
        reason,
    };

    let Value::Array(entries) = value else {
        return Err(unexpected("device list is not an array".to_string()));
    };

    entries
        .into_iter()
        .map(|entry| match entry {
            Value::String(name) => Ok(DeviceInfo {
                name,
                description: None,
            }),
            Value::Array(pair) => {
                let mut pair = pair.into_iter();
                let name = match pair.next() {
                    Some(Value::String(name)) => name,
                    other => return Err(unexpected(format!("bad device name: {:?}", other))),
                };
                let description = match pair.next() {
                    Some(Value::String(desc)) => Some(desc),
                    _ => None,
                };
                Ok(DeviceInfo { name, description })
            }
            other => Err(unexpected(format!("bad device entry: {}", other))),
        })
        .collect()
}
