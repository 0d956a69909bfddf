//! Configuration snapshot exchanged with the engine
//!
//! The engine owns this document. Only the parts the client reasons about are
//! typed; everything else round-trips through `serde_json::Value` untouched.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::{ProtocolError, ValidationError};

/// Full engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DspConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Capture/playback device section, opaque to the client
    #[serde(default)]
    pub devices: Value,

    #[serde(default, deserialize_with = "null_as_default")]
    pub filters: BTreeMap<String, FilterDef>,

    #[serde(default, deserialize_with = "null_as_default")]
    pub mixers: BTreeMap<String, Value>,

    #[serde(default, deserialize_with = "null_as_default")]
    pub processors: BTreeMap<String, Value>,

    #[serde(default, deserialize_with = "null_as_default")]
    pub pipeline: Vec<PipelineStep>,

    /// Top-level keys the client does not model
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A named filter definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterDef {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default)]
    pub parameters: Value,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl FilterDef {
    /// Read a numeric parameter such as `freq`, `gain` or `q`
    pub fn parameter(&self, key: &str) -> Option<f64> {
        self.parameters.get(key).and_then(Value::as_f64)
    }

    /// Sub-type inside `parameters` (e.g. `Peaking` for a biquad)
    pub fn subtype(&self) -> Option<&str> {
        self.parameters.get("type").and_then(Value::as_str)
    }

    pub fn set_parameter(&mut self, key: &str, value: f64) {
        if !self.parameters.is_object() {
            self.parameters = Value::Object(Map::new());
        }
        if let Value::Object(map) = &mut self.parameters {
            map.insert(key.to_string(), Value::from(value));
        }
    }
}

/// One step of the processing pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PipelineStep {
    Filter {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channels: Option<Vec<usize>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<usize>,
        #[serde(default)]
        names: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bypassed: Option<bool>,
    },
    Mixer {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bypassed: Option<bool>,
    },
    Processor {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bypassed: Option<bool>,
    },
}

impl PipelineStep {
    pub fn filter(channels: Vec<usize>, names: Vec<String>) -> Self {
        PipelineStep::Filter {
            channels: Some(channels),
            channel: None,
            names,
            description: None,
            bypassed: None,
        }
    }

    pub fn mixer(name: impl Into<String>) -> Self {
        PipelineStep::Mixer {
            name: name.into(),
            description: None,
            bypassed: None,
        }
    }

    pub fn is_bypassed(&self) -> bool {
        match self {
            PipelineStep::Filter { bypassed, .. }
            | PipelineStep::Mixer { bypassed, .. }
            | PipelineStep::Processor { bypassed, .. } => bypassed.unwrap_or(false),
        }
    }

    pub fn set_bypassed(&mut self, value: bool) {
        match self {
            PipelineStep::Filter { bypassed, .. }
            | PipelineStep::Mixer { bypassed, .. }
            | PipelineStep::Processor { bypassed, .. } => *bypassed = Some(value),
        }
    }

    /// Channels a filter step applies to, merging the legacy single-channel form
    pub fn filter_channels(&self) -> Vec<usize> {
        match self {
            PipelineStep::Filter {
                channels, channel, ..
            } => match (channels, channel) {
                (Some(list), _) => list.clone(),
                (None, Some(single)) => vec![*single],
                (None, None) => Vec::new(),
            },
            _ => Vec::new(),
        }
    }
}

impl DspConfig {
    /// Parse the JSON string carried by `GetConfigJson`
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::UnexpectedValue {
            command: "GetConfigJson".to_string(),
            reason: e.to_string(),
        })
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    /// Check that every pipeline step references an existing definition
    pub fn validate(&self) -> Result<(), ValidationError> {
        for (step, entry) in self.pipeline.iter().enumerate() {
            match entry {
                PipelineStep::Filter { names, .. } => {
                    if let Some(name) = names.iter().find(|n| !self.filters.contains_key(*n)) {
                        return Err(ValidationError::UnknownFilter {
                            step,
                            name: name.clone(),
                        });
                    }
                }
                PipelineStep::Mixer { name, .. } => {
                    if !self.mixers.contains_key(name) {
                        return Err(ValidationError::UnknownMixer {
                            step,
                            name: name.clone(),
                        });
                    }
                }
                PipelineStep::Processor { name, .. } => {
                    if !self.processors.contains_key(name) {
                        return Err(ValidationError::UnknownProcessor {
                            step,
                            name: name.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
