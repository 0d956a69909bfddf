//! UI-facing projection of a configuration snapshot

use serde::Serialize;
use std::collections::HashSet;

use crate::protocol::{DspConfig, PipelineStep};

/// One filter as the editor shows it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Band {
    pub name: String,
    /// Filter type, e.g. `Biquad`
    pub kind: String,
    /// Biquad sub-type, e.g. `Peaking`
    pub subtype: Option<String>,
    pub freq: Option<f64>,
    pub gain: Option<f64>,
    pub q: Option<f64>,
    pub channels: Vec<usize>,
    pub enabled: bool,
    /// Index of the pipeline step the band was taken from
    pub step: usize,
}

/// Everything a rendering layer needs, derived from one snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EqView {
    /// Bands in pipeline order
    pub bands: Vec<Band>,
    pub steps: usize,
    pub mixers: Vec<String>,
    pub processors: Vec<String>,
}

impl EqView {
    /// Derive the view. A filter referenced by several steps appears once,
    /// at its first occurrence.
    pub fn from_config(config: &DspConfig) -> Self {
        let mut view = EqView {
            steps: config.pipeline.len(),
            ..Self::default()
        };
        let mut seen = HashSet::new();

        for (index, step) in config.pipeline.iter().enumerate() {
            match step {
                PipelineStep::Filter { names, .. } => {
                    let channels = step.filter_channels();
                    for name in names {
                        if !seen.insert(name.as_str()) {
                            continue;
                        }
                        let Some(def) = config.filters.get(name) else {
                            continue;
                        };
                        view.bands.push(Band {
                            name: name.clone(),
                            kind: def.kind.clone(),
                            subtype: def.subtype().map(str::to_string),
                            freq: def.parameter("freq"),
                            gain: def.parameter("gain"),
                            q: def.parameter("q"),
                            channels: channels.clone(),
                            enabled: !step.is_bypassed(),
                            step: index,
                        });
                    }
                }
                PipelineStep::Mixer { name, .. } => view.mixers.push(name.clone()),
                PipelineStep::Processor { name, .. } => view.processors.push(name.clone()),
            }
        }
        view
    }

    pub fn band(&self, name: &str) -> Option<&Band> {
        self.bands.iter().find(|band| band.name == name)
    }
}
