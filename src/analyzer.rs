//! Spectrum temporal analyzer
//!
//! Smooths telemetry frames into short and long running averages and a
//! per-bin peak hold. Everything is computed in dB. Buffers are sized by the
//! first frame and reused, so steady-state updates never allocate.

use std::time::Duration;

use crate::config::AnalyzerConfig;

/// Read-only view of the analyzer series
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnalyzerSnapshot<'a> {
    pub live: &'a [f32],
    pub short: &'a [f32],
    pub long: &'a [f32],
    pub peak: &'a [f32],
}

/// Per-bin averaging and peak hold
#[derive(Debug, Clone)]
pub struct SpectrumAnalyzer {
    config: AnalyzerConfig,
    live: Vec<f32>,
    short: Vec<f32>,
    long: Vec<f32>,
    peak: Vec<f32>,
    /// Time of the last peak hit per bin, in seconds
    peak_hit: Vec<f64>,
    last_update: Option<f64>,
}

impl SpectrumAnalyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        Self {
            config,
            live: Vec::new(),
            short: Vec::new(),
            long: Vec::new(),
            peak: Vec::new(),
            peak_hit: Vec::new(),
            last_update: None,
        }
    }

    /// Feed one frame taken at `now` (any monotonic origin).
    ///
    /// The first frame, and any frame with a different bin count, seeds every
    /// series to the live values.
    pub fn update(&mut self, levels: &[f32], now: Duration) {
        let now = now.as_secs_f64();

        let last = match self.last_update {
            Some(last) if levels.len() == self.live.len() => last,
            _ => {
                self.seed(levels, now);
                return;
            }
        };

        let dt = (now - last).clamp(0.0, self.config.max_dt);
        let short_keep = (-dt / self.config.short_tau).exp() as f32;
        let long_keep = (-dt / self.config.long_tau).exp() as f32;
        let hold = self.config.peak_hold;
        let rate = self.config.peak_decay_db_per_s;

        for (i, &level) in levels.iter().enumerate() {
            self.live[i] = level;
            self.short[i] = short_keep * self.short[i] + (1.0 - short_keep) * level;
            self.long[i] = long_keep * self.long[i] + (1.0 - long_keep) * level;

            if level >= self.peak[i] {
                self.peak[i] = level;
                self.peak_hit[i] = now;
                continue;
            }

            let held = now - self.peak_hit[i];
            if held > hold {
                // Only the part of this interval past the hold counts
                let falling = dt.min(held - hold);
                self.peak[i] = (self.peak[i] - (rate * falling) as f32).max(level);
            }
        }

        self.last_update = Some(now);
    }

    /// Reseed the short and long averages to the live frame. Peaks are kept.
    pub fn reset_averages(&mut self) {
        self.short.copy_from_slice(&self.live);
        self.long.copy_from_slice(&self.live);
    }

    pub fn state(&self) -> AnalyzerSnapshot<'_> {
        AnalyzerSnapshot {
            live: &self.live,
            short: &self.short,
            long: &self.long,
            peak: &self.peak,
        }
    }

    /// No frame within the staleness window, or no frame at all
    pub fn is_stale(&self, now: Duration) -> bool {
        match self.last_update {
            Some(last) => now.as_secs_f64() - last > self.config.stale_after,
            None => true,
        }
    }

    pub fn bins(&self) -> usize {
        self.live.len()
    }

    pub fn is_initialized(&self) -> bool {
        self.last_update.is_some()
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    fn seed(&mut self, levels: &[f32], now: f64) {
        for series in [&mut self.live, &mut self.short, &mut self.long, &mut self.peak] {
            series.clear();
            series.extend_from_slice(levels);
        }
        self.peak_hit.clear();
        self.peak_hit.resize(levels.len(), now);
        self.last_update = Some(now);
    }
}
