//! Renderer configuration
//!
//! Everything the renderer needs at start: the stream layout requested
//! from the backend, the history reservoir, pool sizing, the per-block
//! time budget and the effects on the output bus.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::BackendConfig;
use crate::buffer::InterpolationMethod;
use crate::effect::{DspContext, EffectPreset};
use crate::engine::COMMAND_QUEUE_CAPACITY;
use crate::error::{DspError, DspResult};
use crate::types::{
    SampleFormat, DEFAULT_HISTORY_SECONDS, DEFAULT_PERIOD_FRAMES, DEFAULT_SAMPLE_RATE, MAX_TRACKS,
    MAX_WORKERS,
};

/// Renderer configuration
///
/// Serialized as YAML; omitted fields take their defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub sample_rate: f32,
    /// Block length in frames
    pub period_frames: usize,
    pub tracks: usize,
    pub format: SampleFormat,
    /// History reservoir in seconds; covers the longest effect delay
    pub history_seconds: f32,
    /// Upper bound on the worker pool (further capped by physical cores)
    pub max_workers: usize,
    /// Bounded wait for an available worker, in milliseconds
    pub dispatch_timeout_ms: u64,
    /// Fraction of the block period the barrier may wait for jobs
    pub deadline_slack: f32,
    /// Resampling quality used when mixing sources
    pub interpolation: InterpolationMethod,
    pub command_capacity: usize,
    /// Effects applied to each output track after mixing
    pub bus_effects: Vec<EffectPreset>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            period_frames: DEFAULT_PERIOD_FRAMES,
            tracks: 2,
            format: SampleFormat::F32,
            history_seconds: DEFAULT_HISTORY_SECONDS,
            max_workers: MAX_WORKERS,
            dispatch_timeout_ms: 2,
            deadline_slack: 0.75,
            interpolation: InterpolationMethod::Cubic,
            command_capacity: COMMAND_QUEUE_CAPACITY,
            bus_effects: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Small blocks and a short reservoir for interactive use
    pub fn low_latency() -> Self {
        Self {
            period_frames: 128,
            history_seconds: 0.25,
            deadline_slack: 0.5,
            dispatch_timeout_ms: 1,
            interpolation: InterpolationMethod::Linear,
            ..Self::default()
        }
    }

    /// Large blocks for offline rendering where latency doesn't matter
    pub fn offline() -> Self {
        Self {
            period_frames: 4096,
            history_seconds: 2.0,
            deadline_slack: 1.0,
            dispatch_timeout_ms: 100,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> DspResult<()> {
        if !(self.sample_rate > 0.0) {
            return Err(DspError::InvalidParameter {
                name: "sample_rate",
                value: self.sample_rate,
            });
        }
        if self.period_frames == 0 {
            return Err(DspError::InvalidParameter {
                name: "period_frames",
                value: 0.0,
            });
        }
        if self.tracks == 0 || self.tracks > MAX_TRACKS {
            return Err(DspError::InvalidParameter {
                name: "tracks",
                value: self.tracks as f32,
            });
        }
        if !(self.history_seconds >= 0.0) {
            return Err(DspError::InvalidParameter {
                name: "history_seconds",
                value: self.history_seconds,
            });
        }
        if !(self.deadline_slack > 0.0 && self.deadline_slack <= 1.0) {
            return Err(DspError::InvalidParameter {
                name: "deadline_slack",
                value: self.deadline_slack,
            });
        }
        Ok(())
    }

    /// Grow the history reservoir to cover the longest bus delay
    pub fn fit_history(&mut self) {
        let longest = self
            .bus_effects
            .iter()
            .filter_map(EffectPreset::delay_seconds)
            .fold(0.0_f32, f32::max);
        if longest > self.history_seconds {
            log::info!(
                "History reservoir raised from {}s to {}s for bus delays",
                self.history_seconds,
                longest
            );
            self.history_seconds = longest;
        }
    }

    /// Layout to request from the backend
    pub fn backend_request(&self) -> BackendConfig {
        BackendConfig {
            sample_rate: self.sample_rate,
            tracks: self.tracks,
            format: self.format,
            period_frames: self.period_frames,
        }
    }

    /// Adopt what the backend actually achieved
    pub fn apply_achieved(&mut self, achieved: &BackendConfig) {
        if achieved.sample_rate != self.sample_rate
            || achieved.tracks != self.tracks
            || achieved.format != self.format
            || achieved.period_frames != self.period_frames
        {
            log::info!(
                "Backend achieved {} Hz / {} tracks / {:?} / {} frames \
                 (requested {} Hz / {} tracks / {:?} / {} frames)",
                achieved.sample_rate,
                achieved.tracks,
                achieved.format,
                achieved.period_frames,
                self.sample_rate,
                self.tracks,
                self.format,
                self.period_frames
            );
        }
        self.sample_rate = achieved.sample_rate;
        self.tracks = achieved.tracks.clamp(1, MAX_TRACKS);
        self.format = achieved.format;
        self.period_frames = achieved.period_frames;
    }

    pub fn context(&self) -> DspResult<DspContext> {
        DspContext::new(self.sample_rate, self.period_frames, self.tracks)
    }

    /// Wall-clock length of one block
    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(self.period_frames as f64 / self.sample_rate.max(1.0) as f64)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }

    /// Time the barrier may wait, measured from the start of a block
    pub fn block_budget(&self) -> Duration {
        self.period().mul_f32(self.deadline_slack.clamp(0.0, 1.0))
    }
}
