//! Multi-stage timed envelopes
//!
//! Stage durations are given in seconds and converted to a whole number of
//! blocks when the envelope is set up, so the envelope advances exactly one
//! step per processed block.

use serde::{Deserialize, Serialize};

use crate::error::{DspError, DspResult};
use crate::types::LEVEL_96DB;

/// Interpolation between two stage levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Curve {
    #[default]
    Linear,
    Exponential,
}

/// One envelope segment: move to `level` over `duration` seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub level: f32,
    pub duration: f32,
    #[serde(default)]
    pub curve: Curve,
}

impl Stage {
    pub fn new(level: f32, duration: f32, curve: Curve) -> Self {
        Self {
            level,
            duration,
            curve,
        }
    }
}

/// Per-track progress through an envelope
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EnvelopeState {
    stage: usize,
    step: u32,
    from: f32,
    value: f32,
    released: bool,
}

impl EnvelopeState {
    #[inline]
    pub fn value(&self) -> f32 {
        self.value
    }
}

/// A sequence of timed stages with an optional sustain point
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    start: f32,
    stages: Vec<Stage>,
    /// Stage index held until `release`
    sustain: Option<usize>,
    /// Length of each stage in blocks
    blocks: Vec<u32>,
}

impl Envelope {
    pub fn new(start: f32, stages: Vec<Stage>, sustain: Option<usize>) -> DspResult<Self> {
        if let Some(index) = sustain {
            if index >= stages.len() {
                return Err(DspError::InvalidParameter {
                    name: "sustain",
                    value: index as f32,
                });
            }
        }
        if let Some(stage) = stages.iter().find(|s| !(s.duration >= 0.0)) {
            return Err(DspError::InvalidParameter {
                name: "duration",
                value: stage.duration,
            });
        }
        let blocks = vec![1; stages.len()];
        Ok(Self {
            start,
            stages,
            sustain,
            blocks,
        })
    }

    /// Two-level transition, as used by the timed-transition waveform
    pub fn transition(from: f32, to: f32, duration: f32, curve: Curve) -> DspResult<Self> {
        Self::new(from, vec![Stage::new(to, duration, curve)], None)
    }

    /// Convert stage durations to block counts
    pub fn setup(&mut self, sample_rate: f32, period_frames: usize) {
        let blocks_per_second = sample_rate / period_frames.max(1) as f32;
        self.blocks = self
            .stages
            .iter()
            .map(|s| ((s.duration * blocks_per_second).round() as u32).max(1))
            .collect();
    }

    /// Length of a stage in blocks
    pub fn stage_blocks(&self, stage: usize) -> Option<u32> {
        self.blocks.get(stage).copied()
    }

    /// Fresh state positioned at the start level
    pub fn start(&self) -> EnvelopeState {
        EnvelopeState {
            stage: 0,
            step: 0,
            from: self.start,
            value: self.start,
            released: false,
        }
    }

    /// Whether every stage has completed
    pub fn finished(&self, state: &EnvelopeState) -> bool {
        state.stage >= self.stages.len()
    }

    /// Leave the sustain stage
    pub fn release(&self, state: &mut EnvelopeState) {
        state.released = true;
        if let Some(sustain) = self.sustain {
            if state.stage <= sustain {
                state.stage = sustain + 1;
                state.step = 0;
                state.from = state.value;
            }
        }
    }

    /// Advance one block and return the new level
    pub fn next(&self, state: &mut EnvelopeState) -> f32 {
        let Some(stage) = self.stages.get(state.stage) else {
            return state.value;
        };
        let blocks = self.blocks[state.stage];
        if state.step >= blocks {
            // Only reachable while held at the sustain stage
            return state.value;
        }

        state.step += 1;
        let x = state.step as f32 / blocks as f32;
        state.value = if state.step == blocks {
            stage.level
        } else {
            interpolate(state.from, stage.level, x, stage.curve)
        };

        if state.step == blocks {
            let held = self.sustain == Some(state.stage) && !state.released;
            if !held {
                state.stage += 1;
                state.step = 0;
                state.from = state.value;
            }
        }
        state.value
    }
}

#[inline]
fn interpolate(from: f32, to: f32, x: f32, curve: Curve) -> f32 {
    match curve {
        Curve::Linear => from + (to - from) * x,
        Curve::Exponential => {
            let a = from.abs().max(LEVEL_96DB);
            let b = to.abs().max(LEVEL_96DB);
            let sign = if to < 0.0 || (to == 0.0 && from < 0.0) { -1.0 } else { 1.0 };
            sign * a * (b / a).powf(x)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_transition_block_count() {
        // 1s at 1000Hz with 100-frame blocks = 10 blocks
        let mut env = Envelope::transition(0.0, 1.0, 1.0, Curve::Linear).unwrap();
        env.setup(1000.0, 100);
        assert_eq!(env.stage_blocks(0), Some(10));

        let mut state = env.start();
        let values: Vec<f32> = (0..10).map(|_| env.next(&mut state)).collect();
        assert!((values[4] - 0.5).abs() < 1e-6);
        assert_eq!(values[9], 1.0);
        assert!(env.finished(&state));
        assert_eq!(env.next(&mut state), 1.0);
    }

    #[test]
    fn test_exponential_transition_is_monotonic() {
        let mut env = Envelope::transition(1.0, 0.01, 0.5, Curve::Exponential).unwrap();
        env.setup(1000.0, 50);
        let mut state = env.start();
        let mut last = 1.0;
        for _ in 0..10 {
            let v = env.next(&mut state);
            assert!(v < last);
            last = v;
        }
        assert_eq!(last, 0.01);
    }

    #[test]
    fn test_sustain_and_release() {
        let stages = vec![
            Stage::new(1.0, 0.1, Curve::Linear),
            Stage::new(0.5, 0.1, Curve::Linear),
            Stage::new(0.0, 0.1, Curve::Linear),
        ];
        let mut env = Envelope::new(0.0, stages, Some(1)).unwrap();
        env.setup(1000.0, 100);
        let mut state = env.start();

        assert_eq!(env.next(&mut state), 1.0);
        assert_eq!(env.next(&mut state), 0.5);
        // Held at sustain
        assert_eq!(env.next(&mut state), 0.5);
        assert_eq!(env.next(&mut state), 0.5);

        env.release(&mut state);
        assert_eq!(env.next(&mut state), 0.0);
        assert!(env.finished(&state));
    }

    #[test]
    fn test_invalid_sustain() {
        assert!(Envelope::new(0.0, vec![Stage::new(1.0, 0.1, Curve::Linear)], Some(1)).is_err());
        assert!(Envelope::new(0.0, vec![Stage::new(1.0, -1.0, Curve::Linear)], None).is_err());
    }
}
