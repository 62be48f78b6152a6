//! Bit crusher - bit reduction, sample-and-hold and noise injection
//!
//! The chain runs the two halves at different points: bit reduction near
//! the start, noise injection after the filter.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{Block, Cached, DspContext, Effect, EffectKind, ParamExchange};
use crate::buffer::rms;
use crate::error::{DspError, DspResult};
use crate::types::{Sample, MAX_TRACKS};

/// Bit crusher parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BitCrusherParams {
    /// Resolution in bits (1..=24); 0 disables bit reduction
    pub bits: f32,
    /// Hold each sample for this many frames (1 disables)
    pub hold: usize,
    /// Noise level relative to the block level, 0..=1
    pub noise: f32,
}

impl Default for BitCrusherParams {
    fn default() -> Self {
        Self {
            bits: 8.0,
            hold: 1,
            noise: 0.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BitCrusherSettings {
    pub params: BitCrusherParams,
    /// Quantization steps per unit, 0 when disabled
    levels: f32,
}

#[derive(Debug, Clone, Copy, Default)]
struct HoldState {
    value: Sample,
    remaining: usize,
}

pub struct BitCrusher {
    ctx: DspContext,
    exchange: Arc<ParamExchange<BitCrusherSettings>>,
    cached: Cached<BitCrusherSettings>,
    hold: [HoldState; MAX_TRACKS],
    rng: [fastrand::Rng; MAX_TRACKS],
}

fn seeded_rngs() -> [fastrand::Rng; MAX_TRACKS] {
    std::array::from_fn(|t| fastrand::Rng::with_seed(0xc0ff_ee00 + t as u64))
}

impl BitCrusher {
    pub fn new(ctx: &DspContext, params: BitCrusherParams) -> DspResult<Self> {
        let exchange = Arc::new(ParamExchange::new(Self::derive(&params, ctx)?));
        Ok(Self {
            ctx: *ctx,
            cached: Cached::new(&exchange),
            exchange,
            hold: [HoldState::default(); MAX_TRACKS],
            rng: seeded_rngs(),
        })
    }

    /// Bit reduction and sample-and-hold
    pub fn reduce(&mut self, output: &mut [Sample], input: &[Sample], block: Block) {
        self.cached.refresh(&self.exchange);
        let s = self.cached.get();
        let range = block.range();
        let hold_frames = s.params.hold.max(1);
        let state = &mut self.hold[block.track.min(MAX_TRACKS - 1)];

        for (o, &x) in output[range.clone()].iter_mut().zip(&input[range]) {
            if state.remaining == 0 {
                state.value = if s.levels > 0.0 {
                    (x * s.levels).round() / s.levels
                } else {
                    x
                };
                state.remaining = hold_frames;
            }
            state.remaining -= 1;
            *o = state.value;
        }
    }

    /// Add noise scaled to the block level
    pub fn inject(&mut self, output: &mut [Sample], input: &[Sample], block: Block) {
        self.cached.refresh(&self.exchange);
        let s = self.cached.get();
        let range = block.range();
        let level = s.params.noise * rms(&input[range.clone()]);
        if level == 0.0 {
            output[range.clone()].copy_from_slice(&input[range]);
            return;
        }
        let rng = &mut self.rng[block.track.min(MAX_TRACKS - 1)];
        for (o, &x) in output[range.clone()].iter_mut().zip(&input[range]) {
            *o = x + level * (rng.f32() * 2.0 - 1.0);
        }
    }

    pub fn has_reduction(&self) -> bool {
        let s = self.exchange.load();
        s.levels > 0.0 || s.params.hold > 1
    }

    pub fn has_noise(&self) -> bool {
        self.exchange.load().params.noise > 0.0
    }
}

impl Effect for BitCrusher {
    type Params = BitCrusherParams;
    type Settings = BitCrusherSettings;

    const KIND: EffectKind = EffectKind::BitCrusher;

    fn derive(params: &BitCrusherParams, _ctx: &DspContext) -> DspResult<BitCrusherSettings> {
        if !(params.bits == 0.0 || (1.0..=24.0).contains(&params.bits)) {
            return Err(DspError::InvalidParameter {
                name: "bits",
                value: params.bits,
            });
        }
        if !(0.0..=1.0).contains(&params.noise) {
            return Err(DspError::InvalidParameter {
                name: "noise",
                value: params.noise,
            });
        }
        let levels = if params.bits > 0.0 {
            2.0_f32.powf(params.bits - 1.0)
        } else {
            0.0
        };
        Ok(BitCrusherSettings {
            params: params.clone(),
            levels,
        })
    }

    fn context(&self) -> &DspContext {
        &self.ctx
    }

    fn exchange(&self) -> &Arc<ParamExchange<BitCrusherSettings>> {
        &self.exchange
    }

    /// Both halves back to back, for use outside a chain
    fn process(&mut self, output: &mut [Sample], input: &[Sample], block: Block) {
        self.reduce(output, input, block);
        let range = block.range();
        let s = self.cached.get();
        let level = s.params.noise * rms(&output[range.clone()]);
        if level == 0.0 {
            return;
        }
        let rng = &mut self.rng[block.track.min(MAX_TRACKS - 1)];
        for o in output[range].iter_mut() {
            *o += level * (rng.f32() * 2.0 - 1.0);
        }
    }

    fn reset(&mut self) {
        self.hold = [HoldState::default(); MAX_TRACKS];
        self.rng = seeded_rngs();
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::{context, run_blocks, sine};
    use super::*;

    #[test]
    fn test_quantization_levels() {
        let params = BitCrusherParams {
            bits: 2.0,
            ..Default::default()
        };
        let mut crusher = BitCrusher::new(&context(), params).unwrap();
        let out = run_blocks(&mut crusher, &[0.1, 0.3, 0.6, -0.8], 4);
        assert_eq!(out, vec![0.0, 0.5, 0.5, -1.0]);
    }

    #[test]
    fn test_sample_and_hold() {
        let params = BitCrusherParams {
            bits: 0.0,
            hold: 3,
            noise: 0.0,
        };
        let mut crusher = BitCrusher::new(&context(), params).unwrap();
        let input: Vec<Sample> = (0..7).map(|i| i as f32 * 0.1).collect();
        let out = run_blocks(&mut crusher, &input, 4);
        assert_eq!(out, vec![0.0, 0.0, 0.0, 0.3, 0.3, 0.3, 0.6]);
    }

    #[test]
    fn test_noise_tracks_signal_level() {
        let params = BitCrusherParams {
            bits: 0.0,
            hold: 1,
            noise: 0.5,
        };
        let mut crusher = BitCrusher::new(&context(), params).unwrap();
        let silent = run_blocks(&mut crusher, &vec![0.0; 1024], 256);
        assert!(silent.iter().all(|&s| s == 0.0));
        let input = sine(440.0, 0.5, 1024);
        assert_ne!(run_blocks(&mut crusher, &input, 256), input);
    }

    #[test]
    fn test_invalid_bits() {
        let params = BitCrusherParams {
            bits: 32.0,
            ..Default::default()
        };
        assert!(BitCrusher::new(&context(), params).is_err());
    }
}
