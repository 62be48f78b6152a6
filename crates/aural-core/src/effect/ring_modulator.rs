//! Ring modulator - multiply by a carrier oscillator

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{Block, Cached, DspContext, Effect, EffectKind, ParamExchange};
use crate::error::{DspError, DspResult};
use crate::modulation::{ModulationConfig, Modulator, Waveform};
use crate::types::{Sample, MAX_TRACKS};

/// Ring modulator parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RingModulatorParams {
    /// Carrier frequency in Hz, constant or swept
    pub frequency: ModulationConfig,
    pub carrier: Waveform,
    /// 0 = dry, 1 = fully modulated
    pub mix: f32,
    pub gain: f32,
}

impl Default for RingModulatorParams {
    fn default() -> Self {
        Self {
            frequency: ModulationConfig::constant(440.0),
            carrier: Waveform::Sine,
            mix: 1.0,
            gain: 1.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RingModulatorSettings {
    pub params: RingModulatorParams,
    lfo: Modulator,
}

pub struct RingModulator {
    ctx: DspContext,
    exchange: Arc<ParamExchange<RingModulatorSettings>>,
    cached: Cached<RingModulatorSettings>,
    lfo: Modulator,
    phase: [f32; MAX_TRACKS],
}

impl RingModulator {
    pub fn new(ctx: &DspContext, params: RingModulatorParams) -> DspResult<Self> {
        let settings = Self::derive(&params, ctx)?;
        let lfo = settings.lfo.clone();
        let exchange = Arc::new(ParamExchange::new(settings));
        Ok(Self {
            ctx: *ctx,
            cached: Cached::new(&exchange),
            exchange,
            lfo,
            phase: [0.0; MAX_TRACKS],
        })
    }
}

impl Effect for RingModulator {
    type Params = RingModulatorParams;
    type Settings = RingModulatorSettings;

    const KIND: EffectKind = EffectKind::RingModulator;

    fn derive(params: &RingModulatorParams, ctx: &DspContext) -> DspResult<RingModulatorSettings> {
        if !params.carrier.is_periodic() {
            return Err(DspError::InvalidParameter {
                name: "carrier",
                value: 0.0,
            });
        }
        if !(0.0..=1.0).contains(&params.mix) {
            return Err(DspError::InvalidParameter {
                name: "mix",
                value: params.mix,
            });
        }
        let nyquist = ctx.sample_rate * 0.5;
        for value in [params.frequency.min, params.frequency.max] {
            if !(0.0..nyquist).contains(&value) {
                return Err(DspError::InvalidParameter {
                    name: "frequency",
                    value,
                });
            }
        }
        let lfo =
            Modulator::with_config(params.frequency.clone(), ctx.sample_rate, ctx.period_frames)?;
        Ok(RingModulatorSettings {
            params: params.clone(),
            lfo,
        })
    }

    fn context(&self) -> &DspContext {
        &self.ctx
    }

    fn exchange(&self) -> &Arc<ParamExchange<RingModulatorSettings>> {
        &self.exchange
    }

    fn process(&mut self, output: &mut [Sample], input: &[Sample], block: Block) {
        if self.cached.refresh(&self.exchange) {
            let settings = self.cached.get();
            if settings.lfo.config() != self.lfo.config() {
                self.lfo.clone_from(&settings.lfo);
            }
        }
        let s = self.cached.get();
        let range = block.range();
        let frequency = self.lfo.get(block.track, Some(&input[range.clone()]), block.frames);
        let step = frequency / self.ctx.sample_rate;
        let RingModulatorParams { carrier, mix, gain, .. } = s.params;

        let phase = &mut self.phase[block.track.min(MAX_TRACKS - 1)];
        for (o, &x) in output[range.clone()].iter_mut().zip(&input[range]) {
            let c = 2.0 * carrier.shape(*phase) - 1.0;
            *o = gain * (x * (1.0 - mix) + x * c * mix);
            *phase = (*phase + step).fract();
        }
    }

    fn reset(&mut self) {
        self.phase = [0.0; MAX_TRACKS];
        self.lfo.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::{context, run_blocks, sine};
    use super::*;

    #[test]
    fn test_dc_becomes_carrier() {
        let params = RingModulatorParams {
            frequency: ModulationConfig::constant(1000.0),
            carrier: Waveform::Square,
            ..Default::default()
        };
        let mut ring = RingModulator::new(&context(), params).unwrap();
        let out = run_blocks(&mut ring, &vec![0.5; 96], 96);
        // 48 samples per period: a square alternates sign every 24
        assert!(out[..24].iter().all(|&s| s.abs() == 0.5));
        assert_ne!(out[0].signum(), out[30].signum());
    }

    #[test]
    fn test_zero_mix_is_dry() {
        let params = RingModulatorParams {
            mix: 0.0,
            ..Default::default()
        };
        let mut ring = RingModulator::new(&context(), params).unwrap();
        let input = sine(200.0, 0.5, 1024);
        assert_eq!(run_blocks(&mut ring, &input, 256), input);
    }

    #[test]
    fn test_non_periodic_carrier_rejected() {
        let params = RingModulatorParams {
            carrier: Waveform::EnvelopeFollow,
            ..Default::default()
        };
        assert!(RingModulator::new(&context(), params).is_err());
    }
}
