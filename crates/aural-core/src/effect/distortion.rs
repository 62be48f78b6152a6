//! Distortion - drive, asymmetry and soft/hard clipping
//!
//! Zero drive is an exact bypass.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{Block, Cached, DspContext, Effect, EffectKind, ParamExchange};
use crate::error::{DspError, DspResult};
use crate::modulation::{ModulationConfig, Modulator};
use crate::types::Sample;

/// Input gain at full drive
const DRIVE_RANGE: f32 = 16.0;

/// Distortion parameters; all 0..=1
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistortionParams {
    pub drive: f32,
    /// 0 = hard clip, 1 = tanh saturation
    pub clip: f32,
    /// Attenuates the positive half-wave
    pub asymmetry: f32,
    pub mix: f32,
    /// Drive modulation; `min`/`max` in drive units, overrides `drive`
    pub modulation: Option<ModulationConfig>,
}

impl Default for DistortionParams {
    fn default() -> Self {
        Self {
            drive: 0.0,
            clip: 0.5,
            asymmetry: 0.0,
            mix: 1.0,
            modulation: None,
        }
    }
}

impl DistortionParams {
    pub fn with_drive(drive: f32) -> Self {
        Self {
            drive,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct DistortionSettings {
    pub params: DistortionParams,
    lfo: Option<Modulator>,
}

pub struct Distortion {
    ctx: DspContext,
    exchange: Arc<ParamExchange<DistortionSettings>>,
    cached: Cached<DistortionSettings>,
    lfo: Option<Modulator>,
}

impl Distortion {
    pub fn new(ctx: &DspContext, params: DistortionParams) -> DspResult<Self> {
        let settings = Self::derive(&params, ctx)?;
        let lfo = settings.lfo.clone();
        let exchange = Arc::new(ParamExchange::new(settings));
        Ok(Self {
            ctx: *ctx,
            cached: Cached::new(&exchange),
            exchange,
            lfo,
        })
    }
}

#[inline]
fn shape(x: f32, gain: f32, clip: f32, asymmetry: f32) -> f32 {
    let mut y = x * gain;
    if y > 0.0 {
        y *= 1.0 - 0.5 * asymmetry;
    }
    let y = (1.0 - clip) * y + clip * y.tanh();
    y.clamp(-1.0, 1.0)
}

impl Effect for Distortion {
    type Params = DistortionParams;
    type Settings = DistortionSettings;

    const KIND: EffectKind = EffectKind::Distortion;

    fn derive(params: &DistortionParams, ctx: &DspContext) -> DspResult<DistortionSettings> {
        for (name, value) in [
            ("drive", params.drive),
            ("clip", params.clip),
            ("asymmetry", params.asymmetry),
            ("mix", params.mix),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(DspError::InvalidParameter { name, value });
            }
        }
        let lfo = match &params.modulation {
            Some(config) => {
                let config = ModulationConfig {
                    min: config.min.clamp(0.0, 1.0),
                    max: config.max.clamp(0.0, 1.0),
                    ..config.clone()
                };
                Some(Modulator::with_config(config, ctx.sample_rate, ctx.period_frames)?)
            }
            None => None,
        };
        Ok(DistortionSettings {
            params: params.clone(),
            lfo,
        })
    }

    fn context(&self) -> &DspContext {
        &self.ctx
    }

    fn exchange(&self) -> &Arc<ParamExchange<DistortionSettings>> {
        &self.exchange
    }

    fn process(&mut self, output: &mut [Sample], input: &[Sample], block: Block) {
        if self.cached.refresh(&self.exchange) {
            let settings = self.cached.get();
            match (&mut self.lfo, &settings.lfo) {
                (Some(mine), Some(theirs)) if mine.config() == theirs.config() => {}
                (mine, theirs) => mine.clone_from(theirs),
            }
        }
        let s = self.cached.get();
        let range = block.range();
        let drive = match self.lfo.as_mut() {
            Some(lfo) => lfo.get(block.track, Some(&input[range.clone()]), block.frames),
            None => s.params.drive,
        };

        if drive == 0.0 {
            output[range.clone()].copy_from_slice(&input[range]);
            return;
        }

        let gain = 1.0 + drive * DRIVE_RANGE;
        let DistortionParams {
            clip, asymmetry, mix, ..
        } = s.params;
        for (o, &x) in output[range.clone()].iter_mut().zip(&input[range]) {
            let y = shape(x, gain, clip, asymmetry);
            *o = x + (y - x) * mix;
        }
    }

    fn reset(&mut self) {
        if let Some(lfo) = self.lfo.as_mut() {
            lfo.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::{context, run_blocks, sine};
    use super::*;

    #[test]
    fn test_zero_drive_is_identity() {
        let params = DistortionParams {
            drive: 0.0,
            clip: 1.0,
            asymmetry: 0.7,
            mix: 1.0,
            modulation: None,
        };
        let mut distortion = Distortion::new(&context(), params).unwrap();
        let input = sine(1000.0, 0.5, 48000);
        let output = run_blocks(&mut distortion, &input, 512);
        assert_eq!(output, input);
    }

    #[test]
    fn test_drive_clips() {
        let params = DistortionParams::with_drive(1.0);
        let mut distortion = Distortion::new(&context(), params).unwrap();
        let input = sine(1000.0, 0.5, 4800);
        let output = run_blocks(&mut distortion, &input, 512);
        assert!(output.iter().all(|s| s.abs() <= 1.0));
        let peak = output.iter().fold(0.0_f32, |m, s| m.max(s.abs()));
        assert!(peak > 0.9);
    }

    #[test]
    fn test_asymmetry() {
        let y_pos = shape(0.5, 1.0, 0.0, 1.0);
        let y_neg = shape(-0.5, 1.0, 0.0, 1.0);
        assert!((y_pos - 0.25).abs() < 1e-6);
        assert!((y_neg + 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_mix_zero_is_dry() {
        let params = DistortionParams {
            drive: 0.8,
            mix: 0.0,
            ..Default::default()
        };
        let mut distortion = Distortion::new(&context(), params).unwrap();
        let input = sine(100.0, 0.3, 1024);
        assert_eq!(run_blocks(&mut distortion, &input, 256), input);
    }

    #[test]
    fn test_out_of_range_rejected() {
        assert!(Distortion::new(&context(), DistortionParams::with_drive(1.5)).is_err());
    }
}
