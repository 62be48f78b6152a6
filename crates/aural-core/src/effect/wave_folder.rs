//! Wave folder - reflects the driven signal back into [-1, 1]

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{Block, Cached, DspContext, Effect, EffectKind, ParamExchange};
use crate::error::{DspError, DspResult};
use crate::modulation::{ModulationConfig, Modulator};
use crate::types::Sample;

/// Wave folder parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaveFolderParams {
    /// Input gain, usually swept by an LFO (1..=16)
    pub gain: ModulationConfig,
    /// DC offset added before folding
    pub bias: f32,
    pub mix: f32,
}

impl Default for WaveFolderParams {
    fn default() -> Self {
        Self {
            gain: ModulationConfig::constant(1.0),
            bias: 0.0,
            mix: 1.0,
        }
    }
}

/// Triangle fold with period 4; the identity on [-1, 1]
#[inline]
pub fn fold(x: f32) -> f32 {
    if x.abs() <= 1.0 {
        return x;
    }
    let t = (x + 1.0).rem_euclid(4.0);
    if t < 2.0 {
        t - 1.0
    } else {
        3.0 - t
    }
}

#[derive(Debug, Clone)]
pub struct WaveFolderSettings {
    pub params: WaveFolderParams,
    lfo: Modulator,
}

pub struct WaveFolder {
    ctx: DspContext,
    exchange: Arc<ParamExchange<WaveFolderSettings>>,
    cached: Cached<WaveFolderSettings>,
    lfo: Modulator,
}

impl WaveFolder {
    pub fn new(ctx: &DspContext, params: WaveFolderParams) -> DspResult<Self> {
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

impl Effect for WaveFolder {
    type Params = WaveFolderParams;
    type Settings = WaveFolderSettings;

    const KIND: EffectKind = EffectKind::WaveFolder;

    fn derive(params: &WaveFolderParams, ctx: &DspContext) -> DspResult<WaveFolderSettings> {
        for value in [params.gain.min, params.gain.max] {
            if !(1.0..=16.0).contains(&value) {
                return Err(DspError::InvalidParameter { name: "gain", value });
            }
        }
        if !(0.0..=1.0).contains(&params.mix) {
            return Err(DspError::InvalidParameter {
                name: "mix",
                value: params.mix,
            });
        }
        if !(params.bias.abs() <= 1.0) {
            return Err(DspError::InvalidParameter {
                name: "bias",
                value: params.bias,
            });
        }
        let lfo = Modulator::with_config(params.gain.clone(), ctx.sample_rate, ctx.period_frames)?;
        Ok(WaveFolderSettings {
            params: params.clone(),
            lfo,
        })
    }

    fn context(&self) -> &DspContext {
        &self.ctx
    }

    fn exchange(&self) -> &Arc<ParamExchange<WaveFolderSettings>> {
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
        let gain = self.lfo.get(block.track, Some(&input[range.clone()]), block.frames);
        let WaveFolderParams { bias, mix, .. } = s.params;
        // Subtracting the folded bias keeps silence silent
        let rest = fold(bias);

        for (o, &x) in output[range.clone()].iter_mut().zip(&input[range]) {
            let y = fold(x * gain + bias) - rest;
            *o = x + (y - x) * mix;
        }
    }

    fn reset(&mut self) {
        self.lfo.reset();
    }
}
