//! Convolution with a recorded impulse response
//!
//! Direct-form convolution against a sparse tap list: impulse samples
//! below the threshold are dropped when the parameters are derived, so
//! long but mostly quiet responses stay cheap.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::filter::FilterState;
use super::{
    Block, Cached, DspContext, Effect, EffectKind, FilterCoefficients, FilterParams, ParamExchange,
};
use crate::buffer::DelayHistory;
use crate::error::{DspError, DspResult};
use crate::types::{Sample, LEVEL_96DB, MAX_TRACKS};

/// Convolution parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvolutionParams {
    /// One response per track; a single response is shared by all tracks
    pub impulse: Vec<Vec<Sample>>,
    /// Impulse samples below this magnitude are skipped
    pub threshold: f32,
    pub dry_gain: f32,
    pub wet_gain: f32,
    /// Optional low-pass on the wet signal, in Hz
    pub cutoff: Option<f32>,
}

impl Default for ConvolutionParams {
    fn default() -> Self {
        Self {
            impulse: vec![vec![1.0]],
            threshold: LEVEL_96DB,
            dry_gain: 0.0,
            wet_gain: 1.0,
            cutoff: None,
        }
    }
}

impl ConvolutionParams {
    pub fn mono(impulse: Vec<Sample>) -> Self {
        Self {
            impulse: vec![impulse],
            ..Default::default()
        }
    }

    fn longest(&self) -> usize {
        self.impulse.iter().map(Vec::len).max().unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
pub struct ConvolutionSettings {
    pub params: ConvolutionParams,
    /// (offset, gain) per track
    taps: Vec<Vec<(usize, f32)>>,
    lowpass: Option<FilterCoefficients>,
}

pub struct Convolution {
    ctx: DspContext,
    exchange: Arc<ParamExchange<ConvolutionSettings>>,
    cached: Cached<ConvolutionSettings>,
    history: Vec<DelayHistory>,
    /// Longest response the history can hold
    longest: usize,
    lowpass: [FilterState; MAX_TRACKS],
}

impl Convolution {
    pub fn new(ctx: &DspContext, params: ConvolutionParams) -> DspResult<Self> {
        let settings = Self::derive(&params, ctx)?;
        let longest = params.longest();
        let capacity = longest + ctx.period_frames;
        let mut history = Vec::with_capacity(ctx.tracks);
        for _ in 0..ctx.tracks {
            history.push(DelayHistory::new(capacity)?);
        }
        let exchange = Arc::new(ParamExchange::new(settings));
        Ok(Self {
            ctx: *ctx,
            cached: Cached::new(&exchange),
            exchange,
            history,
            longest,
            lowpass: [FilterState::default(); MAX_TRACKS],
        })
    }

    /// Number of taps that survived the threshold for a track
    pub fn tap_count(&self, track: usize) -> usize {
        self.exchange.load().taps.get(track).map(Vec::len).unwrap_or(0)
    }
}

impl Effect for Convolution {
    type Params = ConvolutionParams;
    type Settings = ConvolutionSettings;

    const KIND: EffectKind = EffectKind::Convolution;

    fn derive(params: &ConvolutionParams, ctx: &DspContext) -> DspResult<ConvolutionSettings> {
        if params.longest() == 0 {
            return Err(DspError::EmptyImpulse);
        }
        if !(params.threshold >= 0.0) {
            return Err(DspError::InvalidParameter {
                name: "threshold",
                value: params.threshold,
            });
        }

        let mut taps = Vec::with_capacity(ctx.tracks);
        for t in 0..ctx.tracks {
            let response = &params.impulse[t % params.impulse.len()];
            let track_taps: Vec<(usize, f32)> = response
                .iter()
                .enumerate()
                .filter(|(_, h)| h.abs() >= params.threshold && **h != 0.0)
                .map(|(k, &h)| (k, h))
                .collect();
            taps.push(track_taps);
        }

        let lowpass = match params.cutoff {
            Some(cutoff) => {
                let filter = FilterParams::low_pass(cutoff);
                super::filter::validate(&filter, ctx)?;
                Some(FilterCoefficients::compute(&filter, cutoff, ctx.sample_rate))
            }
            None => None,
        };

        Ok(ConvolutionSettings {
            params: params.clone(),
            taps,
            lowpass,
        })
    }

    fn context(&self) -> &DspContext {
        &self.ctx
    }

    fn exchange(&self) -> &Arc<ParamExchange<ConvolutionSettings>> {
        &self.exchange
    }

    fn required_history(settings: &ConvolutionSettings) -> usize {
        settings.params.longest()
    }

    fn history_capacity(&self) -> usize {
        self.longest
    }

    fn process(&mut self, output: &mut [Sample], input: &[Sample], block: Block) {
        self.cached.refresh(&self.exchange);
        let s = self.cached.get();
        let t = block.track;
        let range = block.range();
        let (Some(history), Some(taps)) = (self.history.get_mut(t), s.taps.get(t)) else {
            output[range.clone()].copy_from_slice(&input[range]);
            return;
        };
        let lowpass = &mut self.lowpass[t.min(MAX_TRACKS - 1)];
        let (dry, wet_gain) = (s.params.dry_gain, s.params.wet_gain);

        // Chunks no longer than a period keep every tap inside the history
        let chunk = self.ctx.period_frames;
        let mut offset = 0;
        while offset < block.frames {
            let len = chunk.min(block.frames - offset);
            let at = block.start + offset;
            let base = history.written() as i64;
            history.push(&input[at..at + len]);

            for i in 0..len {
                let n = base + i as i64;
                let mut wet = 0.0;
                for &(k, h) in taps {
                    wet += h * history.read(n - k as i64);
                }
                if let Some(coeffs) = &s.lowpass {
                    wet = lowpass.tick(coeffs, wet);
                }
                output[at + i] = dry * input[at + i] + wet_gain * wet;
            }
            offset += len;
        }
    }

    fn reset(&mut self) {
        for history in self.history.iter_mut() {
            history.clear();
        }
        for state in self.lowpass.iter_mut() {
            state.clear();
        }
    }
}
