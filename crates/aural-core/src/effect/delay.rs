//! Delay line family - echo, chorus, flanger and phaser
//!
//! All four share one structure:
//!
//! ```text
//! y[n] = dry * x[n] + g1 * x[n - d] + g2 * y[n - d]
//! ```
//!
//! where `d` is driven by a modulator. They differ only in the range of
//! `d` and in their default gains. Input and output history survive
//! across blocks, so splitting a signal into blocks never changes the
//! result while the offset is constant.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::filter::{FilterSettings, FilterState};
use super::{
    Block, Cached, DspContext, Effect, EffectKind, FilterParams, FrequencyFilter, ParamExchange,
};
use crate::buffer::DelayHistory;
use crate::error::{DspError, DspResult};
use crate::modulation::{ModulationConfig, Modulator, Waveform};
use crate::types::{Sample, MAX_TRACKS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayMode {
    #[default]
    Echo,
    Chorus,
    Flanger,
    Phaser,
}

impl DelayMode {
    /// Allowed delay offsets in seconds
    pub fn range(&self) -> (f32, f32) {
        match self {
            Self::Phaser => (0.000_05, 0.010),
            Self::Chorus | Self::Flanger => (0.010, 0.060),
            Self::Echo => (0.001, 2.0),
        }
    }
}

/// Delay line parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DelayParams {
    pub mode: DelayMode,
    /// Base (maximum) offset in seconds
    pub delay: f32,
    /// Modulation depth as a fraction of `delay` (0..=1)
    pub depth: f32,
    /// Modulation rate in Hz; 0 holds the offset
    pub rate: f32,
    pub waveform: Waveform,
    pub stereo_link: bool,
    /// Delayed-input gain (g1)
    pub delay_gain: f32,
    /// Delayed-output gain (g2)
    pub feedback: f32,
    pub dry_gain: f32,
    /// Optional filter on the wet path, with its own sweep
    pub filter: Option<FilterParams>,
}

impl Default for DelayParams {
    fn default() -> Self {
        Self::echo(0.25, 0.4)
    }
}

impl DelayParams {
    pub fn echo(delay: f32, feedback: f32) -> Self {
        Self {
            mode: DelayMode::Echo,
            delay,
            depth: 0.0,
            rate: 0.0,
            waveform: Waveform::Sine,
            stereo_link: false,
            delay_gain: 0.5,
            feedback,
            dry_gain: 1.0,
            filter: None,
        }
    }

    pub fn chorus(delay: f32, depth: f32, rate: f32) -> Self {
        Self {
            mode: DelayMode::Chorus,
            delay,
            depth,
            rate,
            feedback: 0.0,
            ..Self::echo(delay, 0.0)
        }
    }

    /// A chorus with feedback
    pub fn flanger(delay: f32, depth: f32, rate: f32, feedback: f32) -> Self {
        Self {
            mode: DelayMode::Flanger,
            feedback,
            ..Self::chorus(delay, depth, rate)
        }
    }

    pub fn phaser(delay: f32, depth: f32, rate: f32) -> Self {
        Self {
            mode: DelayMode::Phaser,
            waveform: Waveform::Triangle,
            ..Self::chorus(delay, depth, rate)
        }
    }
}

/// Derived delay settings
#[derive(Debug, Clone)]
pub struct DelaySettings {
    pub params: DelayParams,
    /// Offset modulator, in samples
    lfo: Modulator,
    dry: f32,
    g1: f32,
    g2: f32,
    wet_filter: Option<FilterSettings>,
    /// History the longest offset reads back, in samples
    reach: usize,
}

/// History needed to serve offsets up to `seconds`, including the
/// interpolation neighbour
fn reach_for(seconds: f32, sample_rate: f32) -> usize {
    (seconds * sample_rate).ceil() as usize + 2
}

/// Per-track history
struct Line {
    input: DelayHistory,
    output: DelayHistory,
    /// Offset at the end of the previous block
    offset: Option<f32>,
    /// Reservoir frames written by `prepare` for the pending block
    prepared: Option<usize>,
}

/// Delay-family effect
pub struct DelayLine {
    ctx: DspContext,
    exchange: Arc<ParamExchange<DelaySettings>>,
    cached: Cached<DelaySettings>,
    lfo: Modulator,
    wet_sweep: Option<Modulator>,
    wet_state: [FilterState; MAX_TRACKS],
    lines: Vec<Line>,
    /// Largest offset the history can serve, in samples
    reach: usize,
}

impl DelayLine {
    pub fn new(ctx: &DspContext, params: DelayParams) -> DspResult<Self> {
        let settings = Self::derive(&params, ctx)?;
        // Sized for the whole mode so the offset can be reconfigured freely
        // within it
        let (_, max_seconds) = params.mode.range();
        let reach = reach_for(max_seconds, ctx.sample_rate);

        let mut lines = Vec::with_capacity(ctx.tracks);
        for _ in 0..ctx.tracks {
            lines.push(Line {
                input: DelayHistory::new(reach + 1)?,
                output: DelayHistory::new(reach + 1)?,
                offset: None,
                prepared: None,
            });
        }

        let lfo = settings.lfo.clone();
        let wet_sweep = settings.wet_filter.as_ref().and_then(|f| f.sweep().cloned());
        let exchange = Arc::new(ParamExchange::new(settings));
        Ok(Self {
            ctx: *ctx,
            cached: Cached::new(&exchange),
            exchange,
            lfo,
            wet_sweep,
            wet_state: [FilterState::default(); MAX_TRACKS],
            lines,
            reach,
        })
    }

    /// Copy saved input history in front of the block
    ///
    /// `data` is the reservoir-prefixed track slice the chain will pass to
    /// [`Effect::process`] as input. Returns the number of history frames
    /// written in front of `block.start`. The block itself is recorded by
    /// `process` once it has been read.
    pub fn prepare(&mut self, data: &mut [Sample], block: Block) -> usize {
        let Some(line) = self.lines.get_mut(block.track) else {
            return 0;
        };
        let ds = block.start.min(self.reach);
        line.input.copy_tail(&mut data[block.start - ds..block.start]);
        line.prepared = Some(ds);
        ds
    }

    /// Largest offset the history can serve, in samples
    pub fn reach(&self) -> usize {
        self.reach
    }

    fn refresh(&mut self) {
        if !self.cached.refresh(&self.exchange) {
            return;
        }
        let settings = self.cached.get();
        if settings.lfo.config() != self.lfo.config() {
            self.lfo.clone_from(&settings.lfo);
        }
        let sweep = settings.wet_filter.as_ref().and_then(|f| f.sweep());
        match (&mut self.wet_sweep, sweep) {
            (Some(mine), Some(theirs)) if mine.config() == theirs.config() => {}
            (mine, theirs) => *mine = theirs.cloned(),
        }
    }
}

impl Effect for DelayLine {
    type Params = DelayParams;
    type Settings = DelaySettings;

    const KIND: EffectKind = EffectKind::DelayLine;

    fn derive(params: &DelayParams, ctx: &DspContext) -> DspResult<DelaySettings> {
        let (min, max) = params.mode.range();
        if !(params.delay >= min && params.delay <= max) {
            return Err(DspError::InvalidParameter {
                name: "delay",
                value: params.delay,
            });
        }
        if !(0.0..=1.0).contains(&params.depth) {
            return Err(DspError::InvalidParameter {
                name: "depth",
                value: params.depth,
            });
        }
        if !(params.feedback.abs() < 1.0) {
            return Err(DspError::InvalidParameter {
                name: "feedback",
                value: params.feedback,
            });
        }

        let longest = params.delay * ctx.sample_rate;
        let shortest = longest * (1.0 - params.depth);
        let lfo_config = if params.rate > 0.0 && params.depth > 0.0 {
            ModulationConfig {
                stereo_link: params.stereo_link,
                ..ModulationConfig::periodic(params.waveform, shortest, longest, params.rate)
            }
        } else {
            ModulationConfig::constant(longest)
        };
        let lfo = Modulator::with_config(lfo_config, ctx.sample_rate, ctx.period_frames)?;

        // Keep dry plus delayed input at or below unity unless a gain is
        // explicitly above 1.0
        let g1 = params.delay_gain;
        let mut dry = params.dry_gain;
        if dry <= 1.0 && g1 <= 1.0 && dry + g1 > 1.0 {
            dry = 1.0 - g1;
        }

        let wet_filter = match &params.filter {
            Some(filter) => Some(FrequencyFilter::derive(filter, ctx)?),
            None => None,
        };

        Ok(DelaySettings {
            params: params.clone(),
            lfo,
            dry,
            g1,
            g2: params.feedback,
            wet_filter,
            reach: reach_for(params.delay, ctx.sample_rate),
        })
    }

    fn context(&self) -> &DspContext {
        &self.ctx
    }

    fn exchange(&self) -> &Arc<ParamExchange<DelaySettings>> {
        &self.exchange
    }

    fn required_history(settings: &DelaySettings) -> usize {
        settings.reach
    }

    fn history_capacity(&self) -> usize {
        self.reach
    }

    fn process(&mut self, output: &mut [Sample], input: &[Sample], block: Block) {
        self.refresh();
        let settings = self.cached.get();
        let track = block.track;
        if track >= self.lines.len() {
            return;
        }
        let Block { start, frames, .. } = block;
        let range = block.range();

        let line = &mut self.lines[track];
        let in_ds = line.prepared.take().unwrap_or(0);
        let out_ds = start.min(self.reach);
        line.output.copy_tail(&mut output[start - out_ds..start]);

        let max_offset = (self.reach - 2) as f32;
        let target = self
            .lfo
            .get(track, Some(&input[range.clone()]), frames)
            .clamp(1.0, max_offset);
        let from = line.offset.unwrap_or(target);
        line.offset = Some(target);
        let ramp = (target - from) / frames.max(1) as f32;

        let wet_coeffs = settings.wet_filter.as_ref().map(|f| match self.wet_sweep.as_mut() {
            Some(sweep) if sweep.is_varying() => {
                let cutoff = sweep.get(track, Some(&input[range.clone()]), frames);
                super::FilterCoefficients::compute(&f.params, cutoff, self.ctx.sample_rate)
            }
            _ => f.coefficients,
        });
        let wet_state = &mut self.wet_state[track.min(MAX_TRACKS - 1)];

        // Both histories end right before the block's first frame
        let in_base = line.input.written() as i64;
        let out_base = line.output.written() as i64;
        let (dry, g1, g2) = (settings.dry, settings.g1, settings.g2);

        for i in 0..frames {
            let d = if ramp == 0.0 {
                target
            } else {
                from + ramp * (i + 1) as f32
            };

            let read_in = |k: i64| {
                if k >= -(in_ds as i64) {
                    input[(start as i64 + k) as usize]
                } else {
                    line.input.read(in_base + k)
                }
            };
            // Split the offset so the fraction never depends on `i`
            let whole = d.floor();
            let frac = d - whole;
            let (k0, t) = if frac == 0.0 {
                (i as i64 - whole as i64, 0.0)
            } else {
                (i as i64 - whole as i64 - 1, 1.0 - frac)
            };

            let xd = if t == 0.0 {
                read_in(k0)
            } else {
                let a = read_in(k0);
                a + (read_in(k0 + 1) - a) * t
            };

            let read_out = |output: &[Sample], k: i64| {
                if k >= -(out_ds as i64) {
                    output[(start as i64 + k) as usize]
                } else {
                    line.output.read(out_base + k)
                }
            };
            let yd = if t == 0.0 {
                read_out(output, k0)
            } else {
                let a = read_out(output, k0);
                a + (read_out(output, k0 + 1) - a) * t
            };

            let mut wet = g1 * xd + g2 * yd;
            if let Some(coeffs) = &wet_coeffs {
                wet = wet_state.tick(coeffs, wet);
            }
            output[start + i] = dry * input[start + i] + wet;
        }

        line.input.push(&input[range.clone()]);
        line.output.push(&output[range]);
    }

    fn reset(&mut self) {
        for line in self.lines.iter_mut() {
            line.input.clear();
            line.output.clear();
            line.offset = None;
            line.prepared = None;
        }
        for state in self.wet_state.iter_mut() {
            state.clear();
        }
        self.lfo.reset();
        if let Some(sweep) = self.wet_sweep.as_mut() {
            sweep.reset();
        }
    }
}
