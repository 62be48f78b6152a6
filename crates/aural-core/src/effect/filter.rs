//! Frequency filter - cascaded biquad low-pass, high-pass and band-pass
//!
//! 1 to 4 second-order sections give 12 to 48 dB/octave. Butterworth
//! sections get their Q from the pole angles; Bessel sections come from a
//! -3dB normalized table. An optional sweep modulator moves the cutoff
//! once per block.

use std::f32::consts::{FRAC_1_SQRT_2, PI};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{Block, Cached, DspContext, Effect, EffectKind, ParamExchange};
use crate::error::{DspError, DspResult};
use crate::modulation::{ModulationConfig, Modulator};
use crate::types::{Sample, MAX_TRACKS};

/// Maximum number of cascaded sections (8th order)
pub const MAX_SECTIONS: usize = 4;

/// Bessel section Q per order (2, 4, 6, 8)
const BESSEL_Q: [[f32; MAX_SECTIONS]; MAX_SECTIONS] = [
    [0.57735, 0.0, 0.0, 0.0],
    [0.52193, 0.80554, 0.0, 0.0],
    [0.51032, 0.61090, 1.02331, 0.0],
    [0.50599, 0.55961, 0.71085, 1.22570],
];

/// Bessel section frequency multipliers for a -3dB point at the cutoff
const BESSEL_FREQ: [[f32; MAX_SECTIONS]; MAX_SECTIONS] = [
    [1.27201, 0.0, 0.0, 0.0],
    [1.41940, 1.59125, 0.0, 0.0],
    [1.60653, 1.69186, 1.90782, 0.0],
    [1.78166, 1.83531, 1.95347, 2.19923],
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterKind {
    #[default]
    LowPass,
    HighPass,
    BandPass,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterDesign {
    #[default]
    Butterworth,
    Bessel,
}

/// Frequency filter parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterParams {
    pub kind: FilterKind,
    pub design: FilterDesign,
    /// Cutoff (or band-pass center) in Hz
    pub cutoff: f32,
    /// Resonance; 1/sqrt(2) is flat
    pub resonance: f32,
    /// Number of second-order sections (1..=4)
    pub sections: usize,
    /// Linear output gain
    pub gain: f32,
    /// Cutoff sweep in Hz; overrides `cutoff` while set
    pub sweep: Option<ModulationConfig>,
}

impl Default for FilterParams {
    fn default() -> Self {
        Self {
            kind: FilterKind::LowPass,
            design: FilterDesign::Butterworth,
            cutoff: 1000.0,
            resonance: FRAC_1_SQRT_2,
            sections: 1,
            gain: 1.0,
            sweep: None,
        }
    }
}

impl FilterParams {
    pub fn low_pass(cutoff: f32) -> Self {
        Self {
            cutoff,
            ..Default::default()
        }
    }

    pub fn high_pass(cutoff: f32) -> Self {
        Self {
            kind: FilterKind::HighPass,
            cutoff,
            ..Default::default()
        }
    }
}

/// Normalized biquad coefficients (a0 == 1)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Biquad {
    pub b0: f32,
    pub b1: f32,
    pub b2: f32,
    pub a1: f32,
    pub a2: f32,
}

impl Default for Biquad {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Biquad {
    pub const IDENTITY: Self = Self {
        b0: 1.0,
        b1: 0.0,
        b2: 0.0,
        a1: 0.0,
        a2: 0.0,
    };

    /// RBJ cookbook section
    pub fn design(kind: FilterKind, freq: f32, q: f32, sample_rate: f32) -> Self {
        let freq = freq.clamp(1.0, sample_rate * 0.49);
        let w0 = 2.0 * PI * freq / sample_rate;
        let (sin, cos) = w0.sin_cos();
        let alpha = sin / (2.0 * q.max(0.01));

        let (b0, b1, b2) = match kind {
            FilterKind::LowPass => ((1.0 - cos) * 0.5, 1.0 - cos, (1.0 - cos) * 0.5),
            FilterKind::HighPass => ((1.0 + cos) * 0.5, -(1.0 + cos), (1.0 + cos) * 0.5),
            FilterKind::BandPass => (alpha, 0.0, -alpha),
        };
        let a0 = 1.0 + alpha;
        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: -2.0 * cos / a0,
            a2: (1.0 - alpha) / a0,
        }
    }

    /// Transposed direct form II tick
    #[inline]
    pub fn tick(&self, z: &mut [f32; 2], x: f32) -> f32 {
        let y = self.b0 * x + z[0];
        z[0] = self.b1 * x - self.a1 * y + z[1];
        z[1] = self.b2 * x - self.a2 * y;
        y
    }
}

/// A complete cascade
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterCoefficients {
    pub sections: [Biquad; MAX_SECTIONS],
    pub count: usize,
    pub gain: f32,
}

impl Default for FilterCoefficients {
    fn default() -> Self {
        Self {
            sections: [Biquad::IDENTITY; MAX_SECTIONS],
            count: 0,
            gain: 1.0,
        }
    }
}

impl FilterCoefficients {
    /// Compute a cascade for the given cutoff
    ///
    /// Resonance scales the Q of the last section only, so the cascade
    /// keeps its slope while gaining a peak at the cutoff.
    pub fn compute(params: &FilterParams, cutoff: f32, sample_rate: f32) -> Self {
        let count = params.sections.clamp(1, MAX_SECTIONS);
        let order = 2 * count;
        let emphasis = params.resonance / FRAC_1_SQRT_2;
        let mut sections = [Biquad::IDENTITY; MAX_SECTIONS];

        for (k, section) in sections.iter_mut().enumerate().take(count) {
            let (mut q, scale) = match (params.kind, params.design) {
                (FilterKind::BandPass, _) => (FRAC_1_SQRT_2, 1.0),
                (_, FilterDesign::Butterworth) => {
                    let angle = PI * (2 * k + 1) as f32 / (2 * order) as f32;
                    (1.0 / (2.0 * angle.cos()), 1.0)
                }
                (_, FilterDesign::Bessel) => (BESSEL_Q[count - 1][k], BESSEL_FREQ[count - 1][k]),
            };
            if k == count - 1 {
                q *= emphasis;
            }
            let freq = match params.kind {
                FilterKind::HighPass => cutoff / scale,
                _ => cutoff * scale,
            };
            *section = Biquad::design(params.kind, freq, q, sample_rate);
        }

        Self {
            sections,
            count,
            gain: params.gain,
        }
    }
}

/// Two samples of memory per section
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FilterState {
    z: [[f32; 2]; MAX_SECTIONS],
}

impl FilterState {
    #[inline]
    pub fn tick(&mut self, coeffs: &FilterCoefficients, x: f32) -> f32 {
        let mut y = x;
        for (section, z) in coeffs.sections[..coeffs.count].iter().zip(self.z.iter_mut()) {
            y = section.tick(z, y);
        }
        y * coeffs.gain
    }

    pub fn run(&mut self, coeffs: &FilterCoefficients, output: &mut [Sample], input: &[Sample]) {
        for (o, &x) in output.iter_mut().zip(input) {
            *o = self.tick(coeffs, x);
        }
    }

    pub fn run_in_place(&mut self, coeffs: &FilterCoefficients, data: &mut [Sample]) {
        for s in data.iter_mut() {
            *s = self.tick(coeffs, *s);
        }
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

pub(crate) fn validate(params: &FilterParams, ctx: &DspContext) -> DspResult<()> {
    if !(params.cutoff > 0.0) || params.cutoff >= ctx.sample_rate * 0.5 {
        return Err(DspError::InvalidParameter {
            name: "cutoff",
            value: params.cutoff,
        });
    }
    if !(params.resonance > 0.0) {
        return Err(DspError::InvalidParameter {
            name: "resonance",
            value: params.resonance,
        });
    }
    if params.sections == 0 || params.sections > MAX_SECTIONS {
        return Err(DspError::FilterOrder(params.sections));
    }
    Ok(())
}

/// Derived filter settings
#[derive(Debug, Clone)]
pub struct FilterSettings {
    pub params: FilterParams,
    pub coefficients: FilterCoefficients,
    sweep: Option<Modulator>,
}

impl FilterSettings {
    pub(crate) fn sweep(&self) -> Option<&Modulator> {
        self.sweep.as_ref()
    }
}

/// Cascaded biquad filter effect
pub struct FrequencyFilter {
    ctx: DspContext,
    exchange: Arc<ParamExchange<FilterSettings>>,
    cached: Cached<FilterSettings>,
    sweep: Option<Modulator>,
    state: [FilterState; MAX_TRACKS],
}

impl FrequencyFilter {
    pub fn new(ctx: &DspContext, params: FilterParams) -> DspResult<Self> {
        let settings = Self::derive(&params, ctx)?;
        let sweep = settings.sweep.clone();
        let exchange = Arc::new(ParamExchange::new(settings));
        Ok(Self {
            ctx: *ctx,
            cached: Cached::new(&exchange),
            exchange,
            sweep,
            state: [FilterState::default(); MAX_TRACKS],
        })
    }

    /// Coefficients for one block of a track
    fn coefficients(
        &mut self,
        settings: &FilterSettings,
        input: &[Sample],
        track: usize,
    ) -> FilterCoefficients {
        match self.sweep.as_mut() {
            Some(sweep) if sweep.is_varying() => {
                let cutoff = sweep.get(track, Some(input), input.len());
                FilterCoefficients::compute(&settings.params, cutoff, self.ctx.sample_rate)
            }
            _ => settings.coefficients,
        }
    }
}

impl Effect for FrequencyFilter {
    type Params = FilterParams;
    type Settings = FilterSettings;

    const KIND: EffectKind = EffectKind::FrequencyFilter;

    fn derive(params: &FilterParams, ctx: &DspContext) -> DspResult<FilterSettings> {
        validate(params, ctx)?;
        let sweep = match &params.sweep {
            Some(config) => {
                let nyquist = ctx.sample_rate * 0.49;
                let config = ModulationConfig {
                    min: config.min.clamp(1.0, nyquist),
                    max: config.max.clamp(1.0, nyquist),
                    ..config.clone()
                };
                Some(Modulator::with_config(config, ctx.sample_rate, ctx.period_frames)?)
            }
            None => None,
        };
        Ok(FilterSettings {
            params: params.clone(),
            coefficients: FilterCoefficients::compute(params, params.cutoff, ctx.sample_rate),
            sweep,
        })
    }

    fn context(&self) -> &DspContext {
        &self.ctx
    }

    fn exchange(&self) -> &Arc<ParamExchange<FilterSettings>> {
        &self.exchange
    }

    fn process(&mut self, output: &mut [Sample], input: &[Sample], block: Block) {
        if self.cached.refresh(&self.exchange) {
            let settings = self.cached.get();
            match (&mut self.sweep, &settings.sweep) {
                (Some(mine), Some(theirs)) if mine.config() == theirs.config() => {}
                (mine, theirs) => mine.clone_from(theirs),
            }
        }
        let settings = self.cached.get();
        let range = block.range();
        let track = block.track.min(MAX_TRACKS - 1);
        let coeffs = self.coefficients(&settings, &input[range.clone()], track);
        self.state[track].run(&coeffs, &mut output[range.clone()], &input[range]);
    }

    fn reset(&mut self) {
        for state in self.state.iter_mut() {
            state.clear();
        }
        if let Some(sweep) = self.sweep.as_mut() {
            sweep.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::{context, rms, run_blocks, sine, RATE};
    use super::*;
    use crate::modulation::Waveform;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    fn steady_gain(params: FilterParams, freq: f32) -> f32 {
        let mut filter = FrequencyFilter::new(&context(), params).unwrap();
        let input = sine(freq, 1.0, 48000);
        let output = run_blocks(&mut filter, &input, 512);
        // Last 0.1s, an integer number of periods for the test frequencies
        rms(&output[43200..]) / rms(&input[43200..])
    }

    #[test]
    fn test_lowpass_passband_unity() {
        for sections in 1..=MAX_SECTIONS {
            let params = FilterParams {
                sections,
                ..FilterParams::low_pass(10000.0)
            };
            let gain = steady_gain(params, 100.0);
            assert!((gain - 1.0).abs() < 0.0116, "sections={} gain={}", sections, gain);
        }
    }

    #[test]
    fn test_bessel_passband_unity() {
        let params = FilterParams {
            design: FilterDesign::Bessel,
            sections: 4,
            ..FilterParams::low_pass(8000.0)
        };
        let gain = steady_gain(params, 100.0);
        assert!((gain - 1.0).abs() < 0.0116, "gain={}", gain);
    }

    #[test]
    fn test_highpass_passband_unity() {
        let params = FilterParams {
            sections: 2,
            ..FilterParams::high_pass(20.0)
        };
        let gain = steady_gain(params, 5000.0);
        assert!((gain - 1.0).abs() < 0.0116, "gain={}", gain);
    }

    #[test]
    fn test_lowpass_attenuates_stopband() {
        let params = FilterParams {
            sections: 2,
            ..FilterParams::low_pass(500.0)
        };
        // Two octaves+ above cutoff at 24 dB/octave
        assert!(steady_gain(params, 5000.0) < 0.01);
    }

    #[test]
    fn test_butterworth_section_q() {
        let params = FilterParams {
            sections: 2,
            ..FilterParams::low_pass(1000.0)
        };
        let a = FilterCoefficients::compute(&params, 1000.0, RATE);
        let single = Biquad::design(FilterKind::LowPass, 1000.0, 0.541_196, RATE);
        assert!((a.sections[0].a2 - single.a2).abs() < 1e-5);
        assert_eq!(a.count, 2);
    }

    #[test]
    fn test_invalid_order() {
        let params = FilterParams {
            sections: 5,
            ..Default::default()
        };
        assert!(matches!(
            FrequencyFilter::new(&context(), params),
            Err(DspError::FilterOrder(5))
        ));
    }

    #[test]
    fn test_invalid_configure_disables() {
        let mut filter = FrequencyFilter::new(&context(), FilterParams::default()).unwrap();
        assert!(filter.is_enabled());
        let bad = FilterParams {
            cutoff: -1.0,
            ..Default::default()
        };
        assert!(filter.configure(bad).is_err());
        assert!(!filter.is_enabled());
    }

    #[test]
    fn test_sweep_changes_output() {
        let swept = FilterParams {
            sweep: Some(ModulationConfig::periodic(Waveform::Triangle, 200.0, 8000.0, 2.0)),
            ..FilterParams::low_pass(1000.0)
        };
        let mut a = FrequencyFilter::new(&context(), swept).unwrap();
        let mut b = FrequencyFilter::new(&context(), FilterParams::low_pass(1000.0)).unwrap();
        let input = sine(3000.0, 1.0, 4096);
        assert_ne!(run_blocks(&mut a, &input, 512), run_blocks(&mut b, &input, 512));
    }

    #[test]
    fn test_reset_clears_history() {
        let mut filter = FrequencyFilter::new(&context(), FilterParams::low_pass(1000.0)).unwrap();
        let input = sine(440.0, 1.0, 1024);
        let first = run_blocks(&mut filter, &input, 256);
        filter.reset();
        let second = run_blocks(&mut filter, &input, 256);
        assert_eq!(first, second);
    }

    #[test]
    fn test_swap_is_atomic_per_block() {
        // Two parameter sets with very different DC gain; every rendered
        // block must come entirely from one of them.
        let quiet = FilterParams {
            gain: 0.25,
            ..FilterParams::low_pass(20000.0)
        };
        let loud = FilterParams {
            gain: 2.0,
            ..FilterParams::low_pass(20000.0)
        };
        let mut filter = FrequencyFilter::new(&context(), quiet.clone()).unwrap();
        let handle = filter.handle();
        let done = Arc::new(AtomicBool::new(false));

        let writer = {
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut flip = false;
                while !done.load(Ordering::Relaxed) {
                    let params = if flip { &loud } else { &quiet };
                    handle.configure(params).unwrap();
                    flip = !flip;
                }
            })
        };

        let input = vec![1.0; 256];
        let mut output = vec![0.0; 256];
        for _ in 0..2000 {
            filter.reset();
            filter.process(&mut output, &input, Block::new(0, 0, 256));
            let ratio = output[255] / output[128];
            assert!((ratio - 1.0).abs() < 1e-3, "mixed coefficients in one block");
            let level = output[255];
            assert!(
                (level - 0.25).abs() < 0.01 || (level - 2.0).abs() < 0.05,
                "unexpected level {}",
                level
            );
        }
        done.store(true, Ordering::Relaxed);
        writer.join().unwrap();
    }
}
