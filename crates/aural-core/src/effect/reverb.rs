//! Reverb - early reflections plus cross-fed loopbacks
//!
//! - **Reflections**: 3 to 6 direction-tagged taps on the input history,
//!   summed and low-passed
//! - **Loopbacks**: 4 to 7 taps on the reverb's own output history,
//!   cross-fed between tracks
//! - A high-pass on the wet signal removes sub-bass build-up
//!
//! Loopback offsets are never shorter than one period, so a track only
//! reads other tracks' output from earlier blocks and the result doesn't
//! depend on the order tracks are processed in.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::filter::FilterState;
use super::{
    Block, Cached, Direction, DspContext, Effect, EffectKind, FilterCoefficients, FilterParams,
    OcclusionParams, ParamExchange,
};
use crate::buffer::DelayHistory;
use crate::error::{DspError, DspResult};
use crate::types::{audible, Sample, MAX_TRACKS};

pub const MIN_REFLECTIONS: usize = 3;
pub const MAX_REFLECTIONS: usize = 6;
pub const MIN_LOOPBACKS: usize = 4;
pub const MAX_LOOPBACKS: usize = 7;

/// Longest reflection offset at full delay depth, in seconds
const REFLECTION_SECONDS: f32 = 0.1;
/// Longest loopback offset at full decay depth, in seconds
const LOOPBACK_SECONDS: f32 = 0.6;
/// Upper bound on the summed loopback gain
const FEEDBACK_LIMIT: f32 = 0.95;

const REFLECTION_DELAY: [f32; MAX_REFLECTIONS] = [0.2913, 0.4561, 0.6118, 0.7823, 0.8931, 1.0];
const REFLECTION_GAIN: [f32; MAX_REFLECTIONS] = [0.802, 0.712, 0.655, 0.601, 0.542, 0.497];
const LOOPBACK_DELAY: [f32; MAX_LOOPBACKS] = [1.0, 0.8913, 0.7746, 0.6812, 0.5951, 0.5119, 0.4373];
const LOOPBACK_GAIN: [f32; MAX_LOOPBACKS] = [0.912, 0.876, 0.841, 0.798, 0.762, 0.723, 0.689];

/// Reverb parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReverbParams {
    pub reflections: usize,
    pub loopbacks: usize,
    /// Reflection spread, 0..=1
    pub delay_depth: f32,
    /// Loopback length, 0..=1
    pub decay_depth: f32,
    /// Reflection and loopback level, 0..1
    pub decay_level: f32,
    /// Reflection low-pass cutoff in Hz
    pub cutoff: f32,
    /// Wet high-pass cutoff in Hz
    pub highpass: f32,
    /// Share of loopback signal taken from other tracks, 0..=1
    pub cross_feed: f32,
    pub wet_gain: f32,
    pub occlusion: Option<OcclusionParams>,
}

impl Default for ReverbParams {
    fn default() -> Self {
        Self {
            reflections: MAX_REFLECTIONS,
            loopbacks: MAX_LOOPBACKS,
            delay_depth: 0.5,
            decay_depth: 0.5,
            decay_level: 0.6,
            cutoff: 8000.0,
            highpass: 40.0,
            cross_feed: 0.3,
            wet_gain: 1.0,
            occlusion: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Reflection {
    delay: [usize; MAX_TRACKS],
    gain: [f32; MAX_TRACKS],
}

#[derive(Debug, Clone, Copy, Default)]
struct Loopback {
    delay: usize,
    gain: f32,
}

/// Derived reverb settings
#[derive(Debug, Clone)]
pub struct ReverbSettings {
    pub params: ReverbParams,
    reflections: [Reflection; MAX_REFLECTIONS],
    loopbacks: [Loopback; MAX_LOOPBACKS],
    /// cross[t][c]: weight of track c's history in track t's loopbacks
    cross: [[f32; MAX_TRACKS]; MAX_TRACKS],
    lowpass: FilterCoefficients,
    highpass: FilterCoefficients,
    /// Whether any tap survived the audibility threshold
    active: bool,
}

pub struct Reverb {
    ctx: DspContext,
    exchange: Arc<ParamExchange<ReverbSettings>>,
    cached: Cached<ReverbSettings>,
    direct: Vec<DelayHistory>,
    wet: Vec<DelayHistory>,
    lowpass: [FilterState; MAX_TRACKS],
    highpass: [FilterState; MAX_TRACKS],
    wet_block: Vec<Sample>,
}

impl Reverb {
    pub fn new(ctx: &DspContext, params: ReverbParams) -> DspResult<Self> {
        let settings = Self::derive(&params, ctx)?;
        let period = ctx.period_frames;
        let direct_len =
            ((REFLECTION_SECONDS + 0.001) * ctx.sample_rate).ceil() as usize + period + 1;
        let wet_len = (LOOPBACK_SECONDS * ctx.sample_rate).ceil() as usize + 3 * period + 1;

        let mut direct = Vec::with_capacity(ctx.tracks);
        let mut wet = Vec::with_capacity(ctx.tracks);
        for _ in 0..ctx.tracks {
            direct.push(DelayHistory::new(direct_len)?);
            wet.push(DelayHistory::new(wet_len)?);
        }

        let exchange = Arc::new(ParamExchange::new(settings));
        Ok(Self {
            ctx: *ctx,
            cached: Cached::new(&exchange),
            exchange,
            direct,
            wet,
            lowpass: [FilterState::default(); MAX_TRACKS],
            highpass: [FilterState::default(); MAX_TRACKS],
            wet_block: crate::buffer::try_zeroed(period)?,
        })
    }

    /// Whether any reflection or loopback is audible
    pub fn is_active(&self) -> bool {
        self.exchange.load().active
    }
}

fn check_range(name: &'static str, value: f32, lo: f32, hi: f32) -> DspResult<()> {
    if value >= lo && value <= hi {
        Ok(())
    } else {
        Err(DspError::InvalidParameter { name, value })
    }
}

impl Effect for Reverb {
    type Params = ReverbParams;
    type Settings = ReverbSettings;

    const KIND: EffectKind = EffectKind::Reverb;

    fn derive(params: &ReverbParams, ctx: &DspContext) -> DspResult<ReverbSettings> {
        if !(MIN_REFLECTIONS..=MAX_REFLECTIONS).contains(&params.reflections) {
            return Err(DspError::InvalidParameter {
                name: "reflections",
                value: params.reflections as f32,
            });
        }
        if !(MIN_LOOPBACKS..=MAX_LOOPBACKS).contains(&params.loopbacks) {
            return Err(DspError::InvalidParameter {
                name: "loopbacks",
                value: params.loopbacks as f32,
            });
        }
        let nyquist = ctx.sample_rate * 0.5;
        check_range("delay_depth", params.delay_depth, 0.0, 1.0)?;
        check_range("decay_depth", params.decay_depth, 0.0, 1.0)?;
        check_range("decay_level", params.decay_level, 0.0, 0.999)?;
        check_range("cross_feed", params.cross_feed, 0.0, 1.0)?;
        check_range("cutoff", params.cutoff, 1.0, nyquist * 0.98)?;
        check_range("highpass", params.highpass, 1.0, nyquist * 0.98)?;

        let tracks = ctx.tracks;
        let rate = ctx.sample_rate;
        let level = params.decay_level;
        let norm = 1.0 / (params.reflections as f32).sqrt();

        let mut reflections = [Reflection::default(); MAX_REFLECTIONS];
        for (i, tap) in reflections.iter_mut().enumerate().take(params.reflections) {
            let direction = Direction::ALL[i];
            let blocked = params
                .occlusion
                .as_ref()
                .map(|o| o.occlusion.directional_factor(o.center, direction))
                .unwrap_or(1.0);
            let base = REFLECTION_DELAY[i] * params.delay_depth * REFLECTION_SECONDS;
            for t in 0..tracks {
                let seconds = base + direction.track_delay(t, tracks);
                tap.delay[t] = ((seconds * rate).round() as usize).max(1);
                let gain = REFLECTION_GAIN[i] * level * norm * blocked;
                tap.gain[t] = audible(gain * direction.track_gain(t, tracks));
            }
        }

        let mut loopbacks = [Loopback::default(); MAX_LOOPBACKS];
        let loop_scale = level * FEEDBACK_LIMIT / params.loopbacks as f32;
        for (i, tap) in loopbacks.iter_mut().enumerate().take(params.loopbacks) {
            let seconds = LOOPBACK_DELAY[i] * params.decay_depth * LOOPBACK_SECONDS;
            let samples = (seconds * rate).round() as usize;
            tap.delay = samples.max(ctx.period_frames);
            tap.gain = audible(LOOPBACK_GAIN[i] * loop_scale);
        }

        let mut cross = [[0.0; MAX_TRACKS]; MAX_TRACKS];
        for (t, row) in cross.iter_mut().enumerate().take(tracks) {
            for (c, weight) in row.iter_mut().enumerate().take(tracks) {
                *weight = if tracks == 1 {
                    1.0
                } else if c == t {
                    1.0 - params.cross_feed
                } else {
                    params.cross_feed / (tracks - 1) as f32
                };
            }
        }

        let active = reflections.iter().any(|r| r.gain.iter().any(|&g| g != 0.0))
            || loopbacks.iter().any(|l| l.gain != 0.0);

        let lowpass = FilterCoefficients::compute(
            &FilterParams::low_pass(params.cutoff),
            params.cutoff,
            rate,
        );
        let highpass = FilterCoefficients::compute(
            &FilterParams::high_pass(params.highpass),
            params.highpass,
            rate,
        );

        Ok(ReverbSettings {
            params: params.clone(),
            reflections,
            loopbacks,
            cross,
            lowpass,
            highpass,
            active,
        })
    }

    fn context(&self) -> &DspContext {
        &self.ctx
    }

    fn exchange(&self) -> &Arc<ParamExchange<ReverbSettings>> {
        &self.exchange
    }

    fn process(&mut self, output: &mut [Sample], input: &[Sample], block: Block) {
        self.cached.refresh(&self.exchange);
        let s = self.cached.get();
        let range = block.range();
        let t = block.track;
        if t >= self.direct.len() {
            output[range.clone()].copy_from_slice(&input[range]);
            return;
        }

        let tracks = self.direct.len();
        let reflection_count = s.params.reflections;
        let loopback_count = s.params.loopbacks;
        let chunk = self.wet_block.len();

        let mut offset = 0;
        while offset < block.frames {
            let len = chunk.min(block.frames - offset);
            let at = block.start + offset;
            let x = &input[at..at + len];

            let base = self.direct[t].written() as i64;
            self.direct[t].push(x);

            if !s.active {
                output[at..at + len].copy_from_slice(x);
                self.wet_block[..len].fill(0.0);
            } else {
                for i in 0..len {
                    let n = base + i as i64;

                    let mut reflected = 0.0;
                    for tap in &s.reflections[..reflection_count] {
                        let gain = tap.gain[t];
                        if gain != 0.0 {
                            reflected += gain * self.direct[t].read(n - tap.delay[t] as i64);
                        }
                    }
                    let reflected = self.lowpass[t].tick(&s.lowpass, reflected);

                    let mut looped = 0.0;
                    for tap in &s.loopbacks[..loopback_count] {
                        if tap.gain == 0.0 {
                            continue;
                        }
                        let index = n - tap.delay as i64;
                        for (c, history) in self.wet.iter().enumerate().take(tracks) {
                            let weight = s.cross[t][c];
                            if weight != 0.0 {
                                looped += tap.gain * weight * history.read(index);
                            }
                        }
                    }

                    let wet = reflected + looped;
                    self.wet_block[i] = wet;
                    output[at + i] =
                        x[i] + s.params.wet_gain * self.highpass[t].tick(&s.highpass, wet);
                }
            }

            self.wet[t].push(&self.wet_block[..len]);
            offset += len;
        }
    }

    fn reset(&mut self) {
        for history in self.direct.iter_mut().chain(self.wet.iter_mut()) {
            history.clear();
        }
        for state in self.lowpass.iter_mut().chain(self.highpass.iter_mut()) {
            state.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::{context, rms};
    use super::super::Occlusion;
    use super::*;

    fn impulse(len: usize) -> Vec<Sample> {
        let mut v = vec![0.0; len];
        v[0] = 1.0;
        v
    }

    /// Process both tracks block by block in the given track order
    fn run_stereo(
        reverb: &mut Reverb,
        left: &[Sample],
        right: &[Sample],
        order: [usize; 2],
    ) -> [Vec<Sample>; 2] {
        let frames = 512;
        let mut out = [Vec::new(), Vec::new()];
        let mut buffer = vec![0.0; frames];
        for (l, r) in left.chunks(frames).zip(right.chunks(frames)) {
            for &t in &order {
                let input = if t == 0 { l } else { r };
                reverb.process(&mut buffer[..input.len()], input, Block::new(t, 0, input.len()));
                out[t].extend_from_slice(&buffer[..input.len()]);
            }
        }
        out
    }

    #[test]
    fn test_impulse_tail_decays() {
        let mut reverb = Reverb::new(&context(), ReverbParams::default()).unwrap();
        let silence = vec![0.0; 96000];
        let [left, _] = run_stereo(&mut reverb, &impulse(96000), &silence, [0, 1]);
        let early = rms(&left[1..24000]);
        let late = rms(&left[72000..]);
        assert!(early > 0.0);
        assert!(late < early * 0.5, "early={} late={}", early, late);
        assert!(left.iter().all(|s| s.is_finite()));
    }

    #[test]
    fn test_cross_feed_order_independent() {
        let params = ReverbParams {
            cross_feed: 0.8,
            ..Default::default()
        };
        let left = impulse(24000);
        let right: Vec<Sample> = (0..24000).map(|i| if i == 700 { -0.5 } else { 0.0 }).collect();

        let isolated = ReverbParams {
            cross_feed: 0.0,
            ..params.clone()
        };

        let mut a = Reverb::new(&context(), params.clone()).unwrap();
        let mut b = Reverb::new(&context(), params).unwrap();
        let mut c = Reverb::new(&context(), isolated).unwrap();
        let forward = run_stereo(&mut a, &left, &right, [0, 1]);
        let backward = run_stereo(&mut b, &left, &right, [1, 0]);
        let separate = run_stereo(&mut c, &left, &right, [0, 1]);
        assert_eq!(forward, backward);
        // Cross-feed carries each impulse into the other track
        assert_ne!(forward[1], separate[1]);
    }

    #[test]
    fn test_sub_threshold_is_bypass() {
        let params = ReverbParams {
            decay_level: 0.0005,
            ..Default::default()
        };
        let mut reverb = Reverb::new(&context(), params).unwrap();
        assert!(!reverb.is_active());
        let input: Vec<Sample> = (0..4096).map(|i| ((i * 7) % 13) as f32 / 13.0 - 0.5).collect();
        let [left, right] = run_stereo(&mut reverb, &input, &input, [0, 1]);
        assert_eq!(left, input);
        assert_eq!(right, input);
    }

    #[test]
    fn test_highpass_removes_dc_from_wet() {
        let mut reverb = Reverb::new(&context(), ReverbParams::default()).unwrap();
        let dc = vec![0.5; 96000];
        let [left, _] = run_stereo(&mut reverb, &dc, &dc, [0, 1]);
        let tail = &left[90000..];
        assert!(tail.iter().all(|s| (s - 0.5).abs() < 0.02));
    }

    #[test]
    fn test_occlusion_weakens_reflections() {
        let open = ReverbParams {
            loopbacks: MIN_LOOPBACKS,
            decay_level: 0.5,
            ..Default::default()
        };
        let blocked = ReverbParams {
            occlusion: Some(OcclusionParams {
                occlusion: Occlusion::from_vec4([4.0, 4.0, 4.0, 1.0]),
                center: [0.0, 0.0, 0.0],
                source: [0.0, 0.0, -1.0],
            }),
            ..open.clone()
        };
        let silence = vec![0.0; 4800];
        let mut a = Reverb::new(&context(), open).unwrap();
        let mut b = Reverb::new(&context(), blocked).unwrap();
        let [open_out, _] = run_stereo(&mut a, &impulse(4800), &silence, [0, 1]);
        let [blocked_out, _] = run_stereo(&mut b, &impulse(4800), &silence, [0, 1]);
        assert!(rms(&blocked_out[1..]) < rms(&open_out[1..]));
    }

    #[test]
    fn test_tap_counts_validated() {
        let too_few = ReverbParams {
            reflections: 2,
            ..Default::default()
        };
        assert!(Reverb::new(&context(), too_few).is_err());
        let too_many = ReverbParams {
            loopbacks: 8,
            ..Default::default()
        };
        assert!(Reverb::new(&context(), too_many).is_err());
    }

    #[test]
    fn test_loopbacks_at_least_one_period() {
        let params = ReverbParams {
            decay_depth: 0.0,
            ..Default::default()
        };
        let settings = Reverb::derive(&params, &context()).unwrap();
        assert!(settings.loopbacks[..params.loopbacks].iter().all(|l| l.delay >= 512));
    }
}
