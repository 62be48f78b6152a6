//! Low-frequency oscillator / envelope follower

use serde::{Deserialize, Serialize};

use super::envelope::{Curve, Envelope, EnvelopeState};
use super::waveform::{ModulationFlags, Waveform};
use crate::buffer::rms;
use crate::error::{DspError, DspResult};
use crate::types::{Sample, DEFAULT_PERIOD_FRAMES, DEFAULT_SAMPLE_RATE, MAX_TRACKS};

/// Phase spread between unlinked tracks
const TRACK_PHASE_SPREAD: f32 = 0.25;

/// Serializable modulator description
///
/// Identical in shape for static presets and live parameter updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModulationConfig {
    pub waveform: Waveform,
    pub min: f32,
    pub max: f32,
    /// Rate in Hz; 0 holds the current value
    pub frequency: f32,
    /// Initial phase in [0, 1)
    pub phase: f32,
    pub inverse: bool,
    pub stereo_link: bool,
    pub logarithmic: bool,
    /// Envelope-follow attack time constant in seconds
    pub attack: f32,
    /// Envelope-follow release time constant in seconds
    pub release: f32,
    /// Timed-transition duration in seconds
    pub transition: f32,
    /// Exponential timed transition
    pub exponential: bool,
}

impl Default for ModulationConfig {
    fn default() -> Self {
        Self {
            waveform: Waveform::Constant,
            min: 0.0,
            max: 1.0,
            frequency: 0.0,
            phase: 0.0,
            inverse: false,
            stereo_link: false,
            logarithmic: false,
            attack: 0.01,
            release: 0.1,
            transition: 1.0,
            exponential: false,
        }
    }
}

impl ModulationConfig {
    /// A constant value
    pub fn constant(value: f32) -> Self {
        Self {
            min: value,
            max: value,
            ..Default::default()
        }
    }

    /// A periodic waveform sweeping between `min` and `max`
    pub fn periodic(waveform: Waveform, min: f32, max: f32, frequency: f32) -> Self {
        Self {
            waveform,
            min,
            max,
            frequency,
            ..Default::default()
        }
    }

    /// Encode the waveform and option bits
    pub fn flags(&self) -> ModulationFlags {
        let mut flags = ModulationFlags::from(self.waveform);
        if self.inverse {
            flags = flags | ModulationFlags::INVERSE;
        }
        if self.stereo_link {
            flags = flags | ModulationFlags::STEREO_LINK;
        }
        if self.logarithmic {
            flags = flags | ModulationFlags::LOGARITHMIC;
        }
        if self.exponential {
            flags = flags | ModulationFlags::EXPONENTIAL;
        }
        flags
    }
}

/// Per-track evaluation state; the only thing the audio thread mutates
#[derive(Debug, Clone, Copy, Default)]
struct TrackState {
    phase: f32,
    /// Last returned value
    value: f32,
    /// Normalized [0, 1] level for random and follower modes
    level: f32,
    envelope: EnvelopeState,
}

/// Modulation engine instance
#[derive(Debug, Clone)]
pub struct Modulator {
    config: ModulationConfig,
    sample_rate: f32,
    period_frames: usize,
    envelope: Option<Envelope>,
    tracks: [TrackState; MAX_TRACKS],
    /// Blocks requested per track, for linked evaluation
    calls: [u64; MAX_TRACKS],
    /// Block the shared value was last evaluated for
    generation: u64,
    /// Shared value of the block before `generation`
    previous: f32,
    rng: fastrand::Rng,
}

impl Default for Modulator {
    fn default() -> Self {
        Self::new(ModulationConfig::default())
    }
}

impl Modulator {
    /// Create a modulator at the default rate and block length
    pub fn new(config: ModulationConfig) -> Self {
        let mut modulator = Self {
            config,
            sample_rate: DEFAULT_SAMPLE_RATE,
            period_frames: DEFAULT_PERIOD_FRAMES,
            envelope: None,
            tracks: [TrackState::default(); MAX_TRACKS],
            calls: [0; MAX_TRACKS],
            generation: 0,
            previous: 0.0,
            rng: fastrand::Rng::with_seed(0x5eed_a0a1),
        };
        modulator.reset();
        modulator
    }

    /// Create and set up a modulator in one go
    pub fn with_config(
        config: ModulationConfig,
        sample_rate: f32,
        period_frames: usize,
    ) -> DspResult<Self> {
        let flags = config.flags();
        let mut modulator = Self::new(config);
        modulator.setup(sample_rate, period_frames, flags)?;
        Ok(modulator)
    }

    /// Configure the evaluation mode from a source bitmask
    ///
    /// Resets every track to its initial phase and value.
    pub fn setup(
        &mut self,
        sample_rate: f32,
        period_frames: usize,
        flags: ModulationFlags,
    ) -> DspResult<()> {
        if !(sample_rate > 0.0) {
            return Err(DspError::InvalidParameter {
                name: "sample_rate",
                value: sample_rate,
            });
        }
        if !(self.config.frequency >= 0.0) {
            return Err(DspError::InvalidParameter {
                name: "frequency",
                value: self.config.frequency,
            });
        }
        let waveform = flags.waveform()?;
        self.config.waveform = waveform;
        self.config.inverse = flags.contains(ModulationFlags::INVERSE);
        self.config.stereo_link = flags.contains(ModulationFlags::STEREO_LINK);
        self.config.logarithmic = flags.contains(ModulationFlags::LOGARITHMIC);
        self.config.exponential = flags.contains(ModulationFlags::EXPONENTIAL);
        self.sample_rate = sample_rate;
        self.period_frames = period_frames.max(1);

        self.envelope = if waveform == Waveform::TimedTransition {
            let curve = if self.config.exponential {
                Curve::Exponential
            } else {
                Curve::Linear
            };
            let mut envelope = Envelope::transition(0.0, 1.0, self.config.transition, curve)?;
            envelope.setup(sample_rate, self.period_frames);
            Some(envelope)
        } else {
            None
        };
        self.reset();
        Ok(())
    }

    pub fn config(&self) -> &ModulationConfig {
        &self.config
    }

    #[inline]
    pub fn waveform(&self) -> Waveform {
        self.config.waveform
    }

    #[inline]
    pub fn min(&self) -> f32 {
        self.config.min
    }

    #[inline]
    pub fn max(&self) -> f32 {
        self.config.max
    }

    /// Whether the output can change between blocks
    pub fn is_varying(&self) -> bool {
        match self.config.waveform {
            Waveform::Constant => false,
            Waveform::EnvelopeFollow | Waveform::TimedTransition => {
                self.config.min != self.config.max
            }
            _ => self.config.frequency > 0.0 && self.config.min != self.config.max,
        }
    }

    /// Return every track to its initial phase and value
    pub fn reset(&mut self) {
        let linked = self.config.stereo_link;
        let hold = self.map(if self.config.inverse { 0.0 } else { 1.0 });
        let start = self.envelope.as_ref().map(|e| e.start()).unwrap_or_default();
        let select = self.config.waveform == Waveform::RandomSelect;
        let rng = &mut self.rng;
        for (t, track) in self.tracks.iter_mut().enumerate() {
            let spread = if linked { 0.0 } else { t as f32 * TRACK_PHASE_SPREAD };
            *track = TrackState {
                phase: (self.config.phase + spread).rem_euclid(1.0),
                value: hold,
                level: if select { rng.f32() } else { 0.0 },
                envelope: start,
            };
        }
        if self.config.waveform == Waveform::TimedTransition {
            let value = self.map(self.orient(0.0));
            for track in self.tracks.iter_mut() {
                track.value = value;
            }
        }
        self.calls = [0; MAX_TRACKS];
        self.generation = 0;
        self.previous = self.tracks[0].value;
    }

    /// Leave the sustain stage of a timed transition
    pub fn release(&mut self) {
        if let Some(envelope) = &self.envelope {
            for track in self.tracks.iter_mut() {
                envelope.release(&mut track.envelope);
            }
        }
    }

    /// Last value returned for a track
    pub fn value(&self, track: usize) -> f32 {
        self.tracks[self.slot(track)].value
    }

    #[inline]
    fn slot(&self, track: usize) -> usize {
        if self.config.stereo_link {
            0
        } else {
            track.min(MAX_TRACKS - 1)
        }
    }

    #[inline]
    fn orient(&self, w: f32) -> f32 {
        if self.config.inverse {
            1.0 - w
        } else {
            w
        }
    }

    /// Map a normalized level onto [min, max]
    #[inline]
    fn map(&self, w: f32) -> f32 {
        let ModulationConfig { min, max, .. } = self.config;
        if self.config.logarithmic && min > 0.0 && max > 0.0 {
            min * (max / min).powf(w)
        } else {
            min + (max - min) * w
        }
    }

    /// Evaluate the control value for one block and advance the phase
    ///
    /// `input` is the block being processed and is only consulted by the
    /// envelope follower. With stereo link the shared value advances once
    /// per block, on whichever track asks first; the other tracks get the
    /// same value for that block regardless of call order, as long as no
    /// track falls more than one block behind.
    pub fn get(&mut self, track: usize, input: Option<&[Sample]>, frames: usize) -> f32 {
        let slot = self.slot(track);
        if self.config.stereo_link {
            let counter = &mut self.calls[track.min(MAX_TRACKS - 1)];
            *counter += 1;
            let call = *counter;
            if call < self.generation {
                return self.previous;
            }
            if call == self.generation {
                return self.tracks[0].value;
            }
            self.previous = self.tracks[0].value;
            self.generation = call;
        }

        let frequency = self.config.frequency;
        let step = frequency * frames as f32 / self.sample_rate;
        let waveform = self.config.waveform;
        let mut state = self.tracks[slot];

        let value = match waveform {
            Waveform::Constant => self.map(self.orient(1.0)),
            Waveform::EnvelopeFollow => {
                let magnitude = input
                    .map(|block| rms(block) * std::f32::consts::SQRT_2)
                    .unwrap_or(0.0);
                let tau = if magnitude > state.level {
                    self.config.attack
                } else {
                    self.config.release
                };
                let coeff = if tau > 0.0 {
                    1.0 - (-(frames as f32) / (tau * self.sample_rate)).exp()
                } else {
                    1.0
                };
                state.level += (magnitude - state.level) * coeff;
                self.map(self.orient(state.level.clamp(0.0, 1.0)))
            }
            Waveform::TimedTransition => match &self.envelope {
                Some(envelope) => {
                    let w = envelope.next(&mut state.envelope);
                    self.map(self.orient(w))
                }
                None => state.value,
            },
            // Frequency zero freezes the phase and holds the last value
            _ if frequency == 0.0 => state.value,
            Waveform::Random => {
                let target = self.rng.f32();
                state.level += (target - state.level) * step.min(1.0);
                self.map(self.orient(state.level))
            }
            Waveform::RandomSelect => {
                let next = state.phase + step;
                if next >= 1.0 {
                    state.level = self.rng.f32();
                }
                state.phase = next.fract();
                self.map(self.orient(state.level))
            }
            periodic => {
                let w = periodic.shape(state.phase);
                state.phase = (state.phase + step).fract();
                self.map(self.orient(w))
            }
        };

        state.value = value;
        self.tracks[slot] = state;
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(config: ModulationConfig) -> Modulator {
        Modulator::with_config(config, 1000.0, 100).unwrap()
    }

    #[test]
    fn test_constant() {
        let mut lfo = setup(ModulationConfig::constant(0.3));
        assert_eq!(lfo.get(0, None, 100), 0.3);
        assert_eq!(lfo.get(1, None, 100), 0.3);
        assert!(!lfo.is_varying());
    }

    #[test]
    fn test_zero_frequency_holds() {
        let mut lfo = setup(ModulationConfig::periodic(Waveform::Sine, 2.0, 8.0, 0.0));
        for _ in 0..10 {
            assert_eq!(lfo.get(0, None, 100), 8.0);
        }
        assert!(!lfo.is_varying());

        let mut config = ModulationConfig::periodic(Waveform::Triangle, 2.0, 8.0, 0.0);
        config.inverse = true;
        let mut lfo = setup(config);
        assert_eq!(lfo.get(0, None, 100), 2.0);
    }

    #[test]
    fn test_sawtooth_advances_and_wraps() {
        // 1Hz at 1000Hz sample rate, 250-frame blocks = quarter period per block
        let mut lfo = setup(ModulationConfig::periodic(Waveform::Sawtooth, 0.0, 1.0, 1.0));
        let values: Vec<f32> = (0..5).map(|_| lfo.get(0, None, 250)).collect();
        assert_eq!(values, vec![0.0, 0.25, 0.5, 0.75, 0.0]);
    }

    #[test]
    fn test_inverse() {
        let mut config = ModulationConfig::periodic(Waveform::Sawtooth, 0.0, 1.0, 1.0);
        config.inverse = true;
        let mut lfo = setup(config);
        assert_eq!(lfo.get(0, None, 250), 1.0);
        assert_eq!(lfo.get(0, None, 250), 0.75);
    }

    #[test]
    fn test_stereo_link_shares_phase() {
        let mut config = ModulationConfig::periodic(Waveform::Sawtooth, 0.0, 1.0, 1.0);
        config.stereo_link = true;
        let mut lfo = setup(config);
        let left = lfo.get(0, None, 250);
        let right = lfo.get(1, None, 250);
        assert_eq!(left, right);

        let mut lfo = setup(ModulationConfig::periodic(Waveform::Sawtooth, 0.0, 1.0, 1.0));
        assert_eq!(lfo.get(0, None, 250), 0.0);
        assert_eq!(lfo.get(1, None, 250), TRACK_PHASE_SPREAD);
    }

    #[test]
    fn test_stereo_link_ignores_call_order() {
        let mut config = ModulationConfig::periodic(Waveform::Sawtooth, 0.0, 1.0, 1.0);
        config.stereo_link = true;
        let mut forward = setup(config.clone());
        let mut backward = setup(config);

        for block in 0..6 {
            let left = forward.get(0, None, 250);
            let right = forward.get(1, None, 250);
            assert_eq!(left, right);

            let right_first = backward.get(1, None, 250);
            let left_second = backward.get(0, None, 250);
            assert_eq!(right_first, left_second);
            assert_eq!(left, right_first, "block {}", block);
        }

        // A track one block behind still sees its own block's value
        let mut lfo = setup(ModulationConfig {
            stereo_link: true,
            ..ModulationConfig::periodic(Waveform::Sawtooth, 0.0, 1.0, 1.0)
        });
        assert_eq!(lfo.get(0, None, 250), 0.0);
        assert_eq!(lfo.get(0, None, 250), 0.25);
        assert_eq!(lfo.get(1, None, 250), 0.0);
        assert_eq!(lfo.get(1, None, 250), 0.25);
    }

    #[test]
    fn test_envelope_follow_attack_release() {
        let mut config = ModulationConfig::default();
        config.waveform = Waveform::EnvelopeFollow;
        config.attack = 0.0;
        config.release = 0.5;
        let mut lfo = setup(config);

        let loud = vec![0.5; 100];
        let silent = vec![0.0; 100];
        let peak = lfo.get(0, Some(&loud), 100);
        assert!((peak - 0.5 * std::f32::consts::SQRT_2).abs() < 1e-5);

        let decayed = lfo.get(0, Some(&silent), 100);
        assert!(decayed < peak && decayed > 0.0);
    }

    #[test]
    fn test_timed_transition() {
        let mut config = ModulationConfig::default();
        config.waveform = Waveform::TimedTransition;
        config.min = 100.0;
        config.max = 200.0;
        config.transition = 0.5;
        let mut lfo = setup(config);

        assert_eq!(lfo.value(0), 100.0);
        let values: Vec<f32> = (0..6).map(|_| lfo.get(0, None, 100)).collect();
        assert_eq!(values[4], 200.0);
        assert_eq!(values[5], 200.0);
        assert!(values[0] > 100.0 && values[0] < 200.0);
    }

    #[test]
    fn test_random_select_stays_in_range() {
        let mut lfo = setup(ModulationConfig::periodic(Waveform::RandomSelect, -1.0, 1.0, 5.0));
        for _ in 0..100 {
            let v = lfo.get(0, None, 100);
            assert!((-1.0..=1.0).contains(&v));
        }
    }

    #[test]
    fn test_logarithmic_mapping() {
        let mut config = ModulationConfig::periodic(Waveform::Sawtooth, 100.0, 10000.0, 1.0);
        config.logarithmic = true;
        let mut lfo = setup(config);
        lfo.get(0, None, 500);
        // Half a period later the sawtooth is at 0.5: geometric mean of the range
        assert!((lfo.get(0, None, 500) - 1000.0).abs() < 0.1);
    }

    #[test]
    fn test_unsupported_flags() {
        let mut lfo = Modulator::default();
        let err = lfo.setup(48000.0, 512, ModulationFlags::from_bits(0x0003));
        assert_eq!(err, Err(DspError::UnsupportedFlags(0x0003)));
    }
}
