//! Waveform kinds, the source bitmask and the periodic shapes

use serde::{Deserialize, Serialize};
use std::ops::BitOr;

use crate::error::{DspError, DspResult};

/// Evaluation mode of a modulator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Waveform {
    /// Always `max` (or `min` when inverted)
    #[default]
    Constant,
    Sine,
    Triangle,
    Square,
    Sawtooth,
    /// Semicircular arches, one per period
    Cycloid,
    /// Short pulse at the start of each period
    Impulse,
    /// Smoothed random walk
    Random,
    /// Sample-and-hold: a new random level every period
    RandomSelect,
    /// Follows the magnitude of the processed signal
    EnvelopeFollow,
    /// Steps from `min` to `max` over a fixed duration
    TimedTransition,
}

impl Waveform {
    /// Whether the waveform has a phase that advances with frequency
    pub fn is_periodic(&self) -> bool {
        matches!(
            self,
            Self::Sine
                | Self::Triangle
                | Self::Square
                | Self::Sawtooth
                | Self::Cycloid
                | Self::Impulse
                | Self::RandomSelect
        )
    }

    /// Shape of a periodic waveform at `phase` in [0, 1), mapped to [0, 1]
    #[inline]
    pub fn shape(&self, phase: f32) -> f32 {
        match self {
            Self::Sine => 0.5 + 0.5 * (std::f32::consts::TAU * phase).sin(),
            Self::Triangle => 1.0 - (2.0 * phase - 1.0).abs(),
            Self::Square => {
                if phase < 0.5 {
                    1.0
                } else {
                    0.0
                }
            }
            Self::Sawtooth => phase,
            Self::Cycloid => {
                let x = 2.0 * phase - 1.0;
                (1.0 - x * x).max(0.0).sqrt()
            }
            Self::Impulse => {
                if phase < 0.05 {
                    1.0
                } else {
                    0.0
                }
            }
            _ => 1.0,
        }
    }
}

/// Modulation source bitmask
///
/// Exactly one waveform bit must be set; the option bits may be combined
/// freely with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModulationFlags(u32);

impl ModulationFlags {
    pub const CONSTANT: Self = Self(0x0001);
    pub const SINE: Self = Self(0x0002);
    pub const TRIANGLE: Self = Self(0x0004);
    pub const SQUARE: Self = Self(0x0008);
    pub const SAWTOOTH: Self = Self(0x0010);
    pub const CYCLOID: Self = Self(0x0020);
    pub const IMPULSE: Self = Self(0x0040);
    pub const RANDOM: Self = Self(0x0080);
    pub const RANDOM_SELECT: Self = Self(0x0100);
    pub const ENVELOPE_FOLLOW: Self = Self(0x0200);
    pub const TIMED_TRANSITION: Self = Self(0x0400);

    pub const WAVEFORM_MASK: u32 = 0x07ff;

    /// Invert the waveform (`1 - w`)
    pub const INVERSE: Self = Self(0x1000);
    /// All tracks share track 0's phase
    pub const STEREO_LINK: Self = Self(0x2000);
    /// Map the waveform logarithmically between min and max
    pub const LOGARITHMIC: Self = Self(0x4000);
    /// Exponential instead of linear timed transition
    pub const EXPONENTIAL: Self = Self(0x8000);

    pub const OPTION_MASK: u32 = 0xf000;

    #[inline]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[inline]
    pub const fn bits(&self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Decode the waveform bit
    pub fn waveform(&self) -> DspResult<Waveform> {
        if self.0 & !(Self::WAVEFORM_MASK | Self::OPTION_MASK) != 0 {
            return Err(DspError::UnsupportedFlags(self.0));
        }
        let waveform = match self.0 & Self::WAVEFORM_MASK {
            0x0001 => Waveform::Constant,
            0x0002 => Waveform::Sine,
            0x0004 => Waveform::Triangle,
            0x0008 => Waveform::Square,
            0x0010 => Waveform::Sawtooth,
            0x0020 => Waveform::Cycloid,
            0x0040 => Waveform::Impulse,
            0x0080 => Waveform::Random,
            0x0100 => Waveform::RandomSelect,
            0x0200 => Waveform::EnvelopeFollow,
            0x0400 => Waveform::TimedTransition,
            _ => return Err(DspError::UnsupportedFlags(self.0)),
        };
        Ok(waveform)
    }
}

impl From<Waveform> for ModulationFlags {
    fn from(waveform: Waveform) -> Self {
        match waveform {
            Waveform::Constant => Self::CONSTANT,
            Waveform::Sine => Self::SINE,
            Waveform::Triangle => Self::TRIANGLE,
            Waveform::Square => Self::SQUARE,
            Waveform::Sawtooth => Self::SAWTOOTH,
            Waveform::Cycloid => Self::CYCLOID,
            Waveform::Impulse => Self::IMPULSE,
            Waveform::Random => Self::RANDOM,
            Waveform::RandomSelect => Self::RANDOM_SELECT,
            Waveform::EnvelopeFollow => Self::ENVELOPE_FOLLOW,
            Waveform::TimedTransition => Self::TIMED_TRANSITION,
        }
    }
}

impl BitOr for ModulationFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}
