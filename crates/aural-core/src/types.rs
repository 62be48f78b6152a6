//! Common types for Aural
//!
//! Fundamental sample types, engine-wide limits and the level/gain helpers
//! shared by the buffer, modulation and effect modules.

use serde::{Deserialize, Serialize};

/// Default mixer sample rate (48kHz)
pub const DEFAULT_SAMPLE_RATE: f32 = 48000.0;

/// Default block length in frames (~10.7ms at 48kHz)
pub const DEFAULT_PERIOD_FRAMES: usize = 512;

/// Maximum number of tracks (channels) a sample buffer may carry
pub const MAX_TRACKS: usize = 8;

/// Upper bound for the renderer worker pool regardless of core count
pub const MAX_WORKERS: usize = 16;

/// Default history reservoir length in seconds
///
/// Must cover the longest delay any effect in the chain can request.
pub const DEFAULT_HISTORY_SECONDS: f32 = 1.0;

/// Gains below this magnitude (-60dB) are treated as exactly zero
pub const LEVEL_60DB: f32 = 0.001;

/// Gains below this magnitude (-96dB) are below 16-bit resolution
pub const LEVEL_96DB: f32 = 0.000_015_85;

/// Audio sample type used for all processing
pub type Sample = f32;

/// Storage/exchange format of a sample buffer
///
/// Processing always happens in `f32`; the format only matters when a
/// buffer is filled by the codec layer or handed to a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    /// 32-bit float, native processing format
    #[default]
    F32,
    /// 32-bit signed integer
    I32,
    /// 24-bit signed integer, stored in the low bits of an i32
    I24,
    /// 16-bit signed integer
    I16,
    /// 8-bit unsigned integer
    U8,
}

impl SampleFormat {
    /// Size of one encoded sample in bytes
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            Self::F32 | Self::I32 | Self::I24 => 4,
            Self::I16 => 2,
            Self::U8 => 1,
        }
    }

    /// Number of significant bits
    pub fn bits(&self) -> u32 {
        match self {
            Self::F32 | Self::I32 => 32,
            Self::I24 => 24,
            Self::I16 => 16,
            Self::U8 => 8,
        }
    }
}

/// Convert decibels to a linear gain
#[inline]
pub fn db_to_gain(db: f32) -> f32 {
    10.0_f32.powf(db / 20.0)
}

/// Convert a linear gain to decibels
#[inline]
pub fn gain_to_db(gain: f32) -> f32 {
    20.0 * gain.max(f32::MIN_POSITIVE).log10()
}

/// Snap inaudible gains to exactly zero
#[inline]
pub fn audible(gain: f32) -> f32 {
    if gain.abs() < LEVEL_60DB {
        0.0
    } else {
        gain
    }
}

/// Convert seconds to (fractional) frames
#[inline]
pub fn seconds_to_frames(seconds: f32, sample_rate: f32) -> f32 {
    seconds * sample_rate
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_conversion() {
        assert!((db_to_gain(0.0) - 1.0).abs() < 1e-6);
        assert!((db_to_gain(-6.0) - 0.501).abs() < 0.001);
        assert!((gain_to_db(0.5) + 6.02).abs() < 0.01);
        assert!((gain_to_db(db_to_gain(-60.0)) + 60.0).abs() < 0.01);
    }

    #[test]
    fn test_audible_threshold() {
        assert_eq!(audible(0.0009), 0.0);
        assert_eq!(audible(-0.0009), 0.0);
        assert_eq!(audible(0.5), 0.5);
        assert_eq!(audible(LEVEL_60DB), LEVEL_60DB);
    }

    #[test]
    fn test_format_sizes() {
        assert_eq!(SampleFormat::F32.bytes_per_sample(), 4);
        assert_eq!(SampleFormat::I24.bytes_per_sample(), 4);
        assert_eq!(SampleFormat::I24.bits(), 24);
        assert_eq!(SampleFormat::U8.bytes_per_sample(), 1);
    }
}
