//! Fractional sample reading
//!
//! - **Linear**: 2-point, cheap, used for time-varying delay offsets
//! - **Cubic**: 4-point Catmull-Rom, used for pitch resampling

use serde::{Deserialize, Serialize};

use crate::types::Sample;

/// Interpolation method for variable-rate reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterpolationMethod {
    /// Linear interpolation (2-point) - fast, acceptable quality
    Linear,
    /// Cubic Catmull-Rom interpolation (4-point) - better quality
    #[default]
    Cubic,
}

/// Catmull-Rom spline through `y1`..`y2` at `t` in [0, 1)
#[inline]
pub fn catmull_rom(y0: Sample, y1: Sample, y2: Sample, y3: Sample, t: f32) -> Sample {
    let a0 = -0.5 * y0 + 1.5 * y1 - 1.5 * y2 + 0.5 * y3;
    let a1 = y0 - 2.5 * y1 + 2.0 * y2 - 0.5 * y3;
    let a2 = -0.5 * y0 + 0.5 * y2;
    ((a0 * t + a1) * t + a2) * t + y1
}

/// Linearly interpolated read at a fractional index into `data`
///
/// Out-of-range neighbours read as silence. Integral positions return the
/// stored sample unchanged.
#[inline]
pub fn read_fractional(data: &[Sample], pos: f64) -> Sample {
    let base = pos.floor();
    let frac = (pos - base) as f32;
    let i = base as isize;
    let at = |i: isize| {
        if i >= 0 && (i as usize) < data.len() {
            data[i as usize]
        } else {
            0.0
        }
    };
    let a = at(i);
    if frac == 0.0 {
        a
    } else {
        a + (at(i + 1) - a) * frac
    }
}
