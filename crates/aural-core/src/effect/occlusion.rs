//! Occlusion - an axis-aligned obstacle between source and listener
//!
//! The obstacle is a 4-vector: three half-extents and a density. On the
//! direct path it attenuates and darkens the signal in proportion to how
//! much of the source-listener segment runs through it. The reverb uses
//! the same obstacle to weaken reflections arriving from its side.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::filter::FilterState;
use super::{
    Block, Cached, DspContext, Effect, EffectKind, FilterCoefficients, FilterParams, ParamExchange,
};
use crate::error::{DspError, DspResult};
use crate::types::{Sample, MAX_TRACKS};

/// Cutoff of a fully occluded path, as a fraction of the open cutoff
const DARKEST: f32 = 0.05;
const OPEN_CUTOFF: f32 = 20000.0;

/// Far-ear delay of lateral reflections, in seconds
const INTERAURAL_DELAY: f32 = 0.0006;
/// Far-ear gain of lateral reflections
const INTERAURAL_GAIN: f32 = 0.6;

/// Arrival direction of a reflection, in listener space
///
/// Right-handed, listener facing -Z.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Left,
    Right,
    Front,
    Back,
    Up,
    Down,
}

impl Direction {
    pub const ALL: [Direction; 6] = [
        Direction::Left,
        Direction::Right,
        Direction::Front,
        Direction::Back,
        Direction::Up,
        Direction::Down,
    ];

    fn axis(&self) -> usize {
        match self {
            Self::Left | Self::Right => 0,
            Self::Up | Self::Down => 1,
            Self::Front | Self::Back => 2,
        }
    }

    fn sign(&self) -> f32 {
        match self {
            Self::Right | Self::Up | Self::Back => 1.0,
            Self::Left | Self::Down | Self::Front => -1.0,
        }
    }

    /// Whether a lateral reflection reaches this track's ear last
    ///
    /// Even tracks are left, odd tracks are right.
    fn far_side(&self, track: usize, tracks: usize) -> bool {
        if tracks < 2 {
            return false;
        }
        match self {
            Self::Left => track % 2 == 1,
            Self::Right => track % 2 == 0,
            _ => false,
        }
    }

    /// Extra arrival delay in seconds for a track
    pub fn track_delay(&self, track: usize, tracks: usize) -> f32 {
        if self.far_side(track, tracks) {
            INTERAURAL_DELAY
        } else {
            0.0
        }
    }

    pub fn track_gain(&self, track: usize, tracks: usize) -> f32 {
        if self.far_side(track, tracks) {
            INTERAURAL_GAIN
        } else {
            1.0
        }
    }
}

/// Obstacle description: half-extents (x, y, z) and density
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Occlusion {
    pub half_extents: [f32; 3],
    /// 0 = transparent, 1 = solid
    pub density: f32,
}

impl Occlusion {
    pub fn from_vec4(v: [f32; 4]) -> Self {
        Self {
            half_extents: [v[0], v[1], v[2]],
            density: v[3],
        }
    }

    pub fn to_vec4(&self) -> [f32; 4] {
        let [x, y, z] = self.half_extents;
        [x, y, z, self.density]
    }

    pub fn is_active(&self) -> bool {
        self.density > 0.0 && self.half_extents.iter().all(|&h| h > 0.0)
    }

    /// Fraction of the segment from `source` to the listener (origin)
    /// that lies inside the obstacle centered at `center`
    pub fn path_overlap(&self, center: [f32; 3], source: [f32; 3]) -> f32 {
        if !self.is_active() {
            return 0.0;
        }
        // Slab test on p(t) = source * (1 - t), t in [0, 1]
        let (mut t0, mut t1) = (0.0_f32, 1.0_f32);
        for axis in 0..3 {
            let lo = center[axis] - self.half_extents[axis];
            let hi = center[axis] + self.half_extents[axis];
            let origin = source[axis];
            let dir = -source[axis];
            if dir.abs() < f32::EPSILON {
                if origin < lo || origin > hi {
                    return 0.0;
                }
                continue;
            }
            let (mut a, mut b) = ((lo - origin) / dir, (hi - origin) / dir);
            if a > b {
                std::mem::swap(&mut a, &mut b);
            }
            t0 = t0.max(a);
            t1 = t1.min(b);
            if t0 >= t1 {
                return 0.0;
            }
        }
        t1 - t0
    }

    /// Occlusion amount on the direct path, 0..=1
    pub fn amount(&self, center: [f32; 3], source: [f32; 3]) -> f32 {
        (self.density.clamp(0.0, 1.0) * self.path_overlap(center, source)).clamp(0.0, 1.0)
    }

    /// Gain applied to reflections arriving from `direction`
    ///
    /// Scales with the share of the obstacle on that side and with the
    /// angle it covers as seen from the listener.
    pub fn directional_factor(&self, center: [f32; 3], direction: Direction) -> f32 {
        if !self.is_active() {
            return 1.0;
        }
        let axis = direction.axis();
        let h = self.half_extents[axis];
        let offset = center[axis] * direction.sign();
        let share = ((offset + h) / (2.0 * h)).clamp(0.0, 1.0);

        let face = self.half_extents[(axis + 1) % 3] * self.half_extents[(axis + 2) % 3];
        let distance = (offset - h).max(0.0);
        let cover = face / (face + distance * distance);

        1.0 - self.density.clamp(0.0, 1.0) * share * cover
    }
}

/// Direct-path occlusion parameters
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OcclusionParams {
    pub occlusion: Occlusion,
    /// Obstacle center relative to the listener
    pub center: [f32; 3],
    /// Source position relative to the listener
    pub source: [f32; 3],
}

#[derive(Debug, Clone)]
pub struct OcclusionSettings {
    pub params: OcclusionParams,
    amount: f32,
    gain: f32,
    coefficients: FilterCoefficients,
}

/// Direct-path occlusion effect
pub struct OcclusionEffect {
    ctx: DspContext,
    exchange: Arc<ParamExchange<OcclusionSettings>>,
    cached: Cached<OcclusionSettings>,
    state: [FilterState; MAX_TRACKS],
}

impl OcclusionEffect {
    pub fn new(ctx: &DspContext, params: OcclusionParams) -> DspResult<Self> {
        let exchange = Arc::new(ParamExchange::new(Self::derive(&params, ctx)?));
        Ok(Self {
            ctx: *ctx,
            cached: Cached::new(&exchange),
            exchange,
            state: [FilterState::default(); MAX_TRACKS],
        })
    }
}

impl Effect for OcclusionEffect {
    type Params = OcclusionParams;
    type Settings = OcclusionSettings;

    const KIND: EffectKind = EffectKind::Occlusion;

    fn derive(params: &OcclusionParams, ctx: &DspContext) -> DspResult<OcclusionSettings> {
        let occlusion = &params.occlusion;
        if !(0.0..=1.0).contains(&occlusion.density) {
            return Err(DspError::InvalidParameter {
                name: "density",
                value: occlusion.density,
            });
        }
        if let Some(&h) = occlusion.half_extents.iter().find(|h| !(**h >= 0.0)) {
            return Err(DspError::InvalidParameter {
                name: "half_extents",
                value: h,
            });
        }

        let amount = occlusion.amount(params.center, params.source);
        let cutoff = (OPEN_CUTOFF * DARKEST.powf(amount)).min(ctx.sample_rate * 0.45);
        let coefficients =
            FilterCoefficients::compute(&FilterParams::low_pass(cutoff), cutoff, ctx.sample_rate);
        Ok(OcclusionSettings {
            params: params.clone(),
            amount,
            gain: 1.0 - amount,
            coefficients,
        })
    }

    fn context(&self) -> &DspContext {
        &self.ctx
    }

    fn exchange(&self) -> &Arc<ParamExchange<OcclusionSettings>> {
        &self.exchange
    }

    fn process(&mut self, output: &mut [Sample], input: &[Sample], block: Block) {
        self.cached.refresh(&self.exchange);
        let settings = self.cached.get();
        let range = block.range();
        if settings.amount == 0.0 {
            output[range.clone()].copy_from_slice(&input[range]);
            return;
        }
        let state = &mut self.state[block.track.min(MAX_TRACKS - 1)];
        for (o, &x) in output[range.clone()].iter_mut().zip(&input[range]) {
            *o = state.tick(&settings.coefficients, x) * settings.gain;
        }
    }

    fn reset(&mut self) {
        for state in self.state.iter_mut() {
            state.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::{context, rms, run_blocks, sine};
    use super::*;

    fn wall() -> Occlusion {
        Occlusion::from_vec4([2.0, 2.0, 0.5, 1.0])
    }

    #[test]
    fn test_path_overlap() {
        // Source 4m in front, wall 2m in front, 1m thick
        let overlap = wall().path_overlap([0.0, 0.0, -2.0], [0.0, 0.0, -4.0]);
        assert!((overlap - 0.25).abs() < 1e-5);
        // Source behind the listener, wall in front
        assert_eq!(wall().path_overlap([0.0, 0.0, -2.0], [0.0, 0.0, 4.0]), 0.0);
    }

    #[test]
    fn test_inactive_is_transparent() {
        let open = Occlusion::from_vec4([2.0, 2.0, 0.5, 0.0]);
        assert_eq!(open.path_overlap([0.0, 0.0, -2.0], [0.0, 0.0, -4.0]), 0.0);
        assert_eq!(open.directional_factor([0.0, 0.0, -2.0], Direction::Front), 1.0);
    }

    #[test]
    fn test_directional_factor_favors_side() {
        let center = [0.0, 0.0, -2.0];
        let front = wall().directional_factor(center, Direction::Front);
        let back = wall().directional_factor(center, Direction::Back);
        assert!(front < 1.0);
        assert_eq!(back, 1.0);
    }

    #[test]
    fn test_unoccluded_is_identity() {
        let params = OcclusionParams {
            occlusion: wall(),
            center: [0.0, 0.0, 2.0],
            source: [0.0, 0.0, -4.0],
        };
        let mut effect = OcclusionEffect::new(&context(), params).unwrap();
        let input = sine(1000.0, 0.5, 2048);
        assert_eq!(run_blocks(&mut effect, &input, 512), input);
    }

    #[test]
    fn test_occluded_is_quieter() {
        let params = OcclusionParams {
            occlusion: wall(),
            center: [0.0, 0.0, -2.0],
            source: [0.0, 0.0, -4.0],
        };
        let mut effect = OcclusionEffect::new(&context(), params).unwrap();
        let input = sine(5000.0, 0.5, 4800);
        let output = run_blocks(&mut effect, &input, 512);
        assert!(rms(&output[2400..]) < rms(&input[2400..]) * 0.75);
    }

    #[test]
    fn test_invalid_density() {
        let params = OcclusionParams {
            occlusion: Occlusion::from_vec4([1.0, 1.0, 1.0, 1.5]),
            ..Default::default()
        };
        assert!(OcclusionEffect::new(&context(), params).is_err());
    }

    #[test]
    fn test_interaural() {
        assert_eq!(Direction::Left.track_gain(0, 2), 1.0);
        assert_eq!(Direction::Left.track_gain(1, 2), INTERAURAL_GAIN);
        assert_eq!(Direction::Right.track_delay(0, 2), INTERAURAL_DELAY);
        assert_eq!(Direction::Front.track_delay(1, 2), 0.0);
        assert_eq!(Direction::Left.track_gain(0, 1), 1.0);
    }
}
