//! Effect chain applier
//!
//! Runs a property block's effects in a fixed order:
//!
//! 1. occlusion
//! 2. bit reduction
//! 3. ring modulation
//! 4. frequency filter
//! 5. noise injection
//! 6. distortion, wave folding
//! 7. delay line
//! 8. reverb, convolution
//!
//! Every enabled stage reads the live signal and writes a scratch buffer
//! (ping-pong). The destination is written once, at the end, if the live
//! signal isn't already there.

use super::{Block, DspContext, Effect, EffectKind, EffectPreset, EffectState};
use crate::buffer::{Live, ScratchBuffers};
use crate::error::{self, DspError, DspResult};
use crate::types::Sample;

const SLOTS: usize = 9;

fn slot(kind: EffectKind) -> usize {
    match kind {
        EffectKind::Occlusion => 0,
        EffectKind::BitCrusher => 1,
        EffectKind::RingModulator => 2,
        EffectKind::FrequencyFilter => 3,
        EffectKind::Distortion => 4,
        EffectKind::WaveFolder => 5,
        EffectKind::DelayLine => 6,
        EffectKind::Reverb => 7,
        EffectKind::Convolution => 8,
    }
}

#[derive(Debug, Clone, Copy)]
enum Stage {
    Effect(EffectKind),
    Reduce,
    Inject,
}

const STAGES: [Stage; 10] = [
    Stage::Effect(EffectKind::Occlusion),
    Stage::Reduce,
    Stage::Effect(EffectKind::RingModulator),
    Stage::Effect(EffectKind::FrequencyFilter),
    Stage::Inject,
    Stage::Effect(EffectKind::Distortion),
    Stage::Effect(EffectKind::WaveFolder),
    Stage::Effect(EffectKind::DelayLine),
    Stage::Effect(EffectKind::Reverb),
    Stage::Effect(EffectKind::Convolution),
];

/// Run one stage from the live buffer into the next scratch buffer
#[inline]
fn ping_pong<F>(dst: &mut [Sample], scratch: &mut ScratchBuffers, live: &mut Live, stage: F)
where
    F: FnOnce(&mut [Sample], &[Sample]),
{
    let (input, output, next) = scratch.ping_pong(dst, *live);
    stage(output, input);
    *live = next;
}

/// The effects attached to one source (or the output bus)
#[derive(Debug, Default)]
pub struct EffectChain {
    slots: [Option<EffectState>; SLOTS],
}

impl EffectChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a chain from presets; an invalid preset is skipped and
    /// recorded as the last error
    pub fn from_presets(presets: &[EffectPreset], ctx: &DspContext) -> Self {
        let mut chain = Self::new();
        for preset in presets {
            if let Err(e) = chain.install_preset(preset, ctx) {
                log::warn!("Skipping {} preset: {}", preset.kind(), e);
            }
        }
        chain
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    /// Kinds of all installed effects, in processing order
    pub fn kinds(&self) -> impl Iterator<Item = EffectKind> + '_ {
        self.slots.iter().flatten().map(EffectState::kind)
    }

    pub fn get(&self, kind: EffectKind) -> Option<&EffectState> {
        self.slots[slot(kind)].as_ref()
    }

    pub fn get_mut(&mut self, kind: EffectKind) -> Option<&mut EffectState> {
        self.slots[slot(kind)].as_mut()
    }

    /// Install an effect, returning the one it replaces
    pub fn install(&mut self, effect: EffectState) -> Option<EffectState> {
        self.slots[slot(effect.kind())].replace(effect)
    }

    /// Build and install an effect from a preset
    ///
    /// On invalid parameters an already installed effect of that kind is
    /// disabled and the error recorded.
    pub fn install_preset(
        &mut self,
        preset: &EffectPreset,
        ctx: &DspContext,
    ) -> DspResult<Option<EffectState>> {
        match preset.build(ctx) {
            Ok(effect) => Ok(self.install(effect)),
            Err(e) => {
                if let Some(existing) = self.get(preset.kind()) {
                    existing.set_enabled(false);
                }
                Err(error::record(e))
            }
        }
    }

    /// Install an effect, or swap parameters into an installed effect of
    /// the same kind so its history survives
    ///
    /// An installed effect whose history is too short for the incoming
    /// parameters is replaced wholesale. Returns the effect left over: the
    /// one replaced, or the incoming one now carrying the previous
    /// parameters.
    pub fn update(&mut self, mut effect: EffectState) -> Option<EffectState> {
        if let Some(existing) = self.slots[slot(effect.kind())].as_mut() {
            if existing.swap_params(&mut effect) {
                return Some(effect);
            }
        }
        self.install(effect)
    }

    pub fn remove(&mut self, kind: EffectKind) -> Option<EffectState> {
        self.slots[slot(kind)].take()
    }

    /// Exchange parameters with another chain
    ///
    /// Effects present in both chains swap parameter snapshots and keep
    /// their history; effects present in only one move across wholesale.
    pub fn swap(&mut self, other: &mut EffectChain) {
        for (mine, theirs) in self.slots.iter_mut().zip(other.slots.iter_mut()) {
            let swapped = match (mine.as_mut(), theirs.as_mut()) {
                (Some(a), Some(b)) => a.swap_params(b),
                _ => false,
            };
            if !swapped {
                std::mem::swap(mine, theirs);
            }
        }
    }

    pub fn reset(&mut self) {
        for effect in self.slots.iter_mut().flatten() {
            effect.reset();
        }
    }

    /// Process one block of one track in place
    ///
    /// `dst` is the reservoir-prefixed track slice and `scratch` must use
    /// the same layout. Returns the block with `ds` set to the reservoir
    /// frames the delay line prepared.
    pub fn apply(
        &mut self,
        dst: &mut [Sample],
        scratch: &mut ScratchBuffers,
        block: Block,
    ) -> DspResult<Block> {
        if self.is_empty() {
            return Ok(block);
        }
        scratch.check(block.frames)?;
        if scratch.history() != block.start || dst.len() < block.start + block.frames {
            return Err(DspError::InvalidParameter {
                name: "block",
                value: block.start as f32,
            });
        }

        let mut live = Live::Destination;
        let mut block = block;

        for stage in STAGES {
            match stage {
                Stage::Reduce | Stage::Inject => {
                    let Some(EffectState::BitCrusher(crusher)) =
                        self.slots[slot(EffectKind::BitCrusher)].as_mut()
                    else {
                        continue;
                    };
                    if !crusher.is_enabled() {
                        continue;
                    }
                    if matches!(stage, Stage::Reduce) {
                        if crusher.has_reduction() {
                            ping_pong(dst, scratch, &mut live, |out, input| {
                                crusher.reduce(out, input, block)
                            });
                        }
                    } else if crusher.has_noise() {
                        ping_pong(dst, scratch, &mut live, |out, input| {
                            crusher.inject(out, input, block)
                        });
                    }
                }
                Stage::Effect(kind) => {
                    let Some(effect) = self.slots[slot(kind)].as_mut() else {
                        continue;
                    };
                    if !effect.is_enabled() {
                        continue;
                    }
                    if let EffectState::DelayLine(delay) = &mut *effect {
                        let ds = delay.prepare(scratch.live_mut(dst, live), block);
                        block = block.with_ds(ds);
                    }
                    ping_pong(dst, scratch, &mut live, |out, input| {
                        effect.process(out, input, block)
                    });
                }
            }
        }

        if let Live::Scratch(i) = live {
            let range = block.range();
            dst[range.clone()].copy_from_slice(&scratch.buffer(i)[range]);
        }
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::{context, run_blocks, sine};
    use super::super::*;
    use super::*;
    use crate::modulation::{ModulationConfig, Waveform};

    const HISTORY: usize = 1024;
    const FRAMES: usize = 512;

    /// Run a chain over a signal on track 0 with a reservoir-prefixed buffer
    fn run_chain(chain: &mut EffectChain, signal: &[Sample]) -> Vec<Sample> {
        let mut scratch = ScratchBuffers::new(FRAMES, HISTORY).unwrap();
        let mut dst = vec![0.0; HISTORY + FRAMES];
        let mut out = Vec::with_capacity(signal.len());
        for chunk in signal.chunks(FRAMES) {
            dst[HISTORY..HISTORY + chunk.len()].copy_from_slice(chunk);
            let block = Block::new(0, HISTORY, chunk.len());
            chain.apply(&mut dst, &mut scratch, block).unwrap();
            out.extend_from_slice(&dst[HISTORY..HISTORY + chunk.len()]);
        }
        out
    }

    fn distortion(ctx: &DspContext, drive: f32) -> EffectState {
        EffectState::Distortion(Distortion::new(ctx, DistortionParams::with_drive(drive)).unwrap())
    }

    fn full_chain() -> EffectChain {
        let ctx = context();
        let presets = vec![
            EffectPreset::Occlusion(OcclusionParams {
                occlusion: Occlusion::from_vec4([2.0, 2.0, 0.5, 0.8]),
                center: [0.0, 0.0, -2.0],
                source: [0.0, 0.0, -4.0],
            }),
            EffectPreset::BitCrusher(BitCrusherParams {
                bits: 6.0,
                hold: 2,
                noise: 0.3,
            }),
            EffectPreset::RingModulator(RingModulatorParams::default()),
            EffectPreset::FrequencyFilter(FilterParams {
                sweep: Some(ModulationConfig::periodic(Waveform::Sine, 500.0, 4000.0, 1.0)),
                ..FilterParams::low_pass(2000.0)
            }),
            EffectPreset::Distortion(DistortionParams::with_drive(0.6)),
            EffectPreset::WaveFolder(WaveFolderParams {
                gain: ModulationConfig::constant(3.0),
                bias: 0.2,
                mix: 0.5,
            }),
            EffectPreset::DelayLine(DelayParams::flanger(0.02, 0.5, 0.5, 0.6)),
            EffectPreset::Reverb(ReverbParams::default()),
            EffectPreset::Convolution(ConvolutionParams::mono(vec![0.7, 0.0, 0.2])),
        ];
        let chain = EffectChain::from_presets(&presets, &ctx);
        assert_eq!(chain.kinds().count(), 9);
        chain
    }

    #[test]
    fn test_silence_stays_silent() {
        let mut chain = full_chain();
        let out = run_chain(&mut chain, &vec![0.0; 48000]);
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_full_chain_is_finite() {
        let mut chain = full_chain();
        let out = run_chain(&mut chain, &sine(440.0, 0.8, 24000));
        assert!(out.iter().all(|s| s.is_finite()));
        assert!(out.iter().any(|&s| s != 0.0));
    }

    #[test]
    fn test_empty_chain_is_identity() {
        let mut chain = EffectChain::new();
        let input = sine(440.0, 0.5, 2048);
        assert_eq!(run_chain(&mut chain, &input), input);
    }

    #[test]
    fn test_stage_order() {
        // Bit reduction runs before the filter, distortion after it
        let ctx = context();
        let crush = BitCrusherParams {
            bits: 3.0,
            hold: 1,
            noise: 0.0,
        };
        let filter = FilterParams::low_pass(3000.0);
        let drive = DistortionParams::with_drive(0.5);

        let mut chain = EffectChain::new();
        chain.install(EffectState::Distortion(Distortion::new(&ctx, drive.clone()).unwrap()));
        let frequency = FrequencyFilter::new(&ctx, filter.clone()).unwrap();
        chain.install(EffectState::FrequencyFilter(frequency));
        chain.install(EffectState::BitCrusher(BitCrusher::new(&ctx, crush.clone()).unwrap()));

        let input = sine(440.0, 0.7, 4096);
        let actual = run_chain(&mut chain, &input);

        let mut c = BitCrusher::new(&ctx, crush).unwrap();
        let mut f = FrequencyFilter::new(&ctx, filter).unwrap();
        let mut d = Distortion::new(&ctx, drive).unwrap();
        let crushed = run_blocks(&mut c, &input, FRAMES);
        let expected = run_blocks(&mut d, &run_blocks(&mut f, &crushed, FRAMES), FRAMES);

        assert_eq!(actual, expected);
    }

    #[test]
    fn test_delay_in_chain_matches_standalone() {
        let ctx = context();
        let params = DelayParams::echo(0.015, 0.5);
        let mut chain = EffectChain::new();
        chain.install(EffectState::DelayLine(DelayLine::new(&ctx, params.clone()).unwrap()));
        let mut standalone = DelayLine::new(&ctx, params).unwrap();

        let input = sine(300.0, 0.5, 8192);
        assert_eq!(run_chain(&mut chain, &input), run_blocks(&mut standalone, &input, FRAMES));
    }

    #[test]
    fn test_disabled_effect_is_skipped() {
        let ctx = context();
        let mut chain = EffectChain::new();
        chain.install(distortion(&ctx, 1.0));
        if let Some(effect) = chain.get(EffectKind::Distortion) {
            effect.set_enabled(false);
        }
        let input = sine(440.0, 0.5, 1024);
        assert_eq!(run_chain(&mut chain, &input), input);
    }

    #[test]
    fn test_invalid_preset_disables_existing() {
        let ctx = context();
        let mut chain = EffectChain::new();
        chain
            .install_preset(&EffectPreset::Distortion(DistortionParams::with_drive(0.5)), &ctx)
            .unwrap();
        let bad = EffectPreset::Distortion(DistortionParams::with_drive(4.0));
        assert!(chain.install_preset(&bad, &ctx).is_err());
        assert!(!chain.get(EffectKind::Distortion).unwrap().is_enabled());
    }

    #[test]
    fn test_swap_exchanges_params() {
        let ctx = context();
        let mut a = EffectChain::new();
        a.install(distortion(&ctx, 0.0));
        let mut b = EffectChain::new();
        b.install(distortion(&ctx, 1.0));
        let ring = RingModulator::new(&ctx, RingModulatorParams::default()).unwrap();
        b.install(EffectState::RingModulator(ring));

        a.swap(&mut b);
        assert_eq!(a.kinds().count(), 2);
        assert_eq!(b.kinds().count(), 1);

        // `b` now carries zero drive
        let input = sine(440.0, 0.5, 1024);
        assert_eq!(run_chain(&mut b, &input), input);
    }

    #[test]
    fn test_update_keeps_installed_effect() {
        let ctx = context();
        let mut chain = EffectChain::new();
        assert!(chain.update(distortion(&ctx, 1.0)).is_none());

        let leftover = chain.update(distortion(&ctx, 0.0)).unwrap();
        assert_eq!(leftover.kind(), EffectKind::Distortion);

        let input = sine(440.0, 0.5, 1024);
        assert_eq!(run_chain(&mut chain, &input), input);
    }

    #[test]
    fn test_update_replaces_too_short_delay() {
        let ctx = context();
        let mut chain = EffectChain::new();
        let chorus = DelayLine::new(&ctx, DelayParams::chorus(0.02, 0.5, 1.0)).unwrap();
        chain.install(EffectState::DelayLine(chorus));

        let echo = DelayLine::new(&ctx, DelayParams::echo(1.0, 0.4)).unwrap();
        let echo_reach = echo.reach();
        let leftover = chain.update(EffectState::DelayLine(echo)).unwrap();

        let Some(EffectState::DelayLine(installed)) = chain.get(EffectKind::DelayLine) else {
            panic!("delay line missing");
        };
        assert_eq!(installed.reach(), echo_reach);
        assert_eq!(installed.handle().settings().params.mode, DelayMode::Echo);
        let EffectState::DelayLine(replaced) = leftover else {
            panic!("wrong kind left over");
        };
        assert_eq!(replaced.handle().settings().params.mode, DelayMode::Chorus);
    }

    #[test]
    fn test_mismatched_layout_rejected() {
        let mut chain = full_chain();
        let mut scratch = ScratchBuffers::new(FRAMES, 0).unwrap();
        let mut dst = vec![0.0; HISTORY + FRAMES];
        assert!(chain.apply(&mut dst, &mut scratch, Block::new(0, HISTORY, FRAMES)).is_err());
    }
}
