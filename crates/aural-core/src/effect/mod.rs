//! Effect state objects
//!
//! Every effect owns two kinds of state:
//!
//! - **Parameters** (the `Settings` snapshot): user parameters plus the
//!   coefficients derived from them. Written by the control thread, read by
//!   the audio thread. Exchanged through a [`ParamExchange`] so a block is
//!   always rendered against one complete snapshot.
//! - **History**: filter memory, delay lines, oscillator phases. Owned by
//!   the audio thread and never touched by parameter updates.
//!
//! Processing is stateless apart from that history, so an effect can be
//! driven by any worker as long as a single track is never processed by
//! two workers at once.

mod bitcrusher;
mod chain;
mod convolution;
mod delay;
mod distortion;
mod filter;
mod occlusion;
mod reverb;
mod ring_modulator;
mod wave_folder;

pub use bitcrusher::{BitCrusher, BitCrusherParams};
pub use chain::EffectChain;
pub use convolution::{Convolution, ConvolutionParams};
pub use delay::{DelayLine, DelayMode, DelayParams};
pub use distortion::{Distortion, DistortionParams};
pub use filter::{
    Biquad, FilterCoefficients, FilterDesign, FilterKind, FilterParams, FilterState,
    FrequencyFilter, MAX_SECTIONS,
};
pub use occlusion::{Direction, Occlusion, OcclusionEffect, OcclusionParams};
pub use reverb::{Reverb, ReverbParams};
pub use ring_modulator::{RingModulator, RingModulatorParams};
pub use wave_folder::{WaveFolder, WaveFolderParams};

use crate::engine::gc::gc_handle;
use crate::error::{self, DspError, DspResult};
use crate::types::{Sample, DEFAULT_PERIOD_FRAMES, DEFAULT_SAMPLE_RATE, MAX_TRACKS};
use basedrop::{Shared, SharedCell};
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Identifies an effect family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectKind {
    FrequencyFilter,
    DelayLine,
    Reverb,
    Convolution,
    Distortion,
    RingModulator,
    WaveFolder,
    BitCrusher,
    Occlusion,
}

impl EffectKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::FrequencyFilter => "Frequency Filter",
            Self::DelayLine => "Delay Line",
            Self::Reverb => "Reverb",
            Self::Convolution => "Convolution",
            Self::Distortion => "Distortion",
            Self::RingModulator => "Ring Modulator",
            Self::WaveFolder => "Wave Folder",
            Self::BitCrusher => "Bit Crusher",
            Self::Occlusion => "Occlusion",
        }
    }
}

impl std::fmt::Display for EffectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Stream properties an effect derives its coefficients against
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DspContext {
    pub sample_rate: f32,
    pub period_frames: usize,
    pub tracks: usize,
}

impl DspContext {
    pub fn new(sample_rate: f32, period_frames: usize, tracks: usize) -> DspResult<Self> {
        if !(sample_rate > 0.0) {
            return Err(DspError::InvalidParameter {
                name: "sample_rate",
                value: sample_rate,
            });
        }
        if period_frames == 0 {
            return Err(DspError::InvalidParameter {
                name: "period_frames",
                value: 0.0,
            });
        }
        if tracks == 0 || tracks > MAX_TRACKS {
            return Err(DspError::InvalidTrack {
                track: tracks,
                tracks: MAX_TRACKS,
            });
        }
        Ok(Self {
            sample_rate,
            period_frames,
            tracks,
        })
    }

    /// Convert a duration in seconds to a (fractional) sample count
    #[inline]
    pub fn samples(&self, seconds: f32) -> f32 {
        seconds * self.sample_rate
    }
}

impl Default for DspContext {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            period_frames: DEFAULT_PERIOD_FRAMES,
            tracks: 2,
        }
    }
}

/// One block of one track
///
/// Track slices handed to effects include the history reservoir:
/// `start` is the index of the first live frame, so
/// `slice[start - ds..start]` holds the `ds` frames a delay-family effect
/// copied in front of the block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub track: usize,
    pub start: usize,
    pub frames: usize,
    pub ds: usize,
}

impl Block {
    pub fn new(track: usize, start: usize, frames: usize) -> Self {
        Self {
            track,
            start,
            frames,
            ds: 0,
        }
    }

    /// Live frame range inside a reservoir-prefixed slice
    #[inline]
    pub fn range(&self) -> Range<usize> {
        self.start..self.start + self.frames
    }

    pub fn with_ds(self, ds: usize) -> Self {
        Self { ds, ..self }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Parameter exchange
// ═══════════════════════════════════════════════════════════════════════════

/// Lock-free single-slot parameter exchange
///
/// The control thread publishes a complete settings snapshot; the audio
/// thread loads it once per block. Replaced snapshots are reclaimed by the
/// basedrop collector, never on the audio thread.
pub struct ParamExchange<T: Send + Sync + 'static> {
    cell: SharedCell<T>,
    version: AtomicU64,
    enabled: AtomicBool,
}

impl<T: Send + Sync + 'static> ParamExchange<T> {
    pub fn new(value: T) -> Self {
        Self {
            cell: SharedCell::new(Shared::new(&gc_handle(), value)),
            version: AtomicU64::new(0),
            enabled: AtomicBool::new(true),
        }
    }

    /// Replace the snapshot
    pub fn publish(&self, value: T) {
        self.publish_shared(Shared::new(&gc_handle(), value));
    }

    pub fn publish_shared(&self, value: Shared<T>) {
        self.cell.set(value);
        self.version.fetch_add(1, Ordering::Release);
    }

    /// Current snapshot; cheap (a reference count increment)
    pub fn load(&self) -> Shared<T> {
        self.cell.get()
    }

    /// Increments on every publish
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Effect trait
// ═══════════════════════════════════════════════════════════════════════════

/// Common interface of all effect state objects
pub trait Effect: Send {
    /// User-facing parameters
    type Params: Clone + Send + 'static;
    /// Parameters plus everything derived from them
    type Settings: Send + Sync + 'static;

    const KIND: EffectKind;

    /// Validate parameters and derive coefficients (control thread)
    fn derive(params: &Self::Params, ctx: &DspContext) -> DspResult<Self::Settings>;

    fn context(&self) -> &DspContext;

    fn exchange(&self) -> &Arc<ParamExchange<Self::Settings>>;

    /// Render one block of one track from `input` into `output`
    ///
    /// Both slices include the history reservoir; see [`Block`].
    fn process(&mut self, output: &mut [Sample], input: &[Sample], block: Block);

    /// Clear all history (filter memory, delay lines, phases)
    fn reset(&mut self);

    /// History the settings read back, in samples
    fn required_history(_settings: &Self::Settings) -> usize {
        0
    }

    /// History this instance allocated, in samples
    fn history_capacity(&self) -> usize {
        usize::MAX
    }

    fn kind(&self) -> EffectKind {
        Self::KIND
    }

    fn is_enabled(&self) -> bool {
        self.exchange().is_enabled()
    }

    fn set_enabled(&self, enabled: bool) {
        self.exchange().set_enabled(enabled);
    }

    /// Apply new parameters
    ///
    /// Invalid parameters, or parameters needing more history than this
    /// instance owns, disable the effect and set the last-error code.
    fn configure(&mut self, params: Self::Params) -> DspResult<()>
    where
        Self: Sized,
    {
        publish_checked::<Self>(self.exchange(), self.context(), self.history_capacity(), &params)
    }

    /// Exchange parameter snapshots with another instance of the same kind
    ///
    /// History stays with each instance. Returns false, leaving both
    /// untouched, when either snapshot needs more history than the
    /// instance it would move to.
    fn swap(&mut self, other: &mut Self) -> bool
    where
        Self: Sized,
    {
        let mine = self.exchange().load();
        let theirs = other.exchange().load();
        if Self::required_history(&theirs) > self.history_capacity()
            || Self::required_history(&mine) > other.history_capacity()
        {
            return false;
        }
        let (mine_on, theirs_on) = (self.is_enabled(), other.is_enabled());
        self.exchange().publish_shared(theirs);
        other.exchange().publish_shared(mine);
        self.set_enabled(theirs_on);
        other.set_enabled(mine_on);
        true
    }

    /// Control-side handle for updating parameters from another thread
    fn handle(&self) -> EffectHandle<Self>
    where
        Self: Sized,
    {
        EffectHandle {
            exchange: Arc::clone(self.exchange()),
            ctx: *self.context(),
            capacity: self.history_capacity(),
            _effect: PhantomData,
        }
    }
}

/// Derive settings, check them against the instance's history and publish
fn publish_checked<E: Effect>(
    exchange: &ParamExchange<E::Settings>,
    ctx: &DspContext,
    capacity: usize,
    params: &E::Params,
) -> DspResult<()> {
    let checked = E::derive(params, ctx).and_then(|settings| {
        let needed = E::required_history(&settings);
        if needed > capacity {
            Err(DspError::HistoryCapacity { needed, capacity })
        } else {
            Ok(settings)
        }
    });
    match checked {
        Ok(settings) => {
            exchange.publish(settings);
            exchange.set_enabled(true);
            Ok(())
        }
        Err(e) => {
            exchange.set_enabled(false);
            Err(error::record(e))
        }
    }
}

/// Control-thread access to a live effect's parameters
pub struct EffectHandle<E: Effect> {
    exchange: Arc<ParamExchange<E::Settings>>,
    ctx: DspContext,
    /// History the effect allocated; fixed for its lifetime
    capacity: usize,
    _effect: PhantomData<fn() -> E>,
}

impl<E: Effect> Clone for EffectHandle<E> {
    fn clone(&self) -> Self {
        Self {
            exchange: Arc::clone(&self.exchange),
            ctx: self.ctx,
            capacity: self.capacity,
            _effect: PhantomData,
        }
    }
}

impl<E: Effect> EffectHandle<E> {
    /// Derive and publish new parameters; the audio thread picks them up
    /// at its next block
    ///
    /// Parameters that need more history than the effect allocated are
    /// rejected; such a change needs a new effect.
    pub fn configure(&self, params: &E::Params) -> DspResult<()> {
        publish_checked::<E>(&self.exchange, &self.ctx, self.capacity, params)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.exchange.set_enabled(enabled);
    }

    pub fn settings(&self) -> Shared<E::Settings> {
        self.exchange.load()
    }
}

/// Settings snapshot cached on the audio side, reloaded when the control
/// thread publishes
pub(crate) struct Cached<T: Send + Sync + 'static> {
    current: Shared<T>,
    version: u64,
}

impl<T: Send + Sync + 'static> Cached<T> {
    pub(crate) fn new(exchange: &ParamExchange<T>) -> Self {
        Self {
            version: exchange.version(),
            current: exchange.load(),
        }
    }

    /// Refresh from the exchange; returns true when a new snapshot arrived
    pub(crate) fn refresh(&mut self, exchange: &ParamExchange<T>) -> bool {
        let version = exchange.version();
        if version == self.version {
            return false;
        }
        self.version = version;
        self.current = exchange.load();
        true
    }

    /// Snapshot for this block
    pub(crate) fn get(&self) -> Shared<T> {
        self.current.clone()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Tagged effect state
// ═══════════════════════════════════════════════════════════════════════════

/// Any effect, for installing into and removing from a chain
pub enum EffectState {
    FrequencyFilter(FrequencyFilter),
    DelayLine(DelayLine),
    Reverb(Reverb),
    Convolution(Convolution),
    Distortion(Distortion),
    RingModulator(RingModulator),
    WaveFolder(WaveFolder),
    BitCrusher(BitCrusher),
    Occlusion(OcclusionEffect),
}

impl EffectState {
    pub fn kind(&self) -> EffectKind {
        match self {
            Self::FrequencyFilter(_) => EffectKind::FrequencyFilter,
            Self::DelayLine(_) => EffectKind::DelayLine,
            Self::Reverb(_) => EffectKind::Reverb,
            Self::Convolution(_) => EffectKind::Convolution,
            Self::Distortion(_) => EffectKind::Distortion,
            Self::RingModulator(_) => EffectKind::RingModulator,
            Self::WaveFolder(_) => EffectKind::WaveFolder,
            Self::BitCrusher(_) => EffectKind::BitCrusher,
            Self::Occlusion(_) => EffectKind::Occlusion,
        }
    }

    pub fn is_enabled(&self) -> bool {
        match self {
            Self::FrequencyFilter(e) => e.is_enabled(),
            Self::DelayLine(e) => e.is_enabled(),
            Self::Reverb(e) => e.is_enabled(),
            Self::Convolution(e) => e.is_enabled(),
            Self::Distortion(e) => e.is_enabled(),
            Self::RingModulator(e) => e.is_enabled(),
            Self::WaveFolder(e) => e.is_enabled(),
            Self::BitCrusher(e) => e.is_enabled(),
            Self::Occlusion(e) => e.is_enabled(),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        match self {
            Self::FrequencyFilter(e) => e.set_enabled(enabled),
            Self::DelayLine(e) => e.set_enabled(enabled),
            Self::Reverb(e) => e.set_enabled(enabled),
            Self::Convolution(e) => e.set_enabled(enabled),
            Self::Distortion(e) => e.set_enabled(enabled),
            Self::RingModulator(e) => e.set_enabled(enabled),
            Self::WaveFolder(e) => e.set_enabled(enabled),
            Self::BitCrusher(e) => e.set_enabled(enabled),
            Self::Occlusion(e) => e.set_enabled(enabled),
        }
    }

    /// Exchange parameters with an effect of the same kind
    ///
    /// Returns false, leaving both untouched, when the kinds differ or the
    /// parameters don't fit the other instance's history.
    pub fn swap_params(&mut self, other: &mut EffectState) -> bool {
        match (self, other) {
            (Self::FrequencyFilter(a), Self::FrequencyFilter(b)) => a.swap(b),
            (Self::DelayLine(a), Self::DelayLine(b)) => a.swap(b),
            (Self::Reverb(a), Self::Reverb(b)) => a.swap(b),
            (Self::Convolution(a), Self::Convolution(b)) => a.swap(b),
            (Self::Distortion(a), Self::Distortion(b)) => a.swap(b),
            (Self::RingModulator(a), Self::RingModulator(b)) => a.swap(b),
            (Self::WaveFolder(a), Self::WaveFolder(b)) => a.swap(b),
            (Self::BitCrusher(a), Self::BitCrusher(b)) => a.swap(b),
            (Self::Occlusion(a), Self::Occlusion(b)) => a.swap(b),
            _ => false,
        }
    }

    pub fn reset(&mut self) {
        match self {
            Self::FrequencyFilter(e) => e.reset(),
            Self::DelayLine(e) => e.reset(),
            Self::Reverb(e) => e.reset(),
            Self::Convolution(e) => e.reset(),
            Self::Distortion(e) => e.reset(),
            Self::RingModulator(e) => e.reset(),
            Self::WaveFolder(e) => e.reset(),
            Self::BitCrusher(e) => e.reset(),
            Self::Occlusion(e) => e.reset(),
        }
    }

    pub fn process(&mut self, output: &mut [Sample], input: &[Sample], block: Block) {
        match self {
            Self::FrequencyFilter(e) => e.process(output, input, block),
            Self::DelayLine(e) => e.process(output, input, block),
            Self::Reverb(e) => e.process(output, input, block),
            Self::Convolution(e) => e.process(output, input, block),
            Self::Distortion(e) => e.process(output, input, block),
            Self::RingModulator(e) => e.process(output, input, block),
            Self::WaveFolder(e) => e.process(output, input, block),
            Self::BitCrusher(e) => e.process(output, input, block),
            Self::Occlusion(e) => e.process(output, input, block),
        }
    }
}

impl std::fmt::Debug for EffectState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("EffectState").field(&self.kind()).finish()
    }
}

/// Static effect description, as stored in configuration files
///
/// A preset has the same shape as a live parameter update.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EffectPreset {
    FrequencyFilter(FilterParams),
    DelayLine(DelayParams),
    Reverb(ReverbParams),
    Convolution(ConvolutionParams),
    Distortion(DistortionParams),
    RingModulator(RingModulatorParams),
    WaveFolder(WaveFolderParams),
    BitCrusher(BitCrusherParams),
    Occlusion(OcclusionParams),
}

impl EffectPreset {
    pub fn kind(&self) -> EffectKind {
        match self {
            Self::FrequencyFilter(_) => EffectKind::FrequencyFilter,
            Self::DelayLine(_) => EffectKind::DelayLine,
            Self::Reverb(_) => EffectKind::Reverb,
            Self::Convolution(_) => EffectKind::Convolution,
            Self::Distortion(_) => EffectKind::Distortion,
            Self::RingModulator(_) => EffectKind::RingModulator,
            Self::WaveFolder(_) => EffectKind::WaveFolder,
            Self::BitCrusher(_) => EffectKind::BitCrusher,
            Self::Occlusion(_) => EffectKind::Occlusion,
        }
    }

    /// Longest offset the effect reads back, in seconds
    pub fn delay_seconds(&self) -> Option<f32> {
        match self {
            Self::DelayLine(p) => Some(p.delay.min(p.mode.range().1)),
            _ => None,
        }
    }

    /// Create the effect, allocating its history
    pub fn build(&self, ctx: &DspContext) -> DspResult<EffectState> {
        let effect = match self {
            Self::FrequencyFilter(p) => {
                EffectState::FrequencyFilter(FrequencyFilter::new(ctx, p.clone())?)
            }
            Self::DelayLine(p) => EffectState::DelayLine(DelayLine::new(ctx, p.clone())?),
            Self::Reverb(p) => EffectState::Reverb(Reverb::new(ctx, p.clone())?),
            Self::Convolution(p) => EffectState::Convolution(Convolution::new(ctx, p.clone())?),
            Self::Distortion(p) => EffectState::Distortion(Distortion::new(ctx, p.clone())?),
            Self::RingModulator(p) => {
                EffectState::RingModulator(RingModulator::new(ctx, p.clone())?)
            }
            Self::WaveFolder(p) => EffectState::WaveFolder(WaveFolder::new(ctx, p.clone())?),
            Self::BitCrusher(p) => EffectState::BitCrusher(BitCrusher::new(ctx, p.clone())?),
            Self::Occlusion(p) => EffectState::Occlusion(OcclusionEffect::new(ctx, p.clone())?),
        };
        Ok(effect)
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;

    pub const RATE: f32 = 48000.0;

    pub fn context() -> DspContext {
        DspContext::new(RATE, 512, 2).unwrap()
    }

    pub fn sine(freq: f32, amplitude: f32, frames: usize) -> Vec<Sample> {
        (0..frames)
            .map(|i| amplitude * (2.0 * std::f32::consts::PI * freq * i as f32 / RATE).sin())
            .collect()
    }

    /// Run an effect over `signal` block by block on track 0
    pub fn run_blocks<E: Effect>(effect: &mut E, signal: &[Sample], frames: usize) -> Vec<Sample> {
        let mut out = Vec::with_capacity(signal.len());
        let mut output = vec![0.0; frames];
        for chunk in signal.chunks(frames) {
            let block = Block::new(0, 0, chunk.len());
            effect.process(&mut output[..chunk.len()], chunk, block);
            out.extend_from_slice(&output[..chunk.len()]);
        }
        out
    }

    pub fn rms(data: &[Sample]) -> f32 {
        crate::buffer::rms(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_versions() {
        let exchange = ParamExchange::new(1_u32);
        let mut cached = Cached::new(&exchange);
        assert!(!cached.refresh(&exchange));
        exchange.publish(2);
        assert!(cached.refresh(&exchange));
        assert_eq!(*cached.get(), 2);
        assert!(!cached.refresh(&exchange));
    }

    #[test]
    fn test_context_validation() {
        assert!(DspContext::new(0.0, 512, 2).is_err());
        assert!(DspContext::new(48000.0, 0, 2).is_err());
        assert!(DspContext::new(48000.0, 512, MAX_TRACKS + 1).is_err());
        assert!(DspContext::new(48000.0, 512, 2).is_ok());
    }

    #[test]
    fn test_block_range() {
        let block = Block::new(1, 64, 128).with_ds(32);
        assert_eq!(block.range(), 64..192);
        assert_eq!(block.ds, 32);
    }

    #[test]
    fn test_preset_yaml() {
        let yaml = "type: distortion\ndrive: 0.5\n";
        let preset: EffectPreset = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(preset.kind(), EffectKind::Distortion);
        let effect = preset.build(&test_util::context()).unwrap();
        assert_eq!(effect.kind(), EffectKind::Distortion);
    }
}
