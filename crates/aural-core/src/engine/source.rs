//! Sources - the emitters the renderer mixes
//!
//! A source pairs a (usually shared) sample buffer with the scalars and
//! property block the mixer needs: pitch, gain, playback state and the
//! source's own effect chain. Its playback position lives in the buffer
//! and only moves between blocks, when the renderer calls [`Source::advance`].

use std::fmt;

use crate::buffer::{BufferState, InterpolationMethod, SampleBuffer, ScratchBuffers, StateCommand};
use crate::effect::{Block, DspContext, EffectChain, EffectPreset};
use crate::error::{DspError, DspResult};
use crate::types::Sample;

/// Pitch is clamped to this range (four octaves either way)
pub const MIN_PITCH: f32 = 1.0 / 16.0;
pub const MAX_PITCH: f32 = 16.0;

/// Identifier chosen by the control side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(pub u32);

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "source#{}", self.0)
    }
}

/// Playback state of a source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceState {
    #[default]
    Stopped,
    Playing,
    Paused,
}

/// An audio-producing entity with its property block
pub struct Source {
    id: SourceId,
    buffer: SampleBuffer,
    pitch: f32,
    gain: f32,
    state: SourceState,
    chain: EffectChain,
    interpolation: InterpolationMethod,
    /// Mixer sample rate the source renders at
    output_rate: f32,
}

impl Source {
    /// Create a stopped source over `buffer`
    ///
    /// The buffer may run at any sample rate; it is resampled to the
    /// mixer rate while rendering.
    pub fn new(id: SourceId, buffer: SampleBuffer, ctx: &DspContext) -> Self {
        Self {
            id,
            buffer,
            pitch: 1.0,
            gain: 1.0,
            state: SourceState::Stopped,
            chain: EffectChain::new(),
            interpolation: InterpolationMethod::default(),
            output_rate: ctx.sample_rate,
        }
    }

    /// Attach effects built from presets
    pub fn with_presets(mut self, presets: &[EffectPreset], ctx: &DspContext) -> Self {
        self.chain = EffectChain::from_presets(presets, ctx);
        self
    }

    pub fn with_interpolation(mut self, interpolation: InterpolationMethod) -> Self {
        self.interpolation = interpolation;
        self
    }

    #[inline]
    pub fn id(&self) -> SourceId {
        self.id
    }

    pub fn buffer(&self) -> &SampleBuffer {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut SampleBuffer {
        &mut self.buffer
    }

    pub fn chain(&self) -> &EffectChain {
        &self.chain
    }

    pub fn chain_mut(&mut self) -> &mut EffectChain {
        &mut self.chain
    }

    #[inline]
    pub fn state(&self) -> SourceState {
        self.state
    }

    #[inline]
    pub fn is_playing(&self) -> bool {
        self.state == SourceState::Playing
    }

    pub fn pitch(&self) -> f32 {
        self.pitch
    }

    pub fn set_pitch(&mut self, pitch: f32) {
        if pitch.is_finite() {
            self.pitch = pitch.clamp(MIN_PITCH, MAX_PITCH);
        }
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    pub fn set_gain(&mut self, gain: f32) {
        if gain.is_finite() {
            self.gain = gain.max(0.0);
        }
    }

    // ─────────────────────────────────────────────────────────────
    // State transitions (applied between blocks)
    // ─────────────────────────────────────────────────────────────

    pub fn play(&mut self) {
        if self.buffer.state() != BufferState::Streaming {
            self.buffer.set_state(StateCommand::Started);
        }
        self.state = SourceState::Playing;
    }

    pub fn pause(&mut self) {
        if self.state == SourceState::Playing {
            self.state = SourceState::Paused;
        }
    }

    /// Stop, rewind and clear effect history
    pub fn stop(&mut self) {
        self.state = SourceState::Stopped;
        self.buffer.set_state(StateCommand::Rewound);
        self.chain.reset();
    }

    /// Source frames consumed per output frame
    #[inline]
    pub fn step(&self) -> f64 {
        self.pitch as f64 * self.buffer.sample_rate() as f64 / self.output_rate as f64
    }

    /// Move the playback position past `frames` output frames
    ///
    /// A source that runs out of data stops itself. Returns whether it is
    /// still playing.
    pub fn advance(&mut self, frames: usize) -> bool {
        if self.state != SourceState::Playing {
            return false;
        }
        if !self.buffer.advance(frames as f64 * self.step()) {
            log::debug!("{} reached the end of its buffer", self.id);
            self.stop();
            return false;
        }
        true
    }

    /// Render one output track of the next block into `mix`
    ///
    /// `mix` is a reservoir-prefixed track slice laid out like `scratch`;
    /// the block lands at `mix[scratch.history()..][..frames]` with gain
    /// not yet applied. The source's chain runs with this track's history.
    pub fn render(
        &mut self,
        track: usize,
        frames: usize,
        mix: &mut [Sample],
        scratch: &mut ScratchBuffers,
    ) -> DspResult<()> {
        let start = scratch.history();
        if mix.len() < start + frames {
            return Err(DspError::InvalidParameter {
                name: "frames",
                value: frames as f32,
            });
        }
        let source_track = track % self.buffer.tracks();
        let step = self.step();
        let position = self.buffer.position();

        for (i, out) in mix[start..start + frames].iter_mut().enumerate() {
            *out = self
                .buffer
                .sample_at(source_track, position + i as f64 * step, self.interpolation);
        }

        self.chain.apply(mix, scratch, Block::new(track, start, frames))?;
        Ok(())
    }
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("pitch", &self.pitch)
            .field("gain", &self.gain)
            .field("chain", &self.chain)
            .finish()
    }
}
