//! Output backend interface
//!
//! A backend receives one fully mixed [`SampleBuffer`] per block. Setup is
//! a negotiation: the renderer requests a layout and adapts to whatever the
//! backend actually achieved (devices only approximately satisfy buffer
//! sizes, formats and channel counts).
//!
//! Device I/O, enumeration and xrun recovery belong to the implementations.
//! They surface to the renderer only as a dropped block or as
//! [`BackendState::Unavailable`].

use serde::{Deserialize, Serialize};

use crate::buffer::SampleBuffer;
use crate::error::{BackendError, BackendResult};
use crate::types::{SampleFormat, DEFAULT_PERIOD_FRAMES, DEFAULT_SAMPLE_RATE};

/// Stream layout requested from, and reported by, a backend
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub sample_rate: f32,
    pub tracks: usize,
    pub format: SampleFormat,
    /// Block length in frames
    pub period_frames: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            tracks: 2,
            format: SampleFormat::F32,
            period_frames: DEFAULT_PERIOD_FRAMES,
        }
    }
}

/// Availability state machine of a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendState {
    Available,
    Paused,
    #[default]
    Unavailable,
}

/// Platform audio output
pub trait Backend: Send {
    /// Human-readable name
    fn name(&self) -> &str;

    /// Open the device and negotiate a layout
    ///
    /// Returns the achieved configuration, which may differ from the
    /// requested one.
    fn setup(&mut self, requested: &BackendConfig) -> BackendResult<BackendConfig>;

    /// Deliver one mixed block
    fn play(&mut self, block: &SampleBuffer) -> BackendResult<()>;

    fn pause(&mut self) -> BackendResult<()>;

    fn resume(&mut self) -> BackendResult<()>;

    fn state(&self) -> BackendState;
}

/// Backend that accepts and discards blocks
///
/// Blocks are still encoded to the negotiated format so the full output
/// path runs. Optional limits let tests exercise renegotiation.
#[derive(Debug, Default)]
pub struct NullBackend {
    config: BackendConfig,
    state: BackendState,
    /// Largest channel count this backend claims to support
    max_tracks: Option<usize>,
    /// Format it falls back to, if any
    forced_format: Option<SampleFormat>,
    encoded: Vec<u8>,
    blocks: u64,
}

impl NullBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report at most `tracks` channels from `setup`
    pub fn with_max_tracks(mut self, tracks: usize) -> Self {
        self.max_tracks = Some(tracks.max(1));
        self
    }

    /// Report `format` from `setup` regardless of the request
    pub fn with_format(mut self, format: SampleFormat) -> Self {
        self.forced_format = Some(format);
        self
    }

    /// Blocks accepted so far
    pub fn blocks(&self) -> u64 {
        self.blocks
    }

    /// Bytes of the last accepted block
    pub fn last_block(&self) -> &[u8] {
        &self.encoded
    }
}

impl Backend for NullBackend {
    fn name(&self) -> &str {
        "null"
    }

    fn setup(&mut self, requested: &BackendConfig) -> BackendResult<BackendConfig> {
        if !(requested.sample_rate > 0.0) || requested.tracks == 0 || requested.period_frames == 0 {
            return Err(BackendError::Unsupported(format!("{:?}", requested)));
        }
        let mut achieved = *requested;
        if let Some(max) = self.max_tracks {
            achieved.tracks = achieved.tracks.min(max);
        }
        if let Some(format) = self.forced_format {
            achieved.format = format;
        }
        self.encoded = Vec::with_capacity(
            achieved.tracks * achieved.period_frames * achieved.format.bytes_per_sample(),
        );
        self.config = achieved;
        self.state = BackendState::Available;
        log::info!(
            "Null backend opened: {} Hz, {} tracks, {:?}, {} frames",
            achieved.sample_rate,
            achieved.tracks,
            achieved.format,
            achieved.period_frames
        );
        Ok(achieved)
    }

    fn play(&mut self, block: &SampleBuffer) -> BackendResult<()> {
        match self.state {
            BackendState::Available => {}
            BackendState::Paused => return Ok(()),
            BackendState::Unavailable => {
                return Err(BackendError::Unavailable(self.name().to_string()));
            }
        }
        block.encode_interleaved(self.config.format, &mut self.encoded);
        self.blocks += 1;
        Ok(())
    }

    fn pause(&mut self) -> BackendResult<()> {
        if self.state == BackendState::Unavailable {
            return Err(BackendError::Unavailable(self.name().to_string()));
        }
        self.state = BackendState::Paused;
        Ok(())
    }

    fn resume(&mut self) -> BackendResult<()> {
        if self.state == BackendState::Unavailable {
            return Err(BackendError::Unavailable(self.name().to_string()));
        }
        self.state = BackendState::Available;
        Ok(())
    }

    fn state(&self) -> BackendState {
        self.state
    }
}
