//! Sample buffers - planar track storage with a history reservoir
//!
//! A [`SampleBuffer`] owns one sample array per track. Every array starts
//! with a fixed-size *history reservoir* (negative offsets relative to the
//! visible block) followed by `capacity` samples of visible data:
//!
//! ```text
//!  track storage: [ history (reservoir) | visible frames ... | spare capacity ]
//!                  ^ -history            ^ 0                  ^ frames
//! ```
//!
//! Stateful effects write the tail of the previous block into the reservoir
//! (see [`DelayLine::prepare`](crate::effect::DelayLine::prepare)) so reads
//! behind the block start come from the same slice as the block itself.
//!
//! # Ownership
//!
//! Storage is reference counted. [`SampleBuffer::reference`] (and
//! `duplicate(false, _)`) shares storage, `duplicate(true, _)` produces an
//! independent copy. Writing through any accessor detaches shared storage
//! first (copy-on-write), so two owners never see a mutable alias.

mod history;
mod resample;
mod scratch;

pub use history::DelayHistory;
pub use resample::{read_fractional, InterpolationMethod};
pub use scratch::{Live, ScratchBuffers};

use std::sync::Arc;

use crate::error::{DspError, DspResult};
use crate::types::{Sample, SampleFormat, MAX_TRACKS};

/// Playback state of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferState {
    #[default]
    Stopped,
    Playing,
    /// Filled incrementally by a stream; never reports end-of-data
    Streaming,
}

/// State transitions accepted by [`SampleBuffer::set_state`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateCommand {
    Started,
    Stopped,
    Streaming,
    /// Rewind the playback position without changing the state
    Rewound,
}

/// Allocate a zeroed vector, reporting failure instead of aborting
pub(crate) fn try_zeroed(samples: usize) -> DspResult<Vec<Sample>> {
    let mut data = Vec::new();
    data.try_reserve_exact(samples)
        .map_err(|_| DspError::Allocation { samples })?;
    data.resize(samples, 0.0);
    Ok(data)
}

/// Shared track storage
#[derive(Debug, Clone)]
struct Storage {
    tracks: Vec<Vec<Sample>>,
    history: usize,
    capacity: usize,
}

impl Storage {
    fn new(tracks: usize, capacity: usize, history: usize) -> DspResult<Self> {
        let tracks = (0..tracks)
            .map(|_| try_zeroed(history + capacity))
            .collect::<DspResult<Vec<_>>>()?;
        Ok(Self {
            tracks,
            history,
            capacity,
        })
    }
}

/// Planar multi-track sample buffer with a history reservoir
#[derive(Debug)]
pub struct SampleBuffer {
    storage: Arc<Storage>,
    /// Visible length in frames (<= capacity)
    frames: usize,
    sample_rate: f32,
    format: SampleFormat,
    state: BufferState,
    /// Playback position in (fractional) frames
    position: f64,
    looping: bool,
    loop_start: usize,
    loop_end: usize,
}

impl SampleBuffer {
    /// Create a silent buffer
    ///
    /// The reservoir is sized from `history_seconds` and fixed for the
    /// lifetime of the buffer.
    pub fn new(
        tracks: usize,
        frames: usize,
        sample_rate: f32,
        history_seconds: f32,
    ) -> DspResult<Self> {
        if tracks == 0 || tracks > MAX_TRACKS {
            return Err(DspError::InvalidParameter {
                name: "tracks",
                value: tracks as f32,
            });
        }
        if !(sample_rate > 0.0) {
            return Err(DspError::InvalidParameter {
                name: "sample_rate",
                value: sample_rate,
            });
        }
        let history = (history_seconds.max(0.0) * sample_rate).round() as usize;
        let storage = Storage::new(tracks, frames, history)?;
        Ok(Self {
            storage: Arc::new(storage),
            frames,
            sample_rate,
            format: SampleFormat::F32,
            state: BufferState::Stopped,
            position: 0.0,
            looping: false,
            loop_start: 0,
            loop_end: frames,
        })
    }

    /// Create a buffer from planar track data, without a reservoir
    pub fn from_tracks(tracks: &[&[Sample]], sample_rate: f32) -> DspResult<Self> {
        let frames = tracks.iter().map(|t| t.len()).max().unwrap_or(0);
        let mut buffer = Self::new(tracks.len(), frames, sample_rate, 0.0)?;
        for (t, data) in tracks.iter().enumerate() {
            buffer.fill_track(t, data)?;
        }
        Ok(buffer)
    }

    /// Number of tracks
    #[inline]
    pub fn tracks(&self) -> usize {
        self.storage.tracks.len()
    }

    /// Visible length in frames
    #[inline]
    pub fn frames(&self) -> usize {
        self.frames
    }

    /// Allocated length in frames (excluding the reservoir)
    #[inline]
    pub fn capacity(&self) -> usize {
        self.storage.capacity
    }

    /// Reservoir length in frames
    #[inline]
    pub fn history_frames(&self) -> usize {
        self.storage.history
    }

    #[inline]
    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    pub fn set_sample_rate(&mut self, sample_rate: f32) {
        if sample_rate > 0.0 {
            self.sample_rate = sample_rate;
        }
    }

    #[inline]
    pub fn format(&self) -> SampleFormat {
        self.format
    }

    /// Duration of the visible data in seconds
    pub fn duration(&self) -> f32 {
        self.frames as f32 / self.sample_rate
    }

    /// Number of owners sharing this buffer's storage
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.storage)
    }

    /// Whether storage is shared with another buffer
    pub fn is_shared(&self) -> bool {
        self.ref_count() > 1
    }

    /// Change the visible length
    ///
    /// Shrinking never releases storage so the buffer can grow back to its
    /// capacity without relocating. Growing past capacity reallocates.
    pub fn resize(&mut self, frames: usize) -> DspResult<()> {
        if frames > self.storage.capacity {
            let history = self.storage.history;
            let storage = Arc::make_mut(&mut self.storage);
            for track in storage.tracks.iter_mut() {
                let extra = history + frames - track.len();
                track
                    .try_reserve_exact(extra)
                    .map_err(|_| DspError::Allocation { samples: extra })?;
                track.resize(history + frames, 0.0);
            }
            storage.capacity = frames;
        }
        self.frames = frames;
        if self.loop_end > frames || !self.looping {
            self.loop_end = frames;
        }
        self.loop_start = self.loop_start.min(self.loop_end);
        Ok(())
    }

    /// Adapt to a format and track layout reported by a backend
    ///
    /// Dropped tracks are discarded, added tracks start silent.
    pub fn set_format(&mut self, format: SampleFormat, tracks: usize) -> DspResult<()> {
        if tracks == 0 || tracks > MAX_TRACKS {
            return Err(DspError::InvalidParameter {
                name: "tracks",
                value: tracks as f32,
            });
        }
        if tracks != self.tracks() {
            let len = self.storage.history + self.storage.capacity;
            let storage = Arc::make_mut(&mut self.storage);
            if tracks < storage.tracks.len() {
                storage.tracks.truncate(tracks);
            } else {
                while storage.tracks.len() < tracks {
                    storage.tracks.push(try_zeroed(len)?);
                }
            }
            log::debug!("Sample buffer adapted to {} tracks ({:?})", tracks, format);
        }
        self.format = format;
        Ok(())
    }

    /// Share this buffer's storage (reference increment)
    pub fn reference(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            frames: self.frames,
            sample_rate: self.sample_rate,
            format: self.format,
            state: self.state,
            position: self.position,
            looping: self.looping,
            loop_start: self.loop_start,
            loop_end: self.loop_end,
        }
    }

    /// Duplicate the buffer
    ///
    /// With `copy_samples == false` storage is shared. Otherwise the visible
    /// data is copied into fresh storage, and the reservoir too when
    /// `copy_history` is set (a loopback recorder needs both).
    pub fn duplicate(&self, copy_samples: bool, copy_history: bool) -> DspResult<Self> {
        if !copy_samples {
            return Ok(self.reference());
        }
        let history = self.storage.history;
        let capacity = self.storage.capacity;
        let mut storage = Storage::new(self.tracks(), capacity, history)?;
        for (dst, src) in storage.tracks.iter_mut().zip(self.storage.tracks.iter()) {
            let start = if copy_history { 0 } else { history };
            dst[start..history + self.frames].copy_from_slice(&src[start..history + self.frames]);
        }
        Ok(Self {
            storage: Arc::new(storage),
            ..self.reference()
        })
    }

    /// Zero the visible data and the reservoir
    pub fn clear(&mut self) {
        let storage = Arc::make_mut(&mut self.storage);
        for track in storage.tracks.iter_mut() {
            track.fill(0.0);
        }
    }

    /// Zero only the visible data, keeping the reservoir
    pub fn clear_frames(&mut self) {
        let history = self.storage.history;
        let frames = self.frames;
        let storage = Arc::make_mut(&mut self.storage);
        for track in storage.tracks.iter_mut() {
            track[history..history + frames].fill(0.0);
        }
    }

    #[inline]
    pub fn state(&self) -> BufferState {
        self.state
    }

    /// Apply a playback state transition
    pub fn set_state(&mut self, command: StateCommand) {
        match command {
            StateCommand::Started => self.state = BufferState::Playing,
            StateCommand::Stopped => self.state = BufferState::Stopped,
            StateCommand::Streaming => self.state = BufferState::Streaming,
            StateCommand::Rewound => self.position = 0.0,
        }
    }

    #[inline]
    pub fn is_playing(&self) -> bool {
        self.state != BufferState::Stopped
    }

    /// Visible samples of one track
    pub fn track(&self, track: usize) -> &[Sample] {
        let history = self.storage.history;
        &self.storage.tracks[track][history..history + self.frames]
    }

    /// Mutable visible samples of one track (detaches shared storage)
    pub fn track_mut(&mut self, track: usize) -> &mut [Sample] {
        let history = self.storage.history;
        let frames = self.frames;
        &mut Arc::make_mut(&mut self.storage).tracks[track][history..history + frames]
    }

    /// Reservoir followed by the visible samples of one track
    pub fn track_with_history(&self, track: usize) -> &[Sample] {
        let end = self.storage.history + self.frames;
        &self.storage.tracks[track][..end]
    }

    /// Mutable reservoir followed by the visible samples of one track
    pub fn track_with_history_mut(&mut self, track: usize) -> &mut [Sample] {
        let end = self.storage.history + self.frames;
        &mut Arc::make_mut(&mut self.storage).tracks[track][..end]
    }

    /// Copy planar data into one track, growing the buffer when needed
    pub fn fill_track(&mut self, track: usize, samples: &[Sample]) -> DspResult<()> {
        if track >= self.tracks() {
            return Err(DspError::InvalidTrack {
                track,
                tracks: self.tracks(),
            });
        }
        if samples.len() > self.frames {
            self.resize(samples.len())?;
        }
        self.track_mut(track)[..samples.len()].copy_from_slice(samples);
        Ok(())
    }

    /// De-interleave data into all tracks
    pub fn fill_interleaved(&mut self, interleaved: &[Sample]) -> DspResult<()> {
        let tracks = self.tracks();
        let frames = interleaved.len() / tracks;
        if frames > self.frames {
            self.resize(frames)?;
        }
        let history = self.storage.history;
        let storage = Arc::make_mut(&mut self.storage);
        for (t, track) in storage.tracks.iter_mut().enumerate() {
            for (dst, frame) in track[history..history + frames]
                .iter_mut()
                .zip(interleaved.chunks_exact(tracks))
            {
                *dst = frame[t];
            }
        }
        Ok(())
    }

    /// Interleave the visible data into `out`, encoded as `format`
    ///
    /// Samples are clamped to [-1, 1] before integer conversion.
    pub fn encode_interleaved(&self, format: SampleFormat, out: &mut Vec<u8>) {
        let tracks = self.tracks();
        let samples = self.frames * tracks;
        out.clear();
        out.reserve(samples * format.bytes_per_sample());

        let frame_iter = (0..self.frames)
            .flat_map(|i| (0..tracks).map(move |t| (i, t)))
            .map(|(i, t)| self.track(t)[i]);

        match format {
            SampleFormat::F32 => {
                let data: Vec<f32> = frame_iter.collect();
                out.extend_from_slice(bytemuck::cast_slice(&data));
            }
            SampleFormat::I32 => {
                let data: Vec<i32> = frame_iter
                    .map(|s| (s.clamp(-1.0, 1.0) as f64 * i32::MAX as f64) as i32)
                    .collect();
                out.extend_from_slice(bytemuck::cast_slice(&data));
            }
            SampleFormat::I24 => {
                let data: Vec<i32> = frame_iter
                    .map(|s| (s.clamp(-1.0, 1.0) * 8_388_607.0) as i32)
                    .collect();
                out.extend_from_slice(bytemuck::cast_slice(&data));
            }
            SampleFormat::I16 => {
                let data: Vec<i16> = frame_iter
                    .map(|s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
                    .collect();
                out.extend_from_slice(bytemuck::cast_slice(&data));
            }
            SampleFormat::U8 => {
                out.extend(frame_iter.map(|s| ((s.clamp(-1.0, 1.0) * 127.0) + 128.0) as u8));
            }
        }
    }

    /// Peak magnitude of the visible data of one track
    pub fn peak(&self, track: usize) -> f32 {
        self.track(track).iter().fold(0.0_f32, |m, s| m.max(s.abs()))
    }

    /// RMS level of the visible data of one track
    pub fn rms(&self, track: usize) -> f32 {
        rms(self.track(track))
    }

    /// Allocate a scratch pair matching this buffer's layout
    pub fn alloc_scratch(&self) -> DspResult<ScratchBuffers> {
        ScratchBuffers::new(self.storage.capacity, self.storage.history)
    }

    // ─────────────────────────────────────────────────────────────
    // Playback position & looping
    // ─────────────────────────────────────────────────────────────

    #[inline]
    pub fn position(&self) -> f64 {
        self.position
    }

    pub fn set_position(&mut self, position: f64) {
        self.position = position.clamp(0.0, self.frames as f64);
    }

    pub fn set_looping(&mut self, looping: bool) {
        self.looping = looping;
    }

    #[inline]
    pub fn is_looping(&self) -> bool {
        self.looping
    }

    /// Set loop points in frames; `end` is exclusive
    pub fn set_loop_points(&mut self, start: usize, end: usize) -> DspResult<()> {
        if start >= end || end > self.frames {
            return Err(DspError::InvalidParameter {
                name: "loop_end",
                value: end as f32,
            });
        }
        self.loop_start = start;
        self.loop_end = end;
        Ok(())
    }

    pub fn loop_points(&self) -> (usize, usize) {
        (self.loop_start, self.loop_end)
    }

    /// Map a (possibly past-the-end) frame index onto stored data
    #[inline]
    fn wrap_index(&self, index: i64) -> Option<usize> {
        if index < 0 {
            return None;
        }
        let mut index = index as usize;
        if self.looping && index >= self.loop_end {
            let span = self.loop_end - self.loop_start;
            if span == 0 {
                return None;
            }
            index = self.loop_start + (index - self.loop_start) % span;
        }
        (index < self.frames).then_some(index)
    }

    /// Read one track at a fractional frame position, honouring loop points
    pub fn sample_at(&self, track: usize, position: f64, method: InterpolationMethod) -> Sample {
        let data = self.track(track);
        let base = position.floor() as i64;
        let frac = (position - base as f64) as f32;
        let at = |i: i64| self.wrap_index(i).map(|i| data[i]).unwrap_or(0.0);
        match method {
            InterpolationMethod::Linear => {
                let a = at(base);
                if frac == 0.0 {
                    return a;
                }
                a + (at(base + 1) - a) * frac
            }
            InterpolationMethod::Cubic => {
                if frac == 0.0 {
                    return at(base);
                }
                resample::catmull_rom(at(base - 1), at(base), at(base + 1), at(base + 2), frac)
            }
        }
    }

    /// Advance the playback position
    ///
    /// Returns `false` once a non-looping, non-streaming buffer runs out of
    /// data; the position then rests at the end.
    pub fn advance(&mut self, frames: f64) -> bool {
        self.position += frames;
        if self.looping && self.loop_end > self.loop_start {
            let end = self.loop_end as f64;
            if self.position >= end {
                let span = (self.loop_end - self.loop_start) as f64;
                self.position =
                    self.loop_start as f64 + (self.position - self.loop_start as f64) % span;
            }
            return true;
        }
        if self.position >= self.frames as f64 {
            self.position = self.frames as f64;
            return self.state == BufferState::Streaming;
        }
        true
    }
}

/// RMS level of a slice
pub fn rms(samples: &[Sample]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum / samples.len() as f64).sqrt() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(len: usize) -> Vec<f32> {
        (0..len).map(|i| i as f32 / len as f32).collect()
    }

    #[test]
    fn test_create_sizes_reservoir() {
        let buffer = SampleBuffer::new(2, 256, 48000.0, 0.01).unwrap();
        assert_eq!(buffer.tracks(), 2);
        assert_eq!(buffer.frames(), 256);
        assert_eq!(buffer.history_frames(), 480);
        assert_eq!(buffer.track_with_history(0).len(), 736);
    }

    #[test]
    fn test_invalid_track_count() {
        assert!(SampleBuffer::new(0, 16, 48000.0, 0.0).is_err());
        assert!(SampleBuffer::new(MAX_TRACKS + 1, 16, 48000.0, 0.0).is_err());
    }

    #[test]
    fn test_shrink_keeps_capacity() {
        let mut buffer = SampleBuffer::new(1, 128, 48000.0, 0.0).unwrap();
        buffer.fill_track(0, &ramp(128)).unwrap();
        buffer.resize(32).unwrap();
        assert_eq!(buffer.frames(), 32);
        assert_eq!(buffer.capacity(), 128);

        // Growing back within capacity exposes the old data again
        buffer.resize(128).unwrap();
        assert_eq!(buffer.track(0)[100], 100.0 / 128.0);
    }

    #[test]
    fn test_grow_beyond_capacity() {
        let mut buffer = SampleBuffer::new(1, 16, 48000.0, 0.0).unwrap();
        buffer.fill_track(0, &[1.0; 16]).unwrap();
        buffer.resize(64).unwrap();
        assert_eq!(buffer.capacity(), 64);
        assert_eq!(buffer.track(0)[15], 1.0);
        assert_eq!(buffer.track(0)[16], 0.0);
    }

    #[test]
    fn test_reference_shares_until_write() {
        let mut a = SampleBuffer::new(1, 8, 48000.0, 0.0).unwrap();
        a.fill_track(0, &[0.5; 8]).unwrap();
        let mut b = a.reference();
        assert_eq!(a.ref_count(), 2);

        b.track_mut(0)[0] = 1.0;
        assert!(!a.is_shared());
        assert_eq!(a.track(0)[0], 0.5);
        assert_eq!(b.track(0)[0], 1.0);
    }

    #[test]
    fn test_duplicate_with_history() {
        let mut a = SampleBuffer::new(1, 4, 1000.0, 0.004).unwrap();
        a.track_with_history_mut(0).copy_from_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);

        let full = a.duplicate(true, true).unwrap();
        assert!(!full.is_shared());
        assert_eq!(full.track_with_history(0), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);

        let data_only = a.duplicate(true, false).unwrap();
        assert_eq!(data_only.track_with_history(0), &[0.0, 0.0, 0.0, 0.0, 5.0, 6.0, 7.0, 8.0]);

        let shared = a.duplicate(false, false).unwrap();
        assert!(shared.is_shared());
    }

    #[test]
    fn test_set_format_adapts_tracks() {
        let mut buffer = SampleBuffer::new(2, 8, 48000.0, 0.0).unwrap();
        buffer.fill_track(1, &[1.0; 8]).unwrap();
        buffer.set_format(SampleFormat::I16, 4).unwrap();
        assert_eq!(buffer.tracks(), 4);
        assert_eq!(buffer.track(1)[0], 1.0);
        assert_eq!(buffer.track(3)[0], 0.0);
        buffer.set_format(SampleFormat::I16, 1).unwrap();
        assert_eq!(buffer.tracks(), 1);
        assert_eq!(buffer.format(), SampleFormat::I16);
    }

    #[test]
    fn test_encode_interleaved_i16() {
        let left = [1.0, 0.0];
        let right = [-1.0, 0.5];
        let buffer = SampleBuffer::from_tracks(&[&left, &right], 48000.0).unwrap();
        let mut out = Vec::new();
        buffer.encode_interleaved(SampleFormat::I16, &mut out);
        assert_eq!(out.len(), 8);
        let samples: Vec<i16> = out
            .chunks_exact(2)
            .map(|b| i16::from_ne_bytes([b[0], b[1]]))
            .collect();
        assert_eq!(samples, vec![i16::MAX, -i16::MAX, 0, i16::MAX / 2]);
    }

    #[test]
    fn test_fill_interleaved() {
        let mut buffer = SampleBuffer::new(2, 2, 48000.0, 0.0).unwrap();
        buffer.fill_interleaved(&[0.1, 0.2, 0.3, 0.4]).unwrap();
        assert_eq!(buffer.track(0), &[0.1, 0.3]);
        assert_eq!(buffer.track(1), &[0.2, 0.4]);
    }

    #[test]
    fn test_state_transitions() {
        let mut buffer = SampleBuffer::new(1, 8, 48000.0, 0.0).unwrap();
        buffer.set_state(StateCommand::Started);
        assert!(buffer.is_playing());
        buffer.advance(5.0);
        buffer.set_state(StateCommand::Rewound);
        assert_eq!(buffer.position(), 0.0);
        assert_eq!(buffer.state(), BufferState::Playing);
        buffer.set_state(StateCommand::Stopped);
        assert!(!buffer.is_playing());
    }

    #[test]
    fn test_advance_and_loop() {
        let mut buffer = SampleBuffer::new(1, 10, 48000.0, 0.0).unwrap();
        buffer.set_state(StateCommand::Started);
        assert!(buffer.advance(6.0));
        assert!(!buffer.advance(6.0));
        assert_eq!(buffer.position(), 10.0);

        buffer.set_position(0.0);
        buffer.set_looping(true);
        buffer.set_loop_points(2, 8).unwrap();
        assert!(buffer.advance(9.0));
        assert_eq!(buffer.position(), 3.0);
    }

    #[test]
    fn test_sample_at_interpolates_and_loops() {
        let data = [0.0, 1.0, 2.0, 3.0];
        let mut buffer = SampleBuffer::from_tracks(&[&data], 48000.0).unwrap();
        assert_eq!(buffer.sample_at(0, 1.5, InterpolationMethod::Linear), 1.5);
        assert_eq!(buffer.sample_at(0, 5.0, InterpolationMethod::Linear), 0.0);

        buffer.set_looping(true);
        assert_eq!(buffer.sample_at(0, 5.0, InterpolationMethod::Linear), 1.0);
        assert_eq!(buffer.sample_at(0, 2.0, InterpolationMethod::Cubic), 2.0);
    }

    #[test]
    fn test_peak_and_rms() {
        let data = [0.5, -1.0, 0.5, -1.0];
        let buffer = SampleBuffer::from_tracks(&[&data], 48000.0).unwrap();
        assert_eq!(buffer.peak(0), 1.0);
        assert!((buffer.rms(0) - 0.790_569).abs() < 1e-5);
    }
}
