//! Rolling per-track history addressed by absolute sample time

use super::try_zeroed;
use crate::error::DspResult;
use crate::types::Sample;

/// Circular history of a single track
///
/// Samples are addressed by their absolute index since the last reset, so
/// several readers (e.g. the reverb cross-feed of other tracks) can read
/// the same history regardless of which of them wrote the current block.
#[derive(Debug, Clone)]
pub struct DelayHistory {
    data: Vec<Sample>,
    /// Next write index into `data`
    pos: usize,
    /// Total samples pushed since the last clear
    written: u64,
}

impl DelayHistory {
    pub fn new(capacity: usize) -> DspResult<Self> {
        Ok(Self {
            data: try_zeroed(capacity.max(1))?,
            pos: 0,
            written: 0,
        })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Absolute index one past the newest sample
    #[inline]
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Append a block, keeping at most `capacity` newest samples
    pub fn push(&mut self, block: &[Sample]) {
        let cap = self.data.len();
        let skip = block.len().saturating_sub(cap);
        for &s in &block[skip..] {
            self.data[self.pos] = s;
            self.pos += 1;
            if self.pos == cap {
                self.pos = 0;
            }
        }
        self.written += block.len() as u64;
    }

    /// Read the sample at an absolute index
    ///
    /// Indices that were never written, or that have been overwritten,
    /// read as silence.
    #[inline]
    pub fn read(&self, index: i64) -> Sample {
        if index < 0 || index as u64 >= self.written {
            return 0.0;
        }
        let back = (self.written - index as u64) as usize;
        let cap = self.data.len();
        if back > cap {
            return 0.0;
        }
        self.data[(self.pos + cap - back) % cap]
    }

    /// Copy the newest `dst.len()` samples, oldest first
    pub fn copy_tail(&self, dst: &mut [Sample]) {
        let start = self.written as i64 - dst.len() as i64;
        for (i, d) in dst.iter_mut().enumerate() {
            *d = self.read(start + i as i64);
        }
    }

    pub fn clear(&mut self) {
        self.data.fill(0.0);
        self.pos = 0;
        self.written = 0;
    }
}
