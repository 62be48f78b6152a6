//! Scratch storage for ping-pong effect processing

use super::try_zeroed;
use crate::error::{DspError, DspResult};
use crate::types::Sample;

/// Which buffer currently holds the live signal of an effect chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Live {
    /// The caller's destination track
    Destination,
    /// One of the two scratch buffers
    Scratch(usize),
}

/// Two scratch tracks laid out like a sample buffer track
/// (`history` reservoir followed by `capacity` frames)
#[derive(Debug, Clone)]
pub struct ScratchBuffers {
    buffers: [Vec<Sample>; 2],
    history: usize,
    capacity: usize,
}

impl ScratchBuffers {
    pub fn new(capacity: usize, history: usize) -> DspResult<Self> {
        Ok(Self {
            buffers: [
                try_zeroed(history + capacity)?,
                try_zeroed(history + capacity)?,
            ],
            history,
            capacity,
        })
    }

    #[inline]
    pub fn history(&self) -> usize {
        self.history
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Fail instead of reading past the end when a block outgrows the scratch
    pub fn check(&self, frames: usize) -> DspResult<()> {
        if frames > self.capacity {
            return Err(DspError::InvalidParameter {
                name: "frames",
                value: frames as f32,
            });
        }
        Ok(())
    }

    pub fn buffer(&self, index: usize) -> &[Sample] {
        &self.buffers[index]
    }

    pub fn buffer_mut(&mut self, index: usize) -> &mut [Sample] {
        &mut self.buffers[index]
    }

    /// Mutable access to the live signal
    pub fn live_mut<'a>(&'a mut self, dst: &'a mut [Sample], live: Live) -> &'a mut [Sample] {
        match live {
            Live::Destination => dst,
            Live::Scratch(i) => &mut self.buffers[i],
        }
    }

    /// Shared access to the live signal
    pub fn live<'a>(&'a self, dst: &'a [Sample], live: Live) -> &'a [Sample] {
        match live {
            Live::Destination => dst,
            Live::Scratch(i) => &self.buffers[i],
        }
    }

    /// Borrow the live signal as input and a free buffer as output
    ///
    /// Returns the input, the output and the `Live` tag the output becomes
    /// once the stage has written it. The destination is never chosen as
    /// output; the chain copies back once at the end.
    pub fn ping_pong<'a>(
        &'a mut self,
        dst: &'a mut [Sample],
        live: Live,
    ) -> (&'a [Sample], &'a mut [Sample], Live) {
        let [a, b] = &mut self.buffers;
        match live {
            Live::Destination => (&*dst, a.as_mut_slice(), Live::Scratch(0)),
            Live::Scratch(0) => (a.as_slice(), b.as_mut_slice(), Live::Scratch(1)),
            Live::Scratch(_) => (b.as_slice(), a.as_mut_slice(), Live::Scratch(0)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_pong_alternates() {
        let mut scratch = ScratchBuffers::new(4, 2).unwrap();
        let mut dst = vec![1.0; 6];

        let (input, output, live) = scratch.ping_pong(&mut dst, Live::Destination);
        assert_eq!(input[0], 1.0);
        output.fill(2.0);
        assert_eq!(live, Live::Scratch(0));

        let (input, output, live) = scratch.ping_pong(&mut dst, live);
        assert_eq!(input[0], 2.0);
        output.fill(3.0);
        assert_eq!(live, Live::Scratch(1));

        let (input, _, live) = scratch.ping_pong(&mut dst, live);
        assert_eq!(input[0], 3.0);
        assert_eq!(live, Live::Scratch(0));
    }

    #[test]
    fn test_check_capacity() {
        let scratch = ScratchBuffers::new(16, 0).unwrap();
        assert!(scratch.check(16).is_ok());
        assert!(scratch.check(17).is_err());
    }
}
