//! Render jobs - one source, one destination track, one block

use std::sync::{Arc, Mutex, PoisonError};

use super::scheduler::Job;
use super::source::Source;
use crate::buffer::{try_zeroed, SampleBuffer, ScratchBuffers};
use crate::error::DspResult;
use crate::types::Sample;

/// The renderer's output buffer plus the block it currently accepts
///
/// `sequence` advances when the renderer seals a block after the barrier;
/// a job that finishes late sees a different sequence and discards its
/// contribution instead of leaking it into the next block.
#[derive(Debug)]
pub struct Destination {
    pub buffer: SampleBuffer,
    pub sequence: u64,
}

impl Destination {
    pub fn new(buffer: SampleBuffer) -> Self {
        Self { buffer, sequence: 0 }
    }
}

/// Shared handle to the destination
pub type SharedDestination = Arc<Mutex<Destination>>;

/// Worker-owned render state, reused across jobs
pub struct RenderContext {
    /// Reservoir-prefixed mix track
    mix: Vec<Sample>,
    scratch: ScratchBuffers,
}

impl RenderContext {
    /// Allocate buffers matching the destination layout
    pub fn new(capacity: usize, history: usize) -> DspResult<Self> {
        Ok(Self {
            mix: try_zeroed(history + capacity)?,
            scratch: ScratchBuffers::new(capacity, history)?,
        })
    }

    pub fn for_destination(buffer: &SampleBuffer) -> DspResult<Self> {
        Self::new(buffer.capacity(), buffer.history_frames())
    }
}

/// Mix one source into one destination track
pub struct RenderJob {
    pub source: Arc<Mutex<Source>>,
    pub destination: SharedDestination,
    pub track: usize,
    pub frames: usize,
    /// Destination block this job belongs to
    pub sequence: u64,
}

impl Job for RenderJob {
    type Context = RenderContext;

    fn run(self, ctx: &mut RenderContext) {
        let gain = {
            let mut source = self.source.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = source.render(self.track, self.frames, &mut ctx.mix, &mut ctx.scratch) {
                // Drop this block for this source, the stream keeps going
                log::debug!("{} track {}: dropped block: {}", source.id(), self.track, e);
                return;
            }
            source.gain()
        };
        if gain == 0.0 {
            return;
        }

        let start = ctx.scratch.history();
        let rendered = &ctx.mix[start..start + self.frames];

        let mut destination = self.destination.lock().unwrap_or_else(PoisonError::into_inner);
        if destination.sequence != self.sequence {
            log::trace!("Discarding late contribution to track {}", self.track);
            return;
        }
        let buffer = &mut destination.buffer;
        if self.track >= buffer.tracks() || buffer.frames() < self.frames {
            return;
        }
        for (out, &x) in buffer.track_mut(self.track)[..self.frames].iter_mut().zip(rendered) {
            *out += gain * x;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect::DspContext;
    use crate::engine::source::SourceId;

    fn setup(sequence: u64) -> (RenderJob, RenderContext) {
        let ctx = DspContext::new(48000.0, 32, 2).unwrap();
        let data = vec![0.5_f32; 64];
        let buffer = SampleBuffer::from_tracks(&[data.as_slice()], 48000.0).unwrap();
        let mut source = Source::new(SourceId(7), buffer, &ctx);
        source.set_gain(0.5);

        let output = SampleBuffer::new(2, 32, 48000.0, 0.001).unwrap();
        let render = RenderContext::for_destination(&output).unwrap();
        let job = RenderJob {
            source: Arc::new(Mutex::new(source)),
            destination: Arc::new(Mutex::new(Destination::new(output))),
            track: 1,
            frames: 32,
            sequence,
        };
        (job, render)
    }

    #[test]
    fn test_job_accumulates_with_gain() {
        let (job, mut render) = setup(0);
        let destination = Arc::clone(&job.destination);
        job.run(&mut render);

        let destination = destination.lock().unwrap();
        assert!(destination.buffer.track(1).iter().all(|&s| s == 0.25));
        assert!(destination.buffer.track(0).iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_late_job_is_discarded() {
        let (job, mut render) = setup(0);
        let destination = Arc::clone(&job.destination);
        destination.lock().unwrap().sequence = 1;
        job.run(&mut render);

        assert!(destination.lock().unwrap().buffer.track(1).iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_two_sources_sum() {
        let (job, mut render) = setup(0);
        let destination = Arc::clone(&job.destination);
        let source = Arc::clone(&job.source);
        job.run(&mut render);
        RenderJob {
            source,
            destination: Arc::clone(&destination),
            track: 1,
            frames: 32,
            sequence: 0,
        }
        .run(&mut render);

        assert!(destination.lock().unwrap().buffer.track(1).iter().all(|&s| s == 0.5));
    }
}
