//! Renderer - sources, worker pool, mixer and mixer thread
//!
//! This module contains the real-time side of the engine:
//! - Source: an emitter with its buffer, pitch, gain and effect chain
//! - RendererScheduler: fixed worker pool with deadline-bounded barrier
//! - Renderer: per-block mixing, bus effects and backend hand-off
//! - MixerThread: drives the renderer once per block period
//! - Command queue and parameter GC shared with the control thread

mod command;
pub mod gc;
mod job;
mod mixer;
mod scheduler;
mod source;
mod thread;

pub use command::{command_channel, RendererCommand, COMMAND_QUEUE_CAPACITY};
pub use job::{Destination, RenderContext, RenderJob, SharedDestination};
pub use mixer::{BlockReport, Renderer};
pub use scheduler::{pool_size, Job, RendererScheduler, SchedulerStats, WorkerStatus};
pub use source::{Source, SourceId, SourceState, MAX_PITCH, MIN_PITCH};
pub use thread::MixerThread;
