//! Renderer - mixes every playing source into one output block
//!
//! Per block:
//!
//! 1. apply pending control commands (block boundary)
//! 2. clear the destination, keeping its reservoir
//! 3. dispatch one job per (playing source, output track)
//! 4. barrier, bounded by the block budget
//! 5. seal the block so late jobs discard their work
//! 6. advance sources
//! 7. run the bus chain on every output track
//! 8. hand the block to the backend
//!
//! Lock order is always source then destination. The renderer never holds
//! the destination while locking a source.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::command::RendererCommand;
use super::job::{Destination, RenderContext, RenderJob, SharedDestination};
use super::scheduler::{pool_size, RendererScheduler, SchedulerStats};
use super::source::{Source, SourceId};
use crate::backend::{Backend, BackendState};
use crate::buffer::{InterpolationMethod, SampleBuffer, ScratchBuffers};
use crate::config::EngineConfig;
use crate::effect::{Block, DspContext, EffectChain, EffectKind, EffectState};
use crate::error::{EngineResult, SchedulerError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A source attached to the renderer
struct SourceEntry {
    id: SourceId,
    source: Arc<Mutex<Source>>,
    /// Mirror of the source state so dispatch needn't lock it
    playing: bool,
    /// Output frames not yet applied to the source position
    behind: usize,
}

/// Outcome of one `render_block` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockReport {
    pub jobs: usize,
    /// Jobs that found no worker in time
    pub skipped: usize,
    /// Whether every job made the deadline
    pub complete: bool,
    /// Whether the backend accepted the block
    pub delivered: bool,
}

/// Mixer: sources, scheduler, output bus and backend
pub struct Renderer {
    config: EngineConfig,
    ctx: DspContext,
    scheduler: RendererScheduler<RenderJob>,
    sources: Vec<SourceEntry>,
    destination: SharedDestination,
    bus: EffectChain,
    bus_scratch: ScratchBuffers,
    backend: Box<dyn Backend>,
    commands: rtrb::Consumer<RendererCommand>,
    blocks: u64,
    dropped: u64,
}

impl Renderer {
    /// Negotiate with the backend, then allocate buffers and start the pool
    ///
    /// The destination buffer adopts whatever layout the backend achieved.
    pub fn new(
        mut config: EngineConfig,
        mut backend: Box<dyn Backend>,
        commands: rtrb::Consumer<RendererCommand>,
    ) -> EngineResult<Self> {
        config.validate()?;
        config.fit_history();
        let achieved = backend.setup(&config.backend_request())?;
        config.apply_achieved(&achieved);
        let ctx = config.context()?;

        let mut output = SampleBuffer::new(
            ctx.tracks,
            ctx.period_frames,
            ctx.sample_rate,
            config.history_seconds,
        )?;
        output.set_format(config.format, ctx.tracks)?;

        let workers = pool_size(config.max_workers);
        let contexts = (0..workers)
            .map(|_| RenderContext::for_destination(&output))
            .collect::<Result<Vec<_>, _>>()?;
        let scheduler = RendererScheduler::start(contexts, config.dispatch_timeout())?;

        let bus = EffectChain::from_presets(&config.bus_effects, &ctx);
        let bus_scratch = output.alloc_scratch()?;

        log::info!(
            "Renderer started on '{}': {} Hz, {} tracks, {} frames/block, {} workers",
            backend.name(),
            ctx.sample_rate,
            ctx.tracks,
            ctx.period_frames,
            workers
        );

        Ok(Self {
            config,
            ctx,
            scheduler,
            sources: Vec::new(),
            destination: Arc::new(Mutex::new(Destination::new(output))),
            bus,
            bus_scratch,
            backend,
            commands,
            blocks: 0,
            dropped: 0,
        })
    }

    pub fn context(&self) -> &DspContext {
        &self.ctx
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Wall-clock length of one block
    pub fn period(&self) -> Duration {
        self.config.period()
    }

    pub fn stats(&self) -> &SchedulerStats {
        self.scheduler.stats()
    }

    pub fn workers(&self) -> usize {
        self.scheduler.workers()
    }

    /// Resampling applied to every attached source
    pub fn interpolation(&self) -> InterpolationMethod {
        self.config.interpolation
    }

    pub fn blocks_rendered(&self) -> u64 {
        self.blocks
    }

    /// Blocks the backend refused
    pub fn dropped_blocks(&self) -> u64 {
        self.dropped
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    pub fn bus(&self) -> &EffectChain {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut EffectChain {
        &mut self.bus
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    /// Shared handle to a source, for inspection between blocks
    pub fn source(&self, id: SourceId) -> Option<Arc<Mutex<Source>>> {
        self.entry(id).map(|entry| Arc::clone(&entry.source))
    }

    /// Run `f` on the last rendered block
    pub fn with_output<R>(&self, f: impl FnOnce(&SampleBuffer) -> R) -> R {
        f(&lock(&self.destination).buffer)
    }

    pub fn pause(&mut self) {
        if let Err(e) = self.backend.pause() {
            log::warn!("Failed to pause backend '{}': {}", self.backend.name(), e);
        }
    }

    pub fn resume(&mut self) {
        if let Err(e) = self.backend.resume() {
            log::warn!("Failed to resume backend '{}': {}", self.backend.name(), e);
        }
    }

    /// Stop the worker pool; running jobs complete first
    pub fn shutdown(&mut self) {
        self.scheduler.stop();
    }

    fn entry(&self, id: SourceId) -> Option<&SourceEntry> {
        self.sources.iter().find(|entry| entry.id == id)
    }

    fn entry_mut(&mut self, id: SourceId) -> Option<&mut SourceEntry> {
        self.sources.iter_mut().find(|entry| entry.id == id)
    }

    // ─────────────────────────────────────────────────────────────
    // Commands
    // ─────────────────────────────────────────────────────────────

    /// Apply every pending control command
    pub fn process_commands(&mut self) {
        while let Ok(command) = self.commands.pop() {
            self.apply(command);
        }
    }

    fn apply(&mut self, command: RendererCommand) {
        match command {
            RendererCommand::AddSource(source) => self.add_source(*source),
            RendererCommand::RemoveSource { id } => {
                let before = self.sources.len();
                self.sources.retain(|entry| entry.id != id);
                if self.sources.len() == before {
                    log::debug!("RemoveSource: unknown {}", id);
                }
            }
            RendererCommand::Play { id } => self.with_source(id, |entry, source| {
                source.play();
                entry.playing = true;
            }),
            RendererCommand::Pause { id } => self.with_source(id, |entry, source| {
                source.pause();
                entry.playing = false;
            }),
            RendererCommand::Stop { id } => self.with_source(id, |entry, source| {
                source.stop();
                entry.playing = false;
                entry.behind = 0;
            }),
            RendererCommand::SetPitch { id, pitch } => {
                self.with_source(id, |_, source| source.set_pitch(pitch))
            }
            RendererCommand::SetGain { id, gain } => {
                self.with_source(id, |_, source| source.set_gain(gain))
            }
            RendererCommand::InstallEffect { id: None, effect } => {
                self.bus.update(*effect);
            }
            RendererCommand::InstallEffect { id: Some(id), effect } => {
                self.with_source(id, |_, source| {
                    source.chain_mut().update(*effect);
                });
            }
            RendererCommand::RemoveEffect { id: None, kind } => {
                self.bus.remove(kind);
            }
            RendererCommand::RemoveEffect { id: Some(id), kind } => {
                self.with_source(id, |_, source| {
                    source.chain_mut().remove(kind);
                });
            }
        }
    }

    fn with_source<F>(&mut self, id: SourceId, f: F)
    where
        F: FnOnce(&mut SourceEntry, &mut Source),
    {
        let Some(entry) = self.entry_mut(id) else {
            log::debug!("Command for unknown {}", id);
            return;
        };
        let source = Arc::clone(&entry.source);
        let mut source = lock(&source);
        f(entry, &mut source);
    }

    /// Attach a source directly (outside the command queue)
    pub fn add_source(&mut self, source: Source) {
        let id = source.id();
        let playing = source.is_playing();
        let source = source.with_interpolation(self.config.interpolation);
        let entry = SourceEntry {
            id,
            source: Arc::new(Mutex::new(source)),
            playing,
            behind: 0,
        };
        match self.entry_mut(id) {
            Some(existing) => {
                log::warn!("Replacing existing {}", id);
                *existing = entry;
            }
            None => self.sources.push(entry),
        }
    }

    /// Install an effect on a source or, with `None`, on the output bus
    pub fn install_effect(&mut self, id: Option<SourceId>, effect: EffectState) {
        self.apply(RendererCommand::InstallEffect {
            id,
            effect: Box::new(effect),
        });
    }

    pub fn remove_effect(&mut self, id: Option<SourceId>, kind: EffectKind) {
        self.apply(RendererCommand::RemoveEffect { id, kind });
    }

    // ─────────────────────────────────────────────────────────────
    // Block rendering
    // ─────────────────────────────────────────────────────────────

    /// Render and deliver one block
    pub fn render_block(&mut self) -> BlockReport {
        let started = Instant::now();
        let deadline = started + self.config.block_budget();
        let frames = self.ctx.period_frames;
        let tracks = self.ctx.tracks;

        self.process_commands();

        let sequence = {
            let mut destination = lock(&self.destination);
            destination.buffer.clear_frames();
            destination.sequence
        };

        let mut report = BlockReport {
            jobs: 0,
            skipped: 0,
            complete: true,
            delivered: false,
        };

        'dispatch: for entry in self.sources.iter().filter(|entry| entry.playing) {
            for track in 0..tracks {
                let job = RenderJob {
                    source: Arc::clone(&entry.source),
                    destination: Arc::clone(&self.destination),
                    track,
                    frames,
                    sequence,
                };
                match self.scheduler.dispatch(job) {
                    Ok(_) => report.jobs += 1,
                    Err(SchedulerError::DispatchTimeout(_)) => {
                        report.skipped += 1;
                        log::debug!("{} track {}: no worker available, skipped", entry.id, track);
                    }
                    Err(e) => {
                        log::warn!("Dispatch failed: {}", e);
                        report.skipped += 1;
                        if matches!(e, SchedulerError::Stopped) {
                            break 'dispatch;
                        }
                    }
                }
            }
        }

        report.complete = self.scheduler.wait_all(deadline);
        if !report.complete {
            log::debug!("Block {} rendered from a partial mix", self.blocks);
        }

        // Seal: anything still running now belongs to a finished block
        lock(&self.destination).sequence = sequence.wrapping_add(1);

        self.advance_sources(frames);

        let mut destination = lock(&self.destination);
        let output = &mut destination.buffer;
        if !self.bus.is_empty() {
            let start = output.history_frames();
            for track in 0..output.tracks() {
                let data = output.track_with_history_mut(track);
                let block = Block::new(track, start, frames);
                if let Err(e) = self.bus.apply(data, &mut self.bus_scratch, block) {
                    log::warn!("Bus chain failed on track {}: {}", track, e);
                }
            }
        }

        match self.backend.play(output) {
            Ok(()) => report.delivered = self.backend.state() == BackendState::Available,
            Err(e) => {
                self.dropped += 1;
                log::warn!(
                    "Backend '{}' dropped block {}: {}",
                    self.backend.name(),
                    self.blocks,
                    e
                );
            }
        }
        drop(destination);

        self.blocks += 1;
        report
    }

    fn advance_sources(&mut self, frames: usize) {
        for entry in self.sources.iter_mut() {
            if !entry.playing {
                continue;
            }
            entry.behind += frames;
            // A source still locked by a late job catches up next block
            let Ok(mut source) = entry.source.try_lock() else {
                continue;
            };
            entry.playing = source.advance(entry.behind);
            entry.behind = 0;
        }
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        self.scheduler.stop();
        log::info!("Renderer stopped after {} blocks", self.blocks);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::NullBackend;
    use crate::effect::{DelayParams, DistortionParams, EffectPreset};
    use crate::engine::command::command_channel;
    use crate::types::SampleFormat;

    fn config() -> EngineConfig {
        EngineConfig {
            period_frames: 64,
            history_seconds: 0.01,
            max_workers: 2,
            dispatch_timeout_ms: 100,
            deadline_slack: 1.0,
            ..Default::default()
        }
    }

    /// Renderer whose barrier always waits long enough for test jobs
    fn renderer(config: EngineConfig) -> (Renderer, rtrb::Producer<RendererCommand>) {
        let (tx, rx) = command_channel(64);
        let config = EngineConfig {
            sample_rate: 1000.0,
            ..config
        };
        (Renderer::new(config, Box::new(NullBackend::new()), rx).unwrap(), tx)
    }

    fn constant_source(id: u32, value: f32, frames: usize, ctx: &DspContext) -> Source {
        let data = vec![value; frames];
        let buffer = SampleBuffer::from_tracks(&[data.as_slice()], ctx.sample_rate).unwrap();
        Source::new(SourceId(id), buffer, ctx)
    }

    #[test]
    fn test_silent_without_sources() {
        let (mut renderer, _tx) = renderer(config());
        let report = renderer.render_block();
        assert_eq!(report.jobs, 0);
        assert!(report.complete);
        assert!(report.delivered);
        renderer.with_output(|out| assert!(out.track(0).iter().all(|&s| s == 0.0)));
    }

    #[test]
    fn test_sources_mix_with_gain() {
        let (mut renderer, mut tx) = renderer(config());
        let ctx = *renderer.context();

        let mut a = constant_source(1, 0.25, 1000, &ctx);
        a.play();
        let mut b = constant_source(2, 0.5, 1000, &ctx);
        b.set_gain(0.5);
        b.play();
        tx.push(RendererCommand::AddSource(Box::new(a))).ok().unwrap();
        tx.push(RendererCommand::AddSource(Box::new(b))).ok().unwrap();

        let report = renderer.render_block();
        assert_eq!(report.jobs, 4);
        assert!(report.complete);
        renderer.with_output(|out| {
            for track in 0..2 {
                assert!(out.track(track).iter().all(|&s| (s - 0.5).abs() < 1e-6));
            }
        });
    }

    #[test]
    fn test_commands_apply_at_block_boundary() {
        let (mut renderer, mut tx) = renderer(config());
        let ctx = *renderer.context();
        tx.push(RendererCommand::AddSource(Box::new(constant_source(1, 0.5, 1000, &ctx))))
            .ok()
            .unwrap();

        // Added stopped: nothing rendered
        assert_eq!(renderer.render_block().jobs, 0);

        tx.push(RendererCommand::Play { id: SourceId(1) }).ok().unwrap();
        tx.push(RendererCommand::SetGain { id: SourceId(1), gain: 2.0 }).ok().unwrap();
        assert_eq!(renderer.render_block().jobs, 2);
        renderer.with_output(|out| assert!(out.track(1).iter().all(|&s| (s - 1.0).abs() < 1e-6)));

        tx.push(RendererCommand::Pause { id: SourceId(1) }).ok().unwrap();
        assert_eq!(renderer.render_block().jobs, 0);

        tx.push(RendererCommand::RemoveSource { id: SourceId(1) }).ok().unwrap();
        renderer.render_block();
        assert_eq!(renderer.source_count(), 0);
    }

    #[test]
    fn test_source_stops_at_end_of_data() {
        let (mut renderer, _tx) = renderer(config());
        let ctx = *renderer.context();
        let mut source = constant_source(1, 0.5, 100, &ctx);
        source.play();
        renderer.add_source(source);

        assert_eq!(renderer.render_block().jobs, 2);
        assert_eq!(renderer.render_block().jobs, 2);
        // 128 frames consumed, the 100-frame buffer is exhausted
        assert_eq!(renderer.render_block().jobs, 0);

        let handle = renderer.source(SourceId(1)).unwrap();
        assert!(!handle.lock().unwrap().is_playing());
    }

    #[test]
    fn test_position_advances_by_block() {
        let (mut renderer, _tx) = renderer(config());
        let ctx = *renderer.context();
        let data: Vec<f32> = (0..1000).map(|i| i as f32 / 1000.0).collect();
        let buffer = SampleBuffer::from_tracks(&[data.as_slice()], ctx.sample_rate).unwrap();
        let mut source = Source::new(SourceId(9), buffer, &ctx);
        source.play();
        renderer.add_source(source);

        renderer.render_block();
        renderer.render_block();
        renderer.with_output(|out| {
            assert!((out.track(0)[0] - 0.064).abs() < 1e-6);
            assert!((out.track(0)[63] - 0.127).abs() < 1e-6);
        });
    }

    #[test]
    fn test_bus_effect_install_and_remove() {
        let (mut renderer, mut tx) = renderer(config());
        let ctx = *renderer.context();
        let mut source = constant_source(1, 0.5, 1000, &ctx);
        source.play();
        renderer.add_source(source);

        let effect = EffectPreset::Distortion(DistortionParams::with_drive(1.0))
            .build(&ctx)
            .unwrap();
        tx.push(RendererCommand::InstallEffect {
            id: None,
            effect: Box::new(effect),
        })
        .ok()
        .unwrap();
        renderer.render_block();
        assert_eq!(renderer.bus().kinds().count(), 1);
        renderer.with_output(|out| assert!(out.track(0).iter().all(|&s| s != 0.5)));

        tx.push(RendererCommand::RemoveEffect {
            id: None,
            kind: EffectKind::Distortion,
        })
        .ok()
        .unwrap();
        renderer.render_block();
        assert!(renderer.bus().is_empty());
        renderer.with_output(|out| assert!(out.track(0).iter().all(|&s| (s - 0.5).abs() < 1e-6)));
    }

    #[test]
    fn test_history_sized_for_bus_echo() {
        let config = EngineConfig {
            bus_effects: vec![EffectPreset::DelayLine(DelayParams::echo(0.5, 0.3))],
            ..config()
        };
        let (mut renderer, _tx) = renderer(config);
        assert!(renderer.config().history_seconds >= 0.5);
        renderer.with_output(|out| assert!(out.history_frames() >= 500));
        assert_eq!(renderer.bus().kinds().count(), 1);
        assert!(renderer.render_block().complete);
    }

    #[test]
    fn test_adapts_to_backend_layout() {
        let (_tx, rx) = command_channel(8);
        let backend = NullBackend::new().with_max_tracks(1).with_format(SampleFormat::I16);
        let mut renderer = Renderer::new(config(), Box::new(backend), rx).unwrap();
        assert_eq!(renderer.context().tracks, 1);
        renderer.with_output(|out| {
            assert_eq!(out.tracks(), 1);
            assert_eq!(out.format(), SampleFormat::I16);
        });
        assert!(renderer.render_block().delivered);
    }

    #[test]
    fn test_paused_backend_keeps_rendering() {
        let (mut renderer, _tx) = renderer(config());
        renderer.pause();
        let report = renderer.render_block();
        assert!(!report.delivered);
        assert_eq!(renderer.dropped_blocks(), 0);
        renderer.resume();
        assert!(renderer.render_block().delivered);
        assert_eq!(renderer.blocks_rendered(), 2);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let (_tx, rx) = command_channel(8);
        let config = EngineConfig {
            tracks: 0,
            ..config()
        };
        assert!(Renderer::new(config, Box::new(NullBackend::new()), rx).is_err());
    }
}
