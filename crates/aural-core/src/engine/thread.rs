//! Mixer thread - drives the renderer once per block period
//!
//! The loop renders a block, then sleeps until the next block deadline or
//! until woken early. A stop request is observed at the top of every
//! iteration; a block in progress always completes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use super::mixer::Renderer;
use crate::error::{SchedulerError, SchedulerResult};

struct Control {
    stop: AtomicBool,
    /// Set by `wake`, cleared by the loop
    woken: Mutex<bool>,
    signal: Condvar,
    blocks: AtomicU64,
    late: AtomicU64,
}

/// Background thread owning a [`Renderer`]
pub struct MixerThread {
    control: Arc<Control>,
    handle: Option<JoinHandle<Renderer>>,
}

impl MixerThread {
    /// Move the renderer onto its own thread and start rendering
    pub fn spawn(renderer: Renderer) -> SchedulerResult<Self> {
        let control = Arc::new(Control {
            stop: AtomicBool::new(false),
            woken: Mutex::new(false),
            signal: Condvar::new(),
            blocks: AtomicU64::new(0),
            late: AtomicU64::new(0),
        });
        let thread_control = Arc::clone(&control);
        let handle = thread::Builder::new()
            .name("aural-mixer".to_string())
            .spawn(move || mixer_loop(renderer, thread_control))
            .map_err(|e| SchedulerError::Spawn(e.to_string()))?;

        log::info!("Mixer thread started");
        Ok(Self {
            control,
            handle: Some(handle),
        })
    }

    /// Render the next block now instead of at its deadline
    pub fn wake(&self) {
        *self.control.woken.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.control.signal.notify_one();
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn blocks(&self) -> u64 {
        self.control.blocks.load(Ordering::Relaxed)
    }

    /// Blocks that started after their deadline
    pub fn late_blocks(&self) -> u64 {
        self.control.late.load(Ordering::Relaxed)
    }

    /// Request a stop, wait for the current block, and take the renderer back
    pub fn stop(mut self) -> Option<Renderer> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Option<Renderer> {
        let handle = self.handle.take()?;
        self.control.stop.store(true, Ordering::Release);
        self.wake();
        match handle.join() {
            Ok(renderer) => {
                log::info!("Mixer thread stopped after {} blocks", self.blocks());
                Some(renderer)
            }
            Err(_) => {
                log::error!("Mixer thread panicked");
                None
            }
        }
    }
}

impl Drop for MixerThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn mixer_loop(mut renderer: Renderer, control: Arc<Control>) -> Renderer {
    let period = renderer.period();
    let mut next = Instant::now();

    while !control.stop.load(Ordering::Acquire) {
        renderer.render_block();
        control.blocks.fetch_add(1, Ordering::Relaxed);
        next += period;

        // Wait until the next block deadline or until woken
        let mut woken = control.woken.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if *woken || control.stop.load(Ordering::Acquire) {
                break;
            }
            let now = Instant::now();
            if now >= next {
                break;
            }
            woken = control
                .signal
                .wait_timeout(woken, next - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        let now = Instant::now();
        if std::mem::take(&mut *woken) {
            next = now;
        } else if now > next + period {
            // More than a block behind: resync instead of bursting
            control.late.fetch_add(1, Ordering::Relaxed);
            log::debug!("Mixer fell behind by {:?}, resyncing", now - next);
            next = now;
        }
    }

    renderer
}
