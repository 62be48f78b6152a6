//! Renderer scheduler - a fixed worker pool with deadline semantics
//!
//! Each worker moves through three states:
//!
//! ```text
//!   Available ──dispatch──▶ Dispatched ──recv──▶ Running ──done──▶ Available
//! ```
//!
//! A single mutex/condvar pair guards the state table. `dispatch` picks the
//! next available worker round-robin, waiting a bounded time when every
//! worker is busy, and hands the job over a one-slot channel. `wait_all`
//! is the per-block barrier: it returns once every dispatched job reported
//! back, or at the block deadline with whatever has finished so far.
//!
//! Shutdown is cooperative. Workers check the stop flag before starting a
//! job; a job that is already running always completes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};

use crate::error::{SchedulerError, SchedulerResult};
use crate::types::MAX_WORKERS;

/// Work item executed on a pool thread
///
/// `Context` is worker-owned state (mix and scratch buffers) created once
/// per worker and reused for every job that worker runs.
pub trait Job: Send + 'static {
    type Context: Send + 'static;

    fn run(self, ctx: &mut Self::Context);
}

/// Worker state as seen by the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Available,
    Dispatched,
    Running,
}

enum WorkerMessage<J> {
    Job(J),
    Stop,
}

struct PoolState {
    status: Vec<WorkerStatus>,
    /// Round-robin cursor
    next: usize,
    /// Jobs dispatched and not yet reported back
    pending: usize,
    stopped: bool,
}

impl PoolState {
    fn next_available(&self) -> Option<usize> {
        let n = self.status.len();
        (0..n)
            .map(|k| (self.next + k) % n)
            .find(|&i| self.status[i] == WorkerStatus::Available)
    }
}

/// Scheduler counters, readable from any thread
#[derive(Debug, Default)]
pub struct SchedulerStats {
    dispatched: AtomicU64,
    completed: AtomicU64,
    dispatch_timeouts: AtomicU64,
    deadline_misses: AtomicU64,
}

impl SchedulerStats {
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn dispatch_timeouts(&self) -> u64 {
        self.dispatch_timeouts.load(Ordering::Relaxed)
    }

    pub fn deadline_misses(&self) -> u64 {
        self.deadline_misses.load(Ordering::Relaxed)
    }
}

struct Shared {
    state: Mutex<PoolState>,
    signal: Condvar,
    stats: SchedulerStats,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // A panicking job can't leave the table half-updated, see `Completion`
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Reports a worker available again, even if its job panics
struct Completion<'a> {
    shared: &'a Shared,
    index: usize,
}

impl Drop for Completion<'_> {
    fn drop(&mut self) {
        {
            let mut state = self.shared.lock();
            state.status[self.index] = WorkerStatus::Available;
            state.pending = state.pending.saturating_sub(1);
        }
        self.shared.stats.completed.fetch_add(1, Ordering::Relaxed);
        self.shared.signal.notify_all();
    }
}

/// Pool size for this host: physical cores, capped
pub fn pool_size(max_workers: usize) -> usize {
    num_cpus::get_physical()
        .clamp(1, MAX_WORKERS)
        .min(max_workers.max(1))
}

/// Fixed-size renderer worker pool
pub struct RendererScheduler<J: Job> {
    shared: Arc<Shared>,
    senders: Vec<Sender<WorkerMessage<J>>>,
    workers: Vec<JoinHandle<()>>,
    dispatch_timeout: Duration,
}

impl<J: Job> RendererScheduler<J> {
    /// Spawn one worker per context
    pub fn start(contexts: Vec<J::Context>, dispatch_timeout: Duration) -> SchedulerResult<Self> {
        if contexts.is_empty() {
            return Err(SchedulerError::Spawn("empty worker pool".to_string()));
        }
        let shared = Arc::new(Shared {
            state: Mutex::new(PoolState {
                status: vec![WorkerStatus::Available; contexts.len()],
                next: 0,
                pending: 0,
                stopped: false,
            }),
            signal: Condvar::new(),
            stats: SchedulerStats::default(),
        });

        let mut scheduler = Self {
            shared: Arc::clone(&shared),
            senders: Vec::with_capacity(contexts.len()),
            workers: Vec::with_capacity(contexts.len()),
            dispatch_timeout,
        };

        for (index, ctx) in contexts.into_iter().enumerate() {
            let (tx, rx) = channel::bounded(1);
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("aural-render-{}", index))
                .spawn(move || worker_loop(index, rx, shared, ctx))
                .map_err(|e| SchedulerError::Spawn(e.to_string()))?;
            scheduler.senders.push(tx);
            scheduler.workers.push(handle);
        }

        log::info!(
            "Renderer scheduler started with {} workers (dispatch timeout {:?})",
            scheduler.workers.len(),
            dispatch_timeout
        );
        Ok(scheduler)
    }

    pub fn workers(&self) -> usize {
        self.senders.len()
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.shared.stats
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.lock().stopped
    }

    /// Snapshot of every worker's state
    pub fn status(&self) -> Vec<WorkerStatus> {
        self.shared.lock().status.clone()
    }

    /// Hand a job to the next available worker
    ///
    /// Waits up to the dispatch timeout when every worker is busy. Returns
    /// the index of the worker that took the job.
    pub fn dispatch(&self, job: J) -> SchedulerResult<usize> {
        let deadline = Instant::now() + self.dispatch_timeout;
        let mut state = self.shared.lock();
        let index = loop {
            if state.stopped {
                return Err(SchedulerError::Stopped);
            }
            if let Some(index) = state.next_available() {
                break index;
            }
            let now = Instant::now();
            if now >= deadline {
                self.shared.stats.dispatch_timeouts.fetch_add(1, Ordering::Relaxed);
                return Err(SchedulerError::DispatchTimeout(self.dispatch_timeout));
            }
            state = self
                .shared
                .signal
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        };
        state.status[index] = WorkerStatus::Dispatched;
        state.next = (index + 1) % state.status.len();
        state.pending += 1;
        drop(state);

        // An available worker has drained its slot, so this never blocks
        if self.senders[index].send(WorkerMessage::Job(job)).is_err() {
            // Leave it marked dispatched so it is never picked again
            let mut state = self.shared.lock();
            state.pending = state.pending.saturating_sub(1);
            drop(state);
            self.shared.signal.notify_all();
            log::error!("Renderer worker {} exited unexpectedly", index);
            return Err(SchedulerError::WorkerLost(index));
        }
        self.shared.stats.dispatched.fetch_add(1, Ordering::Relaxed);
        Ok(index)
    }

    /// Block until every dispatched job reported back or `deadline` passes
    ///
    /// Returns false on a deadline miss; the caller proceeds with whatever
    /// the finished jobs produced.
    pub fn wait_all(&self, deadline: Instant) -> bool {
        let mut state = self.shared.lock();
        while state.pending > 0 {
            let now = Instant::now();
            if now >= deadline {
                self.shared.stats.deadline_misses.fetch_add(1, Ordering::Relaxed);
                log::debug!("Block deadline missed with {} jobs outstanding", state.pending);
                return false;
            }
            state = self
                .shared
                .signal
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    /// Signal every worker, wake it and join it
    ///
    /// Running jobs finish first; queued jobs are discarded.
    pub fn stop(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        self.shared.lock().stopped = true;
        self.shared.signal.notify_all();

        for tx in self.senders.drain(..) {
            // A full slot holds a job the worker will discard; dropping
            // the sender wakes it either way.
            let _ = tx.try_send(WorkerMessage::Stop);
        }
        for (index, handle) in self.workers.drain(..).enumerate() {
            if handle.join().is_err() {
                log::error!("Renderer worker {} panicked", index);
            }
        }
        log::info!("Renderer scheduler stopped");
    }
}

impl<J: Job> Drop for RendererScheduler<J> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop<J: Job>(
    index: usize,
    rx: Receiver<WorkerMessage<J>>,
    shared: Arc<Shared>,
    mut ctx: J::Context,
) {
    log::debug!("Renderer worker {} started", index);

    // Wait for dispatch
    while let Ok(message) = rx.recv() {
        let job = match message {
            WorkerMessage::Job(job) => job,
            WorkerMessage::Stop => break,
        };
        let completion = Completion {
            shared: &shared,
            index,
        };
        {
            let mut state = shared.lock();
            if state.stopped {
                drop(state);
                drop(completion);
                break;
            }
            state.status[index] = WorkerStatus::Running;
        }
        job.run(&mut ctx);
        drop(completion);
    }

    log::debug!("Renderer worker {} exiting", index);
}
