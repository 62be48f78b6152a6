//! RT-safe garbage collection for parameter snapshots
//!
//! Effect parameters and filter coefficients are exchanged between the
//! control thread and the audio thread as `basedrop::Shared<T>` snapshots.
//! When the audio thread drops the last reference to a replaced snapshot
//! the pointer is only enqueued; the memory is released on a dedicated
//! collector thread where latency doesn't matter.
//!
//! ## Usage
//!
//! ```ignore
//! use basedrop::Shared;
//! use crate::engine::gc::gc_handle;
//!
//! let coefficients = Shared::new(&gc_handle(), FilterCoefficients::default());
//! drop(coefficients); // queued for the collector thread
//! ```

use basedrop::{Collector, Handle};
use std::sync::mpsc;
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

/// Global handle for creating Shared<T> allocations
static GC_HANDLE: OnceLock<Handle> = OnceLock::new();

/// Collection interval; snapshots are small so 50ms keeps memory bounded
const COLLECT_INTERVAL: Duration = Duration::from_millis(50);

/// Initialize the global collector and return a handle
fn init_gc() -> Handle {
    let (tx, rx) = mpsc::channel();

    let spawned = thread::Builder::new()
        .name("aural-gc".to_string())
        .spawn(move || {
            // Collector is !Sync, so it lives on this thread
            let mut collector = Collector::new();
            if tx.send(collector.handle()).is_err() {
                return;
            }

            log::info!("Parameter GC thread started");

            loop {
                collector.collect();
                thread::sleep(COLLECT_INTERVAL);
            }
        });

    match spawned.ok().and_then(|_| rx.recv().ok()) {
        Some(handle) => handle,
        None => {
            // Without a collector thread, leak a collector whose handle
            // still accepts allocations; memory is reclaimed at exit.
            log::error!(
                "Failed to start parameter GC thread, deferred drops will not be collected"
            );
            let collector = Box::leak(Box::new(Collector::new()));
            collector.handle()
        }
    }
}

/// Get a handle for creating Shared<T> allocations
pub fn gc_handle() -> Handle {
    GC_HANDLE.get_or_init(init_gc).clone()
}
