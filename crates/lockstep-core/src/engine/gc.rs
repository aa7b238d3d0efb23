//! RT-safe garbage collection for shared engine data
//!
//! Beat grids and runtime config updates cross into the audio thread as
//! `basedrop::Shared<T>`. When the audio thread drops the last reference (a
//! grid replaced by re-analysis, a deck ejected) the memory is not freed
//! there: the pointer is queued and a background GC thread frees it.
//!
//! Detected-beat grids of long tracks hold tens of thousands of positions,
//! so freeing them inline would put an allocator call on the audio thread.
//!
//! ## Usage
//!
//! ```ignore
//! use basedrop::Shared;
//! use crate::engine::gc::gc_handle;
//!
//! let grid = Shared::new(&gc_handle(), BeatGrid::constant(48000, 128.0, 0.0)?);
//! tx.push(EngineCommand::SetBeatGrid { deck, grid: Some(grid) });
//! ```

use basedrop::{Collector, Handle};
use std::sync::mpsc;
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

/// Global handle for creating Shared<T> allocations
///
/// The actual Collector lives on a dedicated GC thread.
static GC_HANDLE: OnceLock<Handle> = OnceLock::new();

/// Initialize the global collector and return a handle
fn init_gc() -> Handle {
    let (tx, rx) = mpsc::channel();

    thread::Builder::new()
        .name("lockstep-gc".to_string())
        .spawn(move || {
            // Collector is !Sync, so it is created on the thread that runs it
            let mut collector = Collector::new();
            tx.send(collector.handle()).expect("Failed to send GC handle");

            log::info!("Sync engine GC thread started");

            loop {
                collector.collect();
                thread::sleep(Duration::from_millis(100));
            }
        })
        .expect("Failed to spawn sync engine GC thread");

    rx.recv().expect("Failed to receive GC handle")
}

/// Get a handle for creating Shared<T> allocations
///
/// The handle is lightweight and can be cloned.
pub fn gc_handle() -> Handle {
    GC_HANDLE.get_or_init(init_gc).clone()
}
