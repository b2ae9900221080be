//! RT-safe deferred deallocation for live riff and stem buffers
//!
//! The mixer swaps riff handles from inside the audio callback. Dropping the
//! outgoing riff there would free hundreds of megabytes of PCM on the RT
//! thread, so handles are `basedrop::Shared<T>`: dropping one only enqueues a
//! pointer, and a background collector thread does the actual free.

use std::sync::mpsc;
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

use basedrop::{Collector, Handle};

static GC_HANDLE: OnceLock<Handle> = OnceLock::new();

fn init_gc() -> Handle {
    let (tx, rx) = mpsc::channel();

    // The Collector is !Sync and must live on its own thread
    thread::Builder::new()
        .name("weft-audio-gc".to_string())
        .spawn(move || {
            let mut collector = Collector::new();
            tx.send(collector.handle()).expect("failed to send GC handle");

            log::info!("audio GC thread started");

            loop {
                collector.collect();
                thread::sleep(Duration::from_millis(100));
            }
        })
        .expect("failed to spawn audio GC thread");

    rx.recv().expect("failed to receive GC handle")
}

/// Handle for creating `Shared<T>` allocations; cheap to clone.
pub fn gc_handle() -> Handle {
    GC_HANDLE.get_or_init(init_gc).clone()
}
