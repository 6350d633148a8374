//! Collaborator surface: chunk lifecycle notifications and process-wide
//! counters.
//!
//! The allocator raises these events synchronously and never reacts to them
//! itself; instrumentation, profiling and memory-limit policy all live on
//! the other side of this trait.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Callbacks invoked on chunk lifecycle transitions. All methods default to
/// no-ops, so collaborators implement only what they care about. Addresses
/// are passed as plain integers; the callee must not dereference them after
/// `chunk_destroyed`.
pub trait ChunkEvents: Send + Sync {
    /// A chunk of `size` bytes was mapped (or heap-allocated) at `base`.
    fn chunk_created(&self, _base: usize, _size: usize) {}

    /// The chunk at `base` is about to be released.
    fn chunk_destroyed(&self, _base: usize) {}

    /// Advisory call raised after every chunk growth with the process-wide
    /// total of code bytes. The allocator ignores the outcome; reacting to
    /// the limit is the collaborator's business.
    fn resource_limit_check(&self, _total_code_bytes: usize) {}
}

/// The default collaborator: ignores everything.
pub struct NoopEvents;

impl ChunkEvents for NoopEvents {}

/// Total bytes currently held in chunks across every code manager in the
/// process.
pub(crate) static CODE_BYTES: AtomicUsize = AtomicUsize::new(0);

pub(crate) static DYNAMIC_ALLOCS: AtomicUsize = AtomicUsize::new(0);
pub(crate) static DYNAMIC_BYTES: AtomicUsize = AtomicUsize::new(0);
pub(crate) static DYNAMIC_FREES: AtomicUsize = AtomicUsize::new(0);

/// Snapshot of the monotonic dynamic-code counters, for external reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Counters {
    /// Reservations served by dynamic code managers.
    pub dynamic_allocs: usize,
    /// Bytes requested through dynamic code managers.
    pub dynamic_bytes: usize,
    /// Ranges given back to dynamic code managers.
    pub dynamic_frees: usize,
}

/// Reads the dynamic-code counters.
pub fn counters() -> Counters {
    Counters {
        dynamic_allocs: DYNAMIC_ALLOCS.load(Ordering::Relaxed),
        dynamic_bytes: DYNAMIC_BYTES.load(Ordering::Relaxed),
        dynamic_frees: DYNAMIC_FREES.load(Ordering::Relaxed),
    }
}

/// Process-wide total of code bytes held in chunks.
pub fn code_bytes() -> usize {
    CODE_BYTES.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_events_are_callable() {
        let events = NoopEvents;
        events.chunk_created(0x1000, 4096);
        events.resource_limit_check(4096);
        events.chunk_destroyed(0x1000);
    }

    #[test]
    fn counters_snapshot_is_consistent() {
        let before = counters();
        DYNAMIC_ALLOCS.fetch_add(1, Ordering::Relaxed);
        DYNAMIC_BYTES.fetch_add(128, Ordering::Relaxed);
        let after = counters();

        assert!(after.dynamic_allocs >= before.dynamic_allocs + 1);
        assert!(after.dynamic_bytes >= before.dynamic_bytes + 128);
        assert!(after.dynamic_frees >= before.dynamic_frees);
    }
}
