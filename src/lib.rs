//! Executable-memory allocator for JIT-compiled code.
//!
//! A [`CodeManager`] supplies memory suitable for storing native
//! instructions: chunks are mapped read-write-execute at page granularity
//! and carved up with a bump cursor, so many small methods end up close
//! together. Each chunk reserves *bind room* at its start for
//! branch-trampoline thunks resolving out-of-range jumps.
//!
//! Two optional modes change the lifecycle:
//!
//! - **reuse mode** ([`CodeManager::set_reusable`]) tracks freed ranges in a
//!   coalescing catalogue and recycles them instead of growing, so a
//!   chunk's address space survives many allocate/free cycles without ever
//!   going back to the kernel;
//! - **dynamic mode** ([`CodeManager::new_dynamic`]) sizes every chunk to a
//!   single allocation, for small code objects freed independently.
//!
//! Unmapped chunks land in a bounded process-wide cache
//! (see [`purge_region_cache`]) so the next manager of the same shape skips
//! the mapping syscall.

mod cache;
mod chunk;
mod events;
mod freelist;
mod manager;
mod utils;
mod vmem;

use thiserror::Error;

pub use cache::purge as purge_region_cache;
pub use events::{ChunkEvents, Counters, NoopEvents, code_bytes, counters};
pub use manager::CodeManager;

/// Maximum (and default) alignment of a reservation. Matches the natural
/// literal alignment of the target instruction sets; asking for more is a
/// contract violation.
pub const MIN_ALIGN: usize = 16;

/// Recoverable allocation failure. Contract violations (read-only reserve,
/// oversized alignment) panic instead and are deliberately not represented
/// here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    /// The kernel or the backing allocator refused to provide memory.
    #[error("out of executable memory")]
    OutOfMemory,
}
