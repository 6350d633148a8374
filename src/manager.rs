//! The code manager: the allocator façade composing the chunk chain and the
//! free catalogue.
//!
//! A code manager hands out memory suitable for storing native code. Memory
//! comes from the operating system in large chunks so many methods land
//! close together, improving cache locality; within a chunk allocation is a
//! bump cursor. Reuse mode additionally tracks freed ranges so a chunk's
//! address space can be recycled across many allocate/free cycles, and
//! dynamic mode sizes every chunk to a single allocation for code objects
//! that are freed independently.
//!
//! A manager is not internally synchronized. It is meant to be owned by one
//! compiling thread at a time; wrap it in a lock to share it.

use std::{ptr::NonNull, sync::Arc, sync::atomic::Ordering};

use tracing::{debug, warn};

use crate::{
    AllocError, MIN_ALIGN,
    chunk::ChunkChain,
    events::{self, ChunkEvents, NoopEvents},
    freelist::{ChunkSpan, FreeList},
};

pub struct CodeManager {
    dynamic: bool,
    read_only: bool,
    reusable: bool,
    chain: ChunkChain,
    free_list: FreeList,
    events: Arc<dyn ChunkEvents>,
}

// A manager may move to another thread wholesale; its chunk memory has no
// thread affinity. Concurrent access still needs an external lock.
unsafe impl Send for CodeManager {}

impl CodeManager {
    /// Creates a code manager for long-lived code: big shared chunks,
    /// reservations are never returned individually.
    pub fn new() -> Self {
        Self {
            dynamic: false,
            read_only: false,
            reusable: false,
            chain: ChunkChain::new(),
            free_list: FreeList::new(),
            events: Arc::new(NoopEvents),
        }
    }

    /// Creates a code manager for single or small methods that need to be
    /// deallocated independently of other native code: every chunk is sized
    /// to one allocation and heap-backed.
    pub fn new_dynamic() -> Self {
        let mut manager = Self::new();
        manager.dynamic = true;
        manager
    }

    /// Installs the lifecycle collaborator notified of chunk creation,
    /// destruction and code-memory growth.
    pub fn set_events(&mut self, events: Arc<dyn ChunkEvents>) {
        self.events = events;
    }

    /// Enables or disables reuse mode. While enabled, [`free`] tracks
    /// returned ranges and [`reserve_align`] recycles them once bump room
    /// runs out.
    ///
    /// [`free`]: Self::free
    /// [`reserve_align`]: Self::reserve_align
    pub fn set_reusable(&mut self, enabled: bool) {
        self.reusable = enabled;
    }

    /// Makes the manager read only. One-way: any further reservation is a
    /// contract violation and panics.
    pub fn set_read_only(&mut self) {
        self.read_only = true;
    }

    /// Reserves at least `size` bytes at the default code alignment.
    pub fn reserve(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        self.reserve_align(size, MIN_ALIGN)
    }

    /// Reserves at least `size` bytes aligned to `alignment`.
    ///
    /// `alignment` must be a power of two no larger than [`MIN_ALIGN`] and
    /// the manager must not be read only; both are caller contract
    /// violations and panic rather than return an error. Fails only when
    /// the system refuses to provide more memory.
    pub fn reserve_align(
        &mut self,
        size: usize,
        alignment: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        assert!(!self.read_only, "reserve on a read-only code manager");
        assert!(
            alignment.is_power_of_two() && alignment <= MIN_ALIGN,
            "unsupported code alignment {alignment}"
        );

        // A request this large cannot be sized without wrapping the rounding
        // arithmetic below; to the caller it is plain exhaustion.
        if size > usize::MAX / 2 {
            return Err(AllocError::OutOfMemory);
        }

        if self.dynamic {
            events::DYNAMIC_ALLOCS.fetch_add(1, Ordering::Relaxed);
            events::DYNAMIC_BYTES.fetch_add(size, Ordering::Relaxed);
        }

        if !self.chain.has_current() {
            self.chain.grow(self.dynamic, size, &*self.events)?;
        }

        if let Some(ptr) = self.bump_from_current(size, alignment) {
            return Ok(ptr);
        }

        if self.reusable {
            if let Some(addr) = self.free_list.fetch(size, alignment) {
                self.free_list.status();
                // SAFETY: fetched ranges lie inside chunks this manager
                // owns, which are never at address zero.
                return Ok(unsafe { NonNull::new_unchecked(addr as *mut u8) });
            }
        }

        // No room anywhere: retire one filled chunk to keep the current
        // list from growing too much, then grow.
        self.chain.retire_filled();
        self.chain.grow(self.dynamic, size, &*self.events)?;
        self.bump_from_current(size, alignment)
            .ok_or(AllocError::OutOfMemory)
    }

    /// Walks the current chunks and bump-allocates from the first one with
    /// room. A non-zero alignment gap before the returned pointer is
    /// registered as a free range in reuse mode instead of being wasted.
    fn bump_from_current(&mut self, size: usize, alignment: usize) -> Option<NonNull<u8>> {
        for index in self.chain.current_indices() {
            let chunk = self.chain.chunk_mut(index);
            let Some((ptr, gap)) = chunk.bump(size, alignment) else {
                continue;
            };
            let span = ChunkSpan {
                base: chunk.base(),
                end: chunk.end(),
            };

            if self.reusable {
                if let Some((gap_addr, gap_size)) = gap {
                    self.free_list.insert(gap_addr, gap_size, span);
                }
            }
            return Some(ptr);
        }
        None
    }

    /// Returns `[addr, addr + size)` to the manager for later reuse.
    ///
    /// Only meaningful in reuse mode; otherwise a no-op returning false.
    /// Freeing an address this manager doesn't own, or a range that is
    /// already free, is reported and rejected.
    pub fn free(&mut self, addr: *mut u8, size: usize) -> bool {
        if !self.reusable {
            return false;
        }

        let addr = addr as usize;
        let Some(index) = self.chain.find(addr) else {
            warn!(addr, size, "free of an address not owned by this code manager");
            return false;
        };

        let chunk = self.chain.chunk(index);
        let span = ChunkSpan {
            base: chunk.base(),
            end: chunk.end(),
        };

        if !self.free_list.insert(addr, size, span) {
            return false;
        }

        if self.dynamic {
            events::DYNAMIC_FREES.fetch_add(1, Ordering::Relaxed);
        }
        debug!(addr, size, "freed code range");
        self.free_list.status();
        true
    }

    /// Gives back the unused tail of an over-sized reservation.
    ///
    /// Only works when `ptr` is exactly the most recent reservation from
    /// the current chunk: the bump cursor is rolled back by
    /// `reserved - used` bytes. Anything else is a no-op returning false.
    /// `used > reserved` is a contract violation and panics.
    pub fn commit_shrink(&mut self, ptr: *mut u8, reserved: usize, used: usize) -> bool {
        assert!(used <= reserved, "commit of more bytes than were reserved");

        let Some(head) = self.chain.head_mut() else {
            return false;
        };

        if reserved != used && ptr as usize == head.base() + head.pos() - reserved {
            head.rollback(reserved - used);
            return true;
        }
        false
    }

    /// Fills every owned chunk with a trap instruction so any attempt to
    /// execute code held by this manager faults. Debugging aid.
    pub fn invalidate(&mut self) {
        #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
        const FILL: u8 = 0xCC; // int3
        #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
        const FILL: u8 = 0x2A;

        self.chain.fill_all(FILL);
    }

    /// `(total, used)` byte counts: the summed capacity of every owned
    /// chunk, and the summed bump cursors (bind rooms included). Free-list
    /// state does not affect either.
    pub fn size(&self) -> (usize, usize) {
        let mut total = 0;
        let mut used = 0;
        for chunk in self.chain.iter_all() {
            total += chunk.size();
            used += chunk.pos();
        }
        (total, used)
    }

    /// Invokes `visitor(base, size, bind_room)` for every owned chunk,
    /// current list first. Stops early when the visitor returns true.
    pub fn for_each_chunk<F>(&self, mut visitor: F)
    where
        F: FnMut(*mut u8, usize, usize) -> bool,
    {
        for chunk in self.chain.iter_all() {
            if visitor(chunk.base() as *mut u8, chunk.size(), chunk.bind_room()) {
                return;
            }
        }
    }

    /// Logs a usage summary of this manager.
    pub fn stats_dump(&self) {
        let (total, used) = self.size();
        debug!(
            total,
            used,
            chunks = self.chain.len(),
            free_bytes = self.free_list.free_bytes(),
            "code manager stats"
        );
    }
}

impl Default for CodeManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CodeManager {
    fn drop(&mut self) {
        for chunk in self.chain.iter_all() {
            self.events.chunk_destroyed(chunk.base());
            events::CODE_BYTES.fetch_sub(chunk.size(), Ordering::Relaxed);
        }
        // The chain drop returns every chunk to the region cache or the
        // heap per its provenance.
    }
}
