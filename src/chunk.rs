//! Code chunks and the chunk chain.
//!
//! A [`Chunk`] is one contiguous region managed as a bump arena. Its first
//! `bind_room` bytes are reserved at creation for branch-trampoline thunks
//! (jumps whose target is out of immediate-displacement range); the bump
//! cursor therefore starts at `bind_room`, not zero.
//!
//! A [`ChunkChain`] owns every chunk of one code manager. Chunks live in an
//! append-only slab and are referred to by index, so a chunk handle stays
//! valid for the manager's whole lifetime; the `current`/`full` partition is
//! two lists of slab indices.

use std::{
    alloc::{Layout, alloc, dealloc},
    ptr::{self, NonNull},
    sync::atomic::Ordering,
};

use tracing::debug;

use crate::{
    AllocError, MIN_ALIGN, cache,
    events::{self, ChunkEvents},
    utils::align_up,
    vmem,
};

/// Minimum chunk size, in pages.
const MIN_PAGES: usize = 16;

/// Divisor giving the fraction of a chunk set aside as bind room.
const BIND_ROOM: usize = 4;

/// Hard floor for the bind room, in bytes.
const MIN_BIND_ROOM: usize = 32;

/// A current chunk with less slack than this is considered full once the
/// chain has to grow.
const RETIRE_SLACK: usize = MIN_ALIGN * 4;

/// Where a chunk's memory came from. Decides how it is given back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backing {
    /// Page-granular RWX mapping, owned via the region cache.
    Mapped,
    /// Global allocator memory, used for dynamic chunks that are sized to a
    /// single allocation and freed individually.
    Heap,
}

pub(crate) struct Chunk {
    data: NonNull<u8>,
    size: usize,
    /// Next free offset. Invariant: `bind_room <= pos <= size`.
    pos: usize,
    bind_room: usize,
    backing: Backing,
}

impl Chunk {
    /// Creates a chunk able to hold at least `requested` bytes past its bind
    /// room, per the growth policy:
    ///
    /// - dynamic chunks are sized exactly to the request and heap-backed;
    /// - mapped chunks are at least `page_size * MIN_PAGES` rounded to the
    ///   allocation granularity, and placed near `hint` when possible;
    /// - bind room is `chunk_size / BIND_ROOM` (doubled in dynamic mode,
    ///   which has no sibling chunks to borrow thunk space from), floored at
    ///   `MIN_BIND_ROOM`; if the headroom left for the request is smaller
    ///   than that, the chunk is regrown to `request + bind_room`.
    fn new(hint: *mut u8, dynamic: bool, requested: usize) -> Result<Self, AllocError> {
        let granule = vmem::granule();

        let (mut chunk_size, rounded) = if dynamic {
            (requested, requested)
        } else {
            let minsize = (vmem::page_size() * MIN_PAGES).max(granule);
            if requested < minsize {
                (minsize, requested)
            } else {
                // Over-align the request so individual reservations can
                // still be handed out at MIN_ALIGN.
                let rounded = align_up(requested, MIN_ALIGN);
                (align_up(rounded, granule), rounded)
            }
        };

        let mut bind_room = if dynamic {
            chunk_size * 2 / BIND_ROOM
        } else {
            chunk_size / BIND_ROOM
        };
        bind_room = align_up(bind_room.max(MIN_BIND_ROOM), MIN_ALIGN);

        if chunk_size - rounded < bind_room {
            chunk_size = rounded + bind_room;
            if !dynamic {
                chunk_size = align_up(chunk_size, granule);
            }
        }

        let (data, backing) = if dynamic {
            let layout =
                Layout::from_size_align(chunk_size, MIN_ALIGN).map_err(|_| AllocError::OutOfMemory)?;
            let ptr = NonNull::new(unsafe { alloc(layout) }).ok_or(AllocError::OutOfMemory)?;
            // Unresolved thunk slots must read as zero.
            unsafe { ptr.as_ptr().write_bytes(0, bind_room) };
            (ptr, Backing::Heap)
        } else {
            let ptr = cache::acquire(hint, chunk_size).ok_or(AllocError::OutOfMemory)?;
            (ptr, Backing::Mapped)
        };

        Ok(Self {
            data,
            size: chunk_size,
            pos: bind_room,
            bind_room,
            backing,
        })
    }

    #[inline]
    pub(crate) fn base(&self) -> usize {
        self.data.as_ptr() as usize
    }

    #[inline]
    pub(crate) fn end(&self) -> usize {
        self.base() + self.size
    }

    #[inline]
    pub(crate) fn contains(&self, addr: usize) -> bool {
        addr >= self.base() && addr < self.end()
    }

    #[inline]
    pub(crate) fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub(crate) fn pos(&self) -> usize {
        self.pos
    }

    #[inline]
    pub(crate) fn bind_room(&self) -> usize {
        self.bind_room
    }

    /// Bump-allocates `size` bytes at `alignment` from this chunk.
    ///
    /// The chunk base is at least `MIN_ALIGN` aligned (page-aligned for
    /// mapped chunks, layout-aligned for heap ones), so aligning the offset
    /// aligns the returned pointer.
    ///
    /// On success also returns the byte span skipped over by alignment
    /// padding, if any, so the caller can recycle it.
    pub(crate) fn bump(
        &mut self,
        size: usize,
        alignment: usize,
    ) -> Option<(NonNull<u8>, Option<(usize, usize)>)> {
        let aligned = align_up(self.pos, alignment);
        let end = aligned.checked_add(size)?;
        if end > self.size {
            return None;
        }

        let gap = aligned - self.pos;
        let gap_start = self.base() + self.pos;
        self.pos = aligned + size;

        // SAFETY: aligned < self.size, so the offset stays inside the
        // chunk's own buffer.
        let ptr = unsafe { NonNull::new_unchecked(self.data.as_ptr().add(aligned)) };
        Some((ptr, (gap > 0).then_some((gap_start, gap))))
    }

    /// Rolls the bump cursor back by `excess` bytes. Only the code manager's
    /// commit path calls this, and only for the most recent reservation.
    pub(crate) fn rollback(&mut self, excess: usize) {
        debug_assert!(excess <= self.pos - self.bind_room);
        self.pos -= excess;
    }

    /// Overwrites the whole chunk with `byte`. Debugging aid.
    pub(crate) fn fill(&mut self, byte: u8) {
        unsafe { self.data.as_ptr().write_bytes(byte, self.size) };
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        match self.backing {
            Backing::Mapped => cache::release(self.data, self.size),
            Backing::Heap => unsafe {
                dealloc(
                    self.data.as_ptr(),
                    Layout::from_size_align_unchecked(self.size, MIN_ALIGN),
                );
            },
        }
    }
}

/// The set of chunks owned by one code manager, partitioned into `current`
/// (bump-allocatable) and `full` (retired).
pub(crate) struct ChunkChain {
    /// Slab of every chunk ever created. Never shrinks before drop, so slab
    /// indices are stable handles.
    chunks: Vec<Chunk>,
    /// Indices of chunks that may still have bump room, newest first.
    current: Vec<usize>,
    /// Indices of retired chunks.
    full: Vec<usize>,
    /// Most recently created chunk, used as a placement hint so new
    /// mappings land next to it.
    last: Option<usize>,
}

impl ChunkChain {
    pub(crate) fn new() -> Self {
        Self {
            chunks: Vec::new(),
            current: Vec::new(),
            full: Vec::new(),
            last: None,
        }
    }

    #[inline]
    pub(crate) fn has_current(&self) -> bool {
        !self.current.is_empty()
    }

    #[inline]
    pub(crate) fn chunk(&self, index: usize) -> &Chunk {
        &self.chunks[index]
    }

    #[inline]
    pub(crate) fn chunk_mut(&mut self, index: usize) -> &mut Chunk {
        &mut self.chunks[index]
    }

    /// Head of the current list: the chunk reservations are served from
    /// first.
    pub(crate) fn head_mut(&mut self) -> Option<&mut Chunk> {
        let index = *self.current.first()?;
        Some(&mut self.chunks[index])
    }

    pub(crate) fn current_indices(&self) -> Vec<usize> {
        self.current.clone()
    }

    /// Creates a new chunk for `requested` bytes and makes it the head of
    /// the current list. Raises the chunk-created event and the advisory
    /// resource-limit check.
    pub(crate) fn grow(
        &mut self,
        dynamic: bool,
        requested: usize,
        events: &dyn ChunkEvents,
    ) -> Result<usize, AllocError> {
        // Try to place the new chunk right after the last one to help
        // near branches between chunks.
        let hint = self
            .last
            .map_or(ptr::null_mut(), |i| self.chunks[i].end() as *mut u8);

        let chunk = Chunk::new(hint, dynamic, requested)?;
        debug!(
            base = chunk.base(),
            size = chunk.size(),
            bind_room = chunk.bind_room(),
            dynamic,
            "created code chunk"
        );

        events.chunk_created(chunk.base(), chunk.size());
        let total = events::CODE_BYTES.fetch_add(chunk.size(), Ordering::Relaxed) + chunk.size();
        events.resource_limit_check(total);

        let index = self.chunks.len();
        self.chunks.push(chunk);
        self.current.insert(0, index);
        self.last = Some(index);
        Ok(index)
    }

    /// Moves one filled chunk from `current` to `full` so the current list
    /// doesn't grow without bound. A chunk counts as filled once its slack
    /// is below `RETIRE_SLACK`.
    pub(crate) fn retire_filled(&mut self) {
        let filled = self.current.iter().position(|&i| {
            let chunk = &self.chunks[i];
            chunk.pos() + RETIRE_SLACK > chunk.size()
        });

        if let Some(at) = filled {
            let index = self.current.remove(at);
            self.full.insert(0, index);
        }
    }

    /// Address-to-chunk lookup over the current list, then the full list.
    pub(crate) fn find(&self, addr: usize) -> Option<usize> {
        self.current
            .iter()
            .chain(self.full.iter())
            .copied()
            .find(|&i| self.chunks[i].contains(addr))
    }

    /// Every chunk, current list first.
    pub(crate) fn iter_all(&self) -> impl Iterator<Item = &Chunk> {
        self.current
            .iter()
            .chain(self.full.iter())
            .map(|&i| &self.chunks[i])
    }

    pub(crate) fn fill_all(&mut self, byte: u8) {
        for chunk in &mut self.chunks {
            chunk.fill(byte);
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.chunks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopEvents;

    #[test]
    fn small_mapped_chunk_gets_minimum_size() {
        let minsize = (vmem::page_size() * MIN_PAGES).max(vmem::granule());

        let chunk = Chunk::new(ptr::null_mut(), false, 1).expect("chunk creation failed");

        assert_eq!(chunk.size(), minsize);
        assert_eq!(chunk.bind_room(), align_up(minsize / BIND_ROOM, MIN_ALIGN));
        assert_eq!(chunk.pos(), chunk.bind_room());
        assert_eq!(chunk.backing, Backing::Mapped);
    }

    #[test]
    fn dynamic_chunk_is_sized_to_the_request() {
        let chunk = Chunk::new(ptr::null_mut(), true, 100).expect("chunk creation failed");

        // 100 * 2 / BIND_ROOM = 50, rounded to MIN_ALIGN.
        let bind_room = align_up(100 * 2 / BIND_ROOM, MIN_ALIGN);
        assert_eq!(chunk.bind_room(), bind_room);
        assert_eq!(chunk.size(), 100 + bind_room);
        assert_eq!(chunk.backing, Backing::Heap);
    }

    #[test]
    fn dynamic_bind_room_has_a_floor() {
        let chunk = Chunk::new(ptr::null_mut(), true, 8).expect("chunk creation failed");

        assert_eq!(chunk.bind_room(), align_up(MIN_BIND_ROOM, MIN_ALIGN));
        assert_eq!(chunk.size(), 8 + chunk.bind_room());
    }

    #[test]
    fn large_request_keeps_its_headroom() {
        let request = vmem::page_size() * MIN_PAGES * 2;

        let chunk = Chunk::new(ptr::null_mut(), false, request).expect("chunk creation failed");

        assert!(chunk.size() - request >= chunk.bind_room());
        assert_eq!(chunk.size() % vmem::granule(), 0);
    }

    #[test]
    fn bump_respects_alignment_and_reports_gaps() {
        let mut chunk = Chunk::new(ptr::null_mut(), false, 1).expect("chunk creation failed");

        let (first, gap) = chunk.bump(10, 16).expect("bump failed");
        assert_eq!(first.as_ptr() as usize % 16, 0);
        // pos started at the MIN_ALIGN-aligned bind room, so no padding yet.
        assert!(gap.is_none());

        let (second, gap) = chunk.bump(16, 16).expect("bump failed");
        assert_eq!(second.as_ptr() as usize % 16, 0);
        let (gap_start, gap_size) = gap.expect("expected an alignment gap");
        assert_eq!(gap_start, first.as_ptr() as usize + 10);
        assert_eq!(gap_size, 6);
    }

    #[test]
    fn bump_fails_past_the_end() {
        let mut chunk = Chunk::new(ptr::null_mut(), true, 64).expect("chunk creation failed");

        assert!(chunk.bump(64, 16).is_some());
        assert!(chunk.bump(1, 1).is_none());
        assert_eq!(chunk.pos(), chunk.size());
    }

    #[test]
    fn bump_rejects_unrepresentable_sizes() {
        let mut chunk = Chunk::new(ptr::null_mut(), false, 1).expect("chunk creation failed");

        // Would wrap the bounds check if it were computed with plain adds.
        assert!(chunk.bump(usize::MAX - 8, 16).is_none());
        assert_eq!(chunk.pos(), chunk.bind_room());
    }

    #[test]
    fn chain_growth_sets_head_and_last() {
        let mut chain = ChunkChain::new();
        let events = NoopEvents;

        let first = chain.grow(false, 1, &events).expect("grow failed");
        let second = chain.grow(false, 1, &events).expect("grow failed");

        assert_eq!(chain.current_indices(), vec![second, first]);
        assert_eq!(chain.last, Some(second));
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn retire_moves_only_filled_chunks() {
        let mut chain = ChunkChain::new();
        let events = NoopEvents;

        let index = chain.grow(false, 1, &events).expect("grow failed");
        chain.retire_filled();
        assert!(chain.has_current());

        let chunk = chain.chunk_mut(index);
        let slack = chunk.size() - chunk.pos();
        chunk.bump(slack - MIN_ALIGN, 1).expect("bump failed");

        chain.retire_filled();
        assert!(!chain.has_current());
        assert_eq!(chain.full, vec![index]);
    }

    #[test]
    fn find_searches_both_lists() {
        let mut chain = ChunkChain::new();
        let events = NoopEvents;

        let index = chain.grow(false, 1, &events).expect("grow failed");
        let base = chain.chunk(index).base();
        let end = chain.chunk(index).end();

        assert_eq!(chain.find(base), Some(index));
        assert_eq!(chain.find(end - 1), Some(index));
        assert_eq!(chain.find(end), None);

        let chunk = chain.chunk_mut(index);
        let slack = chunk.size() - chunk.pos();
        chunk.bump(slack, 1).expect("bump failed");
        chain.retire_filled();

        assert_eq!(chain.find(base), Some(index));
    }
}
