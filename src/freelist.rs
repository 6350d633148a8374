//! Catalogue of freed byte ranges inside a code manager's chunks.
//!
//! The catalogue is not globally sorted: ranges are grouped by the chunk
//! they fall in (an address-span membership test, not a chunk pointer), and
//! kept in ascending address order within each group so adjacent frees can
//! be coalesced. Insertion merges with the neighbor on either side; a merge
//! forward additionally absorbs the next entry when the extension has made
//! it contiguous. Fetching is best-fit with an exact-fit short-circuit, and
//! splits a partially consumed range back into the catalogue.
//!
//! Ranges live in a plain vector, so "recycling a node" is simply removing
//! an entry; no zero-size placeholder entries exist.

use tracing::{debug, warn};

use crate::utils::align_up;

/// Address bounds of the chunk a free range falls in, copied into every
/// range so membership tests don't need the chunk table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ChunkSpan {
    pub base: usize,
    pub end: usize,
}

impl ChunkSpan {
    #[inline]
    fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.end
    }
}

/// One contiguous freed span `[pos, pos + size)`. Live ranges never overlap.
#[derive(Debug, Clone, Copy)]
struct FreeRange {
    pos: usize,
    size: usize,
    span: ChunkSpan,
}

impl FreeRange {
    #[inline]
    fn end(&self) -> usize {
        self.pos + self.size
    }
}

pub(crate) struct FreeList {
    ranges: Vec<FreeRange>,
}

impl FreeList {
    pub(crate) fn new() -> Self {
        Self { ranges: Vec::new() }
    }

    /// Registers `[addr, addr + size)` as free, where the range lies inside
    /// the chunk bounded by `span`.
    ///
    /// Coalesces with an adjacent range on either side when one exists.
    /// Freeing the exact start of an already-free range is a double free:
    /// it is reported and rejected so the catalogue stays consistent.
    pub(crate) fn insert(&mut self, addr: usize, size: usize, span: ChunkSpan) -> bool {
        if self.ranges.is_empty() {
            self.ranges.push(FreeRange { pos: addr, size, span });
            return true;
        }

        for i in 0..self.ranges.len() {
            let range = self.ranges[i];
            if !span.contains(range.pos) {
                continue;
            }

            if addr == range.pos {
                warn!(addr, size, "range is already free, rejecting double free");
                return false;
            }

            if range.end() == addr {
                // Grows forward; the entry after may now be contiguous too.
                self.ranges[i].size += size;
                if i + 1 < self.ranges.len() {
                    let next = self.ranges[i + 1];
                    if span.contains(next.pos) && next.pos == self.ranges[i].end() {
                        self.ranges[i].size += next.size;
                        self.ranges.remove(i + 1);
                    }
                }
                return true;
            }

            if addr + size == range.pos {
                self.ranges[i].pos = addr;
                self.ranges[i].size += size;
                return true;
            }
        }

        let at = self.insertion_index(addr, span);
        self.ranges.insert(at, FreeRange { pos: addr, size, span });
        true
    }

    /// Position keeping the new range in ascending address order within its
    /// chunk's group. Ranges of other chunks are left where they are; a
    /// range for a chunk with no group yet goes after the last entry
    /// scanned.
    fn insertion_index(&self, addr: usize, span: ChunkSpan) -> usize {
        let mut after = None;
        let mut in_group = false;

        for (i, range) in self.ranges.iter().enumerate() {
            if span.contains(range.pos) {
                in_group = true;
                if range.pos > addr {
                    break;
                }
                after = Some(i);
            } else if in_group {
                break;
            } else {
                after = Some(i);
            }
        }

        after.map_or(0, |i| i + 1)
    }

    /// Finds a free range able to hold `size` bytes at `alignment` and
    /// consumes it, returning the aligned address.
    ///
    /// An exact fit (aligned start at the range start, sizes equal) wins
    /// immediately; otherwise the smallest qualifying range wins, ties going
    /// to the earliest-seen entry. A partially consumed range is shrunk, or
    /// split with the remainder re-inserted so it keeps coalescing.
    pub(crate) fn fetch(&mut self, size: usize, alignment: usize) -> Option<usize> {
        let mut best = None;
        let mut best_size = usize::MAX;

        for (i, range) in self.ranges.iter().enumerate() {
            let aligned = align_up(range.pos, alignment);
            let Some(end) = aligned.checked_add(size) else {
                continue;
            };
            if end > range.end() {
                continue;
            }
            if aligned == range.pos && range.size == size {
                best = Some(i);
                break;
            }
            if range.size < best_size {
                best_size = range.size;
                best = Some(i);
            }
        }

        let i = best?;
        let range = self.ranges[i];
        let addr = align_up(range.pos, alignment);

        if addr == range.pos && range.size == size {
            self.ranges.remove(i);
        } else if addr + size == range.end() {
            // Consumed through the end: only the alignment lead-in remains.
            self.ranges[i].size -= size;
        } else {
            let lead = addr - range.pos;
            let tail = range.size - lead - size;
            if lead != 0 {
                // Split: keep the lead-in here, re-insert the tail so it
                // takes part in future coalescing.
                self.ranges[i].size = lead;
                self.insert(addr + size, tail, range.span);
            } else {
                self.ranges[i].pos = addr + size;
                self.ranges[i].size = tail;
            }
        }

        debug!(addr, size, "reusing freed code range");
        Some(addr)
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Total bytes tracked as free.
    pub(crate) fn free_bytes(&self) -> usize {
        self.ranges.iter().map(|range| range.size).sum()
    }

    /// `(pos, size)` of every catalogued range, in catalogue order.
    pub(crate) fn ranges(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.ranges.iter().map(|range| (range.pos, range.size))
    }

    /// Logs a summary of the catalogue.
    pub(crate) fn status(&self) {
        debug!(
            ranges = self.len(),
            free_bytes = self.free_bytes(),
            "free catalogue status"
        );
    }
}
