//! Process-wide cache of released code regions.
//!
//! Keeping a small freelist of recently unmapped regions, bucketed by exact
//! size, decreases pressure on the kernel memory subsystem: most code
//! managers allocate chunks of the same few sizes, so an unmapped chunk is
//! very likely to be asked for again soon.
//!
//! The cache is the one genuinely shared resource of this crate. It is
//! constructed once and every mutation happens under a single mutex scoped
//! to the bucket operation only; the mapping syscalls themselves run outside
//! the critical section.

use std::{collections::HashMap, ptr::NonNull};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::debug;

use crate::vmem;

/// Per-bucket cap. Anything released beyond this is unmapped immediately so
/// the cache can't retain unbounded memory.
const MAX_CACHED_REGIONS: usize = 16;

/// A cached region is unreferenced memory owned by the cache alone, so it is
/// safe to hand between threads.
struct CachedRegion(NonNull<u8>);

unsafe impl Send for CachedRegion {}

static REGIONS: Lazy<Mutex<HashMap<usize, Vec<CachedRegion>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Acquires a read-write-execute region of exactly `size` bytes, reusing a
/// cached one when possible. A cache hit is zero-filled and costs no
/// syscall. On a miss, the kernel is first asked to place the mapping at
/// `hint` (pass null for no preference), then retried unconstrained.
pub(crate) fn acquire(hint: *mut u8, size: usize) -> Option<NonNull<u8>> {
    let cached = REGIONS.lock().get_mut(&size).and_then(Vec::pop);

    if let Some(region) = cached {
        // The previous owner's code is still in there.
        unsafe { region.0.as_ptr().write_bytes(0, size) };
        debug!(size, "region cache hit");
        return Some(region.0);
    }

    let mut region = None;
    if !hint.is_null() {
        region = unsafe { vmem::map(hint, size) };
    }
    if region.is_none() {
        region = unsafe { vmem::map(std::ptr::null_mut(), size) };
    }
    region
}

/// Returns `region` to the cache, or unmaps it right away if its size bucket
/// is already at capacity.
pub(crate) fn release(region: NonNull<u8>, size: usize) {
    {
        let mut buckets = REGIONS.lock();
        let bucket = buckets.entry(size).or_default();
        if bucket.len() < MAX_CACHED_REGIONS {
            bucket.push(CachedRegion(region));
            return;
        }
    }
    unsafe { vmem::unmap(region.as_ptr(), size) };
}

/// Unmaps every cached region. Call at process shutdown, after all code
/// managers are gone; regions released afterwards start filling the cache
/// again.
pub fn purge() {
    let buckets: Vec<(usize, Vec<CachedRegion>)> = REGIONS.lock().drain().collect();

    for (size, bucket) in buckets {
        for region in bucket {
            unsafe { vmem::unmap(region.0.as_ptr(), size) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Sizes no other test allocates, so parallel tests can't race on the
    // same bucket.
    fn lonely_size(pages: usize) -> usize {
        vmem::page_size() * pages
    }

    // Purging empties every bucket, so tests that rely on a region staying
    // cached serialize against it.
    static PURGE_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn released_region_is_reused_and_zeroed() {
        let _guard = PURGE_LOCK.lock();
        let size = lonely_size(37);

        let region = acquire(std::ptr::null_mut(), size).expect("mapping failed");
        unsafe { region.as_ptr().write_bytes(0xEE, size) };

        release(region, size);
        let reused = acquire(std::ptr::null_mut(), size).expect("cache hit failed");

        assert_eq!(reused, region);
        unsafe {
            assert_eq!(*reused.as_ptr(), 0);
            assert_eq!(*reused.as_ptr().add(size - 1), 0);
        }

        release(reused, size);
    }

    #[test]
    fn bucket_is_bounded() {
        let size = lonely_size(41);
        let mut regions = Vec::new();

        for _ in 0..MAX_CACHED_REGIONS + 3 {
            regions.push(acquire(std::ptr::null_mut(), size).expect("mapping failed"));
        }
        for region in regions {
            release(region, size);
        }

        let cached = REGIONS.lock().get(&size).map_or(0, Vec::len);
        assert!(cached <= MAX_CACHED_REGIONS);
    }

    #[test]
    fn purge_unmaps_every_cached_region() {
        let _guard = PURGE_LOCK.lock();
        let size = lonely_size(43);

        let region = acquire(std::ptr::null_mut(), size).expect("mapping failed");
        release(region, size);
        assert!(REGIONS.lock().get(&size).is_some_and(|bucket| !bucket.is_empty()));

        purge();
        assert!(REGIONS.lock().get(&size).is_none());

        // The cache keeps working after a purge.
        let fresh = acquire(std::ptr::null_mut(), size).expect("mapping failed");
        release(fresh, size);
        assert_eq!(REGIONS.lock().get(&size).map_or(0, Vec::len), 1);
    }
}
