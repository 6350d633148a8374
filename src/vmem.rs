//! Platform layer for executable memory mappings.
//!
//! This trait provides an abstraction to handle the low level mapping
//! operations and syscalls. The rest of the allocator has nothing to do with
//! the concrete APIs offered by each kernel; it only ever asks for
//! read-write-execute regions at page granularity, optionally placed near an
//! address it already owns.

use std::ptr::NonNull;

use once_cell::sync::Lazy;

/// Low level virtual memory operations, implemented per platform.
trait VirtualMemory {
    /// Maps `len` bytes of read-write-execute memory. `hint` is a placement
    /// preference (pass null for none); the kernel is free to ignore it.
    /// Returns `None` if the underlying syscall fails.
    unsafe fn map(hint: *mut u8, len: usize) -> Option<NonNull<u8>>;

    /// Returns the mapping of size `len` starting at `addr` back to the
    /// kernel.
    unsafe fn unmap(addr: *mut u8, len: usize);

    /// Virtual memory page size of the computer in bytes.
    fn query_page_size() -> usize;

    /// Allocation granularity: the boundary mappings are carved on. Equal to
    /// the page size on unix, coarser on windows.
    fn query_granule() -> usize;
}

/// The host platform. The `cfg` modules below implement [`VirtualMemory`]
/// for it.
struct Os;

static PAGE_SIZE: Lazy<usize> = Lazy::new(Os::query_page_size);
static GRANULE: Lazy<usize> = Lazy::new(Os::query_granule);

/// Cached page size.
#[inline]
pub(crate) fn page_size() -> usize {
    *PAGE_SIZE
}

/// Cached allocation granularity.
#[inline]
pub(crate) fn granule() -> usize {
    *GRANULE
}

/// Wrapper for [`VirtualMemory::map`] on the host platform.
#[inline]
pub(crate) unsafe fn map(hint: *mut u8, len: usize) -> Option<NonNull<u8>> {
    unsafe { Os::map(hint, len) }
}

/// Wrapper for [`VirtualMemory::unmap`] on the host platform.
#[inline]
pub(crate) unsafe fn unmap(addr: *mut u8, len: usize) {
    unsafe { Os::unmap(addr, len) }
}

#[cfg(unix)]
mod unix {
    use super::{Os, VirtualMemory};

    use libc::{mmap, munmap, off_t, size_t};

    use std::{
        os::raw::{c_int, c_void},
        ptr::NonNull,
    };

    // Keep chunks in the low 2GB on x86-64 linux so they stay reachable by
    // 32-bit displacement branches from each other.
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    const ARCH_MAP_FLAGS: c_int = libc::MAP_32BIT;
    #[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
    const ARCH_MAP_FLAGS: c_int = 0;

    impl VirtualMemory for Os {
        unsafe fn map(hint: *mut u8, len: usize) -> Option<NonNull<u8>> {
            // Executable memory: the icache is only kept coherent for pages
            // mapped with PROT_EXEC on some processors.
            const PROT: c_int = libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC;
            const FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
            const FD: c_int = -1;
            const OFFSET: off_t = 0;

            unsafe {
                let addr = mmap(
                    hint as *mut c_void,
                    len as size_t,
                    PROT,
                    FLAGS | ARCH_MAP_FLAGS,
                    FD,
                    OFFSET,
                );

                match addr {
                    libc::MAP_FAILED => None,
                    addr => Some(NonNull::new_unchecked(addr).cast::<u8>()),
                }
            }
        }

        unsafe fn unmap(addr: *mut u8, len: usize) {
            unsafe {
                munmap(addr as *mut c_void, len as size_t);
            }
        }

        fn query_page_size() -> usize {
            unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize }
        }

        fn query_granule() -> usize {
            Self::query_page_size()
        }
    }
}

#[cfg(windows)]
mod windows {
    use std::{mem::MaybeUninit, os::raw::c_void, ptr::NonNull};

    use crate::vmem::{Os, VirtualMemory};

    use windows::Win32::System::{Memory, SystemInformation};

    impl VirtualMemory for Os {
        unsafe fn map(hint: *mut u8, len: usize) -> Option<NonNull<u8>> {
            let protection = Memory::PAGE_EXECUTE_READWRITE;
            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

            let preferred = if hint.is_null() {
                None
            } else {
                Some(hint as *const c_void)
            };

            unsafe {
                let addr = Memory::VirtualAlloc(preferred, len, flags, protection);

                NonNull::new(addr.cast())
            }
        }

        unsafe fn unmap(addr: *mut u8, _len: usize) {
            unsafe {
                let _ = Memory::VirtualFree(addr as *mut c_void, 0, Memory::MEM_RELEASE);
            }
        }

        fn query_page_size() -> usize {
            unsafe {
                let mut system_info = MaybeUninit::uninit();
                SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

                system_info.assume_init().dwPageSize as usize
            }
        }

        fn query_granule() -> usize {
            unsafe {
                let mut system_info = MaybeUninit::uninit();
                SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

                system_info.assume_init().dwAllocationGranularity as usize
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_a_power_of_two() {
        assert!(page_size().is_power_of_two());
        assert!(granule() >= page_size());
    }

    #[test]
    fn mapped_region_is_writable() {
        let len = page_size();

        unsafe {
            let region = map(std::ptr::null_mut(), len).expect("mmap failed");

            region.as_ptr().write_bytes(0xAB, len);
            assert_eq!(*region.as_ptr().add(len - 1), 0xAB);

            unmap(region.as_ptr(), len);
        }
    }

    #[test]
    fn hinted_map_still_succeeds_on_taken_address() {
        let len = page_size();

        unsafe {
            let first = map(std::ptr::null_mut(), len).expect("mmap failed");
            // Hinting at an occupied address must not fail outright.
            let second = map(first.as_ptr(), len).expect("hinted mmap failed");

            unmap(first.as_ptr(), len);
            unmap(second.as_ptr(), len);
        }
    }
}
