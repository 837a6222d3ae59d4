//! Reserve / commit / release of anonymous virtual memory.
//!
//! Mirrors the POSIX branch of the original C allocator's platform shim
//! (`mmap(PROT_NONE)` to reserve, `mprotect` to commit, `munmap` to release)
//! rather than going through `libc::malloc`/`std::alloc` — the arena and
//! NUMA engines both need raw, page-granular control over when memory is
//! backed by physical pages.

use std::ffi::c_void;
use std::sync::OnceLock;

use crate::error::PlatformError;

/// The system page size, queried once via `sysconf(_SC_PAGESIZE)`.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        let value = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if value > 0 {
            value as usize
        } else {
            4096
        }
    })
}

/// Rounds `value` up to the next multiple of `alignment`, which must be a power of two.
#[inline]
pub fn align_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (value + (alignment - 1)) & !(alignment - 1)
}

/// Reserves `size` bytes of address space without backing them with physical
/// pages (`PROT_NONE`). The returned pointer is page-aligned.
pub fn reserve(size: usize) -> Result<*mut u8, PlatformError> {
    unsafe {
        let ptr = libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        );
        if ptr == libc::MAP_FAILED {
            log::warn!("platform: failed to reserve {} bytes", size);
            Err(PlatformError::ReserveFailed)
        } else {
            Ok(ptr as *mut u8)
        }
    }
}

/// Commits (makes readable/writable) `size` bytes starting at `ptr`, which
/// must lie within a prior [`reserve`]d region.
pub fn commit(ptr: *mut u8, size: usize) -> Result<(), PlatformError> {
    unsafe {
        let result = libc::mprotect(ptr as *mut c_void, size, libc::PROT_READ | libc::PROT_WRITE);
        if result == 0 {
            Ok(())
        } else {
            log::warn!("platform: failed to commit {} bytes", size);
            Err(PlatformError::CommitFailed)
        }
    }
}

/// Releases an entire reservation previously obtained from [`reserve`].
pub fn release(ptr: *mut u8, size: usize) -> Result<(), PlatformError> {
    unsafe {
        let result = libc::munmap(ptr as *mut c_void, size);
        if result == 0 {
            Ok(())
        } else {
            log::warn!("platform: failed to release {} bytes", size);
            Err(PlatformError::ReleaseFailed)
        }
    }
}

/// Maps `size` bytes of fresh, already-committed anonymous memory in one
/// call (`mmap` without `PROT_NONE`) — used by engines that don't need the
/// separate reserve/commit staging the arena engine does.
pub fn map_committed(size: usize) -> Result<*mut u8, PlatformError> {
    unsafe {
        let ptr = libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        );
        if ptr == libc::MAP_FAILED {
            Err(PlatformError::ReserveFailed)
        } else {
            Ok(ptr as *mut u8)
        }
    }
}

/// Zeroes `len` bytes at `ptr`. Used both to satisfy the arena's
/// zero-on-allocation contract and to force first-touch placement of a
/// freshly mapped NUMA pool.
///
/// # Safety
/// `ptr` must be valid for writes of `len` bytes.
#[inline]
pub unsafe fn touch_zero(ptr: *mut u8, len: usize) {
    std::ptr::write_bytes(ptr, 0, len);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_plausible() {
        let ps = page_size();
        assert!(ps.is_power_of_two());
        assert!(ps >= 4096);
    }

    #[test]
    fn align_up_rounds_correctly() {
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(1, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 64), 128);
    }

    #[test]
    fn reserve_commit_release_round_trip() {
        let ps = page_size();
        let size = ps * 4;
        let ptr = reserve(size).expect("reserve");
        commit(ptr, ps).expect("commit");
        unsafe {
            touch_zero(ptr, ps);
            assert_eq!(*ptr, 0);
            *ptr = 7;
            assert_eq!(*ptr, 7);
        }
        release(ptr, size).expect("release");
    }
}
