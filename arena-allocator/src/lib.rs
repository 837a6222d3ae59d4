//! A linear (bump-pointer) arena over a lazily-committed virtual reservation.
//!
//! The arena reserves a large, contiguous range of address space up front
//! but only commits physical pages as allocations actually touch them, and
//! supports O(1) bulk reset by rewinding a single position counter. There is
//! no per-allocation metadata and no way to free an individual allocation —
//! the whole point of this engine is trading that away for speed and
//! simplicity. See `freelist-allocator` for an engine that frees
//! individually, and `numa-allocator` for one that does both per-thread.
//!
//! Ported from a C reference implementation's reserve/commit bookkeeping;
//! the Rust types make the "single-threaded or externally synchronized"
//! requirement a compile-time fact (`Arena` is `Send` but not `Sync`)
//! instead of a comment.

use std::mem;

use platform::vm;

/// Default alignment used by [`Arena::alloc`]: the machine's pointer size.
pub const DEFAULT_ALIGNMENT: usize = mem::size_of::<usize>();

#[repr(C)]
struct ArenaHeader {
    reserve_size: usize,
    commit_size: usize,
    position: usize,
    commit_position: usize,
}

/// `header_size` in the specification: the number of bytes at the front of
/// the reservation occupied by the arena's own bookkeeping. Callers never
/// see this directly — allocations always start past it.
const HEADER_SIZE: usize = mem::size_of::<ArenaHeader>();

/// A linear arena over a single virtual-memory reservation.
///
/// `Arena` owns the entire reservation and releases it on drop. It is
/// `Send` (it's fine to hand the whole arena to another thread) but not
/// `Sync`: every operation mutates `position`/`commit_position` with no
/// internal synchronization, so concurrent use from multiple threads needs
/// either an external lock or one arena per thread. `base` being a raw
/// pointer already makes `Arena` `!Sync` without needing a marker field for
/// it; only `Send` needs restoring explicitly below, since raw pointers
/// aren't `Send` either.
pub struct Arena {
    base: *mut u8,
}

unsafe impl Send for Arena {}

impl Arena {
    /// Reserves `reserve_size` bytes of address space and commits the first
    /// `commit_size` bytes. Both are rounded up to the page size; `commit`
    /// is clamped to `reserve` if it would otherwise exceed it. Returns
    /// `None` if either size is zero or the OS reservation/commit fails.
    pub fn create(reserve_size: usize, commit_size: usize) -> Option<Arena> {
        if reserve_size == 0 || commit_size == 0 {
            return None;
        }

        let page_size = vm::page_size();
        let reserve_size = vm::align_up(reserve_size, page_size);
        let mut commit_size = vm::align_up(commit_size, page_size);
        if commit_size > reserve_size {
            commit_size = reserve_size;
        }

        let base = vm::reserve(reserve_size).ok()?;
        if let Err(err) = vm::commit(base, commit_size) {
            log::warn!("arena: initial commit failed: {err}");
            let _ = vm::release(base, reserve_size);
            return None;
        }

        unsafe {
            let header = base as *mut ArenaHeader;
            header.write(ArenaHeader {
                reserve_size,
                commit_size,
                position: HEADER_SIZE,
                commit_position: commit_size,
            });
        }

        Some(Arena { base })
    }

    #[inline]
    fn header(&self) -> &ArenaHeader {
        unsafe { &*(self.base as *const ArenaHeader) }
    }

    #[inline]
    fn header_mut(&mut self) -> &mut ArenaHeader {
        unsafe { &mut *(self.base as *mut ArenaHeader) }
    }

    /// Allocates `size` zero-filled bytes aligned to [`DEFAULT_ALIGNMENT`].
    pub fn alloc(&mut self, size: usize) -> Option<*mut u8> {
        self.alloc_aligned(size, DEFAULT_ALIGNMENT)
    }

    /// Allocates `size` zero-filled bytes aligned to `alignment`, which must
    /// be a power of two. Returns `None` (without mutating any state) when
    /// `size` is zero, `alignment` isn't a power of two, or the arena's
    /// reserved capacity would be exceeded.
    pub fn alloc_aligned(&mut self, size: usize, alignment: usize) -> Option<*mut u8> {
        if size == 0 || alignment == 0 || !alignment.is_power_of_two() {
            return None;
        }

        let (reserve_size, commit_size, position, commit_position) = {
            let header = self.header();
            (
                header.reserve_size,
                header.commit_size,
                header.position,
                header.commit_position,
            )
        };

        let aligned = vm::align_up(position, alignment);
        let new_position = aligned.checked_add(size)?;
        if new_position > reserve_size {
            return None;
        }

        if new_position > commit_position {
            let mut new_commit_position = vm::align_up(new_position, commit_size);
            new_commit_position = new_commit_position.min(reserve_size);

            let commit_ptr = unsafe { self.base.add(commit_position) };
            let commit_amount = new_commit_position - commit_position;
            if let Err(err) = vm::commit(commit_ptr, commit_amount) {
                log::warn!("arena: commit growth failed: {err}");
                return None;
            }

            self.header_mut().commit_position = new_commit_position;
        }

        self.header_mut().position = new_position;

        let result = unsafe { self.base.add(aligned) };
        unsafe {
            vm::touch_zero(result, size);
        }
        Some(result)
    }

    /// Rewinds the bump pointer back to just past the embedded header.
    /// Already-committed pages are left committed (no decommit) so the next
    /// round of allocations up to the previous high-water mark is free of
    /// commit-growth overhead.
    pub fn reset(&mut self) {
        self.header_mut().position = HEADER_SIZE;
    }

    /// The next unused byte offset from the arena's base, usable with
    /// [`Arena::set_position`] to implement scoped sub-arenas.
    pub fn get_position(&self) -> usize {
        self.header().position
    }

    /// Restores a position saved from [`Arena::get_position`]. Out-of-range
    /// values (below the header or beyond the reservation) are ignored
    /// silently, matching the reference implementation.
    pub fn set_position(&mut self, position: usize) {
        let reserve_size = self.header().reserve_size;
        if position >= HEADER_SIZE && position <= reserve_size {
            self.header_mut().position = position;
        }
    }

    /// Total reserved capacity, including the header.
    pub fn reserve_size(&self) -> usize {
        self.header().reserve_size
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        let reserve_size = self.header().reserve_size;
        if let Err(err) = vm::release(self.base, reserve_size) {
            log::warn!("arena: failed to release reservation on drop: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_zeroed(ptr: *mut u8, len: usize) -> bool {
        unsafe { std::slice::from_raw_parts(ptr, len).iter().all(|&b| b == 0) }
    }

    #[test]
    fn s1_two_sequential_allocations_are_contiguous_and_zeroed() {
        let mut arena = Arena::create(platform::mib(1) as usize, platform::kib(64) as usize)
            .expect("create");
        let p1 = arena.alloc(128).expect("alloc p1");
        let p2 = arena.alloc(128).expect("alloc p2");

        assert!(is_zeroed(p1, 128));
        assert!(is_zeroed(p2, 128));
        assert_eq!(unsafe { p2.offset_from(p1) }, 128);
    }

    #[test]
    fn s2_oversized_allocation_fails_without_moving_position() {
        let mut arena = Arena::create(platform::kib(64) as usize, platform::kib(16) as usize)
            .expect("create");
        let before = arena.get_position();
        assert!(arena.alloc(platform::mib(1) as usize).is_none());
        assert_eq!(arena.get_position(), before);
    }

    #[test]
    fn s3_custom_alignment_is_honored() {
        let mut arena = Arena::create(platform::mib(1) as usize, platform::kib(64) as usize)
            .expect("create");
        let ptr = arena.alloc_aligned(1, 64).expect("alloc_aligned");
        assert_eq!(ptr as usize % 64, 0);
    }

    #[test]
    fn allocations_are_pairwise_disjoint() {
        let mut arena = Arena::create(platform::mib(1) as usize, platform::kib(64) as usize)
            .expect("create");
        let mut ranges = Vec::new();
        for i in 1..=32usize {
            let size = i * 7;
            let ptr = arena.alloc(size).expect("alloc") as usize;
            ranges.push((ptr, ptr + size));
        }
        for i in 0..ranges.len() {
            for j in (i + 1)..ranges.len() {
                let (a0, a1) = ranges[i];
                let (b0, b1) = ranges[j];
                assert!(a1 <= b0 || b1 <= a0, "ranges overlap: {:?} {:?}", ranges[i], ranges[j]);
            }
        }
    }

    #[test]
    fn reset_rewinds_to_post_header_position() {
        let mut arena = Arena::create(platform::mib(1) as usize, platform::kib(64) as usize)
            .expect("create");
        let initial = arena.get_position();
        arena.alloc(4096).unwrap();
        arena.reset();
        assert_eq!(arena.get_position(), initial);

        let ptr = arena.alloc_aligned(1, 32).unwrap();
        assert_eq!(ptr as usize % 32, 0);
        assert_eq!(arena.get_position(), vm::align_up(initial, 32) + 1);
    }

    #[test]
    fn get_set_position_round_trip_scopes_allocations() {
        let mut arena = Arena::create(platform::mib(1) as usize, platform::kib(64) as usize)
            .expect("create");
        arena.alloc(64).unwrap();
        let checkpoint = arena.get_position();
        arena.alloc(128).unwrap();
        arena.set_position(checkpoint);
        assert_eq!(arena.get_position(), checkpoint);
    }

    #[test]
    fn set_position_out_of_range_is_ignored() {
        let mut arena = Arena::create(platform::mib(1) as usize, platform::kib(64) as usize)
            .expect("create");
        let before = arena.get_position();
        arena.set_position(0);
        assert_eq!(arena.get_position(), before);
        arena.set_position(usize::MAX);
        assert_eq!(arena.get_position(), before);
    }

    #[test]
    fn create_rejects_zero_sizes() {
        assert!(Arena::create(0, 1024).is_none());
        assert!(Arena::create(1024, 0).is_none());
    }

    #[test]
    fn zero_size_alloc_returns_none() {
        let mut arena = Arena::create(platform::mib(1) as usize, platform::kib(64) as usize)
            .expect("create");
        assert!(arena.alloc(0).is_none());
    }

    #[test]
    fn non_power_of_two_alignment_is_rejected() {
        let mut arena = Arena::create(platform::mib(1) as usize, platform::kib(64) as usize)
            .expect("create");
        assert!(arena.alloc_aligned(16, 3).is_none());
    }

    #[test]
    fn commit_grows_past_initial_commit_size() {
        let commit = platform::kib(16) as usize;
        let mut arena = Arena::create(platform::mib(4) as usize, commit).expect("create");
        // Force several commit-growth steps.
        for _ in 0..10 {
            let ptr = arena.alloc(commit).expect("alloc");
            assert!(is_zeroed(ptr, commit));
        }
    }
}
