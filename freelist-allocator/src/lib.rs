//! A general-purpose `malloc`/`free`/`calloc`/`realloc` allocator.
//!
//! Every allocation is backed by its own OS mapping (one `mmap` per
//! first-time request), prefixed with a small header carrying the payload
//! size, a free flag, and a pointer to the next block in a process-wide
//! singly-linked list. `alloc` reuses the first sufficiently large free
//! block (no splitting); `free` only actually unmaps a block when it is the
//! list's tail, otherwise it's left marked free for later reuse. Blocks are
//! never coalesced — this is the documented, intentional contrast with
//! allocators that do (see `numa-allocator`'s size-class engine, which
//! avoids the problem a different way).
//!
//! All state is process-global, guarded by a single `parking_lot::Mutex`
//! that is const-initialized (no racy lazy-init flag, unlike the reference
//! C implementation this engine is ported from).

use std::mem;
use std::ptr::NonNull;

use platform::vm;
use platform::Mutex;

#[repr(C, align(16))]
struct BlockHeader {
    size: usize,
    is_free: bool,
    next: Option<NonNull<BlockHeader>>,
}

/// Header size, padded to a multiple of 16 bytes so that every payload
/// address (header address + this) stays 16-byte aligned given that each
/// block's header itself sits at the start of its own page-aligned `mmap`
/// region.
const HEADER_SIZE: usize = mem::size_of::<BlockHeader>();

struct FreeListState {
    head: Option<NonNull<BlockHeader>>,
    tail: Option<NonNull<BlockHeader>>,
}

impl FreeListState {
    const fn new() -> Self {
        FreeListState {
            head: None,
            tail: None,
        }
    }

    /// First block whose free flag is set and whose payload is big enough.
    fn find_free_block(&self, size: usize) -> Option<NonNull<BlockHeader>> {
        let mut current = self.head;
        while let Some(block) = current {
            let block_ref = unsafe { block.as_ref() };
            if block_ref.is_free && block_ref.size >= size {
                return Some(block);
            }
            current = block_ref.next;
        }
        None
    }

    fn append(&mut self, block: NonNull<BlockHeader>) {
        match self.tail {
            Some(mut tail) => unsafe {
                tail.as_mut().next = Some(block);
            },
            None => self.head = Some(block),
        }
        self.tail = Some(block);
    }

    /// Predecessor of `target` found by a linear walk from `head` — used
    /// only when detaching the tail, matching the reference
    /// implementation's O(n) rewind rather than keeping a doubly-linked
    /// list for an operation that's rare in practice (workloads that mostly
    /// grow the list don't often free the newest block).
    fn predecessor_of(&self, target: NonNull<BlockHeader>) -> Option<NonNull<BlockHeader>> {
        let mut current = self.head;
        while let Some(block) = current {
            let next = unsafe { block.as_ref().next };
            if next == Some(target) {
                return Some(block);
            }
            current = next;
        }
        None
    }
}

static STATE: Mutex<FreeListState> = Mutex::new(FreeListState::new());

fn header_of(ptr: *mut u8) -> NonNull<BlockHeader> {
    unsafe { NonNull::new_unchecked(ptr.sub(HEADER_SIZE) as *mut BlockHeader) }
}

fn payload_of(header: NonNull<BlockHeader>) -> *mut u8 {
    unsafe { (header.as_ptr() as *mut u8).add(HEADER_SIZE) }
}

/// Allocates `size` bytes. Returns a null pointer when `size` is zero or
/// the allocator is out of OS resources; otherwise the returned payload is
/// 16-byte aligned and uninitialized (not zeroed — see [`calloc`] for
/// zero-filled allocation).
pub fn alloc(size: usize) -> *mut u8 {
    if size == 0 {
        return std::ptr::null_mut();
    }

    let mut state = STATE.lock();
    if let Some(mut block) = state.find_free_block(size) {
        unsafe {
            block.as_mut().is_free = false;
        }
        return payload_of(block);
    }

    let total_size = HEADER_SIZE + size;
    let base = match vm::map_committed(total_size) {
        Ok(base) => base,
        Err(err) => {
            log::warn!("freelist: failed to map {} bytes: {err}", total_size);
            return std::ptr::null_mut();
        }
    };

    let header = base as *mut BlockHeader;
    unsafe {
        header.write(BlockHeader {
            size,
            is_free: false,
            next: None,
        });
    }
    let header = unsafe { NonNull::new_unchecked(header) };
    state.append(header);

    payload_of(header)
}

/// Frees a pointer previously returned by [`alloc`], [`calloc`] or
/// [`realloc`]. A null pointer is a no-op. If the block is the list's tail
/// its OS mapping is released immediately and the tail pointer rewound;
/// otherwise the block is left in the list, marked free for reuse by a
/// later [`alloc`] of equal or smaller size.
pub fn free(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }

    let header = header_of(ptr);
    let mut state = STATE.lock();

    if state.tail == Some(header) {
        let predecessor = if state.head == Some(header) {
            None
        } else {
            state.predecessor_of(header)
        };

        match predecessor {
            Some(mut pred) => unsafe {
                pred.as_mut().next = None;
            },
            None => state.head = None,
        }
        state.tail = predecessor;

        let total_size = HEADER_SIZE + unsafe { header.as_ref().size };
        if let Err(err) = vm::release(header.as_ptr() as *mut u8, total_size) {
            log::warn!("freelist: failed to release tail block: {err}");
        }
    } else {
        unsafe {
            (*header.as_ptr()).is_free = true;
        }
    }
}

/// Allocates `num * size` zero-filled bytes. Returns null on overflow
/// (detected the same way the reference implementation does: dividing the
/// product back by `num` and checking it reproduces `size`) or if either
/// argument is zero.
pub fn calloc(num: usize, size: usize) -> *mut u8 {
    if num == 0 || size == 0 {
        return std::ptr::null_mut();
    }

    let total = match num.checked_mul(size) {
        Some(total) if total / num == size => total,
        _ => return std::ptr::null_mut(),
    };

    let ptr = alloc(total);
    if !ptr.is_null() {
        unsafe {
            vm::touch_zero(ptr, total);
        }
    }
    ptr
}

/// Resizes an allocation. A null `ptr` behaves like [`alloc`] (so
/// `realloc(null, 0)` returns null, exactly like `alloc(0)` — this is
/// deliberately preserved from the reference implementation rather than
/// "fixed" into allocating a zero-byte object). When the existing block's
/// payload is already at least `size`, the same pointer is returned
/// unchanged; otherwise a new block is allocated, the old payload is
/// copied, and the old block is freed.
pub fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
    if ptr.is_null() {
        return alloc(size);
    }

    let header = header_of(ptr);
    let old_size = unsafe { header.as_ref().size };
    if old_size >= size {
        return ptr;
    }

    let new_ptr = alloc(size);
    if !new_ptr.is_null() {
        unsafe {
            std::ptr::copy_nonoverlapping(ptr, new_ptr, old_size);
        }
        free(ptr);
    }
    new_ptr
}

#[cfg(test)]
mod tests {
    use super::*;

    // All tests in this module allocate/free against the single
    // process-global `STATE` list, and `cargo test` runs `#[test]` fns
    // concurrently across threads by default. A handful of these tests
    // (the `freeing_*` ones below) assert on the *exact identity* of a
    // pointer handed back by a subsequent `alloc`, which only holds if no
    // other thread's concurrently-running test can steal the same
    // sufficiently-large free block in between — first-fit means any free
    // block at least as big as a request can satisfy it, not just
    // exact-size matches. Every test below takes this guard first so the
    // whole module runs serially instead of racing on shared global state.
    static TEST_SERIAL: Mutex<()> = Mutex::new(());

    #[test]
    fn s4_realloc_grow_preserves_prefix() {
        let _guard = TEST_SERIAL.lock();
        let p = alloc(50);
        assert!(!p.is_null());
        unsafe {
            for i in 0..50u8 {
                *p.add(i as usize) = i;
            }
        }
        let p2 = realloc(p, 100);
        assert!(!p2.is_null());
        unsafe {
            for i in 0..50u8 {
                assert_eq!(*p2.add(i as usize), i);
            }
        }
        free(p2);
    }

    #[test]
    fn s5_degenerate_inputs() {
        let _guard = TEST_SERIAL.lock();
        assert!(alloc(0).is_null());
        free(std::ptr::null_mut());
        assert!(calloc(usize::MAX / 2, 4).is_null());
    }

    #[test]
    fn payload_is_sixteen_byte_aligned_and_writable() {
        let _guard = TEST_SERIAL.lock();
        let p = alloc(37);
        assert_eq!(p as usize % 16, 0);
        unsafe {
            std::ptr::write_bytes(p, 0xAB, 37);
            assert_eq!(*p, 0xAB);
        }
        free(p);
    }

    #[test]
    fn calloc_zeroes_payload() {
        let _guard = TEST_SERIAL.lock();
        let p = calloc(8, 4);
        assert!(!p.is_null());
        unsafe {
            let bytes = std::slice::from_raw_parts(p, 32);
            assert!(bytes.iter().all(|&b| b == 0));
        }
        free(p);
    }

    #[test]
    fn realloc_null_behaves_like_alloc() {
        let _guard = TEST_SERIAL.lock();
        let p = realloc(std::ptr::null_mut(), 16);
        assert!(!p.is_null());
        free(p);
    }

    #[test]
    fn realloc_null_zero_returns_null() {
        let _guard = TEST_SERIAL.lock();
        assert!(realloc(std::ptr::null_mut(), 0).is_null());
    }

    #[test]
    fn realloc_shrink_returns_same_pointer() {
        let _guard = TEST_SERIAL.lock();
        let p = alloc(100);
        let p2 = realloc(p, 10);
        assert_eq!(p, p2);
        free(p2);
    }

    #[test]
    fn freeing_non_tail_block_marks_free_and_is_reusable() {
        let _guard = TEST_SERIAL.lock();
        let a = alloc(64);
        let b = alloc(64);
        // `a` is not the tail (`b` is); freeing it should mark it free,
        // not unmap it, and a same-size alloc should reuse it.
        free(a);
        let c = alloc(64);
        assert_eq!(a, c);
        free(b);
        free(c);
    }

    #[test]
    fn freeing_tail_rewinds_tail_pointer() {
        let _guard = TEST_SERIAL.lock();
        let a = alloc(48);
        let b = alloc(48);
        free(b);
        // `b` was the tail and got unmapped; a fresh same-size request must
        // not collide with `a` (which is still live) and should map new
        // memory rather than reuse unmapped space.
        let c = alloc(48);
        assert_ne!(a, c);
        free(a);
        free(c);
    }
}
