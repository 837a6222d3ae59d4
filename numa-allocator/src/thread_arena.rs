//! The per-thread arena: the lock-free fast path this engine exists for.
//!
//! Each thread lazily creates exactly one [`ThreadArena`] on its first call
//! into this crate, binds it to the NUMA node of the CPU it happened to be
//! running on at that moment, and never rebinds it — even if the OS later
//! migrates the thread to a different node. The arena is never destroyed;
//! it leaks (bounded by thread count) at thread exit, matching the
//! specification's explicitly accepted `Unborn -> Active` state machine.

use std::cell::RefCell;
use std::ptr::NonNull;

use crate::header::NUM_SIZE_CLASSES;

/// An intrusive free-list node: the first `size_of::<usize>()` bytes of an
/// otherwise-unused block are reinterpreted as a pointer to the next free
/// block in the same size class. This is why a freed block must be at
/// least pointer-sized — true for every class in [`crate::header::SIZE_CLASSES`].
#[repr(C)]
pub(crate) struct FreeListNode {
    pub next: Option<NonNull<FreeListNode>>,
}

pub(crate) struct ThreadArena {
    pub node: usize,
    pub free_lists: [Option<NonNull<FreeListNode>>; NUM_SIZE_CLASSES],
    pub stats_allocs: u64,
    pub stats_frees: u64,
}

impl ThreadArena {
    fn new(node: usize) -> Self {
        ThreadArena {
            node,
            free_lists: [None; NUM_SIZE_CLASSES],
            stats_allocs: 0,
            stats_frees: 0,
        }
    }
}

thread_local! {
    static ARENA: RefCell<Option<ThreadArena>> = const { RefCell::new(None) };
}

/// Runs `f` with the calling thread's arena, creating it on first use. The
/// `node_for_creation` closure is only invoked (and only then does it need
/// to consult the global topology, which requires a lock) when this is
/// genuinely the first call on this thread — every subsequent call hits the
/// already-built arena and never touches global state at all.
pub(crate) fn with_arena<R>(
    node_for_creation: impl FnOnce() -> usize,
    f: impl FnOnce(&mut ThreadArena) -> R,
) -> R {
    ARENA.with(|cell| {
        let mut slot = cell.borrow_mut();
        let arena = slot.get_or_insert_with(|| ThreadArena::new(node_for_creation()));
        f(arena)
    })
}

/// The true fast path: if the calling thread already has an arena and its
/// free list for `class` is non-empty, pops a block without consulting
/// global state at all. Returns `None` when either condition fails, leaving
/// it to the caller to fall back to the slower, state-consulting path.
pub(crate) fn try_fast_alloc(class: u8) -> Option<*mut u8> {
    ARENA.with(|cell| {
        let mut slot = cell.borrow_mut();
        let arena = slot.as_mut()?;
        let block = arena.free_lists[class as usize].take()?;
        arena.free_lists[class as usize] = unsafe { block.as_ref().next };
        arena.stats_allocs += 1;
        Some(block.as_ptr() as *mut u8)
    })
}

/// Pushes `ptr` onto the calling thread's free list for `class` without
/// touching global state, returning `false` if this thread has no arena yet
/// (its first call was a free rather than an alloc, or it hasn't allocated
/// at all) so the caller can create one on the slow path instead.
pub(crate) fn try_fast_free(class: u8, ptr: *mut u8) -> bool {
    ARENA.with(|cell| {
        let mut slot = cell.borrow_mut();
        match slot.as_mut() {
            Some(arena) => {
                let node_ptr = ptr as *mut FreeListNode;
                unsafe {
                    (*node_ptr).next = arena.free_lists[class as usize];
                }
                arena.free_lists[class as usize] = Some(unsafe { NonNull::new_unchecked(node_ptr) });
                arena.stats_frees += 1;
                true
            }
            None => false,
        }
    })
}

/// Stats for the calling thread only, or `(0, 0)` if it has never allocated
/// through this crate.
pub(crate) fn current_thread_stats() -> (u64, u64) {
    ARENA.with(|cell| match cell.borrow().as_ref() {
        Some(arena) => (arena.stats_allocs, arena.stats_frees),
        None => (0, 0),
    })
}
