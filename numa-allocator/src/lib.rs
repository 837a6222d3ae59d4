//! A NUMA-aware, thread-local, size-class allocator.
//!
//! On `init`, topology is discovered and one backing pool is reserved per
//! NUMA node, first-touched so the kernel actually places it there. Every
//! allocating thread lazily creates its own arena on first use, bound
//! forever to the node of the CPU it happened to observe at that moment.
//! Small requests (`<= 2048` bytes) are rounded into one of eight size
//! classes and served from that thread's private free list — a true
//! lock-free fast path, since the list has exactly one owner. Underflow
//! triggers a batch refill of 64 blocks from the thread's node pool, guarded
//! by that pool's own mutex only for the duration of the carve. Large
//! requests bypass size classes entirely and go straight to a dedicated
//! mapping, preferring huge pages once the mapping reaches 2 MiB.
//!
//! Ported from a C reference implementation (`numalloc`/`numalloc_free`/…);
//! see `platform::numa` for the topology-discovery and node-placement
//! primitives this engine is built on.

mod header;
mod state;
mod thread_arena;

use std::ptr::NonNull;

use platform::vm;

use header::{AllocationHeader, HEADER_SIZE, REFILL_BATCH, SIZE_CLASSES};
use state::NodePool;
use thread_arena::{try_fast_alloc, try_fast_free, with_arena, FreeListNode, ThreadArena};

pub use state::{cleanup, init, print_topology, InitError};

/// Per-thread allocation/free counters, as returned by [`get_thread_stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadStats {
    pub allocs: u64,
    pub frees: u64,
}

/// Allocates `size` bytes from the calling thread's NUMA-local arena.
/// Returns a null pointer when `size` is zero, the allocator hasn't been
/// [`init`]-ed, the local node pool is exhausted, or the large-block OS
/// mapping fails.
pub fn alloc(size: usize) -> *mut u8 {
    if size == 0 {
        return std::ptr::null_mut();
    }

    let class = header::size_class_of(size);

    // TRUE FAST PATH: an existing arena with stock in its free list needs
    // no lock and no global state lookup at all.
    if let Some(class) = class {
        if let Some(ptr) = try_fast_alloc(class) {
            return ptr;
        }
    }

    // SLOW PATH: either a large request, or this class/thread needs a
    // refill (or an arena) from global, lock-guarded state.
    let result = state::with_state(|numa_state| {
        with_arena(
            || platform::numa::current_cpu_node(&numa_state.topology),
            |arena| match class {
                Some(class) => alloc_small(numa_state, arena, class),
                None => alloc_large(&numa_state.node_pools, arena.node, size),
            },
        )
    });

    match result.flatten() {
        Some(ptr) => ptr,
        None => std::ptr::null_mut(),
    }
}

/// Runs only once the true fast path in [`alloc`] has already missed: either
/// this thread's arena was just created, or its free list for `class` was
/// empty and needs a refill from the bound node's pool.
fn alloc_small(state: &state::NumaState, arena: &mut ThreadArena, class: u8) -> Option<*mut u8> {
    if let Some(block) = arena.free_lists[class as usize].take() {
        arena.free_lists[class as usize] = unsafe { block.as_ref().next };
        arena.stats_allocs += 1;
        return Some(block.as_ptr() as *mut u8);
    }

    let pool = state.node_pools.get(arena.node)?;
    let ptr = refill(pool, arena, class)?;
    arena.stats_allocs += 1;
    Some(ptr)
}

/// Carves a batch of [`REFILL_BATCH`] same-class blocks out of `pool`,
/// links them into `arena`'s free list for `class`, and returns one.
fn refill(pool: &NodePool, arena: &mut ThreadArena, class: u8) -> Option<*mut u8> {
    let block_size = SIZE_CLASSES[class as usize];
    let stride = HEADER_SIZE + block_size;
    let total_needed = stride * REFILL_BATCH;

    let batch_start = pool.reserve(total_needed)?;

    // Carving happens outside the pool's mutex: the reserved span is now
    // exclusively owned by this call, so no other thread can observe it
    // until we publish pointers into it below.
    let mut free_head: Option<NonNull<FreeListNode>> = None;
    for i in 0..REFILL_BATCH {
        let block_base = unsafe { batch_start.add(i * stride) };
        let header = block_base as *mut AllocationHeader;
        unsafe {
            header.write(AllocationHeader {
                size: block_size,
                size_class: Some(class),
                node: pool.node_id,
            });
        }
        let payload = unsafe { block_base.add(HEADER_SIZE) } as *mut FreeListNode;
        unsafe {
            payload.write(FreeListNode { next: free_head });
        }
        free_head = Some(unsafe { NonNull::new_unchecked(payload) });
    }

    let result = free_head?;
    arena.free_lists[class as usize] = unsafe { result.as_ref().next };
    Some(result.as_ptr() as *mut u8)
}

fn alloc_large(node_pools: &[NodePool], node: usize, size: usize) -> Option<*mut u8> {
    let total = size.checked_add(HEADER_SIZE)?;
    let mapped_len = if total >= platform::numa::HUGE_PAGE_SIZE {
        vm::align_up(total, platform::numa::HUGE_PAGE_SIZE)
    } else {
        total
    };

    let base = platform::numa::map_large(node, mapped_len).ok()?;
    let header = base as *mut AllocationHeader;
    unsafe {
        header.write(AllocationHeader {
            size: mapped_len,
            size_class: None,
            node,
        });
    }
    let _ = node_pools; // node pools aren't touched by the large path; kept for symmetry with alloc_small's signature.
    Some(unsafe { base.add(HEADER_SIZE) })
}

fn header_of(ptr: *mut u8) -> &'static AllocationHeader {
    unsafe { &*(ptr.sub(HEADER_SIZE) as *const AllocationHeader) }
}

/// Frees a pointer previously returned by [`alloc`], [`calloc`] or
/// [`realloc`]. A null pointer is a no-op.
///
/// Large blocks are unmapped immediately. Small blocks are pushed onto the
/// *calling* thread's free list for their size class — if that's a
/// different thread than the one that allocated the block, the block
/// becomes permanently reusable only by the freeing thread and is
/// (incorrectly, but by design — see the crate-level limitation note)
/// recorded as resident on the freeing thread's node rather than its
/// original node. This engine does not correct that; see
/// [the module-level docs](self) and `DESIGN.md` for the rationale.
pub fn free(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }

    let header = header_of(ptr);
    match header.size_class {
        None => {
            let total_size = header.size;
            if let Err(err) = vm::release(unsafe { ptr.sub(HEADER_SIZE) }, total_size) {
                log::warn!("numa: failed to release large block: {err}");
            }
        }
        Some(class) => {
            // TRUE FAST PATH: this thread already has an arena, so the push
            // needs no lock and no global state lookup.
            if try_fast_free(class, ptr) {
                return;
            }

            // SLOW PATH: this is the freeing thread's first call into the
            // crate (it allocated nothing itself, or this is its very first
            // operation), so an arena has to be created first.
            with_arena(
                || state::with_state(|s| platform::numa::current_cpu_node(&s.topology)).unwrap_or(0),
                |arena| {
                    let node_ptr = ptr as *mut FreeListNode;
                    unsafe {
                        (*node_ptr).next = arena.free_lists[class as usize];
                    }
                    arena.free_lists[class as usize] = Some(unsafe { NonNull::new_unchecked(node_ptr) });
                    arena.stats_frees += 1;
                },
            );
        }
    }
}

/// Allocates `num * size` zero-filled bytes. Returns null on overflow or if
/// either argument is zero, exactly like [`freelist_allocator::calloc`] — the
/// same contract, a different engine underneath.
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

/// Resizes an allocation. Unlike the free-list engine, `realloc(ptr, 0)`
/// frees `ptr` and returns null (this matches the reference NUMA
/// implementation exactly, which differs from its own free-list sibling on
/// this point — the two engines were never meant to share one realloc
/// contract). A null `ptr` behaves like [`alloc`].
pub fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
    if ptr.is_null() {
        return alloc(size);
    }
    if size == 0 {
        free(ptr);
        return std::ptr::null_mut();
    }

    let header = header_of(ptr);
    let old_capacity = match header.size_class {
        Some(class) => SIZE_CLASSES[class as usize],
        None => header.size - HEADER_SIZE,
    };

    if size <= old_capacity {
        return ptr;
    }

    let new_ptr = alloc(size);
    if !new_ptr.is_null() {
        unsafe {
            std::ptr::copy_nonoverlapping(ptr, new_ptr, old_capacity);
        }
        free(ptr);
    }
    new_ptr
}

/// Allocation/free counters for the calling thread only, `(0, 0)` if it has
/// never allocated through this crate.
pub fn get_thread_stats() -> ThreadStats {
    let (allocs, frees) = thread_arena::current_thread_stats();
    ThreadStats { allocs, frees }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Once;

    static INIT: Once = Once::new();

    fn ensure_init() {
        INIT.call_once(|| {
            init(platform::mib(64) as usize).expect("init");
        });
    }

    #[test]
    fn s6_same_thread_alloc_free_alloc_is_lifo() {
        ensure_init();
        let p1 = alloc(64);
        assert!(!p1.is_null());
        free(p1);
        let p2 = alloc(64);
        assert_eq!(p1, p2);
        free(p2);
    }

    #[test]
    fn small_block_payload_matches_class_nominal_size() {
        ensure_init();
        let p = alloc(50);
        let header = header_of(p);
        assert_eq!(header.size, 64); // smallest class >= 50
        assert_eq!(header.size_class, Some(2));
        free(p);
    }

    #[test]
    fn large_block_carries_sentinel_and_rounded_length() {
        ensure_init();
        let size = platform::mib(4) as usize;
        let p = alloc(size);
        assert!(!p.is_null());
        let header = header_of(p);
        assert_eq!(header.size_class, None);
        assert!(header.size >= size + HEADER_SIZE);
        assert_eq!(header.size % platform::numa::HUGE_PAGE_SIZE, 0);
        free(p);
    }

    #[test]
    fn zero_size_returns_null() {
        ensure_init();
        assert!(alloc(0).is_null());
    }

    #[test]
    fn free_of_null_is_a_no_op() {
        free(std::ptr::null_mut());
    }

    #[test]
    fn calloc_overflow_returns_null() {
        ensure_init();
        assert!(calloc(usize::MAX / 2, 4).is_null());
    }

    #[test]
    fn calloc_zeroes_payload() {
        ensure_init();
        let p = calloc(4, 8);
        assert!(!p.is_null());
        unsafe {
            assert!((0..32).all(|i| *p.add(i) == 0));
        }
        free(p);
    }

    #[test]
    fn realloc_grow_preserves_prefix_and_copies() {
        ensure_init();
        let p = alloc(40);
        unsafe {
            for i in 0..40u8 {
                *p.add(i as usize) = i;
            }
        }
        let p2 = realloc(p, 4000); // forces a large block
        assert_ne!(p, p2);
        unsafe {
            for i in 0..40u8 {
                assert_eq!(*p2.add(i as usize), i);
            }
        }
        free(p2);
    }

    #[test]
    fn realloc_within_class_capacity_is_a_no_op() {
        ensure_init();
        let p = alloc(10); // rounds to the 16-byte class
        let p2 = realloc(p, 16);
        assert_eq!(p, p2);
        free(p2);
    }

    #[test]
    fn realloc_to_zero_frees_and_returns_null() {
        ensure_init();
        let p = alloc(32);
        assert!(realloc(p, 0).is_null());
    }

    #[test]
    fn thread_stats_are_per_thread() {
        ensure_init();
        let before = get_thread_stats();
        let p = alloc(16);
        free(p);
        let after = get_thread_stats();
        assert_eq!(after.allocs, before.allocs + 1);
        assert_eq!(after.frees, before.frees + 1);
    }

    #[test]
    fn s7_many_threads_concurrent_alloc_write_verify_free() {
        ensure_init();
        let handles: Vec<_> = (0u8..8)
            .map(|tid| {
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let mut ptrs = Vec::with_capacity(10);
                        for _ in 0..10 {
                            let p = alloc(64);
                            assert!(!p.is_null());
                            unsafe {
                                *p = tid;
                            }
                            ptrs.push(p);
                        }
                        for p in ptrs {
                            unsafe {
                                assert_eq!(*p, tid);
                            }
                            free(p);
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().expect("thread panicked");
        }
    }

    #[test]
    fn print_topology_mentions_node_count() {
        ensure_init();
        let report = print_topology();
        assert!(report.contains("Nodes:"));
    }
}
