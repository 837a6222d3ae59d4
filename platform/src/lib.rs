//! Shared OS-facing primitives for the arena, free-list and NUMA allocator
//! engines: page-granular virtual memory (reserve/commit/release), NUMA
//! topology discovery and node-local placement, and the mutex primitive
//! every lock-guarded engine builds on.
//!
//! Nothing in this crate allocates through the platform's own `malloc` —
//! every byte handed to a caller comes straight from `mmap`/`mprotect`, the
//! same way the arena and NUMA engines' reference C implementation works.

pub mod error;
pub mod numa;
pub mod vm;

pub use error::PlatformError;

/// The mutex primitive every engine's slow path is built on. Re-exported
/// from `parking_lot` rather than `std::sync::Mutex` so lock acquisition
/// doesn't need to thread `PoisonError` handling through allocator code
/// that must itself never panic while a guard is held.
pub type Mutex<T> = parking_lot::Mutex<T>;
pub type MutexGuard<'a, T> = parking_lot::MutexGuard<'a, T>;

/// Guards the NUMA engine's global topology/node-pool table: many cheap
/// concurrent readers (the allocation slow path, thread-arena creation),
/// one exclusive writer (`init`/`cleanup`).
pub type RwLock<T> = parking_lot::RwLock<T>;

/// `KiB`/`MiB`/`GiB` size-unit helpers (§6 of the specification this crate
/// implements names these explicitly as part of the arena's public surface;
/// they live here so all three engines share one definition).
pub const fn kib(n: u64) -> u64 {
    n * 1024
}

pub const fn mib(n: u64) -> u64 {
    n * 1024 * 1024
}

pub const fn gib(n: u64) -> u64 {
    n * 1024 * 1024 * 1024
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_unit_helpers() {
        assert_eq!(kib(1), 1024);
        assert_eq!(mib(1), 1024 * 1024);
        assert_eq!(gib(1), 1024 * 1024 * 1024);
    }
}
