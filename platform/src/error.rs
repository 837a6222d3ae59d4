use std::fmt;

/// Reasons an OS-facing primitive in this crate can fail.
///
/// Engines built on top of `platform` generally collapse these down to a
/// null pointer or a sentinel error code at their own public boundary (see
/// the allocator contracts this repository implements); this enum exists so
/// an engine can log *why* before doing so.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformError {
    /// `mmap(PROT_NONE)` (or the node-local/huge-page variants) failed.
    ReserveFailed,
    /// `mprotect` to widen the committed range failed.
    CommitFailed,
    /// `munmap` failed.
    ReleaseFailed,
    /// A requested size or alignment was invalid (zero, not a power of two, overflow).
    InvalidArgument,
    /// NUMA topology could not be discovered even via the `/sys` fallback.
    TopologyUnavailable,
}

impl fmt::Display for PlatformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            PlatformError::ReserveFailed => "failed to reserve virtual address space",
            PlatformError::CommitFailed => "failed to commit pages",
            PlatformError::ReleaseFailed => "failed to release a mapping",
            PlatformError::InvalidArgument => "invalid argument",
            PlatformError::TopologyUnavailable => "NUMA topology discovery failed",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for PlatformError {}
