//! The block header prefixed onto every allocation and the fixed size-class
//! table small requests are rounded into.

/// Size classes for small allocations, exactly as named by the
/// specification this engine implements: 16 B up to 2 KiB.
pub const SIZE_CLASSES: [usize; 8] = [16, 32, 64, 128, 256, 512, 1024, 2048];

pub const NUM_SIZE_CLASSES: usize = SIZE_CLASSES.len();

/// Requests above this many bytes bypass size classes entirely and go
/// straight to a dedicated page mapping.
pub const SMALL_THRESHOLD: usize = 2048;

/// Number of blocks carved out of a node pool per refill.
pub const REFILL_BATCH: usize = 64;

/// Returns the index of the smallest size class whose nominal size is at
/// least `size`, or `None` if `size` exceeds every class (i.e. it's a large
/// allocation).
pub fn size_class_of(size: usize) -> Option<u8> {
    SIZE_CLASSES
        .iter()
        .position(|&class_size| size <= class_size)
        .map(|index| index as u8)
}

/// Prefix carried by every pointer this engine hands out. `size_class`
/// being `None` is the "large block" sentinel from the specification;
/// `Some(index)` identifies which of [`SIZE_CLASSES`] the block belongs to.
#[repr(C)]
pub struct AllocationHeader {
    /// Nominal class size for small blocks; total mapped length (header
    /// included) for large blocks.
    pub size: usize,
    pub size_class: Option<u8>,
    pub node: usize,
}

pub const HEADER_SIZE: usize = std::mem::size_of::<AllocationHeader>();

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_class_of_picks_smallest_sufficient_class() {
        assert_eq!(size_class_of(1), Some(0));
        assert_eq!(size_class_of(16), Some(0));
        assert_eq!(size_class_of(17), Some(1));
        assert_eq!(size_class_of(2048), Some(7));
        assert_eq!(size_class_of(2049), None);
    }
}
