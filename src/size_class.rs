//! Size class table and lookup functions.
//!
//! The allocator supports a small fixed vector of object sizes (64..768
//! bytes by default). Each class owns one pool of single-page slabs; a
//! request is routed to the smallest class whose size fits it via an O(1)
//! lookup table over 8-byte steps.

/// Information about a single size class.
#[derive(Clone, Copy)]
pub struct SizeClassInfo {
    /// Object size for this class (bytes). All allocations in this class
    /// occupy a slot of exactly this size.
    pub size: usize,
    /// Number of slots per slab page for this class.
    pub slot_count: usize,
}

// Defines NUM_SIZE_CLASSES, MAX_OBJECT_SIZE and the SIZE_CLASSES table
// (index 0 is a sentinel).
include!(concat!(env!("OUT_DIR"), "/size_class_gen.rs"));

/// Lookup table over request sizes in 8-byte steps.
/// Index = (size + 7) / 8, value = size class index.
const LOOKUP_LEN: usize = MAX_OBJECT_SIZE / 8 + 1;

static SIZE_LOOKUP: [u8; LOOKUP_LEN] = const {
    let mut table = [0u8; LOOKUP_LEN];
    let mut i = 1;
    while i < LOOKUP_LEN {
        let size = i * 8;
        // Find the smallest size class that fits this size
        let mut cls = 1u8;
        while (cls as usize) < NUM_SIZE_CLASSES {
            if SIZE_CLASSES[cls as usize].size >= size {
                break;
            }
            cls += 1;
        }
        table[i] = cls;
        i += 1;
    }
    table
};

/// Map an allocation size to its size class index.
///
/// Returns a class in 1..NUM_SIZE_CLASSES for supported sizes, and 0 (the
/// sentinel) for size 0 or sizes above [`MAX_OBJECT_SIZE`]. Zero-sized
/// requests are deliberately rejected rather than routed to the smallest
/// class: a handle must always name a real slot.
#[inline]
pub fn size_to_class(size: usize) -> usize {
    if size == 0 || size > MAX_OBJECT_SIZE {
        return 0;
    }
    SIZE_LOOKUP[(size + 7) / 8] as usize
}

/// Get the object size for a given size class.
#[inline]
pub fn class_to_size(cls: usize) -> usize {
    SIZE_CLASSES[cls].size
}

/// Get the size class info for a given class index.
#[inline]
pub fn class_info(cls: usize) -> &'static SizeClassInfo {
    &SIZE_CLASSES[cls]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PAGE_SIZE, SLOT_BASE_OFFSET};

    #[test]
    fn test_size_to_class_zero_rejected() {
        assert_eq!(size_to_class(0), 0);
    }

    #[test]
    fn test_size_to_class_exact() {
        for cls in 1..NUM_SIZE_CLASSES {
            let size = class_to_size(cls);
            assert_eq!(size_to_class(size), cls);
        }
    }

    #[test]
    fn test_size_to_class_rounds_up() {
        assert_eq!(class_to_size(size_to_class(1)), 64);
        assert_eq!(class_to_size(size_to_class(63)), 64);
        assert_eq!(class_to_size(size_to_class(64)), 64);
        assert_eq!(class_to_size(size_to_class(65)), 96);
        assert_eq!(class_to_size(size_to_class(97)), 128);
        assert_eq!(class_to_size(size_to_class(129)), 192);
        assert_eq!(class_to_size(size_to_class(767)), 768);
    }

    #[test]
    fn test_size_to_class_max_boundary() {
        // Exactly max size succeeds and chooses the largest class
        assert_eq!(size_to_class(MAX_OBJECT_SIZE), NUM_SIZE_CLASSES - 1);
        // One past is rejected
        assert_eq!(size_to_class(MAX_OBJECT_SIZE + 1), 0);
        assert_eq!(size_to_class(1_000_000), 0);
    }

    #[test]
    fn test_classes_monotonically_increasing() {
        for i in 2..NUM_SIZE_CLASSES {
            assert!(
                SIZE_CLASSES[i].size > SIZE_CLASSES[i - 1].size,
                "class {} size {} not greater than class {} size {}",
                i,
                SIZE_CLASSES[i].size,
                i - 1,
                SIZE_CLASSES[i - 1].size
            );
        }
    }

    #[test]
    fn test_slots_fit_in_page() {
        for cls in 1..NUM_SIZE_CLASSES {
            let info = &SIZE_CLASSES[cls];
            assert!(info.slot_count >= 2, "class {} has too few slots", cls);
            assert!(info.slot_count <= 255, "class {} overflows slot index", cls);
            assert!(SLOT_BASE_OFFSET + info.slot_count * info.size <= PAGE_SIZE);
        }
    }
}
