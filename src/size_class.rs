//! Size class table and lookup functions.
//!
//! Objects are bucketed into size classes to reduce fragmentation and enable
//! free list management. The table covers sizes from 8 bytes up to 256 KiB;
//! anything larger bypasses the cache hierarchy entirely.

use crate::PAGE_SIZE;

/// Information about a single size class.
#[derive(Clone, Copy)]
pub struct SizeClassInfo {
    /// Allocation size for this class (bytes). All allocations in this class
    /// are rounded up to this size.
    pub size: usize,
    /// Number of pages per span for this class.
    pub pages: usize,
    /// Number of objects to transfer between thread cache and central cache
    /// at once.
    pub num_to_move: usize,
    /// Upper bound on a thread cache free list for this class.
    pub max_capacity: usize,
}

impl SizeClassInfo {
    pub const fn objects_per_span(&self) -> usize {
        (self.pages * PAGE_SIZE) / self.size
    }
}

/// Number of defined size classes (index 0 is unused/sentinel).
pub const NUM_SIZE_CLASSES: usize = 85;

/// Maximum allocation size that goes through size classes.
pub const MAX_SIZE: usize = 262144; // 256 KiB

/// Hard bound on `num_to_move` for any class.
pub const MAX_MOVE: usize = 128;

/// Hard cap on any thread cache free list length.
pub const MAX_LIST_OBJECTS: usize = 8192;

/// Sizes up to this are rounded to multiples of 8; sizes above to
/// multiples of 128.
const LARGE_SIZE: usize = 1024;

/// Object sizes per class. Index 0 is a sentinel. Multiples of 8 up to
/// 1024, multiples of 128 above, roughly geometric growth to 256 KiB.
const CLASS_SIZES: [usize; NUM_SIZE_CLASSES] = [
    0, //
    8, 16, 24, 32, 40, 48, 56, 64, //
    80, 96, 112, 128, //
    144, 160, 176, 192, 208, 224, 240, 256, //
    288, 320, 352, 384, 416, 448, 480, 512, //
    640, 768, 896, 1024, //
    1152, 1280, 1408, 1536, 1664, 1792, 1920, 2048, //
    2304, 2560, 2816, 3072, 3328, 3584, 3840, 4096, //
    4608, 5120, 5632, 6144, 6656, 7168, 7680, 8192, //
    9216, 10240, 11264, 12288, 13312, 14336, 15360, 16384, //
    18432, 20480, 22528, 24576, 26624, 28672, 30720, 32768, //
    40960, 49152, 57344, 65536, //
    81920, 98304, 114688, 131072, //
    163840, 196608, 229376, 262144,
];

/// Smallest span length (in pages) whose leftover after carving `size`-byte
/// objects stays within 1/8 of the span.
const fn pages_for(size: usize) -> usize {
    let mut pages = 1;
    loop {
        let span_bytes = pages * PAGE_SIZE;
        if span_bytes >= size && (span_bytes % size) * 8 <= span_bytes {
            return pages;
        }
        pages += 1;
    }
}

const fn clamp(n: usize, lo: usize, hi: usize) -> usize {
    if n < lo {
        lo
    } else if n > hi {
        hi
    } else {
        n
    }
}

/// The size class table. Index 0 is a sentinel (unused). Derived fields are
/// computed at compile time from the size list: batch size targets 64 KiB
/// per transfer, list capacity targets 1 MiB per class.
pub static SIZE_CLASSES: [SizeClassInfo; NUM_SIZE_CLASSES] = const {
    let mut table = [SizeClassInfo {
        size: 0,
        pages: 0,
        num_to_move: 0,
        max_capacity: 0,
    }; NUM_SIZE_CLASSES];
    let mut cls = 1;
    while cls < NUM_SIZE_CLASSES {
        let size = CLASS_SIZES[cls];
        let num_to_move = clamp(65536 / size, 2, MAX_MOVE);
        table[cls] = SizeClassInfo {
            size,
            pages: pages_for(size),
            num_to_move,
            max_capacity: clamp((1 << 20) / size, 2 * num_to_move, MAX_LIST_OBJECTS),
        };
        cls += 1;
    }
    table
};

/// Number of byte-size buckets: 8-byte steps up to `LARGE_SIZE`, 128-byte
/// steps from there to `MAX_SIZE`.
const NUM_BUCKETS: usize = ((MAX_SIZE + 127) >> 7) + 121;

/// Bucket index for a byte size `n <= MAX_SIZE`.
const fn bucket(n: usize) -> usize {
    if n <= LARGE_SIZE {
        (n + 7) >> 3
    } else {
        ((n + 127) >> 7) + 120
    }
}

/// Lookup table from bucket index to size class index, so `size_to_class`
/// is one shift and one load.
static BUCKET_TO_CLASS: [u8; NUM_BUCKETS] = const {
    let mut table = [0u8; NUM_BUCKETS];
    let mut cls = 1;
    let mut n = 0;
    while cls < NUM_SIZE_CLASSES {
        // n never revisits a bucket once a smaller class claimed it.
        while n <= CLASS_SIZES[cls] {
            table[bucket(n)] = cls as u8;
            n += 8;
        }
        cls += 1;
    }
    table
};

/// Map an allocation size to its size class index.
/// Returns a class in 1..NUM_SIZE_CLASSES for sizes up to `MAX_SIZE`
/// (size 0 maps to the minimum class) and 0 for anything larger, which
/// callers must route around the cache hierarchy.
#[inline]
pub fn size_to_class(size: usize) -> usize {
    if size > MAX_SIZE {
        return 0;
    }
    BUCKET_TO_CLASS[bucket(size)] as usize
}

/// Get the allocation size for a given size class.
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

    #[test]
    fn test_size_to_class_zero() {
        let cls = size_to_class(0);
        assert_eq!(cls, 1);
        assert_eq!(class_to_size(cls), 8);
    }

    #[test]
    fn test_size_to_class_exact() {
        assert_eq!(class_to_size(size_to_class(8)), 8);
        assert_eq!(class_to_size(size_to_class(16)), 16);
        assert_eq!(class_to_size(size_to_class(64)), 64);
        assert_eq!(class_to_size(size_to_class(128)), 128);
        assert_eq!(class_to_size(size_to_class(256)), 256);
        assert_eq!(class_to_size(size_to_class(512)), 512);
        assert_eq!(class_to_size(size_to_class(1024)), 1024);
        assert_eq!(class_to_size(size_to_class(2048)), 2048);
        assert_eq!(class_to_size(size_to_class(4096)), 4096);
        assert_eq!(class_to_size(size_to_class(8192)), 8192);
        assert_eq!(class_to_size(size_to_class(262144)), 262144);
    }

    #[test]
    fn test_size_to_class_rounds_up() {
        assert_eq!(class_to_size(size_to_class(1)), 8);
        assert_eq!(class_to_size(size_to_class(7)), 8);
        assert_eq!(class_to_size(size_to_class(9)), 16);
        assert_eq!(class_to_size(size_to_class(15)), 16);
        assert_eq!(class_to_size(size_to_class(17)), 24);
        assert_eq!(class_to_size(size_to_class(65)), 80);
        assert_eq!(class_to_size(size_to_class(513)), 640);
        assert_eq!(class_to_size(size_to_class(1025)), 1152);
        assert_eq!(class_to_size(size_to_class(2049)), 2304);
    }

    #[test]
    fn test_size_to_class_large() {
        assert_eq!(size_to_class(262145), 0);
        assert_eq!(size_to_class(1_000_000), 0);
    }

    #[test]
    fn test_round_trip_all_classes() {
        for cls in 1..NUM_SIZE_CLASSES {
            let size = class_to_size(cls);
            assert!(size > 0, "class {} has zero size", cls);
            let found = size_to_class(size);
            assert_eq!(
                found, cls,
                "round-trip failed for class {} (size {})",
                cls, size
            );
        }
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
    fn test_alignment_buckets() {
        for cls in 1..NUM_SIZE_CLASSES {
            let size = SIZE_CLASSES[cls].size;
            if size <= LARGE_SIZE {
                assert_eq!(size % 8, 0, "class {} size {} not 8-aligned", cls, size);
            } else {
                assert_eq!(size % 128, 0, "class {} size {} not 128-aligned", cls, size);
            }
        }
    }

    #[test]
    fn test_min_size_holds_a_pointer() {
        // The free list overlays the first word of each free object.
        assert!(SIZE_CLASSES[1].size >= core::mem::size_of::<*mut u8>());
    }

    #[test]
    fn test_batch_sizes_bounded() {
        for cls in 1..NUM_SIZE_CLASSES {
            let info = &SIZE_CLASSES[cls];
            assert!(info.num_to_move >= 2);
            assert!(info.num_to_move <= MAX_MOVE);
            assert!(info.max_capacity >= 2 * info.num_to_move);
            assert!(info.max_capacity <= MAX_LIST_OBJECTS);
        }
    }

    #[test]
    fn test_span_waste_bounded() {
        for cls in 1..NUM_SIZE_CLASSES {
            let info = &SIZE_CLASSES[cls];
            let span_bytes = info.pages * PAGE_SIZE;
            assert!(span_bytes >= info.size);
            let waste = span_bytes % info.size;
            assert!(
                waste * 8 <= span_bytes,
                "class {} wastes {} of {} span bytes",
                cls,
                waste,
                span_bytes
            );
        }
    }

    #[test]
    fn test_objects_per_span() {
        for cls in 1..NUM_SIZE_CLASSES {
            let info = &SIZE_CLASSES[cls];
            let objs = info.objects_per_span();
            assert!(objs >= 1, "class {} has 0 objects per span", cls);
            assert!(objs * info.size <= info.pages * PAGE_SIZE);
        }
    }
}
