//! Thread cache (front end): per-thread free lists for lock-free allocation.
//!
//! Each thread owns one `ThreadCache`; the fast path (cache hit) touches
//! only per-thread state and takes no lock. Misses pull a batch of objects
//! from the central cache, overflows push a batch back. Every list's cap
//! (`max_length`) adapts: it eases upward on refills and shrinks after
//! repeated overflows, bounded by the class capacity and a hard limit.

use crate::central_cache::CentralCache;
use crate::free_list::{DynamicFreeList, FreeObject};
use crate::page_heap::PageHeap;
use crate::page_map::PageMap;
use crate::size_class::{self, MAX_LIST_OBJECTS, MAX_MOVE, NUM_SIZE_CLASSES};
use crate::stats::TierStats;
use crate::system_alloc::SystemAlloc;
use core::ptr;
use parking_lot::Mutex;
use tracing::{debug, warn};

/// Consecutive overflows tolerated before a list's cap shrinks by a batch.
const MAX_OVERAGES: usize = 3;

pub struct ThreadCache {
    lists: [DynamicFreeList; NUM_SIZE_CLASSES],
    /// Bytes currently parked across all lists.
    total_bytes: usize,
    stats: TierStats,
}

impl ThreadCache {
    pub fn new() -> Self {
        Self {
            lists: [const { DynamicFreeList::new() }; NUM_SIZE_CLASSES],
            total_bytes: 0,
            stats: TierStats::new(),
        }
    }

    /// Allocate one object of `size_class`. Returns null on exhaustion.
    ///
    /// # Safety
    ///
    /// The tier references must be the ones all of this cache's objects
    /// originate from; the caller must be the thread owning this cache.
    pub unsafe fn alloc(
        &mut self,
        size_class: usize,
        central: &CentralCache,
        page_heap: &Mutex<PageHeap>,
        page_map: &PageMap,
        system: &SystemAlloc,
    ) -> *mut u8 {
        debug_assert!(size_class > 0 && size_class < NUM_SIZE_CLASSES);

        let obj = if !self.lists[size_class].is_empty() {
            self.lists[size_class].pop()
        } else {
            unsafe { self.fetch_from_central(size_class, central, page_heap, page_map, system) }
        };

        if obj.is_null() {
            warn!(size_class, "thread cache allocation failed");
            return ptr::null_mut();
        }
        self.total_bytes -= size_class::class_to_size(size_class);
        self.stats.add_allocated(1);
        obj as *mut u8
    }

    /// Return one object of `size_class` to this cache, spilling a batch to
    /// the central cache when the list outgrows its cap.
    ///
    /// # Safety
    ///
    /// `obj` must have been allocated for `size_class` from the same tiers.
    pub unsafe fn dealloc(
        &mut self,
        size_class: usize,
        obj: *mut u8,
        central: &CentralCache,
        page_heap: &Mutex<PageHeap>,
        page_map: &PageMap,
    ) {
        debug_assert!(size_class > 0 && size_class < NUM_SIZE_CLASSES);
        if obj.is_null() {
            return;
        }

        self.total_bytes += size_class::class_to_size(size_class);
        self.stats.add_deallocated(1);
        self.lists[size_class].push(obj as *mut FreeObject);

        if self.lists[size_class].len() > self.lists[size_class].max_length() {
            debug!(
                size_class,
                len = self.lists[size_class].len(),
                max = self.lists[size_class].max_length(),
                "free list over its cap"
            );
            unsafe { self.list_too_long(size_class, central, page_heap, page_map) };
        }
    }

    /// Miss path: pull one batch from the central cache, keep the remainder
    /// in the list, and ease the cap upward.
    #[cold]
    unsafe fn fetch_from_central(
        &mut self,
        size_class: usize,
        central: &CentralCache,
        page_heap: &Mutex<PageHeap>,
        page_map: &PageMap,
        system: &SystemAlloc,
    ) -> *mut FreeObject {
        debug_assert!(self.lists[size_class].is_empty());
        let info = size_class::class_info(size_class);
        let batch_size = info.num_to_move;
        debug_assert!(batch_size <= MAX_MOVE);

        let mut batch = [ptr::null_mut::<FreeObject>(); MAX_MOVE];
        let cnt = unsafe {
            central.alloc(
                size_class,
                &mut batch[..batch_size],
                page_heap,
                page_map,
                system,
            )
        };
        if cnt == 0 {
            warn!(size_class, want = batch_size, "refill returned nothing");
            return ptr::null_mut();
        }
        if cnt != batch_size {
            warn!(size_class, got = cnt, want = batch_size, "short refill");
        }

        self.stats.add_fetched(cnt);
        self.total_bytes += info.size * cnt;
        let list = &mut self.lists[size_class];
        if cnt > 1 {
            list.push_batch(&batch[1..cnt]);
        }

        // Ease the cap up one refill at a time until it covers a batch,
        // then a batch at a time toward the class capacity, kept at a
        // multiple of the batch size.
        let cap = MAX_LIST_OBJECTS.min(info.max_capacity);
        if list.max_length() < batch_size {
            list.set_max_length(list.max_length() + 1);
        } else {
            let mut next = (list.max_length() + batch_size).min(cap);
            next -= next % batch_size;
            list.set_max_length(next);
        }

        batch[0]
    }

    /// Overflow path: spill one batch back, then adapt the cap. Repeated
    /// overflows at a cap above one batch shrink it.
    unsafe fn list_too_long(
        &mut self,
        size_class: usize,
        central: &CentralCache,
        page_heap: &Mutex<PageHeap>,
        page_map: &PageMap,
    ) {
        let batch_size = size_class::class_info(size_class).num_to_move;
        let n = self.lists[size_class].len().min(batch_size);
        unsafe { self.return_to_central(size_class, n, central, page_heap, page_map) };

        let list = &mut self.lists[size_class];
        if list.max_length() < batch_size {
            list.set_max_length(list.max_length() + 1);
        } else if list.max_length() > batch_size {
            list.bump_length_overages();
            if list.length_overages() >= MAX_OVERAGES {
                list.set_max_length(list.max_length() - batch_size);
                list.reset_length_overages();
            }
        }
    }

    /// Push `n` objects of `size_class` back to the central cache, a batch
    /// at a time.
    unsafe fn return_to_central(
        &mut self,
        size_class: usize,
        mut n: usize,
        central: &CentralCache,
        page_heap: &Mutex<PageHeap>,
        page_map: &PageMap,
    ) {
        debug_assert!(size_class > 0 && size_class < NUM_SIZE_CLASSES);
        if n == 0 {
            return;
        }
        let info = size_class::class_info(size_class);
        let batch_size = info.num_to_move;

        let have = self.lists[size_class].len();
        if have < n {
            warn!(size_class, want = n, have, "returning more than the list holds");
            n = have;
        }
        self.total_bytes -= n * info.size;
        self.stats.add_returned(n);

        let mut batch = [ptr::null_mut::<FreeObject>(); MAX_MOVE];
        while n >= batch_size {
            let cnt = self.lists[size_class].pop_batch(&mut batch[..batch_size]);
            unsafe { central.dealloc(size_class, &batch[..cnt], page_heap, page_map) };
            n -= batch_size;
        }
        if n > 0 {
            let cnt = self.lists[size_class].pop_batch(&mut batch[..n]);
            unsafe { central.dealloc(size_class, &batch[..cnt], page_heap, page_map) };
        }
    }

    /// Return every cached object of every class to the central cache.
    /// Runs at thread exit; the central cache asserts this happened at
    /// shutdown.
    ///
    /// # Safety
    ///
    /// Same tier references as every other call on this cache.
    pub unsafe fn drain(
        &mut self,
        central: &CentralCache,
        page_heap: &Mutex<PageHeap>,
        page_map: &PageMap,
    ) {
        let mut total = 0;
        for cls in 1..NUM_SIZE_CLASSES {
            let n = self.lists[cls].len();
            if n == 0 {
                continue;
            }
            total += n;
            unsafe { self.return_to_central(cls, n, central, page_heap, page_map) };
        }
        debug!(
            objects = total,
            fetched = self.stats.fetched(),
            returned = self.stats.returned(),
            "thread cache drained"
        );
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn list_len(&self, size_class: usize) -> usize {
        self.lists[size_class].len()
    }

    pub fn list_max_length(&self, size_class: usize) -> usize {
        self.lists[size_class].max_length()
    }

    pub fn stats(&self) -> &TierStats {
        &self.stats
    }
}

impl Default for ThreadCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestEnv {
        page_map: PageMap,
        system: SystemAlloc,
        page_heap: Mutex<PageHeap>,
        central: CentralCache,
    }

    fn make_test_env() -> TestEnv {
        TestEnv {
            page_map: PageMap::new(),
            system: SystemAlloc::new(),
            page_heap: Mutex::new(PageHeap::new()),
            central: CentralCache::new(),
        }
    }

    impl TestEnv {
        unsafe fn alloc(&self, tc: &mut ThreadCache, cls: usize) -> *mut u8 {
            unsafe { tc.alloc(cls, &self.central, &self.page_heap, &self.page_map, &self.system) }
        }

        unsafe fn dealloc(&self, tc: &mut ThreadCache, cls: usize, p: *mut u8) {
            unsafe { tc.dealloc(cls, p, &self.central, &self.page_heap, &self.page_map) }
        }
    }

    #[test]
    fn test_allocate_and_deallocate() {
        let env = make_test_env();
        let mut tc = ThreadCache::new();

        unsafe {
            let ptr = env.alloc(&mut tc, 1);
            assert!(!ptr.is_null());
            env.dealloc(&mut tc, 1, ptr);
        }
    }

    #[test]
    fn test_allocate_many() {
        let env = make_test_env();
        let mut tc = ThreadCache::new();

        unsafe {
            let mut ptrs = Vec::new();
            // 1000 objects of size class 4 = 32 bytes
            for _ in 0..1000 {
                let ptr = env.alloc(&mut tc, 4);
                assert!(!ptr.is_null());
                ptrs.push(ptr);
            }
            for ptr in ptrs {
                env.dealloc(&mut tc, 4, ptr);
            }
        }
    }

    #[test]
    fn test_mixed_sizes() {
        let env = make_test_env();
        let mut tc = ThreadCache::new();

        unsafe {
            let mut allocs: Vec<(usize, *mut u8)> = Vec::new();
            for cls in [1, 4, 8, 12, 16, 20, 24] {
                for _ in 0..50 {
                    let ptr = env.alloc(&mut tc, cls);
                    assert!(!ptr.is_null());
                    allocs.push((cls, ptr));
                }
            }
            for (cls, ptr) in allocs {
                env.dealloc(&mut tc, cls, ptr);
            }
        }
    }

    #[test]
    fn test_reuse_from_cache() {
        let env = make_test_env();
        let mut tc = ThreadCache::new();

        unsafe {
            // Warm the list until its cap covers a whole batch; below that,
            // every overflow spills the list back to the central cache.
            let batch = size_class::class_info(2).num_to_move;
            for _ in 0..batch {
                let p = env.alloc(&mut tc, 2);
                env.dealloc(&mut tc, 2, p);
            }

            let ptr1 = env.alloc(&mut tc, 2);
            assert!(!ptr1.is_null());
            env.dealloc(&mut tc, 2, ptr1);

            // A hot cache hands the same address straight back.
            let ptr2 = env.alloc(&mut tc, 2);
            assert_eq!(ptr1, ptr2);
            env.dealloc(&mut tc, 2, ptr2);
        }
    }

    #[test]
    fn test_refill_grows_max_length() {
        let env = make_test_env();
        let mut tc = ThreadCache::new();
        // Class 84: 256 KiB objects, batch of 2, capacity of 4.
        let cls = NUM_SIZE_CLASSES - 1;
        let info = size_class::class_info(cls);
        assert_eq!(info.num_to_move, 2);
        assert_eq!(info.max_capacity, 4);

        unsafe {
            let mut held = Vec::new();
            // One batch of successive allocs gets the cap to a full batch.
            for _ in 0..info.num_to_move {
                held.push(env.alloc(&mut tc, cls));
            }
            assert!(tc.list_max_length(cls) >= info.num_to_move);

            // Further refills grow batch-wise but stop at the capacity.
            for _ in 0..4 {
                held.push(env.alloc(&mut tc, cls));
            }
            assert_eq!(tc.list_max_length(cls), 4);

            for p in held {
                env.dealloc(&mut tc, cls, p);
            }
        }
    }

    #[test]
    fn test_repeated_overflow_shrinks_cap() {
        let env = make_test_env();
        let mut tc = ThreadCache::new();
        let cls = NUM_SIZE_CLASSES - 1; // batch 2, capacity 4

        unsafe {
            // Pump the cap to the class capacity.
            let mut held: Vec<*mut u8> = Vec::new();
            for _ in 0..6 {
                held.push(env.alloc(&mut tc, cls));
            }
            assert_eq!(tc.list_max_length(cls), 4);

            // Each round frees a handful, overflowing the list once.
            for _ in 0..3 {
                while held.len() < 5 {
                    held.push(env.alloc(&mut tc, cls));
                }
                for p in held.drain(..) {
                    env.dealloc(&mut tc, cls, p);
                }
            }

            // Three consecutive overflows shrank the cap by one batch.
            assert!(tc.list_max_length(cls) < 4);
        }
    }

    #[test]
    fn test_drain_returns_everything() {
        let env = make_test_env();
        let mut tc = ThreadCache::new();

        unsafe {
            let mut ptrs = Vec::new();
            for _ in 0..100 {
                ptrs.push(env.alloc(&mut tc, 4));
            }
            for p in ptrs {
                env.dealloc(&mut tc, 4, p);
            }

            tc.drain(&env.central, &env.page_heap, &env.page_map);
        }

        assert_eq!(tc.list_len(4), 0);
        assert_eq!(tc.total_bytes(), 0);
        // Everything fetched went back; the central cache gave its spans to
        // the page heap.
        assert_eq!(tc.stats().fetched(), tc.stats().returned());
        assert_eq!(env.central.span_count(4), 0);
        env.central.verify_empty();
        assert!(env.page_heap.lock().free_span_count() > 0);
    }

    #[test]
    fn test_total_bytes_tracks_lists() {
        let env = make_test_env();
        let mut tc = ThreadCache::new();
        let size = size_class::class_to_size(4);
        let batch = size_class::class_info(4).num_to_move;

        unsafe {
            let p = env.alloc(&mut tc, 4);
            // One batch fetched, one object handed out.
            assert_eq!(tc.total_bytes(), (batch - 1) * size);
            // The free overflows the cold list's cap of two, spilling the
            // whole list back to the central cache.
            env.dealloc(&mut tc, 4, p);
            assert_eq!(tc.total_bytes(), 0);
            assert_eq!(tc.list_len(4), 0);
        }
    }
}
