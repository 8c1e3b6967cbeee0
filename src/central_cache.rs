//! Central cache: per-size-class span pools feeding the thread caches.
//!
//! One span list and one mutex per size class. Listed spans are using and
//! hold at least one free object; a span drops off the list when its last
//! object is handed out and comes back when an object is returned to it.
//! Thread caches exchange objects in batches, so the per-class lock is taken
//! once per batch rather than once per object.

use crate::free_list::FreeObject;
use crate::page_heap::PageHeap;
use crate::page_map::PageMap;
use crate::size_class::{self, NUM_SIZE_CLASSES};
use crate::span::SpanList;
use crate::stats::TierStats;
use crate::system_alloc::SystemAlloc;
use parking_lot::Mutex;
use tracing::{debug, error, warn};

pub struct CentralCache {
    lists: [Mutex<SpanList>; NUM_SIZE_CLASSES],
    stats: TierStats,
}

impl CentralCache {
    pub const fn new() -> Self {
        Self {
            lists: [const { Mutex::new(SpanList::new()) }; NUM_SIZE_CLASSES],
            stats: TierStats::new(),
        }
    }

    /// Pull objects out of the listed spans, front first, unlinking each
    /// span that runs dry. Returns how many objects were written to `batch`.
    unsafe fn fetch_objects(list: &mut SpanList, batch: &mut [*mut FreeObject]) -> usize {
        let mut total = 0;
        while !list.is_empty() && total != batch.len() {
            let span = list.first();
            unsafe {
                let cnt = (*span).alloc_batch(&mut batch[total..]);
                if (*span).empty() {
                    // All objects handed out: the span leaves the list but
                    // stays using and registered.
                    list.remove(span);
                    debug!(
                        allocated = (*span).allocated(),
                        total = (*span).total(),
                        "span fully handed out"
                    );
                }
                total += cnt;
            }
        }
        total
    }

    /// Refill the class with raw spans from the page heap until the batch
    /// can be served or the heap gives up.
    unsafe fn fetch_from_page_heap(
        &self,
        size_class: usize,
        list: &mut SpanList,
        batch: &mut [*mut FreeObject],
        page_heap: &Mutex<PageHeap>,
        page_map: &PageMap,
        system: &SystemAlloc,
    ) -> usize {
        let info = size_class::class_info(size_class);
        let mut fetched = 0;
        while fetched < batch.len() {
            let span = unsafe { page_heap.lock().alloc(info.pages, page_map, system) };
            if span.is_null() {
                warn!(size_class, "page heap returned no span");
                break;
            }
            unsafe {
                self.stats.add_fetched((*span).num_pages());
                (*span).set_size_class(size_class);
                (*span).init_free_list(info.size);
                list.push_front(span);
                fetched += (*span).total();
            }
        }
        unsafe { Self::fetch_objects(list, batch) }
    }

    /// Fill `batch` with objects of `size_class`. Returns how many objects
    /// were actually handed out (possibly fewer than asked on exhaustion).
    ///
    /// # Safety
    ///
    /// `page_heap`, `page_map` and `system` must be the tiers this cache's
    /// spans live in.
    pub unsafe fn alloc(
        &self,
        size_class: usize,
        batch: &mut [*mut FreeObject],
        page_heap: &Mutex<PageHeap>,
        page_map: &PageMap,
        system: &SystemAlloc,
    ) -> usize {
        debug_assert!(size_class > 0 && size_class < NUM_SIZE_CLASSES);
        if batch.is_empty() {
            return 0;
        }

        let mut list = self.lists[size_class].lock();
        let mut total = unsafe { Self::fetch_objects(&mut list, batch) };
        if total != batch.len() {
            total += unsafe {
                self.fetch_from_page_heap(
                    size_class,
                    &mut list,
                    &mut batch[total..],
                    page_heap,
                    page_map,
                    system,
                )
            };
            if total != batch.len() {
                warn!(size_class, want = batch.len(), got = total, "short refill");
            }
        }
        self.stats.add_allocated(total);
        total
    }

    /// Return a batch of objects of `size_class`. Each object is routed to
    /// its owning span through the page map; spans whose objects have all
    /// come home are handed back to the page heap. Unknown pointers are
    /// dropped (leaked) rather than risking cache state.
    ///
    /// # Safety
    ///
    /// Every pointer in `batch` must have been handed out by `alloc` for
    /// this `size_class` and not freed since.
    pub unsafe fn dealloc(
        &self,
        size_class: usize,
        batch: &[*mut FreeObject],
        page_heap: &Mutex<PageHeap>,
        page_map: &PageMap,
    ) {
        debug_assert!(size_class > 0 && size_class < NUM_SIZE_CLASSES);

        let mut list = self.lists[size_class].lock();
        for &obj in batch {
            let span = page_map.find(obj as usize);
            if span.is_null() {
                error!(ptr = ?obj, "no span found for freed object, leaking it");
                continue;
            }
            self.stats.add_deallocated(1);
            unsafe {
                if (*span).empty() {
                    // First object coming home to a drained span: relink it.
                    list.push_front(span);
                }
                (*span).dealloc_object(obj);
                if (*span).full() {
                    list.remove(span);
                    self.stats.add_returned((*span).num_pages());
                    page_heap.lock().dealloc(span, page_map);
                }
            }
        }
    }

    /// Number of spans currently listed for `size_class`.
    pub fn span_count(&self, size_class: usize) -> usize {
        self.lists[size_class].lock().len()
    }

    /// Every class list must have drained by shutdown; a populated list
    /// means some thread cache never returned its objects.
    pub fn verify_empty(&self) {
        for cls in 1..NUM_SIZE_CLASSES {
            let list = self.lists[cls].lock();
            assert!(
                list.is_empty(),
                "central cache class {} still holds {} spans at shutdown",
                cls,
                list.len()
            );
        }
    }

    pub fn stats(&self) -> &TierStats {
        &self.stats
    }

    pub fn log_stats(&self) {
        tracing::info!(
            fetched_pages = self.stats.fetched(),
            returned_pages = self.stats.returned(),
            allocated_objects = self.stats.allocated(),
            deallocated_objects = self.stats.deallocated(),
            "central cache stats"
        );
    }
}

impl Default for CentralCache {
    fn default() -> Self {
        Self::new()
    }
}
