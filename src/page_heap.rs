//! Page heap: free spans bucketed by page count, carved on demand.
//!
//! The heap keeps one free list per exact page count up to 128 pages plus a
//! shared list for everything larger. Allocation takes the best fit, carving
//! the tail off an oversized span; deallocation coalesces with address-
//! adjacent idle neighbors (found through the page map) so every maximal run
//! of idle pages is a single span. The heap itself runs under one mutex,
//! owned by the caller.

use crate::page_map::PageMap;
use crate::span::{Span, SpanList, SpanStatus};
use crate::stats::TierStats;
use crate::system_alloc::SystemAlloc;
use crate::{PAGE_SHIFT, PAGE_SIZE};
use core::ptr;
use tracing::{info, warn};

/// Spans of up to this many pages (1 MiB) get an exact-size free list.
const MAX_SMALL_PAGES: usize = 1 << (20 - PAGE_SHIFT);
const NUM_LISTS: usize = MAX_SMALL_PAGES + 1;

pub struct PageHeap {
    /// Index `p - 1` holds spans of exactly `p` pages for small `p`; the
    /// last list holds every larger span, unordered.
    lists: [SpanList; NUM_LISTS],
    stats: TierStats,
}

impl PageHeap {
    pub const fn new() -> Self {
        Self {
            lists: [const { SpanList::new() }; NUM_LISTS],
            stats: TierStats::new(),
        }
    }

    fn list_idx(num_pages: usize) -> usize {
        num_pages.min(NUM_LISTS) - 1
    }

    unsafe fn add_to_list(&mut self, span: *mut Span) {
        let idx = Self::list_idx(unsafe { (*span).num_pages() });
        unsafe { self.lists[idx].push_front(span) };
    }

    unsafe fn remove_from_list(&mut self, span: *mut Span) {
        let idx = Self::list_idx(unsafe { (*span).num_pages() });
        unsafe { self.lists[idx].remove(span) };
    }

    /// Heap-allocate a span covering `num_pages` pages at `start`, register
    /// it, and either park it on a free list (idle) or hand it out (using).
    unsafe fn create_span(
        &mut self,
        start: *mut u8,
        num_pages: usize,
        status: SpanStatus,
        page_map: &PageMap,
    ) -> *mut Span {
        let span = Box::into_raw(Box::new(Span::new(start, num_pages)));
        unsafe {
            page_map.insert(span);
            if status == SpanStatus::Idle {
                self.add_to_list(span);
            } else {
                (*span).set_status(SpanStatus::Using);
            }
        }
        span
    }

    /// Deregister, unlink and free a span object.
    unsafe fn destroy_span(&mut self, span: *mut Span, page_map: &PageMap) {
        unsafe {
            page_map.remove(span);
            self.remove_from_list(span);
            drop(Box::from_raw(span));
        }
    }

    /// Split `n` pages off `span`. The remainder (if any) keeps its first
    /// page and registration and moves to the free list for its new size;
    /// the carved tail is returned as a fresh using span.
    unsafe fn carve(&mut self, span: *mut Span, n: usize, page_map: &PageMap) -> *mut Span {
        unsafe {
            debug_assert!((*span).num_pages() >= n);
            self.remove_from_list(span);
            if (*span).num_pages() == n {
                (*span).set_status(SpanStatus::Using);
                return span;
            }

            let rest = (*span).num_pages() - n;
            (*span).set_num_pages(rest);
            self.add_to_list(span);

            self.create_span(
                (*span).page_addr(rest) as *mut u8,
                n,
                SpanStatus::Using,
                page_map,
            )
        }
    }

    /// First large-list span big enough for `num_pages`. The large list is
    /// unordered; a linear scan is fine at this size.
    unsafe fn find_from_large(&self, num_pages: usize) -> *mut Span {
        let mut cur = self.lists[NUM_LISTS - 1].first();
        while !cur.is_null() {
            if unsafe { (*cur).num_pages() } >= num_pages {
                return cur;
            }
            cur = unsafe { (*cur).next };
        }
        ptr::null_mut()
    }

    /// Ask the system allocator for at least `num_pages` pages. The mapping
    /// can be much larger than asked; the whole of it becomes one idle span.
    unsafe fn fetch_from_system(
        &mut self,
        num_pages: usize,
        page_map: &PageMap,
        system: &SystemAlloc,
    ) -> *mut Span {
        match system.alloc(num_pages * PAGE_SIZE, PAGE_SIZE) {
            None => {
                warn!(pages = num_pages, "fetch from system failed");
                ptr::null_mut()
            }
            Some((start, actual)) => {
                debug_assert_eq!(actual % PAGE_SIZE, 0);
                self.stats.add_fetched(actual);
                unsafe { self.create_span(start, actual / PAGE_SIZE, SpanStatus::Idle, page_map) }
            }
        }
    }

    /// Decommit a span's pages and destroy it.
    unsafe fn return_to_system(&mut self, span: *mut Span, page_map: &PageMap, system: &SystemAlloc) {
        unsafe {
            self.stats.add_returned((*span).num_bytes());
            let start = (*span).start_addr() as *mut u8;
            let bytes = (*span).num_bytes();
            self.destroy_span(span, page_map);
            system.dealloc(start, bytes);
        }
    }

    /// Get a using span of exactly `num_pages` pages, or null on exhaustion.
    ///
    /// # Safety
    ///
    /// The caller must hold the heap mutex and pass the page map and system
    /// allocator this heap's spans are registered with.
    pub unsafe fn alloc(
        &mut self,
        num_pages: usize,
        page_map: &PageMap,
        system: &SystemAlloc,
    ) -> *mut Span {
        debug_assert!(num_pages >= 1);

        // Best fit over the exact-size lists, then the large list.
        let mut span = ptr::null_mut();
        for pages in num_pages..=MAX_SMALL_PAGES {
            let list = &self.lists[pages - 1];
            if !list.is_empty() {
                span = list.first();
                break;
            }
        }
        if span.is_null() {
            span = unsafe { self.find_from_large(num_pages) };
        }
        if span.is_null() {
            span = unsafe { self.fetch_from_system(num_pages, page_map, system) };
        }
        if span.is_null() {
            return ptr::null_mut();
        }

        self.stats.add_allocated(num_pages);
        unsafe { self.carve(span, num_pages, page_map) }
    }

    /// Take back a using span, merge it with any idle neighbor, and park the
    /// result on the free list for its merged size.
    ///
    /// # Safety
    ///
    /// The caller must hold the heap mutex; `span` must be a live using span
    /// owned by the caller, registered in `page_map`, and on no list.
    pub unsafe fn dealloc(&mut self, span: *mut Span, page_map: &PageMap) {
        unsafe {
            debug_assert_eq!((*span).status(), SpanStatus::Using);
            self.stats.add_deallocated((*span).num_pages());

            (*span).set_status(SpanStatus::Idle);
            (*span).set_size_class(0);
            page_map.remove(span);

            // Absorb an idle left neighbor: the merged span takes over its
            // first page.
            let prev = page_map.find_prev(span);
            if !prev.is_null() && (*prev).status() == SpanStatus::Idle {
                (*span).set_first_page((*prev).first_page());
                (*span).set_num_pages((*span).num_pages() + (*prev).num_pages());
                self.destroy_span(prev, page_map);
            }

            // Absorb an idle right neighbor.
            let next = page_map.find_next(span);
            if !next.is_null() && (*next).status() == SpanStatus::Idle {
                (*span).set_num_pages((*span).num_pages() + (*next).num_pages());
                self.destroy_span(next, page_map);
            }

            self.add_to_list(span);
            page_map.insert(span);
        }
    }

    /// Return every idle span to the system allocator. Shutdown only.
    ///
    /// # Safety
    ///
    /// No span may be handed out again afterwards; the caller must hold the
    /// heap mutex.
    pub unsafe fn release_all(&mut self, page_map: &PageMap, system: &SystemAlloc) {
        let mut released = 0usize;
        for idx in 0..NUM_LISTS {
            while !self.lists[idx].is_empty() {
                let span = self.lists[idx].first();
                released += 1;
                unsafe { self.return_to_system(span, page_map, system) };
            }
        }
        info!(spans = released, "page heap released all idle spans");
    }

    /// Number of idle spans across all free lists.
    pub fn free_span_count(&self) -> usize {
        self.lists.iter().map(|l| l.len()).sum()
    }

    pub fn stats(&self) -> &TierStats {
        &self.stats
    }

    pub fn log_stats(&self) {
        info!(
            fetched_bytes = self.stats.fetched(),
            returned_bytes = self.stats.returned(),
            allocated_pages = self.stats.allocated(),
            deallocated_pages = self.stats.deallocated(),
            "page heap stats"
        );
    }
}

impl Default for PageHeap {
    fn default() -> Self {
        Self::new()
    }
}
