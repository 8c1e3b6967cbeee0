//! Public allocation surface: process-wide tier singletons, the
//! `alloc`/`dealloc` entry points, thread cache lifecycle and shutdown.
//!
//! Lock order when tiers nest: central cache class mutex, then the page
//! heap mutex, then the page map mutex (inner-most); the system allocator
//! keeps its own. Every call chain below observes that order.

use crate::central_cache::CentralCache;
use crate::free_list::FreeObject;
use crate::page_heap::PageHeap;
use crate::page_map::PageMap;
use crate::size_class;
use crate::span::{Span, SpanStatus};
use crate::stats::StatsSnapshot;
use crate::system_alloc::SystemAlloc;
use crate::thread_cache::ThreadCache;
use crate::PAGE_SIZE;
use core::ptr;
use parking_lot::Mutex;
use std::cell::UnsafeCell;
use tracing::{error, info};

// =============================================================================
// Global static state
// =============================================================================

static PAGE_MAP: PageMap = PageMap::new();
static SYSTEM_ALLOC: SystemAlloc = SystemAlloc::new();
static PAGE_HEAP: Mutex<PageHeap> = Mutex::new(PageHeap::new());
static CENTRAL_CACHE: CentralCache = CentralCache::new();

// =============================================================================
// Thread-local cache
// =============================================================================

/// Wrapper whose drop drains the cache back to the central cache at thread
/// exit. Leaving objects stranded would trip the shutdown assertion.
struct CacheSlot {
    cache: ThreadCache,
}

impl Drop for CacheSlot {
    fn drop(&mut self) {
        unsafe { self.cache.drain(&CENTRAL_CACHE, &PAGE_HEAP, &PAGE_MAP) };
    }
}

thread_local! {
    static THREAD_CACHE: UnsafeCell<CacheSlot> = UnsafeCell::new(CacheSlot {
        cache: ThreadCache::new(),
    });
}

/// Try to access the thread-local cache. Returns None if TLS is not
/// available (during thread startup/shutdown).
#[inline]
fn with_thread_cache<R>(f: impl FnOnce(&mut ThreadCache) -> R) -> Option<R> {
    THREAD_CACHE
        .try_with(|cell| {
            // SAFETY: we are the only accessor on this thread; nothing in
            // the allocation paths re-enters the thread cache.
            unsafe { f(&mut (*cell.get()).cache) }
        })
        .ok()
}

// =============================================================================
// Public API
// =============================================================================

/// Allocate `size` bytes. Returns null for zero-size requests and on
/// exhaustion. Sizes above the largest class bypass the cache tiers and map
/// straight from the system allocator.
pub fn alloc(size: usize) -> *mut u8 {
    if size == 0 {
        return ptr::null_mut();
    }

    let class = size_class::size_to_class(size);
    if class == 0 {
        return alloc_huge(size);
    }

    match with_thread_cache(|tc| unsafe {
        tc.alloc(class, &CENTRAL_CACHE, &PAGE_HEAP, &PAGE_MAP, &SYSTEM_ALLOC)
    }) {
        Some(p) => p,
        // TLS unavailable: go directly to the central cache.
        None => unsafe { alloc_from_central(class) },
    }
}

/// Free a pointer previously returned by [`alloc`]. The owning span (and
/// with it the size class) is recovered through the page map; null and
/// unknown pointers are ignored.
pub fn dealloc(ptr_: *mut u8) {
    if ptr_.is_null() {
        return;
    }

    let span = PAGE_MAP.find(ptr_ as usize);
    if span.is_null() {
        error!(ptr = ?ptr_, "free of a pointer the allocator does not own");
        return;
    }

    let class = unsafe { (*span).size_class() };
    if class == 0 {
        // Class 0 with idle status is a page-heap span, not a huge
        // allocation: the pointer was already freed or never handed out.
        if unsafe { (*span).status() } != SpanStatus::Using {
            error!(ptr = ?ptr_, "free of a pointer inside an idle span");
            return;
        }
        unsafe { dealloc_huge(span) };
        return;
    }

    if with_thread_cache(|tc| unsafe {
        tc.dealloc(class, ptr_, &CENTRAL_CACHE, &PAGE_HEAP, &PAGE_MAP)
    })
    .is_none()
    {
        // TLS unavailable: return directly to the central cache.
        unsafe { dealloc_to_central(ptr_, class) };
    }
}

/// Return every object cached by the calling thread to the central cache.
/// Runs automatically at thread exit; call it on the main thread before
/// [`shutdown`].
pub fn drain_thread_cache() {
    with_thread_cache(|tc| unsafe { tc.drain(&CENTRAL_CACHE, &PAGE_HEAP, &PAGE_MAP) });
}

/// Tear down the hierarchy in reverse tier order: assert the central cache
/// has drained, hand every idle span back to the OS, and log per-tier
/// stats. All worker threads must have exited and the calling thread must
/// have drained first.
pub fn shutdown() {
    info!("allocator shutdown start");
    drain_thread_cache();

    CENTRAL_CACHE.verify_empty();
    CENTRAL_CACHE.log_stats();

    {
        let mut heap = PAGE_HEAP.lock();
        unsafe { heap.release_all(&PAGE_MAP, &SYSTEM_ALLOC) };
        heap.log_stats();
    }

    SYSTEM_ALLOC.log_stats();
    info!("allocator shutdown end");
}

/// Install a `tracing` subscriber reading `RUST_LOG`, defaulting to info
/// level for this crate. Safe to call more than once.
pub fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("spanpool=info"));
    fmt().with_env_filter(filter).compact().try_init().ok();
}

/// Usable size of an allocation: its class size for small objects, the
/// whole mapped range for huge ones, zero for pointers the allocator does
/// not own.
pub fn allocation_size(ptr_: *mut u8) -> usize {
    if ptr_.is_null() {
        return 0;
    }
    let span = PAGE_MAP.find(ptr_ as usize);
    if span.is_null() {
        return 0;
    }
    let class = unsafe { (*span).size_class() };
    if class == 0 {
        unsafe { (*span).num_bytes() }
    } else {
        size_class::class_to_size(class)
    }
}

pub fn central_stats() -> StatsSnapshot {
    CENTRAL_CACHE.stats().snapshot()
}

pub fn page_heap_stats() -> StatsSnapshot {
    PAGE_HEAP.lock().stats().snapshot()
}

pub fn system_stats() -> StatsSnapshot {
    SYSTEM_ALLOC.stats().snapshot()
}

// =============================================================================
// Slow paths
// =============================================================================

/// Single-object pull when the thread cache is unreachable.
unsafe fn alloc_from_central(class: usize) -> *mut u8 {
    let mut batch = [ptr::null_mut::<FreeObject>(); 1];
    let got = unsafe {
        CENTRAL_CACHE.alloc(class, &mut batch, &PAGE_HEAP, &PAGE_MAP, &SYSTEM_ALLOC)
    };
    if got == 0 {
        ptr::null_mut()
    } else {
        batch[0] as *mut u8
    }
}

/// Single-object return when the thread cache is unreachable.
unsafe fn dealloc_to_central(ptr_: *mut u8, class: usize) {
    let batch = [ptr_ as *mut FreeObject; 1];
    unsafe { CENTRAL_CACHE.dealloc(class, &batch, &PAGE_HEAP, &PAGE_MAP) };
}

/// Requests above the largest size class: map directly, register a using
/// span so `dealloc` can route the pointer back here. The pages never touch
/// the page heap.
fn alloc_huge(size: usize) -> *mut u8 {
    match SYSTEM_ALLOC.alloc(size, PAGE_SIZE) {
        None => ptr::null_mut(),
        Some((start, actual)) => {
            let span = Box::into_raw(Box::new(Span::new(start, actual / PAGE_SIZE)));
            unsafe {
                (*span).set_status(SpanStatus::Using);
                PAGE_MAP.insert(span);
            }
            start
        }
    }
}

/// Free a huge allocation: decommit its pages and destroy the span.
unsafe fn dealloc_huge(span: *mut Span) {
    unsafe {
        debug_assert_eq!((*span).status(), SpanStatus::Using);
        PAGE_MAP.remove(span);
        let start = (*span).start_addr() as *mut u8;
        let bytes = (*span).num_bytes();
        drop(Box::from_raw(span));
        SYSTEM_ALLOC.dealloc(start, bytes);
    }
}
