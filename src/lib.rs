#![deny(unsafe_op_in_unsafe_fn)]

//! spanpool: a tcmalloc-style pool allocator.
//!
//! Serves small and medium objects from a three-tier cache hierarchy:
//! - Thread caches (fast path, no locks)
//! - Central cache (per-size-class locking, batched object transfer)
//! - Page heap (span carving/coalescing, OS interface)
//!
//! Objects of up to 256 KiB are bucketed into size classes and recycled
//! through per-thread free lists; larger requests are passed straight
//! through to the system allocator.
//!
//! # Usage
//!
//! ```ignore
//! let p = spanpool::alloc(64);
//! assert!(!p.is_null());
//! spanpool::dealloc(p);
//! ```

pub mod api;
pub mod central_cache;
pub mod free_list;
pub mod page_heap;
pub mod page_map;
pub mod size_class;
pub mod span;
pub mod stats;
pub mod system_alloc;
pub mod thread_cache;

/// Page size used by the allocator (8 KiB).
pub const PAGE_SHIFT: usize = 13;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

// Re-export the public allocation surface at crate root for convenience
pub use api::{alloc, dealloc, drain_thread_cache, init_logging, shutdown};
