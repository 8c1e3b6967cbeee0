//! OS memory acquisition: region reservation, commit, and lazy decommit.
//!
//! The allocator reserves virtual address space in 1 GiB regions mapped
//! `PROT_NONE` (address space only, no RAM) and peels committed chunks off
//! the high end with `mprotect`. Released pages are decommitted with
//! `madvise(MADV_DONTNEED)`; the reservation itself is never unmapped, so
//! the pages can be re-committed by later allocations.

use crate::stats::TierStats;
use crate::PAGE_SIZE;
use core::ptr;
use parking_lot::Mutex;
use tracing::{info, warn};

/// Minimum granularity of a region sub-allocation (also its alignment).
pub const MIN_SYSTEM_ALLOC: usize = 2 << 20; // 2 MiB

/// Size of one reserved region.
pub const MIN_REGION: usize = 1 << 30; // 1 GiB

/// Upper bound on any single request.
pub const MAX_MMAP: usize = 1 << 46;

const fn round_down(n: usize, align: usize) -> usize {
    n & !(align - 1)
}

const fn round_up(n: usize, align: usize) -> usize {
    round_down(n + align - 1, align)
}

/// The live portion of the current reservation: `[start, end)` is still
/// unclaimed; sub-allocations peel from `end` downward.
struct Region {
    start: usize,
    end: usize,
}

pub struct SystemAlloc {
    region: Mutex<Region>,
    stats: TierStats,
}

impl SystemAlloc {
    pub const fn new() -> Self {
        Self {
            region: Mutex::new(Region { start: 0, end: 0 }),
            stats: TierStats::new(),
        }
    }

    /// Acquire at least `n` bytes aligned to `align`. Returns the committed
    /// pointer and the actual byte count (a multiple of the page size); the
    /// caller owns exactly that many bytes. Null on exhaustion.
    pub fn alloc(&self, n: usize, align: usize) -> Option<(*mut u8, usize)> {
        let align = align.max(MIN_SYSTEM_ALLOC);
        let n = round_up(n, align);

        if n > MAX_MMAP || align > MAX_MMAP {
            warn!(bytes = n, align, "system allocation over the mmap limit");
            return None;
        }

        // Requests too big for a region get their own mapping and are not
        // tracked further: their address space is never reused.
        if n > MIN_REGION || align > MIN_REGION {
            return match Self::mmap_aligned(n, align, true) {
                Some(p) => {
                    self.stats.add_allocated(n);
                    info!(bytes = n, align, "super allocation mapped directly");
                    Some((p, n))
                }
                None => {
                    warn!(bytes = n, align, "super allocation failed");
                    None
                }
            };
        }

        let mut region = self.region.lock();
        if region.start != 0 {
            if let Some(r) = self.carve(&mut region, n, align) {
                return Some(r);
            }
        }

        // Current region exhausted (or none yet): reserve a fresh one and
        // retry. The remainder of the old region is abandoned.
        info!("region exhausted, reserving a new one");
        let ptr = match Self::mmap_aligned(MIN_REGION, MIN_REGION, false) {
            Some(p) => p,
            None => {
                warn!("reserving a new region failed");
                return None;
            }
        };
        region.start = ptr as usize;
        region.end = ptr as usize + MIN_REGION;
        self.carve(&mut region, n, align)
    }

    /// Peel `n` bytes off the high end of the region and commit them.
    fn carve(&self, region: &mut Region, n: usize, align: usize) -> Option<(*mut u8, usize)> {
        let res = round_down(region.end.checked_sub(n)?, align);
        if res < region.start {
            return None;
        }
        let actual = region.end - res;
        let ok = unsafe {
            libc::mprotect(
                res as *mut libc::c_void,
                actual,
                libc::PROT_READ | libc::PROT_WRITE,
            ) == 0
        };
        if !ok {
            warn!(
                err = %std::io::Error::last_os_error(),
                bytes = actual,
                "commit failed"
            );
            return None;
        }
        region.end = res;
        self.stats.add_allocated(actual);
        Some((res as *mut u8, actual))
    }

    /// Map `n` bytes with at least `align` alignment. Over-maps by
    /// `align - 1` and returns the first aligned address inside.
    fn mmap_aligned(n: usize, align: usize, commit: bool) -> Option<*mut u8> {
        let len = n + align - 1;
        let prot = if commit {
            libc::PROT_READ | libc::PROT_WRITE
        } else {
            libc::PROT_NONE
        };
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                prot,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return None;
        }
        let addr = ptr as usize;
        Some((addr + (align - addr % align) % align) as *mut u8)
    }

    /// Tell the kernel the whole pages inside `[ptr, ptr + n)` are no longer
    /// needed. The address space stays reserved for later re-commit.
    /// Returns false if no whole page fits or the advice failed.
    ///
    /// # Safety
    ///
    /// The range must have come from `alloc` and must not be accessed again
    /// until re-allocated.
    pub unsafe fn dealloc(&self, ptr: *mut u8, n: usize) -> bool {
        let start = round_up(ptr as usize, PAGE_SIZE);
        let end = round_down(ptr as usize + n, PAGE_SIZE);
        if end <= start {
            return false;
        }
        self.stats.add_deallocated(end - start);

        loop {
            let res = unsafe {
                libc::madvise(
                    start as *mut libc::c_void,
                    end - start,
                    libc::MADV_DONTNEED,
                )
            };
            if res == 0 {
                return true;
            }
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EAGAIN) {
                warn!(%err, "madvise failed");
                return false;
            }
        }
    }

    pub fn stats(&self) -> &TierStats {
        &self.stats
    }

    pub fn log_stats(&self) {
        info!(
            allocated_bytes = self.stats.allocated(),
            deallocated_bytes = self.stats.deallocated(),
            "system allocator stats"
        );
    }
}
