//! Address-to-span reverse lookup.
//!
//! An ordered map from span start address to span, shared by every tier:
//! the central cache routes freed objects to their owning span through it,
//! and the page heap asks it for address-adjacent neighbors when coalescing.
//! Every live span is registered here under its first address.

use crate::span::Span;
use core::ptr;
use parking_lot::Mutex;
use std::collections::BTreeMap;

#[derive(Clone, Copy)]
struct SpanPtr(*mut Span);

// SAFETY: raw span pointers are just keys here; the map never dereferences
// them except under the registration invariant (only live spans are mapped).
unsafe impl Send for SpanPtr {}

pub struct PageMap {
    map: Mutex<BTreeMap<usize, SpanPtr>>,
}

impl PageMap {
    pub const fn new() -> Self {
        Self {
            map: Mutex::new(BTreeMap::new()),
        }
    }

    /// Register `span` under its current start address.
    ///
    /// # Safety
    ///
    /// `span` must point to a live span and stay live until removed.
    pub unsafe fn insert(&self, span: *mut Span) {
        let start = unsafe { (*span).start_addr() };
        self.map.lock().insert(start, SpanPtr(span));
    }

    /// Deregister `span` from its current start address.
    ///
    /// # Safety
    ///
    /// `span` must point to a live span.
    pub unsafe fn remove(&self, span: *mut Span) {
        let start = unsafe { (*span).start_addr() };
        self.map.lock().remove(&start);
    }

    /// Find the registered span containing `addr`, or null.
    pub fn find(&self, addr: usize) -> *mut Span {
        let map = self.map.lock();
        match map.range(..=addr).next_back() {
            Some((_, entry)) => {
                let span = entry.0;
                // The greatest start <= addr only wins if addr is inside.
                if addr < unsafe { (*span).end_addr() } {
                    span
                } else {
                    ptr::null_mut()
                }
            }
            None => ptr::null_mut(),
        }
    }

    /// Find the span ending exactly where `span` begins, or null.
    ///
    /// # Safety
    ///
    /// `span` must point to a live span.
    pub unsafe fn find_prev(&self, span: *mut Span) -> *mut Span {
        let start = unsafe { (*span).start_addr() };
        if start == 0 {
            return ptr::null_mut();
        }
        self.find(start - 1)
    }

    /// Find the span starting exactly where `span` ends, or null.
    ///
    /// # Safety
    ///
    /// `span` must point to a live span.
    pub unsafe fn find_next(&self, span: *mut Span) -> *mut Span {
        self.find(unsafe { (*span).end_addr() })
    }

    /// Start addresses of every registered span, in address order.
    pub fn starts(&self) -> Vec<usize> {
        self.map.lock().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }
}
