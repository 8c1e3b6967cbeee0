//! Intrusive singly-linked free lists.
//!
//! Free objects are threaded together through their own first word: a free
//! slot of any size class doubles as a [`FreeObject`] node. The minimum
//! object size in the class table guarantees room for the link.

use core::ptr;

/// Overlay for a free object: the first word of the slot is the link to the
/// next free object.
#[repr(C)]
pub struct FreeObject {
    pub next: *mut FreeObject,
}

/// Singly-linked list of free objects. Head and count only; object identity
/// is its address.
pub struct FreeList {
    head: *mut FreeObject,
    len: usize,
}

impl FreeList {
    pub const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    #[inline]
    pub fn push(&mut self, obj: *mut FreeObject) {
        unsafe { (*obj).next = self.head };
        self.head = obj;
        self.len += 1;
    }

    #[inline]
    pub fn pop(&mut self) -> *mut FreeObject {
        let obj = self.head;
        if !obj.is_null() {
            self.head = unsafe { (*obj).next };
            self.len -= 1;
        }
        obj
    }

    /// Link `batch` into a chain and splice it in front of the current head.
    pub fn push_batch(&mut self, batch: &[*mut FreeObject]) {
        if batch.is_empty() {
            return;
        }
        for i in 0..batch.len() - 1 {
            unsafe { (*batch[i]).next = batch[i + 1] };
        }
        unsafe { (*batch[batch.len() - 1]).next = self.head };
        self.head = batch[0];
        self.len += batch.len();
    }

    /// Pop up to `batch.len()` objects into the front of `batch`.
    /// Returns how many were actually popped.
    pub fn pop_batch(&mut self, batch: &mut [*mut FreeObject]) -> usize {
        let n = batch.len().min(self.len);
        for slot in batch.iter_mut().take(n) {
            let obj = self.head;
            self.head = unsafe { (*obj).next };
            *slot = obj;
        }
        self.len -= n;
        n
    }
}

impl Default for FreeList {
    fn default() -> Self {
        Self::new()
    }
}

/// A [`FreeList`] extended with the counters driving per-thread quota
/// adaptation: `max_length` is the current cap, `length_overages` counts
/// consecutive overflows since the last shrink, and `low_water` tracks the
/// minimum length since it was last cleared.
pub struct DynamicFreeList {
    list: FreeList,
    low_water: usize,
    max_length: usize,
    length_overages: usize,
}

impl DynamicFreeList {
    pub const fn new() -> Self {
        Self {
            list: FreeList::new(),
            low_water: 0,
            max_length: 1, // Start small, grows adaptively
            length_overages: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.list.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    #[inline]
    pub fn push(&mut self, obj: *mut FreeObject) {
        self.list.push(obj);
    }

    pub fn push_batch(&mut self, batch: &[*mut FreeObject]) {
        self.list.push_batch(batch);
    }

    #[inline]
    pub fn pop(&mut self) -> *mut FreeObject {
        let obj = self.list.pop();
        if self.list.len() < self.low_water {
            self.low_water = self.list.len();
        }
        obj
    }

    pub fn pop_batch(&mut self, batch: &mut [*mut FreeObject]) -> usize {
        let n = self.list.pop_batch(batch);
        if self.list.len() < self.low_water {
            self.low_water = self.list.len();
        }
        n
    }

    pub fn low_water(&self) -> usize {
        self.low_water
    }

    /// Restart low-water tracking from the current length.
    pub fn clear_low_water(&mut self) {
        self.low_water = self.list.len();
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn set_max_length(&mut self, max_length: usize) {
        self.max_length = max_length;
    }

    pub fn length_overages(&self) -> usize {
        self.length_overages
    }

    pub fn bump_length_overages(&mut self) {
        self.length_overages += 1;
    }

    pub fn reset_length_overages(&mut self) {
        self.length_overages = 0;
    }
}

impl Default for DynamicFreeList {
    fn default() -> Self {
        Self::new()
    }
}
