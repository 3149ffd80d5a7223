//! Atomic pointer-with-mark cell.
//!
//! The list algorithms in this crate steal the low bit of a node's `next`
//! pointer to mark the node as logically deleted before it is physically
//! unlinked. All node types are `#[repr(C)]` structures headed by
//! pointer-sized fields, so allocations are at least pointer-aligned and
//! the low bit is always available.

use core::sync::atomic::{AtomicPtr, Ordering};

const MARK: usize = 0x1;

/// Strip the deletion mark from a raw pointer.
#[inline]
pub(crate) fn strip<T>(ptr: *mut T) -> *mut T {
    ((ptr as usize) & !MARK) as *mut T
}

/// Set the deletion mark on a raw pointer.
#[inline]
pub(crate) fn with_mark<T>(ptr: *mut T) -> *mut T {
    ((ptr as usize) | MARK) as *mut T
}

/// Check whether the deletion mark is set.
#[inline]
pub(crate) fn is_marked<T>(ptr: *mut T) -> bool {
    (ptr as usize) & MARK != 0
}

/// An atomic pointer whose low bit carries a logical-deletion mark.
///
/// Loads return the raw word, mark included. Callers strip the mark with
/// [`strip`] before dereferencing and preserve it in every compare-exchange.
#[repr(transparent)]
pub(crate) struct MarkedPtr<T> {
    inner: AtomicPtr<T>,
}

impl<T> MarkedPtr<T> {
    #[inline]
    pub(crate) const fn null() -> Self {
        Self {
            inner: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    /// Load the raw word, mark included.
    #[inline]
    pub(crate) fn load(&self, order: Ordering) -> *mut T {
        self.inner.load(order)
    }

    #[inline]
    pub(crate) fn store(&self, ptr: *mut T, order: Ordering) {
        self.inner.store(ptr, order);
    }

    /// Compare-exchange on the raw word. `current` and `new` carry their
    /// marks verbatim, so a mark set by a concurrent delete fails the
    /// exchange.
    #[inline]
    pub(crate) fn compare_exchange(
        &self,
        current: *mut T,
        new: *mut T,
        success: Ordering,
        failure: Ordering,
    ) -> Result<*mut T, *mut T> {
        self.inner.compare_exchange(current, new, success, failure)
    }
}
