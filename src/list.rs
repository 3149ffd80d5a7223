//! Lock-free singly linked list.
//!
//! An unordered list of reference-counted intrusive nodes, protected by
//! hazard pointers. Insertion pushes at the head; deletion marks the low
//! bit of the victim's `next` pointer before unlinking it, so that a
//! concurrent delete of the predecessor is detected and rolled back.
//!
//! Traversal is hand-over-hand: at most two hazard slots are held, one for
//! the current node and one for its predecessor. After publishing a hazard
//! for a node, the link it was read from is reread and compared against the
//! stripped pointer; any change (including a freshly set mark) forces a
//! restart from the head.

use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crossbeam_utils::Backoff;

use crate::hp::{HazardDomain, HazardSlot, HazardThread};
use crate::marked::{is_marked, strip, with_mark, MarkedPtr};

/// Cleanup callback invoked once per node, on the reclaiming thread, just
/// before the node memory is freed. Must not call back into the list.
pub type CleanupFn<T> = unsafe fn(ctx: *mut (), item: *mut ListEntry<T>);

/// Outcome of a delete operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteResult {
    /// The node was unlinked and retired.
    Ok,
    /// No matching node is in the list.
    NotFound,
}

/// An intrusive, reference-counted list node with embedded payload.
///
/// Nodes are created with [`ListEntry::alloc`] holding one reference owned
/// by whoever links them into a list. [`ListEntry::release`] drops a
/// reference; the node is freed (after running its cleanup callback) when
/// the count reaches zero, which for deleted nodes happens through hazard
/// pointer reclamation.
#[repr(C)]
pub struct ListEntry<T> {
    next: MarkedPtr<ListEntry<T>>,
    ref_count: AtomicU32,
    cleanup: Option<CleanupFn<T>>,
    cleanup_ctx: *mut (),
    data: T,
}

impl<T> ListEntry<T> {
    /// Heap-allocate a node with a reference count of one.
    pub fn alloc(data: T, cleanup: Option<CleanupFn<T>>, cleanup_ctx: *mut ()) -> *mut ListEntry<T> {
        Box::into_raw(Box::new(ListEntry {
            next: MarkedPtr::null(),
            ref_count: AtomicU32::new(1),
            cleanup,
            cleanup_ctx,
            data,
        }))
    }

    /// Borrow the payload.
    #[inline]
    pub fn data(&self) -> &T {
        &self.data
    }

    /// Take an additional reference.
    ///
    /// # Safety
    ///
    /// `item` must point to a live node (reference count above zero).
    pub unsafe fn inc_ref(item: *mut ListEntry<T>) {
        (*item).ref_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop a reference; at zero, run the cleanup callback and free.
    ///
    /// # Safety
    ///
    /// The caller must own the reference being dropped.
    pub unsafe fn release(item: *mut ListEntry<T>) {
        if (*item).ref_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Some(cleanup) = (*item).cleanup {
                cleanup((*item).cleanup_ctx, item);
            }
            drop(Box::from_raw(item));
        }
    }
}

unsafe fn reclaim_entry<T>(node: *mut ()) {
    ListEntry::release(node as *mut ListEntry<T>);
}

/// A lock-free singly linked list.
pub struct LockFreeList<T> {
    head: MarkedPtr<ListEntry<T>>,
    domain: Arc<HazardDomain>,
}

// Nodes are shared across threads; payload access follows the hazard
// pointer protocol and cleanup contexts must themselves be thread-safe.
unsafe impl<T: Send> Send for LockFreeList<T> {}
unsafe impl<T: Send + Sync> Sync for LockFreeList<T> {}

impl<T> LockFreeList<T> {
    /// Create an empty list retiring into `domain`.
    pub fn new(domain: Arc<HazardDomain>) -> Self {
        Self {
            head: MarkedPtr::null(),
            domain,
        }
    }

    /// The hazard-pointer domain nodes of this list retire into.
    #[inline]
    pub fn domain(&self) -> &Arc<HazardDomain> {
        &self.domain
    }

    /// Push a node at the head of the list.
    ///
    /// # Safety
    ///
    /// `item` must come from [`ListEntry::alloc`] and not be linked into
    /// any list.
    pub unsafe fn insert(&self, item: *mut ListEntry<T>) {
        let backoff = Backoff::new();
        loop {
            let head = self.head.load(Ordering::Acquire);
            (*item).next.store(head, Ordering::Relaxed);
            if self
                .head
                .compare_exchange(head, item, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
            backoff.spin();
        }
    }

    /// Unlink and retire a specific node.
    ///
    /// # Safety
    ///
    /// `item` must have been inserted into this list (it may have been
    /// deleted concurrently, in which case `NotFound` is returned).
    pub unsafe fn delete(&self, thread: &HazardThread, item: *mut ListEntry<T>) -> DeleteResult {
        self.internal_delete(thread, |node| node == item)
    }

    /// Unlink and retire the first node whose payload matches `pred`.
    pub fn delete_where(
        &self,
        thread: &HazardThread,
        pred: impl Fn(&T) -> bool,
    ) -> DeleteResult {
        self.internal_delete(thread, |node| unsafe { pred(&(*node).data) })
    }

    /// Find the first node whose payload matches `pred`.
    ///
    /// On a hit the node's reference count is incremented while it is still
    /// hazard-protected; the caller owns that reference and drops it with
    /// [`ListEntry::release`]. Returns null if nothing matches.
    pub fn find(&self, thread: &HazardThread, pred: impl Fn(&T) -> bool) -> *mut ListEntry<T> {
        let backoff = Backoff::new();
        'restart: loop {
            let mut prev_slot: *mut HazardSlot = ptr::null_mut();
            let mut curr_addr: *const MarkedPtr<ListEntry<T>> = &self.head;

            loop {
                let curr_raw = unsafe { (*curr_addr).load(Ordering::Acquire) };
                let curr = strip(curr_raw);
                if curr.is_null() {
                    unsafe { self.release_slot(thread, prev_slot) };
                    return ptr::null_mut();
                }

                let curr_slot = thread.acquire(curr as *mut ());
                // validation reread against the stripped pointer
                if unsafe { (*curr_addr).load(Ordering::Acquire) } != curr {
                    unsafe {
                        self.release_slot(thread, prev_slot);
                        thread.release(curr_slot);
                    }
                    backoff.spin();
                    continue 'restart;
                }

                unsafe {
                    if pred(&(*curr).data) {
                        ListEntry::inc_ref(curr);
                        self.release_slot(thread, prev_slot);
                        thread.release(curr_slot);
                        return curr;
                    }

                    self.release_slot(thread, prev_slot);
                    prev_slot = curr_slot;
                    curr_addr = &(*curr).next;
                }
            }
        }
    }

    /// First node in the list without any protection.
    ///
    /// # Safety
    ///
    /// Requires quiescence: no concurrent mutation of the list.
    pub unsafe fn first_not_thread_safe(&self) -> *mut ListEntry<T> {
        strip(self.head.load(Ordering::Acquire))
    }

    /// Successor of a node without any protection.
    ///
    /// # Safety
    ///
    /// Requires quiescence, and `item` must be a live node of this list.
    pub unsafe fn next_not_thread_safe(&self, item: *mut ListEntry<T>) -> *mut ListEntry<T> {
        strip((*item).next.load(Ordering::Acquire))
    }

    #[inline]
    unsafe fn release_slot(&self, thread: &HazardThread, slot: *mut HazardSlot) {
        if !slot.is_null() {
            thread.release(slot);
        }
    }

    fn internal_delete(
        &self,
        thread: &HazardThread,
        matches: impl Fn(*mut ListEntry<T>) -> bool,
    ) -> DeleteResult {
        let backoff = Backoff::new();
        'restart: loop {
            let mut prev_slot: *mut HazardSlot = ptr::null_mut();
            let mut prev: *mut ListEntry<T> = ptr::null_mut();
            let mut curr_addr: *const MarkedPtr<ListEntry<T>> = &self.head;

            loop {
                let curr_raw = unsafe { (*curr_addr).load(Ordering::Acquire) };
                let curr = strip(curr_raw);
                if curr.is_null() {
                    unsafe { self.release_slot(thread, prev_slot) };
                    return DeleteResult::NotFound;
                }

                let curr_slot = thread.acquire(curr as *mut ());
                if unsafe { (*curr_addr).load(Ordering::Acquire) } != curr {
                    unsafe {
                        self.release_slot(thread, prev_slot);
                        thread.release(curr_slot);
                    }
                    backoff.spin();
                    continue 'restart;
                }

                if !matches(curr) {
                    unsafe {
                        self.release_slot(thread, prev_slot);
                        prev_slot = curr_slot;
                        prev = curr;
                        curr_addr = &(*curr).next;
                    }
                    continue;
                }

                unsafe {
                    let next_raw = (*curr).next.load(Ordering::Acquire);
                    if is_marked(next_raw) {
                        // another delete owns this node
                        self.release_slot(thread, prev_slot);
                        thread.release(curr_slot);
                        backoff.spin();
                        continue 'restart;
                    }
                    let next = strip(next_raw);

                    // mark first so concurrent deletes of the successor fail
                    if (*curr)
                        .next
                        .compare_exchange(next, with_mark(next), Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                    {
                        self.release_slot(thread, prev_slot);
                        thread.release(curr_slot);
                        backoff.spin();
                        continue 'restart;
                    }

                    let prev_link: &MarkedPtr<ListEntry<T>> = if prev.is_null() {
                        &self.head
                    } else {
                        &(*prev).next
                    };
                    if prev_link
                        .compare_exchange(curr, next, Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                    {
                        // predecessor is being deleted itself; roll back the mark
                        let _ = (*curr).next.compare_exchange(
                            with_mark(next),
                            next,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        );
                        self.release_slot(thread, prev_slot);
                        thread.release(curr_slot);
                        backoff.spin();
                        continue 'restart;
                    }

                    self.release_slot(thread, prev_slot);
                    thread.release(curr_slot);
                    thread.retire(curr as *mut (), reclaim_entry::<T>);
                    return DeleteResult::Ok;
                }
            }
        }
    }
}

impl<T> Drop for LockFreeList<T> {
    fn drop(&mut self) {
        // single-threaded teardown, no retire path
        unsafe {
            let mut node = strip(self.head.load(Ordering::Relaxed));
            while !node.is_null() {
                let next = strip((*node).next.load(Ordering::Relaxed));
                ListEntry::release(node);
                node = next;
            }
        }
    }
}
