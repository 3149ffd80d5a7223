//! Hazard-pointer memory reclamation.
//!
//! A [`HazardDomain`] is a process-wide registry of participating threads.
//! Each registered thread publishes the pointers it is about to dereference
//! in per-thread hazard slots, and hands logically unreachable nodes to
//! [`HazardThread::retire`]. A retired node is freed only once a scan of
//! every active thread's published slots proves that nobody can still
//! dereference it.
//!
//! Thread records are pushed onto a lock-free stack and are never
//! individually freed: an unregistering thread merely drops to inactive so
//! that concurrent scans can keep walking the stack. The records, their
//! slots, and any retired entries still pinned by a published hazard are
//! reclaimed when the domain itself is dropped.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{fence, AtomicPtr, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_utils::Backoff;

use crate::ptr_set::PtrSet;

/// Frees one retired node. Invoked on the reclaiming thread once the node
/// is proven unreachable from every published hazard slot.
pub type ReclaimFn = unsafe fn(node: *mut ());

const DEFAULT_RECLAIM_THRESHOLD: usize = 1;

/// A published-pointer cell.
///
/// Slots are allocated lazily, linked into a per-thread list, and never
/// unlinked; a slot whose `node` is null is free for reuse by its owning
/// thread. Keeping the list append-only lets a concurrent scan traverse it
/// without coordination.
#[repr(C)]
pub struct HazardSlot {
    node: AtomicPtr<()>,
    next: AtomicPtr<HazardSlot>,
}

struct RetiredEntry {
    next: *mut RetiredEntry,
    node: *mut (),
    reclaim: ReclaimFn,
}

#[repr(C)]
struct ThreadRecord {
    next: AtomicPtr<ThreadRecord>,
    active: AtomicU32,
    slots: AtomicPtr<HazardSlot>,
    // private to the owning thread until the domain is dropped
    retired: UnsafeCell<*mut RetiredEntry>,
    retired_count: UnsafeCell<usize>,
}

/// A process-wide hazard-pointer registry.
///
/// Dropping the domain frees every thread record, slot, and outstanding
/// retired entry. The caller must guarantee quiescence at that point: all
/// threads unregistered and no operation in flight.
pub struct HazardDomain {
    head: AtomicPtr<ThreadRecord>,
    reclaim_threshold: AtomicUsize,
    // retired entries handed over by unregistering threads
    orphans: AtomicPtr<RetiredEntry>,
}

// The raw record/entry pointers are owned by the domain; all cross-thread
// access goes through atomics.
unsafe impl Send for HazardDomain {}
unsafe impl Sync for HazardDomain {}

impl HazardDomain {
    /// Create a new domain with the default reclamation threshold.
    pub fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            reclaim_threshold: AtomicUsize::new(DEFAULT_RECLAIM_THRESHOLD),
            orphans: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Set how many retired nodes a thread accumulates before it scans.
    ///
    /// Returns `false` (and changes nothing) if `threshold` is zero. There
    /// is no ordering guarantee with retires already in flight.
    #[must_use]
    pub fn set_reclaim_threshold(&self, threshold: usize) -> bool {
        if threshold == 0 {
            log::error!("invalid reclaim threshold 0, keeping previous value");
            return false;
        }
        self.reclaim_threshold.store(threshold, Ordering::Relaxed);
        true
    }

    /// Register the calling thread with the domain.
    ///
    /// The returned handle unregisters on drop. Handles are single-owner;
    /// each participating thread registers for itself.
    pub fn register(self: &Arc<Self>) -> HazardThread {
        let record = Box::into_raw(Box::new(ThreadRecord {
            next: AtomicPtr::new(ptr::null_mut()),
            active: AtomicU32::new(1),
            slots: AtomicPtr::new(ptr::null_mut()),
            retired: UnsafeCell::new(ptr::null_mut()),
            retired_count: UnsafeCell::new(0),
        }));

        let backoff = Backoff::new();
        loop {
            let head = self.head.load(Ordering::Relaxed);
            unsafe {
                (*record).next.store(head, Ordering::Relaxed);
            }
            if self
                .head
                .compare_exchange_weak(head, record, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
            backoff.spin();
        }

        HazardThread {
            domain: Arc::clone(self),
            record,
        }
    }

    /// Push a chain of retired entries onto the orphan list.
    fn adopt_retired(&self, chain: *mut RetiredEntry) {
        if chain.is_null() {
            return;
        }

        // find the tail of the chain, then splice it in with one CAS
        let mut tail = chain;
        unsafe {
            while !(*tail).next.is_null() {
                tail = (*tail).next;
            }
        }

        let backoff = Backoff::new();
        loop {
            let head = self.orphans.load(Ordering::Relaxed);
            unsafe {
                (*tail).next = head;
            }
            if self
                .orphans
                .compare_exchange_weak(head, chain, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
            backoff.spin();
        }
    }

    /// Snapshot every published hazard pointer of every active thread.
    fn collect_hazards(&self, expected: usize) -> PtrSet {
        let mut protected = PtrSet::with_capacity(expected);

        // order the hazard loads after the unlinking stores that preceded
        // the retire which triggered this scan
        fence(Ordering::SeqCst);

        let mut record = self.head.load(Ordering::Acquire);
        while !record.is_null() {
            unsafe {
                if (*record).active.load(Ordering::Acquire) == 1 {
                    let mut slot = (*record).slots.load(Ordering::Acquire);
                    while !slot.is_null() {
                        let node = (*slot).node.load(Ordering::Acquire);
                        if !node.is_null() {
                            protected.insert(node);
                        }
                        slot = (*slot).next.load(Ordering::Acquire);
                    }
                }
                record = (*record).next.load(Ordering::Acquire);
            }
        }

        protected
    }
}

impl Default for HazardDomain {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for HazardDomain {
    fn drop(&mut self) {
        unsafe {
            // entries handed over at unregister; every hazard is gone now
            let mut entry = *self.orphans.get_mut();
            while !entry.is_null() {
                let next = (*entry).next;
                ((*entry).reclaim)((*entry).node);
                drop(Box::from_raw(entry));
                entry = next;
            }

            let mut record = *self.head.get_mut();
            while !record.is_null() {
                let next = (*record).next.load(Ordering::Relaxed);

                // entries still owned by a leaked handle
                let mut entry = *(*record).retired.get();
                while !entry.is_null() {
                    let entry_next = (*entry).next;
                    ((*entry).reclaim)((*entry).node);
                    drop(Box::from_raw(entry));
                    entry = entry_next;
                }

                let mut slot = (*record).slots.load(Ordering::Relaxed);
                while !slot.is_null() {
                    let slot_next = (*slot).next.load(Ordering::Relaxed);
                    drop(Box::from_raw(slot));
                    slot = slot_next;
                }

                drop(Box::from_raw(record));
                record = next;
            }
        }
    }
}

/// One thread's registration with a [`HazardDomain`].
///
/// Dropping the handle runs a final reclamation pass, hands any still
/// pinned retired entries back to the domain, and marks the record
/// inactive. The record memory itself stays on the domain stack so that
/// in-flight scans on other threads never touch freed memory.
pub struct HazardThread {
    domain: Arc<HazardDomain>,
    record: *mut ThreadRecord,
}

// A handle may move to another thread, but it is single-owner: the record
// it points to is only ever mutated through the handle.
unsafe impl Send for HazardThread {}

impl HazardThread {
    /// The domain this thread is registered with.
    #[inline]
    pub fn domain(&self) -> &Arc<HazardDomain> {
        &self.domain
    }

    /// Publish `node` in a hazard slot.
    ///
    /// After this returns, the caller must re-validate that `node` is still
    /// reachable before dereferencing it; the publication is ordered before
    /// any subsequent load by the caller.
    pub fn acquire(&self, node: *mut ()) -> *mut HazardSlot {
        debug_assert!(!node.is_null());

        unsafe {
            let record = &*self.record;

            // reuse a free slot if one exists, otherwise grow the list
            let mut slot = record.slots.load(Ordering::Relaxed);
            while !slot.is_null() {
                if (*slot).node.load(Ordering::Relaxed).is_null() {
                    break;
                }
                slot = (*slot).next.load(Ordering::Relaxed);
            }

            if slot.is_null() {
                slot = Box::into_raw(Box::new(HazardSlot {
                    node: AtomicPtr::new(ptr::null_mut()),
                    next: AtomicPtr::new(record.slots.load(Ordering::Relaxed)),
                }));
                record.slots.store(slot, Ordering::Release);
            }

            (*slot).node.store(node, Ordering::Release);
            // order the publication before the caller's validation reread
            fence(Ordering::SeqCst);
            slot
        }
    }

    /// Clear a slot previously returned by [`acquire`](Self::acquire).
    ///
    /// # Safety
    ///
    /// `slot` must have been acquired through this handle and not released
    /// since.
    pub unsafe fn release(&self, slot: *mut HazardSlot) {
        debug_assert!(!slot.is_null());
        (*slot).node.store(ptr::null_mut(), Ordering::Release);
    }

    /// Hand a logically unreachable node to the domain for deferred
    /// reclamation.
    ///
    /// # Safety
    ///
    /// `node` must already be unreachable from every live data structure,
    /// and `reclaim` must be safe to call on it from any thread.
    pub unsafe fn retire(&self, node: *mut (), reclaim: ReclaimFn) {
        debug_assert!(!node.is_null());

        let record = &*self.record;
        let entry = Box::into_raw(Box::new(RetiredEntry {
            next: *record.retired.get(),
            node,
            reclaim,
        }));
        *record.retired.get() = entry;
        *record.retired_count.get() += 1;

        if *record.retired_count.get() >= self.domain.reclaim_threshold.load(Ordering::Relaxed) {
            self.scan();
        }
    }

    /// Free every retired node no longer covered by a published hazard.
    pub fn scan(&self) {
        unsafe {
            let record = &*self.record;
            let count = *record.retired_count.get();
            if count == 0 {
                return;
            }

            let threshold = self.domain.reclaim_threshold.load(Ordering::Relaxed);
            let protected = self.domain.collect_hazards(count.max(threshold));

            let mut prev: *mut RetiredEntry = ptr::null_mut();
            let mut entry = *record.retired.get();
            while !entry.is_null() {
                let next = (*entry).next;
                if protected.contains((*entry).node) {
                    prev = entry;
                } else {
                    ((*entry).reclaim)((*entry).node);
                    if prev.is_null() {
                        *record.retired.get() = next;
                    } else {
                        (*prev).next = next;
                    }
                    drop(Box::from_raw(entry));
                    *record.retired_count.get() -= 1;
                }
                entry = next;
            }
        }
    }
}

impl Drop for HazardThread {
    fn drop(&mut self) {
        self.scan();
        unsafe {
            let record = &*self.record;

            // whatever is still pinned becomes the domain's problem
            let chain = *record.retired.get();
            *record.retired.get() = ptr::null_mut();
            *record.retired_count.get() = 0;
            self.domain.adopt_retired(chain);

            record.active.store(0, Ordering::Release);
        }
    }
}
