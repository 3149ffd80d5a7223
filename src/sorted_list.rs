//! Lock-free sorted singly linked list.
//!
//! Nodes are kept in strictly increasing key order; the key is derived from
//! the embedded payload through an accessor function supplied at
//! construction. Deletion follows the same mark-then-unlink protocol as the
//! unordered list, and every mutation can be stamped with a strictly
//! increasing sequence number drawn from a shared counter.
//!
//! A sequence number generated for an operation whose effect will never be
//! observed (a duplicate insert, or a stamp overwritten before the
//! operation committed) is announced through the skipped-sequence-number
//! callback, so a downstream consumer can keep a gap-free log.
//!
//! Mutations pass through a write gate shared with the owning container,
//! allowing [`lock_writes`](SortedList::lock_writes) to drain them and
//! freeze the list for [`get_count`](SortedList::get_count) and
//! [`get_all`](SortedList::get_all) snapshots.

use std::cmp::Ordering::{Equal, Greater, Less};
use std::ptr;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;

use crossbeam_utils::Backoff;

use crate::gate::WriteGate;
use crate::hp::{HazardDomain, HazardSlot, HazardThread};
use crate::marked::{is_marked, strip, with_mark, MarkedPtr};

/// Cleanup callback invoked once per node, on the reclaiming thread, just
/// before the node memory is freed. Must not call back into the list.
pub type CleanupFn<T> = unsafe fn(ctx: *mut (), item: *mut SortedEntry<T>);

/// Notification that a generated sequence number will never be observed.
/// May run under internal locks; must be short and non-reentrant.
pub type SkippedSeqNoFn = fn(ctx: *mut (), seq_no: i64);

/// Outcome of an insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertResult {
    /// The node was linked at its sorted position.
    Ok,
    /// A node with an equal key is already present.
    KeyAlreadyExists,
}

/// Outcome of a delete or remove.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteResult {
    /// The node was unlinked and retired.
    Ok,
    /// No matching node is in the list.
    NotFound,
}

/// Outcome of a set-value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetValueResult {
    /// The value was replaced or inserted.
    Ok,
    /// The operation could not complete.
    Error,
}

/// Failure of a locked snapshot read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotError {
    /// The write lock is not held.
    NotLocked,
    /// The caller's expected item count does not match the list.
    WrongSize,
}

/// An intrusive, reference-counted sorted-list node.
///
/// Carries the sequence-number stamp of the last mutation that touched it.
/// The reference count decides when the cleanup callback runs and the
/// memory is freed; for deleted nodes that point is reached through hazard
/// pointer reclamation, never directly.
#[repr(C)]
pub struct SortedEntry<T> {
    next: MarkedPtr<SortedEntry<T>>,
    ref_count: AtomicU32,
    seq_no: AtomicI64,
    cleanup: Option<CleanupFn<T>>,
    cleanup_ctx: *mut (),
    data: T,
}

impl<T> SortedEntry<T> {
    /// Heap-allocate a node with a reference count of one.
    pub fn alloc(
        data: T,
        cleanup: Option<CleanupFn<T>>,
        cleanup_ctx: *mut (),
    ) -> *mut SortedEntry<T> {
        Box::into_raw(Box::new(SortedEntry {
            next: MarkedPtr::null(),
            ref_count: AtomicU32::new(1),
            seq_no: AtomicI64::new(0),
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

    /// Sequence number stamped by the last mutation, zero if none.
    #[inline]
    pub fn seq_no(&self) -> i64 {
        self.seq_no.load(Ordering::Acquire)
    }

    /// Take an additional reference.
    ///
    /// # Safety
    ///
    /// `item` must point to a live node (reference count above zero).
    pub unsafe fn inc_ref(item: *mut SortedEntry<T>) {
        (*item).ref_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop a reference; at zero, run the cleanup callback and free.
    ///
    /// # Safety
    ///
    /// The caller must own the reference being dropped.
    pub unsafe fn release(item: *mut SortedEntry<T>) {
        if (*item).ref_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Some(cleanup) = (*item).cleanup {
                cleanup((*item).cleanup_ctx, item);
            }
            drop(Box::from_raw(item));
        }
    }
}

pub(crate) unsafe fn reclaim_entry<T>(node: *mut ()) {
    SortedEntry::release(node as *mut SortedEntry<T>);
}

/// A lock-free list sorted by a key derived from the payload.
pub struct SortedList<T, K> {
    head: MarkedPtr<SortedEntry<T>>,
    domain: Arc<HazardDomain>,
    key_of: fn(&T) -> K,
    sequence: Option<Arc<AtomicI64>>,
    skipped: Option<(SkippedSeqNoFn, *mut ())>,
    gate: Arc<WriteGate>,
}

// Payloads are shared across threads under the hazard pointer protocol;
// skipped-callback contexts must themselves be thread-safe.
unsafe impl<T: Send, K> Send for SortedList<T, K> {}
unsafe impl<T: Send + Sync, K> Sync for SortedList<T, K> {}

impl<T, K: Ord> SortedList<T, K> {
    /// Create a list without sequence-number stamping.
    pub fn new(domain: Arc<HazardDomain>, key_of: fn(&T) -> K) -> Self {
        Self::with_shared(domain, key_of, None, None, Arc::new(WriteGate::new()))
    }

    /// Create a list that stamps every mutation from `sequence`.
    ///
    /// `skipped` is invoked for sequence numbers that will never be
    /// observed by any consumer of the list.
    pub fn with_sequence(
        domain: Arc<HazardDomain>,
        key_of: fn(&T) -> K,
        sequence: Arc<AtomicI64>,
        skipped: Option<(SkippedSeqNoFn, *mut ())>,
    ) -> Self {
        Self::with_shared(domain, key_of, Some(sequence), skipped, Arc::new(WriteGate::new()))
    }

    pub(crate) fn with_shared(
        domain: Arc<HazardDomain>,
        key_of: fn(&T) -> K,
        sequence: Option<Arc<AtomicI64>>,
        skipped: Option<(SkippedSeqNoFn, *mut ())>,
        gate: Arc<WriteGate>,
    ) -> Self {
        Self {
            head: MarkedPtr::null(),
            domain,
            key_of,
            sequence,
            skipped,
            gate,
        }
    }

    /// The hazard-pointer domain nodes of this list retire into.
    #[inline]
    pub fn domain(&self) -> &Arc<HazardDomain> {
        &self.domain
    }

    /// Insert `item` at its sorted position.
    ///
    /// Fails with [`InsertResult::KeyAlreadyExists`] if a node with an
    /// equal key is present; the sequence number generated for the attempt
    /// is then reported as skipped.
    ///
    /// # Safety
    ///
    /// `item` must come from [`SortedEntry::alloc`] and not be linked into
    /// any list.
    pub unsafe fn insert(
        &self,
        thread: &HazardThread,
        item: *mut SortedEntry<T>,
        seq_out: Option<&mut i64>,
    ) -> InsertResult {
        self.gate.begin_write();
        let result = self.insert_ungated(thread, item, seq_out);
        self.gate.end_write();
        result
    }

    /// Delete the node with an equal key.
    pub fn delete_key(
        &self,
        thread: &HazardThread,
        key: &K,
        seq_out: Option<&mut i64>,
    ) -> DeleteResult {
        self.gate.begin_write();
        let result = self.delete_key_ungated(thread, key, seq_out);
        self.gate.end_write();
        result
    }

    /// Delete a specific node, identified by pointer.
    ///
    /// # Safety
    ///
    /// `item` must have been inserted into this list (it may have been
    /// deleted concurrently, in which case `NotFound` is returned).
    pub unsafe fn delete_item(
        &self,
        thread: &HazardThread,
        item: *mut SortedEntry<T>,
        seq_out: Option<&mut i64>,
    ) -> DeleteResult {
        self.gate.begin_write();
        let result = self.delete_item_ungated(thread, item, seq_out);
        self.gate.end_write();
        result
    }

    /// Delete the node with an equal key and return it.
    ///
    /// On success `*removed` holds the node with its reference count
    /// incremented; the caller releases it with [`SortedEntry::release`].
    pub fn remove_key(
        &self,
        thread: &HazardThread,
        key: &K,
        removed: &mut *mut SortedEntry<T>,
        seq_out: Option<&mut i64>,
    ) -> DeleteResult {
        self.gate.begin_write();
        let result = self.remove_key_ungated(thread, key, removed, seq_out);
        self.gate.end_write();
        result
    }

    /// Replace the node holding `key` with `new_item`, or insert `new_item`
    /// if the key is absent.
    ///
    /// On return `*old_item` is the replaced node with its reference count
    /// incremented (null if the key was absent).
    ///
    /// # Safety
    ///
    /// `new_item` must come from [`SortedEntry::alloc`], not be linked into
    /// any list, and carry a payload whose key equals `key`.
    pub unsafe fn set_value(
        &self,
        thread: &HazardThread,
        key: &K,
        new_item: *mut SortedEntry<T>,
        old_item: &mut *mut SortedEntry<T>,
        seq_out: Option<&mut i64>,
    ) -> SetValueResult {
        self.gate.begin_write();
        let result = self.set_value_ungated(thread, key, new_item, old_item, seq_out);
        self.gate.end_write();
        result
    }

    /// Find the node with an equal key.
    ///
    /// On a hit the node's reference count is incremented while it is still
    /// hazard-protected; the caller owns that reference and drops it with
    /// [`SortedEntry::release`]. Returns null if the key is absent.
    pub fn find_key(&self, thread: &HazardThread, key: &K) -> *mut SortedEntry<T> {
        let backoff = Backoff::new();
        'restart: loop {
            let mut prev_slot: *mut HazardSlot = ptr::null_mut();
            let mut curr_addr: *const MarkedPtr<SortedEntry<T>> = &self.head;

            loop {
                let curr_raw = unsafe { (*curr_addr).load(Ordering::Acquire) };
                let curr = strip(curr_raw);
                if curr.is_null() {
                    unsafe { self.release_slot(thread, prev_slot) };
                    return ptr::null_mut();
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

                unsafe {
                    if *key == (self.key_of)(&(*curr).data) {
                        SortedEntry::inc_ref(curr);
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

    /// Block new mutations and wait for in-flight ones to finish.
    pub fn lock_writes(&self) {
        self.gate.lock_writes();
    }

    /// Release the write lock taken by [`lock_writes`](Self::lock_writes).
    pub fn unlock_writes(&self) {
        self.gate.unlock_writes();
    }

    /// Count the items in the list. Requires the write lock to be held.
    pub fn get_count(&self) -> Result<u64, SnapshotError> {
        if !self.gate.is_locked() {
            log::error!("list must be locked for writes before counting items");
            return Err(SnapshotError::NotLocked);
        }

        let mut count = 0u64;
        let mut node = strip(self.head.load(Ordering::Acquire));
        while !node.is_null() {
            count += 1;
            node = strip(unsafe { (*node).next.load(Ordering::Acquire) });
        }
        Ok(count)
    }

    /// Collect every item, in key order, with reference counts incremented.
    ///
    /// Requires the write lock to be held, and `expected` must equal the
    /// item count; otherwise nothing is returned and no references are
    /// retained.
    pub fn get_all(&self, expected: u64) -> Result<Vec<*mut SortedEntry<T>>, SnapshotError> {
        if !self.gate.is_locked() {
            log::error!("list must be locked for writes before collecting items");
            return Err(SnapshotError::NotLocked);
        }

        let mut items: Vec<*mut SortedEntry<T>> = Vec::with_capacity(expected as usize);
        let mut node = strip(self.head.load(Ordering::Acquire));
        while !node.is_null() {
            if items.len() as u64 == expected {
                break;
            }
            unsafe {
                SortedEntry::inc_ref(node);
                items.push(node);
                node = strip((*node).next.load(Ordering::Acquire));
            }
        }

        if !node.is_null() || items.len() as u64 != expected {
            log::error!(
                "expected {} items but the list holds a different number",
                expected
            );
            for item in items {
                unsafe { SortedEntry::release(item) };
            }
            return Err(SnapshotError::WrongSize);
        }
        Ok(items)
    }

    pub(crate) fn insert_ungated(
        &self,
        thread: &HazardThread,
        item: *mut SortedEntry<T>,
        seq_out: Option<&mut i64>,
    ) -> InsertResult {
        let mut stamped = 0i64;
        if let Some(sequence) = &self.sequence {
            stamped = sequence.fetch_add(1, Ordering::SeqCst) + 1;
            unsafe { (*item).seq_no.store(stamped, Ordering::SeqCst) };
            if let Some(out) = seq_out {
                *out = stamped;
            }
        }

        let key = unsafe { (self.key_of)(&(*item).data) };
        let backoff = Backoff::new();
        'restart: loop {
            let mut prev_slot: *mut HazardSlot = ptr::null_mut();
            let mut prev: *mut SortedEntry<T> = ptr::null_mut();
            let mut curr_addr: *const MarkedPtr<SortedEntry<T>> = &self.head;

            loop {
                let curr_raw = unsafe { (*curr_addr).load(Ordering::Acquire) };
                let curr = strip(curr_raw);
                if curr.is_null() {
                    // end of list; the predecessor link must still be a
                    // clean null, a mark there fails the exchange
                    unsafe { (*item).next.store(ptr::null_mut(), Ordering::Relaxed) };
                    let prev_link = self.link_of(prev);
                    if prev_link
                        .compare_exchange(ptr::null_mut(), item, Ordering::Release, Ordering::Relaxed)
                        .is_ok()
                    {
                        unsafe { self.release_slot(thread, prev_slot) };
                        return InsertResult::Ok;
                    }
                    unsafe { self.release_slot(thread, prev_slot) };
                    backoff.spin();
                    continue 'restart;
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

                let order = unsafe { key.cmp(&(self.key_of)(&(*curr).data)) };
                match order {
                    Equal => {
                        unsafe {
                            self.release_slot(thread, prev_slot);
                            thread.release(curr_slot);
                        }
                        if self.sequence.is_some() {
                            self.report_skipped(stamped);
                        }
                        return InsertResult::KeyAlreadyExists;
                    }
                    Less => {
                        unsafe { (*item).next.store(curr, Ordering::Relaxed) };
                        let prev_link = self.link_of(prev);
                        if prev_link
                            .compare_exchange(curr, item, Ordering::Release, Ordering::Relaxed)
                            .is_ok()
                        {
                            unsafe {
                                self.release_slot(thread, prev_slot);
                                thread.release(curr_slot);
                            }
                            return InsertResult::Ok;
                        }
                        unsafe {
                            self.release_slot(thread, prev_slot);
                            thread.release(curr_slot);
                        }
                        backoff.spin();
                        continue 'restart;
                    }
                    Greater => unsafe {
                        self.release_slot(thread, prev_slot);
                        prev_slot = curr_slot;
                        prev = curr;
                        curr_addr = &(*curr).next;
                    },
                }
            }
        }
    }

    pub(crate) fn delete_key_ungated(
        &self,
        thread: &HazardThread,
        key: &K,
        seq_out: Option<&mut i64>,
    ) -> DeleteResult {
        self.internal_delete(
            thread,
            |node| unsafe { *key == (self.key_of)(&(*node).data) },
            None,
            seq_out,
        )
    }

    pub(crate) fn delete_item_ungated(
        &self,
        thread: &HazardThread,
        item: *mut SortedEntry<T>,
        seq_out: Option<&mut i64>,
    ) -> DeleteResult {
        self.internal_delete(thread, |node| node == item, None, seq_out)
    }

    pub(crate) fn remove_key_ungated(
        &self,
        thread: &HazardThread,
        key: &K,
        removed: &mut *mut SortedEntry<T>,
        seq_out: Option<&mut i64>,
    ) -> DeleteResult {
        *removed = ptr::null_mut();
        self.internal_delete(
            thread,
            |node| unsafe { *key == (self.key_of)(&(*node).data) },
            Some(removed),
            seq_out,
        )
    }

    pub(crate) fn set_value_ungated(
        &self,
        thread: &HazardThread,
        key: &K,
        new_item: *mut SortedEntry<T>,
        old_item: &mut *mut SortedEntry<T>,
        seq_out: Option<&mut i64>,
    ) -> SetValueResult {
        if let Some(sequence) = &self.sequence {
            let stamped = sequence.fetch_add(1, Ordering::SeqCst) + 1;
            unsafe { (*new_item).seq_no.store(stamped, Ordering::SeqCst) };
            if let Some(out) = seq_out {
                *out = stamped;
            }
        }

        let backoff = Backoff::new();
        'restart: loop {
            let mut prev_slot: *mut HazardSlot = ptr::null_mut();
            let mut prev: *mut SortedEntry<T> = ptr::null_mut();
            let mut curr_addr: *const MarkedPtr<SortedEntry<T>> = &self.head;

            loop {
                let curr_raw = unsafe { (*curr_addr).load(Ordering::Acquire) };
                let curr = strip(curr_raw);
                if curr.is_null() {
                    unsafe { (*new_item).next.store(ptr::null_mut(), Ordering::Relaxed) };
                    let prev_link = self.link_of(prev);
                    if prev_link
                        .compare_exchange(
                            ptr::null_mut(),
                            new_item,
                            Ordering::Release,
                            Ordering::Relaxed,
                        )
                        .is_ok()
                    {
                        unsafe { self.release_slot(thread, prev_slot) };
                        *old_item = ptr::null_mut();
                        return SetValueResult::Ok;
                    }
                    unsafe { self.release_slot(thread, prev_slot) };
                    backoff.spin();
                    continue 'restart;
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

                let order = unsafe { key.cmp(&(self.key_of)(&(*curr).data)) };
                match order {
                    Equal => unsafe {
                        let next_raw = (*curr).next.load(Ordering::Acquire);
                        if is_marked(next_raw) {
                            self.release_slot(thread, prev_slot);
                            thread.release(curr_slot);
                            backoff.spin();
                            continue 'restart;
                        }
                        let next = strip(next_raw);

                        // lock the victim's link so no insert or delete can
                        // slip in behind it while we swap it out
                        if (*curr)
                            .next
                            .compare_exchange(
                                next,
                                with_mark(next),
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            )
                            .is_err()
                        {
                            self.release_slot(thread, prev_slot);
                            thread.release(curr_slot);
                            backoff.spin();
                            continue 'restart;
                        }

                        (*new_item).next.store(next, Ordering::Relaxed);
                        let prev_link = self.link_of(prev);
                        if prev_link
                            .compare_exchange(curr, new_item, Ordering::AcqRel, Ordering::Acquire)
                            .is_ok()
                        {
                            SortedEntry::inc_ref(curr);
                            *old_item = curr;
                            self.release_slot(thread, prev_slot);
                            thread.release(curr_slot);
                            thread.retire(curr as *mut (), reclaim_entry::<T>);
                            return SetValueResult::Ok;
                        }

                        // predecessor changed under us; unwind the lock bit
                        if (*curr)
                            .next
                            .compare_exchange(
                                with_mark(next),
                                next,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            )
                            .is_err()
                        {
                            log::error!("failed to roll back a locked link, this should not happen");
                            self.release_slot(thread, prev_slot);
                            thread.release(curr_slot);
                            return SetValueResult::Error;
                        }
                        self.release_slot(thread, prev_slot);
                        thread.release(curr_slot);
                        backoff.spin();
                        continue 'restart;
                    },
                    Less => {
                        unsafe { (*new_item).next.store(curr, Ordering::Relaxed) };
                        let prev_link = self.link_of(prev);
                        if prev_link
                            .compare_exchange(curr, new_item, Ordering::Release, Ordering::Relaxed)
                            .is_ok()
                        {
                            unsafe {
                                self.release_slot(thread, prev_slot);
                                thread.release(curr_slot);
                            }
                            *old_item = ptr::null_mut();
                            return SetValueResult::Ok;
                        }
                        unsafe {
                            self.release_slot(thread, prev_slot);
                            thread.release(curr_slot);
                        }
                        backoff.spin();
                        continue 'restart;
                    }
                    Greater => unsafe {
                        self.release_slot(thread, prev_slot);
                        prev_slot = curr_slot;
                        prev = curr;
                        curr_addr = &(*curr).next;
                    },
                }
            }
        }
    }

    fn internal_delete(
        &self,
        thread: &HazardThread,
        matches: impl Fn(*mut SortedEntry<T>) -> bool,
        mut removed: Option<&mut *mut SortedEntry<T>>,
        mut seq_out: Option<&mut i64>,
    ) -> DeleteResult {
        let backoff = Backoff::new();
        'restart: loop {
            let mut prev_slot: *mut HazardSlot = ptr::null_mut();
            let mut prev: *mut SortedEntry<T> = ptr::null_mut();
            let mut curr_addr: *const MarkedPtr<SortedEntry<T>> = &self.head;

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

                    // stamp the victim; a competing mutation of the same
                    // node may overwrite this before we commit
                    let mut local_seq = 0i64;
                    if let Some(sequence) = &self.sequence {
                        local_seq = sequence.fetch_add(1, Ordering::SeqCst) + 1;
                        (*curr).seq_no.store(local_seq, Ordering::SeqCst);
                    }

                    let prev_link = self.link_of(prev);
                    if prev_link
                        .compare_exchange(curr, next, Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                    {
                        // predecessor is being deleted itself; roll back the
                        // mark and report the abandoned stamp
                        let _ = (*curr).next.compare_exchange(
                            with_mark(next),
                            next,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        );
                        if self.sequence.is_some() {
                            self.report_skipped(local_seq);
                        }
                        self.release_slot(thread, prev_slot);
                        thread.release(curr_slot);
                        backoff.spin();
                        continue 'restart;
                    }

                    if self.sequence.is_some() {
                        let committed = (*curr).seq_no.load(Ordering::SeqCst);
                        if committed != local_seq {
                            self.report_skipped(local_seq);
                        }
                        if let Some(out) = seq_out.take() {
                            *out = committed;
                        }
                    }

                    if let Some(out) = removed.take() {
                        SortedEntry::inc_ref(curr);
                        *out = curr;
                    }

                    self.release_slot(thread, prev_slot);
                    thread.release(curr_slot);
                    thread.retire(curr as *mut (), reclaim_entry::<T>);
                    return DeleteResult::Ok;
                }
            }
        }
    }

    #[inline]
    fn link_of(&self, prev: *mut SortedEntry<T>) -> &MarkedPtr<SortedEntry<T>> {
        if prev.is_null() {
            &self.head
        } else {
            unsafe { &(*prev).next }
        }
    }

    #[inline]
    unsafe fn release_slot(&self, thread: &HazardThread, slot: *mut HazardSlot) {
        if !slot.is_null() {
            thread.release(slot);
        }
    }

    fn report_skipped(&self, seq_no: i64) {
        if let Some((callback, ctx)) = self.skipped {
            callback(ctx, seq_no);
        }
    }
}

impl<T, K> Drop for SortedList<T, K> {
    fn drop(&mut self) {
        // single-threaded teardown, no retire path
        unsafe {
            let mut node = strip(self.head.load(Ordering::Relaxed));
            while !node.is_null() {
                let next = strip((*node).next.load(Ordering::Relaxed));
                SortedEntry::release(node);
                node = next;
            }
        }
    }
}
