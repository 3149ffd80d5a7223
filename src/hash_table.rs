//! Lock-free hash table.
//!
//! Buckets are lock-free sorted lists, created lazily on first write. The
//! bucket arrays form a chain of levels, newest first: when a level's
//! insertion budget runs out a new level of twice the size is appended, and
//! entries in older levels are found by walking the chain. For any key at
//! most one level holds a live entry; readers stop at the first hit,
//! writers insert into the newest level only.
//!
//! All bucket lists share the table's write gate and sequence counter, so
//! locking the table for writes freezes every bucket at once and a single
//! counter orders mutations across the whole table.

use std::ptr;
use std::sync::atomic::{AtomicI64, AtomicPtr, Ordering};
use std::sync::Arc;

use crate::gate::WriteGate;
use crate::hp::{HazardDomain, HazardThread};
use crate::sorted_list::{
    DeleteResult, InsertResult, SetValueResult, SkippedSeqNoFn, SnapshotError, SortedEntry,
    SortedList,
};

/// One level of the bucket chain.
struct BucketArray<T, K> {
    next: AtomicPtr<BucketArray<T, K>>,
    item_count_until_resize: AtomicI64,
    buckets: Box<[AtomicPtr<SortedList<T, K>>]>,
}

impl<T, K> BucketArray<T, K> {
    fn alloc(bucket_count: usize) -> *mut Self {
        let buckets: Vec<AtomicPtr<SortedList<T, K>>> = (0..bucket_count)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect();
        Box::into_raw(Box::new(Self {
            next: AtomicPtr::new(ptr::null_mut()),
            item_count_until_resize: AtomicI64::new(bucket_count as i64),
            buckets: buckets.into_boxed_slice(),
        }))
    }
}

/// A lock-free hash table over intrusive sorted-list nodes.
///
/// Nodes carry their key inside the payload; `key_of` extracts it and
/// `hash` maps it to a bucket. Dropping the table requires quiescence:
/// every hazard thread unregistered, or at least no operation in flight,
/// with retired nodes already drained by their owning threads.
pub struct HashTable<T, K> {
    levels: AtomicPtr<BucketArray<T, K>>,
    hash: fn(&K) -> u64,
    key_of: fn(&T) -> K,
    domain: Arc<HazardDomain>,
    sequence: Option<Arc<AtomicI64>>,
    skipped: Option<(SkippedSeqNoFn, *mut ())>,
    gate: Arc<WriteGate>,
}

// Payloads are shared across threads under the hazard pointer protocol;
// skipped-callback contexts must themselves be thread-safe.
unsafe impl<T: Send, K> Send for HashTable<T, K> {}
unsafe impl<T: Send + Sync, K> Sync for HashTable<T, K> {}

impl<T, K: Ord> HashTable<T, K> {
    /// Create a table without sequence-number stamping.
    ///
    /// Returns `None` if `initial_bucket_count` is zero.
    pub fn new(
        hash: fn(&K) -> u64,
        key_of: fn(&T) -> K,
        initial_bucket_count: usize,
        domain: Arc<HazardDomain>,
    ) -> Option<Self> {
        Self::create(hash, key_of, initial_bucket_count, domain, None, None)
    }

    /// Create a table that stamps every mutation from `sequence`.
    pub fn with_sequence(
        hash: fn(&K) -> u64,
        key_of: fn(&T) -> K,
        initial_bucket_count: usize,
        domain: Arc<HazardDomain>,
        sequence: Arc<AtomicI64>,
        skipped: Option<(SkippedSeqNoFn, *mut ())>,
    ) -> Option<Self> {
        Self::create(
            hash,
            key_of,
            initial_bucket_count,
            domain,
            Some(sequence),
            skipped,
        )
    }

    fn create(
        hash: fn(&K) -> u64,
        key_of: fn(&T) -> K,
        initial_bucket_count: usize,
        domain: Arc<HazardDomain>,
        sequence: Option<Arc<AtomicI64>>,
        skipped: Option<(SkippedSeqNoFn, *mut ())>,
    ) -> Option<Self> {
        if initial_bucket_count == 0 {
            log::error!("initial bucket count must not be zero");
            return None;
        }
        Some(Self {
            levels: AtomicPtr::new(BucketArray::alloc(initial_bucket_count)),
            hash,
            key_of,
            domain,
            sequence,
            skipped,
            gate: Arc::new(WriteGate::new()),
        })
    }

    /// The hazard-pointer domain nodes of this table retire into.
    #[inline]
    pub fn domain(&self) -> &Arc<HazardDomain> {
        &self.domain
    }

    /// Insert `item` under the key carried by its payload.
    ///
    /// Fails with [`InsertResult::KeyAlreadyExists`] if any level already
    /// holds the key.
    ///
    /// # Safety
    ///
    /// `item` must come from [`SortedEntry::alloc`] and not be linked into
    /// any container.
    pub unsafe fn insert(
        &self,
        thread: &HazardThread,
        item: *mut SortedEntry<T>,
        seq_out: Option<&mut i64>,
    ) -> InsertResult {
        self.gate.begin_write();
        let result = self.insert_inner(thread, item, seq_out);
        self.gate.end_write();
        result
    }

    fn insert_inner(
        &self,
        thread: &HazardThread,
        item: *mut SortedEntry<T>,
        seq_out: Option<&mut i64>,
    ) -> InsertResult {
        let key = unsafe { (self.key_of)((*item).data()) };
        let hash = (self.hash)(&key);
        let newest = self.levels.load(Ordering::Acquire);

        // a key living in an older level must stay the only copy
        unsafe {
            let mut level = (*newest).next.load(Ordering::Acquire);
            while !level.is_null() {
                let list = self.peek_bucket(level, hash);
                if !list.is_null() {
                    let found = (*list).find_key(thread, &key);
                    if !found.is_null() {
                        SortedEntry::release(found);
                        return InsertResult::KeyAlreadyExists;
                    }
                }
                level = (*level).next.load(Ordering::Acquire);
            }
        }

        let list = self.bucket_list(newest, hash);
        let result = unsafe { (*list).insert_ungated(thread, item, seq_out) };

        if result == InsertResult::Ok {
            // grow only on success so duplicate inserts cannot balloon the
            // level chain
            let remaining = unsafe {
                (*newest)
                    .item_count_until_resize
                    .fetch_sub(1, Ordering::AcqRel)
            };
            if remaining == 1 {
                self.append_level(newest);
            }
        }
        result
    }

    /// Delete the entry with an equal key, searching newest level first.
    pub fn delete(
        &self,
        thread: &HazardThread,
        key: &K,
        mut seq_out: Option<&mut i64>,
    ) -> DeleteResult {
        self.gate.begin_write();
        let hash = (self.hash)(key);
        let mut result = DeleteResult::NotFound;

        unsafe {
            let mut level = self.levels.load(Ordering::Acquire);
            while !level.is_null() {
                let list = self.peek_bucket(level, hash);
                if !list.is_null()
                    && (*list).delete_key_ungated(thread, key, seq_out.as_deref_mut())
                        == DeleteResult::Ok
                {
                    result = DeleteResult::Ok;
                    break;
                }
                level = (*level).next.load(Ordering::Acquire);
            }
        }

        self.gate.end_write();
        result
    }

    /// Delete an entry only if `item` is the exact node stored under `key`,
    /// so a stale reference cannot take out a fresh insertion.
    ///
    /// # Safety
    ///
    /// `item` must have been inserted into this table (it may have been
    /// deleted concurrently, in which case `NotFound` is returned).
    pub unsafe fn delete_key_value(
        &self,
        thread: &HazardThread,
        key: &K,
        item: *mut SortedEntry<T>,
        mut seq_out: Option<&mut i64>,
    ) -> DeleteResult {
        self.gate.begin_write();
        let hash = (self.hash)(key);
        let mut result = DeleteResult::NotFound;

        let mut level = self.levels.load(Ordering::Acquire);
        while !level.is_null() {
            let list = self.peek_bucket(level, hash);
            if !list.is_null()
                && (*list).delete_item_ungated(thread, item, seq_out.as_deref_mut())
                    == DeleteResult::Ok
            {
                result = DeleteResult::Ok;
                break;
            }
            level = (*level).next.load(Ordering::Acquire);
        }

        self.gate.end_write();
        result
    }

    /// Delete the entry with an equal key and return it through `removed`
    /// with its reference count incremented.
    pub fn remove(
        &self,
        thread: &HazardThread,
        key: &K,
        removed: &mut *mut SortedEntry<T>,
        mut seq_out: Option<&mut i64>,
    ) -> DeleteResult {
        self.gate.begin_write();
        let hash = (self.hash)(key);
        let mut result = DeleteResult::NotFound;
        *removed = ptr::null_mut();

        unsafe {
            let mut level = self.levels.load(Ordering::Acquire);
            while !level.is_null() {
                let list = self.peek_bucket(level, hash);
                if !list.is_null()
                    && (*list).remove_key_ungated(thread, key, removed, seq_out.as_deref_mut())
                        == DeleteResult::Ok
                {
                    result = DeleteResult::Ok;
                    break;
                }
                level = (*level).next.load(Ordering::Acquire);
            }
        }

        self.gate.end_write();
        result
    }

    /// Find the entry with an equal key, newest level first.
    ///
    /// On a hit the node's reference count is incremented; the caller
    /// releases it with [`SortedEntry::release`]. Returns null on a miss.
    pub fn find(&self, thread: &HazardThread, key: &K) -> *mut SortedEntry<T> {
        let hash = (self.hash)(key);
        let mut level = self.levels.load(Ordering::Acquire);
        while !level.is_null() {
            unsafe {
                let list = self.peek_bucket(level, hash);
                if !list.is_null() {
                    let found = (*list).find_key(thread, key);
                    if !found.is_null() {
                        return found;
                    }
                }
                level = (*level).next.load(Ordering::Acquire);
            }
        }
        ptr::null_mut()
    }

    /// Replace the entry under `key` with `new_item`, inserting if absent.
    ///
    /// On return `*old_item` holds the replaced node (refcounted, null if
    /// the key was absent), whether it lived in the newest or an older
    /// level.
    ///
    /// # Safety
    ///
    /// `new_item` must come from [`SortedEntry::alloc`], not be linked into
    /// any container, and carry a payload whose key equals `key`.
    pub unsafe fn set_value(
        &self,
        thread: &HazardThread,
        key: &K,
        new_item: *mut SortedEntry<T>,
        old_item: &mut *mut SortedEntry<T>,
        seq_out: Option<&mut i64>,
    ) -> SetValueResult {
        self.gate.begin_write();
        *old_item = ptr::null_mut();
        let hash = (self.hash)(key);

        let newest = self.levels.load(Ordering::Acquire);
        let list = self.bucket_list(newest, hash);
        let result = (*list).set_value_ungated(thread, key, new_item, old_item, seq_out);

        if result == SetValueResult::Ok && old_item.is_null() {
            // the new value went into the newest level; retire any copy
            // still sitting in an older one
            let mut level = (*newest).next.load(Ordering::Acquire);
            while !level.is_null() {
                let stale_list = self.peek_bucket(level, hash);
                if !stale_list.is_null() {
                    let mut stale: *mut SortedEntry<T> = ptr::null_mut();
                    if (*stale_list).remove_key_ungated(thread, key, &mut stale, None)
                        == DeleteResult::Ok
                    {
                        *old_item = stale;
                        break;
                    }
                }
                level = (*level).next.load(Ordering::Acquire);
            }
        }

        self.gate.end_write();
        result
    }

    /// Block new mutations and wait for in-flight ones to finish. Shared
    /// with every bucket list, so the whole table freezes.
    pub fn lock_writes(&self) {
        self.gate.lock_writes();
    }

    /// Release the write lock taken by [`lock_writes`](Self::lock_writes).
    pub fn unlock_writes(&self) {
        self.gate.unlock_writes();
    }

    /// Collect every entry in the table with reference counts incremented.
    ///
    /// Requires the write lock to be held. On any failure all references
    /// taken so far are released and nothing is returned.
    pub fn snapshot(&self) -> Result<Vec<*mut SortedEntry<T>>, SnapshotError> {
        if !self.gate.is_locked() {
            log::error!("table must be locked for writes before taking a snapshot");
            return Err(SnapshotError::NotLocked);
        }

        let mut items: Vec<*mut SortedEntry<T>> = Vec::new();
        unsafe {
            let mut level = self.levels.load(Ordering::Acquire);
            while !level.is_null() {
                for slot in (*level).buckets.iter() {
                    let list = slot.load(Ordering::Acquire);
                    if list.is_null() {
                        continue;
                    }
                    let taken = match (*list).get_count() {
                        Ok(count) => (*list).get_all(count),
                        Err(error) => Err(error),
                    };
                    match taken {
                        Ok(mut bucket_items) => items.append(&mut bucket_items),
                        Err(error) => {
                            for item in items {
                                SortedEntry::release(item);
                            }
                            return Err(error);
                        }
                    }
                }
                level = (*level).next.load(Ordering::Acquire);
            }
        }
        Ok(items)
    }

    /// Bucket list for `hash` in `level`, or null if never written.
    unsafe fn peek_bucket(&self, level: *mut BucketArray<T, K>, hash: u64) -> *mut SortedList<T, K> {
        let index = (hash % (&(*level).buckets).len() as u64) as usize;
        (*level).buckets[index].load(Ordering::Acquire)
    }

    /// Bucket list for `hash` in `level`, created on first use.
    fn bucket_list(&self, level: *mut BucketArray<T, K>, hash: u64) -> *mut SortedList<T, K> {
        unsafe {
            let index = (hash % (&(*level).buckets).len() as u64) as usize;
            let slot = &(*level).buckets[index];

            let list = slot.load(Ordering::Acquire);
            if !list.is_null() {
                return list;
            }

            let fresh = Box::into_raw(Box::new(SortedList::with_shared(
                Arc::clone(&self.domain),
                self.key_of,
                self.sequence.clone(),
                self.skipped,
                Arc::clone(&self.gate),
            )));
            match slot.compare_exchange(
                ptr::null_mut(),
                fresh,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => fresh,
                Err(existing) => {
                    // lost the race; discard our list
                    drop(Box::from_raw(fresh));
                    existing
                }
            }
        }
    }

    fn append_level(&self, current: *mut BucketArray<T, K>) {
        let doubled = unsafe { (&(*current).buckets).len() * 2 };
        let fresh = BucketArray::alloc(doubled);
        unsafe { (*fresh).next.store(current, Ordering::Relaxed) };

        if self
            .levels
            .compare_exchange(current, fresh, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // another thread already chained a new level
            unsafe { drop(Box::from_raw(fresh)) };
        }
    }
}

impl<T, K> Drop for HashTable<T, K> {
    fn drop(&mut self) {
        unsafe {
            let mut level = *self.levels.get_mut();
            while !level.is_null() {
                let next = (*level).next.load(Ordering::Relaxed);
                for slot in (*level).buckets.iter() {
                    let list = slot.load(Ordering::Relaxed);
                    if !list.is_null() {
                        drop(Box::from_raw(list));
                    }
                }
                drop(Box::from_raw(level));
                level = next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn identity_hash(key: &u64) -> u64 {
        *key
    }

    fn pair_key(pair: &(u64, u64)) -> u64 {
        pair.0
    }

    fn new_table(initial_bucket_count: usize, domain: &Arc<HazardDomain>) -> HashTable<(u64, u64), u64> {
        HashTable::new(identity_hash, pair_key, initial_bucket_count, Arc::clone(domain))
            .expect("bucket count is non-zero")
    }

    fn level_count<T, K>(table: &HashTable<T, K>) -> usize {
        let mut count = 0;
        let mut level = table.levels.load(Ordering::Acquire);
        while !level.is_null() {
            count += 1;
            level = unsafe { (*level).next.load(Ordering::Acquire) };
        }
        count
    }

    unsafe fn count_cleanup(ctx: *mut (), _item: *mut SortedEntry<(u64, u64)>) {
        (*(ctx as *const AtomicUsize)).fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn test_zero_bucket_count_rejected() {
        let domain = Arc::new(HazardDomain::new());
        assert!(HashTable::<(u64, u64), u64>::new(identity_hash, pair_key, 0, domain).is_none());
    }

    #[test]
    fn test_insert_find_delete() {
        let domain = Arc::new(HazardDomain::new());
        let thread = domain.register();
        let table = new_table(4, &domain);

        unsafe {
            assert_eq!(
                table.insert(
                    &thread,
                    SortedEntry::alloc((1, 100), None, ptr::null_mut()),
                    None
                ),
                InsertResult::Ok
            );
        }

        let found = table.find(&thread, &1);
        assert!(!found.is_null());
        unsafe {
            assert_eq!((*found).data().1, 100);
            SortedEntry::release(found);
        }

        assert_eq!(table.delete(&thread, &1, None), DeleteResult::Ok);
        assert!(table.find(&thread, &1).is_null());
        assert_eq!(table.delete(&thread, &1, None), DeleteResult::NotFound);
    }

    #[test]
    fn test_duplicate_insert_fails() {
        let domain = Arc::new(HazardDomain::new());
        let thread = domain.register();
        let table = new_table(4, &domain);

        unsafe {
            assert_eq!(
                table.insert(
                    &thread,
                    SortedEntry::alloc((7, 1), None, ptr::null_mut()),
                    None
                ),
                InsertResult::Ok
            );
            let duplicate = SortedEntry::alloc((7, 2), None, ptr::null_mut());
            assert_eq!(
                table.insert(&thread, duplicate, None),
                InsertResult::KeyAlreadyExists
            );
            SortedEntry::release(duplicate);
        }
    }

    #[test]
    fn test_old_level_key_stays_visible() {
        let domain = Arc::new(HazardDomain::new());
        let thread = domain.register();
        let table = new_table(1, &domain);

        unsafe {
            // the first insert exhausts the single-bucket level and chains
            // a doubled one; 0x43 lands in the new level
            assert_eq!(
                table.insert(
                    &thread,
                    SortedEntry::alloc((0x42, 1), None, ptr::null_mut()),
                    None
                ),
                InsertResult::Ok
            );
            assert_eq!(
                table.insert(
                    &thread,
                    SortedEntry::alloc((0x43, 1), None, ptr::null_mut()),
                    None
                ),
                InsertResult::Ok
            );
            assert!(level_count(&table) >= 2);

            assert_eq!(table.delete(&thread, &0x43, None), DeleteResult::Ok);

            // 0x42 still lives in the old level and must block reinsertion
            let duplicate = SortedEntry::alloc((0x42, 2), None, ptr::null_mut());
            assert_eq!(
                table.insert(&thread, duplicate, None),
                InsertResult::KeyAlreadyExists
            );
            SortedEntry::release(duplicate);
        }
    }

    #[test]
    fn test_duplicate_inserts_do_not_grow_levels() {
        let domain = Arc::new(HazardDomain::new());
        let thread = domain.register();
        let table = new_table(8, &domain);

        unsafe {
            assert_eq!(
                table.insert(
                    &thread,
                    SortedEntry::alloc((1, 1), None, ptr::null_mut()),
                    None
                ),
                InsertResult::Ok
            );
        }
        let levels_before = level_count(&table);

        for _ in 0..100 {
            unsafe {
                let duplicate = SortedEntry::alloc((1, 2), None, ptr::null_mut());
                assert_eq!(
                    table.insert(&thread, duplicate, None),
                    InsertResult::KeyAlreadyExists
                );
                SortedEntry::release(duplicate);
            }
        }
        assert_eq!(level_count(&table), levels_before);
    }

    #[test]
    fn test_remove_returns_entry() {
        let domain = Arc::new(HazardDomain::new());
        let thread = domain.register();
        let table = new_table(4, &domain);

        unsafe {
            table.insert(
                &thread,
                SortedEntry::alloc((3, 33), None, ptr::null_mut()),
                None,
            );
        }

        let mut removed: *mut SortedEntry<(u64, u64)> = ptr::null_mut();
        assert_eq!(
            table.remove(&thread, &3, &mut removed, None),
            DeleteResult::Ok
        );
        assert!(!removed.is_null());
        unsafe {
            assert_eq!((*removed).data().1, 33);
            SortedEntry::release(removed);
        }
        assert!(table.find(&thread, &3).is_null());
    }

    #[test]
    fn test_delete_key_value_requires_identity() {
        let domain = Arc::new(HazardDomain::new());
        let thread = domain.register();
        let table = new_table(4, &domain);

        let first = SortedEntry::alloc((5, 50), None, ptr::null_mut());
        unsafe {
            table.insert(&thread, first, None);
            assert_eq!(table.delete(&thread, &5, None), DeleteResult::Ok);

            // reinsert the key as a different node; the stale pointer must
            // not remove it
            let second = SortedEntry::alloc((5, 51), None, ptr::null_mut());
            table.insert(&thread, second, None);
            assert_eq!(
                table.delete_key_value(&thread, &5, first, None),
                DeleteResult::NotFound
            );
            assert_eq!(
                table.delete_key_value(&thread, &5, second, None),
                DeleteResult::Ok
            );
        }
    }

    #[test]
    fn test_set_value_replaces_older_level_copy() {
        let domain = Arc::new(HazardDomain::new());
        let thread = domain.register();
        let table = new_table(1, &domain);

        unsafe {
            table.insert(
                &thread,
                SortedEntry::alloc((0x42, 1), None, ptr::null_mut()),
                None,
            );
            // key 0x42 now lives in the exhausted first level
            assert!(level_count(&table) >= 2);

            let mut old: *mut SortedEntry<(u64, u64)> = ptr::null_mut();
            let replacement = SortedEntry::alloc((0x42, 9), None, ptr::null_mut());
            assert_eq!(
                table.set_value(&thread, &0x42, replacement, &mut old, None),
                SetValueResult::Ok
            );
            assert!(!old.is_null());
            assert_eq!((*old).data().1, 1);
            SortedEntry::release(old);

            let found = table.find(&thread, &0x42);
            assert_eq!((*found).data().1, 9);
            SortedEntry::release(found);

            // exactly one copy remains
            assert_eq!(table.delete(&thread, &0x42, None), DeleteResult::Ok);
            assert_eq!(table.delete(&thread, &0x42, None), DeleteResult::NotFound);
        }
    }

    #[test]
    fn test_snapshot_requires_lock() {
        let domain = Arc::new(HazardDomain::new());
        let table = new_table(4, &domain);
        assert!(matches!(table.snapshot(), Err(SnapshotError::NotLocked)));
    }

    #[test]
    fn test_snapshot_matches_contents() {
        let domain = Arc::new(HazardDomain::new());
        let thread = domain.register();
        let table = new_table(2, &domain);

        unsafe {
            for key in 0..20u64 {
                table.insert(
                    &thread,
                    SortedEntry::alloc((key, key * 10), None, ptr::null_mut()),
                    None,
                );
            }
            for key in (0..20u64).step_by(3) {
                table.delete(&thread, &key, None);
            }
        }

        table.lock_writes();
        let items = table.snapshot().expect("snapshot while locked");
        let mut keys: Vec<u64> = items.iter().map(|&i| unsafe { (*i).data().0 }).collect();
        keys.sort_unstable();
        let expected: Vec<u64> = (0..20).filter(|k| k % 3 != 0).collect();
        assert_eq!(keys, expected);
        for item in items {
            unsafe { SortedEntry::release(item) };
        }
        table.unlock_writes();
    }

    #[test]
    fn test_sequence_stamping_spans_buckets() {
        let domain = Arc::new(HazardDomain::new());
        let thread = domain.register();
        let sequence = Arc::new(AtomicI64::new(0));
        let table = HashTable::with_sequence(
            identity_hash,
            pair_key,
            4,
            Arc::clone(&domain),
            Arc::clone(&sequence),
            None,
        )
        .expect("bucket count is non-zero");

        let mut seq = 0i64;
        unsafe {
            table.insert(
                &thread,
                SortedEntry::alloc((1, 0), None, ptr::null_mut()),
                Some(&mut seq),
            );
            assert_eq!(seq, 1);
            table.insert(
                &thread,
                SortedEntry::alloc((2, 0), None, ptr::null_mut()),
                Some(&mut seq),
            );
            assert_eq!(seq, 2);
        }
        assert_eq!(table.delete(&thread, &1, Some(&mut seq)), DeleteResult::Ok);
        assert_eq!(seq, 3);
    }

    #[test]
    fn test_randomized_mixed_operations() {
        use rand::Rng;

        let cleaned = Arc::new(AtomicUsize::new(0));
        let allocated = Arc::new(AtomicUsize::new(0));
        let domain = Arc::new(HazardDomain::new());
        let table = Arc::new(new_table(8, &domain));
        const KEY_SPACE: u64 = 512;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let domain = Arc::clone(&domain);
            let table = Arc::clone(&table);
            let cleaned = Arc::clone(&cleaned);
            let allocated = Arc::clone(&allocated);
            handles.push(thread::spawn(move || {
                let thread = domain.register();
                let ctx = Arc::as_ptr(&cleaned) as *mut ();
                let mut rng = rand::rng();

                for round in 0..2_000u64 {
                    let key = rng.random_range(0..KEY_SPACE);
                    match rng.random_range(0..6) {
                        0 => unsafe {
                            let item =
                                SortedEntry::alloc((key, round), Some(count_cleanup), ctx);
                            allocated.fetch_add(1, Ordering::SeqCst);
                            if table.insert(&thread, item, None)
                                == InsertResult::KeyAlreadyExists
                            {
                                SortedEntry::release(item);
                            }
                        },
                        1 => {
                            table.delete(&thread, &key, None);
                        }
                        2 => {
                            let mut removed: *mut SortedEntry<(u64, u64)> = ptr::null_mut();
                            if table.remove(&thread, &key, &mut removed, None)
                                == DeleteResult::Ok
                            {
                                unsafe { SortedEntry::release(removed) };
                            }
                        }
                        3 => unsafe {
                            let replacement =
                                SortedEntry::alloc((key, round), Some(count_cleanup), ctx);
                            allocated.fetch_add(1, Ordering::SeqCst);
                            let mut old: *mut SortedEntry<(u64, u64)> = ptr::null_mut();
                            if table.set_value(&thread, &key, replacement, &mut old, None)
                                == SetValueResult::Ok
                            {
                                if !old.is_null() {
                                    SortedEntry::release(old);
                                }
                            } else {
                                SortedEntry::release(replacement);
                            }
                        },
                        4 => {
                            let found = table.find(&thread, &key);
                            if !found.is_null() {
                                unsafe {
                                    assert_eq!((*found).data().0, key);
                                    SortedEntry::release(found);
                                }
                            }
                        }
                        _ => {
                            // a key outside the pool is never present
                            assert!(table.find(&thread, &(key + KEY_SPACE)).is_null());
                        }
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().expect("worker panicked");
        }

        drop(table);
        drop(domain);
        // every node that ever existed has been cleaned up exactly once
        assert_eq!(
            cleaned.load(Ordering::SeqCst),
            allocated.load(Ordering::SeqCst)
        );
    }

    #[test]
    fn test_concurrent_churn_leaks_nothing() {
        let cleaned = Arc::new(AtomicUsize::new(0));
        let allocated = Arc::new(AtomicUsize::new(0));
        let domain = Arc::new(HazardDomain::new());
        let table = Arc::new(new_table(4, &domain));

        let mut handles = Vec::new();
        for t in 0..4u64 {
            let domain = Arc::clone(&domain);
            let table = Arc::clone(&table);
            let cleaned = Arc::clone(&cleaned);
            let allocated = Arc::clone(&allocated);
            handles.push(thread::spawn(move || {
                let thread = domain.register();
                let ctx = Arc::as_ptr(&cleaned) as *mut ();
                for i in 0..400u64 {
                    let key = (t * 1000 + i) % 64;
                    unsafe {
                        let item = SortedEntry::alloc((key, i), Some(count_cleanup), ctx);
                        allocated.fetch_add(1, Ordering::SeqCst);
                        if table.insert(&thread, item, None) == InsertResult::KeyAlreadyExists {
                            SortedEntry::release(item);
                        }
                    }
                    if i % 2 == 0 {
                        table.delete(&thread, &key, None);
                    }
                    let found = table.find(&thread, &key);
                    if !found.is_null() {
                        unsafe { SortedEntry::release(found) };
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().expect("worker panicked");
        }

        drop(table);
        drop(domain);
        assert_eq!(
            cleaned.load(Ordering::SeqCst),
            allocated.load(Ordering::SeqCst)
        );
    }
}
