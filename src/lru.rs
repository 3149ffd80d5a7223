//! LRU cache.
//!
//! A byte-bounded cache built from the lock-free hash table plus an
//! intrusive doubly linked recency list. The list and the current size are
//! the only state guarded by a mutex; every key lookup and table mutation
//! stays lock-free underneath. The sentinel's forward link points at the
//! least recently used entry, its backward link at the most recent one.
//!
//! Eviction is callback driven: `put` removes least recently used entries
//! until the new value fits and reports each eviction through the supplied
//! callback. The callback may not call back into the cache.

use std::ptr;
use std::sync::atomic::{AtomicI64, AtomicPtr, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::hash_table::HashTable;
use crate::hp::{HazardDomain, HazardThread};
use crate::sorted_list::{DeleteResult, InsertResult, SkippedSeqNoFn, SortedEntry};
use crate::thread_cache::ThreadCache;

/// Status handed to the eviction callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictResult {
    /// The entry was removed from the cache.
    Ok,
    /// The entry could not be removed; the put is aborted.
    Error,
}

/// Outcome of a put.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutResult {
    /// The value is cached and most recently used.
    Ok,
    /// The cache is unchanged apart from completed evictions.
    Error,
    /// The value alone is larger than the cache capacity.
    ValueInvalidSize,
}

/// Invoked synchronously from [`LruCache::put`] for each eviction attempt.
/// May not call back into the cache.
pub type EvictFn = fn(ctx: *mut (), result: EvictResult);

/// Intrusive recency-list link. Mutated only under the cache lock; the
/// atomics are for interior mutability, not cross-thread ordering.
struct RecencyLink {
    flink: AtomicPtr<RecencyLink>,
    blink: AtomicPtr<RecencyLink>,
}

impl RecencyLink {
    fn new() -> Self {
        Self {
            flink: AtomicPtr::new(ptr::null_mut()),
            blink: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

unsafe fn link_init(link: *mut RecencyLink) {
    (*link).flink.store(link, Ordering::Relaxed);
    (*link).blink.store(link, Ordering::Relaxed);
}

unsafe fn link_insert_tail(head: *mut RecencyLink, link: *mut RecencyLink) {
    let blink = (*head).blink.load(Ordering::Relaxed);
    (*link).flink.store(head, Ordering::Relaxed);
    (*link).blink.store(blink, Ordering::Relaxed);
    (*blink).flink.store(link, Ordering::Relaxed);
    (*head).blink.store(link, Ordering::Relaxed);
}

unsafe fn link_remove(link: *mut RecencyLink) {
    let flink = (*link).flink.load(Ordering::Relaxed);
    let blink = (*link).blink.load(Ordering::Relaxed);
    (*blink).flink.store(flink, Ordering::Relaxed);
    (*flink).blink.store(blink, Ordering::Relaxed);
    // leave the entry self-linked so a second remove is harmless
    link_init(link);
}

unsafe fn list_is_empty(head: *mut RecencyLink) -> bool {
    (*head).flink.load(Ordering::Relaxed) == head
}

/// Hash-table payload of one cached value.
struct LruEntry<K, V> {
    key: K,
    size: u64,
    value: V,
    link: RecencyLink,
}

fn entry_key<K: Clone, V>(entry: &LruEntry<K, V>) -> K {
    entry.key.clone()
}

unsafe fn entry_of_link<K, V>(link: *mut RecencyLink) -> *const LruEntry<K, V> {
    (link as *const u8).sub(core::mem::offset_of!(LruEntry<K, V>, link)) as *const LruEntry<K, V>
}

struct RecencyState {
    // boxed so the sentinel address survives moves of the cache value
    head: Box<RecencyLink>,
    current_size: u64,
}

impl RecencyState {
    #[inline]
    fn head_ptr(&self) -> *mut RecencyLink {
        &*self.head as *const RecencyLink as *mut RecencyLink
    }
}

/// A least-recently-used cache bounded by a byte capacity.
pub struct LruCache<K, V> {
    table: HashTable<LruEntry<K, V>, K>,
    state: Mutex<RecencyState>,
    capacity: u64,
    threads: ThreadCache,
}

impl<K: Ord + Clone, V> LruCache<K, V> {
    /// Create a cache holding at most `capacity` bytes of values.
    ///
    /// Returns `None` if `capacity` or `initial_bucket_count` is zero, or
    /// if a skipped-sequence-number callback is given without a sequence
    /// counter.
    pub fn new(
        hash: fn(&K) -> u64,
        initial_bucket_count: usize,
        capacity: u64,
        domain: Arc<HazardDomain>,
        sequence: Option<Arc<AtomicI64>>,
        skipped: Option<(SkippedSeqNoFn, *mut ())>,
    ) -> Option<Self> {
        if capacity == 0 {
            log::error!("cache capacity must not be zero");
            return None;
        }
        if sequence.is_none() && skipped.is_some() {
            log::error!("skipped-sequence-number callback requires a sequence counter");
            return None;
        }

        let table = match sequence {
            Some(sequence) => HashTable::with_sequence(
                hash,
                entry_key::<K, V>,
                initial_bucket_count,
                Arc::clone(&domain),
                sequence,
                skipped,
            )?,
            None => HashTable::new(
                hash,
                entry_key::<K, V>,
                initial_bucket_count,
                Arc::clone(&domain),
            )?,
        };

        let head = Box::new(RecencyLink::new());
        unsafe { link_init(&*head as *const RecencyLink as *mut RecencyLink) };

        Some(Self {
            table,
            state: Mutex::new(RecencyState {
                head,
                current_size: 0,
            }),
            capacity,
            threads: ThreadCache::new(domain),
        })
    }

    /// Insert or replace `key`, evicting least recently used entries until
    /// the new value fits.
    ///
    /// `evict` is invoked once per eviction; an eviction failure aborts the
    /// put with [`PutResult::Error`] and is reported with
    /// [`EvictResult::Error`].
    pub fn put(
        &self,
        key: K,
        value: V,
        size: u64,
        seq_out: Option<&mut i64>,
        evict: Option<(EvictFn, *mut ())>,
    ) -> PutResult {
        if size == 0 {
            log::error!("cannot cache a zero-sized value");
            return PutResult::Error;
        }
        if size > self.capacity {
            log::error!("value size {} exceeds cache capacity {}", size, self.capacity);
            return PutResult::ValueInvalidSize;
        }

        self.threads
            .with(|thread| self.put_inner(thread, key, value, size, seq_out, evict))
    }

    // The state lock is held across the paired table mutation and recency
    // update, so a table-resident entry is always linked and sized. The
    // table never has its writes locked by the cache, so holding the lock
    // across the lock-free call cannot block on anything but the call
    // itself.
    fn put_inner(
        &self,
        thread: &HazardThread,
        key: K,
        value: V,
        size: u64,
        mut seq_out: Option<&mut i64>,
        evict: Option<(EvictFn, *mut ())>,
    ) -> PutResult {
        // drop any entry already stored under this key
        {
            let mut state = self.lock_state();
            let mut previous: *mut SortedEntry<LruEntry<K, V>> = ptr::null_mut();
            if self.table.remove(thread, &key, &mut previous, seq_out.as_deref_mut())
                == DeleteResult::Ok
            {
                unsafe {
                    let entry = (*previous).data();
                    state.current_size -= entry.size;
                    link_remove(&entry.link as *const RecencyLink as *mut RecencyLink);
                    // release only after unlinking, the list must never
                    // hold a link into freed memory
                    SortedEntry::release(previous);
                }
            }
        }

        // make room, oldest first
        loop {
            let mut state = self.lock_state();
            if state.current_size + size <= self.capacity {
                break;
            }
            let head = state.head_ptr();

            let evicted = unsafe {
                if list_is_empty(head) {
                    break;
                }
                let oldest = (*head).flink.load(Ordering::Relaxed);
                let victim_key = (*entry_of_link::<K, V>(oldest)).key.clone();

                let mut victim: *mut SortedEntry<LruEntry<K, V>> = ptr::null_mut();
                if self.table.remove(thread, &victim_key, &mut victim, seq_out.as_deref_mut())
                    != DeleteResult::Ok
                {
                    false
                } else {
                    let entry = (*victim).data();
                    state.current_size -= entry.size;
                    link_remove(&entry.link as *const RecencyLink as *mut RecencyLink);
                    SortedEntry::release(victim);
                    true
                }
            };
            drop(state);

            if !evicted {
                log::error!("failed to evict a least recently used entry");
                if let Some((callback, ctx)) = evict {
                    callback(ctx, EvictResult::Error);
                }
                return PutResult::Error;
            }
            if let Some((callback, ctx)) = evict {
                callback(ctx, EvictResult::Ok);
            }
        }

        // install the new entry and make it most recent
        let item = SortedEntry::alloc(
            LruEntry {
                key,
                size,
                value,
                link: RecencyLink::new(),
            },
            None,
            ptr::null_mut(),
        );
        unsafe {
            let entry = (*item).data();
            link_init(&entry.link as *const RecencyLink as *mut RecencyLink);

            let mut state = self.lock_state();
            match self.table.insert(thread, item, seq_out.as_deref_mut()) {
                InsertResult::Ok => {
                    link_insert_tail(
                        state.head_ptr(),
                        &entry.link as *const RecencyLink as *mut RecencyLink,
                    );
                    state.current_size += size;
                    PutResult::Ok
                }
                InsertResult::KeyAlreadyExists => {
                    // cannot happen while the state lock serialises puts,
                    // but a caller-level race must not corrupt the cache
                    drop(state);
                    log::error!("lost an insert race for a cached key");
                    SortedEntry::release(item);
                    PutResult::Error
                }
            }
        }
    }

    /// Look up `key`, promote it to most recently used, and return a copy
    /// of the value.
    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        self.threads.with(|thread| {
            let found = self.table.find(thread, key);
            if found.is_null() {
                return None;
            }

            unsafe {
                let entry = (*found).data();
                let link = &entry.link as *const RecencyLink as *mut RecencyLink;
                {
                    let state = self.lock_state();
                    let head = state.head_ptr();
                    // a concurrent eviction may have unlinked the entry
                    // already (it is then self-linked); only a current
                    // member moves to the most recently used position
                    let still_linked = (*link).flink.load(Ordering::Relaxed) != link;
                    if still_linked && (*head).blink.load(Ordering::Relaxed) != link {
                        link_remove(link);
                        link_insert_tail(head, link);
                    }
                }
                let value = entry.value.clone();
                SortedEntry::release(found);
                Some(value)
            }
        })
    }

    /// Bytes currently held by the cache.
    pub fn current_size(&self) -> u64 {
        self.lock_state().current_size
    }

    #[inline]
    fn lock_state(&self) -> MutexGuard<'_, RecencyState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn identity_hash(key: &u64) -> u64 {
        *key
    }

    struct EvictRecorder {
        ok: AtomicUsize,
        error: AtomicUsize,
    }

    impl EvictRecorder {
        fn new() -> Self {
            Self {
                ok: AtomicUsize::new(0),
                error: AtomicUsize::new(0),
            }
        }

        fn ctx(&self) -> *mut () {
            self as *const EvictRecorder as *mut ()
        }
    }

    fn record_evict(ctx: *mut (), result: EvictResult) {
        let recorder = unsafe { &*(ctx as *const EvictRecorder) };
        match result {
            EvictResult::Ok => recorder.ok.fetch_add(1, Ordering::SeqCst),
            EvictResult::Error => recorder.error.fetch_add(1, Ordering::SeqCst),
        };
    }

    fn new_cache(capacity: u64) -> LruCache<u64, u64> {
        let domain = Arc::new(HazardDomain::new());
        LruCache::new(identity_hash, 4, capacity, domain, None, None)
            .expect("arguments are valid")
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let domain = Arc::new(HazardDomain::new());
        assert!(LruCache::<u64, u64>::new(identity_hash, 4, 0, domain, None, None).is_none());
    }

    #[test]
    fn test_put_and_get() {
        let cache = new_cache(10);
        assert_eq!(cache.put(1, 100, 1, None, None), PutResult::Ok);
        assert_eq!(cache.get(&1), Some(100));
        assert_eq!(cache.get(&2), None);
        assert_eq!(cache.current_size(), 1);
    }

    #[test]
    fn test_oversized_value_rejected() {
        let cache = new_cache(3);
        assert_eq!(cache.put(1, 100, 4, None, None), PutResult::ValueInvalidSize);
        assert_eq!(cache.put(2, 100, 0, None, None), PutResult::Error);
        assert_eq!(cache.current_size(), 0);
    }

    #[test]
    fn test_replace_updates_value_and_size() {
        let cache = new_cache(10);
        assert_eq!(cache.put(1, 100, 2, None, None), PutResult::Ok);
        assert_eq!(cache.put(1, 200, 5, None, None), PutResult::Ok);
        assert_eq!(cache.get(&1), Some(200));
        assert_eq!(cache.current_size(), 5);
    }

    #[test]
    fn test_put_evicts_oldest_exactly_once() {
        let recorder = EvictRecorder::new();
        let cache = new_cache(3);

        for key in 1..=3u64 {
            assert_eq!(
                cache.put(key, key * 10, 1, None, Some((record_evict, recorder.ctx()))),
                PutResult::Ok
            );
        }
        assert_eq!(recorder.ok.load(Ordering::SeqCst), 0);

        assert_eq!(
            cache.put(4, 40, 1, None, Some((record_evict, recorder.ctx()))),
            PutResult::Ok
        );

        // exactly the oldest entry was evicted
        assert_eq!(recorder.ok.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.error.load(Ordering::SeqCst), 0);
        assert_eq!(cache.get(&1), None);
        assert_eq!(cache.get(&2), Some(20));
        assert_eq!(cache.get(&3), Some(30));
        assert_eq!(cache.get(&4), Some(40));
        assert_eq!(cache.current_size(), 3);
    }

    #[test]
    fn test_get_promotes_to_most_recent() {
        let cache = new_cache(2);
        assert_eq!(cache.put(1, 10, 1, None, None), PutResult::Ok);
        assert_eq!(cache.put(2, 20, 1, None, None), PutResult::Ok);

        // touch key 1 so key 2 becomes the eviction candidate
        assert_eq!(cache.get(&1), Some(10));
        assert_eq!(cache.put(3, 30, 1, None, None), PutResult::Ok);

        assert_eq!(cache.get(&1), Some(10));
        assert_eq!(cache.get(&2), None);
        assert_eq!(cache.get(&3), Some(30));
    }

    #[test]
    fn test_large_value_evicts_several() {
        let recorder = EvictRecorder::new();
        let cache = new_cache(4);

        for key in 1..=4u64 {
            assert_eq!(cache.put(key, key, 1, None, None), PutResult::Ok);
        }
        assert_eq!(
            cache.put(9, 90, 3, None, Some((record_evict, recorder.ctx()))),
            PutResult::Ok
        );

        assert_eq!(recorder.ok.load(Ordering::SeqCst), 3);
        assert_eq!(cache.get(&1), None);
        assert_eq!(cache.get(&2), None);
        assert_eq!(cache.get(&3), None);
        assert_eq!(cache.get(&4), Some(4));
        assert_eq!(cache.get(&9), Some(90));
        assert_eq!(cache.current_size(), 4);
    }

    #[test]
    fn test_sequence_numbers_flow_through() {
        let domain = Arc::new(HazardDomain::new());
        let sequence = Arc::new(AtomicI64::new(0));
        let cache: LruCache<u64, u64> = LruCache::new(
            identity_hash,
            4,
            10,
            domain,
            Some(Arc::clone(&sequence)),
            None,
        )
        .expect("arguments are valid");

        let mut seq = 0i64;
        assert_eq!(cache.put(1, 10, 1, Some(&mut seq), None), PutResult::Ok);
        assert_eq!(seq, 1);
        assert_eq!(cache.put(2, 20, 1, Some(&mut seq), None), PutResult::Ok);
        assert_eq!(seq, 2);

        // replacing consumes a remove stamp and an insert stamp
        assert_eq!(cache.put(1, 11, 1, Some(&mut seq), None), PutResult::Ok);
        assert_eq!(seq, 4);
    }

    #[test]
    fn test_concurrent_puts_and_gets() {
        use std::thread;

        let domain = Arc::new(HazardDomain::new());
        let cache: Arc<LruCache<u64, u64>> = Arc::new(
            LruCache::new(identity_hash, 4, 64, domain, None, None).expect("arguments are valid"),
        );

        let mut handles = Vec::new();
        for t in 0..4u64 {
            let cache = Arc::clone(&cache);
            handles.push(thread::spawn(move || {
                for i in 0..300u64 {
                    let key = (t * 17 + i) % 96;
                    cache.put(key, key * 2, 1, None, None);
                    if let Some(value) = cache.get(&key) {
                        assert_eq!(value, key * 2);
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().expect("worker panicked");
        }

        assert!(cache.current_size() <= 64);
    }
}
