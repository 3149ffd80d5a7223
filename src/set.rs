//! Lock-free set of intrusive entries.
//!
//! Entries are caller-owned and pushed onto a singly linked stack with a
//! CAS. Removal is logical: the entry's membership flag is cleared and the
//! link is left in place, which keeps removal a single wait-free store and
//! sidesteps the coordination a concurrent physical unlink would need.
//! Logically removed entries are swept out by
//! [`purge_not_thread_safe`](LockFreeSet::purge_not_thread_safe), which
//! requires quiescence.
//!
//! An entry's memory must stay valid until it has been purged or the set
//! is dropped, even after `remove` returns.

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use crossbeam_utils::Backoff;

/// Cleanup callback invoked from the purge for each entry still in the set.
pub type SetCleanupFn = fn(ctx: *mut (), entry: *mut SetEntry);

/// An intrusive set entry, embedded into a caller-owned structure.
#[repr(C)]
pub struct SetEntry {
    next: AtomicPtr<SetEntry>,
    in_set: AtomicBool,
    linked: AtomicBool,
}

impl SetEntry {
    /// Create a new unlinked entry.
    pub fn new() -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
            in_set: AtomicBool::new(false),
            linked: AtomicBool::new(false),
        }
    }
}

impl Default for SetEntry {
    fn default() -> Self {
        Self::new()
    }
}

/// A lock-free set with insert, logical remove, and quiescent purge.
pub struct LockFreeSet {
    head: AtomicPtr<SetEntry>,
}

unsafe impl Send for LockFreeSet {}
unsafe impl Sync for LockFreeSet {}

impl LockFreeSet {
    /// Create an empty set.
    pub const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Add an entry to the set.
    ///
    /// Returns `false` if the entry is already a member.
    ///
    /// # Safety
    ///
    /// `entry` must be valid, stay valid until purged or the set is
    /// dropped, and not be linked into any other set.
    pub unsafe fn insert(&self, entry: *mut SetEntry) -> bool {
        debug_assert!(!entry.is_null());

        if (*entry).in_set.swap(true, Ordering::AcqRel) {
            return false;
        }

        // an entry that survived a logical remove is still reachable from
        // the stack; only first-time members get pushed
        if (*entry).linked.swap(true, Ordering::AcqRel) {
            return true;
        }

        let backoff = Backoff::new();
        loop {
            let head = self.head.load(Ordering::Relaxed);
            (*entry).next.store(head, Ordering::Relaxed);
            if self
                .head
                .compare_exchange_weak(head, entry, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
            backoff.spin();
        }
    }

    /// Logically remove an entry.
    ///
    /// Returns `false` if the entry is not a member. The entry stays
    /// linked (and its memory must stay valid) until the next purge.
    ///
    /// # Safety
    ///
    /// `entry` must be valid.
    pub unsafe fn remove(&self, entry: *mut SetEntry) -> bool {
        debug_assert!(!entry.is_null());
        (*entry).in_set.swap(false, Ordering::AcqRel)
    }

    /// Unlink every entry, invoking `cleanup` for those still members.
    ///
    /// # Safety
    ///
    /// Requires quiescence: no concurrent insert or remove.
    pub unsafe fn purge_not_thread_safe(&self, cleanup: Option<(SetCleanupFn, *mut ())>) {
        let mut entry = self.head.swap(ptr::null_mut(), Ordering::AcqRel);
        while !entry.is_null() {
            let next = (*entry).next.load(Ordering::Relaxed);
            (*entry).next.store(ptr::null_mut(), Ordering::Relaxed);
            (*entry).linked.store(false, Ordering::Relaxed);
            if (*entry).in_set.swap(false, Ordering::Relaxed) {
                if let Some((callback, ctx)) = cleanup {
                    callback(ctx, entry);
                }
            }
            entry = next;
        }
    }
}

impl Default for LockFreeSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    struct Tracked {
        entry: SetEntry,
        value: u64,
    }

    fn count_purged(ctx: *mut (), _entry: *mut SetEntry) {
        unsafe { (*(ctx as *const AtomicUsize)).fetch_add(1, Ordering::SeqCst) };
    }

    #[test]
    fn test_insert_remove() {
        let set = LockFreeSet::new();
        let mut item = Tracked {
            entry: SetEntry::new(),
            value: 1,
        };

        unsafe {
            assert!(set.insert(&mut item.entry));
            assert!(!set.insert(&mut item.entry));
            assert!(set.remove(&mut item.entry));
            assert!(!set.remove(&mut item.entry));
        }
        assert_eq!(item.value, 1);
    }

    #[test]
    fn test_reinsert_after_remove() {
        let set = LockFreeSet::new();
        let mut item = Tracked {
            entry: SetEntry::new(),
            value: 2,
        };

        unsafe {
            assert!(set.insert(&mut item.entry));
            assert!(set.remove(&mut item.entry));
            assert!(set.insert(&mut item.entry));
            assert!(set.remove(&mut item.entry));
        }
    }

    #[test]
    fn test_purge_visits_members_only() {
        let purged = AtomicUsize::new(0);
        let ctx = &purged as *const AtomicUsize as *mut ();

        let set = LockFreeSet::new();
        let mut items: Vec<Tracked> = (0..10)
            .map(|value| Tracked {
                entry: SetEntry::new(),
                value,
            })
            .collect();

        unsafe {
            for item in items.iter_mut() {
                set.insert(&mut item.entry);
            }
            // logically remove the even-valued half
            for item in items.iter_mut().filter(|i| i.value % 2 == 0) {
                set.remove(&mut item.entry);
            }

            set.purge_not_thread_safe(Some((count_purged, ctx)));
        }
        assert_eq!(purged.load(Ordering::SeqCst), 5);

        // the set is empty afterwards; entries can go back in
        unsafe {
            assert!(set.insert(&mut items[0].entry));
            set.purge_not_thread_safe(None);
        }
    }

    #[test]
    fn test_concurrent_insert_remove() {
        let set = Arc::new(LockFreeSet::new());
        let mut items: Vec<Box<Tracked>> = (0..4 * 64)
            .map(|value| {
                Box::new(Tracked {
                    entry: SetEntry::new(),
                    value,
                })
            })
            .collect();
        let pointers: Vec<usize> = items
            .iter_mut()
            .map(|item| &mut item.entry as *mut SetEntry as usize)
            .collect();

        let mut handles = Vec::new();
        for t in 0..4usize {
            let set = Arc::clone(&set);
            let slice: Vec<usize> = pointers[t * 64..(t + 1) * 64].to_vec();
            handles.push(thread::spawn(move || {
                for &entry in &slice {
                    let entry = entry as *mut SetEntry;
                    unsafe {
                        assert!(set.insert(entry));
                        assert!(set.remove(entry));
                        assert!(set.insert(entry));
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().expect("worker panicked");
        }

        let purged = AtomicUsize::new(0);
        unsafe {
            set.purge_not_thread_safe(Some((
                count_purged,
                &purged as *const AtomicUsize as *mut (),
            )));
        }
        // every entry finished in the inserted state
        assert_eq!(purged.load(Ordering::SeqCst), 4 * 64);
        drop(items);
    }
}
