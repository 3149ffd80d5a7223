//! Write gate.
//!
//! A coarse, reader-preferring exclusive gate between normal mutators and
//! snapshot readers. Mutators pass through a pending-operation counter;
//! a snapshot holder raises `locked_for_write` and waits for the pending
//! count to drain. The counters carry the uncontended fast path; a single
//! mutex/condvar pair carries the sleep and wake edges.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};

use crossbeam_utils::CachePadded;

pub(crate) struct WriteGate {
    locked_for_write: CachePadded<AtomicU32>,
    pending_write_ops: CachePadded<AtomicU32>,
    mutex: Mutex<()>,
    cond: Condvar,
}

impl WriteGate {
    pub(crate) fn new() -> Self {
        Self {
            locked_for_write: CachePadded::new(AtomicU32::new(0)),
            pending_write_ops: CachePadded::new(AtomicU32::new(0)),
            mutex: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    /// Enter a mutating operation, waiting out any write lock.
    pub(crate) fn begin_write(&self) {
        loop {
            self.pending_write_ops.fetch_add(1, Ordering::AcqRel);
            if self.locked_for_write.load(Ordering::Acquire) == 0 {
                return;
            }

            // a lock holder is active: withdraw, wake it in case it is
            // waiting for the pending count, then sleep until unlock
            self.pending_write_ops.fetch_sub(1, Ordering::AcqRel);
            let mut guard = self.mutex.lock().unwrap_or_else(PoisonError::into_inner);
            self.cond.notify_all();
            while self.locked_for_write.load(Ordering::Acquire) != 0 {
                guard = self
                    .cond
                    .wait(guard)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }
    }

    /// Leave a mutating operation.
    pub(crate) fn end_write(&self) {
        self.pending_write_ops.fetch_sub(1, Ordering::AcqRel);
        let _guard = self.mutex.lock().unwrap_or_else(PoisonError::into_inner);
        self.cond.notify_all();
    }

    /// Block new mutators and wait for in-flight ones to drain.
    pub(crate) fn lock_writes(&self) {
        self.locked_for_write.fetch_add(1, Ordering::AcqRel);
        let mut guard = self.mutex.lock().unwrap_or_else(PoisonError::into_inner);
        while self.pending_write_ops.load(Ordering::Acquire) != 0 {
            guard = self
                .cond
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Release a write lock and wake blocked mutators.
    pub(crate) fn unlock_writes(&self) {
        self.locked_for_write.fetch_sub(1, Ordering::AcqRel);
        let _guard = self.mutex.lock().unwrap_or_else(PoisonError::into_inner);
        self.cond.notify_all();
    }

    #[inline]
    pub(crate) fn is_locked(&self) -> bool {
        self.locked_for_write.load(Ordering::Acquire) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_begin_end_uncontended() {
        let gate = WriteGate::new();
        gate.begin_write();
        assert!(!gate.is_locked());
        gate.end_write();
    }

    #[test]
    fn test_lock_reports_locked() {
        let gate = WriteGate::new();
        assert!(!gate.is_locked());
        gate.lock_writes();
        assert!(gate.is_locked());
        gate.unlock_writes();
        assert!(!gate.is_locked());
    }

    #[test]
    fn test_lock_waits_for_pending_writer() {
        let gate = Arc::new(WriteGate::new());
        let order = Arc::new(AtomicUsize::new(0));

        gate.begin_write();

        let locker = {
            let gate = Arc::clone(&gate);
            let order = Arc::clone(&order);
            thread::spawn(move || {
                gate.lock_writes();
                order.fetch_add(1, Ordering::SeqCst);
                gate.unlock_writes();
            })
        };

        // the locker must not get through while our write is pending
        thread::sleep(Duration::from_millis(50));
        assert_eq!(order.load(Ordering::SeqCst), 0);

        gate.end_write();
        locker.join().expect("locker thread panicked");
        assert_eq!(order.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_writer_waits_for_unlock() {
        let gate = Arc::new(WriteGate::new());
        let entered = Arc::new(AtomicUsize::new(0));

        gate.lock_writes();

        let writer = {
            let gate = Arc::clone(&gate);
            let entered = Arc::clone(&entered);
            thread::spawn(move || {
                gate.begin_write();
                entered.fetch_add(1, Ordering::SeqCst);
                gate.end_write();
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert_eq!(entered.load(Ordering::SeqCst), 0);

        gate.unlock_writes();
        writer.join().expect("writer thread panicked");
        assert_eq!(entered.load(Ordering::SeqCst), 1);
    }
}
