//! Multi-producer single-consumer lock-free queue.
//!
//! Two singly linked stacks: producers push onto `enqueue_head` with a CAS
//! (newest first), and the single consumer serves dequeues from
//! `dequeue_head` (oldest first). When the dequeue side runs dry the
//! consumer swaps the whole producer stack out in one exchange and
//! reverses it, which turns the LIFO batch into FIFO order. Within one
//! producer the enqueue order is therefore preserved end to end.
//!
//! Entry memory is owned by the caller, as with the other intrusive
//! structures in this crate.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crossbeam_utils::Backoff;

/// An intrusive queue entry with embedded payload.
#[repr(C)]
pub struct QueueEntry<T> {
    next: AtomicPtr<QueueEntry<T>>,
    data: T,
}

impl<T> QueueEntry<T> {
    /// Create a new unlinked entry.
    #[inline]
    pub fn new(data: T) -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
            data,
        }
    }

    /// Borrow the payload.
    #[inline]
    pub fn data(&self) -> &T {
        &self.data
    }

    /// Consume the entry and return the payload.
    #[inline]
    pub fn into_data(self) -> T {
        self.data
    }
}

/// A multi-producer single-consumer queue.
pub struct MpscQueue<T> {
    enqueue_head: AtomicPtr<QueueEntry<T>>,
    dequeue_head: AtomicPtr<QueueEntry<T>>,
}

unsafe impl<T: Send> Send for MpscQueue<T> {}
unsafe impl<T: Send> Sync for MpscQueue<T> {}

impl<T> MpscQueue<T> {
    /// Create an empty queue.
    pub const fn new() -> Self {
        Self {
            enqueue_head: AtomicPtr::new(ptr::null_mut()),
            dequeue_head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Check whether both sides of the queue are empty.
    ///
    /// Only a stable answer if producers are quiet or the caller is the
    /// consumer.
    pub fn is_empty(&self) -> bool {
        self.enqueue_head.load(Ordering::Acquire).is_null()
            && self.dequeue_head.load(Ordering::Acquire).is_null()
    }

    /// Push an entry. Safe to call from any number of threads.
    ///
    /// # Safety
    ///
    /// `entry` must be valid and not currently linked into any queue.
    pub unsafe fn enqueue(&self, entry: *mut QueueEntry<T>) {
        debug_assert!(!entry.is_null());

        let backoff = Backoff::new();
        loop {
            let head = self.enqueue_head.load(Ordering::Relaxed);
            (*entry).next.store(head, Ordering::Relaxed);
            if self
                .enqueue_head
                .compare_exchange_weak(head, entry, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
            backoff.spin();
        }
    }

    /// Pop the oldest entry, or `None` if the queue is empty.
    ///
    /// # Safety
    ///
    /// Must only be called from the single consumer thread.
    pub unsafe fn dequeue(&self) -> Option<*mut QueueEntry<T>> {
        let head = self.dequeue_head.load(Ordering::Relaxed);
        if !head.is_null() {
            self.dequeue_head
                .store((*head).next.load(Ordering::Relaxed), Ordering::Relaxed);
            return Some(head);
        }

        let batch = self.enqueue_head.swap(ptr::null_mut(), Ordering::AcqRel);
        if batch.is_null() {
            return None;
        }

        let oldest = Self::reverse(batch);
        self.dequeue_head
            .store((*oldest).next.load(Ordering::Relaxed), Ordering::Relaxed);
        Some(oldest)
    }

    /// Oldest entry without removing it, or `None` if the queue is empty.
    ///
    /// # Safety
    ///
    /// Must only be called from the single consumer thread.
    pub unsafe fn peek(&self) -> Option<*mut QueueEntry<T>> {
        let head = self.dequeue_head.load(Ordering::Relaxed);
        if !head.is_null() {
            return Some(head);
        }

        let batch = self.enqueue_head.swap(ptr::null_mut(), Ordering::AcqRel);
        if batch.is_null() {
            return None;
        }

        let oldest = Self::reverse(batch);
        self.dequeue_head.store(oldest, Ordering::Relaxed);
        Some(oldest)
    }

    /// Reverse a LIFO batch in place, returning the oldest entry.
    unsafe fn reverse(batch: *mut QueueEntry<T>) -> *mut QueueEntry<T> {
        let mut prev: *mut QueueEntry<T> = ptr::null_mut();
        let mut current = batch;
        while !current.is_null() {
            let next = (*current).next.load(Ordering::Relaxed);
            (*current).next.store(prev, Ordering::Relaxed);
            prev = current;
            current = next;
        }
        prev
    }
}

impl<T> Default for MpscQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    unsafe fn drain(queue: &MpscQueue<u64>) -> Vec<u64> {
        let mut values = Vec::new();
        while let Some(entry) = queue.dequeue() {
            values.push(*Box::from_raw(entry).data());
            // entry memory reclaimed by the Box drop above
        }
        values
    }

    #[test]
    fn test_new_is_empty() {
        let queue: MpscQueue<u64> = MpscQueue::new();
        assert!(queue.is_empty());
        unsafe {
            assert!(queue.dequeue().is_none());
            assert!(queue.peek().is_none());
        }
    }

    #[test]
    fn test_fifo_order() {
        let queue: MpscQueue<u64> = MpscQueue::new();
        unsafe {
            queue.enqueue(Box::into_raw(Box::new(QueueEntry::new(1))));
            queue.enqueue(Box::into_raw(Box::new(QueueEntry::new(2))));
            queue.enqueue(Box::into_raw(Box::new(QueueEntry::new(3))));

            assert_eq!(drain(&queue), vec![1, 2, 3]);
            assert!(queue.is_empty());
        }
    }

    #[test]
    fn test_peek_does_not_remove() {
        let queue: MpscQueue<u64> = MpscQueue::new();
        unsafe {
            queue.enqueue(Box::into_raw(Box::new(QueueEntry::new(7))));

            let peeked = queue.peek().expect("queue is non-empty");
            assert_eq!(*(*peeked).data(), 7);
            assert!(!queue.is_empty());

            let dequeued = queue.dequeue().expect("queue is non-empty");
            assert_eq!(peeked, dequeued);
            drop(Box::from_raw(dequeued));
            assert!(queue.is_empty());
        }
    }

    #[test]
    fn test_interleaved_enqueue_dequeue() {
        let queue: MpscQueue<u64> = MpscQueue::new();
        unsafe {
            queue.enqueue(Box::into_raw(Box::new(QueueEntry::new(1))));
            queue.enqueue(Box::into_raw(Box::new(QueueEntry::new(2))));

            let first = queue.dequeue().expect("queue is non-empty");
            assert_eq!(*(*first).data(), 1);
            drop(Box::from_raw(first));

            // a new enqueue lands behind the already-reversed batch
            queue.enqueue(Box::into_raw(Box::new(QueueEntry::new(3))));
            assert_eq!(drain(&queue), vec![2, 3]);
        }
    }

    #[test]
    fn test_producers_keep_their_order() {
        const PRODUCERS: u64 = 4;
        const PER_PRODUCER: u64 = 25_000;

        let queue: Arc<MpscQueue<u64>> = Arc::new(MpscQueue::new());

        let mut producers = Vec::new();
        for p in 0..PRODUCERS {
            let queue = Arc::clone(&queue);
            producers.push(thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    let value = p * PER_PRODUCER + i;
                    unsafe {
                        queue.enqueue(Box::into_raw(Box::new(QueueEntry::new(value))));
                    }
                }
            }));
        }

        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let mut last_seen = vec![None::<u64>; PRODUCERS as usize];
                let mut received = 0u64;
                while received < PRODUCERS * PER_PRODUCER {
                    let entry = unsafe { queue.dequeue() };
                    let Some(entry) = entry else {
                        std::hint::spin_loop();
                        continue;
                    };
                    let value = unsafe { *Box::from_raw(entry).data() };
                    let producer = (value / PER_PRODUCER) as usize;
                    let index = value % PER_PRODUCER;
                    // each producer's subsequence arrives in order
                    if let Some(previous) = last_seen[producer] {
                        assert!(index > previous);
                    }
                    last_seen[producer] = Some(index);
                    received += 1;
                }
                received
            })
        };

        for producer in producers {
            producer.join().expect("producer panicked");
        }
        let received = consumer.join().expect("consumer panicked");
        assert_eq!(received, PRODUCERS * PER_PRODUCER);
        assert!(queue.is_empty());
    }
}
