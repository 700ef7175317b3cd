//! Bounded FIFO work queue
//!
//! The hand-off point between the reactor and the worker pool. The producer
//! side never blocks: pushing into a full queue fails immediately so the
//! reactor can shed the connection instead of stalling the event loop.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use log::warn;

use crate::sync::Semaphore;

/// A FIFO queue of work items with a fixed maximum depth
///
/// Items are appended under the mutex; availability is signalled through the
/// semaphore. Consumers block in [`pop`](Self::pop) until an item (or a
/// shutdown sentinel) arrives.
pub struct WorkQueue<T> {
    items: Mutex<VecDeque<T>>,
    pending: Semaphore,
    capacity: usize,
    stopping: AtomicBool,
}

impl<T> WorkQueue<T> {
    /// Create a queue holding at most `capacity` items
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            pending: Semaphore::new(0),
            capacity,
            stopping: AtomicBool::new(false),
        }
    }

    /// Append an item, failing fast when the queue is full
    ///
    /// Returns false when the queue already holds `capacity` items; the
    /// caller decides what load shedding means for the item.
    pub fn push(&self, item: T) -> bool {
        {
            let mut items = self.items.lock().unwrap();
            if items.len() >= self.capacity {
                drop(items);
                warn!("work queue full ({} items), shedding", self.capacity);
                return false;
            }
            items.push_back(item);
        }
        self.pending.post();
        true
    }

    /// Remove and return the oldest item, blocking while the queue is empty
    ///
    /// Returns `None` once [`stop`](Self::stop) has been called and a
    /// sentinel wakeup is consumed. A wakeup that finds the queue empty
    /// without a stop in effect (spurious) goes back to waiting.
    pub fn pop(&self) -> Option<T> {
        loop {
            self.pending.wait();
            if self.stopping.load(Ordering::Acquire) {
                return None;
            }
            let mut items = self.items.lock().unwrap();
            if let Some(item) = items.pop_front() {
                return Some(item);
            }
            // Spurious: signalled but drained by a sibling. Wait again.
        }
    }

    /// Mark the queue as stopping and wake `waiters` blocked consumers
    pub fn stop(&self, waiters: usize) {
        self.stopping.store(true, Ordering::Release);
        for _ in 0..waiters {
            self.pending.post();
        }
    }

    /// Current queue depth
    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    /// True when no items are queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_fifo_order() {
        let q = WorkQueue::new(16);
        assert!(q.push(1));
        assert!(q.push(2));
        assert!(q.push(3));
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
    }

    #[test]
    fn test_push_fails_when_full() {
        let q = WorkQueue::new(3);
        assert!(q.push(1));
        assert!(q.push(2));
        assert!(q.push(3));
        // The fourth item is rejected, the first three survive.
        assert!(!q.push(4));
        assert_eq!(q.len(), 3);
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
    }

    #[test]
    fn test_full_depth_sheds_only_the_overflow() {
        let q = WorkQueue::new(10_000);
        for i in 0..10_000 {
            assert!(q.push(i));
        }
        assert!(!q.push(10_000));
        // Everything below the bound is still there, in order.
        for i in 0..10_000 {
            assert_eq!(q.pop(), Some(i));
        }
        assert!(q.is_empty());
    }

    #[test]
    fn test_reject_then_accept_after_drain() {
        let q = WorkQueue::new(1);
        assert!(q.push(1));
        assert!(!q.push(2));
        assert_eq!(q.pop(), Some(1));
        assert!(q.push(3));
        assert_eq!(q.pop(), Some(3));
    }

    #[test]
    fn test_pop_blocks_until_push() {
        let q = Arc::new(WorkQueue::new(4));

        let consumer = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.pop())
        };

        thread::sleep(Duration::from_millis(20));
        assert!(q.push(42));
        assert_eq!(consumer.join().unwrap(), Some(42));
    }

    #[test]
    fn test_stop_wakes_idle_consumers() {
        let q: Arc<WorkQueue<u32>> = Arc::new(WorkQueue::new(4));
        let mut handles = vec![];

        for _ in 0..3 {
            let q = Arc::clone(&q);
            handles.push(thread::spawn(move || q.pop()));
        }

        thread::sleep(Duration::from_millis(20));
        q.stop(3);
        for h in handles {
            assert_eq!(h.join().unwrap(), None);
        }
    }

    #[test]
    fn test_concurrent_producers_consumers() {
        let q = Arc::new(WorkQueue::new(10_000));
        let mut producers = vec![];
        let mut consumers = vec![];

        for t in 0..4u32 {
            let q = Arc::clone(&q);
            producers.push(thread::spawn(move || {
                for i in 0..500 {
                    while !q.push(t * 1000 + i) {
                        thread::yield_now();
                    }
                }
            }));
        }
        for _ in 0..4 {
            let q = Arc::clone(&q);
            consumers.push(thread::spawn(move || {
                let mut got = 0;
                while got < 500 {
                    if q.pop().is_some() {
                        got += 1;
                    }
                }
                got
            }));
        }

        for h in producers {
            h.join().unwrap();
        }
        let total: usize = consumers.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 2000);
        assert!(q.is_empty());
    }
}
