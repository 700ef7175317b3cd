//! Counting semaphore
//!
//! std ships a mutex and a condition variable but no semaphore, so the work
//! queue's "items available" counter is built from the two. A waiter loops
//! around `Condvar::wait`, which makes spurious wakeups harmless.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A counting semaphore
///
/// `post` increments the count and wakes one waiter; `wait` blocks until the
/// count is positive and then decrements it.
///
/// # Example
///
/// ```
/// use tinyhttpd_core::Semaphore;
///
/// let sem = Semaphore::new(0);
/// sem.post();
/// sem.wait(); // consumes the post, returns immediately
/// ```
pub struct Semaphore {
    count: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    /// Create a semaphore with the given initial count
    pub const fn new(initial: usize) -> Self {
        Self {
            count: Mutex::new(initial),
            available: Condvar::new(),
        }
    }

    /// Increment the count and wake one waiter
    pub fn post(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        self.available.notify_one();
    }

    /// Block until the count is positive, then decrement it
    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.available.wait(count).unwrap();
        }
        *count -= 1;
    }

    /// Like [`wait`](Self::wait), but give up after `timeout`
    ///
    /// Returns true if a unit was consumed, false on timeout. Spurious
    /// wakeups resume waiting for the remainder of the deadline only.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(remaining) => remaining,
                None => return false,
            };
            let (guard, result) = self.available.wait_timeout(count, remaining).unwrap();
            count = guard;
            if result.timed_out() && *count == 0 {
                return false;
            }
        }
        *count -= 1;
        true
    }

    /// Decrement the count if it is positive, without blocking
    pub fn try_wait(&self) -> bool {
        let mut count = self.count.lock().unwrap();
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_post_then_wait() {
        let sem = Semaphore::new(0);
        sem.post();
        sem.post();
        sem.wait();
        sem.wait();
        assert!(!sem.try_wait());
    }

    #[test]
    fn test_initial_count() {
        let sem = Semaphore::new(3);
        assert!(sem.try_wait());
        assert!(sem.try_wait());
        assert!(sem.try_wait());
        assert!(!sem.try_wait());
    }

    #[test]
    fn test_wait_timeout_expires() {
        let sem = Semaphore::new(0);
        assert!(!sem.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_wait_timeout_consumes() {
        let sem = Semaphore::new(1);
        assert!(sem.wait_timeout(Duration::from_millis(10)));
        assert!(!sem.try_wait());
    }

    #[test]
    fn test_wait_timeout_honors_deadline_across_wakeups() {
        // One post, two waiters: the loser's wakeups must not restart its
        // full timeout, so it still returns within the original deadline.
        let sem = Arc::new(Semaphore::new(0));
        let start = Instant::now();
        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let sem = Arc::clone(&sem);
                thread::spawn(move || sem.wait_timeout(Duration::from_secs(1)))
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        sem.post();

        let consumed = waiters
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&got| got)
            .count();
        assert_eq!(consumed, 1);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_wait_blocks_until_post() {
        let sem = Arc::new(Semaphore::new(0));

        let waiter = {
            let sem = Arc::clone(&sem);
            thread::spawn(move || {
                sem.wait();
            })
        };

        thread::sleep(Duration::from_millis(20));
        sem.post();
        waiter.join().unwrap();
    }

    #[test]
    fn test_concurrent_post_wait() {
        let sem = Arc::new(Semaphore::new(0));
        let mut handles = vec![];

        for _ in 0..4 {
            let sem = Arc::clone(&sem);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    sem.post();
                }
            }));
        }
        for _ in 0..4 {
            let sem = Arc::clone(&sem);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    sem.wait();
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }
        assert!(!sem.try_wait());
    }
}
