//! Worker pool
//!
//! A fixed number of long-lived threads, each looping on the shared work
//! queue. Workers never touch sockets; by the time an item reaches the
//! queue its input bytes are already buffered, so `process` is pure
//! in-memory work plus filesystem metadata calls.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::debug;

use crate::error::{SetupError, SetupResult};
use crate::queue::WorkQueue;

/// A unit of work the pool knows how to run
pub trait Work {
    /// Run one processing step for this item
    fn process(&self);
}

/// Fixed-size pool of worker threads draining a [`WorkQueue`]
pub struct WorkerPool<T> {
    queue: Arc<WorkQueue<T>>,
    handles: Vec<JoinHandle<()>>,
    workers: usize,
}

impl<T: Work + Send + 'static> WorkerPool<T> {
    /// Spawn `workers` threads draining `queue`
    pub fn start(queue: Arc<WorkQueue<T>>, workers: usize) -> SetupResult<Self> {
        if workers == 0 {
            return Err(SetupError::BadConfig("worker count must be nonzero"));
        }

        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let queue = Arc::clone(&queue);
            let handle = thread::Builder::new()
                .name(format!("tinyhttpd-worker-{}", i))
                .spawn(move || worker_loop(i, queue))
                .map_err(SetupError::WorkerSpawn)?;
            handles.push(handle);
        }

        Ok(Self {
            queue,
            handles,
            workers,
        })
    }

    /// Number of worker threads
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Stop the pool: wake every idle worker and join them all
    ///
    /// Items still queued when stop is called are dropped unprocessed.
    pub fn stop(self) {
        self.queue.stop(self.workers);
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

fn worker_loop<T: Work>(id: usize, queue: Arc<WorkQueue<T>>) {
    debug!("worker {} up", id);
    while let Some(item) = queue.pop() {
        item.process();
    }
    debug!("worker {} exiting", id);
}
