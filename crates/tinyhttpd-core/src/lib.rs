//! # tinyhttpd-core — concurrency plumbing
//!
//! The protocol-agnostic half of tinyhttpd: a counting semaphore, a bounded
//! FIFO work queue, and a fixed-size worker pool. The server crate feeds
//! connection handles through the queue; workers pull one handle at a time
//! and run its `process` step.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  push (fail-fast)   ┌─────────────────┐
//! │   producer    │ ──────────────────► │  WorkQueue<T>   │
//! │ (the reactor) │                     │  Mutex<VecDeque>│
//! └──────────────┘                     │  + Semaphore    │
//!                                      └────────┬────────┘
//!                                               │ pop (blocking)
//!                            ┌──────────────────┼──────────────────┐
//!                            ▼                  ▼                  ▼
//!                       ┌─────────┐        ┌─────────┐        ┌─────────┐
//!                       │ worker 0│        │ worker 1│   …    │ worker N│
//!                       │ process │        │ process │        │ process │
//!                       └─────────┘        └─────────┘        └─────────┘
//! ```
//!
//! ## Design Decisions
//!
//! - **Semaphore + mutex, not a condvar-only queue**: the semaphore counts
//!   "items available" separately from "exclusive access to the deque", and
//!   the producer never blocks; a full queue is a shed, not a wait.
//! - **Generic work item**: `WorkerPool<T: Work>` knows nothing about HTTP;
//!   the server crate supplies the item type.
//! - **Sentinel shutdown**: `stop()` posts one wakeup per worker so threads
//!   parked in `wait` observe the stop flag and exit.

pub mod error;
pub mod pool;
pub mod queue;
pub mod sync;

pub use error::{SetupError, SetupResult};
pub use pool::{Work, WorkerPool};
pub use queue::WorkQueue;
pub use sync::Semaphore;
