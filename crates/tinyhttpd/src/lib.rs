//! # tinyhttpd — a small concurrent HTTP/1.1 static-file server
//!
//! A single reactor thread owns an edge-triggered epoll instance and the
//! listening socket. Accepted sockets are registered one-shot: each delivered
//! event disarms the descriptor, so at any moment a connection is owned
//! either by the reactor (armed) or by exactly one worker (disarmed). That
//! registration protocol, not a per-connection lock, is the mutual exclusion
//! between threads.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │  Reactor thread                                         │
//! │  epoll_wait → accept / recv-drain / writev-drain        │
//! └───────┬────────────────────────────────────▲───────────┘
//!         │ push(fd)  after a successful drain │ re-arm (EPOLLONESHOT)
//!         ▼                                    │
//! ┌──────────────────┐   pop()   ┌─────────────┴───────────┐
//! │  WorkQueue       │ ────────► │  Worker threads          │
//! │  (bounded FIFO)  │           │  parse → resolve → build │
//! └──────────────────┘           └─────────────────────────┘
//! ```
//!
//! Data flows reactor → read buffer → worker (parse, stat, mmap, assemble)
//! → reactor (writev of header prefix + file mapping). Workers never touch
//! the socket; their input is already buffered when they are scheduled.
//!
//! ## Design Decisions
//!
//! - **One-shot as ownership**: `EPOLLET | EPOLLONESHOT` on every accepted
//!   socket; every hand-off ends in exactly one re-arm.
//! - **Slot table indexed by fd**: the kernel hands out the lowest free
//!   descriptor, so a preallocated array gives O(1) lookup and bounded
//!   memory.
//! - **Zero-copy parsing**: request tokens are `(offset, len)` spans into
//!   the connection's read buffer; file bodies go out straight from a
//!   private read-only mapping via `writev`.

pub mod conn;
pub mod filemap;
pub mod parser;
pub mod poller;
pub mod reactor;
pub mod response;
pub mod sock;

pub use conn::Conn;
pub use parser::HttpCode;
pub use reactor::{Server, ServerConfig};

/// Size of the per-connection read buffer
pub const READ_BUF_SIZE: usize = 2048;

/// Size of the per-connection response-header buffer
pub const WRITE_BUF_SIZE: usize = 1024;

/// Size of the resolved-path buffer (doc root + url, truncating)
pub const PATH_BUF_SIZE: usize = 200;

/// Maximum simultaneous connections; also the slot-table size
pub const MAX_CONNS: usize = 65536;

/// Maximum events handled per epoll wakeup
pub const MAX_EVENTS: usize = 10000;

/// Listen backlog
pub const LISTEN_BACKLOG: i32 = 5;

/// Default worker-thread count
pub const DEFAULT_WORKERS: usize = 8;

/// Maximum depth of the reactor → worker queue
pub const MAX_QUEUED_REQUESTS: usize = 10000;

/// The document root every request path is resolved against
pub const DOC_ROOT: &str = "/home/tinywebsever/resources";
