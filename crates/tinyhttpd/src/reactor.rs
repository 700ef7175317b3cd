//! The reactor: listener, event loop, and server context
//!
//! A single thread owns the epoll instance and the listening socket. It is
//! the only thread that accepts, the only thread that reads, and the only
//! thread that writes; workers get connections whose bytes are already
//! buffered and hand them back through a one-shot re-arm.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};

use tinyhttpd_core::{SetupError, SetupResult, Work, WorkQueue, WorkerPool};

use crate::conn::ConnTable;
use crate::poller::{Events, Poller};
use crate::sock;
use crate::{DEFAULT_WORKERS, DOC_ROOT, LISTEN_BACKLOG, MAX_CONNS, MAX_QUEUED_REQUESTS};

/// Server parameters
///
/// Only the port comes from outside; everything else defaults to the
/// compiled-in sizing and exists so tests can run scaled-down instances
/// against scratch directories.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to listen on; 0 lets the kernel pick
    pub port: u16,
    /// Worker-thread count
    pub workers: usize,
    /// Maximum reactor → worker queue depth
    pub queue_depth: usize,
    /// Connection slots (and thereby the accept limit)
    pub max_conns: usize,
    /// Listen backlog
    pub backlog: i32,
    /// Directory request paths resolve against
    pub doc_root: String,
}

impl ServerConfig {
    /// Defaults with the given listen port
    pub fn new(port: u16) -> Self {
        Self {
            port,
            workers: DEFAULT_WORKERS,
            queue_depth: MAX_QUEUED_REQUESTS,
            max_conns: MAX_CONNS,
            backlog: LISTEN_BACKLOG,
            doc_root: DOC_ROOT.to_string(),
        }
    }

    /// Set the worker-thread count
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the work-queue depth
    pub fn queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth;
        self
    }

    /// Set the connection-slot count
    pub fn max_conns(mut self, max_conns: usize) -> Self {
        self.max_conns = max_conns;
        self
    }

    /// Point resolution at a different document root
    pub fn doc_root(mut self, doc_root: impl Into<String>) -> Self {
        self.doc_root = doc_root.into();
        self
    }
}

/// State shared by the reactor and every worker
///
/// Everything process-wide lives here and is passed explicitly, so several
/// servers can coexist in one process (the tests do exactly that).
pub struct ServerCtx {
    pub(crate) poller: Poller,
    pub(crate) conns: ConnTable,
    pub(crate) user_count: AtomicUsize,
    pub(crate) doc_root: String,
}

impl ServerCtx {
    /// Number of live connections
    pub fn user_count(&self) -> usize {
        self.user_count.load(Ordering::Relaxed)
    }
}

/// A queued unit of work: one connection, by descriptor
///
/// Pushed by the reactor after a successful read drain. The slot is safe to
/// touch because the descriptor's registration fired (and disarmed) to get
/// here, and nothing re-arms it until `process` does.
pub(crate) struct ConnHandle {
    fd: RawFd,
    ctx: Arc<ServerCtx>,
}

impl Work for ConnHandle {
    fn process(&self) {
        // Safety: one-shot ownership travels with the handle; see ConnTable.
        let conn = unsafe { self.ctx.conns.slot(self.fd) };
        conn.process(&self.ctx);
    }
}

/// The assembled server: listener + poller + queue + workers
pub struct Server {
    listen_fd: RawFd,
    port: u16,
    ctx: Arc<ServerCtx>,
    queue: Arc<WorkQueue<ConnHandle>>,
    _pool: WorkerPool<ConnHandle>,
}

impl Server {
    /// Bind the listener and spawn the worker pool
    pub fn bind(config: ServerConfig) -> SetupResult<Self> {
        if config.max_conns == 0 {
            return Err(SetupError::BadConfig("connection slots must be nonzero"));
        }

        let poller = Poller::new().map_err(SetupError::Poller)?;
        let listen_fd =
            sock::bind_listener(config.port, config.backlog).map_err(SetupError::Listener)?;
        let port = sock::local_port(listen_fd).map_err(SetupError::Listener)?;

        // Level-triggered: a backlog that is not fully drained re-notifies.
        poller.add(listen_fd, false).map_err(SetupError::Poller)?;

        let ctx = Arc::new(ServerCtx {
            poller,
            conns: ConnTable::new(config.max_conns),
            user_count: AtomicUsize::new(0),
            doc_root: config.doc_root,
        });

        let queue = Arc::new(WorkQueue::new(config.queue_depth));
        let pool = WorkerPool::start(Arc::clone(&queue), config.workers)?;

        info!(
            "listening on port {} ({} workers, {} slots)",
            port,
            pool.workers(),
            config.max_conns
        );

        Ok(Self {
            listen_fd,
            port,
            ctx,
            queue,
            _pool: pool,
        })
    }

    /// The port the listener is bound to
    pub fn local_port(&self) -> u16 {
        self.port
    }

    /// Run the event loop; never returns except on a fatal epoll error
    pub fn run(&self) -> io::Result<()> {
        let mut events = Events::new();
        loop {
            let n = match self.ctx.poller.wait(&mut events) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };

            for event in events.iter(n) {
                let fd = event.fd();
                if fd == self.listen_fd {
                    self.accept_pending();
                    continue;
                }

                // Safety: this event disarmed fd's one-shot registration,
                // so the reactor owns the slot until enqueue or re-arm.
                let conn = unsafe { self.ctx.conns.slot(fd) };

                if event.is_error_or_hup() {
                    conn.close(&self.ctx);
                } else if event.readable() {
                    if conn.read_drain() {
                        let handle = ConnHandle {
                            fd,
                            ctx: Arc::clone(&self.ctx),
                        };
                        if !self.queue.push(handle) {
                            conn.close(&self.ctx);
                        }
                    } else {
                        conn.close(&self.ctx);
                    }
                } else if event.writable() {
                    if !conn.write_drain(&self.ctx) {
                        conn.close(&self.ctx);
                    }
                }
            }
        }
    }

    /// Accept until the kernel's pending queue is empty
    fn accept_pending(&self) {
        loop {
            let (fd, peer) = match sock::accept(self.listen_fd) {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    warn!("accept: {}", e);
                    return;
                }
            };

            let at_capacity = self.ctx.user_count() >= self.ctx.conns.len()
                || fd as usize >= self.ctx.conns.len();
            if at_capacity {
                debug!("at connection capacity, dropping fd {}", fd);
                sock::close(fd);
                continue;
            }

            // Safety: fd was just accepted; its slot is free and unarmed,
            // so no other thread can reference it.
            let conn = unsafe { self.ctx.conns.slot(fd) };
            if let Err(e) = conn.open(fd, peer, &self.ctx) {
                warn!("failed to register fd {}: {}", fd, e);
                sock::close(fd);
                conn.fd = -1;
            }
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        sock::close(self.listen_fd);
    }
}
