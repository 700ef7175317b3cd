//! Per-connection state and socket I/O
//!
//! One `Conn` per accepted socket, living in a slot table indexed by the
//! descriptor. The reactor drains the kernel's receive buffer into
//! `read_buf` before a worker ever sees the connection, and drains the
//! assembled response out of `write_buf` + file mapping afterwards; the
//! worker's `process` step is pure in-memory parsing plus filesystem
//! metadata work.
//!
//! There is no lock on a `Conn`. The `EPOLLONESHOT` registration protocol
//! guarantees at most one thread holds a connection between disarm and
//! re-arm; see [`ConnTable::slot`] for the access contract.

use std::cell::UnsafeCell;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::unix::io::RawFd;
use std::sync::atomic::Ordering;

use log::{debug, trace};

use crate::filemap::Resolved;
use crate::parser::{CheckState, HttpCode, Method, Span};
use crate::poller::Interest;
use crate::reactor::ServerCtx;
use crate::{PATH_BUF_SIZE, READ_BUF_SIZE, WRITE_BUF_SIZE};

/// State for one client connection
pub struct Conn {
    /// The socket, or -1 while the slot is free
    pub(crate) fd: RawFd,
    /// Peer endpoint, for diagnostics only
    pub(crate) peer: SocketAddrV4,

    // ── inbound ──
    pub(crate) read_buf: [u8; READ_BUF_SIZE],
    /// Bytes of `read_buf` holding received data
    pub(crate) read_idx: usize,
    /// Next byte the line scanner will inspect
    pub(crate) checked_idx: usize,
    /// Offset where the line being classified begins
    pub(crate) start_line: usize,

    // ── parser ──
    pub(crate) check_state: CheckState,
    pub(crate) method: Method,
    pub(crate) url: Span,
    pub(crate) version: Span,
    pub(crate) host: Span,
    pub(crate) content_length: usize,
    pub(crate) keep_alive: bool,

    // ── outbound ──
    pub(crate) path_buf: [u8; PATH_BUF_SIZE],
    pub(crate) resolved: Option<Resolved>,
    pub(crate) write_buf: [u8; WRITE_BUF_SIZE],
    /// Bytes of `write_buf` holding the response head
    pub(crate) write_idx: usize,
    /// Response bytes already handed to the kernel
    pub(crate) bytes_sent: usize,
}

impl Conn {
    /// A free slot
    pub fn new() -> Self {
        Self {
            fd: -1,
            peer: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
            read_buf: [0; READ_BUF_SIZE],
            read_idx: 0,
            checked_idx: 0,
            start_line: 0,
            check_state: CheckState::RequestLine,
            method: Method::Get,
            url: Span::default(),
            version: Span::default(),
            host: Span::default(),
            content_length: 0,
            keep_alive: false,
            path_buf: [0; PATH_BUF_SIZE],
            resolved: None,
            write_buf: [0; WRITE_BUF_SIZE],
            write_idx: 0,
            bytes_sent: 0,
        }
    }

    /// The slot's descriptor, -1 when free
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Take ownership of a freshly accepted socket
    ///
    /// Registers it edge-triggered one-shot for readable interest and
    /// counts it against the connection limit.
    pub(crate) fn open(&mut self, fd: RawFd, peer: SocketAddrV4, ctx: &ServerCtx) -> io::Result<()> {
        self.fd = fd;
        self.peer = peer;
        crate::sock::set_reuseaddr(fd)?;
        ctx.poller.add(fd, true)?;
        ctx.user_count.fetch_add(1, Ordering::Relaxed);
        self.reset();
        debug!("open fd {} peer {}", fd, peer);
        Ok(())
    }

    /// Return the connection to its initial parsing state
    ///
    /// Drops any held file mapping, zeroes every index and buffer, and puts
    /// the parser back at the request line. Called on accept and after a
    /// completed keep-alive response.
    pub(crate) fn reset(&mut self) {
        self.resolved = None;
        self.read_idx = 0;
        self.checked_idx = 0;
        self.start_line = 0;
        self.check_state = CheckState::RequestLine;
        self.method = Method::Get;
        self.url = Span::default();
        self.version = Span::default();
        self.host = Span::default();
        self.content_length = 0;
        self.keep_alive = false;
        self.write_idx = 0;
        self.bytes_sent = 0;
        self.read_buf.fill(0);
        self.write_buf.fill(0);
        self.path_buf.fill(0);
    }

    /// Tear the connection down; safe to call twice
    pub(crate) fn close(&mut self, ctx: &ServerCtx) {
        if self.fd == -1 {
            return;
        }
        debug!("close fd {} peer {}", self.fd, self.peer);
        self.resolved = None;
        let _ = ctx.poller.remove(self.fd);
        crate::sock::close(self.fd);
        self.fd = -1;
        ctx.user_count.fetch_sub(1, Ordering::Relaxed);
    }

    /// Drain the kernel receive buffer into `read_buf`
    ///
    /// Reads greedily until the kernel reports would-block (edge-triggered
    /// registrations require it). Returns false on orderly close, a hard
    /// error, or when entered with no buffer space left to make progress.
    pub(crate) fn read_drain(&mut self) -> bool {
        if self.read_idx >= READ_BUF_SIZE {
            return false;
        }
        loop {
            match crate::sock::recv(self.fd, &mut self.read_buf[self.read_idx..]) {
                Ok(0) => return false,
                Ok(n) => {
                    self.read_idx += n;
                    if self.read_idx >= READ_BUF_SIZE {
                        // Full buffer; the parser decides whether what we
                        // have is a request. More bytes fail the precondition
                        // above on the next readable event.
                        return true;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
                Err(e) => {
                    trace!("recv fd {}: {}", self.fd, e);
                    return false;
                }
            }
        }
    }

    /// Push the assembled response out through `writev`
    ///
    /// Gathers the header prefix in `write_buf` and the file mapping (when
    /// present) into one vector per attempt, accounting partial writes by
    /// rebuilding the vector from the current offsets. Returns false when
    /// the caller should close the connection.
    pub(crate) fn write_drain(&mut self, ctx: &ServerCtx) -> bool {
        if self.write_idx == 0 {
            // Nothing queued; spurious writable event.
            let _ = ctx.poller.rearm(self.fd, Interest::Read);
            self.reset();
            return true;
        }

        loop {
            let head_len = self.write_idx;
            let file_len = self
                .resolved
                .as_ref()
                .and_then(|r| r.mapping.as_ref())
                .map(|m| m.len())
                .unwrap_or(0);
            let total = head_len + file_len;

            let mut iov: [libc::iovec; 2] = unsafe { std::mem::zeroed() };
            let count;
            if self.bytes_sent < head_len {
                iov[0].iov_base =
                    self.write_buf[self.bytes_sent..].as_ptr() as *mut libc::c_void;
                iov[0].iov_len = head_len - self.bytes_sent;
                if file_len > 0 {
                    let map = self.resolved.as_ref().unwrap().mapping.as_ref().unwrap();
                    iov[1].iov_base = map.as_ptr() as *mut libc::c_void;
                    iov[1].iov_len = file_len;
                    count = 2;
                } else {
                    count = 1;
                }
            } else {
                let off = self.bytes_sent - head_len;
                let map = self.resolved.as_ref().unwrap().mapping.as_ref().unwrap();
                iov[0].iov_base = unsafe { map.as_ptr().add(off) } as *mut libc::c_void;
                iov[0].iov_len = file_len - off;
                count = 1;
            }

            match crate::sock::writev(self.fd, &iov[..count]) {
                Ok(n) => {
                    self.bytes_sent += n;
                    if self.bytes_sent >= total {
                        self.resolved = None;
                        let _ = ctx.poller.rearm(self.fd, Interest::Read);
                        if self.keep_alive {
                            self.reset();
                            return true;
                        }
                        return false;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    // Send buffer full; finish on the next writable event.
                    let _ = ctx.poller.rearm(self.fd, Interest::Write);
                    return true;
                }
                Err(e) => {
                    trace!("writev fd {}: {}", self.fd, e);
                    self.resolved = None;
                    return false;
                }
            }
        }
    }

    /// One worker step: parse, resolve, assemble
    ///
    /// Entered only after the reactor drained the socket, so this never
    /// reads. An incomplete request re-arms for more bytes; anything else
    /// assembles a response and re-arms for writable so the reactor
    /// transmits it.
    pub(crate) fn process(&mut self, ctx: &ServerCtx) {
        let code = self.process_read(&ctx.doc_root);
        trace!("process fd {} -> {:?}", self.fd, code);

        if code == HttpCode::NoRequest {
            let _ = ctx.poller.rearm(self.fd, Interest::Read);
            return;
        }

        if !self.build_response(code) {
            self.close(ctx);
            return;
        }
        let _ = ctx.poller.rearm(self.fd, Interest::Write);
    }

    #[cfg(test)]
    pub(crate) fn feed(&mut self, bytes: &[u8]) {
        self.read_buf[self.read_idx..self.read_idx + bytes.len()].copy_from_slice(bytes);
        self.read_idx += bytes.len();
    }
}

impl Default for Conn {
    fn default() -> Self {
        Self::new()
    }
}

/// Preallocated connection slots, indexed by descriptor
///
/// The kernel hands out the lowest free descriptor, so slots stay dense and
/// lookup is a plain index. Slots are handed to threads as `&mut Conn`
/// through [`slot`](Self::slot); the one-shot registration protocol is what
/// makes that sound.
pub(crate) struct ConnTable {
    slots: Box<[UnsafeCell<Conn>]>,
}

// Safety: a slot is touched only by the thread that currently owns its
// connection. Ownership moves with the one-shot event: the reactor owns a
// slot from disarm (event delivery) until it enqueues or re-arms, a worker
// from dequeue until its re-arm, and nobody in between. Two threads never
// hold the same slot because the kernel delivers at most one event per arm.
unsafe impl Send for ConnTable {}
unsafe impl Sync for ConnTable {}

impl ConnTable {
    pub(crate) fn new(size: usize) -> Self {
        let slots = (0..size)
            .map(|_| UnsafeCell::new(Conn::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { slots }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    /// Exclusive access to the slot for `fd`
    ///
    /// # Safety
    ///
    /// The caller must be the current owner of `fd` under the one-shot
    /// protocol: it received the (disarming) event for this descriptor, or
    /// dequeued the connection a reactor drain enqueued, and has not yet
    /// re-armed it. `fd` must be within the table.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn slot(&self, fd: RawFd) -> &mut Conn {
        &mut *self.slots[fd as usize].get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::HttpCode;
    use crate::poller::Poller;
    use crate::reactor::ServerCtx;
    use std::fs;
    use std::sync::atomic::AtomicUsize;

    fn test_ctx() -> ServerCtx {
        ServerCtx {
            poller: Poller::new().unwrap(),
            conns: ConnTable::new(1024),
            user_count: AtomicUsize::new(0),
            doc_root: String::new(),
        }
    }

    fn socketpair() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let ret = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        };
        assert_eq!(ret, 0);
        (fds[0], fds[1])
    }

    fn read_all(fd: RawFd) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = unsafe {
                libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), libc::MSG_DONTWAIT)
            };
            if n <= 0 {
                break;
            }
            out.extend_from_slice(&buf[..n as usize]);
        }
        out
    }

    #[test]
    fn test_open_close_tracks_user_count() {
        let ctx = test_ctx();
        let (a, b) = socketpair();
        let peer = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0);

        let conn = unsafe { ctx.conns.slot(a) };
        conn.open(a, peer, &ctx).unwrap();
        assert_eq!(ctx.user_count(), 1);
        assert_eq!(conn.fd(), a);

        conn.close(&ctx);
        assert_eq!(ctx.user_count(), 0);
        assert_eq!(conn.fd(), -1);

        // Idempotent: a second close is a no-op.
        conn.close(&ctx);
        assert_eq!(ctx.user_count(), 0);

        crate::sock::close(b);
    }

    #[test]
    fn test_read_drain_buffers_bytes() {
        let ctx = test_ctx();
        let (a, b) = socketpair();
        let conn = unsafe { ctx.conns.slot(a) };
        conn.open(a, SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0), &ctx)
            .unwrap();

        unsafe { libc::write(b, b"GET / ".as_ptr() as *const _, 6) };
        assert!(conn.read_drain());
        assert_eq!(&conn.read_buf[..conn.read_idx], b"GET / ");

        // A second drain appends after the first.
        unsafe { libc::write(b, b"HTTP/1.1".as_ptr() as *const _, 8) };
        assert!(conn.read_drain());
        assert_eq!(&conn.read_buf[..conn.read_idx], b"GET / HTTP/1.1");

        conn.close(&ctx);
        crate::sock::close(b);
    }

    #[test]
    fn test_read_drain_fails_on_peer_close() {
        let ctx = test_ctx();
        let (a, b) = socketpair();
        let conn = unsafe { ctx.conns.slot(a) };
        conn.open(a, SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0), &ctx)
            .unwrap();

        crate::sock::close(b);
        assert!(!conn.read_drain());
        conn.close(&ctx);
    }

    #[test]
    fn test_write_drain_sends_error_response() {
        let ctx = test_ctx();
        let (a, b) = socketpair();
        let conn = unsafe { ctx.conns.slot(a) };
        conn.open(a, SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0), &ctx)
            .unwrap();

        assert!(conn.build_response(HttpCode::NoResource));
        let expected = conn.head().to_vec();

        // Connection: close response; the caller is told to close.
        assert!(!conn.write_drain(&ctx));
        assert_eq!(read_all(b), expected);

        conn.close(&ctx);
        crate::sock::close(b);
    }

    #[test]
    fn test_write_drain_gathers_header_and_mapping() {
        use std::os::unix::fs::PermissionsExt;
        let dir = std::env::temp_dir().join(format!("tinyhttpd-conn-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o755)).unwrap();
        fs::write(dir.join("body.html"), b"hello world").unwrap();
        fs::set_permissions(dir.join("body.html"), fs::Permissions::from_mode(0o644)).unwrap();

        let mut ctx = test_ctx();
        ctx.doc_root = dir.to_str().unwrap().to_string();
        let (a, b) = socketpair();
        let conn = unsafe { ctx.conns.slot(a) };
        conn.open(a, SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0), &ctx)
            .unwrap();

        conn.feed(b"GET /body.html HTTP/1.1\r\nConnection: keep-alive\r\n\r\n");
        let code = conn.process_read(&ctx.doc_root.clone());
        assert_eq!(code, HttpCode::FileRequest);
        assert!(conn.build_response(code));
        let head = conn.head().to_vec();

        // Keep-alive: write completes, mapping released, connection resets.
        assert!(conn.write_drain(&ctx));
        assert!(conn.resolved.is_none());
        assert_eq!(conn.read_idx, 0);
        assert_eq!(conn.check_state, CheckState::RequestLine);

        let mut expected = head;
        expected.extend_from_slice(b"hello world");
        assert_eq!(read_all(b), expected);

        conn.close(&ctx);
        crate::sock::close(b);
    }

    #[test]
    fn test_write_drain_with_nothing_queued_resets() {
        let ctx = test_ctx();
        let (a, b) = socketpair();
        let conn = unsafe { ctx.conns.slot(a) };
        conn.open(a, SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0), &ctx)
            .unwrap();

        conn.feed(b"stale");
        assert!(conn.write_drain(&ctx));
        assert_eq!(conn.read_idx, 0);

        conn.close(&ctx);
        crate::sock::close(b);
    }
}
