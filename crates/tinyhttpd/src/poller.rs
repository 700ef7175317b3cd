//! The epoll readiness facility
//!
//! One `Poller` instance is shared by the reactor and every worker. The
//! reactor is the only caller of [`wait`](Poller::wait); workers only issue
//! [`rearm`](Poller::rearm), which the kernel serializes internally.
//!
//! Accepted sockets are registered `EPOLLET | EPOLLONESHOT`: a delivered
//! event disarms the descriptor until someone re-arms it. That disarm/re-arm
//! cycle is the ownership hand-off between reactor and workers; a socket
//! that is not armed belongs to whichever thread last received it.

use std::io;
use std::os::unix::io::RawFd;

use crate::MAX_EVENTS;

/// Which readiness a re-armed socket waits for next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    /// Wake when bytes can be read
    Read,
    /// Wake when the send buffer has room
    Write,
}

impl Interest {
    fn bits(self) -> u32 {
        match self {
            Interest::Read => libc::EPOLLIN as u32,
            Interest::Write => libc::EPOLLOUT as u32,
        }
    }
}

/// One delivered readiness event
#[derive(Clone, Copy)]
pub struct Event(libc::epoll_event);

impl Event {
    /// The descriptor this event is for
    pub fn fd(&self) -> RawFd {
        self.0.u64 as RawFd
    }

    /// Remote hang-up, local hang-up, or error
    pub fn is_error_or_hup(&self) -> bool {
        let bad = (libc::EPOLLRDHUP | libc::EPOLLHUP | libc::EPOLLERR) as u32;
        self.0.events & bad != 0
    }

    /// Bytes are readable
    pub fn readable(&self) -> bool {
        self.0.events & libc::EPOLLIN as u32 != 0
    }

    /// The send buffer has room
    pub fn writable(&self) -> bool {
        self.0.events & libc::EPOLLOUT as u32 != 0
    }
}

/// Reusable event buffer for [`Poller::wait`]
pub struct Events {
    raw: Vec<libc::epoll_event>,
}

impl Events {
    /// A buffer sized for the maximum events one wakeup may deliver
    pub fn new() -> Self {
        Self {
            raw: vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS],
        }
    }

    /// Iterate the events delivered by the last wait
    pub fn iter(&self, count: usize) -> impl Iterator<Item = Event> + '_ {
        self.raw[..count].iter().map(|raw| Event(*raw))
    }
}

impl Default for Events {
    fn default() -> Self {
        Self::new()
    }
}

/// An owned epoll instance
pub struct Poller {
    epfd: RawFd,
}

impl Poller {
    /// Create the epoll instance
    pub fn new() -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { epfd })
    }

    /// Register a descriptor for readable interest
    ///
    /// `oneshot` selects the edge-triggered one-shot mode used for accepted
    /// sockets; the listener passes false and stays level-triggered so a
    /// pending backlog keeps re-notifying. The descriptor is also switched
    /// to non-blocking here, matching its registration.
    pub fn add(&self, fd: RawFd, oneshot: bool) -> io::Result<()> {
        let mut events = (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
        if oneshot {
            events |= (libc::EPOLLET | libc::EPOLLONESHOT) as u32;
        }
        self.ctl(libc::EPOLL_CTL_ADD, fd, events)?;
        crate::sock::set_nonblocking(fd)
    }

    /// Re-arm a one-shot descriptor with the given interest
    ///
    /// Every delivered event on an accepted socket must be answered by
    /// exactly one call here before the next event can arrive; skipping it
    /// stalls the connection silently.
    pub fn rearm(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let events = interest.bits()
            | (libc::EPOLLET | libc::EPOLLONESHOT | libc::EPOLLRDHUP) as u32;
        self.ctl(libc::EPOLL_CTL_MOD, fd, events)
    }

    /// Deregister a descriptor
    pub fn remove(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, 0)
    }

    /// Block until events arrive; returns how many were delivered
    pub fn wait(&self, events: &mut Events) -> io::Result<usize> {
        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                events.raw.as_mut_ptr(),
                events.raw.len() as libc::c_int,
                -1,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe { libc::close(self.epfd) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sock;

    fn socketpair() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let ret = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        };
        assert_eq!(ret, 0);
        (fds[0], fds[1])
    }

    fn wait_one(poller: &Poller, events: &mut Events) -> Event {
        let n = poller.wait(events).unwrap();
        assert_eq!(n, 1);
        events.iter(n).next().unwrap()
    }

    #[test]
    fn test_oneshot_delivers_once_until_rearm() {
        let poller = Poller::new().unwrap();
        let (a, b) = socketpair();
        poller.add(a, true).unwrap();

        unsafe { libc::write(b, b"x".as_ptr() as *const _, 1) };
        let ev = wait_one(&poller, &mut Events::new());
        assert_eq!(ev.fd(), a);
        assert!(ev.readable());

        // The registration is now disarmed: more bytes do not notify.
        unsafe { libc::write(b, b"y".as_ptr() as *const _, 1) };
        let mut events = Events::new();
        let n = unsafe {
            libc::epoll_wait(poller.epfd, events.raw.as_mut_ptr(), events.raw.len() as _, 50)
        };
        assert_eq!(n, 0);

        // Re-arming with unread bytes pending re-notifies immediately.
        poller.rearm(a, Interest::Read).unwrap();
        let ev = wait_one(&poller, &mut events);
        assert!(ev.readable());

        sock::close(a);
        sock::close(b);
    }

    #[test]
    fn test_hangup_flag_on_peer_close() {
        let poller = Poller::new().unwrap();
        let (a, b) = socketpair();
        poller.add(a, true).unwrap();

        sock::close(b);
        let ev = wait_one(&poller, &mut Events::new());
        assert!(ev.is_error_or_hup());

        sock::close(a);
    }

    #[test]
    fn test_rearm_for_write_readiness() {
        let poller = Poller::new().unwrap();
        let (a, b) = socketpair();
        poller.add(a, true).unwrap();

        // An idle socket with an empty send buffer is immediately writable.
        poller.rearm(a, Interest::Write).unwrap();
        let ev = wait_one(&poller, &mut Events::new());
        assert!(ev.writable());

        sock::close(a);
        sock::close(b);
    }
}
