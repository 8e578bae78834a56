//! Readiness multiplexer.
//!
//! Waiting, event decoding and wakers come from [`mio::Poll`]. Interest
//! registration goes straight to `epoll_ctl(2)` on the poll's descriptor so
//! that a registration can carry `EPOLLONESHOT`, which mio does not expose.
//! A oneshot descriptor reports one readiness transition and then stays
//! silent until [`Multiplexer::rearm`] is called; that is what keeps two
//! workers from ever servicing the same connection at once.

use std::{
    io,
    os::fd::{AsRawFd, RawFd},
    time::Duration,
};

use mio::{Events, Interest, Poll, Token, Waker};

use crate::{
    error::{Error, Result},
    event::Readiness,
};

pub const DEFAULT_EVENTS_CAPACITY: usize = 1000;

/// Delivery mode of a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mode {
    pub edge_triggered: bool,
    pub oneshot: bool,
}

impl Mode {
    pub const LEVEL: Mode = Mode {
        edge_triggered: false,
        oneshot: false,
    };
    pub const EDGE: Mode = Mode {
        edge_triggered: true,
        oneshot: false,
    };
    /// Edge-triggered and disabled after each notification.
    pub const ONESHOT: Mode = Mode {
        edge_triggered: true,
        oneshot: true,
    };

    fn flags(self, interest: Interest) -> u32 {
        let mut flags = 0;
        if interest.is_readable() {
            flags |= libc::EPOLLIN | libc::EPOLLRDHUP;
        }
        if interest.is_writable() {
            flags |= libc::EPOLLOUT;
        }
        if self.edge_triggered {
            flags |= libc::EPOLLET;
        }
        if self.oneshot {
            flags |= libc::EPOLLONESHOT;
        }
        flags as u32
    }
}

pub struct Multiplexer {
    poller: Poll,
    events: Events,
}

impl Multiplexer {
    pub fn new(events_capacity: usize) -> Result<Self> {
        if events_capacity == 0 {
            return Err(Error::Config("events capacity must be non-zero".into()));
        }
        Ok(Self {
            poller: Poll::new()?,
            events: Events::with_capacity(events_capacity),
        })
    }

    pub fn register(&self, fd: RawFd, token: Token, interest: Interest, mode: Mode) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, mode.flags(interest), token)
    }

    /// Re-enable a oneshot registration, possibly with a different interest.
    ///
    /// If the descriptor is already ready the kernel reports it again on the
    /// next wait, so no readiness transition is lost while it was disarmed.
    pub fn rearm(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, Mode::ONESHOT.flags(interest), token)
    }

    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        // SAFETY: the event argument is ignored for EPOLL_CTL_DEL on every
        // kernel since 2.6.9.
        let res = unsafe {
            libc::epoll_ctl(
                self.poller.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            )
        };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Create a waker bound to this multiplexer, reporting under `token`.
    pub fn waker(&self, token: Token) -> io::Result<Waker> {
        Waker::new(self.poller.registry(), token)
    }

    /// Block until at least one registration is ready or `timeout` elapses,
    /// copying the batch into `ready`.
    ///
    /// A wait interrupted by a signal is retried. Any other failure is fatal
    /// for the caller and surfaces as [`Error::Multiplexer`].
    pub fn wait(&mut self, ready: &mut Vec<Readiness>, timeout: Option<Duration>) -> Result<usize> {
        ready.clear();
        loop {
            match self.poller.poll(&mut self.events, timeout) {
                Ok(()) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Multiplexer(e)),
            }
        }
        ready.extend(self.events.iter().map(Readiness::from));
        Ok(ready.len())
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, flags: u32, token: Token) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: flags,
            u64: token.0 as u64,
        };
        // SAFETY: `event` outlives the call and the poll descriptor is owned
        // by `self`.
        let res = unsafe { libc::epoll_ctl(self.poller.as_raw_fd(), op, fd, &mut event) };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl AsRawFd for Multiplexer {
    fn as_raw_fd(&self) -> RawFd {
        self.poller.as_raw_fd()
    }
}
