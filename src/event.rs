use mio::{event::Event, Token};
use std::fmt;

/// One entry of a multiplexer wait result: which registration fired and
/// with what readiness.
///
/// Copied out of [`mio::Events`] so the main loop can mutate its own state
/// while walking the batch.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    token: Token,
    readable: bool,
    writable: bool,
    hangup: bool,
    error: bool,
}

impl fmt::Debug for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Readiness")
            .field("token", &self.token)
            .field("readable", &self.readable)
            .field("writable", &self.writable)
            .field("hangup", &self.hangup)
            .field("error", &self.error)
            .finish()
    }
}

impl Readiness {
    pub fn token(&self) -> Token {
        self.token
    }

    pub fn is_readable(&self) -> bool {
        self.readable
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Peer closed its end (`EPOLLRDHUP`/`EPOLLHUP`).
    pub fn is_hangup(&self) -> bool {
        self.hangup
    }

    pub fn is_error(&self) -> bool {
        self.error
    }
}

impl From<&Event> for Readiness {
    fn from(event: &Event) -> Self {
        Self {
            token: event.token(),
            readable: event.is_readable(),
            writable: event.is_writable(),
            hangup: event.is_read_closed() || event.is_write_closed(),
            error: event.is_error(),
        }
    }
}
