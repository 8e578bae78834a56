use std::{fmt, net::SocketAddr};

use bytes::BytesMut;
use mio::Token;

use crate::error::Result;

/// Generation-checked reference to a connection-table slot.
///
/// The slot index is the connection's descriptor value. The generation is
/// bumped every time the slot is released, so an id captured by a timer or
/// a worker before the connection closed can never act on the connection
/// that later reuses the same descriptor.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    slot: u32,
    generation: u32,
}

impl ConnectionId {
    pub fn new(slot: usize, generation: u32) -> Self {
        Self {
            slot: slot as u32,
            generation,
        }
    }

    #[inline]
    pub fn slot(&self) -> usize {
        self.slot as usize
    }

    #[inline]
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Multiplexer token: generation in the high half, slot in the low half.
    #[inline]
    pub fn token(&self) -> Token {
        Token(((self.generation as usize) << 32) | self.slot as usize)
    }

    #[inline]
    pub fn from_token(token: Token) -> Self {
        Self {
            slot: (token.0 & 0xFFFF_FFFF) as u32,
            generation: (token.0 >> 32) as u32,
        }
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.slot, self.generation)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Outcome of processing buffered input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Input is incomplete; wait for more bytes.
    NeedMore,
    /// Output is ready to flush. With `keep_alive` the connection returns
    /// to reading once the output is written, otherwise it is closed.
    Respond { keep_alive: bool },
    /// Close the connection without writing anything further.
    Close,
}

/// Application protocol running on top of the server core.
///
/// One `Session` exists per accepted connection. [`on_data`](Self::on_data)
/// runs on a worker thread and is never invoked concurrently for the same
/// connection; the core only re-enables readiness for a connection after the
/// previous call has returned.
///
/// ## Example
///
/// ```rust
/// use bytes::BytesMut;
/// use mill_serve::error::Result;
/// use mill_serve::net::{ConnectionHandler, ConnectionId, Verdict};
/// use std::net::SocketAddr;
///
/// struct Echo;
///
/// impl ConnectionHandler for Echo {
///     type Session = ();
///
///     fn on_connect(&self, _conn_id: ConnectionId, _peer: SocketAddr) -> Self::Session {}
///
///     fn on_data(&self, _session: &mut (), input: &mut BytesMut, output: &mut BytesMut) -> Result<Verdict> {
///         output.extend_from_slice(&input.split());
///         Ok(Verdict::Respond { keep_alive: true })
///     }
/// }
/// ```
pub trait ConnectionHandler: Send + Sync + 'static {
    type Session: Send + 'static;

    /// Called on the main thread when a connection is accepted.
    fn on_connect(&self, conn_id: ConnectionId, peer: SocketAddr) -> Self::Session;

    /// Consume what it can from `input` and append any response to `output`.
    ///
    /// Returning `Err` closes the connection.
    fn on_data(
        &self,
        session: &mut Self::Session,
        input: &mut BytesMut,
        output: &mut BytesMut,
    ) -> Result<Verdict>;

    /// Called on the main thread once the connection has left the table.
    fn on_disconnect(&self, conn_id: ConnectionId) {
        let _ = conn_id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_round_trip_keeps_generation() {
        let id = ConnectionId::new(4093, 17);
        let back = ConnectionId::from_token(id.token());
        assert_eq!(back, id);
        assert_eq!(back.slot(), 4093);
        assert_eq!(back.generation(), 17);
    }

    #[test]
    fn test_same_slot_different_generation_differs() {
        let old = ConnectionId::new(12, 0);
        let new = ConnectionId::new(12, 1);
        assert_ne!(old, new);
        assert_ne!(old.token(), new.token());
    }
}
