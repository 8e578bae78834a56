//! Per-connection record shared between the main loop and one worker.
//!
//! ```text
//!   main thread                       worker thread
//!   ───────────                       ─────────────
//!   readable ─▶ fill() ──────────────▶ process() ─▶ Completion
//!                                                       │
//!   writable ─▶ flush() ◀──── re-armed for WRITABLE ◀──┘
//! ```
//!
//! The oneshot registration decides who may touch the buffers: the main
//! thread reads and writes only while the slot is Idle, a worker processes
//! only while it is Busy. The mutex around [`Exchange`] is never contended
//! in practice; it makes the handoff sound rather than serializing work.
//!
//! The socket stays open until the last `Arc<Connection>` drops, so a
//! worker still holding a closed connection cannot end up reading a
//! descriptor number that has already been reused by a new accept.

use std::{
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr},
    os::fd::{AsRawFd, RawFd},
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
};

use bytes::BytesMut;
use mio::{net::TcpStream, Interest};

use crate::{
    error::Result,
    net::{
        completion::Outcome,
        traits::{ConnectionHandler, ConnectionId, Verdict},
    },
    object_pool::PooledObject,
    sync::lock,
};

/// Result of draining the socket into the input buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fill {
    /// Bytes appended by this call; zero means a spurious wakeup.
    Data(usize),
    /// Peer closed its write side.
    Eof,
}

/// Result of writing buffered output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flush {
    /// The socket buffer filled up before all output was written.
    Pending,
    Done {
        keep_alive: bool,
        /// Unprocessed input is already buffered (pipelined request).
        pending_input: bool,
    },
}

struct Exchange<S> {
    session: S,
    input: PooledObject<BytesMut>,
    output: PooledObject<BytesMut>,
    written: usize,
    keep_alive: bool,
}

pub struct Connection<S> {
    id: ConnectionId,
    peer: SocketAddr,
    stream: TcpStream,
    exchange: Mutex<Exchange<S>>,
    closed: AtomicBool,
}

impl<S> Connection<S> {
    pub fn new(
        id: ConnectionId,
        peer: SocketAddr,
        stream: TcpStream,
        session: S,
        input: PooledObject<BytesMut>,
        output: PooledObject<BytesMut>,
    ) -> Self {
        Self {
            id,
            peer,
            stream,
            exchange: Mutex::new(Exchange {
                session,
                input,
                output,
                written: 0,
                keep_alive: true,
            }),
            closed: AtomicBool::new(false),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Read everything the socket has, as edge-triggered delivery requires,
    /// `scratch.len()` bytes at a time.
    ///
    /// Fails with `InvalidData` once more than `limit` unprocessed bytes
    /// are buffered.
    pub fn fill(&self, scratch: &mut [u8], limit: usize) -> io::Result<Fill> {
        let mut exchange = lock(&self.exchange);
        let mut total = 0;

        loop {
            match (&self.stream).read(scratch) {
                Ok(0) => return Ok(Fill::Eof),
                Ok(n) => {
                    if exchange.input.len() + n > limit {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("request exceeds {limit} bytes"),
                        ));
                    }
                    exchange.input.extend_from_slice(&scratch[..n]);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Fill::Data(total)),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Run the protocol handler over the buffered input. Worker side.
    pub fn process<H>(&self, handler: &H) -> Result<Outcome>
    where
        H: ConnectionHandler<Session = S>,
    {
        let mut guard = lock(&self.exchange);
        let exchange = &mut *guard;

        let verdict = handler.on_data(
            &mut exchange.session,
            &mut exchange.input,
            &mut exchange.output,
        )?;

        Ok(match verdict {
            Verdict::NeedMore => Outcome::Rearm(Interest::READABLE),
            Verdict::Respond { keep_alive } => {
                exchange.keep_alive = keep_alive;
                if !exchange.output.is_empty() {
                    Outcome::Rearm(Interest::WRITABLE)
                } else if keep_alive {
                    Outcome::Rearm(Interest::READABLE)
                } else {
                    Outcome::Close
                }
            }
            Verdict::Close => Outcome::Close,
        })
    }

    /// Write as much buffered output as the socket accepts. Main-thread side.
    pub fn flush(&self) -> io::Result<Flush> {
        let mut guard = lock(&self.exchange);
        let exchange = &mut *guard;

        while exchange.written < exchange.output.len() {
            match (&self.stream).write(&exchange.output[exchange.written..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => exchange.written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Flush::Pending),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        exchange.output.clear();
        exchange.written = 0;
        Ok(Flush::Done {
            keep_alive: exchange.keep_alive,
            pending_input: !exchange.input.is_empty(),
        })
    }

    /// Shut the socket down in both directions. Idempotent.
    ///
    /// The descriptor itself is released when the last reference drops.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            if let Err(e) = self.stream.shutdown(Shutdown::Both) {
                if e.kind() != io::ErrorKind::NotConnected {
                    tracing::debug!(conn = %self.id, error = %e, "socket shutdown failed");
                }
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl<S> AsRawFd for Connection<S> {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}
