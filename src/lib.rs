//! # mill-serve
//! An event-driven TCP connection server core for Linux: one main thread
//! multiplexes readiness for every connection, a fixed pool of workers runs
//! the application protocol, and idle connections are evicted on a timer.
//!
//! The core is protocol-agnostic. An application plugs in by implementing
//! [`ConnectionHandler`]; the server owns sockets, buffers, registrations,
//! timers and teardown.
//!
//! ## Architecture Overview
//! ```text
//! ┌──────────────┐  signals   ┌───────────────┐
//! │ SignalBridge │──────────▶│               │  readable   ┌─────────────┐
//! └──────────────┘            │   MainLoop    │───────────▶│ WorkerPool  │
//! ┌──────────────┐  readiness │  (one thread) │             │ (N threads) │
//! │ Multiplexer  │──────────▶│               │◀───────────│             │
//! └──────────────┘            └───────┬───────┘ completions └─────────────┘
//!                                     │ owns
//!                     ┌───────────────┴───────────────┐
//!                     ▼                               ▼
//!             ┌───────────────┐               ┌──────────────┐
//!             │ConnectionTable│◀── ids ──────│  TimerList   │
//!             └───────────────┘               └──────────────┘
//! ```
//!
//! - Connections are registered edge-triggered and oneshot: after a readable
//!   notification is handed to a worker, nothing else fires for that
//!   descriptor until the worker's completion is applied and it is re-armed.
//! - The table, the timer list and the registrations are touched only by
//!   the main loop. Workers report back through a completion queue.
//! - Timers and completions refer to connections by generation-checked
//!   [`ConnectionId`], so a stale reference is a no-op, never a use of a
//!   reused descriptor.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use bytes::BytesMut;
//! use mill_serve::prelude::*;
//! use std::net::SocketAddr;
//!
//! struct Echo;
//!
//! impl ConnectionHandler for Echo {
//!     type Session = ();
//!
//!     fn on_connect(&self, _conn_id: ConnectionId, _peer: SocketAddr) {}
//!
//!     fn on_data(&self, _: &mut (), input: &mut BytesMut, output: &mut BytesMut) -> Result<Verdict> {
//!         output.extend_from_slice(&input.split());
//!         Ok(Verdict::Respond { keep_alive: true })
//!     }
//! }
//!
//! fn main() -> Result<()> {
//!     let config = ServerConfig::builder().port(7000).workers(4).build();
//!     let server = Server::bind(config, Echo)?;
//!     server.run()
//! }
//! ```

use std::{
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

pub mod config;
pub mod error;
pub mod event;
pub mod logging;
pub mod net;
pub mod object_pool;
pub mod poll;
pub mod reactor;
pub mod signal;
pub mod sync;
pub mod thread_pool;
pub mod timer;

pub use config::ServerConfig;
pub use error::{Error, Result};
pub use net::{ConnectionHandler, ConnectionId, Verdict};
pub use object_pool::{ObjectPool, PooledObject};
pub use reactor::ShutdownHandle;

use reactor::MainLoop;

/// Commonly used items.
///
/// ```rust
/// use mill_serve::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::{LogFormat, LoggingConfig, ServerConfig};
    pub use crate::error::{Error, Result};
    pub use crate::net::{ConnectionHandler, ConnectionId, Verdict};
    pub use crate::reactor::ShutdownHandle;
    pub use crate::thread_pool::SubmitPolicy;
    pub use crate::{Server, Stats};
}

/// A bound server, ready to run.
///
/// Construction allocates everything up front: listener, multiplexer,
/// connection table, worker threads and the signal bridge. A failure here
/// is a startup failure; once [`run`](Self::run) starts, per-connection
/// errors only ever close the affected connection.
///
/// Only one server may exist per process because signal dispositions are
/// process-wide; a second [`bind`](Self::bind) fails with
/// [`Error::SignalBridgeInUse`] until the first is dropped.
pub struct Server<H: ConnectionHandler> {
    main: MainLoop<H>,
}

impl<H: ConnectionHandler> Server<H> {
    /// Validate `config`, bind the listener and start the worker pool.
    ///
    /// ## Errors
    ///
    /// - [`Error::Config`] for invalid settings
    /// - [`Error::Io`] if the address cannot be bound
    /// - [`Error::SignalBridgeInUse`] if another server is alive
    pub fn bind(config: ServerConfig, handler: H) -> Result<Self> {
        Ok(Self {
            main: MainLoop::new(config, handler)?,
        })
    }

    /// Address the listener actually bound, useful with port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.main.local_addr()
    }

    /// A handle that stops [`run`](Self::run) from another thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.main.shutdown_handle()
    }

    pub fn live_connections(&self) -> usize {
        self.main.live_counter().load(Ordering::Acquire)
    }

    /// Counters that stay readable while the server runs on another thread.
    pub fn stats(&self) -> Stats {
        Stats {
            live: self.main.live_counter(),
        }
    }

    /// Serve until `SIGTERM`/`SIGINT` or a [`ShutdownHandle`] stops the loop,
    /// then close every connection and join the workers.
    pub fn run(mut self) -> Result<()> {
        self.main.run()
    }
}

#[derive(Debug, Clone)]
pub struct Stats {
    live: Arc<AtomicUsize>,
}

impl Stats {
    /// Connections currently in the table.
    pub fn live_connections(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }
}
