//! The main loop.
//!
//! One thread owns the listener, the connection table, the timer list and
//! every multiplexer registration. It blocks in [`Multiplexer::wait`] and
//! walks each batch of readiness events:
//!
//! ```text
//!   wait ──▶ LISTENER ──▶ accept until WouldBlock, register ONESHOT|READABLE
//!        ──▶ SIGNAL   ──▶ drain bridge, set sticky timer_due / stop flags
//!        ──▶ WAKER    ──▶ apply worker completions (re-arm or close)
//!        ──▶ conn     ──▶ hangup/error: close
//!                         readable:     fill, refresh timer, hand to worker
//!                         writable:     flush inline, re-arm or close
//!   after the batch: timer_due ──▶ tick timers, evict, schedule next alarm
//! ```
//!
//! Housekeeping runs only after the whole batch so I/O is never delayed by
//! timer processing.

use std::{
    io,
    net::SocketAddr,
    os::fd::AsRawFd,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Instant,
};

use bytes::BytesMut;
use libc::c_int;
use mio::{
    net::{TcpListener, TcpStream},
    Interest, Token, Waker,
};
use tracing::{debug, info, trace, warn};

use crate::{
    config::ServerConfig,
    error::{Error, Result},
    event::Readiness,
    net::{
        Completion, Completions, Connection, ConnectionHandler, ConnectionId, ConnectionTable,
        Fill, Flush, Outcome, Released, SlotState,
    },
    object_pool::ObjectPool,
    poll::{Mode, Multiplexer},
    signal::{cancel_alarm, schedule_alarm, SignalBridge},
    thread_pool::WorkerPool,
    timer::TimerList,
};

// Connection tokens keep the slot in the low 32 bits and slots stay below
// 2^24, so these can never collide with one.
pub const LISTENER: Token = Token(usize::MAX - 1);
pub const SIGNAL: Token = Token(usize::MAX - 2);
pub const WAKER: Token = Token(usize::MAX - 3);

/// Idle buffers kept for reuse, per direction.
const RETAINED_BUFFERS: usize = 256;

/// Why a connection left the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cause {
    PeerClosed,
    Hangup,
    Io,
    /// The handler asked for it, failed, or panicked.
    Handler,
    /// The worker queue refused the task.
    Refused,
    Evicted,
    Shutdown,
}

/// Stops a running loop from any thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    /// Same effect as delivering `SIGTERM`: the loop finishes its current
    /// batch and tears down.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "failed to wake main loop for shutdown");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

pub struct MainLoop<H: ConnectionHandler> {
    config: ServerConfig,
    handler: Arc<H>,
    listener: TcpListener,
    mux: Multiplexer,
    signals: SignalBridge,
    table: ConnectionTable<Arc<Connection<H::Session>>>,
    timers: TimerList<ConnectionId>,
    pool: WorkerPool,
    completions: Arc<Completions>,
    buffers: ObjectPool<BytesMut>,
    /// Read chunk for every connection, `buffer_size` bytes.
    scratch: Vec<u8>,
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl<H: ConnectionHandler> MainLoop<H> {
    /// Bind the listener and build every resource the loop needs.
    ///
    /// Claims the process-wide signal bridge, so only one loop may exist at
    /// a time.
    pub fn new(config: ServerConfig, handler: H) -> Result<Self> {
        config.validate()?;

        let listener = TcpListener::bind(config.socket_addr())?;
        let mux = Multiplexer::new(config.events_capacity)?;
        // level-triggered: a backlog left behind by a failed accept is
        // reported again on the next wait
        mux.register(listener.as_raw_fd(), LISTENER, Interest::READABLE, Mode::LEVEL)?;

        let mut signals = SignalBridge::new()?;
        for signal in [libc::SIGALRM, libc::SIGTERM, libc::SIGINT] {
            signals.install(signal)?;
        }
        mux.register(signals.as_raw_fd(), SIGNAL, Interest::READABLE, Mode::EDGE)?;

        let waker = Arc::new(mux.waker(WAKER)?);
        let completions = Arc::new(Completions::new(Arc::clone(&waker)));
        let table = ConnectionTable::new(config.max_connections)?;
        let pool = WorkerPool::new(config.workers, config.queue_capacity, config.submit_policy)?;

        let buffer_size = config.buffer_size;
        let buffers = ObjectPool::new(0, RETAINED_BUFFERS * 2, move || {
            BytesMut::with_capacity(buffer_size)
        });

        Ok(Self {
            timers: TimerList::with_capacity(config.max_connections.min(4096)),
            config,
            handler: Arc::new(handler),
            listener,
            mux,
            signals,
            table,
            pool,
            completions,
            buffers,
            scratch: vec![0; buffer_size],
            stop: Arc::new(AtomicBool::new(false)),
            waker,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            stop: Arc::clone(&self.stop),
            waker: Arc::clone(&self.waker),
        }
    }

    pub fn live_counter(&self) -> Arc<AtomicUsize> {
        self.table.live_counter()
    }

    /// Serve until a termination signal or [`ShutdownHandle::shutdown`].
    ///
    /// Returns `Err` only for failures that make the loop unusable: the
    /// multiplexer wait failing, or the signal channel breaking.
    pub fn run(&mut self) -> Result<()> {
        info!(
            addr = %self.local_addr()?,
            workers = self.pool.workers_len(),
            queue_capacity = self.pool.capacity(),
            policy = ?self.pool.policy(),
            max_connections = self.table.capacity(),
            "listening"
        );

        schedule_alarm(self.config.timeslot());
        let result = self.serve();
        if let Err(e) = &result {
            tracing::error!(error = %e, "main loop failed");
        }
        self.teardown();
        result
    }

    fn serve(&mut self) -> Result<()> {
        let mut ready = Vec::with_capacity(self.config.events_capacity);
        let mut signals: Vec<c_int> = Vec::new();
        let mut timer_due = false;

        while !self.stop.load(Ordering::Acquire) {
            self.mux.wait(&mut ready, None)?;

            for event in &ready {
                match event.token() {
                    LISTENER => self.accept(),
                    SIGNAL => {
                        self.signals.drain(&mut signals)?;
                        for signal in signals.drain(..) {
                            match signal {
                                libc::SIGALRM => timer_due = true,
                                libc::SIGTERM | libc::SIGINT => {
                                    info!(signal, "termination signal received");
                                    self.stop.store(true, Ordering::Release);
                                }
                                other => trace!(signal = other, "ignoring signal"),
                            }
                        }
                    }
                    WAKER => self.apply_completions(),
                    token => self.connection_event(ConnectionId::from_token(token), event),
                }
            }

            if timer_due {
                timer_due = false;
                self.evict_idle();
                schedule_alarm(self.config.timeslot());
            }
        }

        Ok(())
    }

    fn accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.admit(stream, peer),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn admit(&mut self, stream: TcpStream, peer: SocketAddr) {
        let slot = stream.as_raw_fd() as usize;
        if !self.table.has_room(slot) {
            // dropping the stream closes it before it ever enters the table
            warn!(
                error = %Error::CapacityExceeded(peer),
                live = self.table.len(),
                "server busy"
            );
            return;
        }

        if let Err(e) = stream.set_nodelay(self.config.no_delay) {
            debug!(peer = %peer, error = %e, "failed to set TCP_NODELAY");
        }

        let Some(id) = self.table.insert(slot, |id| {
            let session = self.handler.on_connect(id, peer);
            Arc::new(Connection::new(
                id,
                peer,
                stream,
                session,
                self.buffers.acquire(),
                self.buffers.acquire(),
            ))
        }) else {
            return;
        };

        if let Err(e) = self
            .mux
            .register(slot as i32, id.token(), Interest::READABLE, Mode::ONESHOT)
        {
            warn!(conn = %id, error = %e, "failed to register connection");
            self.close(id, Cause::Io);
            return;
        }

        let timer = self
            .timers
            .add(Instant::now() + self.config.idle_timeout(), id);
        self.table.set_timer(id, timer);

        debug!(conn = %id, peer = %peer, live = self.table.len(), "accepted");
    }

    fn connection_event(&mut self, id: ConnectionId, event: &Readiness) {
        let Some(conn) = self.table.get(id).cloned() else {
            trace!(conn = %id, "event for stale connection");
            return;
        };

        if event.is_error() || event.is_hangup() {
            self.close(id, Cause::Hangup);
        } else if event.is_readable() {
            self.on_readable(id, conn);
        } else if event.is_writable() {
            self.on_writable(id, conn);
        }
    }

    fn on_readable(&mut self, id: ConnectionId, conn: Arc<Connection<H::Session>>) {
        if self.table.state(id) != SlotState::Idle {
            return;
        }

        match conn.fill(&mut self.scratch, self.config.max_request_size) {
            Ok(Fill::Eof) => self.close(id, Cause::PeerClosed),
            Ok(Fill::Data(0)) => self.rearm(id, Interest::READABLE),
            Ok(Fill::Data(n)) => {
                trace!(conn = %id, bytes = n, "read");
                if let Some(timer) = self.table.timer(id) {
                    self.timers
                        .adjust(timer, Instant::now() + self.config.idle_timeout());
                }
                self.dispatch(id, conn);
            }
            Err(e) => {
                debug!(conn = %id, error = %e, "read failed");
                self.close(id, Cause::Io);
            }
        }
    }

    fn on_writable(&mut self, id: ConnectionId, conn: Arc<Connection<H::Session>>) {
        if self.table.state(id) != SlotState::Idle {
            return;
        }

        match conn.flush() {
            Ok(Flush::Pending) => self.rearm(id, Interest::WRITABLE),
            Ok(Flush::Done {
                keep_alive: true,
                pending_input: true,
            }) => self.dispatch(id, conn),
            Ok(Flush::Done {
                keep_alive: true,
                pending_input: false,
            }) => self.rearm(id, Interest::READABLE),
            Ok(Flush::Done {
                keep_alive: false, ..
            }) => self.close(id, Cause::Handler),
            Err(e) => {
                debug!(conn = %id, error = %e, "write failed");
                self.close(id, Cause::Io);
            }
        }
    }

    /// Idle → Busy and hand the buffered input to a worker.
    fn dispatch(&mut self, id: ConnectionId, conn: Arc<Connection<H::Session>>) {
        if !self.table.mark_busy(id) {
            return;
        }

        let handler = Arc::clone(&self.handler);
        let guard = self.completions.guard(id);
        let task = move || {
            if conn.is_closed() {
                guard.abandon();
                return Ok(());
            }
            match conn.process(&*handler) {
                Ok(outcome) => {
                    guard.complete(outcome);
                    Ok(())
                }
                Err(e) => {
                    guard.complete(Outcome::Close);
                    Err(e)
                }
            }
        };

        if let Err(e) = self.pool.exec(task) {
            warn!(conn = %id, queued = self.pool.queued(), error = %e, "task refused");
            self.close(id, Cause::Refused);
        }
    }

    fn apply_completions(&mut self) {
        while let Some(Completion { conn_id, outcome }) = self.completions.pop() {
            match outcome {
                Outcome::Rearm(interest) => {
                    if self.table.mark_idle(conn_id) {
                        self.rearm(conn_id, interest);
                    }
                }
                Outcome::Close => self.close(conn_id, Cause::Handler),
            }
        }
    }

    fn rearm(&mut self, id: ConnectionId, interest: Interest) {
        let Some(fd) = self.table.get(id).map(|conn| conn.as_raw_fd()) else {
            return;
        };
        if let Err(e) = self.mux.rearm(fd, id.token(), interest) {
            debug!(conn = %id, error = %e, "re-arm failed");
            self.close(id, Cause::Io);
        }
    }

    fn evict_idle(&mut self) {
        let now = Instant::now();
        let mut expired = Vec::new();
        let fired = self.timers.tick(now, |id| expired.push(id));
        if fired > 0 {
            let next_in = self
                .timers
                .next_deadline()
                .map(|at| at.saturating_duration_since(now));
            debug!(
                evicted = fired,
                remaining = self.timers.len(),
                ?next_in,
                "idle timers fired"
            );
        }
        for id in expired {
            self.close(id, Cause::Evicted);
        }
    }

    /// Closing → Free. A connection already closing or gone is ignored.
    fn close(&mut self, id: ConnectionId, cause: Cause) {
        let Some(Released { value: conn, timer }) = self.table.begin_close(id) else {
            return;
        };

        if let Err(e) = self.mux.deregister(conn.as_raw_fd()) {
            trace!(conn = %id, error = %e, "deregister failed");
        }
        // an evicted connection's timer was already unlinked by tick
        if cause != Cause::Evicted {
            if let Some(timer) = timer {
                self.timers.remove(timer);
            }
        }
        conn.close();
        self.table.release(id);
        self.handler.on_disconnect(id);

        debug!(
            conn = %id,
            peer = %conn.peer(),
            ?cause,
            live = self.table.len(),
            "connection closed"
        );
    }

    fn teardown(&mut self) {
        cancel_alarm();

        for id in self.table.ids() {
            self.close(id, Cause::Shutdown);
        }
        self.pool.shutdown();
        while self.completions.pop().is_some() {}

        info!(
            completed = self.pool.completed(),
            failed = self.pool.failed(),
            "server stopped"
        );
    }
}
