//! Self-pipe signal bridge.
//!
//! A signal handler may not lock, allocate or log. The handler installed
//! here does exactly one thing: write the signal number as a single byte to
//! the non-blocking write end of a socket pair. The read end is registered
//! with the multiplexer, so signals arrive in the main loop as ordinary
//! readable events and are interpreted there with full capability.
//!
//! ```text
//! SIGALRM ──▶ on_signal() ──write(1 byte)──▶ [socketpair] ──readable──▶ main loop
//! ```
//!
//! Handlers are process-wide, so at most one bridge may be installed at a
//! time; the previous dispositions are restored when it is dropped.

use std::{
    io::{self, Read},
    mem,
    os::fd::{AsRawFd, RawFd},
    ptr,
    sync::atomic::{AtomicI32, Ordering},
    time::Duration,
};

use libc::c_int;
use mio::net::UnixStream;

use crate::error::{Error, Result};

/// Bytes drained from the channel per read.
const DRAIN_CHUNK: usize = 1024;

/// Write end of the installed bridge, `-1` when none is installed.
static BRIDGE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn on_signal(signal: c_int) {
    // SAFETY: errno is thread-local; only async-signal-safe calls follow.
    unsafe {
        let errno = libc::__errno_location();
        let saved = *errno;

        let fd = BRIDGE_FD.load(Ordering::Relaxed);
        if fd >= 0 {
            let byte = signal as u8;
            libc::send(
                fd,
                &byte as *const u8 as *const libc::c_void,
                1,
                libc::MSG_DONTWAIT,
            );
        }

        *errno = saved;
    }
}

pub struct SignalBridge {
    reader: UnixStream,
    writer: UnixStream,
    installed: Vec<(c_int, libc::sigaction)>,
}

impl SignalBridge {
    /// Create the channel and claim the process-wide handler slot.
    pub fn new() -> Result<Self> {
        let (reader, writer) = UnixStream::pair()?;
        BRIDGE_FD
            .compare_exchange(-1, writer.as_raw_fd(), Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::SignalBridgeInUse)?;

        Ok(Self {
            reader,
            writer,
            installed: Vec::new(),
        })
    }

    /// Route `signal` through the bridge.
    ///
    /// Installed with `SA_RESTART` and every signal blocked while the handler
    /// runs.
    pub fn install(&mut self, signal: c_int) -> Result<()> {
        // SAFETY: both sigaction structs are fully initialised before use
        // and `on_signal` only performs async-signal-safe operations.
        unsafe {
            let mut action: libc::sigaction = mem::zeroed();
            action.sa_sigaction = on_signal as extern "C" fn(c_int) as libc::sighandler_t;
            action.sa_flags = libc::SA_RESTART;
            libc::sigfillset(&mut action.sa_mask);

            let mut previous: libc::sigaction = mem::zeroed();
            if libc::sigaction(signal, &action, &mut previous) < 0 {
                return Err(Error::Io(io::Error::last_os_error()));
            }
            self.installed.push((signal, previous));
        }
        tracing::debug!(signal, "signal routed through bridge");
        Ok(())
    }

    /// Read every buffered signal number into `signals`.
    ///
    /// Running out of buffered bytes ends the drain normally. A zero-length
    /// read means the write end is gone and termination signals can no
    /// longer be delivered, which is reported as
    /// [`Error::SignalChannelClosed`].
    pub fn drain(&mut self, signals: &mut Vec<c_int>) -> Result<usize> {
        let mut buf = [0u8; DRAIN_CHUNK];
        let before = signals.len();
        loop {
            match (&self.reader).read(&mut buf) {
                Ok(0) => return Err(Error::SignalChannelClosed),
                Ok(n) => signals.extend(buf[..n].iter().map(|&b| c_int::from(b))),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::SignalChannel(e)),
            }
        }
        Ok(signals.len() - before)
    }

    /// Write end of the channel; only the signal handler writes to it.
    pub fn sender_fd(&self) -> RawFd {
        self.writer.as_raw_fd()
    }
}

impl AsRawFd for SignalBridge {
    fn as_raw_fd(&self) -> RawFd {
        self.reader.as_raw_fd()
    }
}

impl Drop for SignalBridge {
    fn drop(&mut self) {
        // a handler still running elsewhere must stop writing before the
        // write end closes
        BRIDGE_FD.store(-1, Ordering::Release);
        for (signal, previous) in self.installed.drain(..).rev() {
            // SAFETY: `previous` was filled in by the kernel in `install`.
            unsafe {
                libc::sigaction(signal, &previous, ptr::null_mut());
            }
        }
    }
}

/// Ignore `SIGPIPE` so writes to a closed peer fail with `EPIPE` instead of
/// killing the process.
pub fn ignore_sigpipe() -> Result<()> {
    // SAFETY: SIG_IGN is a valid disposition for SIGPIPE.
    let previous = unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) };
    if previous == libc::SIG_ERR {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    Ok(())
}

/// Arrange for `SIGALRM` after `delay`, replacing any pending alarm.
///
/// alarm(2) counts whole seconds; anything under one second becomes one.
pub fn schedule_alarm(delay: Duration) {
    let secs = u32::try_from(delay.as_secs())
        .unwrap_or(u32::MAX)
        .max(1);
    // SAFETY: alarm(2) has no memory-safety preconditions.
    unsafe {
        libc::alarm(secs);
    }
}

pub fn cancel_alarm() {
    // SAFETY: as above; zero cancels.
    unsafe {
        libc::alarm(0);
    }
}

/// Bridge tests in this crate install process-wide handlers; they hold this
/// while a bridge exists.
#[cfg(test)]
pub(crate) fn serial() -> std::sync::MutexGuard<'static, ()> {
    static SERIAL: std::sync::Mutex<()> = std::sync::Mutex::new(());
    SERIAL.lock().unwrap_or_else(|e| e.into_inner())
}
