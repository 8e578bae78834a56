use std::io;
use std::net::SocketAddr;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the server core.
///
/// Only startup failures and multiplexer/signal-channel failures ever leave
/// [`Server::run`](crate::Server::run). Everything scoped to a single
/// connection is handled locally by closing that connection.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration file: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid port: {0}")]
    InvalidPort(String),

    #[error("connection table full, rejecting {0}")]
    CapacityExceeded(SocketAddr),

    #[error("worker queue is full")]
    QueueFull,

    #[error("worker pool is shut down")]
    PoolShutdown,

    #[error("multiplexer failure: {0}")]
    Multiplexer(io::Error),

    #[error("signal channel closed")]
    SignalChannelClosed,

    #[error("signal channel failure: {0}")]
    SignalChannel(io::Error),

    #[error("a signal bridge is already installed in this process")]
    SignalBridgeInUse,

    #[error("handler error: {0}")]
    Handler(String),
}

impl Error {
    /// Convenience constructor for protocol handlers.
    pub fn handler(msg: impl Into<String>) -> Self {
        Error::Handler(msg.into())
    }
}
