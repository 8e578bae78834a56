//! Server configuration.
//!
//! Every field has a default, so a configuration file only needs the keys
//! it changes. Values given on the command line override the file.
//!
//! ```toml
//! port = 8080
//! workers = 8
//! queue_capacity = 10000
//! submit_policy = "block"
//! idle_timeout_secs = 15
//!
//! [logging]
//! level = "info"
//! format = "compact"
//! ```

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::Path,
    time::Duration,
};

use serde::Deserialize;

use crate::{
    error::{Error, Result},
    poll::DEFAULT_EVENTS_CAPACITY,
    thread_pool::{SubmitPolicy, DEFAULT_POOL_CAPACITY, DEFAULT_QUEUE_CAPACITY},
};

/// Highest descriptor value the connection table accepts by default.
pub const DEFAULT_MAX_CONNECTIONS: usize = 65535;
/// Tokens above this slot value are reserved for internal registrations.
pub const MAX_TABLE_CAPACITY: usize = 1 << 24;
pub const DEFAULT_TIMESLOT_SECS: u32 = 5;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 3 * DEFAULT_TIMESLOT_SECS as u64;
pub const DEFAULT_BUFFER_SIZE: usize = 4096;
pub const DEFAULT_MAX_REQUEST_SIZE: usize = 64 * 1024;

/// Parse a listening port given on the command line. Port 0 is refused.
pub fn parse_port(value: &str) -> Result<u16> {
    match value.trim().parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(Error::InvalidPort(value.to_string())),
    }
}

/// Configuration for the server core.
///
/// ## Resource limits
///
/// - `max_connections`: size of the connection table. Slots are indexed by
///   descriptor value, so this is also the highest descriptor admitted.
/// - `queue_capacity`: tasks waiting for a worker; `submit_policy` decides
///   between stalling the main loop and refusing the connection when full.
/// - `max_request_size`: buffered unprocessed input per connection.
///
/// ## Timers
///
/// The periodic alarm fires every `timeslot_secs`; connections idle for
/// `idle_timeout_secs` are evicted on the first tick after their deadline.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub address: IpAddr,
    pub port: u16,
    pub workers: usize,
    pub queue_capacity: usize,
    pub submit_policy: SubmitPolicy,
    pub max_connections: usize,
    pub events_capacity: usize,
    pub timeslot_secs: u32,
    pub idle_timeout_secs: u64,
    pub buffer_size: usize,
    pub max_request_size: usize,
    pub no_delay: bool,
    pub logging: LoggingConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            workers: DEFAULT_POOL_CAPACITY,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            submit_policy: SubmitPolicy::default(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            events_capacity: DEFAULT_EVENTS_CAPACITY,
            timeslot_secs: DEFAULT_TIMESLOT_SECS,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_request_size: DEFAULT_MAX_REQUEST_SIZE,
            no_delay: true,
            logging: LoggingConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Create a new builder for ServerConfig
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }

    /// Load a configuration file. Missing keys take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!("cannot read {}: {e}", path.as_ref().display()))
        })?;
        let config: ServerConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn timeslot(&self) -> Duration {
        Duration::from_secs(u64::from(self.timeslot_secs))
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("workers", self.workers),
            ("queue_capacity", self.queue_capacity),
            ("max_connections", self.max_connections),
            ("events_capacity", self.events_capacity),
            ("buffer_size", self.buffer_size),
            ("max_request_size", self.max_request_size),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(Error::Config(format!("{name} must be greater than zero")));
        }
        if self.max_connections > MAX_TABLE_CAPACITY {
            return Err(Error::Config(format!(
                "max_connections must be at most {MAX_TABLE_CAPACITY}"
            )));
        }
        if self.timeslot_secs == 0 {
            return Err(Error::Config("timeslot_secs must be greater than zero".into()));
        }
        if self.idle_timeout_secs < u64::from(self.timeslot_secs) {
            return Err(Error::Config(format!(
                "idle_timeout_secs ({}) must not be shorter than timeslot_secs ({})",
                self.idle_timeout_secs, self.timeslot_secs
            )));
        }
        Ok(())
    }
}

/// Builder for ServerConfig.
///
/// Unset fields keep the values from `ServerConfig::default()`, or from the
/// configuration passed to [`ServerConfigBuilder::from_config`].
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    pub fn new() -> Self {
        Self::from_config(ServerConfig::default())
    }

    /// Start from an existing configuration, e.g. one loaded from a file.
    pub fn from_config(config: ServerConfig) -> Self {
        Self { config }
    }

    pub fn address(mut self, address: IpAddr) -> Self {
        self.config.address = address;
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    pub fn submit_policy(mut self, policy: SubmitPolicy) -> Self {
        self.config.submit_policy = policy;
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.config.max_connections = max;
        self
    }

    pub fn events_capacity(mut self, capacity: usize) -> Self {
        self.config.events_capacity = capacity;
        self
    }

    pub fn timeslot_secs(mut self, secs: u32) -> Self {
        self.config.timeslot_secs = secs;
        self
    }

    pub fn idle_timeout_secs(mut self, secs: u64) -> Self {
        self.config.idle_timeout_secs = secs;
        self
    }

    pub fn buffer_size(mut self, size: usize) -> Self {
        self.config.buffer_size = size;
        self
    }

    pub fn max_request_size(mut self, size: usize) -> Self {
        self.config.max_request_size = size;
        self
    }

    /// Enable or disable TCP_NODELAY
    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.config.no_delay = enabled;
        self
    }

    pub fn logging(mut self, logging: LoggingConfig) -> Self {
        self.config.logging = logging;
        self
    }

    pub fn build(self) -> ServerConfig {
        self.config
    }
}

impl Default for ServerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `info` or `mill_serve=debug`
    pub level: String,
    pub format: LogFormat,
    pub timestamps: bool,
    pub target: bool,
    pub thread_names: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
            timestamps: true,
            target: false,
            thread_names: true,
        }
    }
}
