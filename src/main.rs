//! mill-serve binary: the server core with a minimal HTTP/1.1 responder.

mod http;

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use mill_serve::{
    config::{parse_port, ServerConfig, ServerConfigBuilder},
    logging, signal,
    thread_pool::SubmitPolicy,
    Server,
};

#[derive(Parser)]
#[command(name = "mill-serve")]
#[command(about = "Event-driven TCP server with a bounded worker pool and idle eviction")]
struct Args {
    /// Port to listen on
    #[arg(value_parser = parse_port)]
    port: u16,

    /// Path to a TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of worker threads
    #[arg(long)]
    workers: Option<usize>,

    /// Tasks that may wait for a worker
    #[arg(long)]
    queue_capacity: Option<usize>,

    /// Connection table size
    #[arg(long)]
    max_connections: Option<usize>,

    /// Seconds of inactivity before a connection is evicted
    #[arg(long, value_name = "SECS")]
    idle_timeout: Option<u64>,

    /// Refuse connections instead of stalling when the worker queue is full
    #[arg(long)]
    reject_when_full: bool,

    /// Log filter, e.g. `debug` or `mill_serve=trace`
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,
}

impl Args {
    /// File values first, then command-line overrides.
    fn into_config(self) -> anyhow::Result<ServerConfig> {
        let base = match &self.config {
            Some(path) => ServerConfig::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => ServerConfig::default(),
        };

        let mut builder = ServerConfigBuilder::from_config(base).port(self.port);
        if let Some(workers) = self.workers {
            builder = builder.workers(workers);
        }
        if let Some(capacity) = self.queue_capacity {
            builder = builder.queue_capacity(capacity);
        }
        if let Some(max) = self.max_connections {
            builder = builder.max_connections(max);
        }
        if let Some(secs) = self.idle_timeout {
            builder = builder.idle_timeout_secs(secs);
        }
        if self.reject_when_full {
            builder = builder.submit_policy(SubmitPolicy::Reject);
        }

        let mut config = builder.build();
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

fn main() {
    let args = Args::parse();

    let config = match args.into_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("mill-serve: {e:#}");
            std::process::exit(1);
        }
    };

    if let Err(e) = logging::init(&config.logging) {
        eprintln!("mill-serve: {e}");
        std::process::exit(1);
    }

    if let Err(e) = run(config) {
        tracing::error!(error = %format!("{e:#}"), "server error");
        std::process::exit(1);
    }
}

fn run(config: ServerConfig) -> anyhow::Result<()> {
    signal::ignore_sigpipe().context("ignoring SIGPIPE")?;

    let addr = config.socket_addr();
    let server = Server::bind(config, http::HttpHandler)
        .with_context(|| format!("starting server on {addr}"))?;
    server.run().context("main loop")?;

    tracing::info!("shutdown complete");
    Ok(())
}
