//! sqltap - intercepting PostgreSQL proxy.
//!
//! Accepts clients on a local address, relays each one to the backend over
//! its own connection, and appends every recognised client request to a
//! query log.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sqltap_proxy::{EventLoop, ProxyConfig, QueryLogger, ShutdownSignals};

/// Intercepting PostgreSQL proxy that logs client queries.
#[derive(Parser, Debug)]
#[command(name = "sqltap", version, about)]
struct Cli {
    /// Local IP address to listen on
    local_ip: String,

    /// Local port to listen on
    local_port: u16,

    /// Backend server IP address
    remote_ip: String,

    /// Backend server port
    remote_port: u16,

    /// Query log file
    log_path: PathBuf,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            return ExitCode::from(code);
        }
    };

    let config = match ProxyConfig::from_args(
        &cli.local_ip,
        cli.local_port,
        &cli.remote_ip,
        cli.remote_port,
        cli.log_path,
    )
    .map_err(anyhow::Error::from)
    .and_then(ProxyConfig::with_env_overrides)
    {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {:#}", e);
            return ExitCode::from(1);
        }
    };

    // Prefer RUST_LOG, fall back to SQLTAP_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "sqltap starting");
    info!(
        listen_addr = %config.listen_addr,
        backend_addr = %config.backend_addr,
        log_path = %config.log_path.display(),
        log_append = config.log_append,
        chunk_size = config.chunk_size,
        max_events = config.max_events,
        fault_policy = ?config.fault_policy,
        "Configuration loaded"
    );

    match run(config) {
        Ok(()) => {
            info!("sqltap stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "sqltap failed");
            let mut source = e.source();
            while let Some(cause) = source {
                error!(cause = %cause, "caused by");
                source = cause.source();
            }
            ExitCode::from(1)
        }
    }
}

fn run(config: ProxyConfig) -> Result<()> {
    // Block the shutdown signals before anything else can spawn threads.
    let signals = ShutdownSignals::install().context("failed to install signal handling")?;

    let logger = QueryLogger::open(&config.log_path, config.log_append).with_context(|| {
        format!("failed to open query log {}", config.log_path.display())
    })?;

    let mut event_loop = EventLoop::init(config, logger)
        .context("failed to start the proxy")?
        .with_shutdown_signals(signals)
        .context("failed to watch shutdown signals")?;

    event_loop.run().context("event loop failed")?;

    let stats = event_loop.stats();
    info!(
        accepted = stats.connections_accepted,
        closed = stats.connections_closed,
        failed = stats.connections_failed,
        active = event_loop.connection_count(),
        requests = stats.requests,
        "Shutdown complete"
    );
    Ok(())
}
