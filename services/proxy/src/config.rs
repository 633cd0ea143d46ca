//! Proxy configuration.
//!
//! Addresses and the log path come from the command line. Tuning knobs are
//! read from `SQLTAP_*` environment variables.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};

use crate::error::ProxyError;
use crate::proxy::DEFAULT_CHUNK_SIZE;

/// Default number of readiness events fetched per wait.
pub const DEFAULT_MAX_EVENTS: usize = 64;

/// What the loop does with an error that concerns a single connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FaultPolicy {
    /// Disconnect only the failing connection and keep serving.
    #[default]
    Isolate,
    /// Stop the loop and return the error.
    Propagate,
}

impl FromStr for FaultPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "isolate" => Ok(FaultPolicy::Isolate),
            "propagate" => Ok(FaultPolicy::Propagate),
            other => Err(format!("unknown fault policy '{}'", other)),
        }
    }
}

/// Proxy configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Local address to accept clients on.
    pub listen_addr: SocketAddr,

    /// Backend SQL server every client is relayed to.
    pub backend_addr: SocketAddr,

    /// Query log file.
    pub log_path: PathBuf,

    /// Append to the query log (true) or truncate it at startup.
    pub log_append: bool,

    /// Size of a single socket read.
    pub chunk_size: usize,

    /// Readiness events fetched per wait.
    pub max_events: usize,

    /// Handling of connection-scoped errors.
    pub fault_policy: FaultPolicy,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl ProxyConfig {
    /// Build a configuration with defaults for everything but the addresses.
    pub fn new(listen_addr: SocketAddr, backend_addr: SocketAddr, log_path: PathBuf) -> Self {
        Self {
            listen_addr,
            backend_addr,
            log_path,
            log_append: true,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_events: DEFAULT_MAX_EVENTS,
            fault_policy: FaultPolicy::default(),
            log_level: "info".to_string(),
        }
    }

    /// Build from the raw command-line values.
    pub fn from_args(
        local_ip: &str,
        local_port: u16,
        remote_ip: &str,
        remote_port: u16,
        log_path: PathBuf,
    ) -> Result<Self, ProxyError> {
        let listen_ip = parse_ip("listen", local_ip)?;
        let backend_ip = parse_ip("backend", remote_ip)?;
        Ok(Self::new(
            SocketAddr::new(listen_ip, local_port),
            SocketAddr::new(backend_ip, remote_port),
            log_path,
        ))
    }

    /// Apply `SQLTAP_*` environment overrides.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(level) = var("SQLTAP_LOG_LEVEL") {
            self.log_level = level;
        }

        if let Some(v) = var("SQLTAP_LOG_TRUNCATE") {
            self.log_append = !(v == "1" || v.to_lowercase() == "true");
        }

        if let Some(v) = var("SQLTAP_FAULT_POLICY") {
            self.fault_policy = v
                .parse()
                .map_err(anyhow::Error::msg)
                .context("SQLTAP_FAULT_POLICY must be 'isolate' or 'propagate'.")?;
        }

        let chunk_size: Option<usize> = var("SQLTAP_CHUNK_SIZE")
            .map(|v| v.parse())
            .transpose()
            .context("SQLTAP_CHUNK_SIZE must be an integer (bytes).")?;
        if let Some(size) = chunk_size {
            self.chunk_size = size.clamp(512, 1024 * 1024);
        }

        let max_events: Option<usize> = var("SQLTAP_MAX_EVENTS")
            .map(|v| v.parse())
            .transpose()
            .context("SQLTAP_MAX_EVENTS must be an integer.")?;
        if let Some(n) = max_events {
            self.max_events = n.clamp(1, 4096);
        }

        Ok(self)
    }
}

fn parse_ip(role: &'static str, value: &str) -> Result<IpAddr, ProxyError> {
    value.parse().map_err(|_| ProxyError::InvalidAddress {
        role,
        value: value.to_string(),
    })
}
