//! Intercepting TCP relay.
//!
//! This module provides:
//! - Non-blocking backend connections
//! - The per-client relay state machine
//! - The connection registry
//! - The single-threaded epoll event loop
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> EventLoop -> RelayConnection -> BackendConnection -> Backend
//!                                          |
//!                                     MessageLogger (completed requests)
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use sqltap_proxy::{EventLoop, ProxyConfig, QueryLogger};
//!
//! let config = ProxyConfig::from_args("127.0.0.1", 6432, "127.0.0.1", 5432, "queries.log".into())?;
//! let logger = QueryLogger::open(&config.log_path, config.log_append)?;
//! let mut event_loop = EventLoop::init(config, logger)?;
//! event_loop.run()?;
//! ```

mod backend;
mod event_loop;
mod nonblocking;
mod registry;
mod relay;
#[cfg(test)]
mod testing;

pub use backend::BackendConnection;
pub use event_loop::{EventLoop, ProxyStats};
pub use nonblocking::{read_some, write_some, ReadOutcome};
pub use registry::Registry;
pub use relay::{
    CompletedRequest, ConnectionId, ConnectionIds, Leg, Readiness, RelayConnection, RelayState,
    Step, DEFAULT_CHUNK_SIZE,
};
