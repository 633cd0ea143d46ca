pub mod config;
pub mod error;
pub mod proxy;
pub mod query_log;
pub mod shutdown;

pub use config::{FaultPolicy, ProxyConfig};
pub use error::ProxyError;
pub use proxy::{
    BackendConnection, CompletedRequest, ConnectionId, EventLoop, ProxyStats, RelayConnection,
    RelayState,
};
pub use query_log::{MessageKind, MessageLogger, QueryLogger};
pub use shutdown::{ShutdownSignals, StopHandle};
