//! Error types for the proxy.

use std::io;

use thiserror::Error;

use crate::proxy::{RelayState, Step};

/// Proxy errors, grouped by the layer that raised them.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// An address given on the command line did not parse.
    #[error("invalid {role} address: {value}")]
    InvalidAddress { role: &'static str, value: String },

    /// Listener or multiplexer setup failed, or accept failed.
    #[error("init failed: {context}: {source}")]
    Init {
        context: &'static str,
        #[source]
        source: io::Error,
    },

    /// Backend socket failure (open, connect, send or receive).
    #[error("backend connection error: {context}: {source}")]
    Connection {
        context: &'static str,
        #[source]
        source: io::Error,
    },

    /// Client socket failure.
    #[error("client I/O error: {0}")]
    ClientIo(#[source] io::Error),

    /// Loop-level failure: wait, (de)registration or listener fault.
    #[error("processing error: {context}: {source}")]
    Processing {
        context: &'static str,
        #[source]
        source: io::Error,
    },

    /// The query log could not be written.
    #[error("query log write failed: {0}")]
    QueryLog(#[source] io::Error),

    /// A relay operation was invoked outside the state that permits it.
    #[error("{step} is not valid in state {state}")]
    InvalidState { step: Step, state: RelayState },
}

impl ProxyError {
    pub(crate) fn init(context: &'static str, source: impl Into<io::Error>) -> Self {
        Self::Init {
            context,
            source: source.into(),
        }
    }

    pub(crate) fn connection(context: &'static str, source: impl Into<io::Error>) -> Self {
        Self::Connection {
            context,
            source: source.into(),
        }
    }

    pub(crate) fn processing(context: &'static str, source: impl Into<io::Error>) -> Self {
        Self::Processing {
            context,
            source: source.into(),
        }
    }

    /// Standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ProxyError::InvalidAddress { .. } => "invalid_address",
            ProxyError::Init { .. } => "init_failed",
            ProxyError::Connection { .. } => "backend_connection",
            ProxyError::ClientIo(_) => "client_io",
            ProxyError::Processing { .. } => "processing",
            ProxyError::QueryLog(_) => "query_log",
            ProxyError::InvalidState { .. } => "invalid_state",
        }
    }

    /// Whether the error only concerns the connection that raised it.
    ///
    /// Everything else (listener, multiplexer, query log) affects every
    /// connection and is always fatal to the loop.
    pub fn is_connection_scoped(&self) -> bool {
        matches!(
            self,
            ProxyError::Connection { .. }
                | ProxyError::ClientIo(_)
                | ProxyError::InvalidState { .. }
        )
    }
}
