//! Outbound connection to the backend SQL server.
//!
//! Each client gets its own backend socket. The connect is started without
//! blocking and completed later, when the event loop sees the socket become
//! writable (or fail).

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};

use nix::errno::Errno;
use nix::sys::socket::{self, AddressFamily, SockFlag, SockType, SockaddrStorage};
use tracing::debug;

use super::nonblocking::{read_some, write_some, ReadOutcome};
use crate::error::ProxyError;

/// A backend socket exclusively owned by one relay connection.
///
/// Not `Clone`; dropping it closes the socket.
#[derive(Debug)]
pub struct BackendConnection<S = TcpStream> {
    stream: S,
    addr: SocketAddr,
    connected: bool,
}

impl BackendConnection<TcpStream> {
    /// Create a non-blocking socket and start connecting to `addr`.
    ///
    /// Returns as soon as the connect is in progress. Call
    /// [`finish_connect`](Self::finish_connect) once the socket reports
    /// writable or an error.
    pub fn open(addr: SocketAddr) -> Result<Self, ProxyError> {
        let family = match addr {
            SocketAddr::V4(_) => AddressFamily::Inet,
            SocketAddr::V6(_) => AddressFamily::Inet6,
        };
        let fd = socket::socket(
            family,
            SockType::Stream,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            None,
        )
        .map_err(|e| ProxyError::connection("socket", e))?;

        let connected = match socket::connect(fd.as_raw_fd(), &SockaddrStorage::from(addr)) {
            Ok(()) => true,
            Err(Errno::EINPROGRESS) => false,
            Err(e) => return Err(ProxyError::connection("connect", e)),
        };

        debug!(backend_addr = %addr, connected, "Backend connect started");

        Ok(Self {
            stream: TcpStream::from(fd),
            addr,
            connected,
        })
    }

    /// Check whether the pending connect has completed.
    ///
    /// Returns `Ok(false)` while it is still in progress.
    pub fn finish_connect(&mut self) -> Result<bool, ProxyError> {
        if self.connected {
            return Ok(true);
        }
        if let Some(e) = self
            .stream
            .take_error()
            .map_err(|e| ProxyError::connection("connect status", e))?
        {
            return Err(ProxyError::connection("connect", e));
        }
        match self.stream.peer_addr() {
            Ok(_) => {
                self.connected = true;
                debug!(backend_addr = %self.addr, "Backend connected");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(e) => Err(ProxyError::connection("connect", e)),
        }
    }
}

impl<S> BackendConnection<S> {
    /// Wrap an already connected stream.
    pub fn from_connected(stream: S, addr: SocketAddr) -> Self {
        Self {
            stream,
            addr,
            connected: true,
        }
    }

    #[cfg(test)]
    pub(crate) fn connecting(stream: S, addr: SocketAddr) -> Self {
        Self {
            stream,
            addr,
            connected: false,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Whether the connect has completed.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn stream(&self) -> &S {
        &self.stream
    }
}

impl<S: Read + Write> BackendConnection<S> {
    /// Write as much of `bytes` as the socket accepts.
    ///
    /// A short count (including 0 when the socket is full) is a normal
    /// outcome, not an error.
    pub fn send(&mut self, bytes: &[u8]) -> Result<usize, ProxyError> {
        write_some(&mut self.stream, bytes).map_err(|e| ProxyError::connection("send", e))
    }

    /// Read up to `buf.len()` bytes.
    pub fn receive(&mut self, buf: &mut [u8]) -> Result<ReadOutcome, ProxyError> {
        read_some(&mut self.stream, buf).map_err(|e| ProxyError::connection("receive", e))
    }
}

impl<S: AsRawFd> AsRawFd for BackendConnection<S> {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}
