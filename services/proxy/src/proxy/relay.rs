//! Per-client relay state machine.
//!
//! A [`RelayConnection`] pairs one accepted client socket with its own
//! [`BackendConnection`]. The current [`RelayState`] decides which of the
//! four socket operations may run next:
//!
//! ```text
//!            read_request              send_request
//! ClientRead ------------> BackendWrite ------------> BackendRead
//!     ^  |                                                 |
//!     |  | receive_response / relay     receive_response   |
//!     |  v                                                 |
//!     +-- ClientWrite <------------------------------------+
//!        send_response
//! ```
//!
//! Any EOF or I/O error moves the connection to `Disconnected`, after which
//! nothing runs and the event loop sweeps it.

use std::fmt;
use std::io::{Read, Write};
use std::net::{IpAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};

use tracing::trace;

use super::backend::BackendConnection;
use super::nonblocking::{read_some, write_some, ReadOutcome};
use crate::error::ProxyError;

/// Default size of a single read.
pub const DEFAULT_CHUNK_SIZE: usize = 8192;

/// Process-unique connection identifier, assigned in accept order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hands out strictly increasing connection IDs, starting at 1.
#[derive(Debug, Default)]
pub struct ConnectionIds {
    last: u64,
}

impl ConnectionIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> ConnectionId {
        self.last += 1;
        ConnectionId(self.last)
    }
}

/// Relay state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayState {
    /// Waiting for a client request (or an unsolicited backend message).
    ClientRead,
    /// Buffered response bytes are waiting to be written to the client.
    ClientWrite,
    /// The request went out; waiting for the backend response.
    BackendRead,
    /// Buffered request bytes are waiting to be written to the backend.
    BackendWrite,
    /// Terminal.
    Disconnected,
}

impl RelayState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayState::ClientRead => "client_read",
            RelayState::ClientWrite => "client_write",
            RelayState::BackendRead => "backend_read",
            RelayState::BackendWrite => "backend_write",
            RelayState::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The two sockets of a relay pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Leg {
    Client,
    Backend,
}

/// A relay operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    ReadRequest,
    SendRequest,
    ReceiveResponse,
    SendResponse,
    Relay,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::ReadRequest => "read_request",
            Step::SendRequest => "send_request",
            Step::ReceiveResponse => "receive_response",
            Step::SendResponse => "send_response",
            Step::Relay => "relay",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last known readiness of one socket.
///
/// Set from multiplexer events, cleared when an operation hits
/// `WouldBlock`. The sockets are registered edge-triggered, so this cache is
/// the only record that a socket is still ready.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
}

/// A completed client request, handed to the query logger.
#[derive(Debug, Clone, Copy)]
pub struct CompletedRequest<'a> {
    pub connection_id: ConnectionId,
    pub peer_ip: IpAddr,
    pub payload: &'a [u8],
}

/// One client and its dedicated backend connection.
#[derive(Debug)]
pub struct RelayConnection<C = TcpStream, S = TcpStream> {
    id: ConnectionId,
    client: C,
    client_ip: IpAddr,
    backend: BackendConnection<S>,
    state: RelayState,
    /// Bytes of the leg currently in flight; empty otherwise.
    buffer: Vec<u8>,
    /// Receive scratch space, one chunk long.
    scratch: Vec<u8>,
    client_ready: Readiness,
    backend_ready: Readiness,
}

impl<C, S> RelayConnection<C, S> {
    pub fn new(
        id: ConnectionId,
        client: C,
        client_ip: IpAddr,
        backend: BackendConnection<S>,
        chunk_size: usize,
    ) -> Self {
        Self {
            id,
            client,
            client_ip,
            backend,
            state: RelayState::ClientRead,
            buffer: Vec::new(),
            scratch: vec![0u8; chunk_size.max(1)],
            client_ready: Readiness::default(),
            backend_ready: Readiness::default(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn client_ip(&self) -> IpAddr {
        self.client_ip
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    /// Bytes currently held for the in-flight leg.
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn backend(&self) -> &BackendConnection<S> {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut BackendConnection<S> {
        &mut self.backend
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn is_connected(&self) -> bool {
        self.state != RelayState::Disconnected
    }

    /// Force the terminal state; the buffer is discarded.
    pub fn disconnect(&mut self) {
        self.state = RelayState::Disconnected;
        self.buffer.clear();
    }

    pub fn ready_for_read(&self) -> bool {
        matches!(self.state, RelayState::ClientRead | RelayState::BackendRead)
    }

    pub fn ready_for_write(&self) -> bool {
        self.state == RelayState::ClientWrite
    }

    pub fn ready_to_query_server(&self) -> bool {
        self.state == RelayState::BackendWrite
    }

    pub fn ready_to_read_server_resp(&self) -> bool {
        matches!(self.state, RelayState::BackendRead | RelayState::ClientRead)
    }

    /// Record readiness reported for one leg.
    pub fn mark_ready(&mut self, leg: Leg, readiness: Readiness) {
        let cached = match leg {
            Leg::Client => &mut self.client_ready,
            Leg::Backend => &mut self.backend_ready,
        };
        cached.readable |= readiness.readable;
        cached.writable |= readiness.writable;
    }

    pub fn readiness(&self, leg: Leg) -> Readiness {
        match leg {
            Leg::Client => self.client_ready,
            Leg::Backend => self.backend_ready,
        }
    }

    /// Pick the next operation, if any can run.
    ///
    /// `ClientRead` allows both reading the client and reading the backend.
    /// The leg whose descriptor fired decides which goes first; the state
    /// alone never does. A backend read becomes the zero-copy
    /// [`Step::Relay`] when the client is known to be writable.
    pub fn next_step(&self, fired: Leg) -> Option<Step> {
        let backend_up = self.backend.is_connected();
        let client_read = self.client_ready.readable;
        let backend_read = backend_up && self.backend_ready.readable;
        let response_step = if self.client_ready.writable {
            Step::Relay
        } else {
            Step::ReceiveResponse
        };

        match self.state {
            RelayState::ClientRead => match fired {
                Leg::Client if client_read => Some(Step::ReadRequest),
                Leg::Backend if backend_read => Some(response_step),
                _ if client_read => Some(Step::ReadRequest),
                _ if backend_read => Some(response_step),
                _ => None,
            },
            RelayState::BackendWrite if backend_up && self.backend_ready.writable => {
                Some(Step::SendRequest)
            }
            RelayState::BackendRead if backend_read => Some(response_step),
            RelayState::ClientWrite if self.client_ready.writable => Some(Step::SendResponse),
            _ => None,
        }
    }

    /// The request gathered by the last `read_request`.
    pub fn completed_request(&self) -> CompletedRequest<'_> {
        CompletedRequest {
            connection_id: self.id,
            peer_ip: self.client_ip,
            payload: &self.buffer,
        }
    }

    fn expect_state(&self, step: Step, allowed: bool) -> Result<(), ProxyError> {
        if allowed {
            Ok(())
        } else {
            Err(ProxyError::InvalidState {
                step,
                state: self.state,
            })
        }
    }

    fn transition(&mut self, to: RelayState) {
        trace!(
            connection_id = %self.id,
            from = %self.state,
            to = %to,
            "Relay state change"
        );
        self.state = to;
    }

    fn fail(&mut self, err: ProxyError) -> ProxyError {
        self.disconnect();
        err
    }
}

impl<C: Read + Write, S: Read + Write> RelayConnection<C, S> {
    /// Run `step`, returning the number of bytes it moved.
    pub fn perform(&mut self, step: Step) -> Result<usize, ProxyError> {
        match step {
            Step::ReadRequest => self.read_request(),
            Step::SendRequest => self.send_request(),
            Step::ReceiveResponse => self.receive_response(),
            Step::SendResponse => self.send_response(),
            Step::Relay => self.relay(),
        }
    }

    /// Drain the client socket into the buffer.
    ///
    /// Reads chunk by chunk until a short read. Moves to `BackendWrite` once
    /// anything was read, or to `Disconnected` on EOF with nothing read.
    pub fn read_request(&mut self) -> Result<usize, ProxyError> {
        self.expect_state(Step::ReadRequest, self.state == RelayState::ClientRead)?;

        let chunk = self.scratch.len();
        let mut total = 0;
        loop {
            match read_some(&mut self.client, &mut self.scratch) {
                Ok(ReadOutcome::Data(n)) => {
                    self.buffer.extend_from_slice(&self.scratch[..n]);
                    total += n;
                    if n < chunk {
                        break;
                    }
                }
                // A later read sees the EOF again.
                Ok(ReadOutcome::Eof) if total > 0 => break,
                Ok(ReadOutcome::Eof) => {
                    self.transition(RelayState::Disconnected);
                    return Ok(0);
                }
                Ok(ReadOutcome::WouldBlock) => {
                    self.client_ready.readable = false;
                    break;
                }
                Err(e) => return Err(self.fail(ProxyError::ClientIo(e))),
            }
        }

        if total > 0 {
            self.transition(RelayState::BackendWrite);
        }
        Ok(total)
    }

    /// Write the buffered request to the backend.
    ///
    /// A partial write keeps the unsent suffix and stays in `BackendWrite`.
    pub fn send_request(&mut self) -> Result<usize, ProxyError> {
        self.expect_state(Step::SendRequest, self.state == RelayState::BackendWrite)?;

        let sent = match self.backend.send(&self.buffer) {
            Ok(n) => n,
            Err(e) => return Err(self.fail(e)),
        };
        self.buffer.drain(..sent);

        if self.buffer.is_empty() {
            self.transition(RelayState::BackendRead);
        } else if sent == 0 {
            self.backend_ready.writable = false;
        }
        Ok(sent)
    }

    /// Drain the backend socket into the buffer.
    ///
    /// Valid from `BackendRead` and from `ClientRead`, where the backend may
    /// speak unprompted. Moves to `ClientWrite` once anything was read.
    pub fn receive_response(&mut self) -> Result<usize, ProxyError> {
        self.expect_state(Step::ReceiveResponse, self.ready_to_read_server_resp())?;

        let chunk = self.scratch.len();
        let mut total = 0;
        loop {
            match self.backend.receive(&mut self.scratch) {
                Ok(ReadOutcome::Data(n)) => {
                    self.buffer.extend_from_slice(&self.scratch[..n]);
                    total += n;
                    if n < chunk {
                        break;
                    }
                }
                Ok(ReadOutcome::Eof) if total > 0 || !self.buffer.is_empty() => break,
                Ok(ReadOutcome::Eof) => {
                    self.transition(RelayState::Disconnected);
                    return Ok(0);
                }
                Ok(ReadOutcome::WouldBlock) => {
                    self.backend_ready.readable = false;
                    break;
                }
                Err(e) => return Err(self.fail(e)),
            }
        }

        if !self.buffer.is_empty() {
            self.transition(RelayState::ClientWrite);
        }
        Ok(total)
    }

    /// Write the buffered response to the client.
    ///
    /// A partial write keeps the unsent suffix and stays in `ClientWrite`.
    pub fn send_response(&mut self) -> Result<usize, ProxyError> {
        self.expect_state(Step::SendResponse, self.state == RelayState::ClientWrite)?;

        let sent = match write_some(&mut self.client, &self.buffer) {
            Ok(n) => n,
            Err(e) => return Err(self.fail(ProxyError::ClientIo(e))),
        };
        self.buffer.drain(..sent);

        if self.buffer.is_empty() {
            self.transition(RelayState::ClientRead);
        } else if sent == 0 {
            self.client_ready.writable = false;
        }
        Ok(sent)
    }

    /// Zero-copy path: forward backend bytes straight to the client.
    ///
    /// Each chunk read from the backend is written to the client directly.
    /// If the client takes less than a full chunk, the remainder is buffered.
    /// The connection then waits in `ClientWrite` when the backend chunk was
    /// short, or keeps draining the backend through `receive_response`.
    pub fn relay(&mut self) -> Result<usize, ProxyError> {
        self.expect_state(Step::Relay, self.ready_to_read_server_resp())?;

        let chunk = self.scratch.len();
        let mut forwarded = 0;
        loop {
            let n = match self.backend.receive(&mut self.scratch) {
                Ok(ReadOutcome::Data(n)) => n,
                Ok(ReadOutcome::Eof) if forwarded > 0 => break,
                Ok(ReadOutcome::Eof) => {
                    self.transition(RelayState::Disconnected);
                    return Ok(0);
                }
                Ok(ReadOutcome::WouldBlock) => {
                    self.backend_ready.readable = false;
                    break;
                }
                Err(e) => return Err(self.fail(e)),
            };

            let written = match write_some(&mut self.client, &self.scratch[..n]) {
                Ok(w) => w,
                Err(e) => return Err(self.fail(ProxyError::ClientIo(e))),
            };
            forwarded += written;

            if written < n {
                if written == 0 {
                    self.client_ready.writable = false;
                }
                self.buffer.extend_from_slice(&self.scratch[written..n]);
                if n < chunk {
                    self.transition(RelayState::ClientWrite);
                    return Ok(forwarded + (n - written));
                }
                let drained = self.receive_response()?;
                return Ok(forwarded + (n - written) + drained);
            }

            if n < chunk {
                break;
            }
        }

        if forwarded > 0 {
            self.transition(RelayState::ClientRead);
        }
        Ok(forwarded)
    }
}

impl<C: AsRawFd, S: AsRawFd> RelayConnection<C, S> {
    pub fn client_fd(&self) -> RawFd {
        self.client.as_raw_fd()
    }

    pub fn backend_fd(&self) -> RawFd {
        self.backend.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddr};

    use proptest::prelude::*;
    use rstest::rstest;

    use super::*;
    use crate::proxy::testing::{Inbound, MockStream, Outbound};

    const CHUNK: usize = 8;

    fn relay_pair() -> (RelayConnection<MockStream, MockStream>, MockStream, MockStream) {
        let client = MockStream::default();
        let backend = MockStream::default();
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 5432));
        let mut ids = ConnectionIds::new();
        let conn = RelayConnection::new(
            ids.next_id(),
            client.clone(),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)),
            BackendConnection::from_connected(backend.clone(), addr),
            CHUNK,
        );
        (conn, client, backend)
    }

    fn both_ready(conn: &mut RelayConnection<MockStream, MockStream>) {
        let ready = Readiness {
            readable: true,
            writable: true,
        };
        conn.mark_ready(Leg::Client, ready);
        conn.mark_ready(Leg::Backend, ready);
    }

    #[test]
    fn ids_strictly_increase() {
        let mut ids = ConnectionIds::new();
        let first = ids.next_id();
        let second = ids.next_id();
        let third = ids.next_id();
        assert_eq!(first.get(), 1);
        assert!(first < second && second < third);
    }

    #[test]
    fn short_request_round_trip() {
        let (mut conn, client, backend) = relay_pair();
        client.push_data(b"Q\0\0\0\x04");
        client.push(Inbound::Eof);

        assert_eq!(conn.read_request().unwrap(), 5);
        assert_eq!(conn.state(), RelayState::BackendWrite);
        assert_eq!(conn.completed_request().payload, b"Q\0\0\0\x04");

        assert_eq!(conn.send_request().unwrap(), 5);
        assert_eq!(conn.state(), RelayState::BackendRead);
        assert!(conn.buffer().is_empty());
        assert_eq!(backend.written(), b"Q\0\0\0\x04");

        backend.push_data(b"reply");
        assert_eq!(conn.receive_response().unwrap(), 5);
        assert_eq!(conn.state(), RelayState::ClientWrite);

        assert_eq!(conn.send_response().unwrap(), 5);
        assert_eq!(conn.state(), RelayState::ClientRead);
        assert_eq!(client.written(), b"reply");

        // The client closed after its request.
        assert_eq!(conn.read_request().unwrap(), 0);
        assert_eq!(conn.state(), RelayState::Disconnected);
    }

    #[test]
    fn request_drains_full_chunks_until_short_read() {
        let (mut conn, client, _backend) = relay_pair();
        client.push_data(b"0123456789abcdefXYZ");

        assert_eq!(conn.read_request().unwrap(), 19);
        assert_eq!(conn.buffer(), b"0123456789abcdefXYZ");
        assert_eq!(conn.state(), RelayState::BackendWrite);
    }

    #[test]
    fn request_exactly_one_chunk_stops_on_would_block() {
        let (mut conn, client, _backend) = relay_pair();
        client.push_data(b"01234567");
        conn.mark_ready(
            Leg::Client,
            Readiness {
                readable: true,
                writable: false,
            },
        );

        assert_eq!(conn.read_request().unwrap(), 8);
        assert_eq!(conn.state(), RelayState::BackendWrite);
        assert!(!conn.readiness(Leg::Client).readable);
    }

    #[test]
    fn spurious_wakeup_keeps_state() {
        let (mut conn, _client, _backend) = relay_pair();
        assert_eq!(conn.read_request().unwrap(), 0);
        assert_eq!(conn.state(), RelayState::ClientRead);
    }

    #[test]
    fn partial_request_write_keeps_suffix() {
        let (mut conn, client, backend) = relay_pair();
        client.push_data(b"abcdef");
        conn.read_request().unwrap();

        backend.limit(Outbound::Accept(2));
        assert_eq!(conn.send_request().unwrap(), 2);
        assert_eq!(conn.state(), RelayState::BackendWrite);
        assert_eq!(conn.buffer(), b"cdef");

        backend.limit(Outbound::Block);
        assert_eq!(conn.send_request().unwrap(), 0);
        assert_eq!(conn.state(), RelayState::BackendWrite);
        assert!(!conn.readiness(Leg::Backend).writable);

        assert_eq!(conn.send_request().unwrap(), 4);
        assert_eq!(conn.state(), RelayState::BackendRead);
        assert_eq!(backend.written(), b"abcdef");
    }

    #[test]
    fn partial_response_write_keeps_suffix() {
        let (mut conn, client, backend) = relay_pair();
        client.push_data(b"Q");
        conn.read_request().unwrap();
        conn.send_request().unwrap();

        backend.push_data(b"response");
        backend.push_data(b"-tail");
        conn.receive_response().unwrap();
        assert_eq!(conn.buffer(), b"response-tail");

        client.limit(Outbound::Accept(3));
        conn.send_response().unwrap();
        assert_eq!(conn.state(), RelayState::ClientWrite);
        conn.send_response().unwrap();
        assert_eq!(conn.state(), RelayState::ClientRead);
        assert_eq!(client.written(), b"response-tail");
    }

    #[test]
    fn backend_may_speak_while_idle() {
        let (mut conn, client, backend) = relay_pair();
        backend.push_data(b"notice");

        assert_eq!(conn.receive_response().unwrap(), 6);
        assert_eq!(conn.state(), RelayState::ClientWrite);
        conn.send_response().unwrap();
        assert_eq!(client.written(), b"notice");
    }

    #[test]
    fn backend_eof_disconnects_without_error() {
        let (mut conn, client, backend) = relay_pair();
        client.push_data(b"X\0\0\0\x04");
        conn.read_request().unwrap();
        conn.send_request().unwrap();

        backend.push(Inbound::Eof);
        assert_eq!(conn.receive_response().unwrap(), 0);
        assert_eq!(conn.state(), RelayState::Disconnected);
    }

    #[test]
    fn client_read_error_disconnects() {
        let (mut conn, client, _backend) = relay_pair();
        client.push(Inbound::Fail);

        let err = conn.read_request().unwrap_err();
        assert!(matches!(err, ProxyError::ClientIo(_)));
        assert_eq!(conn.state(), RelayState::Disconnected);
    }

    #[test]
    fn backend_write_error_disconnects() {
        let (mut conn, client, backend) = relay_pair();
        client.push_data(b"Q");
        conn.read_request().unwrap();

        backend.limit(Outbound::Fail);
        let err = conn.send_request().unwrap_err();
        assert!(matches!(err, ProxyError::Connection { .. }));
        assert_eq!(conn.state(), RelayState::Disconnected);
        assert!(conn.buffer().is_empty());
    }

    #[test]
    fn client_write_error_disconnects() {
        let (mut conn, client, backend) = relay_pair();
        backend.push_data(b"data");
        conn.receive_response().unwrap();

        client.limit(Outbound::Fail);
        let err = conn.send_response().unwrap_err();
        assert!(matches!(err, ProxyError::ClientIo(_)));
        assert_eq!(conn.state(), RelayState::Disconnected);
    }

    #[test]
    fn operations_reject_wrong_state() {
        let (mut conn, client, backend) = relay_pair();
        client.push_data(b"Q");
        backend.push_data(b"unused");

        let err = conn.send_request().unwrap_err();
        assert!(matches!(
            err,
            ProxyError::InvalidState {
                step: Step::SendRequest,
                state: RelayState::ClientRead
            }
        ));
        assert_eq!(conn.state(), RelayState::ClientRead);
        assert!(conn.send_response().is_err());

        conn.read_request().unwrap();
        assert!(conn.read_request().is_err());
        assert!(conn.receive_response().is_err());
        assert!(conn.relay().is_err());
        assert_eq!(conn.state(), RelayState::BackendWrite);
        assert_eq!(conn.buffer(), b"Q");
    }

    #[test]
    fn disconnected_accepts_nothing() {
        let (mut conn, _client, _backend) = relay_pair();
        both_ready(&mut conn);
        conn.disconnect();

        assert_eq!(conn.next_step(Leg::Client), None);
        assert_eq!(conn.next_step(Leg::Backend), None);
        assert!(conn.read_request().is_err());
        assert!(!conn.is_connected());
    }

    #[test]
    fn relay_forwards_without_buffering() {
        let (mut conn, client, backend) = relay_pair();
        client.push_data(b"Q");
        conn.read_request().unwrap();
        conn.send_request().unwrap();

        backend.push_data(b"0123456789");
        assert_eq!(conn.relay().unwrap(), 10);
        assert_eq!(conn.state(), RelayState::ClientRead);
        assert!(conn.buffer().is_empty());
        assert_eq!(client.written(), b"0123456789");
    }

    #[test]
    fn relay_buffers_remainder_when_client_is_slow() {
        let (mut conn, client, backend) = relay_pair();
        client.push_data(b"Q");
        conn.read_request().unwrap();
        conn.send_request().unwrap();

        // Second chunk is short, so the backend is drained after it.
        backend.push_data(b"01234567");
        backend.push_data(b"89ab");
        client.limit(Outbound::Accept(8));
        client.limit(Outbound::Accept(1));

        conn.relay().unwrap();
        assert_eq!(conn.state(), RelayState::ClientWrite);
        assert_eq!(conn.buffer(), b"9ab");

        conn.mark_ready(
            Leg::Client,
            Readiness {
                readable: false,
                writable: true,
            },
        );
        assert_eq!(conn.next_step(Leg::Client), Some(Step::SendResponse));
        assert_eq!(conn.send_response().unwrap(), 3);
        assert_eq!(conn.state(), RelayState::ClientRead);
        assert_eq!(client.written(), b"0123456789ab");
    }

    #[test]
    fn relay_keeps_draining_after_full_chunk_short_write() {
        let (mut conn, client, backend) = relay_pair();
        backend.push_data(b"01234567");
        backend.push_data(b"89abcdefghij");
        client.limit(Outbound::Block);

        conn.relay().unwrap();
        assert_eq!(conn.state(), RelayState::ClientWrite);
        assert_eq!(conn.buffer(), b"0123456789abcdefghij");
        assert!(!conn.readiness(Leg::Client).writable);

        conn.send_response().unwrap();
        assert_eq!(client.written(), b"0123456789abcdefghij");
    }

    #[test]
    fn relay_on_backend_eof_disconnects() {
        let (mut conn, _client, backend) = relay_pair();
        backend.push(Inbound::Eof);

        assert_eq!(conn.relay().unwrap(), 0);
        assert_eq!(conn.state(), RelayState::Disconnected);
    }

    #[test]
    fn relay_client_error_disconnects() {
        let (mut conn, client, backend) = relay_pair();
        backend.push_data(b"abc");
        client.limit(Outbound::Fail);

        assert!(matches!(conn.relay(), Err(ProxyError::ClientIo(_))));
        assert_eq!(conn.state(), RelayState::Disconnected);
    }

    #[rstest]
    #[case(RelayState::ClientRead, true, false, true, false)]
    #[case(RelayState::BackendRead, true, false, false, true)]
    #[case(RelayState::ClientWrite, false, true, false, false)]
    #[case(RelayState::BackendWrite, false, false, false, false)]
    #[case(RelayState::Disconnected, false, false, false, false)]
    fn readiness_predicates(
        #[case] state: RelayState,
        #[case] for_read: bool,
        #[case] for_write: bool,
        #[case] client_read_only: bool,
        #[case] backend_read_only: bool,
    ) {
        let (mut conn, _client, _backend) = relay_pair();
        conn.state = state;
        assert_eq!(conn.ready_for_read(), for_read);
        assert_eq!(conn.ready_for_write(), for_write);
        assert_eq!(conn.ready_to_query_server(), state == RelayState::BackendWrite);
        assert_eq!(
            conn.ready_to_read_server_resp(),
            client_read_only || backend_read_only
        );
    }

    #[rstest]
    #[case(Leg::Client, true, true, false, Some(Step::ReadRequest))]
    #[case(Leg::Backend, true, true, false, Some(Step::ReceiveResponse))]
    #[case(Leg::Backend, true, true, true, Some(Step::Relay))]
    #[case(Leg::Client, false, true, true, Some(Step::Relay))]
    #[case(Leg::Backend, true, false, false, Some(Step::ReadRequest))]
    #[case(Leg::Client, false, false, true, None)]
    fn client_read_is_disambiguated_by_fired_leg(
        #[case] fired: Leg,
        #[case] client_readable: bool,
        #[case] backend_readable: bool,
        #[case] client_writable: bool,
        #[case] expected: Option<Step>,
    ) {
        let (mut conn, _client, _backend) = relay_pair();
        conn.mark_ready(
            Leg::Client,
            Readiness {
                readable: client_readable,
                writable: client_writable,
            },
        );
        conn.mark_ready(
            Leg::Backend,
            Readiness {
                readable: backend_readable,
                writable: false,
            },
        );
        assert_eq!(conn.state(), RelayState::ClientRead);
        assert_eq!(conn.next_step(fired), expected);
    }

    #[test]
    fn backend_steps_wait_for_connect() {
        let client = MockStream::default();
        let mut conn = RelayConnection::new(
            ConnectionIds::new().next_id(),
            client.clone(),
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            BackendConnection::connecting(
                MockStream::default(),
                SocketAddr::from((Ipv4Addr::LOCALHOST, 5432)),
            ),
            CHUNK,
        );
        both_ready(&mut conn);
        assert_eq!(conn.next_step(Leg::Backend), Some(Step::ReadRequest));

        client.push_data(b"Q");
        conn.read_request().unwrap();
        assert_eq!(conn.next_step(Leg::Backend), None);
    }

    /// Forward `data` as one request, capping each backend write by `caps`.
    /// Returns what the backend saw.
    fn forward_request(data: &[u8], caps: &[usize]) -> Vec<u8> {
        let (mut conn, client, backend) = relay_pair();
        client.push_data(data);
        conn.read_request().unwrap();
        for cap in caps {
            backend.limit(Outbound::Accept(*cap));
        }
        while conn.state() == RelayState::BackendWrite {
            conn.send_request().unwrap();
        }
        backend.written()
    }

    proptest! {
        #[test]
        fn request_bytes_survive_partial_writes(
            data in proptest::collection::vec(any::<u8>(), 1..200),
            caps in proptest::collection::vec(0usize..16, 0..40),
        ) {
            prop_assert_eq!(forward_request(&data, &caps), data);
        }

        #[test]
        fn response_bytes_survive_fast_path(
            data in proptest::collection::vec(any::<u8>(), 1..200),
            caps in proptest::collection::vec(0usize..16, 0..40),
        ) {
            let (mut conn, client, backend) = relay_pair();
            backend.push_data(&data);
            for cap in &caps {
                client.limit(Outbound::Accept(*cap));
            }

            conn.relay().unwrap();
            while conn.state() != RelayState::ClientRead {
                match conn.state() {
                    RelayState::ClientWrite => { conn.send_response().unwrap(); }
                    other => prop_assert!(false, "unexpected state {}", other),
                }
            }
            prop_assert_eq!(client.written(), data);
        }
    }
}
