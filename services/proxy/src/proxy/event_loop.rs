//! Single-threaded readiness loop.
//!
//! The loop owns the listening socket, the epoll instance and every relay
//! connection. Each iteration waits for readiness, dispatches every event to
//! the connection that owns the descriptor, and then sweeps connections that
//! reached `Disconnected`.
//!
//! Client and backend sockets are registered edge-triggered for both
//! directions. Each connection caches the readiness it has seen (see
//! [`Readiness`]) and is driven until no step can make progress.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use tracing::{debug, info, trace, warn};

use super::backend::BackendConnection;
use super::registry::Registry;
use super::relay::{
    ConnectionId, ConnectionIds, Leg, Readiness, RelayConnection, RelayState, Step,
};
use crate::config::{FaultPolicy, ProxyConfig};
use crate::error::ProxyError;
use crate::query_log::MessageLogger;
use crate::shutdown::{ShutdownSignals, StopHandle};

/// Counters for one event loop.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProxyStats {
    /// Clients accepted.
    pub connections_accepted: u64,
    /// Connections swept after reaching `Disconnected`.
    pub connections_closed: u64,
    /// Connections dropped because of a connection-scoped error.
    pub connections_failed: u64,
    /// Client requests read and handed to the query logger.
    pub requests: u64,
    /// Bytes read from clients.
    pub bytes_from_clients: u64,
    /// Bytes read from the backend.
    pub bytes_from_backend: u64,
}

/// The proxy event loop.
pub struct EventLoop<L> {
    config: ProxyConfig,
    listener: TcpListener,
    epoll: Epoll,
    registry: Registry<RelayConnection>,
    ids: ConnectionIds,
    logger: L,
    stop: StopHandle,
    signals: Option<ShutdownSignals>,
    events: Vec<EpollEvent>,
    stats: ProxyStats,
}

impl<L: MessageLogger> EventLoop<L> {
    /// Bind the listening socket and set up the multiplexer.
    pub fn init(config: ProxyConfig, logger: L) -> Result<Self, ProxyError> {
        let listener =
            TcpListener::bind(config.listen_addr).map_err(|e| ProxyError::init("bind", e))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| ProxyError::init("listener non-blocking mode", e))?;

        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)
            .map_err(|e| ProxyError::init("epoll create", e))?;
        let listen_flags = EpollFlags::EPOLLIN
            | EpollFlags::EPOLLRDHUP
            | EpollFlags::EPOLLERR
            | EpollFlags::EPOLLHUP;
        epoll
            .add(&listener, event_for(listen_flags, listener.as_raw_fd()))
            .map_err(|e| ProxyError::init("register listener", e))?;

        let stop = StopHandle::new().map_err(|e| ProxyError::init("stop waker", e))?;
        epoll
            .add(&stop, event_for(EpollFlags::EPOLLIN, stop.as_fd().as_raw_fd()))
            .map_err(|e| ProxyError::init("register stop waker", e))?;

        let local_addr = listener
            .local_addr()
            .map_err(|e| ProxyError::init("listener address", e))?;
        info!(
            listen_addr = %local_addr,
            backend_addr = %config.backend_addr,
            fault_policy = ?config.fault_policy,
            "Proxy listening"
        );

        Ok(Self {
            events: vec![EpollEvent::empty(); config.max_events.max(1)],
            config,
            listener,
            epoll,
            registry: Registry::new(),
            ids: ConnectionIds::new(),
            logger,
            stop,
            signals: None,
            stats: ProxyStats::default(),
        })
    }

    /// Stop when one of the shutdown signals arrives.
    pub fn with_shutdown_signals(mut self, signals: ShutdownSignals) -> Result<Self, ProxyError> {
        self.epoll
            .add(
                &signals,
                event_for(EpollFlags::EPOLLIN, signals.as_fd().as_raw_fd()),
            )
            .map_err(|e| ProxyError::init("register signalfd", e))?;
        self.signals = Some(signals);
        Ok(self)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Request the loop to stop after the current iteration.
    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn stats(&self) -> ProxyStats {
        self.stats
    }

    /// Number of live relay connections.
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    pub fn logger(&self) -> &L {
        &self.logger
    }

    /// Run until stopped.
    pub fn run(&mut self) -> Result<(), ProxyError> {
        while self.stop.is_running() {
            self.turn(None)?;
        }
        info!(
            accepted = self.stats.connections_accepted,
            closed = self.stats.connections_closed,
            failed = self.stats.connections_failed,
            active = self.registry.len(),
            requests = self.stats.requests,
            bytes_from_clients = self.stats.bytes_from_clients,
            bytes_from_backend = self.stats.bytes_from_backend,
            "Event loop stopped"
        );
        Ok(())
    }

    /// One iteration: wait, dispatch every event, sweep.
    ///
    /// `None` waits without a timeout. Returns the number of events handled.
    pub fn turn(&mut self, timeout: Option<Duration>) -> Result<usize, ProxyError> {
        let timeout = match timeout {
            None => EpollTimeout::NONE,
            Some(d) => EpollTimeout::from(u16::try_from(d.as_millis()).unwrap_or(u16::MAX)),
        };

        let ready = match self.epoll.wait(&mut self.events, timeout) {
            Ok(n) => n,
            Err(Errno::EINTR) => return Ok(0),
            Err(e) => return Err(ProxyError::processing("epoll wait", e)),
        };

        for i in 0..ready {
            let event = self.events[i];
            self.dispatch(event)?;
        }

        self.sweep_disconnected()?;
        Ok(ready)
    }

    fn dispatch(&mut self, event: EpollEvent) -> Result<(), ProxyError> {
        let fd = event.data() as RawFd;
        let flags = event.events();

        if fd == self.listener.as_raw_fd() {
            if flags.contains(EpollFlags::EPOLLIN) {
                return self.accept_new_clients();
            }
            if flags.intersects(EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP | EpollFlags::EPOLLRDHUP)
            {
                let source = self
                    .listener
                    .take_error()
                    .ok()
                    .flatten()
                    .unwrap_or_else(|| io::Error::other("listening socket hung up"));
                return Err(ProxyError::processing("listening socket fault", source));
            }
            return Ok(());
        }

        if fd == self.stop.as_fd().as_raw_fd() {
            self.stop.drain();
            return Ok(());
        }

        if let Some(signals) = self.signals.as_mut() {
            if fd == signals.as_fd().as_raw_fd() {
                while let Some(signal) = signals
                    .take_pending()
                    .map_err(|e| ProxyError::processing("read signalfd", e))?
                {
                    info!(signal = ?signal, "Signal received, stopping the server");
                    self.stop.stop();
                }
                return Ok(());
            }
        }

        let Some((id, leg)) = self.registry.resolve(fd) else {
            trace!(fd, "Event for unknown descriptor");
            return Ok(());
        };

        let result = self.service(id, leg, flags);
        if let Err(err) = result {
            if err.is_connection_scoped() && self.config.fault_policy == FaultPolicy::Isolate {
                warn!(
                    connection_id = %id,
                    reason = err.reason_code(),
                    error = %err,
                    "Connection failed, disconnecting"
                );
                if let Some(relay) = self.registry.get_mut(id) {
                    relay.disconnect();
                }
                self.stats.connections_failed += 1;
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    /// Record readiness for one leg and drive the connection.
    fn service(
        &mut self,
        id: ConnectionId,
        leg: Leg,
        flags: EpollFlags,
    ) -> Result<(), ProxyError> {
        let Some(relay) = self.registry.get_mut(id) else {
            return Ok(());
        };
        if !relay.is_connected() {
            return Ok(());
        }

        if leg == Leg::Backend && !relay.backend().is_connected() {
            if !relay.backend_mut().finish_connect()? {
                return Ok(());
            }
            debug!(
                connection_id = %id,
                backend_addr = %relay.backend().addr(),
                "Backend leg ready"
            );
        }

        let errored = flags.intersects(EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP);
        relay.mark_ready(
            leg,
            Readiness {
                readable: errored
                    || flags.intersects(EpollFlags::EPOLLIN | EpollFlags::EPOLLRDHUP),
                writable: errored || flags.contains(EpollFlags::EPOLLOUT),
            },
        );

        drive(relay, leg, &mut self.logger, &mut self.stats)
    }

    /// Accept every pending client.
    ///
    /// Each client gets its own backend connection, started without
    /// blocking; its descriptors are registered right away.
    pub fn accept_new_clients(&mut self) -> Result<(), ProxyError> {
        loop {
            let (stream, peer) = match self.listener.accept() {
                Ok(pair) => pair,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e)
                    if e.kind() == io::ErrorKind::Interrupted
                        || e.kind() == io::ErrorKind::ConnectionAborted =>
                {
                    continue
                }
                Err(e) => return Err(ProxyError::init("accept", e)),
            };
            self.stats.connections_accepted += 1;
            self.admit(stream, peer)?;
        }
    }

    fn admit(&mut self, stream: TcpStream, peer: SocketAddr) -> Result<(), ProxyError> {
        if let Err(e) = stream.set_nonblocking(true) {
            return self.reject(peer, ProxyError::ClientIo(e));
        }
        let backend = match BackendConnection::open(self.config.backend_addr) {
            Ok(backend) => backend,
            Err(e) => return self.reject(peer, e),
        };

        let id = self.ids.next_id();
        let relay = RelayConnection::new(id, stream, peer.ip(), backend, self.config.chunk_size);
        let (client_fd, backend_fd) = (relay.client_fd(), relay.backend_fd());

        let interest = EpollFlags::EPOLLIN
            | EpollFlags::EPOLLOUT
            | EpollFlags::EPOLLRDHUP
            | EpollFlags::EPOLLET;
        self.epoll
            .add(relay.client(), event_for(interest, client_fd))
            .map_err(|e| ProxyError::processing("register client socket", e))?;
        self.epoll
            .add(relay.backend().stream(), event_for(interest, backend_fd))
            .map_err(|e| ProxyError::processing("register backend socket", e))?;

        if self
            .registry
            .insert(id, client_fd, backend_fd, relay)
            .is_err()
        {
            return Err(ProxyError::processing(
                "registry insert",
                io::Error::other(format!("descriptor already registered ({})", id)),
            ));
        }

        info!(
            connection_id = %id,
            peer_addr = %peer,
            active = self.registry.len(),
            "Client connected"
        );
        Ok(())
    }

    /// Drop a client that could not be set up.
    fn reject(&mut self, peer: SocketAddr, err: ProxyError) -> Result<(), ProxyError> {
        match self.config.fault_policy {
            FaultPolicy::Isolate => {
                warn!(
                    peer_addr = %peer,
                    reason = err.reason_code(),
                    error = %err,
                    "Could not set up relay, dropping client"
                );
                self.stats.connections_failed += 1;
                Ok(())
            }
            FaultPolicy::Propagate => Err(match err {
                ProxyError::Connection { source, .. } => ProxyError::processing(
                    "could not open a connection with the backend",
                    source,
                ),
                other => other,
            }),
        }
    }

    /// Deregister and drop every `Disconnected` connection.
    ///
    /// Returns how many were removed.
    pub fn sweep_disconnected(&mut self) -> Result<usize, ProxyError> {
        let dead = self.registry.select(|relay| !relay.is_connected());

        for id in &dead {
            if let Some(relay) = self.registry.get(*id) {
                self.epoll
                    .delete(relay.client())
                    .map_err(|e| ProxyError::processing("deregister client socket", e))?;
                self.epoll
                    .delete(relay.backend().stream())
                    .map_err(|e| ProxyError::processing("deregister backend socket", e))?;
            }
            if let Some(relay) = self.registry.remove(*id) {
                self.stats.connections_closed += 1;
                info!(
                    connection_id = %id,
                    peer_ip = %relay.client_ip(),
                    "Client disconnected"
                );
            }
        }

        Ok(dead.len())
    }
}

/// Run steps on one connection until none can make progress.
///
/// A step that moved nothing may still have cleared a cached readiness flag,
/// which can make the other leg's step eligible. Only a step that changed
/// neither the state nor either leg's readiness ends the drive.
fn drive<C, S, L>(
    relay: &mut RelayConnection<C, S>,
    fired: Leg,
    logger: &mut L,
    stats: &mut ProxyStats,
) -> Result<(), ProxyError>
where
    C: Read + Write,
    S: Read + Write,
    L: MessageLogger,
{
    while let Some(step) = relay.next_step(fired) {
        let before = (
            relay.state(),
            relay.readiness(Leg::Client),
            relay.readiness(Leg::Backend),
        );
        let moved = relay.perform(step)?;

        match step {
            Step::ReadRequest => {
                stats.bytes_from_clients += moved as u64;
                if relay.state() == RelayState::BackendWrite {
                    stats.requests += 1;
                    logger
                        .log(&relay.completed_request())
                        .map_err(ProxyError::QueryLog)?;
                }
            }
            Step::ReceiveResponse | Step::Relay => stats.bytes_from_backend += moved as u64,
            Step::SendRequest | Step::SendResponse => {}
        }

        let after = (
            relay.state(),
            relay.readiness(Leg::Client),
            relay.readiness(Leg::Backend),
        );
        if moved == 0 && after == before {
            break;
        }
    }
    Ok(())
}

fn event_for(flags: EpollFlags, fd: RawFd) -> EpollEvent {
    EpollEvent::new(flags, fd as u64)
}
