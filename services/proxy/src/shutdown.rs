//! Stop requests for the event loop.
//!
//! The loop blocks in `epoll_wait` with no timeout, so clearing a flag is not
//! enough to stop it. Both sources here are descriptors the loop registers:
//!
//! - [`StopHandle`] wraps an eventfd; `stop()` clears the running flag and
//!   wakes the loop, from any thread.
//! - [`ShutdownSignals`] blocks SIGINT, SIGTERM and SIGQUIT and receives them
//!   through a signalfd instead of an async handler.

use std::fmt;
use std::os::fd::{AsFd, BorrowedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nix::sys::eventfd::{EfdFlags, EventFd};
use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};

/// Signals that request a clean shutdown.
pub const SHUTDOWN_SIGNALS: [Signal; 3] = [Signal::SIGINT, Signal::SIGTERM, Signal::SIGQUIT];

struct StopState {
    running: AtomicBool,
    waker: EventFd,
}

/// Cloneable, thread-safe handle that stops an event loop.
#[derive(Clone)]
pub struct StopHandle {
    inner: Arc<StopState>,
}

impl StopHandle {
    pub fn new() -> nix::Result<Self> {
        let waker = EventFd::from_value_and_flags(0, EfdFlags::EFD_NONBLOCK | EfdFlags::EFD_CLOEXEC)?;
        Ok(Self {
            inner: Arc::new(StopState {
                running: AtomicBool::new(true),
                waker,
            }),
        })
    }

    /// Whether the loop should keep running.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Clear the running flag and wake the loop.
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::Release);
        // A full counter (EAGAIN) still leaves the eventfd readable.
        let _ = self.inner.waker.write(1);
    }

    /// Reset the wake-up counter after the loop observed it.
    pub(crate) fn drain(&self) {
        let _ = self.inner.waker.read();
    }
}

impl fmt::Debug for StopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopHandle")
            .field("running", &self.is_running())
            .finish()
    }
}

impl AsFd for StopHandle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.waker.as_fd()
    }
}

/// Shutdown signals delivered as a readable descriptor.
pub struct ShutdownSignals {
    fd: SignalFd,
}

impl ShutdownSignals {
    /// Block [`SHUTDOWN_SIGNALS`] for the calling thread and open a signalfd
    /// for them.
    ///
    /// Call before spawning threads so they inherit the mask.
    pub fn install() -> nix::Result<Self> {
        let mut mask = SigSet::empty();
        for signal in SHUTDOWN_SIGNALS {
            mask.add(signal);
        }
        mask.thread_block()?;
        let fd = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)?;
        Ok(Self { fd })
    }

    /// Take the next pending signal, if any.
    pub fn take_pending(&mut self) -> nix::Result<Option<Signal>> {
        let Some(info) = self.fd.read_signal()? else {
            return Ok(None);
        };
        Ok(Signal::try_from(info.ssi_signo as i32).ok())
    }
}

impl AsFd for ShutdownSignals {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
