//! Event-loop binding contract.
//!
//! A binding owns a file descriptor and the OS-level readiness
//! registration for it. It knows nothing about TLS, buffers, or
//! callbacks — that routing lives on `SocketInner`, which
//! drives a binding through this trait to implement the four named
//! operations (`do_read_start`, `do_read_stop`, `do_write`, `do_dispose`).
//! Two variants exist behind the contract: [`native`] (this crate's own
//! epoll/kqueue reactor) and, behind the `mio-backend` feature,
//! [`mio_backend`] (an external reactor).

pub mod native;
#[cfg(feature = "mio-backend")]
pub mod mio_backend;

use std::io;
use std::os::unix::io::RawFd;

/// What a socket currently wants from the reactor. `EventLoop::poll` only
/// arms the OS-level readiness bits a binding has requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub const NONE: Interest = Interest { readable: false, writable: false };
    pub const READABLE: Interest = Interest { readable: true, writable: false };
    pub const WRITABLE: Interest = Interest { readable: false, writable: true };
}

/// Transport-level, non-blocking I/O for one fd. Never performs a blocking
/// syscall; `WouldBlock` is the normal "no data right now" signal.
pub trait EventLoopBinding {
    fn raw_fd(&self) -> RawFd;

    /// Non-blocking read directly off the transport.
    fn raw_read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Non-blocking scatter write directly to the transport. Returns the
    /// number of bytes actually written, which may be less than the total
    /// across `bufs` (a partial write) — the caller retries the remainder.
    fn raw_write(&mut self, bufs: &[&[u8]]) -> io::Result<usize>;

    /// Releases backend resources and the fd.
    fn dispose(&mut self);
}

/// Registers OS-level readiness interest and waits for it. Separate from
/// [`EventLoopBinding`] because registration is owned by the reactor (one
/// epoll/kqueue/mio::Poll fd shared by every socket on this thread), not by
/// the individual socket's transport.
pub trait ReadinessRegistry {
    fn set_interest(&self, fd: RawFd, interest: Interest) -> io::Result<()>;
    fn remove(&self, fd: RawFd);
    fn wait(&self, timeout_ms: i32) -> io::Result<Vec<(RawFd, Interest)>>;
}
