//! `mio`-backed event-loop binding — the "external reactor" variant of
//! the event-loop binding contract, kept behind the `mio-backend` feature.
//!
//! Grounded in the same `rustls` + `mio` pairing the high-frequency-trading
//! example in the retrieval pack uses for its TLS client: a non-blocking
//! `mio::net::TcpStream` registered for read/write interest, with no
//! internal locking (one reactor thread, one socket each).

use std::cell::RefCell;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use mio::event::Source;
use mio::net::TcpStream as MioTcpStream;
use mio::{Events, Interest as MioInterest, Poll, Token as MioToken};

use super::{EventLoopBinding, Interest, ReadinessRegistry};

pub struct MioReactor {
    poll: RefCell<Poll>,
}

impl MioReactor {
    pub fn new() -> io::Result<Self> {
        Ok(Self { poll: RefCell::new(Poll::new()?) })
    }

    fn registry_op<T>(&self, f: impl FnOnce(&mio::Registry) -> io::Result<T>) -> io::Result<T> {
        f(self.poll.borrow().registry())
    }
}

fn to_mio_interest(interest: Interest) -> Option<MioInterest> {
    match (interest.readable, interest.writable) {
        (true, true) => Some(MioInterest::READABLE | MioInterest::WRITABLE),
        (true, false) => Some(MioInterest::READABLE),
        (false, true) => Some(MioInterest::WRITABLE),
        (false, false) => None,
    }
}

impl ReadinessRegistry for MioReactor {
    fn set_interest(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let token = MioToken(fd as usize);
        let Some(mio_interest) = to_mio_interest(interest) else {
            let _ = self.registry_op(|r| r.deregister(&mut FdSource(fd)));
            return Ok(());
        };
        self.registry_op(|r| {
            r.reregister(&mut FdSource(fd), token, mio_interest)
                .or_else(|_| r.register(&mut FdSource(fd), token, mio_interest))
        })
    }

    fn remove(&self, fd: RawFd) {
        let _ = self.registry_op(|r| r.deregister(&mut FdSource(fd)));
    }

    fn wait(&self, timeout_ms: i32) -> io::Result<Vec<(RawFd, Interest)>> {
        let mut events = Events::with_capacity(1024);
        let timeout = if timeout_ms < 0 {
            None
        } else {
            Some(std::time::Duration::from_millis(timeout_ms as u64))
        };
        self.poll.borrow_mut().poll(&mut events, timeout)?;
        Ok(events
            .iter()
            .map(|e| {
                let fd = e.token().0 as RawFd;
                (fd, Interest { readable: e.is_readable(), writable: e.is_writable() })
            })
            .collect())
    }
}

/// Wraps a raw fd so it can be registered directly with `mio::Registry`
/// without mio owning the stream (the `EventLoopBinding` does).
struct FdSource(RawFd);

impl Source for FdSource {
    fn register(&mut self, registry: &mio::Registry, token: MioToken, interests: MioInterest) -> io::Result<()> {
        mio::unix::SourceFd(&self.0).register(registry, token, interests)
    }

    fn reregister(&mut self, registry: &mio::Registry, token: MioToken, interests: MioInterest) -> io::Result<()> {
        mio::unix::SourceFd(&self.0).reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &mio::Registry) -> io::Result<()> {
        mio::unix::SourceFd(&self.0).deregister(registry)
    }
}

pub struct MioBinding {
    stream: MioTcpStream,
}

impl MioBinding {
    pub fn new(stream: std::net::TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self { stream: MioTcpStream::from_std(stream) })
    }
}

impl EventLoopBinding for MioBinding {
    fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    fn raw_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        use std::io::Read;
        self.stream.read(buf)
    }

    fn raw_write(&mut self, bufs: &[&[u8]]) -> io::Result<usize> {
        use std::io::{IoSlice, Write};
        let slices: Vec<IoSlice> = bufs.iter().map(|b| IoSlice::new(b)).collect();
        self.stream.write_vectored(&slices)
    }

    fn dispose(&mut self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}
