//! Built-in epoll (Linux) / kqueue (macOS) event-loop binding — the
//! "native reactor" variant of the event-loop binding contract.

use std::collections::HashMap;
use std::io;
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, RawFd};

use super::{EventLoopBinding, Interest, ReadinessRegistry};

#[cfg(target_os = "linux")]
mod sys {
    use super::*;
    use libc::{
        epoll_create1, epoll_ctl, epoll_event, epoll_wait, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT,
        EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD,
    };

    pub fn create() -> io::Result<RawFd> {
        let fd = unsafe { epoll_create1(EPOLL_CLOEXEC) };
        if fd < 0 { Err(io::Error::last_os_error()) } else { Ok(fd) }
    }

    fn events_for(interest: Interest) -> u32 {
        let mut ev = EPOLLERR as u32 | EPOLLHUP as u32;
        if interest.readable { ev |= EPOLLIN as u32; }
        if interest.writable { ev |= EPOLLOUT as u32; }
        ev
    }

    pub fn add(poll_fd: RawFd, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut event = epoll_event { events: events_for(interest), u64: fd as u64 };
        if unsafe { epoll_ctl(poll_fd, EPOLL_CTL_ADD, fd, &mut event) } < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    pub fn modify(poll_fd: RawFd, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut event = epoll_event { events: events_for(interest), u64: fd as u64 };
        if unsafe { epoll_ctl(poll_fd, EPOLL_CTL_MOD, fd, &mut event) } < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    pub fn remove(poll_fd: RawFd, fd: RawFd) {
        unsafe {
            epoll_ctl(poll_fd, EPOLL_CTL_DEL, fd, std::ptr::null_mut());
        }
    }

    pub fn wait(poll_fd: RawFd, timeout_ms: i32) -> io::Result<Vec<(RawFd, Interest)>> {
        const MAX_EVENTS: usize = 1024;
        let mut events: Vec<epoll_event> = vec![unsafe { std::mem::zeroed() }; MAX_EVENTS];
        let n = unsafe { epoll_wait(poll_fd, events.as_mut_ptr(), events.len() as i32, timeout_ms) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let mut ready = Vec::with_capacity(n as usize);
        for event in &events[..n as usize] {
            let fd = event.u64 as RawFd;
            let readable = event.events & (EPOLLIN as u32 | EPOLLERR as u32 | EPOLLHUP as u32) != 0;
            let writable = event.events & (EPOLLOUT as u32 | EPOLLERR as u32 | EPOLLHUP as u32) != 0;
            ready.push((fd, Interest { readable, writable }));
        }
        Ok(ready)
    }

    pub fn close(poll_fd: RawFd) {
        unsafe { libc::close(poll_fd) };
    }
}

#[cfg(target_os = "macos")]
mod sys {
    use super::*;
    use libc::{kevent, kqueue, timespec, EVFILT_READ, EVFILT_WRITE, EV_ADD, EV_DELETE, EV_ENABLE};

    pub fn create() -> io::Result<RawFd> {
        let fd = unsafe { kqueue() };
        if fd < 0 { Err(io::Error::last_os_error()) } else { Ok(fd) }
    }

    fn change(ident: RawFd, filter: i16, flags: u16) -> kevent {
        kevent { ident: ident as usize, filter, flags, fflags: 0, data: 0, udata: std::ptr::null_mut() }
    }

    fn apply(poll_fd: RawFd, changes: &[kevent]) -> io::Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let r = unsafe {
            kevent(poll_fd, changes.as_ptr(), changes.len() as i32, std::ptr::null_mut(), 0, std::ptr::null())
        };
        if r < 0 { Err(io::Error::last_os_error()) } else { Ok(()) }
    }

    pub fn add(poll_fd: RawFd, fd: RawFd, interest: Interest) -> io::Result<()> {
        modify(poll_fd, fd, interest)
    }

    pub fn modify(poll_fd: RawFd, fd: RawFd, interest: Interest) -> io::Result<()> {
        let r_flags = if interest.readable { EV_ADD | EV_ENABLE } else { EV_DELETE };
        let w_flags = if interest.writable { EV_ADD | EV_ENABLE } else { EV_DELETE };
        // EV_DELETE on a filter that was never added is a harmless error on
        // some kqueue implementations; ignore individually so toggling an
        // interest that was already off doesn't fail the whole call.
        let _ = apply(poll_fd, &[change(fd, EVFILT_READ, r_flags)]);
        let _ = apply(poll_fd, &[change(fd, EVFILT_WRITE, w_flags)]);
        Ok(())
    }

    pub fn remove(poll_fd: RawFd, fd: RawFd) {
        let _ = apply(poll_fd, &[change(fd, EVFILT_READ, EV_DELETE)]);
        let _ = apply(poll_fd, &[change(fd, EVFILT_WRITE, EV_DELETE)]);
    }

    pub fn wait(poll_fd: RawFd, timeout_ms: i32) -> io::Result<Vec<(RawFd, Interest)>> {
        const MAX_EVENTS: usize = 1024;
        let mut events: Vec<kevent> = (0..MAX_EVENTS).map(|_| unsafe { std::mem::zeroed() }).collect();
        let ts = timespec {
            tv_sec: (timeout_ms.max(0) / 1000) as i64,
            tv_nsec: ((timeout_ms.max(0) % 1000) * 1_000_000) as i64,
        };
        let ts_ptr = if timeout_ms < 0 { std::ptr::null() } else { &ts as *const timespec };
        let n = unsafe {
            kevent(poll_fd, std::ptr::null(), 0, events.as_mut_ptr(), events.len() as i32, ts_ptr)
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let mut by_fd: HashMap<RawFd, Interest> = HashMap::new();
        for event in &events[..n as usize] {
            let fd = event.ident as RawFd;
            let entry = by_fd.entry(fd).or_insert(Interest::NONE);
            if event.filter == EVFILT_READ {
                entry.readable = true;
            } else if event.filter == EVFILT_WRITE {
                entry.writable = true;
            }
        }
        Ok(by_fd.into_iter().collect())
    }

    pub fn close(poll_fd: RawFd) {
        unsafe { libc::close(poll_fd) };
    }
}

/// Owns the OS polling fd shared by every [`NativeBinding`] registered
/// against it.
pub struct NativeReactor {
    poll_fd: RawFd,
}

impl NativeReactor {
    pub fn new() -> io::Result<Self> {
        Ok(Self { poll_fd: sys::create()? })
    }

    pub fn add(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        sys::add(self.poll_fd, fd, interest)
    }

    pub fn modify(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        sys::modify(self.poll_fd, fd, interest)
    }

    pub fn remove(&self, fd: RawFd) {
        sys::remove(self.poll_fd, fd)
    }

    /// Blocks up to `timeout_ms` (negative = forever) for readiness,
    /// returning the set of fds that became ready and which of
    /// readable/writable fired.
    pub fn wait(&self, timeout_ms: i32) -> io::Result<Vec<(RawFd, Interest)>> {
        sys::wait(self.poll_fd, timeout_ms)
    }
}

impl Drop for NativeReactor {
    fn drop(&mut self) {
        sys::close(self.poll_fd);
    }
}

impl ReadinessRegistry for NativeReactor {
    fn set_interest(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        // epoll's ADD vs. MOD distinction is only a performance detail
        // (MOD on a never-added fd fails); kqueue's `modify` already
        // tolerates being called first. Try add, fall back to modify.
        self.add(fd, interest).or_else(|_| self.modify(fd, interest))
    }

    fn remove(&self, fd: RawFd) {
        NativeReactor::remove(self, fd)
    }

    fn wait(&self, timeout_ms: i32) -> io::Result<Vec<(RawFd, Interest)>> {
        NativeReactor::wait(self, timeout_ms)
    }
}

/// A [`TcpStream`]-backed [`EventLoopBinding`] registered with a
/// [`NativeReactor`].
pub struct NativeBinding {
    stream: TcpStream,
}

impl NativeBinding {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self { stream })
    }
}

impl EventLoopBinding for NativeBinding {
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
