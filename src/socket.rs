//! The Socket Façade and the event loop that drives it: `read_start`,
//! `read_stop`, `write`, `close`, `ssl_server_handshake`,
//! `ssl_selected_protocol`, multiplexing between the raw and TLS paths.
//!
//! One reactor thread owns every `SocketHandle` it creates (spec's
//! single-writer concurrency model), so state lives behind `Rc<RefCell<_>>`
//! rather than `Arc<Mutex<_>>`. Callbacks are never invoked from inside a
//! façade call — `EventLoop::run_once` collects what happened into a
//! deferred queue and drains it only after the readiness pass completes,
//! so a callback that calls back into another socket operation (including
//! `close`) never re-enters a borrow already held by the dispatch loop.

use std::cell::{Ref, RefCell};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use tracing::{debug, info, warn};

use crate::buffer::InputBuffer;
use crate::config::TlsContext;
use crate::error::SocketError;
use crate::reactor::{EventLoopBinding, Interest, ReadinessRegistry};
use crate::transport::CiphertextOutput;
use crate::tls::TlsSubstate;

pub type ReadCallback = Box<dyn FnMut(&SocketHandle, Result<(), &SocketError>)>;
pub type WriteCallback = Box<dyn FnOnce(&SocketHandle, Result<(), &SocketError>)>;
pub type HandshakeCallback = Box<dyn FnOnce(&SocketHandle, Result<(), &SocketError>)>;

/// What a drained ciphertext write should do once it finishes.
enum WriteCompletion {
    /// A caller-initiated `write`; clears the ciphertext pool and invokes
    /// the user's callback.
    User(WriteCallback),
    /// An internal handshake-flight flush. `now_done` was decided at the
    /// time the flush was queued, from the same `pump` call that produced
    /// the ciphertext — never recomputed afterward, so a completion fired
    /// here always matches the engine state the flight was produced from.
    Handshake { now_done: bool },
    /// An internal close_notify flush during shutdown.
    Shutdown,
    /// Ciphertext the engine queued on its own (e.g. a session ticket)
    /// with no caller waiting on it — drain it and do nothing else.
    Internal,
}

struct PendingWrite {
    data: Vec<u8>,
    written: usize,
    completion: WriteCompletion,
}

struct SocketInner {
    binding: Box<dyn EventLoopBinding>,
    fd: RawFd,
    registry: Rc<dyn ReadinessRegistry>,
    deferred: Rc<RefCell<VecDeque<DeferredCall>>>,

    plaintext_in: InputBuffer,
    tls: Option<TlsSubstate>,
    encrypted_in: InputBuffer,
    ciphertext_out: CiphertextOutput,

    on_read: Option<ReadCallback>,
    read_armed: bool,
    pending_write: Option<PendingWrite>,
    handshake_cb: Option<HandshakeCallback>,
    handshaking: bool,
    shutting_down: bool,
    closed: bool,
}

impl SocketInner {
    fn current_interest(&self) -> Interest {
        // During a handshake/shutdown flush, read interest must be paused
        // (spec's tie-break rule: a pending outbound flush is drained
        // before reading more input, and re-entrant drives are avoided by
        // not waking on readability until the flush finishes). An ordinary
        // user `read_start` is unaffected by an application write in
        // flight.
        let flushing = (self.handshaking || self.shutting_down) && self.pending_write.is_some();
        let driver_wants_read = (self.handshaking || self.shutting_down) && !flushing;
        Interest { readable: self.read_armed || driver_wants_read, writable: self.pending_write.is_some() }
    }

    fn sync_interest(&self) {
        let _ = self.registry.set_interest(self.fd, self.current_interest());
    }
}

/// Cloneable handle to one socket. Cloning shares the same underlying
/// state (`Rc`), it does not duplicate the connection.
#[derive(Clone)]
pub struct SocketHandle(Rc<RefCell<SocketInner>>);

enum DeferredCall {
    Read(SocketHandle, Result<(), SocketError>),
    Write(SocketHandle, Result<(), SocketError>, WriteCallback),
    Handshake(SocketHandle, Result<(), SocketError>),
    Dispose(SocketHandle),
}

impl DeferredCall {
    fn invoke(self) {
        match self {
            DeferredCall::Read(sock, result) => sock.invoke_read(result),
            DeferredCall::Write(sock, result, cb) => {
                let r = result.as_ref().map(|_| ()).map_err(|e| e);
                cb(&sock, r);
            }
            DeferredCall::Handshake(sock, result) => {
                let cb = sock.0.borrow_mut().handshake_cb.take();
                if let Some(cb) = cb {
                    cb(&sock, result.as_ref().map(|_| ()).map_err(|e| e));
                }
                // `tls-handshake-failed` is surfaced to the callback; the
                // socket is left inert (read interest already dropped in
                // the driver above) but not disposed — per spec.md §7 the
                // caller must close it, same as any other failed socket.
            }
            DeferredCall::Dispose(sock) => sock.dispose(),
        }
    }
}

impl SocketHandle {
    fn new(
        binding: Box<dyn EventLoopBinding>,
        registry: Rc<dyn ReadinessRegistry>,
        deferred: Rc<RefCell<VecDeque<DeferredCall>>>,
    ) -> Self {
        let fd = binding.raw_fd();
        SocketHandle(Rc::new(RefCell::new(SocketInner {
            binding,
            fd,
            registry,
            deferred,
            plaintext_in: InputBuffer::new(),
            tls: None,
            encrypted_in: InputBuffer::new(),
            ciphertext_out: CiphertextOutput::new(),
            on_read: None,
            read_armed: false,
            pending_write: None,
            handshake_cb: None,
            handshaking: false,
            shutting_down: false,
            closed: false,
        })))
    }

    pub fn fd(&self) -> RawFd {
        self.0.borrow().fd
    }

    pub fn is_closed(&self) -> bool {
        self.0.borrow().closed
    }

    /// The plaintext bytes currently buffered — either application data
    /// read directly off a raw socket, or application records the TLS
    /// engine has already decrypted. A read callback inspects this and
    /// calls [`consume_plaintext`](Self::consume_plaintext) for what it
    /// used, mirroring the buffer ownership model in the Data Model.
    pub fn plaintext(&self) -> Ref<'_, InputBuffer> {
        Ref::map(self.0.borrow(), |inner| &inner.plaintext_in)
    }

    pub fn consume_plaintext(&self, n: usize) {
        self.0.borrow_mut().plaintext_in.consume(n);
    }

    /// Empty slice means "none selected" (ALPN didn't match, or no TLS).
    pub fn ssl_selected_protocol(&self) -> Vec<u8> {
        self.0.borrow().tls.as_ref().and_then(TlsSubstate::alpn_protocol).map(<[u8]>::to_vec).unwrap_or_default()
    }

    pub fn read_start(&self, cb: ReadCallback) {
        let mut inner = self.0.borrow_mut();
        inner.on_read = Some(cb);
        inner.read_armed = true;
        inner.sync_interest();
    }

    pub fn read_stop(&self) {
        let mut inner = self.0.borrow_mut();
        inner.read_armed = false;
        inner.on_read = None;
        inner.sync_interest();
    }

    /// Precondition (assertable per the at-most-one-write law): no other
    /// write is already in flight on this socket.
    pub fn write(&self, bufs: &[&[u8]], cb: WriteCallback) {
        let mut inner = self.0.borrow_mut();
        assert!(inner.pending_write.is_none(), "write already in flight on this socket");

        if inner.tls.is_some() {
            let mut write_err = None;
            for buf in bufs {
                let SocketInner { tls, .. } = &mut *inner;
                if let Err(e) = tls.as_mut().unwrap().write_plaintext(buf) {
                    write_err = Some(e);
                    break;
                }
            }
            if let Some(e) = write_err {
                // Known source defect fix: a non-blocking write is never
                // assumed to succeed unconditionally. Report failure
                // through the deferred queue, never from inside this call.
                let deferred = inner.deferred.clone();
                drop(inner);
                deferred.borrow_mut().push_back(DeferredCall::Write(self.clone(), Err(e), cb));
                return;
            }
            let SocketInner { tls, encrypted_in, ciphertext_out, .. } = &mut *inner;
            if let Err(e) = tls.as_mut().unwrap().flush(encrypted_in, ciphertext_out) {
                let deferred = inner.deferred.clone();
                drop(inner);
                deferred.borrow_mut().push_back(DeferredCall::Write(self.clone(), Err(e), cb));
                return;
            }
            let data = inner.ciphertext_out.as_slices().concat();
            inner.pending_write = Some(PendingWrite { data, written: 0, completion: WriteCompletion::User(cb) });
        } else {
            let data: Vec<u8> = bufs.concat();
            inner.pending_write = Some(PendingWrite { data, written: 0, completion: WriteCompletion::User(cb) });
        }
        inner.sync_interest();
    }

    /// Plaintext path disposes directly; the TLS path enters the shutdown
    /// driver (send `close_notify`, wait for the peer's, then dispose).
    pub fn close(&self) {
        let mut inner = self.0.borrow_mut();
        if inner.closed || inner.shutting_down {
            return;
        }
        if let Some(tls) = inner.tls.as_mut() {
            tls.begin_shutdown();
            inner.shutting_down = true;
            inner.handshaking = false;
            inner.on_read = None;
            let SocketInner { tls, encrypted_in, ciphertext_out, .. } = &mut *inner;
            let flushed = tls.as_mut().unwrap().flush(encrypted_in, ciphertext_out);
            drop(inner);
            match flushed {
                Ok(()) => self.queue_shutdown_flush(),
                Err(_) => self.dispose(),
            }
        } else {
            drop(inner);
            self.dispose();
        }
    }

    /// Allocates a TLS substate, attaches it to `ctx`, and starts the
    /// handshake driver by arming reads. The handshake callback fires
    /// exactly once, after decode-input has drained any plaintext the
    /// final handshake step produced as a side effect.
    pub fn ssl_server_handshake(&self, ctx: &TlsContext, cb: HandshakeCallback) {
        let mut inner = self.0.borrow_mut();
        match TlsSubstate::new(ctx) {
            Ok(tls) => {
                inner.tls = Some(tls);
                inner.handshaking = true;
                inner.handshake_cb = Some(cb);
                inner.sync_interest();
            }
            Err(e) => {
                let deferred = inner.deferred.clone();
                drop(inner);
                deferred.borrow_mut().push_back(DeferredCall::Handshake(self.clone(), Err(e)));
            }
        }
    }

    fn queue_shutdown_flush(&self) {
        let mut inner = self.0.borrow_mut();
        let pending = std::mem::take(&mut inner.ciphertext_out).as_slices().concat();
        if pending.is_empty() {
            drop(inner);
            self.continue_shutdown();
            return;
        }
        inner.pending_write = Some(PendingWrite { data: pending, written: 0, completion: WriteCompletion::Shutdown });
        inner.sync_interest();
    }

    /// Re-entered after the close_notify flush drains, or directly from
    /// `close` when there was nothing to flush. Dispatches on the engine's
    /// own "nothing left to do" state rather than a literal return-code
    /// sentinel.
    fn continue_shutdown(&self) {
        let mut inner = self.0.borrow_mut();
        let done = inner.tls.as_ref().map(TlsSubstate::shutdown_complete).unwrap_or(true);
        if done {
            drop(inner);
            self.dispose();
        } else {
            // Waiting on the peer's close_notify; stay armed for reads.
            inner.sync_interest();
        }
    }

    fn invoke_read(&self, result: Result<(), SocketError>) {
        let cb = self.0.borrow_mut().on_read.take();
        let Some(mut cb) = cb else { return };
        cb(self, result.as_ref().map(|_| ()).map_err(|e| e));
        let mut inner = self.0.borrow_mut();
        if !inner.closed && inner.read_armed && inner.on_read.is_none() {
            inner.on_read = Some(cb);
        }
    }

    /// Dispose order: drop the TLS engine handle, release the encrypted
    /// input buffer, clear the ciphertext pool, drop the TLS substate,
    /// release the plaintext input buffer, then release the backend fd.
    fn dispose(&self) {
        let mut inner = self.0.borrow_mut();
        if inner.closed {
            return;
        }
        inner.closed = true;
        inner.on_read = None;
        inner.handshake_cb = None;
        inner.pending_write = None;
        inner.tls = None;
        inner.encrypted_in.dispose();
        inner.ciphertext_out.clear();
        inner.plaintext_in.dispose();
        inner.registry.remove(inner.fd);
        inner.binding.dispose();
        debug!(fd = inner.fd, "socket disposed");
    }

    fn drive_readable(&self) {
        let mut inner = self.0.borrow_mut();
        if inner.closed {
            return;
        }
        let mut scratch = [0u8; 4096];
        let read = inner.binding.raw_read(&mut scratch);
        match read {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                let was_handshaking = inner.handshaking;
                inner.handshaking = false;
                // A failed handshake is surfaced to the callback but left
                // to the caller's `close()` to dispose (spec.md §7); stop
                // driving the socket in the meantime rather than spinning
                // on a stale readable registration.
                inner.sync_interest();
                let deferred = inner.deferred.clone();
                drop(inner);
                let err = SocketError::TransportRead(e);
                if was_handshaking {
                    deferred.borrow_mut().push_back(DeferredCall::Handshake(self.clone(), Err(err)));
                } else {
                    deferred.borrow_mut().push_back(DeferredCall::Read(self.clone(), Err(err)));
                }
            }
            Ok(0) => {
                // Peer closed the transport outright.
                let was_handshaking = inner.handshaking;
                let was_shutting_down = inner.shutting_down;
                inner.handshaking = false;
                if was_handshaking {
                    inner.sync_interest();
                }
                let deferred = inner.deferred.clone();
                drop(inner);
                if was_handshaking {
                    let err = SocketError::TransportRead(io::Error::from(io::ErrorKind::UnexpectedEof));
                    deferred.borrow_mut().push_back(DeferredCall::Handshake(self.clone(), Err(err)));
                } else if was_shutting_down {
                    // Peer's side of the close is gone too; nothing more to
                    // exchange, dispose silently (shutdown errors are never
                    // surfaced to a user callback).
                    deferred.borrow_mut().push_back(DeferredCall::Dispose(self.clone()));
                } else {
                    deferred.borrow_mut().push_back(DeferredCall::Read(self.clone(), Ok(())));
                }
            }
            Ok(n) => self.route_bytes(inner, &scratch[..n]),
        }
    }

    fn route_bytes(&self, mut inner: std::cell::RefMut<'_, SocketInner>, data: &[u8]) {
        if inner.tls.is_some() {
            {
                let slot = inner.encrypted_in.reserve(data.len());
                slot[..data.len()].copy_from_slice(data);
                inner.encrypted_in.commit(data.len());
            }
            let was_handshaking = inner.handshaking;
            let was_shutting_down = inner.shutting_down;
            let outcome = {
                let SocketInner { tls, encrypted_in, ciphertext_out, plaintext_in, .. } = &mut *inner;
                tls.as_mut().unwrap().pump(encrypted_in, ciphertext_out, plaintext_in)
            };

            match outcome {
                Err(e) => {
                    inner.handshaking = false;
                    if was_handshaking {
                        inner.sync_interest();
                    }
                    let deferred = inner.deferred.clone();
                    drop(inner);
                    if was_handshaking {
                        deferred.borrow_mut().push_back(DeferredCall::Handshake(self.clone(), Err(e)));
                    } else {
                        deferred.borrow_mut().push_back(DeferredCall::Read(self.clone(), Err(e)));
                    }
                }
                Ok(outcome) => {
                    let has_ciphertext = !inner.ciphertext_out.is_empty();
                    if was_handshaking {
                        let now_done = !outcome.still_handshaking;
                        inner.handshaking = outcome.still_handshaking;
                        if has_ciphertext && inner.pending_write.is_none() {
                            let data = std::mem::take(&mut inner.ciphertext_out).as_slices().concat();
                            inner.pending_write =
                                Some(PendingWrite { data, written: 0, completion: WriteCompletion::Handshake { now_done } });
                            inner.sync_interest();
                        } else if has_ciphertext {
                            // A flush is already in flight — read interest
                            // is paused while one is, so this shouldn't
                            // happen, but guard it the same way the
                            // ordinary-read branch below does: leave the
                            // new ciphertext queued rather than clobbering
                            // the write already underway.
                            inner.sync_interest();
                        } else if now_done {
                            let deferred = inner.deferred.clone();
                            drop(inner);
                            deferred.borrow_mut().push_back(DeferredCall::Handshake(self.clone(), Ok(())));
                        } else {
                            inner.sync_interest();
                        }
                    } else if was_shutting_down {
                        drop(inner);
                        if has_ciphertext {
                            self.queue_shutdown_flush();
                        } else {
                            self.continue_shutdown();
                        }
                    } else {
                        let had_plaintext = !inner.plaintext_in.is_empty();
                        if has_ciphertext && inner.pending_write.is_none() {
                            let data = std::mem::take(&mut inner.ciphertext_out).as_slices().concat();
                            // Unsolicited ciphertext while reading (e.g. a
                            // session ticket or alert) — flush it without a
                            // user-visible completion.
                            inner.pending_write =
                                Some(PendingWrite { data, written: 0, completion: WriteCompletion::Internal });
                            inner.sync_interest();
                        }
                        if had_plaintext || outcome.peer_closed {
                            let deferred = inner.deferred.clone();
                            drop(inner);
                            deferred.borrow_mut().push_back(DeferredCall::Read(self.clone(), Ok(())));
                        }
                    }
                }
            }
        } else {
            let slot = inner.plaintext_in.reserve(data.len());
            slot[..data.len()].copy_from_slice(data);
            inner.plaintext_in.commit(data.len());
            let deferred = inner.deferred.clone();
            drop(inner);
            deferred.borrow_mut().push_back(DeferredCall::Read(self.clone(), Ok(())));
        }
    }

    fn drive_writable(&self) {
        let mut inner = self.0.borrow_mut();
        if inner.closed {
            return;
        }
        let Some(mut pw) = inner.pending_write.take() else { return };
        loop {
            let remaining = &pw.data[pw.written..];
            if remaining.is_empty() {
                break;
            }
            match inner.binding.raw_write(&[remaining]) {
                Ok(0) => break,
                Ok(n) => pw.written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    inner.pending_write = Some(pw);
                    return;
                }
                Err(e) => {
                    inner.sync_interest();
                    let deferred = inner.deferred.clone();
                    let completion = pw.completion;
                    drop(inner);
                    let err = SocketError::TransportWrite(e);
                    match completion {
                        WriteCompletion::User(cb) => {
                            deferred.borrow_mut().push_back(DeferredCall::Write(self.clone(), Err(err), cb));
                        }
                        WriteCompletion::Handshake { .. } => {
                            deferred.borrow_mut().push_back(DeferredCall::Handshake(self.clone(), Err(err)));
                        }
                        WriteCompletion::Shutdown => {
                            warn!("shutdown flush failed, disposing silently");
                            deferred.borrow_mut().push_back(DeferredCall::Dispose(self.clone()));
                        }
                        WriteCompletion::Internal => {
                            warn!("internal ciphertext flush failed: {err}");
                        }
                    }
                    return;
                }
            }
        }

        inner.ciphertext_out.clear();
        inner.sync_interest();
        let deferred = inner.deferred.clone();
        drop(inner);
        match pw.completion {
            WriteCompletion::User(cb) => {
                deferred.borrow_mut().push_back(DeferredCall::Write(self.clone(), Ok(()), cb));
            }
            WriteCompletion::Handshake { now_done } => {
                if now_done {
                    deferred.borrow_mut().push_back(DeferredCall::Handshake(self.clone(), Ok(())));
                }
            }
            WriteCompletion::Shutdown => {
                self.continue_shutdown();
            }
            WriteCompletion::Internal => {}
        }
    }
}

/// Owns one reactor's readiness registry, the sockets registered against
/// it, and the end-of-turn deferred callback queue.
pub struct EventLoop {
    registry: Rc<dyn ReadinessRegistry>,
    sockets: HashMap<RawFd, SocketHandle>,
    deferred: Rc<RefCell<VecDeque<DeferredCall>>>,
}

impl EventLoop {
    pub fn new(registry: Rc<dyn ReadinessRegistry>) -> Self {
        Self { registry, sockets: HashMap::new(), deferred: Rc::new(RefCell::new(VecDeque::new())) }
    }

    pub fn create_socket(&mut self, binding: Box<dyn EventLoopBinding>) -> SocketHandle {
        let sock = SocketHandle::new(binding, self.registry.clone(), self.deferred.clone());
        self.sockets.insert(sock.fd(), sock.clone());
        info!(fd = sock.fd(), "socket registered with event loop");
        sock
    }

    /// Waits for readiness, drives whatever fired, then drains every
    /// deferred callback produced this turn. Returns once both steps are
    /// done; the caller loops this for the life of the reactor.
    pub fn run_once(&mut self, timeout_ms: i32) -> io::Result<()> {
        let ready = self.registry.wait(timeout_ms)?;
        for (fd, interest) in ready {
            let Some(sock) = self.sockets.get(&fd).cloned() else { continue };
            if interest.readable {
                sock.drive_readable();
            }
            if interest.writable && !sock.is_closed() {
                sock.drive_writable();
            }
        }
        loop {
            let next = self.deferred.borrow_mut().pop_front();
            let Some(call) = next else { break };
            call.invoke();
        }
        self.sockets.retain(|_, s| !s.is_closed());
        Ok(())
    }

    /// Runs `run_once` forever (or until a call errors), blocking up to
    /// `timeout_ms` per turn. A thin convenience wrapper for callers that
    /// don't need to interleave other work between reactor turns.
    pub fn run(&mut self, timeout_ms: i32) -> io::Result<()> {
        loop {
            self.run_once(timeout_ms)?;
        }
    }
}
