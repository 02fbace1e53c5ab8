//! Upwards API boundary to the HTTP layers: a connection is routed to an
//! acceptor once ALPN has (or hasn't) picked a protocol. Full HTTP/1 and
//! HTTP/2 parsing stay out of scope here — `Http1Acceptor`/`Http2Acceptor`
//! exist only to make the dispatch rule itself implementable and testable.

use crate::alpn::select_alpn_protocol;
use crate::socket::SocketHandle;

/// Something that can take ownership of a freshly accepted (and, if TLS,
/// handshake-complete) connection.
pub trait ProtocolAcceptor {
    fn accept(&self, sock: SocketHandle);
}

/// Routed to whenever ALPN didn't select anything from the HTTP/2
/// acceptor's published list — including plaintext connections, which never
/// carry an ALPN offer at all.
#[derive(Default)]
pub struct Http1Acceptor {
    accepted: std::cell::Cell<usize>,
}

impl Http1Acceptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accepted_count(&self) -> usize {
        self.accepted.get()
    }
}

impl ProtocolAcceptor for Http1Acceptor {
    fn accept(&self, _sock: SocketHandle) {
        self.accepted.set(self.accepted.get() + 1);
    }
}

/// Published ALPN identifiers for the HTTP/2 acceptor, most preferred first.
pub const H2_ALPN_PROTOCOLS: &[&[u8]] = &[b"h2"];

#[derive(Default)]
pub struct Http2Acceptor {
    accepted: std::cell::Cell<usize>,
}

impl Http2Acceptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accepted_count(&self) -> usize {
        self.accepted.get()
    }
}

impl ProtocolAcceptor for Http2Acceptor {
    fn accept(&self, _sock: SocketHandle) {
        self.accepted.set(self.accepted.get() + 1);
    }
}

/// Dispatch rule: ALPN match against the HTTP/2 acceptor's published list,
/// else HTTP/1. `negotiated` is the already-selected protocol (from
/// `SocketHandle::ssl_selected_protocol`), not a raw client offer list.
pub fn dispatch<'a>(negotiated: &[u8], http1: &'a Http1Acceptor, http2: &'a Http2Acceptor) -> &'a dyn ProtocolAcceptor {
    if H2_ALPN_PROTOCOLS.contains(&negotiated) {
        http2
    } else {
        http1
    }
}

/// Variant of [`dispatch`] driven off a raw client ALPN offer list instead
/// of an already-negotiated protocol, for callers that want to route before
/// a handshake completes.
pub fn dispatch_offers<'a>(client_offers: &[u8], http1: &'a Http1Acceptor, http2: &'a Http2Acceptor) -> &'a dyn ProtocolAcceptor {
    match select_alpn_protocol(H2_ALPN_PROTOCOLS, client_offers) {
        Some(_) => http2,
        None => http1,
    }
}
