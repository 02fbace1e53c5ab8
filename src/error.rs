//! Error kinds surfaced to socket callbacks.
//!
//! Nothing in this crate retries on its own; a `SocketError` is handed to the
//! relevant one-shot callback (or silently disposes the socket, for
//! shutdown failures) and the caller decides what happens next.

use std::io;

/// Status reported to a `read`/`write`/handshake callback. `Err(_)` carries
/// the kind; success is the absence of an error.
#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    #[error("transport read failed: {0}")]
    TransportRead(#[source] io::Error),

    #[error("transport write failed: {0}")]
    TransportWrite(#[source] io::Error),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(#[source] rustls::Error),

    #[error("TLS record decrypt failed: {0}")]
    TlsDecrypt(#[source] rustls::Error),

    /// Never surfaced to a user callback — the shutdown path silently
    /// disposes the socket on this error, since shutdown is caller-initiated.
    #[error("TLS shutdown failed: {0}")]
    TlsShutdown(#[source] rustls::Error),
}

pub type Result<T> = std::result::Result<T, SocketError>;
