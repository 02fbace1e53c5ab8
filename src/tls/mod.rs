//! TLS handshake / decode-input / shutdown state driver, built on
//! `rustls::ServerConnection` instead of a hand-rolled record layer.
//!
//! Reworked from a poll-based stream wrapper into a driver over explicit
//! buffers: nothing here blocks or holds a waker, every method either
//! makes progress against the buffers it's handed or returns so the
//! caller can re-subscribe for readiness.

use std::io::{self, Read, Write};

use rustls::server::Acceptor;
use rustls::ServerConnection;
use tracing::debug;

use crate::alpn::select_alpn_protocol_from_offers;
use crate::buffer::InputBuffer;
use crate::config::TlsContext;
use crate::error::SocketError;
use crate::transport::{CiphertextOutput, TransportAdapter};

/// The two phases of a connection's engine: parsing the `ClientHello` far
/// enough to read its ALPN offers (before any `ServerConfig` is committed
/// to), and the live `ServerConnection` built once a protocol has been
/// chosen under the client-preference rule. `rustls::ServerConfig::
/// alpn_protocols` alone can't do this — rustls resolves ALPN by walking
/// its own list against the client's offers (server preference), so the
/// only way to honor client preference is to intercept the `ClientHello`
/// via `rustls::server::Acceptor` and hand-pick the config afterwards.
enum Engine {
    Accepting(Box<Acceptor>),
    Ready(Box<ServerConnection>),
}

/// What changed as a result of a [`TlsSubstate::pump`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpOutcome {
    pub still_handshaking: bool,
    /// The engine reported a clean close-notify while draining plaintext.
    pub peer_closed: bool,
}

/// One TLS connection's engine state. Lives alongside a socket's plaintext
/// and encrypted buffers; never touches the transport fd directly.
pub struct TlsSubstate {
    engine: Engine,
    ctx: TlsContext,
}

impl TlsSubstate {
    pub fn new(ctx: &TlsContext) -> Result<Self, SocketError> {
        Ok(Self { engine: Engine::Accepting(Box::new(Acceptor::default())), ctx: ctx.clone() })
    }

    pub fn is_handshaking(&self) -> bool {
        match &self.engine {
            Engine::Accepting(_) => true,
            Engine::Ready(conn) => conn.is_handshaking(),
        }
    }

    pub fn wants_read(&self) -> bool {
        match &self.engine {
            Engine::Accepting(_) => true,
            Engine::Ready(conn) => conn.wants_read(),
        }
    }

    pub fn wants_write(&self) -> bool {
        match &self.engine {
            Engine::Accepting(_) => false,
            Engine::Ready(conn) => conn.wants_write(),
        }
    }

    /// `None` until the handshake has picked a protocol (or negotiated
    /// none).
    pub fn alpn_protocol(&self) -> Option<&[u8]> {
        match &self.engine {
            Engine::Accepting(_) => None,
            Engine::Ready(conn) => conn.alpn_protocol(),
        }
    }

    /// Drains whatever ciphertext is sitting in `encrypted_in`, advances the
    /// handshake or decrypts application records into `plaintext_out`
    /// (spec's decode-input driver: reserve 4096 bytes, read, grow on
    /// success, stop on would-block or close-notify), and pushes any
    /// ciphertext the engine now wants to send (handshake flight, alerts, or
    /// queued application writes) into `ciphertext_out`.
    ///
    /// This is the single entry point driving all three state machines
    /// (handshake, decode-input, shutdown) — which one runs is determined
    /// entirely by `rustls::ServerConnection`'s own internal state, not by
    /// which caller invoked `pump`.
    pub fn pump(
        &mut self,
        encrypted_in: &mut InputBuffer,
        ciphertext_out: &mut CiphertextOutput,
        plaintext_out: &mut InputBuffer,
    ) -> Result<PumpOutcome, SocketError> {
        if let Engine::Accepting(acceptor) = &mut self.engine {
            {
                let mut adapter = TransportAdapter::new(encrypted_in, ciphertext_out);
                loop {
                    match acceptor.read_tls(&mut adapter) {
                        Ok(0) => break,
                        Ok(_) => continue,
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) => return Err(SocketError::TransportRead(e)),
                    }
                }
            }

            let accepted = match acceptor.accept() {
                Ok(Some(accepted)) => accepted,
                // ClientHello not fully read yet; nothing more to do this turn.
                Ok(None) => return Ok(PumpOutcome { still_handshaking: true, peer_closed: false }),
                Err((err, alert)) => {
                    let mut adapter = TransportAdapter::new(encrypted_in, ciphertext_out);
                    let mut alert_bytes = Vec::new();
                    if alert.write(&mut alert_bytes).is_ok() {
                        let _ = adapter.write_all(&alert_bytes);
                    }
                    return Err(SocketError::TlsHandshake(err));
                }
            };

            // Client-preference ALPN selection (spec's determinism law),
            // not rustls's own server-preference resolution: pick the
            // protocol ourselves against the raw ClientHello offers, then
            // commit to it by handing `into_connection` a config carrying
            // only that one protocol.
            let server_list: Vec<&[u8]> = self.ctx.alpn_protocols().iter().map(Vec::as_slice).collect();
            let selected = accepted
                .client_hello()
                .alpn()
                .and_then(|offers| select_alpn_protocol_from_offers(&server_list, offers))
                .map(<[u8]>::to_vec);

            let config = match &selected {
                Some(protocol) => self
                    .ctx
                    .config_with_alpn(protocol)
                    .map_err(|e| SocketError::TlsHandshake(rustls::Error::General(e.to_string())))?,
                None => self.ctx.inner(),
            };

            let conn = accepted.into_connection(config).map_err(SocketError::TlsHandshake)?;
            debug!(alpn_selected = ?selected, "accepted client hello, resolved alpn by client preference");
            self.engine = Engine::Ready(Box::new(conn));
        }

        let conn = match &mut self.engine {
            Engine::Ready(conn) => conn,
            // Still waiting on more ClientHello bytes.
            Engine::Accepting(_) => return Ok(PumpOutcome { still_handshaking: true, peer_closed: false }),
        };

        {
            let mut adapter = TransportAdapter::new(encrypted_in, ciphertext_out);
            loop {
                match conn.read_tls(&mut adapter) {
                    Ok(0) => break,
                    Ok(_) => continue,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => return Err(SocketError::TransportRead(e)),
                }
            }
        }

        conn.process_new_packets().map_err(SocketError::TlsDecrypt)?;

        let mut peer_closed = false;
        loop {
            let slot = plaintext_out.reserve(4096);
            match conn.reader().read(slot) {
                Ok(0) => {
                    peer_closed = true;
                    break;
                }
                Ok(n) => plaintext_out.commit(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                // The reader only surfaces an io::Error when the connection
                // already recorded a protocol error; there's no raw I/O
                // happening here to fail independently.
                Err(e) => return Err(SocketError::TlsDecrypt(rustls::Error::General(e.to_string()))),
            }
        }

        self.flush(encrypted_in, ciphertext_out)?;

        let still_handshaking = self.is_handshaking();
        debug!(still_handshaking, peer_closed, plaintext = plaintext_out.size(), "pumped tls record layer");

        Ok(PumpOutcome { still_handshaking, peer_closed })
    }

    /// Pushes any ciphertext the engine currently wants to send — used both
    /// from `pump` and directly after `write_plaintext`/`begin_shutdown`,
    /// which queue output without reading anything first.
    pub fn flush(
        &mut self,
        encrypted_in: &mut InputBuffer,
        ciphertext_out: &mut CiphertextOutput,
    ) -> Result<(), SocketError> {
        let Engine::Ready(conn) = &mut self.engine else {
            // Nothing queued to send while still parsing the ClientHello;
            // an acceptor-level rejection writes its alert directly in `pump`.
            return Ok(());
        };
        let mut adapter = TransportAdapter::new(encrypted_in, ciphertext_out);
        while conn.wants_write() {
            match conn.write_tls(&mut adapter) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) => return Err(SocketError::TransportWrite(e)),
            }
        }
        Ok(())
    }

    /// Reads decrypted application bytes. `WouldBlock` means the last
    /// `pump` didn't yield a full record; call again after the next one.
    pub fn read_plaintext(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.engine {
            Engine::Ready(conn) => conn.reader().read(buf),
            Engine::Accepting(_) => Err(io::Error::from(io::ErrorKind::WouldBlock)),
        }
    }

    /// Queues plaintext for encryption. Does not itself produce ciphertext
    /// bytes — call `flush` afterwards to drain the engine.
    pub fn write_plaintext(&mut self, buf: &[u8]) -> Result<usize, SocketError> {
        match &mut self.engine {
            Engine::Ready(conn) => conn.writer().write(buf).map_err(SocketError::TransportWrite),
            Engine::Accepting(_) => {
                Err(SocketError::TlsHandshake(rustls::Error::General("write attempted before handshake completed".into())))
            }
        }
    }

    /// Starts the shutdown handshake by queuing a `close_notify` alert.
    /// Caller must still call `flush` to put it on the wire. A no-op while
    /// still parsing the ClientHello — there's no live connection yet to
    /// shut down.
    pub fn begin_shutdown(&mut self) {
        if let Engine::Ready(conn) = &mut self.engine {
            conn.send_close_notify();
        }
    }

    /// The engine's canonical "nothing left to do" state: not mid-handshake,
    /// nothing queued to write, and not expecting more to read. Resolves the
    /// shutdown-completion ambiguity by deferring entirely to rustls's own
    /// state rather than a fixed return-code sentinel.
    pub fn shutdown_complete(&self) -> bool {
        match &self.engine {
            Engine::Ready(conn) => !conn.is_handshaking() && !conn.wants_write() && !conn.wants_read(),
            Engine::Accepting(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::InputBuffer;
    use crate::transport::CiphertextOutput;

    #[test]
    fn new_substate_starts_handshaking() {
        let (pair, _certgen) = handshake_pair();
        assert!(pair.server.is_handshaking());
    }

    /// Builds a real `TlsContext` from an in-memory `rcgen` certificate by
    /// writing it to a temp file, since `TlsContextBuilder` only loads PEM
    /// from paths.
    struct Pair {
        server: TlsSubstate,
    }

    fn handshake_pair() -> (Pair, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let cert_pem = cert.cert.pem();
        let key_pem = cert.signing_key.serialize_pem();

        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        std::fs::write(&cert_path, cert_pem).unwrap();
        std::fs::write(&key_path, key_pem).unwrap();

        let ctx = TlsContext::builder()
            .alpn_protocols(&[b"h2", b"http/1.1"])
            .cert_chain_pem(&cert_path)
            .unwrap()
            .private_key_pem(&key_path)
            .unwrap()
            .build()
            .unwrap();

        (Pair { server: TlsSubstate::new(&ctx).unwrap() }, dir)
    }

    #[test]
    fn flush_with_nothing_queued_is_a_no_op() {
        let (mut pair, _dir) = handshake_pair();
        let mut encrypted_in = InputBuffer::new();
        let mut out = CiphertextOutput::new();
        pair.server.flush(&mut encrypted_in, &mut out).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn shutdown_is_not_complete_while_still_accepting_the_client_hello() {
        let (mut pair, _dir) = handshake_pair();
        // Nothing to shut down yet — `begin_shutdown` is a no-op before the
        // `ClientHello` has even been parsed, and completeness can't be
        // claimed with no live connection behind it.
        pair.server.begin_shutdown();
        assert!(!pair.server.wants_write());
        assert!(!pair.server.shutdown_complete());
    }

    #[test]
    fn read_and_write_plaintext_fail_before_the_client_hello_is_accepted() {
        let (mut pair, _dir) = handshake_pair();
        let mut buf = [0u8; 16];
        assert_eq!(pair.server.read_plaintext(&mut buf).unwrap_err().kind(), io::ErrorKind::WouldBlock);
        assert!(pair.server.write_plaintext(b"hi").is_err());
    }
}
