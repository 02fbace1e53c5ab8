//! End-to-end scenarios over real loopback TCP: plaintext echo, TLS
//! handshake with ALPN (preferred match, fallback, no match), and graceful
//! vs. aborted shutdown. The client side of every TLS scenario is a plain
//! `rustls::ClientConnection` driven synchronously on its own thread — this
//! crate never implements client-side TLS itself.

use std::cell::RefCell;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::rc::Rc;
use std::sync::Arc;
use std::thread;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, DigitallySignedStruct, SignatureScheme};

use tls_socket::reactor::native::{NativeBinding, NativeReactor};
use tls_socket::{EventLoop, TlsContext};

/// Accepts any certificate. Only ever used against the self-signed
/// certificate this test generates itself.
#[derive(Debug)]
struct NoVerify;

impl ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::ED25519,
        ]
    }
}

fn server_context(alpn: &[&[u8]]) -> (TlsContext, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
    let cert_path = dir.path().join("cert.pem");
    let key_path = dir.path().join("key.pem");
    std::fs::write(&cert_path, cert.cert.pem()).unwrap();
    std::fs::write(&key_path, cert.signing_key.serialize_pem()).unwrap();

    let ctx = TlsContext::builder()
        .alpn_protocols(alpn)
        .cert_chain_pem(&cert_path)
        .unwrap()
        .private_key_pem(&key_path)
        .unwrap()
        .build()
        .unwrap();
    (ctx, dir)
}

fn client_connection(alpn: &[&[u8]]) -> ClientConnection {
    let mut config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerify))
        .with_no_client_auth();
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    let server_name = ServerName::try_from("localhost").unwrap();
    ClientConnection::new(Arc::new(config), server_name).unwrap()
}

fn drive_client_handshake(conn: &mut ClientConnection, stream: &mut TcpStream) {
    while conn.is_handshaking() {
        conn.complete_io(stream).unwrap();
    }
}

struct ServerFixture {
    event_loop: EventLoop,
    sock: tls_socket::SocketHandle,
}

fn accept_into_event_loop(raw: TcpStream) -> ServerFixture {
    let reactor = Rc::new(NativeReactor::new().unwrap());
    let mut event_loop = EventLoop::new(reactor);
    let binding = Box::new(NativeBinding::new(raw).unwrap());
    let sock = event_loop.create_socket(binding);
    ServerFixture { event_loop, sock }
}

#[test]
fn plaintext_echo_round_trip() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let client_thread = thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).unwrap();
        buf
    });

    let (raw, _) = listener.accept().unwrap();
    let mut fixture = accept_into_event_loop(raw);

    let echoed = Rc::new(RefCell::new(false));
    let echoed2 = echoed.clone();
    fixture.sock.read_start(Box::new(move |sock, result| {
        result.unwrap();
        let data = sock.plaintext().as_slice().to_vec();
        sock.consume_plaintext(data.len());
        let echoed3 = echoed2.clone();
        sock.write(
            &[&data],
            Box::new(move |_, result| {
                result.unwrap();
                *echoed3.borrow_mut() = true;
            }),
        );
    }));

    for _ in 0..200 {
        fixture.event_loop.run_once(50).unwrap();
        if *echoed.borrow() {
            break;
        }
    }
    assert!(*echoed.borrow(), "server never completed the echo write");

    let received = client_thread.join().unwrap();
    assert_eq!(&received, b"ping");
}

#[test]
fn tls_handshake_negotiates_preferred_alpn_protocol() {
    let (ctx, _dir) = server_context(&[b"h2", b"http/1.1"]);
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let client_thread = thread::spawn(move || {
        let mut conn = client_connection(&[b"h2", b"http/1.1"]);
        let mut stream = TcpStream::connect(addr).unwrap();
        drive_client_handshake(&mut conn, &mut stream);
        conn.alpn_protocol().map(<[u8]>::to_vec)
    });

    let (raw, _) = listener.accept().unwrap();
    let mut fixture = accept_into_event_loop(raw);

    let negotiated = Rc::new(RefCell::new(None));
    let negotiated2 = negotiated.clone();
    fixture.sock.ssl_server_handshake(
        &ctx,
        Box::new(move |sock, result| {
            result.unwrap();
            *negotiated2.borrow_mut() = Some(sock.ssl_selected_protocol());
        }),
    );

    for _ in 0..400 {
        fixture.event_loop.run_once(50).unwrap();
        if negotiated.borrow().is_some() {
            break;
        }
    }

    let server_selected = negotiated.borrow().clone().expect("handshake callback never fired");
    assert_eq!(server_selected, b"h2");
    assert_eq!(client_thread.join().unwrap(), Some(b"h2".to_vec()));
}

#[test]
fn tls_handshake_falls_back_when_client_does_not_offer_the_preferred_protocol() {
    let (ctx, _dir) = server_context(&[b"h2", b"http/1.1"]);
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let client_thread = thread::spawn(move || {
        let mut conn = client_connection(&[b"http/1.1"]);
        let mut stream = TcpStream::connect(addr).unwrap();
        drive_client_handshake(&mut conn, &mut stream);
        conn.alpn_protocol().map(<[u8]>::to_vec)
    });

    let (raw, _) = listener.accept().unwrap();
    let mut fixture = accept_into_event_loop(raw);

    let negotiated = Rc::new(RefCell::new(None));
    let negotiated2 = negotiated.clone();
    fixture.sock.ssl_server_handshake(
        &ctx,
        Box::new(move |sock, result| {
            result.unwrap();
            *negotiated2.borrow_mut() = Some(sock.ssl_selected_protocol());
        }),
    );

    for _ in 0..400 {
        fixture.event_loop.run_once(50).unwrap();
        if negotiated.borrow().is_some() {
            break;
        }
    }

    assert_eq!(negotiated.borrow().clone().unwrap(), b"http/1.1");
    assert_eq!(client_thread.join().unwrap(), Some(b"http/1.1".to_vec()));
}

#[test]
fn tls_handshake_honors_client_alpn_preference_over_server_order() {
    // Server lists h2 first; client lists http/1.1 first. rustls's own
    // (server-preference) resolution would pick h2 — the live handshake
    // must instead resolve to http/1.1, the first protocol in the
    // *client's* offer order that the server also supports.
    let (ctx, _dir) = server_context(&[b"h2", b"http/1.1"]);
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let client_thread = thread::spawn(move || {
        let mut conn = client_connection(&[b"http/1.1", b"h2"]);
        let mut stream = TcpStream::connect(addr).unwrap();
        drive_client_handshake(&mut conn, &mut stream);
        conn.alpn_protocol().map(<[u8]>::to_vec)
    });

    let (raw, _) = listener.accept().unwrap();
    let mut fixture = accept_into_event_loop(raw);

    let negotiated = Rc::new(RefCell::new(None));
    let negotiated2 = negotiated.clone();
    fixture.sock.ssl_server_handshake(
        &ctx,
        Box::new(move |sock, result| {
            result.unwrap();
            *negotiated2.borrow_mut() = Some(sock.ssl_selected_protocol());
        }),
    );

    for _ in 0..400 {
        fixture.event_loop.run_once(50).unwrap();
        if negotiated.borrow().is_some() {
            break;
        }
    }

    let server_selected = negotiated.borrow().clone().expect("handshake callback never fired");
    assert_eq!(server_selected, b"http/1.1", "client preference order must win over the server's own list order");
    assert_eq!(client_thread.join().unwrap(), Some(b"http/1.1".to_vec()));
}

#[test]
fn tls_handshake_fails_when_no_alpn_protocol_matches() {
    let (ctx, _dir) = server_context(&[b"h2"]);
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let client_thread = thread::spawn(move || {
        let mut conn = client_connection(&[b"spdy/3"]);
        let mut stream = TcpStream::connect(addr).unwrap();
        // The server will reject the connection with a no_application_protocol
        // alert; the client sees that as a handshake I/O error rather than
        // completing `is_handshaking() == false`.
        let mut saw_error = false;
        for _ in 0..50 {
            if let Err(_) = conn.complete_io(&mut stream) {
                saw_error = true;
                break;
            }
            if !conn.is_handshaking() {
                break;
            }
        }
        saw_error
    });

    let (raw, _) = listener.accept().unwrap();
    let mut fixture = accept_into_event_loop(raw);

    let outcome = Rc::new(RefCell::new(None));
    let outcome2 = outcome.clone();
    fixture.sock.ssl_server_handshake(
        &ctx,
        Box::new(move |_sock, result| {
            *outcome2.borrow_mut() = Some(result.is_ok());
        }),
    );

    for _ in 0..400 {
        fixture.event_loop.run_once(50).unwrap();
        if outcome.borrow().is_some() {
            break;
        }
    }

    assert_eq!(outcome.borrow().clone(), Some(false), "handshake should fail with no ALPN match");
    assert!(client_thread.join().unwrap(), "client should observe the handshake failure too");
}

#[test]
fn graceful_close_disposes_the_socket_after_close_notify_round_trip() {
    let (ctx, _dir) = server_context(&[b"http/1.1"]);
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let client_thread = thread::spawn(move || {
        let mut conn = client_connection(&[b"http/1.1"]);
        let mut stream = TcpStream::connect(addr).unwrap();
        drive_client_handshake(&mut conn, &mut stream);
        // Drain until the server's close_notify arrives.
        let mut buf = [0u8; 16];
        loop {
            conn.complete_io(&mut stream).unwrap();
            match conn.reader().read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => panic!("unexpected client read error: {e}"),
            }
        }
    });

    let (raw, _) = listener.accept().unwrap();
    let mut fixture = accept_into_event_loop(raw);

    let handshake_done = Rc::new(RefCell::new(false));
    let handshake_done2 = handshake_done.clone();
    let sock_for_close = fixture.sock.clone();
    fixture.sock.ssl_server_handshake(
        &ctx,
        Box::new(move |sock, result| {
            result.unwrap();
            sock.close();
            *handshake_done2.borrow_mut() = true;
        }),
    );

    for _ in 0..400 {
        fixture.event_loop.run_once(50).unwrap();
        if *handshake_done.borrow() && sock_for_close.is_closed() {
            break;
        }
    }

    assert!(sock_for_close.is_closed(), "socket should be disposed once shutdown completes");
    client_thread.join().unwrap();
}

#[test]
fn peer_closing_the_transport_mid_handshake_reports_a_handshake_error() {
    let (ctx, _dir) = server_context(&[b"http/1.1"]);
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    // Connect and immediately drop the stream without sending a ClientHello,
    // aborting the handshake before it starts.
    let client_thread = thread::spawn(move || {
        let stream = TcpStream::connect(addr).unwrap();
        drop(stream);
    });

    let (raw, _) = listener.accept().unwrap();
    let mut fixture = accept_into_event_loop(raw);

    let outcome = Rc::new(RefCell::new(None));
    let outcome2 = outcome.clone();
    fixture.sock.ssl_server_handshake(
        &ctx,
        Box::new(move |_sock, result| {
            *outcome2.borrow_mut() = Some(result.is_ok());
        }),
    );

    for _ in 0..200 {
        fixture.event_loop.run_once(50).unwrap();
        if outcome.borrow().is_some() {
            break;
        }
    }

    assert_eq!(outcome.borrow().clone(), Some(false), "aborted handshake should report failure, not hang");
    client_thread.join().unwrap();
}
