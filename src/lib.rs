//! Non-blocking socket abstraction with transparent TLS termination and
//! ALPN/NPN protocol negotiation, modeled on h2o's `h2o_socket_t`.
//!
//! A [`socket::SocketHandle`] exposes a uniform read/write/close interface
//! whether or not TLS is attached; attaching TLS via
//! [`socket::SocketHandle::ssl_server_handshake`] drives the handshake,
//! decode-input, and shutdown state machines transparently underneath the
//! same façade. [`reactor`] provides two interchangeable event-loop
//! bindings (a built-in epoll/kqueue reactor, and an optional `mio`-backed
//! one) behind one contract.

pub mod accept;
pub mod alpn;
pub mod buffer;
pub mod config;
pub mod error;
pub mod pool;
pub mod reactor;
pub mod socket;
pub mod tls;
pub mod transport;
pub mod util;

pub use config::{ConfigError, TlsContext, TlsContextBuilder};
pub use error::SocketError;
pub use reactor::{EventLoopBinding, Interest, ReadinessRegistry};
pub use socket::{EventLoop, HandshakeCallback, ReadCallback, SocketHandle, WriteCallback};
