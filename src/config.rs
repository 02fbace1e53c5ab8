//! TLS server configuration: loads a PEM certificate chain and private key,
//! sets the ALPN protocol list in preference order, and holds the resulting
//! `rustls::ServerConfig` as a shared, read-mostly `Arc` (the "TLS Context").
//!
//! Server-only: no `ClientConfig`, no root store, no `webpki-roots` —
//! client-side TLS is out of scope here.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io { path: String, #[source] source: io::Error },
    #[error("no private key found in {0}")]
    MissingPrivateKey(String),
    #[error("invalid TLS configuration: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Shared, cloneable handle to a built server configuration.
///
/// Retains the cert chain, private key, and ALPN list alongside the built
/// `ServerConfig` (not just the config) because the handshake path rebuilds
/// a single-protocol config per connection once it has picked a protocol
/// under the client-preference rule (`config_with_alpn`) — `rustls` has no
/// hook to override its own (server-preference) internal ALPN resolution.
pub struct TlsContext {
    inner: Arc<ServerConfig>,
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    alpn_protocols: Vec<Vec<u8>>,
}

impl Clone for TlsContext {
    /// `PrivateKeyDer` deliberately doesn't implement `Clone` (it guards key
    /// material), so this goes through its explicit `clone_key()` escape
    /// hatch rather than a derive.
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            cert_chain: self.cert_chain.clone(),
            key: self.key.clone_key(),
            alpn_protocols: self.alpn_protocols.clone(),
        }
    }
}

impl TlsContext {
    pub fn builder() -> TlsContextBuilder {
        TlsContextBuilder::default()
    }

    /// The base config, used verbatim when ALPN negotiation has no offers
    /// to resolve (no client offer list, or no match).
    pub(crate) fn inner(&self) -> Arc<ServerConfig> {
        self.inner.clone()
    }

    /// The server's ALPN list in preference order, for the handshake path
    /// to run the client-preference selection law against.
    pub(crate) fn alpn_protocols(&self) -> &[Vec<u8>] {
        &self.alpn_protocols
    }

    /// Rebuilds a `ServerConfig` carrying only `selected` as the negotiated
    /// ALPN protocol, so rustls reports exactly that protocol regardless of
    /// its own internal (server-preference) resolution order.
    pub(crate) fn config_with_alpn(&self, selected: &[u8]) -> Result<Arc<ServerConfig>, ConfigError> {
        let mut config =
            ServerConfig::builder().with_no_client_auth().with_single_cert(self.cert_chain.clone(), self.key.clone_key())?;
        config.alpn_protocols = vec![selected.to_vec()];
        Ok(Arc::new(config))
    }
}

#[derive(Default)]
pub struct TlsContextBuilder {
    cert_chain: Vec<CertificateDer<'static>>,
    key: Option<PrivateKeyDer<'static>>,
    alpn_protocols: Vec<Vec<u8>>,
}

impl TlsContextBuilder {
    /// Loads a PEM-encoded certificate chain (leaf first, intermediates
    /// after), appending to any chain already loaded.
    pub fn cert_chain_pem(mut self, path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| ConfigError::Io { path: path.display().to_string(), source })?;
        let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut BufReader::new(file))
            .collect::<Result<_, _>>()
            .map_err(|source| ConfigError::Io { path: path.display().to_string(), source })?;
        self.cert_chain.extend(certs);
        Ok(self)
    }

    /// Loads a PEM-encoded private key (PKCS#8, PKCS#1, or SEC1).
    pub fn private_key_pem(mut self, path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| ConfigError::Io { path: path.display().to_string(), source })?;
        let key = rustls_pemfile::private_key(&mut BufReader::new(file))
            .map_err(|source| ConfigError::Io { path: path.display().to_string(), source })?
            .ok_or_else(|| ConfigError::MissingPrivateKey(path.display().to_string()))?;
        self.key = Some(key);
        Ok(self)
    }

    /// Sets the ALPN protocol list, most preferred first.
    pub fn alpn_protocols(mut self, protocols: &[&[u8]]) -> Self {
        self.alpn_protocols = protocols.iter().map(|p| p.to_vec()).collect();
        self
    }

    pub fn build(self) -> Result<TlsContext, ConfigError> {
        let key = self.key.ok_or_else(|| ConfigError::MissingPrivateKey("<none supplied>".into()))?;
        let mut config =
            ServerConfig::builder().with_no_client_auth().with_single_cert(self.cert_chain.clone(), key.clone_key())?;
        config.alpn_protocols = self.alpn_protocols.clone();
        Ok(TlsContext { inner: Arc::new(config), cert_chain: self.cert_chain, key, alpn_protocols: self.alpn_protocols })
    }
}
