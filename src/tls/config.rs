//! TLS configuration
//!
//! This module provides the credential bundle presented during the
//! handshake, the ALPN wire encoding, and the transport timeouts.

use bytes::{BufMut, Bytes, BytesMut};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::session::StreamError;

/// TLS errors
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("OpenSSL error: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Socket error: {0}")]
    Socket(#[from] crate::net::Error),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Crypto provider error: {0}")]
    Provider(String),

    #[error("Failed to resolve key '{key_id}': {reason}")]
    KeyResolution { key_id: String, reason: String },

    #[error("Failed to open {label} at {}: {source}", path.display())]
    CredentialFile {
        label: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {label}: {reason}")]
    CertificateParse { label: &'static str, reason: String },

    #[error("Failed to add root CA to certificate store: {0}")]
    CertStore(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Private key does not match certificate: {0}")]
    KeyMismatch(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Peer verification failed: {0}")]
    Verification(String),

    #[error("Invalid negotiator state: {0}")]
    InvalidState(String),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("Connection is not established")]
    NotConnected,
}

/// Log every entry of an OpenSSL error stack
pub(crate) fn log_openssl_errors(context: &str, stack: &openssl::error::ErrorStack) {
    for err in stack.errors() {
        tracing::error!(
            context,
            library = err.library().unwrap_or("<unknown>"),
            reason = err.reason().unwrap_or("<unknown>"),
            code = err.code(),
            "OpenSSL error"
        );
    }
}

/// Default send timeout handed to the socket layer
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_millis(5000);

/// Default receive timeout handed to the socket layer
pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_millis(5000);

/// ALPN protocol list in wire format (each name prefixed by its length)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlpnProtocols(Bytes);

impl AlpnProtocols {
    /// Encode protocol names into the length-prefixed wire format
    pub fn from_names(protocols: &[&str]) -> Result<Self, TlsError> {
        let mut buf = BytesMut::new();
        for proto in protocols {
            let len = proto.len();
            if len == 0 || len > u8::MAX as usize {
                return Err(TlsError::InvalidConfig(format!(
                    "ALPN protocol name must be 1-255 bytes, got {} for '{}'",
                    len, proto
                )));
            }
            buf.put_u8(len as u8);
            buf.put_slice(proto.as_bytes());
        }
        Ok(AlpnProtocols(buf.freeze()))
    }

    /// Take an already encoded wire-format list
    pub fn from_wire(wire: impl Into<Bytes>) -> Result<Self, TlsError> {
        let wire = wire.into();
        let mut pos = 0;
        while pos < wire.len() {
            let len = wire[pos] as usize;
            if len == 0 || pos + 1 + len > wire.len() {
                return Err(TlsError::InvalidConfig(format!(
                    "malformed ALPN wire list at offset {}",
                    pos
                )));
            }
            pos += 1 + len;
        }
        Ok(AlpnProtocols(wire))
    }

    pub fn as_wire(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over the protocol names
    pub fn names(&self) -> impl Iterator<Item = &[u8]> + '_ {
        let wire = &self.0[..];
        let mut pos = 0;
        std::iter::from_fn(move || {
            if pos >= wire.len() {
                return None;
            }
            let len = wire[pos] as usize;
            let name = &wire[pos + 1..pos + 1 + len];
            pos += 1 + len;
            Some(name)
        })
    }
}

/// Credential bundle for one connection attempt (immutable after building)
///
/// The root CA is mandatory. The client certificate and the HSM key
/// identifier come as a pair: either both are set (mutual authentication)
/// or neither is.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub(crate) root_ca_path: PathBuf,
    pub(crate) client_cert_path: Option<PathBuf>,
    pub(crate) key_id: Option<String>,
    pub(crate) sni_host_name: Option<String>,
    pub(crate) alpn_protocols: AlpnProtocols,
    pub(crate) max_fragment_length: u16,
}

impl Credentials {
    /// Create a new credentials builder
    pub fn builder() -> CredentialsBuilder {
        CredentialsBuilder::default()
    }

    pub fn root_ca_path(&self) -> &Path {
        &self.root_ca_path
    }

    pub fn client_cert_path(&self) -> Option<&Path> {
        self.client_cert_path.as_deref()
    }

    pub fn key_id(&self) -> Option<&str> {
        self.key_id.as_deref()
    }

    pub fn sni_host_name(&self) -> Option<&str> {
        self.sni_host_name.as_deref()
    }

    pub fn alpn_protocols(&self) -> &AlpnProtocols {
        &self.alpn_protocols
    }

    /// Maximum send fragment length; 0 leaves the library default
    pub fn max_fragment_length(&self) -> u16 {
        self.max_fragment_length
    }

    /// Whether a client certificate will be presented
    pub fn is_mutual_auth(&self) -> bool {
        self.client_cert_path.is_some()
    }
}

/// Credentials builder
#[derive(Debug, Default)]
pub struct CredentialsBuilder {
    root_ca_path: Option<PathBuf>,
    client_cert_path: Option<PathBuf>,
    key_id: Option<String>,
    sni_host_name: Option<String>,
    alpn_protocols: AlpnProtocols,
    max_fragment_length: u16,
}

impl CredentialsBuilder {
    /// Root CA used to verify the server certificate chain
    pub fn root_ca<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.root_ca_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Client certificate chain (leaf first) presented for mutual auth
    pub fn client_cert<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.client_cert_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Identifier of the private key slot inside the HSM
    pub fn key_id(mut self, key_id: impl Into<String>) -> Self {
        self.key_id = Some(key_id.into());
        self
    }

    /// Server name sent in the SNI extension
    pub fn sni_host_name(mut self, name: impl Into<String>) -> Self {
        self.sni_host_name = Some(name.into());
        self
    }

    /// ALPN protocols, by name
    pub fn alpn(mut self, protocols: &[&str]) -> Result<Self, TlsError> {
        self.alpn_protocols = AlpnProtocols::from_names(protocols)?;
        Ok(self)
    }

    /// ALPN protocols, already in wire format
    pub fn alpn_wire(mut self, wire: impl Into<Bytes>) -> Result<Self, TlsError> {
        self.alpn_protocols = AlpnProtocols::from_wire(wire)?;
        Ok(self)
    }

    /// Maximum send fragment length (0 = unset)
    pub fn max_fragment_length(mut self, len: u16) -> Self {
        self.max_fragment_length = len;
        self
    }

    /// Build the credentials
    pub fn build(self) -> Result<Credentials, TlsError> {
        let root_ca_path = self.root_ca_path.ok_or_else(|| {
            TlsError::InvalidConfig("root CA path is required".to_string())
        })?;

        let key_id = match self.key_id {
            Some(id) if id.is_empty() => {
                return Err(TlsError::InvalidConfig("key identifier is empty".to_string()))
            }
            other => other,
        };

        match (&self.client_cert_path, &key_id) {
            (Some(_), None) => {
                return Err(TlsError::InvalidConfig(
                    "client certificate set without a key identifier".to_string(),
                ))
            }
            (None, Some(_)) => {
                return Err(TlsError::InvalidConfig(
                    "key identifier set without a client certificate".to_string(),
                ))
            }
            _ => {}
        }

        if matches!(&self.sni_host_name, Some(name) if name.is_empty()) {
            return Err(TlsError::InvalidConfig("SNI host name is empty".to_string()));
        }

        Ok(Credentials {
            root_ca_path,
            client_cert_path: self.client_cert_path,
            key_id,
            sni_host_name: self.sni_host_name,
            alpn_protocols: self.alpn_protocols,
            max_fragment_length: self.max_fragment_length,
        })
    }
}

/// Transport timeouts passed through to the socket layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportConfig {
    pub send_timeout: Duration,
    pub recv_timeout: Duration,
}

impl TransportConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn recv_timeout(mut self, timeout: Duration) -> Self {
        self.recv_timeout = timeout;
        self
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            send_timeout: DEFAULT_SEND_TIMEOUT,
            recv_timeout: DEFAULT_RECV_TIMEOUT,
        }
    }
}
