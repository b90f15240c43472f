//! Connection lifecycle
//!
//! [`Connector::connect`] runs the whole sequence: parameter checks,
//! credential binding (fail fast), optional protocol settings (best effort),
//! the TCP connect through the [`Sockets`] collaborator, and the verified
//! handshake. The resulting [`Connection`] owns the channel until
//! [`Connection::disconnect`].
//!
//! # Example
//!
//! ```no_run
//! use hsm_tls::net::ServerInfo;
//! use hsm_tls::tls::{Connector, Credentials, ProviderKeyStore};
//!
//! let keys = ProviderKeyStore::new("/usr/lib/ossl-modules/hsm_provider.so");
//! let credentials = Credentials::builder()
//!     .root_ca("certs/root-ca.pem")
//!     .client_cert("certs/device.pem")
//!     .key_id("0xe0f1")
//!     .alpn(&["x-amzn-mqtt-ca"])
//!     .unwrap()
//!     .build()
//!     .unwrap();
//!
//! let connector = Connector::new(keys);
//! let mut conn = connector
//!     .connect(&ServerInfo::new("broker.example.com", 8883), &credentials)
//!     .unwrap();
//!
//! conn.send(b"hello").unwrap();
//! conn.disconnect();
//! ```

use super::config::{Credentials, TlsError, TransportConfig};
use super::handshake::SessionNegotiator;
use super::provider::KeyProvider;
use super::session::{OpenSslSession, TransportSession};
use super::status::Status;
use super::vars::SessionInfo;
use crate::net::{ServerInfo, Sockets, TcpSockets};
use std::fmt;
use std::sync::Arc;

/// Shared socket collaborator
pub type SharedSockets = Arc<dyn Sockets + Send + Sync>;

/// Opens mutually authenticated TLS connections
pub struct Connector<K> {
    keys: K,
    sockets: SharedSockets,
    config: TransportConfig,
}

impl<K: KeyProvider> Connector<K> {
    /// Connector using plain TCP sockets and default timeouts
    pub fn new(keys: K) -> Self {
        Connector {
            keys,
            sockets: Arc::new(TcpSockets::new()),
            config: TransportConfig::default(),
        }
    }

    pub fn sockets(mut self, sockets: SharedSockets) -> Self {
        self.sockets = sockets;
        self
    }

    pub fn config(mut self, config: TransportConfig) -> Self {
        self.config = config;
        self
    }

    pub fn key_provider(&self) -> &K {
        &self.keys
    }

    pub fn transport_config(&self) -> &TransportConfig {
        &self.config
    }

    /// Connect and authenticate
    ///
    /// On failure `TlsError::status()` gives the outcome code. Everything
    /// acquired along the way is released before this returns.
    pub fn connect(&self, server: &ServerInfo, credentials: &Credentials) -> Result<Connection, TlsError> {
        match self.establish(server, credentials) {
            Ok(conn) => {
                tracing::info!(
                    host = %server.host_name,
                    port = server.port,
                    session = %conn.info,
                    "Established a TLS connection"
                );
                Ok(conn)
            }
            Err(e) => {
                tracing::error!(
                    host = %server.host_name,
                    port = server.port,
                    status = %e.status(),
                    error = %e,
                    "Failed to establish a TLS connection"
                );
                Err(e)
            }
        }
    }

    fn establish(&self, server: &ServerInfo, credentials: &Credentials) -> Result<Connection, TlsError> {
        server.validate().map_err(|e| {
            tracing::error!(error = %e, "parameter check failed");
            e
        })?;

        let mut negotiator = SessionNegotiator::new()?;
        negotiator.bind_credentials(credentials, &self.keys)?;
        negotiator.set_options(credentials)?;

        let stream = self
            .sockets
            .connect(server, self.config.send_timeout, self.config.recv_timeout)?;

        // The handshake consumes the stream; keep a descriptor for teardown
        let teardown = match stream.try_clone() {
            Ok(copy) => copy,
            Err(e) => {
                self.teardown(&stream);
                return Err(TlsError::Io(e));
            }
        };

        let stream = match negotiator.handshake(stream, &server.host_name) {
            Ok(stream) => stream,
            Err(e) => {
                self.teardown(&teardown);
                return Err(e);
            }
        };
        drop(teardown);

        let info = SessionInfo::from_ssl(stream.ssl(), negotiator.applied_options());

        Ok(Connection {
            session: Some(TransportSession::new(OpenSslSession::new(stream))),
            sockets: Arc::clone(&self.sockets),
            server: server.clone(),
            info,
        })
    }

    fn teardown(&self, stream: &std::net::TcpStream) {
        if let Err(e) = self.sockets.disconnect(stream) {
            tracing::warn!(error = %e, "socket teardown after failed connect");
        }
    }
}

impl<K> fmt::Debug for Connector<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// An established channel
pub struct Connection {
    session: Option<TransportSession<OpenSslSession>>,
    sockets: SharedSockets,
    server: ServerInfo,
    info: SessionInfo,
}

impl Connection {
    fn session_mut(&mut self) -> Result<&mut TransportSession<OpenSslSession>, TlsError> {
        self.session.as_mut().ok_or_else(|| {
            tracing::error!("parameter check failed: connection is not established");
            TlsError::NotConnected
        })
    }

    /// Receive application data; `Ok(0)` means try again
    pub fn recv(&mut self, buf: &mut [u8]) -> Result<usize, TlsError> {
        self.session_mut()?.recv(buf)
    }

    /// Send application data; `Ok(0)` means try again
    pub fn send(&mut self, buf: &[u8]) -> Result<usize, TlsError> {
        self.session_mut()?.send(buf)
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// Parameters negotiated during the handshake
    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub fn negotiated_alpn(&self) -> Option<&str> {
        self.info.alpn.as_deref()
    }

    pub fn server(&self) -> &ServerInfo {
        &self.server
    }

    /// Close the TLS session and tear down the socket
    ///
    /// Calling this again on a closed connection does nothing and returns
    /// [`Status::InvalidParameter`].
    pub fn disconnect(&mut self) -> Status {
        let mut session = match self.session.take() {
            Some(session) => session,
            None => {
                tracing::error!("parameter check failed: connection already closed");
                return Status::InvalidParameter;
            }
        };

        if let Err(e) = session.close() {
            tracing::warn!(error = %e, "TLS shutdown failed");
        }

        let status = Status::from(self.sockets.disconnect(session.get_ref().get_ref()));
        match status {
            Status::Success => {
                tracing::debug!(host = %self.server.host_name, "TLS connection closed")
            }
            Status::InvalidParameter => {
                tracing::error!("socket teardown rejected the descriptor")
            }
            other => tracing::error!(status = %other, "unexpected status from socket teardown"),
        }
        status
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("server", &self.server)
            .field("connected", &self.is_connected())
            .field("info", &self.info)
            .finish()
    }
}
