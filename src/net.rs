//! TCP socket collaborator
//!
//! The TLS layer never opens sockets itself. It asks a [`Sockets`]
//! implementation for a connected stream and hands the stream back for
//! teardown. [`TcpSockets`] is the default implementation built on `socket2`.

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Socket layer errors
///
/// These map one-to-one onto the socket statuses of the transport outcome.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid socket parameter: {0}")]
    InvalidParameter(String),

    #[error("DNS resolution failed for {host}: {reason}")]
    DnsFailure { host: String, reason: String },

    #[error("Connection to {addr} failed: {source}")]
    ConnectFailure {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Server to connect to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    /// Host name, used for DNS and for peer identity verification
    pub host_name: String,
    /// TCP port
    pub port: u16,
}

impl ServerInfo {
    pub fn new(host_name: impl Into<String>, port: u16) -> Self {
        ServerInfo {
            host_name: host_name.into(),
            port,
        }
    }

    /// Check that host name and port are usable
    pub fn validate(&self) -> Result<(), Error> {
        if self.host_name.is_empty() {
            return Err(Error::InvalidParameter("host name is empty".to_string()));
        }
        if self.port == 0 {
            return Err(Error::InvalidParameter("port is zero".to_string()));
        }
        Ok(())
    }
}

/// Socket operations used by the TLS transport
pub trait Sockets {
    /// Resolve and connect to the server, applying send/receive timeouts
    fn connect(
        &self,
        server: &ServerInfo,
        send_timeout: Duration,
        recv_timeout: Duration,
    ) -> Result<TcpStream, Error>;

    /// Tear down a connected stream
    fn disconnect(&self, stream: &TcpStream) -> Result<(), Error>;
}

/// Blocking TCP sockets via `socket2`
#[derive(Debug, Clone, Default)]
pub struct TcpSockets {
    connect_timeout: Option<Duration>,
}

impl TcpSockets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound the TCP connect itself (defaults to the OS timeout)
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    fn connect_addr(
        &self,
        addr: SocketAddr,
        send_timeout: Duration,
        recv_timeout: Duration,
    ) -> std::io::Result<TcpStream> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        let addr = SockAddr::from(addr);

        match self.connect_timeout {
            Some(timeout) => socket.connect_timeout(&addr, timeout)?,
            None => socket.connect(&addr)?,
        }

        // A zero duration means "no timeout" here; socket2 rejects Some(0).
        socket.set_write_timeout(non_zero(send_timeout))?;
        socket.set_read_timeout(non_zero(recv_timeout))?;
        socket.set_nodelay(true)?;

        Ok(socket.into())
    }
}

fn non_zero(d: Duration) -> Option<Duration> {
    if d.is_zero() {
        None
    } else {
        Some(d)
    }
}

impl Sockets for TcpSockets {
    fn connect(
        &self,
        server: &ServerInfo,
        send_timeout: Duration,
        recv_timeout: Duration,
    ) -> Result<TcpStream, Error> {
        server.validate()?;

        let addrs: Vec<_> = (server.host_name.as_str(), server.port)
            .to_socket_addrs()
            .map_err(|e| Error::DnsFailure {
                host: server.host_name.clone(),
                reason: e.to_string(),
            })?
            .collect();

        let mut last_err = None;
        for &addr in &addrs {
            match self.connect_addr(addr, send_timeout, recv_timeout) {
                Ok(stream) => {
                    tracing::debug!(host = %server.host_name, %addr, "TCP connection established");
                    return Ok(stream);
                }
                Err(e) => {
                    tracing::debug!(%addr, error = %e, "TCP connect attempt failed");
                    last_err = Some((addr, e));
                }
            }
        }

        match last_err {
            Some((addr, source)) => Err(Error::ConnectFailure {
                addr: addr.to_string(),
                source,
            }),
            None => Err(Error::DnsFailure {
                host: server.host_name.clone(),
                reason: "no addresses returned".to_string(),
            }),
        }
    }

    fn disconnect(&self, stream: &TcpStream) -> Result<(), Error> {
        match stream.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            // Peer already gone; the descriptor is still released on drop.
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(Error::InvalidParameter(format!("shutdown failed: {}", e))),
        }
    }
}
