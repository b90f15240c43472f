//! Non-blocking I/O over a blocking TLS stream
//!
//! The TLS stream itself always blocks. [`TransportSession`] puts a
//! zero-timeout readiness probe in front of it so callers polling in a loop
//! get `Ok(0)` ("nothing yet, try again") instead of stalling for the socket
//! timeout. `Ok(0)` means retry; every hard failure is an `Err`.

use super::config::TlsError;
use openssl::ssl::{ErrorCode, ShutdownResult, SslRef, SslStream};
use std::fmt;
use std::io;
use std::net::TcpStream;
use std::os::fd::AsRawFd;
use std::time::Duration;

/// Poll events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEvents {
    Read,
    Write,
    Both,
}

/// How a failed stream operation should be treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamErrorKind {
    /// Transient; the operation can be retried
    Retry,
    /// The underlying socket failed
    Transport,
    /// Any other TLS-level failure, including the peer closing the session
    Protocol,
}

/// Failed read/write on the encrypted stream
#[derive(Debug, thiserror::Error)]
pub struct StreamError {
    pub kind: StreamErrorKind,
    pub message: String,
}

impl StreamError {
    pub fn new(kind: StreamErrorKind, message: impl Into<String>) -> Self {
        StreamError {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            StreamErrorKind::Retry => "retry",
            StreamErrorKind::Transport => "transport",
            StreamErrorKind::Protocol => "protocol",
        };
        write!(f, "{} error: {}", kind, self.message)
    }
}

impl From<openssl::ssl::Error> for StreamError {
    fn from(e: openssl::ssl::Error) -> Self {
        let kind = match e.code() {
            ErrorCode::WANT_READ => StreamErrorKind::Retry,
            ErrorCode::SYSCALL => StreamErrorKind::Transport,
            _ => StreamErrorKind::Protocol,
        };
        StreamError::new(kind, e.to_string())
    }
}

/// Session operations trait
///
/// The primitive operations the shim is built from: a readiness probe, a
/// count of already decrypted bytes, and blocking read/write/close.
pub trait SessionOps {
    /// Poll the session for events
    ///
    /// Returns true if the session is ready for the requested operation
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> io::Result<bool>;

    /// Bytes of application data already decrypted and buffered
    fn pending(&self) -> usize;

    /// Blocking read of application data
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, StreamError>;

    /// Blocking write of application data
    fn write(&mut self, buf: &[u8]) -> Result<usize, StreamError>;

    /// Close the session
    fn close(&mut self) -> Result<(), StreamError>;
}

/// Poll a raw descriptor
pub(crate) fn poll_fd(fd: i32, events: PollEvents, timeout: Option<Duration>) -> io::Result<bool> {
    use libc::{poll, pollfd, POLLIN, POLLOUT, POLLPRI};

    // POLLPRI covers urgent data, POLLIN everything else
    let mut pfd = pollfd {
        fd,
        events: match events {
            PollEvents::Read => POLLIN | POLLPRI,
            PollEvents::Write => POLLOUT,
            PollEvents::Both => POLLIN | POLLPRI | POLLOUT,
        },
        revents: 0,
    };

    let timeout_ms = timeout
        .map(|d| d.as_millis().min(i32::MAX as u128) as i32)
        .unwrap_or(-1); // -1 = infinite

    let result = unsafe { poll(&mut pfd as *mut pollfd, 1, timeout_ms) };

    if result < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(result > 0)
}

/// TLS session over an OpenSSL stream
pub struct OpenSslSession {
    stream: SslStream<TcpStream>,
    failed: bool,
}

impl OpenSslSession {
    pub fn new(stream: SslStream<TcpStream>) -> Self {
        OpenSslSession {
            stream,
            failed: false,
        }
    }

    /// Check if a fatal I/O error occurred
    pub fn failed(&self) -> bool {
        self.failed
    }

    pub fn ssl(&self) -> &SslRef {
        self.stream.ssl()
    }

    /// Get reference to underlying TCP stream
    pub fn get_ref(&self) -> &TcpStream {
        self.stream.get_ref()
    }

    fn record(&mut self, err: StreamError) -> StreamError {
        if err.kind != StreamErrorKind::Retry {
            self.failed = true;
        }
        err
    }
}

impl SessionOps for OpenSslSession {
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> io::Result<bool> {
        poll_fd(self.stream.get_ref().as_raw_fd(), events, timeout)
    }

    fn pending(&self) -> usize {
        self.stream.ssl().pending()
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, StreamError> {
        self.stream.ssl_read(buf).map_err(|e| {
            let err = StreamError::from(e);
            self.record(err)
        })
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, StreamError> {
        self.stream.ssl_write(buf).map_err(|e| {
            let err = StreamError::from(e);
            self.record(err)
        })
    }

    fn close(&mut self) -> Result<(), StreamError> {
        // No close_notify after a fatal error
        if self.failed {
            return Ok(());
        }

        // First call sends our close_notify; if the peer's has not arrived
        // yet, a second call waits for it.
        match self.stream.shutdown() {
            Ok(ShutdownResult::Sent) => {
                if let Err(e) = self.stream.shutdown() {
                    tracing::debug!(error = %e, "peer did not complete TLS shutdown");
                }
                Ok(())
            }
            Ok(ShutdownResult::Received) => Ok(()),
            Err(e) => {
                let err = StreamError::from(e);
                Err(self.record(err))
            }
        }
    }
}

/// Retry-aware wrapper around a session
///
/// Both operations validate their input first and return an error, never
/// `Ok(0)`, for an empty buffer.
pub struct TransportSession<S: SessionOps> {
    session: S,
}

impl<S: SessionOps> TransportSession<S> {
    pub fn new(session: S) -> Self {
        TransportSession { session }
    }

    /// Read decrypted data
    ///
    /// A request for more than one byte, or one made while decrypted data
    /// is already buffered, goes straight to the blocking read. A single
    /// byte request first probes the socket with a zero timeout and returns
    /// `Ok(0)` if nothing has arrived.
    pub fn recv(&mut self, buf: &mut [u8]) -> Result<usize, TlsError> {
        if buf.is_empty() {
            tracing::error!("parameter check failed: receive buffer is empty");
            return Err(TlsError::InvalidParameter("receive buffer is empty".to_string()));
        }

        let should_read = if buf.len() > 1 || self.session.pending() > 0 {
            true
        } else {
            self.session
                .poll(PollEvents::Read, Some(Duration::ZERO))
                .map_err(|e| {
                    tracing::error!(error = %e, "readiness check before receive failed");
                    TlsError::Io(e)
                })?
        };

        if !should_read {
            return Ok(0);
        }

        // The socket may only hold part of a record, so a read can
        // legitimately produce no application data.
        match self.session.read(buf) {
            Ok(n) if n > 0 => Ok(n),
            Ok(_) => Err(TlsError::Stream(StreamError::new(
                StreamErrorKind::Protocol,
                "read returned no data",
            ))),
            Err(e) => match e.kind {
                StreamErrorKind::Retry => Ok(0),
                StreamErrorKind::Transport => {
                    tracing::error!(error = %e, "failed to receive data: socket error");
                    Err(TlsError::Stream(e))
                }
                StreamErrorKind::Protocol => {
                    tracing::error!(error = %e, "failed to receive data over network");
                    Err(TlsError::Stream(e))
                }
            },
        }
    }

    /// Write data for encryption and transmission
    ///
    /// Probes write readiness with a zero timeout and returns `Ok(0)` if the
    /// socket cannot take more data right now.
    pub fn send(&mut self, buf: &[u8]) -> Result<usize, TlsError> {
        if buf.is_empty() {
            tracing::error!("parameter check failed: send buffer is empty");
            return Err(TlsError::InvalidParameter("send buffer is empty".to_string()));
        }

        let ready = self
            .session
            .poll(PollEvents::Write, Some(Duration::ZERO))
            .map_err(|e| {
                tracing::error!(error = %e, "unable to send TLS data: socket availability check failed");
                TlsError::Io(e)
            })?;

        if !ready {
            return Ok(0);
        }

        // A blocking write never asks to be retried, so a write that makes
        // no progress is a failure.
        match self.session.write(buf) {
            Ok(n) if n > 0 => Ok(n),
            Ok(_) => {
                tracing::error!("failed to send data over network: no progress");
                Err(TlsError::Stream(StreamError::new(
                    StreamErrorKind::Protocol,
                    "write made no progress",
                )))
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to send data over network");
                Err(TlsError::Stream(e))
            }
        }
    }

    pub fn close(&mut self) -> Result<(), TlsError> {
        self.session.close().map_err(TlsError::from)
    }

    /// Get a reference to the underlying session
    pub fn get_ref(&self) -> &S {
        &self.session
    }

    /// Get a mutable reference to the underlying session
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.session
    }
}
