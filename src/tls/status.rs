//! Transport outcome codes
//!
//! Every connection attempt ends in exactly one [`Status`]. The code is a
//! coarse category; the detailed cause lives in [`TlsError`] and in the logs.

use super::config::TlsError;
use crate::net;
use std::fmt;

/// Coarse outcome of a transport operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Success,
    InvalidParameter,
    DnsFailure,
    ConnectFailure,
    InvalidCredentials,
    ApiError,
    HandshakeFailed,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Success => "success",
            Status::InvalidParameter => "invalid-parameter",
            Status::DnsFailure => "dns-failure",
            Status::ConnectFailure => "connect-failure",
            Status::InvalidCredentials => "invalid-credentials",
            Status::ApiError => "api-error",
            Status::HandshakeFailed => "handshake-failed",
        }
    }

    pub fn is_success(&self) -> bool {
        *self == Status::Success
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&net::Error> for Status {
    fn from(err: &net::Error) -> Self {
        match err {
            net::Error::InvalidParameter(_) => Status::InvalidParameter,
            net::Error::DnsFailure { .. } => Status::DnsFailure,
            net::Error::ConnectFailure { .. } => Status::ConnectFailure,
        }
    }
}

impl From<Result<(), net::Error>> for Status {
    fn from(result: Result<(), net::Error>) -> Self {
        match result {
            Ok(()) => Status::Success,
            Err(ref e) => Status::from(e),
        }
    }
}

impl TlsError {
    /// Collapse the error into its outcome category
    pub fn status(&self) -> Status {
        match self {
            TlsError::InvalidParameter(_) | TlsError::InvalidConfig(_) | TlsError::NotConnected => {
                Status::InvalidParameter
            }
            TlsError::Socket(e) => Status::from(e),
            TlsError::CredentialFile { .. }
            | TlsError::CertificateParse { .. }
            | TlsError::CertStore(_)
            | TlsError::Certificate(_)
            | TlsError::KeyMismatch(_) => Status::InvalidCredentials,
            TlsError::Provider(_)
            | TlsError::KeyResolution { .. }
            | TlsError::InvalidState(_)
            | TlsError::OpenSsl(_)
            | TlsError::Io(_)
            | TlsError::Stream(_) => Status::ApiError,
            TlsError::HandshakeFailed(_) | TlsError::Verification(_) => Status::HandshakeFailed,
        }
    }
}

impl From<&TlsError> for Status {
    fn from(err: &TlsError) -> Self {
        err.status()
    }
}
