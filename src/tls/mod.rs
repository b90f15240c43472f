//! Mutually authenticated TLS client
//!
//! The client proves its identity with a certificate whose private key never
//! leaves a hardware security module. OpenSSL reaches the key through a
//! provider plugin; this crate only ever holds a handle to it.
//!
//! # Architecture
//!
//! A connection is built in stages, each in its own module:
//!
//! 1. [`provider`] resolves the HSM key by identifier and checks it against
//!    the client certificate's public key
//! 2. [`trust`] installs the root CA, client chain and key into the context,
//!    failing fast on any error
//! 3. [`handshake`] applies optional settings (ALPN, max fragment length,
//!    SNI) on a best-effort basis and runs the verified handshake
//! 4. [`session`] wraps the blocking TLS stream with a zero-timeout
//!    readiness probe so reads and writes can be retried from a poll loop
//!
//! [`Connector`] ties these together; [`Connection`] owns the result.
//!
//! # Outcomes
//!
//! Every failure is a [`TlsError`]. [`TlsError::status`] collapses it into
//! one of the seven [`Status`] codes callers branch on.

pub mod cert;
pub mod config;
pub mod connection;
pub mod handshake;
pub mod provider;
pub mod session;
pub mod status;
pub mod trust;
pub mod vars;

#[cfg(test)]
pub(crate) mod test_pki;

pub use cert::CertInfo;
pub use config::{AlpnProtocols, Credentials, CredentialsBuilder, TlsError, TransportConfig};
pub use connection::{Connection, Connector, SharedSockets};
pub use handshake::{AppliedOptions, NegotiatorState, SessionNegotiator};
pub use provider::{KeyHandle, KeyProvider, ProviderKeyStore, SoftKeyStore};
pub use session::{OpenSslSession, PollEvents, SessionOps, StreamError, StreamErrorKind, TransportSession};
pub use status::Status;
pub use vars::SessionInfo;

/// Result type for TLS operations
pub type Result<T> = std::result::Result<T, TlsError>;
