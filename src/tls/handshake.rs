//! Session negotiation
//!
//! [`SessionNegotiator`] walks a client connection through
//! `Unconfigured -> CredentialsBound -> OptionsSet -> Handshaking -> Established`.
//! Credential binding is mandatory and fails fast. Protocol options (ALPN,
//! max fragment length, SNI) are best effort: a rejected option is logged and
//! the negotiation carries on.

use super::config::{log_openssl_errors, Credentials, TlsError};
use super::provider::KeyProvider;
use super::status::Status;
use super::trust::bind_credentials;
use foreign_types::ForeignTypeRef;
use openssl::ssl::{
    HandshakeError, Ssl, SslContext, SslContextBuilder, SslMethod, SslRef, SslStream,
    SslVerifyMode,
};
use openssl::x509::X509VerifyResult;
use std::fmt;
use std::net::{IpAddr, TcpStream};

mod ffi {
    use libc::{c_int, size_t};

    pub const SSL_CTRL_SET_MAX_SEND_FRAGMENT: c_int = 52;

    extern "C" {
        pub fn SSL_set_default_read_buffer_len(ssl: *mut openssl_sys::SSL, len: size_t);
    }
}

/// Room for record header, MAC and padding on top of the plaintext fragment
/// (SSL3_RT_MAX_ENCRYPTED_OVERHEAD)
pub const MAX_ENCRYPTED_OVERHEAD: usize = 256 + 64;

/// Negotiation state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiatorState {
    Unconfigured,
    CredentialsBound,
    OptionsSet,
    Handshaking,
    Established,
    Failed(Status),
}

impl fmt::Display for NegotiatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NegotiatorState::Unconfigured => f.write_str("unconfigured"),
            NegotiatorState::CredentialsBound => f.write_str("credentials-bound"),
            NegotiatorState::OptionsSet => f.write_str("options-set"),
            NegotiatorState::Handshaking => f.write_str("handshaking"),
            NegotiatorState::Established => f.write_str("established"),
            NegotiatorState::Failed(status) => write!(f, "failed({})", status),
        }
    }
}

/// Which optional settings were applied to a channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppliedOptions {
    pub alpn: bool,
    pub max_fragment_length: bool,
    pub sni: bool,
}

impl AppliedOptions {
    pub fn is_empty(&self) -> bool {
        !self.alpn && !self.max_fragment_length && !self.sni
    }
}

/// Apply ALPN, max send fragment length and SNI, each only if configured
///
/// Failures are logged and skipped.
pub fn apply_optional_configuration(ssl: &mut SslRef, credentials: &Credentials) -> AppliedOptions {
    let mut applied = AppliedOptions::default();

    let alpn = credentials.alpn_protocols();
    if !alpn.is_empty() {
        tracing::debug!("setting ALPN protocols");
        match ssl.set_alpn_protos(alpn.as_wire()) {
            Ok(()) => applied.alpn = true,
            Err(e) => {
                log_openssl_errors("setting ALPN protocols", &e);
                tracing::error!(protocols = ?alpn, "failed to set ALPN protocols");
            }
        }
    }

    let max_fragment = credentials.max_fragment_length();
    if max_fragment > 0 {
        tracing::debug!(max_fragment, "setting max send fragment length");
        let rc = unsafe {
            openssl_sys::SSL_ctrl(
                ssl.as_ptr(),
                ffi::SSL_CTRL_SET_MAX_SEND_FRAGMENT,
                max_fragment as libc::c_long,
                std::ptr::null_mut(),
            )
        };
        if rc == 1 {
            let read_buffer_len = max_fragment as usize + MAX_ENCRYPTED_OVERHEAD;
            unsafe { ffi::SSL_set_default_read_buffer_len(ssl.as_ptr(), read_buffer_len) };
            applied.max_fragment_length = true;
        } else {
            tracing::error!(max_fragment, "failed to set max send fragment length");
        }
    }

    if let Some(name) = credentials.sni_host_name() {
        tracing::debug!(server_name = name, "setting server name for SNI");
        match ssl.set_hostname(name) {
            Ok(()) => applied.sni = true,
            Err(e) => {
                log_openssl_errors("setting SNI", &e);
                tracing::error!(server_name = name, "failed to set server name for SNI");
            }
        }
    }

    applied
}

/// Drives one client connection from configuration to an established channel
pub struct SessionNegotiator {
    state: NegotiatorState,
    builder: Option<SslContextBuilder>,
    context: Option<SslContext>,
    ssl: Option<Ssl>,
    applied: AppliedOptions,
}

impl SessionNegotiator {
    pub fn new() -> Result<Self, TlsError> {
        let builder = SslContextBuilder::new(SslMethod::tls_client()).map_err(|e| {
            log_openssl_errors("creating SSL context", &e);
            tracing::error!("creation of a new SSL context failed");
            TlsError::OpenSsl(e)
        })?;

        Ok(SessionNegotiator {
            state: NegotiatorState::Unconfigured,
            builder: Some(builder),
            context: None,
            ssl: None,
            applied: AppliedOptions::default(),
        })
    }

    pub fn state(&self) -> NegotiatorState {
        self.state
    }

    /// Options applied by [`set_options`](Self::set_options)
    pub fn applied_options(&self) -> AppliedOptions {
        self.applied
    }

    /// Context the channel is created from, once credentials are bound
    pub fn context(&self) -> Option<&SslContext> {
        self.context.as_ref()
    }

    fn expect_state(&self, expected: NegotiatorState) -> Result<(), TlsError> {
        if self.state != expected {
            return Err(TlsError::InvalidState(format!(
                "expected {}, negotiator is {}",
                expected, self.state
            )));
        }
        Ok(())
    }

    fn fail(&mut self, err: TlsError) -> TlsError {
        self.state = NegotiatorState::Failed(err.status());
        self.builder = None;
        self.ssl = None;
        err
    }

    /// Install trust anchor and client identity (mandatory, fail fast)
    pub fn bind_credentials<K: KeyProvider + ?Sized>(
        &mut self,
        credentials: &Credentials,
        keys: &K,
    ) -> Result<(), TlsError> {
        self.expect_state(NegotiatorState::Unconfigured)?;

        let mut builder = match self.builder.take() {
            Some(builder) => builder,
            None => return Err(self.fail(TlsError::InvalidState("context already consumed".to_string()))),
        };

        if let Err(e) = bind_credentials(&mut builder, credentials, keys) {
            tracing::error!(error = %e, "setting up credentials failed");
            return Err(self.fail(e));
        }

        self.context = Some(builder.build());
        self.state = NegotiatorState::CredentialsBound;
        Ok(())
    }

    /// Create the channel and apply the optional protocol settings
    pub fn set_options(&mut self, credentials: &Credentials) -> Result<AppliedOptions, TlsError> {
        self.expect_state(NegotiatorState::CredentialsBound)?;

        let mut ssl = match self.context.as_ref().map(|ctx| Ssl::new(ctx)) {
            Some(Ok(ssl)) => ssl,
            Some(Err(e)) => {
                log_openssl_errors("creating SSL channel", &e);
                return Err(self.fail(TlsError::OpenSsl(e)));
            }
            None => return Err(self.fail(TlsError::InvalidState("no SSL context".to_string()))),
        };

        self.applied = apply_optional_configuration(&mut ssl, credentials);
        self.ssl = Some(ssl);
        self.state = NegotiatorState::OptionsSet;
        Ok(self.applied)
    }

    /// Bind the socket, require peer verification and run the handshake
    ///
    /// `host` is checked against the peer certificate's SAN/CN entries; the
    /// chain is checked against the configured root CA. Both must pass.
    pub fn handshake(
        &mut self,
        stream: TcpStream,
        host: &str,
    ) -> Result<SslStream<TcpStream>, TlsError> {
        self.expect_state(NegotiatorState::OptionsSet)?;

        let mut ssl = match self.ssl.take() {
            Some(ssl) => ssl,
            None => return Err(self.fail(TlsError::InvalidState("no SSL channel".to_string()))),
        };

        ssl.set_verify(SslVerifyMode::PEER);

        let expected = match host.parse::<IpAddr>() {
            Ok(ip) => ssl.param_mut().set_ip(ip),
            Err(_) => ssl.param_mut().set_host(host),
        };
        if let Err(e) = expected {
            log_openssl_errors("setting expected peer host", &e);
            tracing::error!(host, "failed to set the hostname to validate");
            return Err(self.fail(TlsError::OpenSsl(e)));
        }

        self.state = NegotiatorState::Handshaking;

        let stream = match ssl.connect(stream) {
            Ok(stream) => stream,
            Err(HandshakeError::SetupFailure(e)) => {
                log_openssl_errors("handshake setup", &e);
                return Err(self.fail(TlsError::OpenSsl(e)));
            }
            Err(HandshakeError::Failure(mid)) => {
                let verify = mid.ssl().verify_result();
                let err = if verify != X509VerifyResult::OK {
                    tracing::error!(host, reason = verify.error_string(), "peer certificate verification failed");
                    TlsError::Verification(verify.error_string().to_string())
                } else {
                    tracing::error!(host, error = %mid.error(), "TLS handshake failed");
                    TlsError::HandshakeFailed(mid.error().to_string())
                };
                return Err(self.fail(err));
            }
            Err(HandshakeError::WouldBlock(mid)) => {
                tracing::error!(host, "TLS handshake interrupted by socket timeout");
                return Err(self.fail(TlsError::HandshakeFailed(format!(
                    "handshake did not complete: {}",
                    mid.error()
                ))));
            }
        };

        let verify = stream.ssl().verify_result();
        if verify != X509VerifyResult::OK {
            tracing::error!(host, reason = verify.error_string(), "failed to verify X509 certificate from peer");
            return Err(self.fail(TlsError::Verification(verify.error_string().to_string())));
        }

        if stream.ssl().peer_certificate().is_none() {
            tracing::error!(host, "peer presented no certificate");
            return Err(self.fail(TlsError::Verification("no peer certificate".to_string())));
        }

        self.state = NegotiatorState::Established;
        tracing::debug!(host, version = stream.ssl().version_str(), "TLS handshake complete");
        Ok(stream)
    }
}

impl fmt::Debug for SessionNegotiator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionNegotiator")
            .field("state", &self.state)
            .field("applied", &self.applied)
            .finish()
    }
}
