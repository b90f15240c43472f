//! Negotiated session parameters
//!
//! Captured once the handshake has completed and kept on the connection so
//! callers can inspect what was agreed without touching OpenSSL types.

use super::cert::{peer_chain, CertInfo};
use super::handshake::AppliedOptions;
use openssl::ssl::{NameType, SslRef};
use std::fmt;

/// Parameters of an established session
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Negotiated protocol version (e.g., "TLSv1.3")
    pub version: String,

    /// Negotiated cipher suite
    pub cipher: String,

    /// SNI host name sent in the ClientHello
    pub servername: Option<String>,

    /// Protocol selected by the server through ALPN
    pub alpn: Option<String>,

    /// Optional settings that were accepted before the handshake
    pub applied: AppliedOptions,

    /// Peer chain, index 0 being the server certificate
    pub cert_chain: Vec<CertInfo>,
}

impl SessionInfo {
    pub fn from_ssl(ssl: &SslRef, applied: AppliedOptions) -> Self {
        SessionInfo {
            version: ssl.version_str().to_string(),
            cipher: ssl
                .current_cipher()
                .map(|c| c.name().to_string())
                .unwrap_or_else(|| "<undef>".to_string()),
            servername: ssl.servername(NameType::HOST_NAME).map(|s| s.to_string()),
            alpn: ssl
                .selected_alpn_protocol()
                .map(|p| String::from_utf8_lossy(p).into_owned()),
            applied,
            cert_chain: peer_chain(ssl),
        }
    }

    /// Peer certificate by index (0 = server certificate)
    pub fn cert(&self, index: usize) -> Option<&CertInfo> {
        self.cert_chain.get(index)
    }

    pub fn peer_subject(&self) -> Option<&str> {
        self.cert(0).map(|c| c.subject.as_str())
    }
}

impl fmt::Display for SessionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.version, self.cipher)?;
        if let Some(alpn) = &self.alpn {
            write!(f, " alpn={}", alpn)?;
        }
        if let Some(subject) = self.peer_subject() {
            write!(f, " peer={}", subject)?;
        }
        Ok(())
    }
}
