//! Peer certificate inspection
//!
//! Summaries of X.509 certificates for logging and for [`SessionInfo`].
//!
//! [`SessionInfo`]: super::vars::SessionInfo

use openssl::nid::Nid;
use openssl::ssl::SslRef;
use openssl::x509::{X509NameRef, X509Ref};
use std::net::IpAddr;

/// Certificate information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertInfo {
    /// Subject Common Name
    pub subject: String,
    /// Issuer Common Name
    pub issuer: String,
    /// Subject Alternative Names, prefixed with `DNS:` or `IP:`
    pub subject_alt_names: Vec<String>,
    /// Expiry, as printed by OpenSSL
    pub not_after: String,
}

impl CertInfo {
    pub fn from_x509(cert: &X509Ref) -> Self {
        CertInfo {
            subject: common_name(cert.subject_name()),
            issuer: common_name(cert.issuer_name()),
            subject_alt_names: subject_alt_names(cert),
            not_after: cert.not_after().to_string(),
        }
    }

    /// Whether the certificate names `host` in a SAN entry
    ///
    /// Exact match only; wildcard matching is left to OpenSSL during
    /// verification.
    pub fn names_host(&self, host: &str) -> bool {
        let wanted = match host.parse::<IpAddr>() {
            Ok(ip) => format!("IP:{}", ip),
            Err(_) => format!("DNS:{}", host.to_ascii_lowercase()),
        };
        self.subject_alt_names
            .iter()
            .any(|san| san.eq_ignore_ascii_case(&wanted))
    }
}

fn common_name(name: &X509NameRef) -> String {
    name.entries_by_nid(Nid::COMMONNAME)
        .next()
        .map(|entry| String::from_utf8_lossy(entry.data().as_slice()).into_owned())
        .unwrap_or_else(|| "<undef>".to_string())
}

fn subject_alt_names(cert: &X509Ref) -> Vec<String> {
    let mut names = Vec::new();

    if let Some(sans) = cert.subject_alt_names() {
        for name in sans {
            if let Some(dns) = name.dnsname() {
                names.push(format!("DNS:{}", dns));
            } else if let Some(ip) = name.ipaddress() {
                let addr = match ip.len() {
                    4 => <[u8; 4]>::try_from(ip).ok().map(IpAddr::from),
                    16 => <[u8; 16]>::try_from(ip).ok().map(IpAddr::from),
                    _ => None,
                };
                if let Some(addr) = addr {
                    names.push(format!("IP:{}", addr));
                }
            }
        }
    }

    names
}

/// Peer chain as presented, index 0 being the leaf
///
/// On the client side OpenSSL's peer chain already starts with the leaf.
pub fn peer_chain(ssl: &SslRef) -> Vec<CertInfo> {
    match ssl.peer_cert_chain() {
        Some(chain) => chain.iter().map(CertInfo::from_x509).collect(),
        None => ssl
            .peer_certificate()
            .map(|cert| vec![CertInfo::from_x509(&cert)])
            .unwrap_or_default(),
    }
}
