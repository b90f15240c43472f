//! Trust and identity configuration
//!
//! Installs the root CA, the client certificate chain, and the HSM-backed
//! private key into an `SslContextBuilder`. Each step can be called on its
//! own; [`bind_credentials`] runs them in order and stops at the first
//! failure.

use super::config::{log_openssl_errors, Credentials, TlsError};
use super::provider::{verify_key_binding, KeyHandle, KeyProvider};
use openssl::ssl::SslContextBuilder;
use openssl::x509::X509;
use std::path::Path;

/// Label used when logging the root CA path
pub const ROOT_CA_LABEL: &str = "root CA certificate";

/// Label used when logging the client certificate path
pub const CLIENT_CERT_LABEL: &str = "client certificate";

/// Log the absolute location of a credential file
pub(crate) fn log_path(path: &Path, label: &str) {
    if path.is_absolute() {
        tracing::debug!(path = %path.display(), "attempting to open {}", label);
    } else {
        match std::env::current_dir() {
            Ok(cwd) => {
                tracing::debug!(path = %cwd.join(path).display(), "attempting to open {}", label)
            }
            Err(_) => tracing::debug!(path = %path.display(), "attempting to open {}", label),
        }
    }
}

pub(crate) fn read_credential_file(path: &Path, label: &'static str) -> Result<Vec<u8>, TlsError> {
    std::fs::read(path).map_err(|source| {
        tracing::error!(path = %path.display(), error = %source, "failed to open {}", label);
        TlsError::CredentialFile {
            label,
            path: path.to_path_buf(),
            source,
        }
    })
}

/// Add the PEM certificate at `path` to the context's verification store
pub fn set_root_ca<P: AsRef<Path>>(ctx: &mut SslContextBuilder, path: P) -> Result<(), TlsError> {
    let path = path.as_ref();
    log_path(path, ROOT_CA_LABEL);

    let pem = read_credential_file(path, ROOT_CA_LABEL)?;

    let root_ca = X509::from_pem(&pem).map_err(|e| {
        log_openssl_errors("parsing root CA", &e);
        tracing::error!(path = %path.display(), "failed to parse root CA");
        TlsError::CertificateParse {
            label: ROOT_CA_LABEL,
            reason: e.to_string(),
        }
    })?;

    ctx.cert_store_mut().add_cert(root_ca).map_err(|e| {
        log_openssl_errors("adding root CA to store", &e);
        TlsError::CertStore(e.to_string())
    })?;

    tracing::info!("successfully imported root CA");
    Ok(())
}

/// Load the client certificate chain (leaf first) presented to the peer
pub fn set_client_certificate<P: AsRef<Path>>(
    ctx: &mut SslContextBuilder,
    path: P,
) -> Result<(), TlsError> {
    let path = path.as_ref();
    log_path(path, CLIENT_CERT_LABEL);

    if !path.is_file() {
        tracing::error!(path = %path.display(), "client certificate file not found");
        return Err(TlsError::CredentialFile {
            label: CLIENT_CERT_LABEL,
            path: path.to_path_buf(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        });
    }

    ctx.set_certificate_chain_file(path).map_err(|e| {
        log_openssl_errors("loading client certificate chain", &e);
        tracing::error!(path = %path.display(), "failed to import client certificate");
        TlsError::Certificate(format!("Failed to load certificate chain: {}", e))
    })?;

    tracing::debug!("successfully imported client certificate");
    Ok(())
}

/// Install the private key, consuming the handle
pub fn set_private_key(ctx: &mut SslContextBuilder, key: KeyHandle) -> Result<(), TlsError> {
    ctx.set_private_key(key.pkey()).map_err(|e| {
        log_openssl_errors("installing private key", &e);
        tracing::error!(key_id = key.key_id(), "failed to import client private key");
        TlsError::Certificate(format!("Failed to install private key: {}", e))
    })?;

    tracing::debug!(key_id = key.key_id(), "successfully imported client private key");
    Ok(())
}

/// Confirm the installed certificate and private key form a pair
pub fn check_private_key(ctx: &SslContextBuilder) -> Result<(), TlsError> {
    ctx.check_private_key().map_err(|e| {
        let detail = e
            .errors()
            .first()
            .and_then(|err| err.reason())
            .unwrap_or("unknown reason")
            .to_string();
        tracing::error!(details = %detail, "private key/certificate mismatch");
        TlsError::KeyMismatch(detail)
    })
}

/// Run the mandatory credential steps in order, failing fast
///
/// For mutual authentication the HSM key is resolved and compared against
/// the certificate before anything is installed, so a mismatched pair never
/// reaches the handshake.
pub fn bind_credentials<K: KeyProvider + ?Sized>(
    ctx: &mut SslContextBuilder,
    credentials: &Credentials,
    keys: &K,
) -> Result<(), TlsError> {
    let identity = match (credentials.client_cert_path(), credentials.key_id()) {
        (Some(cert_path), Some(key_id)) => {
            let key = keys.resolve_key(key_id).map_err(|e| {
                tracing::error!(key_id, error = %e, "failed to load private key from HSM");
                e
            })?;
            verify_key_binding(&key, cert_path)?;
            Some((cert_path, key))
        }
        (None, None) => None,
        _ => {
            return Err(TlsError::InvalidConfig(
                "client certificate and key identifier must be set together".to_string(),
            ))
        }
    };

    set_root_ca(ctx, credentials.root_ca_path())?;

    if let Some((cert_path, key)) = identity {
        set_client_certificate(ctx, cert_path)?;
        set_private_key(ctx, key)?;
        check_private_key(ctx)?;
    }

    Ok(())
}
