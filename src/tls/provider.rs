//! HSM key binding
//!
//! Private keys for mutual authentication live inside a hardware security
//! module and are only reachable through an OpenSSL 3 provider plugin. This
//! module resolves an opaque key identifier into a [`KeyHandle`] and checks
//! that the handle belongs to the certificate it will be presented with.
//!
//! [`KeyProvider`] is the seam: [`ProviderKeyStore`] talks to a real provider
//! module, [`SoftKeyStore`] serves keys held in process memory (development
//! setups and tests).
//!
//! The default provider stays loaded next to the HSM module, so both may
//! offer an "EC" key manager. Key import therefore fetches with a property
//! query, `provider="<name of the loaded module>"` unless overridden with
//! [`ProviderKeyStore::property_query`]. A module loaded by path is named
//! after that path; set the query explicitly (e.g. `provider=trustm`) when
//! the module registers itself under a different name.

use super::config::{log_openssl_errors, TlsError};
use super::trust::{log_path, read_credential_file, CLIENT_CERT_LABEL};
use foreign_types::ForeignType;
use openssl::error::ErrorStack;
use openssl::pkey::{HasPublic, PKey, PKeyRef, Private, Public};
use openssl::provider::Provider;
use openssl::x509::X509;
use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::fmt;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

/// Raw OpenSSL 3 calls not covered by the `openssl` crate
mod ffi {
    use libc::{c_char, c_int, c_uint, c_void, size_t};

    #[allow(non_camel_case_types)]
    #[repr(C)]
    pub struct OSSL_PARAM {
        pub key: *const c_char,
        pub data_type: c_uint,
        pub data: *mut c_void,
        pub data_size: size_t,
        pub return_size: size_t,
    }

    /// OSSL_KEYMGMT_SELECT_ALL_PARAMETERS | PUBLIC_KEY | PRIVATE_KEY
    pub const EVP_PKEY_KEYPAIR: c_int = 0x87;

    extern "C" {
        pub fn EVP_PKEY_CTX_new_from_name(
            libctx: *mut c_void,
            name: *const c_char,
            propquery: *const c_char,
        ) -> *mut openssl_sys::EVP_PKEY_CTX;
        pub fn EVP_PKEY_fromdata_init(ctx: *mut openssl_sys::EVP_PKEY_CTX) -> c_int;
        pub fn EVP_PKEY_fromdata(
            ctx: *mut openssl_sys::EVP_PKEY_CTX,
            ppkey: *mut *mut openssl_sys::EVP_PKEY,
            selection: c_int,
            params: *mut OSSL_PARAM,
        ) -> c_int;
        pub fn OSSL_PARAM_construct_utf8_string(
            key: *const c_char,
            buf: *mut c_char,
            bsize: size_t,
        ) -> OSSL_PARAM;
        pub fn OSSL_PARAM_construct_end() -> OSSL_PARAM;
        pub fn OSSL_PROVIDER_get0_name(prov: *const openssl_sys::OSSL_PROVIDER) -> *const c_char;
    }
}

/// Default key algorithm requested from the provider
pub const DEFAULT_KEY_TYPE: &str = "EC";

/// Name of the import parameter carrying the key identifier
const KEY_ID_PARAM: &[u8] = b"key\0";

/// Handle to a private key
///
/// A handle has exactly one owner. Installing it into a TLS context consumes
/// it; every other path releases it when it goes out of scope.
pub struct KeyHandle {
    key: PKey<Private>,
    key_id: String,
    _lease: Option<Arc<()>>,
}

impl KeyHandle {
    pub fn new(key_id: impl Into<String>, key: PKey<Private>) -> Self {
        KeyHandle {
            key,
            key_id: key_id.into(),
            _lease: None,
        }
    }

    fn leased(key_id: &str, key: PKey<Private>, lease: Arc<()>) -> Self {
        KeyHandle {
            key,
            key_id: key_id.to_string(),
            _lease: Some(lease),
        }
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn pkey(&self) -> &PKeyRef<Private> {
        &self.key
    }

    /// Compare the public half of this key with another key
    pub fn matches<T: HasPublic>(&self, other: &PKeyRef<T>) -> bool {
        keys_match(other, self.pkey())
    }

    /// Release the handle now instead of at end of scope
    pub fn release(self) {}
}

impl Drop for KeyHandle {
    fn drop(&mut self) {
        tracing::trace!(key_id = %self.key_id, "released key handle");
    }
}

impl fmt::Debug for KeyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyHandle")
            .field("key_id", &self.key_id)
            .field("id", &self.key.id())
            .finish()
    }
}

/// Resolves key identifiers into private key handles
pub trait KeyProvider {
    fn resolve_key(&self, key_id: &str) -> Result<KeyHandle, TlsError>;
}

impl<K: KeyProvider + ?Sized> KeyProvider for &K {
    fn resolve_key(&self, key_id: &str) -> Result<KeyHandle, TlsError> {
        (**self).resolve_key(key_id)
    }
}

impl<K: KeyProvider + ?Sized> KeyProvider for Arc<K> {
    fn resolve_key(&self, key_id: &str) -> Result<KeyHandle, TlsError> {
        (**self).resolve_key(key_id)
    }
}

/// Provider module kept loaded for the lifetime of the store
struct LoadedProvider {
    _provider: Provider,
    name: String,
}

/// Property query selecting implementations of the named provider only
fn pin_to_provider(name: &str) -> String {
    let quote = if name.contains('"') { '\'' } else { '"' };
    format!("provider={}{}{}", quote, name, quote)
}

/// Keys held by an OpenSSL provider module (HSM plugin)
///
/// The module is loaded at most once, on first use. A failed load is
/// remembered and every later resolution fails with the same reason.
pub struct ProviderKeyStore {
    module_path: PathBuf,
    key_type: String,
    property_query: Option<String>,
    provider: OnceLock<Result<LoadedProvider, String>>,
    load_attempts: AtomicUsize,
}

impl ProviderKeyStore {
    /// Create a store backed by the provider module at `module_path`
    pub fn new<P: AsRef<Path>>(module_path: P) -> Self {
        ProviderKeyStore {
            module_path: module_path.as_ref().to_path_buf(),
            key_type: DEFAULT_KEY_TYPE.to_string(),
            property_query: None,
            provider: OnceLock::new(),
            load_attempts: AtomicUsize::new(0),
        }
    }

    /// Key algorithm to import as (default "EC")
    pub fn key_type(mut self, key_type: impl Into<String>) -> Self {
        self.key_type = key_type.into();
        self
    }

    /// Property query for fetching the key manager
    ///
    /// Defaults to pinning the fetch to the loaded module by name.
    pub fn property_query(mut self, query: impl Into<String>) -> Self {
        self.property_query = Some(query.into());
        self
    }

    pub fn module_path(&self) -> &Path {
        &self.module_path
    }

    /// Name OpenSSL registered the module under, once loaded
    pub fn loaded_provider_name(&self) -> Option<&str> {
        match self.provider.get() {
            Some(Ok(loaded)) => Some(loaded.name.as_str()),
            _ => None,
        }
    }

    /// Query the key import will use, once the module is loaded
    pub fn effective_property_query(&self) -> Option<String> {
        match self.provider.get() {
            Some(Ok(loaded)) => Some(self.query_for(loaded)),
            _ => None,
        }
    }

    fn query_for(&self, loaded: &LoadedProvider) -> String {
        match &self.property_query {
            Some(query) => query.clone(),
            None => pin_to_provider(&loaded.name),
        }
    }

    /// Number of times loading the module was attempted (0 or 1)
    pub fn load_attempts(&self) -> usize {
        self.load_attempts.load(Ordering::Relaxed)
    }

    /// Load the provider module if it has not been loaded yet
    pub fn ensure_loaded(&self) -> Result<(), TlsError> {
        self.loaded().map(|_| ())
    }

    fn loaded(&self) -> Result<&LoadedProvider, TlsError> {
        match self.provider.get_or_init(|| self.load()) {
            Ok(loaded) => Ok(loaded),
            Err(reason) => Err(TlsError::Provider(reason.clone())),
        }
    }

    fn load(&self) -> Result<LoadedProvider, String> {
        self.load_attempts.fetch_add(1, Ordering::Relaxed);

        let path = self
            .module_path
            .to_str()
            .ok_or_else(|| format!("provider path is not UTF-8: {}", self.module_path.display()))?;

        // Keep the default provider available for the non-key operations.
        match Provider::try_load(None, path, true) {
            Ok(provider) => {
                let name = unsafe {
                    let name = ffi::OSSL_PROVIDER_get0_name(provider.as_ptr());
                    if name.is_null() {
                        path.to_string()
                    } else {
                        CStr::from_ptr(name).to_string_lossy().into_owned()
                    }
                };
                tracing::debug!(path, name = %name, "crypto provider loaded");
                Ok(LoadedProvider {
                    _provider: provider,
                    name,
                })
            }
            Err(stack) => {
                log_openssl_errors("loading crypto provider", &stack);
                tracing::error!(path, "failed to load crypto provider");
                Err(format!("failed to load provider module {}: {}", path, stack))
            }
        }
    }

    fn import_key(&self, key_id: &str, property_query: &str) -> Result<PKey<Private>, TlsError> {
        let resolution_error = |reason: &str| {
            let stack = ErrorStack::get();
            log_openssl_errors("importing key from provider", &stack);
            TlsError::KeyResolution {
                key_id: key_id.to_string(),
                reason: reason.to_string(),
            }
        };

        let key_type = CString::new(self.key_type.as_str())
            .map_err(|_| TlsError::InvalidConfig("key type contains NUL".to_string()))?;
        let id = CString::new(key_id)
            .map_err(|_| TlsError::InvalidParameter("key identifier contains NUL".to_string()))?;
        let query = CString::new(property_query)
            .map_err(|_| TlsError::InvalidConfig("property query contains NUL".to_string()))?;

        unsafe {
            let ctx = ffi::EVP_PKEY_CTX_new_from_name(ptr::null_mut(), key_type.as_ptr(), query.as_ptr());
            if ctx.is_null() {
                return Err(resolution_error("failed to create key context"));
            }
            let ctx = PkeyCtxGuard(ctx);

            if ffi::EVP_PKEY_fromdata_init(ctx.0) <= 0 {
                return Err(resolution_error("failed to initialize key import"));
            }

            let mut params = [
                ffi::OSSL_PARAM_construct_utf8_string(
                    KEY_ID_PARAM.as_ptr() as *const libc::c_char,
                    id.as_ptr() as *mut libc::c_char,
                    0,
                ),
                ffi::OSSL_PARAM_construct_end(),
            ];

            let mut pkey: *mut openssl_sys::EVP_PKEY = ptr::null_mut();
            let rc = ffi::EVP_PKEY_fromdata(ctx.0, &mut pkey, ffi::EVP_PKEY_KEYPAIR, params.as_mut_ptr());
            if rc <= 0 || pkey.is_null() {
                return Err(resolution_error("provider rejected key identifier"));
            }

            Ok(PKey::from_ptr(pkey))
        }
    }
}

struct PkeyCtxGuard(*mut openssl_sys::EVP_PKEY_CTX);

impl Drop for PkeyCtxGuard {
    fn drop(&mut self) {
        unsafe { openssl_sys::EVP_PKEY_CTX_free(self.0) }
    }
}

impl KeyProvider for ProviderKeyStore {
    fn resolve_key(&self, key_id: &str) -> Result<KeyHandle, TlsError> {
        if key_id.is_empty() {
            return Err(TlsError::InvalidParameter("key identifier is empty".to_string()));
        }

        let loaded = self.loaded()?;
        let query = self.query_for(loaded);
        let key = self.import_key(key_id, &query)?;
        tracing::debug!(key_id, property_query = %query, "resolved private key from provider");
        Ok(KeyHandle::new(key_id, key))
    }
}

impl fmt::Debug for ProviderKeyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderKeyStore")
            .field("module_path", &self.module_path)
            .field("key_type", &self.key_type)
            .field("property_query", &self.property_query)
            .field("loaded", &matches!(self.provider.get(), Some(Ok(_))))
            .finish()
    }
}

/// In-memory key table
///
/// Stands in for an HSM when keys are available as software keys. Tracks
/// how many handles it has issued that are still alive.
#[derive(Default)]
pub struct SoftKeyStore {
    keys: HashMap<String, PKey<Private>>,
    leases: Arc<()>,
}

impl SoftKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key_id: impl Into<String>, key: PKey<Private>) {
        self.keys.insert(key_id.into(), key);
    }

    /// Insert a PEM-encoded private key
    pub fn insert_pem(&mut self, key_id: impl Into<String>, pem: &[u8]) -> Result<(), TlsError> {
        let key = PKey::private_key_from_pem(pem)
            .map_err(|e| TlsError::Certificate(format!("Failed to load private key: {}", e)))?;
        self.insert(key_id, key);
        Ok(())
    }

    /// Number of issued handles not yet released
    pub fn outstanding_handles(&self) -> usize {
        Arc::strong_count(&self.leases) - 1
    }
}

impl KeyProvider for SoftKeyStore {
    fn resolve_key(&self, key_id: &str) -> Result<KeyHandle, TlsError> {
        let key = self.keys.get(key_id).ok_or_else(|| TlsError::KeyResolution {
            key_id: key_id.to_string(),
            reason: "no such key".to_string(),
        })?;
        Ok(KeyHandle::leased(key_id, key.clone(), Arc::clone(&self.leases)))
    }
}

/// Read a PEM certificate from `path` and return its public key
pub fn load_public_key_from_certificate<P: AsRef<Path>>(path: P) -> Result<PKey<Public>, TlsError> {
    let path = path.as_ref();
    log_path(path, CLIENT_CERT_LABEL);

    let pem = read_credential_file(path, CLIENT_CERT_LABEL)?;
    let cert = X509::from_pem(&pem).map_err(|e| {
        log_openssl_errors("parsing client certificate", &e);
        TlsError::CertificateParse {
            label: CLIENT_CERT_LABEL,
            reason: e.to_string(),
        }
    })?;

    cert.public_key().map_err(|e| TlsError::CertificateParse {
        label: CLIENT_CERT_LABEL,
        reason: format!("no usable public key: {}", e),
    })
}

/// Whether two keys have the same public component
///
/// Not constant time; this is a configuration check.
pub fn keys_match<A: HasPublic, B: HasPublic>(a: &PKeyRef<A>, b: &PKeyRef<B>) -> bool {
    a.public_eq(b)
}

/// Check that `key` is the private half of the certificate at `cert_path`
pub fn verify_key_binding<P: AsRef<Path>>(key: &KeyHandle, cert_path: P) -> Result<(), TlsError> {
    let cert_key = load_public_key_from_certificate(cert_path.as_ref())?;

    if !key.matches(&cert_key) {
        tracing::error!(
            key_id = key.key_id(),
            cert = %cert_path.as_ref().display(),
            "public key from certificate does not match private key from HSM"
        );
        return Err(TlsError::KeyMismatch(format!(
            "key '{}' does not belong to certificate {}",
            key.key_id(),
            cert_path.as_ref().display()
        )));
    }

    tracing::debug!(key_id = key.key_id(), "certificate public key matches HSM key");
    Ok(())
}
