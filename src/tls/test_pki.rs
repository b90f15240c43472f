//! Throwaway PKI for tests
//!
//! Mints a P-256 root CA and CA-signed leaves at runtime so no key material
//! has to be checked in. Shared with the integration tests through `#[path]`.

#![allow(dead_code)]

use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::x509::extension::{
    BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAlternativeName,
};
use openssl::x509::{X509Name, X509};
use std::path::{Path, PathBuf};

/// Key pair plus the certificate issued for it
pub struct EcIdentity {
    pub key: PKey<Private>,
    pub cert: X509,
}

pub fn generate_key() -> PKey<Private> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    let ec = EcKey::generate(&group).unwrap();
    PKey::from_ec_key(ec).unwrap()
}

fn name(cn: &str) -> X509Name {
    let mut name = X509Name::builder().unwrap();
    name.append_entry_by_nid(Nid::COMMONNAME, cn).unwrap();
    name.build()
}

fn serial() -> openssl::asn1::Asn1Integer {
    let mut bn = BigNum::new().unwrap();
    bn.rand(64, MsbOption::MAYBE_ZERO, false).unwrap();
    bn.to_asn1_integer().unwrap()
}

/// Self-signed CA
pub fn root_ca(cn: &str) -> EcIdentity {
    let key = generate_key();
    let subject = name(cn);

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    builder.set_serial_number(&serial()).unwrap();
    builder.set_subject_name(&subject).unwrap();
    builder.set_issuer_name(&subject).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
    builder.set_not_after(&Asn1Time::days_from_now(365).unwrap()).unwrap();
    builder
        .append_extension(BasicConstraints::new().critical().ca().build().unwrap())
        .unwrap();
    builder
        .append_extension(
            KeyUsage::new()
                .critical()
                .key_cert_sign()
                .crl_sign()
                .build()
                .unwrap(),
        )
        .unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();

    EcIdentity {
        key,
        cert: builder.build(),
    }
}

/// End-entity certificate signed by `ca`
///
/// Entries in `alt_names` that parse as IP addresses become IP SANs, the
/// rest DNS SANs. Usable for both server and client authentication.
pub fn leaf(ca: &EcIdentity, cn: &str, alt_names: &[&str]) -> EcIdentity {
    let key = generate_key();

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    builder.set_serial_number(&serial()).unwrap();
    builder.set_subject_name(&name(cn)).unwrap();
    builder.set_issuer_name(ca.cert.subject_name()).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
    builder.set_not_after(&Asn1Time::days_from_now(30).unwrap()).unwrap();
    builder
        .append_extension(BasicConstraints::new().build().unwrap())
        .unwrap();
    builder
        .append_extension(
            KeyUsage::new()
                .critical()
                .digital_signature()
                .key_agreement()
                .build()
                .unwrap(),
        )
        .unwrap();
    builder
        .append_extension(
            ExtendedKeyUsage::new()
                .server_auth()
                .client_auth()
                .build()
                .unwrap(),
        )
        .unwrap();

    if !alt_names.is_empty() {
        let mut san = SubjectAlternativeName::new();
        for alt in alt_names {
            if alt.parse::<std::net::IpAddr>().is_ok() {
                san.ip(alt);
            } else {
                san.dns(alt);
            }
        }
        let ext = san
            .build(&builder.x509v3_context(Some(&ca.cert), None))
            .unwrap();
        builder.append_extension(ext).unwrap();
    }

    builder.sign(&ca.key, MessageDigest::sha256()).unwrap();

    EcIdentity {
        key,
        cert: builder.build(),
    }
}

/// Write certificates as concatenated PEM, returning the file path
pub fn write_certs(dir: &Path, file_name: &str, certs: &[&X509]) -> PathBuf {
    let mut pem = Vec::new();
    for cert in certs {
        pem.extend_from_slice(&cert.to_pem().unwrap());
    }
    let path = dir.join(file_name);
    std::fs::write(&path, pem).unwrap();
    path
}
