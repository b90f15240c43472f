//! hsm-tls - TLS client transport with HSM-backed client keys
//!
//! This crate opens mutually authenticated TLS connections over TCP where the
//! client's private key is held by a hardware security module and reached
//! through an OpenSSL provider plugin.

pub mod net;
pub mod tls;
