//! Transport security
//!
//! - [`cert`]: provisions the on-disk server certificate/key pair, generating
//!   a self-signed RSA certificate when none exists
//! - [`policy`]: the fixed rustls policy (TLS 1.2 minimum, forward-secret AEAD
//!   suites only) for both the listener and the client

pub mod cert;
pub mod policy;

pub use cert::{ensure_certificate, CertError, CertPaths, CERT_FILE_NAME, KEY_FILE_NAME};
pub use policy::{
    allowed_cipher_names, client_config, describe_session, server_config, MIN_PROTOCOL_VERSION,
};
