//! TLS policy
//!
//! Both ends use the same rustls crypto provider, restricted to
//! forward-secret AEAD suites (ECDHE + AES-GCM / ChaCha20-Poly1305 for
//! TLS 1.2, the three AEAD suites of TLS 1.3). There is no DHE, null, MD5 or
//! DSS suite in rustls, so none can ever be negotiated.

use std::path::Path;
use std::sync::Arc;

use rustls::crypto::{ring, CryptoProvider};
use rustls::{
    ClientConfig, CommonState, ProtocolVersion, RootCertStore, ServerConfig, SupportedCipherSuite,
};

use crate::error::{NethubError, Result};
use crate::registry::TlsInfo;
use crate::tls::cert::{load_certs, load_private_key, CertPaths};

/// Lowest protocol version either side will speak
pub const MIN_PROTOCOL_VERSION: &str = "TLSv1.2";

static PROTOCOL_VERSIONS: &[&rustls::SupportedProtocolVersion] =
    &[&rustls::version::TLS13, &rustls::version::TLS12];

fn allowed_cipher_suites() -> Vec<SupportedCipherSuite> {
    use ring::cipher_suite::*;
    vec![
        TLS13_AES_256_GCM_SHA384,
        TLS13_AES_128_GCM_SHA256,
        TLS13_CHACHA20_POLY1305_SHA256,
        TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
        TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
        TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
        TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
        TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
        TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
    ]
}

/// Names of every suite the policy allows, as reported in [`TlsInfo::cipher`]
pub fn allowed_cipher_names() -> Vec<String> {
    allowed_cipher_suites()
        .iter()
        .map(|s| format!("{:?}", s.suite()))
        .collect()
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(CryptoProvider {
        cipher_suites: allowed_cipher_suites(),
        ..ring::default_provider()
    })
}

/// Listener-side configuration presenting the provisioned pair
pub fn server_config(paths: &CertPaths) -> Result<Arc<ServerConfig>> {
    let certs = load_certs(&paths.cert)?;
    let key = load_private_key(&paths.key)?;

    let config = ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(PROTOCOL_VERSIONS)
        .map_err(|e| NethubError::TlsConfig {
            message: format!("protocol versions: {}", e),
        })?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| NethubError::TlsConfig {
            message: format!("server certificate: {}", e),
        })?;

    Ok(Arc::new(config))
}

/// Client-side configuration trusting the certificate(s) in `ca_cert`
///
/// The server's certificate is self-signed, so it is its own trust anchor.
pub fn client_config(ca_cert: &Path) -> Result<Arc<ClientConfig>> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(ca_cert)? {
        roots.add(cert).map_err(|e| NethubError::TlsConfig {
            message: format!("trust anchor {}: {}", ca_cert.display(), e),
        })?;
    }

    let config = ClientConfig::builder_with_provider(provider())
        .with_protocol_versions(PROTOCOL_VERSIONS)
        .map_err(|e| NethubError::TlsConfig {
            message: format!("protocol versions: {}", e),
        })?
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(Arc::new(config))
}

/// Cipher and version negotiated on a finished handshake
pub fn describe_session(state: &CommonState) -> TlsInfo {
    let cipher = state
        .negotiated_cipher_suite()
        .map(|s| format!("{:?}", s.suite()))
        .unwrap_or_else(|| "unknown".to_string());
    let protocol_version = state
        .protocol_version()
        .map(version_name)
        .unwrap_or_else(|| "unknown".to_string());
    TlsInfo {
        cipher,
        protocol_version,
    }
}

fn version_name(version: ProtocolVersion) -> String {
    match version {
        ProtocolVersion::TLSv1_2 => "TLSv1.2".to_string(),
        ProtocolVersion::TLSv1_3 => "TLSv1.3".to_string(),
        other => format!("{:?}", other),
    }
}

/// Orders `TLSv1.2` < `TLSv1.3`; unknown names sort lowest
pub fn version_rank(name: &str) -> u8 {
    match name {
        "TLSv1.3" => 3,
        "TLSv1.2" => 2,
        _ => 0,
    }
}
