//! Certificate provisioning
//!
//! [`ensure_certificate`] is idempotent: when both `server.crt` and
//! `server.key` exist it returns their paths without touching them. Otherwise
//! it generates a 2048-bit RSA key and a self-signed certificate in-process
//! and writes both files atomically (temp file + rename).

use std::io::Write;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType, SerialNumber};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use thiserror::Error;
use time::OffsetDateTime;

pub const CERT_FILE_NAME: &str = "server.crt";
pub const KEY_FILE_NAME: &str = "server.key";

const RSA_KEY_BITS: usize = 2048;
const VALIDITY_DAYS: i64 = 365;
const CERT_SERIAL: u64 = 1000;

/// Serializes provisioning inside the process so concurrent callers never
/// generate two different pairs.
static PROVISION_LOCK: Mutex<()> = parking_lot::const_mutex(());

#[derive(Error, Debug)]
pub enum CertError {
    #[error("Cannot create certificate directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("RSA key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Certificate signing failed: {0}")]
    Signing(#[from] rcgen::Error),

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid PEM in {path}: {message}")]
    InvalidPem { path: PathBuf, message: String },
}

/// Location of the provisioned pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl CertPaths {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            cert: dir.join(CERT_FILE_NAME),
            key: dir.join(KEY_FILE_NAME),
        }
    }

    pub fn exist(&self) -> bool {
        self.cert.is_file() && self.key.is_file()
    }
}

/// Make sure `dir` holds a usable certificate/key pair and return its paths
pub fn ensure_certificate(dir: &Path) -> Result<CertPaths, CertError> {
    let paths = CertPaths::in_dir(dir);
    let _guard = PROVISION_LOCK.lock();

    if paths.exist() {
        tracing::info!("Using existing TLS certificate {}", paths.cert.display());
        return Ok(paths);
    }

    tracing::info!("Generating self-signed TLS certificate in {}", dir.display());
    std::fs::create_dir_all(dir).map_err(|source| CertError::CreateDir {
        path: dir.to_path_buf(),
        source,
    })?;

    let generated = generate_self_signed()?;
    write_atomic(&paths.key, generated.key_pem.as_bytes(), true)?;
    write_atomic(&paths.cert, generated.cert_pem.as_bytes(), false)?;

    tracing::info!(
        "TLS certificate written: {} / {}",
        paths.cert.display(),
        paths.key.display()
    );
    Ok(paths)
}

struct GeneratedPair {
    cert_pem: String,
    key_pem: String,
}

fn generate_self_signed() -> Result<GeneratedPair, CertError> {
    let mut rng = rand::thread_rng();
    let rsa_key = RsaPrivateKey::new(&mut rng, RSA_KEY_BITS)
        .map_err(|e| CertError::KeyGeneration(e.to_string()))?;
    let key_pem = rsa_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| CertError::KeyGeneration(e.to_string()))?;

    let key_pair = KeyPair::from_pem_and_sign_algo(&key_pem, &rcgen::PKCS_RSA_SHA256)?;

    let mut params = CertificateParams::new(vec!["localhost".to_string()])?;
    params
        .subject_alt_names
        .push(SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)));

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CountryName, "ES");
    dn.push(DnType::StateOrProvinceName, "Madrid");
    dn.push(DnType::LocalityName, "Madrid");
    dn.push(DnType::OrganizationName, "NetHub");
    dn.push(DnType::OrganizationalUnitName, "DAM-2");
    dn.push(DnType::CommonName, "localhost");
    params.distinguished_name = dn;

    params.serial_number = Some(SerialNumber::from(CERT_SERIAL));
    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::days(VALIDITY_DAYS);

    let cert = params.self_signed(&key_pair)?;

    Ok(GeneratedPair {
        cert_pem: cert.pem(),
        key_pem: key_pem.as_str().to_owned(),
    })
}

fn write_atomic(path: &Path, contents: &[u8], private: bool) -> Result<(), CertError> {
    let write_err = |source: std::io::Error| CertError::Write {
        path: path.to_path_buf(),
        source,
    };
    let dir = path.parent().unwrap_or_else(|| Path::new("."));

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
    tmp.write_all(contents).map_err(write_err)?;
    tmp.as_file().sync_all().map_err(write_err)?;

    #[cfg(unix)]
    if private {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o600))
            .map_err(write_err)?;
    }
    #[cfg(not(unix))]
    let _ = private;

    tmp.persist(path).map_err(|e| write_err(e.error))?;
    Ok(())
}

/// Load every certificate in a PEM file
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, CertError> {
    let pem = std::fs::read(path).map_err(|source| CertError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let certs = CertificateDer::pem_slice_iter(&pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CertError::InvalidPem {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
    if certs.is_empty() {
        return Err(CertError::InvalidPem {
            path: path.to_path_buf(),
            message: "no certificates found".to_string(),
        });
    }
    Ok(certs)
}

/// Load the first private key in a PEM file
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, CertError> {
    let pem = std::fs::read(path).map_err(|source| CertError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    PrivateKeyDer::from_pem_slice(&pem).map_err(|e| CertError::InvalidPem {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}
