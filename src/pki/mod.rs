//! PKI operations for the local control plane
//!
//! Every TLS domain gets its own throwaway certificate authority:
//!
//! - one CA for the API server (serving cert + admin client cert)
//! - one CA for the service-account token signer
//! - one fresh CA per provider for its webhook server
//!
//! CAs are never shared across providers, so a provider can only ever be
//! trusted for its own webhook endpoints. Nothing here is persisted; every
//! run regenerates all key material.

use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use thiserror::Error;

/// Default validity period for CA certificates (10 years)
pub const CA_VALIDITY_YEARS: i64 = 10;

/// Default validity period for leaf certificates (1 year)
pub const CERT_VALIDITY_YEARS: i64 = 1;

/// File mode for certificates
pub const CERT_FILE_MODE: u32 = 0o640;

/// File mode for private keys
pub const KEY_FILE_MODE: u32 = 0o600;

/// Organization written into every certificate subject
const ORGANIZATION: &str = "kbb8";

/// Returns (not_before, not_after) starting now.
fn compute_validity(years: i64) -> (::time::OffsetDateTime, ::time::OffsetDateTime) {
    let now = ::time::OffsetDateTime::now_utc();
    let not_after = now + ::time::Duration::days(years * 365);
    (now, not_after)
}

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// Certificate generation failed
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// Certificate parsing error
    #[error("certificate parsing error: {0}")]
    ParseError(String),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// A PEM-encoded leaf certificate and its private key
#[derive(Clone)]
pub struct Certificate {
    cert_pem: String,
    key_pem: String,
}

impl Certificate {
    /// PEM-encoded certificate
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// PEM-encoded PKCS#8 private key
    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    /// Write `tls.crt` and `tls.key` into `dir`, creating it if needed
    pub fn write_pair(&self, dir: &Path) -> std::io::Result<(PathBuf, PathBuf)> {
        std::fs::create_dir_all(dir)?;
        let cert_file = dir.join("tls.crt");
        let key_file = dir.join("tls.key");
        write_pem_file(&cert_file, &self.cert_pem, CERT_FILE_MODE)?;
        write_pem_file(&key_file, &self.key_pem, KEY_FILE_MODE)?;
        Ok((cert_file, key_file))
    }
}

/// Write PEM data to `path` with the given mode, replacing any previous file
pub fn write_pem_file(path: &Path, pem: &str, mode: u32) -> std::io::Result<()> {
    // Mode only applies on create, so drop leftovers from an earlier run
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e),
        _ => {}
    }
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(mode)
        .open(path)?;
    file.write_all(pem.as_bytes())
}

impl std::fmt::Debug for Certificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Certificate")
            .field("cert_pem", &self.cert_pem)
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

/// Identity embedded in a client certificate
///
/// The API server maps the subject CN to the user name and the subject
/// organization to the user's group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    /// User name (subject CN)
    pub name: String,
    /// Groups (subject O)
    pub groups: Vec<String>,
}

/// Self-signed certificate authority
#[derive(Clone)]
pub struct CertificateAuthority {
    /// CA key pair serialized as PEM (KeyPair isn't Clone)
    ca_key_pem: String,
    /// PEM-encoded CA certificate for distribution
    ca_cert_pem: String,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("ca_cert_pem", &self.ca_cert_pem)
            .finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// Create a new self-signed CA
    pub fn new(common_name: &str) -> Result<Self> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(common_name.to_string()),
        );
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String(ORGANIZATION.to_string()),
        );
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let (not_before, not_after) = compute_validity(CA_VALIDITY_YEARS);
        params.not_before = not_before;
        params.not_after = not_after;

        let key_pair = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate CA key: {}", e))
        })?;

        let ca_key_pem = key_pair.serialize_pem();

        let cert = params.self_signed(&key_pair).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to create CA cert: {}", e))
        })?;

        Ok(Self {
            ca_key_pem,
            ca_cert_pem: cert.pem(),
        })
    }

    /// CA certificate in PEM format (the trust anchor handed to clients)
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// CA private key in PEM format
    ///
    /// Only used for the service-account signer, whose CA key doubles as the
    /// token signing key.
    pub fn ca_key_pem(&self) -> &str {
        &self.ca_key_pem
    }

    fn load_key_pair(&self) -> Result<KeyPair> {
        KeyPair::from_pem(&self.ca_key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to load CA key: {}", e)))
    }

    /// Issue a TLS server certificate valid for the given DNS names and IPs
    pub fn generate_serving_cert(&self, names: &[&str]) -> Result<Certificate> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        let common_name = names.first().copied().unwrap_or("kbb8 server");
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(common_name.to_string()),
        );
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String(ORGANIZATION.to_string()),
        );
        params.distinguished_name = dn;

        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let (not_before, not_after) = compute_validity(CERT_VALIDITY_YEARS);
        params.not_before = not_before;
        params.not_after = not_after;

        params.subject_alt_names = names
            .iter()
            .map(|name| {
                if let Ok(ip) = name.parse::<std::net::IpAddr>() {
                    Ok(SanType::IpAddress(ip))
                } else {
                    Ia5String::try_from(name.to_string())
                        .map(SanType::DnsName)
                        .map_err(|e| {
                            PkiError::CertificateGenerationFailed(format!(
                                "invalid DNS name '{}': {}",
                                name, e
                            ))
                        })
                }
            })
            .collect::<Result<Vec<_>>>()?;

        self.sign(params, "serving")
    }

    /// Issue a client-auth certificate for the given identity
    ///
    /// rcgen keeps a single value per subject attribute, so at most one
    /// group can be encoded.
    pub fn generate_client_cert(&self, identity: &ClientIdentity) -> Result<Certificate> {
        if identity.groups.len() > 1 {
            return Err(PkiError::CertificateGenerationFailed(format!(
                "client certificate for {} requests {} groups, at most one is supported",
                identity.name,
                identity.groups.len()
            )));
        }

        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(identity.name.clone()),
        );
        if let Some(group) = identity.groups.first() {
            dn.push(
                DnType::OrganizationName,
                DnValue::Utf8String(group.clone()),
            );
        }
        params.distinguished_name = dn;

        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];

        let (not_before, not_after) = compute_validity(CERT_VALIDITY_YEARS);
        params.not_before = not_before;
        params.not_after = not_after;

        self.sign(params, "client")
    }

    fn sign(&self, params: CertificateParams, purpose: &str) -> Result<Certificate> {
        let leaf_key = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate {} key: {}", purpose, e))
        })?;
        let key_pem = leaf_key.serialize_pem();

        let ca_key = self.load_key_pair()?;
        let issuer = Issuer::from_ca_cert_pem(&self.ca_cert_pem, &ca_key)
            .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))?;

        let cert = params.signed_by(&leaf_key, &issuer).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!(
                "failed to sign {} cert: {}",
                purpose, e
            ))
        })?;

        Ok(Certificate {
            cert_pem: cert.pem(),
            key_pem,
        })
    }
}
