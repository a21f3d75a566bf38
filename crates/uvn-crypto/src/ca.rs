//! X.509 certificate authority backed by rcgen.
//!
//! The registry runs two of these: one issuing identity certificates, one
//! signing permission grants. Both use Ed25519 keys, so the same key
//! material drives certificate issuance and detached file signatures.

use crate::error::{CryptoError, Result};
use crate::fsutil::{restrict_dir, restrict_file, write_atomic};
use crate::identity::{DetachedSignature, IdentityKeyPair, SignedDocument};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair as RcgenKeyPair,
    KeyUsagePurpose,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Certificates are valid for 12 years from registry initialization; the
/// span straddles leap years without date-math surprises.
pub const VALIDITY_DAYS: i64 = 12 * 365 + 3;

const CA_CERT_FILE: &str = "ca-cert.pem";
const CA_META_FILE: &str = "ca-meta.json";
const CA_KEY_FILE: &str = "ca-key.pem";
const PRIVATE_DIR: &str = "private";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaSubject {
    pub organization: String,
    pub common_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CaMetadata {
    subject: CaSubject,
    not_before: i64,
    not_after: i64,
}

/// A filesystem-rooted certificate authority.
pub struct CertificateAuthority {
    root_dir: PathBuf,
    meta: CaMetadata,
    cert_pem: String,
    key: IdentityKeyPair,
}

impl CertificateAuthority {
    /// Create the CA under `root_dir`, or load it if it already exists.
    pub fn create(root_dir: &Path, subject: CaSubject, not_before: i64) -> Result<Self> {
        if root_dir.join(CA_CERT_FILE).exists() {
            return Self::load(root_dir);
        }

        let private_dir = root_dir.join(PRIVATE_DIR);
        fs::create_dir_all(&private_dir)?;
        restrict_dir(&private_dir)?;

        let meta = CaMetadata {
            subject,
            not_before,
            not_after: not_before + VALIDITY_DAYS * 86_400,
        };

        let key = IdentityKeyPair::generate();
        let key_pem = key.to_pkcs8_pem()?;
        let rc_key = RcgenKeyPair::from_pem(&key_pem)
            .map_err(|e| CryptoError::CertificateError(e.to_string()))?;
        let params = ca_params(&meta)?;
        let cert = params
            .self_signed(&rc_key)
            .map_err(|e| CryptoError::CertificateError(e.to_string()))?;
        let cert_pem = cert.pem();

        write_atomic(&root_dir.join(CA_CERT_FILE), cert_pem.as_bytes())?;
        write_atomic(
            &root_dir.join(CA_META_FILE),
            serde_json::to_string_pretty(&meta)?.as_bytes(),
        )?;
        let key_path = private_dir.join(CA_KEY_FILE);
        write_atomic(&key_path, key_pem.as_bytes())?;
        restrict_file(&key_path)?;

        Ok(Self {
            root_dir: root_dir.to_path_buf(),
            meta,
            cert_pem,
            key,
        })
    }

    pub fn load(root_dir: &Path) -> Result<Self> {
        let cert_pem = fs::read_to_string(root_dir.join(CA_CERT_FILE))?;
        let meta: CaMetadata =
            serde_json::from_str(&fs::read_to_string(root_dir.join(CA_META_FILE))?)?;
        let key_pem = fs::read_to_string(root_dir.join(PRIVATE_DIR).join(CA_KEY_FILE))?;
        let key = IdentityKeyPair::from_pkcs8_pem(&key_pem)?;
        Ok(Self {
            root_dir: root_dir.to_path_buf(),
            meta,
            cert_pem,
            key,
        })
    }

    pub fn exists(root_dir: &Path) -> bool {
        root_dir.join(CA_CERT_FILE).exists()
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn subject(&self) -> &CaSubject {
        &self.meta.subject
    }

    pub fn not_before(&self) -> i64 {
        self.meta.not_before
    }

    pub fn not_after(&self) -> i64 {
        self.meta.not_after
    }

    /// Issue an end-entity certificate for `common_name`, binding the
    /// public half of the PKCS#8 key pair given in `subject_key_pem`.
    pub fn issue_certificate(&self, common_name: &str, subject_key_pem: &str) -> Result<String> {
        let entity_key = RcgenKeyPair::from_pem(subject_key_pem)
            .map_err(|e| CryptoError::CertificateError(e.to_string()))?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, &self.meta.subject.organization);
        dn.push(DnType::CommonName, common_name);

        let mut params = CertificateParams::default();
        params.is_ca = IsCa::NoCa;
        params.distinguished_name = dn;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.not_before = offset_ts(self.meta.not_before)?;
        params.not_after = offset_ts(self.meta.not_after)?;

        // The issuer certificate object is rebuilt from persisted metadata;
        // issuance only depends on the issuer's DN and key.
        let issuer_key_pem = self.key.to_pkcs8_pem()?;
        let issuer_key = RcgenKeyPair::from_pem(&issuer_key_pem)
            .map_err(|e| CryptoError::CertificateError(e.to_string()))?;
        let issuer_cert = ca_params(&self.meta)?
            .self_signed(&issuer_key)
            .map_err(|e| CryptoError::CertificateError(e.to_string()))?;

        let cert = params
            .signed_by(&entity_key, &issuer_cert, &issuer_key)
            .map_err(|e| CryptoError::CertificateError(e.to_string()))?;
        Ok(cert.pem())
    }

    /// Detached signature with the CA key itself.
    pub fn sign_data(&self, data: &[u8]) -> DetachedSignature {
        self.key.sign(data, &self.meta.subject.common_name)
    }

    /// Attached signature document (payload + signature in one file).
    pub fn sign_document(&self, payload: &[u8]) -> SignedDocument {
        SignedDocument::sign(payload, &self.key, &self.meta.subject.common_name)
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.key.verifying_key().to_bytes()
    }

    /// Verify a signature made with the CA key.
    pub fn verify(&self, data: &[u8], signature: &DetachedSignature) -> Result<()> {
        signature.verify_with_key(data, &self.key.verifying_key())
    }

    pub fn public_key_hex(&self) -> String {
        self.key.public_key_hex()
    }
}

fn ca_params(meta: &CaMetadata) -> Result<CertificateParams> {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, &meta.subject.organization);
    dn.push(DnType::CommonName, &meta.subject.common_name);

    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.distinguished_name = dn;
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.not_before = offset_ts(meta.not_before)?;
    params.not_after = offset_ts(meta.not_after)?;
    Ok(params)
}

fn offset_ts(unix: i64) -> Result<time::OffsetDateTime> {
    time::OffsetDateTime::from_unix_timestamp(unix)
        .map_err(|e| CryptoError::CertificateError(format!("timestamp {}: {}", unix, e)))
}

/// Generate a fresh Ed25519 key pair in the PEM form rcgen consumes.
pub fn generate_entity_key() -> Result<(IdentityKeyPair, zeroize::Zeroizing<String>)> {
    let key = IdentityKeyPair::generate();
    let pem = key.to_pkcs8_pem()?;
    Ok((key, pem))
}
