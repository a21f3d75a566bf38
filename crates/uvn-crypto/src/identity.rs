//! Ed25519 identity keys and detached file signatures.
//!
//! Every registry entity owns an identity key pair; artifacts (persisted
//! state, bundles, governance documents) carry detached signatures that can
//! be verified offline against the signer's recorded public key.

use crate::error::{CryptoError, Result};
use chrono::Utc;
use ed25519_dalek::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

pub const SIGNATURE_ALGORITHM: &str = "ed25519";

/// An Ed25519 signing key pair.
#[derive(Clone)]
pub struct IdentityKeyPair {
    signing_key: SigningKey,
}

impl IdentityKeyPair {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Load from a PKCS#8 PEM string.
    pub fn from_pkcs8_pem(pem: &str) -> Result<Self> {
        let signing_key = SigningKey::from_pkcs8_pem(pem)
            .map_err(|e| CryptoError::InvalidKeyFormat(format!("pkcs8: {}", e)))?;
        Ok(Self { signing_key })
    }

    /// Serialize the private key as PKCS#8 PEM.
    ///
    /// The PEM form is also what the certificate authority consumes when
    /// issuing the matching X.509 certificate.
    pub fn to_pkcs8_pem(&self) -> Result<Zeroizing<String>> {
        self.signing_key
            .to_pkcs8_pem(pkcs8::LineEnding::LF)
            .map_err(|e| CryptoError::InvalidKeyFormat(format!("pkcs8: {}", e)))
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.signing_key.verifying_key().to_bytes())
    }

    /// Produce a detached signature over `data`.
    pub fn sign(&self, data: &[u8], signer: &str) -> DetachedSignature {
        let signature = self.signing_key.sign(data);
        DetachedSignature {
            algorithm: SIGNATURE_ALGORITHM.to_string(),
            signer: signer.to_string(),
            public_key: self.public_key_hex(),
            signature: hex::encode(signature.to_bytes()),
            created: Utc::now().format("%Y-%m-%dT%H:%M:%S").to_string(),
        }
    }
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public_key", &self.public_key_hex())
            .finish()
    }
}

/// Short fingerprint of a verifying key.
pub fn fingerprint_of(key: &VerifyingKey) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(key.to_bytes());
    hex::encode(&digest[..8])
}

pub fn verifying_key_from_hex(value: &str) -> Result<VerifyingKey> {
    let bytes = hex::decode(value.trim())
        .map_err(|e| CryptoError::InvalidKeyFormat(format!("public key hex: {}", e)))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKeyFormat("public key must be 32 bytes".to_string()))?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|e| CryptoError::InvalidKeyFormat(format!("public key: {}", e)))
}

/// A detached signature, serialized as a JSON sidecar next to the signed
/// artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetachedSignature {
    pub algorithm: String,
    pub signer: String,
    pub public_key: String,
    pub signature: String,
    pub created: String,
}

impl DetachedSignature {
    /// Verify this signature over `data` with the embedded public key.
    pub fn verify(&self, data: &[u8]) -> Result<()> {
        if self.algorithm != SIGNATURE_ALGORITHM {
            return Err(CryptoError::SignatureError(format!(
                "unsupported algorithm: {}",
                self.algorithm
            )));
        }
        let key = verifying_key_from_hex(&self.public_key)?;
        let sig_bytes = hex::decode(&self.signature)
            .map_err(|e| CryptoError::SignatureError(format!("signature hex: {}", e)))?;
        let sig_bytes: [u8; 64] = sig_bytes
            .try_into()
            .map_err(|_| CryptoError::SignatureError("signature must be 64 bytes".to_string()))?;
        let signature = Signature::from_bytes(&sig_bytes);
        key.verify(data, &signature)
            .map_err(|e| CryptoError::SignatureError(e.to_string()))
    }

    /// Verify and additionally pin the signer to an expected public key.
    pub fn verify_with_key(&self, data: &[u8], expected: &VerifyingKey) -> Result<()> {
        let embedded = verifying_key_from_hex(&self.public_key)?;
        if embedded != *expected {
            return Err(CryptoError::SignatureError(format!(
                "signature by unexpected key {}",
                fingerprint_of(&embedded)
            )));
        }
        self.verify(data)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(value: &str) -> Result<Self> {
        Ok(serde_json::from_str(value)?)
    }
}

/// A document carried together with its signature, for artifacts that are
/// distributed as a single file (`*.p7s` naming kept from the on-disk
/// layout).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedDocument {
    pub payload: String,
    pub signature: DetachedSignature,
}

impl SignedDocument {
    pub fn sign(payload: &[u8], key: &IdentityKeyPair, signer: &str) -> Self {
        use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
        Self {
            payload: BASE64.encode(payload),
            signature: key.sign(payload, signer),
        }
    }

    /// Verify the embedded signature and return the payload bytes.
    pub fn open(&self) -> Result<Vec<u8>> {
        use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
        let payload = BASE64.decode(&self.payload)?;
        self.signature.verify(&payload)?;
        Ok(payload)
    }

    /// Verify against a pinned signer key and return the payload bytes.
    pub fn open_with_key(&self, expected: &VerifyingKey) -> Result<Vec<u8>> {
        use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
        let payload = BASE64.decode(&self.payload)?;
        self.signature.verify_with_key(&payload, expected)?;
        Ok(payload)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(value: &str) -> Result<Self> {
        Ok(serde_json::from_str(value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify() {
        let key = IdentityKeyPair::generate();
        let sig = key.sign(b"registry state", "registry");
        assert!(sig.verify(b"registry state").is_ok());
        assert!(sig.verify(b"tampered state").is_err());
    }

    #[test]
    fn test_verify_pins_signer() {
        let key = IdentityKeyPair::generate();
        let other = IdentityKeyPair::generate();
        let sig = key.sign(b"data", "cell");
        assert!(sig.verify_with_key(b"data", &key.verifying_key()).is_ok());
        assert!(sig.verify_with_key(b"data", &other.verifying_key()).is_err());
    }

    #[test]
    fn test_pkcs8_round_trip() {
        let key = IdentityKeyPair::generate();
        let pem = key.to_pkcs8_pem().unwrap();
        let restored = IdentityKeyPair::from_pkcs8_pem(&pem).unwrap();
        assert_eq!(restored.public_key_hex(), key.public_key_hex());
    }

    #[test]
    fn test_signed_document_round_trip() {
        let key = IdentityKeyPair::generate();
        let doc = SignedDocument::sign(b"<governance/>", &key, "ca-perm");
        let json = doc.to_json().unwrap();
        let restored = SignedDocument::from_json(&json).unwrap();
        assert_eq!(restored.open().unwrap(), b"<governance/>");
    }

    #[test]
    fn test_tampered_document_rejected() {
        let key = IdentityKeyPair::generate();
        let mut doc = SignedDocument::sign(b"<governance/>", &key, "ca-perm");
        doc.payload = {
            use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
            BASE64.encode(b"<governance evil='true'/>")
        };
        assert!(doc.open().is_err());
    }
}
