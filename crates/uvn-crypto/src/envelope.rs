//! Encryption envelopes for key material and configuration bundles.
//!
//! Two flavors:
//! - [`PassphraseEnvelope`]: PBKDF2-SHA256 derived key + AES-256-GCM, used
//!   for private keys at rest.
//! - [`SealedEnvelope`]: ephemeral X25519 agreement + AES-256-GCM, used to
//!   seal bundles to a recipient's encryption key.

use crate::error::{CryptoError, Result};
use crate::wireguard::decode_key;
use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use rand_core::OsRng as X25519OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use x25519_dalek::{PublicKey, StaticSecret};

const SALT_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;
const PBKDF2_ITERATIONS: u32 = 100_000;
const ENVELOPE_VERSION: &str = "1";

/// Data sealed under a passphrase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassphraseEnvelope {
    pub version: String,
    pub salt: String,
    pub nonce: String,
    pub ciphertext: String,
}

impl PassphraseEnvelope {
    pub fn seal(data: &[u8], passphrase: &str) -> Result<Self> {
        let mut salt = vec![0u8; SALT_SIZE];
        let mut nonce_bytes = vec![0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut salt);
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let key_bytes = derive_key(passphrase, &salt);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), data)
            .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;

        Ok(Self {
            version: ENVELOPE_VERSION.to_string(),
            salt: BASE64.encode(salt),
            nonce: BASE64.encode(nonce_bytes),
            ciphertext: BASE64.encode(ciphertext),
        })
    }

    pub fn open(&self, passphrase: &str) -> Result<Vec<u8>> {
        let salt = BASE64.decode(&self.salt)?;
        let nonce = BASE64.decode(&self.nonce)?;
        let ciphertext = BASE64.decode(&self.ciphertext)?;

        let key_bytes = derive_key(passphrase, &salt);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
        cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
            .map_err(|e| CryptoError::DecryptionError(e.to_string()))
    }

    pub fn write_file(path: &Path, data: &[u8], passphrase: &str) -> Result<()> {
        let envelope = Self::seal(data, passphrase)?;
        crate::fsutil::write_atomic(path, serde_json::to_string_pretty(&envelope)?.as_bytes())?;
        crate::fsutil::restrict_file(path)?;
        Ok(())
    }

    pub fn read_file(path: &Path, passphrase: &str) -> Result<Vec<u8>> {
        let envelope: Self = serde_json::from_str(&fs::read_to_string(path)?)?;
        envelope.open(passphrase)
    }
}

fn derive_key(passphrase: &str, salt: &[u8]) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key);
    key
}

/// An X25519 key pair used for sealing data to an entity.
#[derive(Debug, Clone)]
pub struct EncryptionKeyPair {
    secret: [u8; 32],
    public: [u8; 32],
}

impl EncryptionKeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::new(X25519OsRng);
        let public = PublicKey::from(&secret);
        Self {
            secret: secret.to_bytes(),
            public: public.to_bytes(),
        }
    }

    pub fn from_secret_base64(value: &str) -> Result<Self> {
        let bytes = decode_key(value)?;
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Ok(Self {
            secret: secret.to_bytes(),
            public: public.to_bytes(),
        })
    }

    pub fn secret_base64(&self) -> String {
        BASE64.encode(self.secret)
    }

    pub fn public_base64(&self) -> String {
        BASE64.encode(self.public)
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.public
    }
}

/// Data sealed to a recipient's X25519 public key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedEnvelope {
    pub version: String,
    pub ephemeral_public: String,
    pub nonce: String,
    pub ciphertext: String,
}

impl SealedEnvelope {
    pub fn seal(data: &[u8], recipient_public_base64: &str) -> Result<Self> {
        let recipient = PublicKey::from(decode_key(recipient_public_base64)?);
        let ephemeral = StaticSecret::new(X25519OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral);
        let shared = ephemeral.diffie_hellman(&recipient);

        let key_bytes = seal_key(shared.as_bytes(), ephemeral_public.as_bytes(), recipient.as_bytes());
        let mut nonce_bytes = vec![0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), data)
            .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;

        Ok(Self {
            version: ENVELOPE_VERSION.to_string(),
            ephemeral_public: BASE64.encode(ephemeral_public.as_bytes()),
            nonce: BASE64.encode(nonce_bytes),
            ciphertext: BASE64.encode(ciphertext),
        })
    }

    pub fn open(&self, recipient: &EncryptionKeyPair) -> Result<Vec<u8>> {
        let ephemeral_public = PublicKey::from(decode_key(&self.ephemeral_public)?);
        let secret = StaticSecret::from(recipient.secret);
        let shared = secret.diffie_hellman(&ephemeral_public);

        let key_bytes = seal_key(
            shared.as_bytes(),
            ephemeral_public.as_bytes(),
            &recipient.public,
        );
        let nonce = BASE64.decode(&self.nonce)?;
        let ciphertext = BASE64.decode(&self.ciphertext)?;

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
        cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
            .map_err(|e| CryptoError::DecryptionError(e.to_string()))
    }

    pub fn write_file(path: &Path, data: &[u8], recipient_public_base64: &str) -> Result<()> {
        let envelope = Self::seal(data, recipient_public_base64)?;
        crate::fsutil::write_atomic(path, serde_json::to_string_pretty(&envelope)?.as_bytes())?;
        Ok(())
    }

    pub fn read_file(path: &Path, recipient: &EncryptionKeyPair) -> Result<Vec<u8>> {
        let envelope: Self = serde_json::from_str(&fs::read_to_string(path)?)?;
        envelope.open(recipient)
    }
}

fn seal_key(shared: &[u8; 32], ephemeral_public: &[u8; 32], recipient_public: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(shared);
    hasher.update(ephemeral_public);
    hasher.update(recipient_public);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_passphrase_round_trip() {
        let envelope = PassphraseEnvelope::seal(b"private key bytes", "a long passphrase").unwrap();
        assert_eq!(
            envelope.open("a long passphrase").unwrap(),
            b"private key bytes"
        );
        assert!(envelope.open("wrong passphrase").is_err());
    }

    #[test]
    fn test_passphrase_file_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("east-key.pem");
        PassphraseEnvelope::write_file(&path, b"material", "pass pass pass pass").unwrap();
        assert_eq!(
            PassphraseEnvelope::read_file(&path, "pass pass pass pass").unwrap(),
            b"material"
        );
    }

    #[test]
    fn test_sealed_round_trip() {
        let recipient = EncryptionKeyPair::generate();
        let envelope = SealedEnvelope::seal(b"bundle bytes", &recipient.public_base64()).unwrap();
        assert_eq!(envelope.open(&recipient).unwrap(), b"bundle bytes");
    }

    #[test]
    fn test_sealed_wrong_recipient_fails() {
        let recipient = EncryptionKeyPair::generate();
        let other = EncryptionKeyPair::generate();
        let envelope = SealedEnvelope::seal(b"bundle bytes", &recipient.public_base64()).unwrap();
        assert!(envelope.open(&other).is_err());
    }

    #[test]
    fn test_encryption_key_round_trip() {
        let pair = EncryptionKeyPair::generate();
        let restored = EncryptionKeyPair::from_secret_base64(&pair.secret_base64()).unwrap();
        assert_eq!(restored.public_base64(), pair.public_base64());
    }
}
