//! WireGuard key material: X25519 key pairs and preshared keys.
//!
//! Keys are carried base64-encoded in the same form `wg genkey` /
//! `wg genpsk` emit, so rendered configurations can be fed to wg-quick
//! unchanged.

use crate::error::{CryptoError, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use rand_core::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

/// An X25519 key pair for a WireGuard interface endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WgKeyPair {
    private_key: [u8; 32],
    public_key: [u8; 32],
}

impl WgKeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::new(OsRng);
        let public = PublicKey::from(&secret);
        Self {
            private_key: secret.to_bytes(),
            public_key: public.to_bytes(),
        }
    }

    pub fn from_private_base64(private_base64: &str) -> Result<Self> {
        let bytes = decode_key(private_base64)?;
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Ok(Self {
            private_key: secret.to_bytes(),
            public_key: public.to_bytes(),
        })
    }

    pub fn private_key_base64(&self) -> String {
        BASE64.encode(self.private_key)
    }

    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.public_key)
    }

    /// Diffie-Hellman against another endpoint's public key.
    pub fn shared_secret(&self, peer_public_base64: &str) -> Result<[u8; 32]> {
        let peer = decode_key(peer_public_base64)?;
        let secret = StaticSecret::from(self.private_key);
        let shared = secret.diffie_hellman(&PublicKey::from(peer));
        Ok(*shared.as_bytes())
    }
}

/// A 32-byte preshared key, one per backbone link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresharedKey([u8; 32]);

impl PresharedKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_base64(value: &str) -> Result<Self> {
        Ok(Self(decode_key(value)?))
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }
}

/// Validate and decode a base64-encoded 32-byte key.
pub fn decode_key(value: &str) -> Result<[u8; 32]> {
    let bytes = BASE64.decode(value.trim())?;
    if bytes.len() != 32 {
        return Err(CryptoError::InvalidKeyFormat(format!(
            "key must be 32 bytes, got {}",
            bytes.len()
        )));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// Validate a base64-encoded public key without keeping it.
pub fn validate_public_key(public_base64: &str) -> Result<()> {
    decode_key(public_base64).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_generation() {
        let pair = WgKeyPair::generate();
        assert_eq!(BASE64.decode(pair.private_key_base64()).unwrap().len(), 32);
        assert_eq!(BASE64.decode(pair.public_key_base64()).unwrap().len(), 32);
        assert_ne!(pair.private_key_base64(), pair.public_key_base64());
    }

    #[test]
    fn test_public_key_derivation_round_trip() {
        let pair = WgKeyPair::generate();
        let restored = WgKeyPair::from_private_base64(&pair.private_key_base64()).unwrap();
        assert_eq!(restored.public_key_base64(), pair.public_key_base64());
    }

    #[test]
    fn test_shared_secret_agreement() {
        let a = WgKeyPair::generate();
        let b = WgKeyPair::generate();
        let ab = a.shared_secret(&b.public_key_base64()).unwrap();
        let ba = b.shared_secret(&a.public_key_base64()).unwrap();
        assert_eq!(ab, ba);
    }

    #[test]
    fn test_psk_round_trip() {
        let psk = PresharedKey::generate();
        let restored = PresharedKey::from_base64(&psk.to_base64()).unwrap();
        assert_eq!(psk, restored);
    }

    #[test]
    fn test_invalid_key_rejected() {
        assert!(decode_key("not base64 at all!").is_err());
        assert!(decode_key(&BASE64.encode([0u8; 16])).is_err());
    }
}
