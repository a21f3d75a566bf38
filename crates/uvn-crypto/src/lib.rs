pub mod ca;
pub mod envelope;
pub mod error;
pub mod fsutil;
pub mod identity;
pub mod passphrase;
pub mod password;
pub mod pem;
pub mod qr;
pub mod wireguard;

pub use ca::{CaSubject, CertificateAuthority, VALIDITY_DAYS};
pub use envelope::{EncryptionKeyPair, PassphraseEnvelope, SealedEnvelope};
pub use error::{CryptoError, Result};
pub use identity::{DetachedSignature, IdentityKeyPair, SignedDocument};
pub use wireguard::{PresharedKey, WgKeyPair};
