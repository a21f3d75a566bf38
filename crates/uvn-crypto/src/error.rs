use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("invalid key format: {0}")]
    InvalidKeyFormat(String),

    #[error("signature verification failed: {0}")]
    SignatureError(String),

    #[error("certificate error: {0}")]
    CertificateError(String),

    #[error("encryption error: {0}")]
    EncryptionError(String),

    #[error("decryption error: {0}")]
    DecryptionError(String),

    #[error("password hash error: {0}")]
    PasswordHashError(String),

    #[error("QR code generation failed: {0}")]
    QrCodeError(String),

    #[error("PEM error: {0}")]
    PemError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("base64 decode error: {0}")]
    Base64Error(#[from] base64::DecodeError),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CryptoError>;
