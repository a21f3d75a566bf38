use thiserror::Error;

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("no key found for {0}")]
    MissingKey(String),

    #[error("multiple keys match {0}")]
    MultipleKeys(String),

    #[error("no passphrase available for {0} (set UVN_AUTH_{1} or provide the sidecar file)")]
    MissingPassphrase(String, String),

    #[error("operation only supported for root keys: {0}")]
    RootKeyRequired(String),

    #[error("key database not initialized at {0}")]
    NotInitialized(String),

    #[error("crypto error: {0}")]
    Crypto(#[from] uvn_crypto::CryptoError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, IdentityError>;
