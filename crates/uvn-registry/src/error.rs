//! Registry error taxonomy.
//!
//! Every public operation surfaces one of these kinds unchanged; the
//! surrounding CLI maps them to exit codes via [`RegistryError::exit_code`].

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
    /// Malformed user input; registry state unchanged.
    #[error("invalid input: {0}")]
    Input(String),

    /// An invariant would be violated; caller must adjust.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The backend has no key for a requested entity.
    #[error("missing key: {0}")]
    MissingKey(String),

    /// Sign/verify/encrypt/decrypt failed; fatal for the operation.
    #[error("crypto failure in {operation}: {source}")]
    Crypto {
        operation: String,
        #[source]
        source: uvn_crypto::CryptoError,
    },

    /// The selected strategy could not produce a valid graph.
    #[error("deployment failed: {0}")]
    Deployment(String),

    /// Filesystem failure; on-disk state may be partial.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RegistryError {
    pub fn crypto(operation: impl Into<String>, source: uvn_crypto::CryptoError) -> Self {
        RegistryError::Crypto {
            operation: operation.into(),
            source,
        }
    }

    /// Exit code contract for the surrounding CLI:
    /// 0 ok, 1 generic, 2 missing/invalid input, 3 crypto, 4 deployment.
    pub fn exit_code(&self) -> i32 {
        match self {
            RegistryError::Input(_) | RegistryError::Validation(_) => 2,
            RegistryError::Crypto { .. } => 3,
            RegistryError::Deployment(_) => 4,
            RegistryError::MissingKey(_) | RegistryError::Io(_) => 1,
        }
    }
}

impl From<uvn_types::InputError> for RegistryError {
    fn from(value: uvn_types::InputError) -> Self {
        RegistryError::Input(value.to_string())
    }
}

impl From<uvn_network::NetworkError> for RegistryError {
    fn from(value: uvn_network::NetworkError) -> Self {
        RegistryError::Deployment(value.to_string())
    }
}

impl From<uvn_identity::IdentityError> for RegistryError {
    fn from(value: uvn_identity::IdentityError) -> Self {
        use uvn_identity::IdentityError as Ie;
        match value {
            Ie::MissingKey(key) => RegistryError::MissingKey(key),
            Ie::MultipleKeys(key) => RegistryError::MissingKey(format!("ambiguous key: {}", key)),
            Ie::MissingPassphrase(target, env) => RegistryError::MissingKey(format!(
                "no passphrase for {} (UVN_AUTH_{})",
                target, env
            )),
            Ie::Crypto(source) => RegistryError::crypto("keys backend", source),
            Ie::Io(e) => RegistryError::Io(e),
            Ie::Json(e) => RegistryError::Validation(format!("malformed key database: {}", e)),
            Ie::RootKeyRequired(key) => {
                RegistryError::Validation(format!("operation requires the root key, got {}", key))
            }
            Ie::NotInitialized(path) => {
                RegistryError::Validation(format!("key database not initialized at {}", path))
            }
        }
    }
}

impl From<serde_yaml::Error> for RegistryError {
    fn from(value: serde_yaml::Error) -> Self {
        RegistryError::Validation(format!("serialization: {}", value))
    }
}

impl From<tera::Error> for RegistryError {
    fn from(value: tera::Error) -> Self {
        RegistryError::Validation(format!("template: {}", value))
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(RegistryError::Input("x".into()).exit_code(), 2);
        assert_eq!(RegistryError::Validation("x".into()).exit_code(), 2);
        assert_eq!(
            RegistryError::crypto(
                "sign",
                uvn_crypto::CryptoError::SignatureError("bad".into())
            )
            .exit_code(),
            3
        );
        assert_eq!(RegistryError::Deployment("x".into()).exit_code(), 4);
        assert_eq!(RegistryError::MissingKey("x".into()).exit_code(), 1);
    }
}
