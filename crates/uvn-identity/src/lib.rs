pub mod backend;
pub mod error;
pub mod key_id;
pub mod permissions;

pub use backend::{CaPublic, Key, KeyMaterial, KeysBackend, KeysBackendConfig};
pub use error::{IdentityError, Result};
pub use key_id::{KeyId, KeyType};
pub use permissions::{topic_grants, TopicGrants};
