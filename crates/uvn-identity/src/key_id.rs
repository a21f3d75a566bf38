//! Key identification within the backend.

use serde::{Deserialize, Serialize};
use std::fmt;
use uvn_types::Email;

/// The three kinds of key the backend manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    Root,
    Cell,
    Particle,
}

impl KeyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyType::Root => "root",
            KeyType::Cell => "cell",
            KeyType::Particle => "particle",
        }
    }

    pub const ALL: [KeyType; 3] = [KeyType::Root, KeyType::Cell, KeyType::Particle];
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unique identity of a key: (type, owner email, target name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyId {
    pub kind: KeyType,
    pub owner: Email,
    pub target: String,
}

impl KeyId {
    pub fn new(kind: KeyType, owner: Email, target: impl Into<String>) -> Self {
        Self {
            kind,
            owner,
            target: target.into(),
        }
    }

    pub fn root(owner: Email, uvn_name: impl Into<String>) -> Self {
        Self::new(KeyType::Root, owner, uvn_name)
    }

    pub fn cell(owner: Email, cell_name: impl Into<String>) -> Self {
        Self::new(KeyType::Cell, owner, cell_name)
    }

    pub fn particle(owner: Email, particle_name: impl Into<String>) -> Self {
        Self::new(KeyType::Particle, owner, particle_name)
    }

    /// Environment-variable suffix for the target name.
    pub fn env_suffix(&self) -> String {
        self.target
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect()
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.kind, self.owner, self.target)
    }
}
