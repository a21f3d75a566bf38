//! Registry users: owners of the UVN, cells and particles.

use crate::error::{RegistryError, Result};
use crate::versioned::{Revision, Versioned};
use serde::{Deserialize, Serialize};
use uvn_types::Email;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub email: Email,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    password_hash: Option<String>,
    #[serde(default)]
    pub banned: bool,
    #[serde(default)]
    pub init_ts: String,
    #[serde(skip)]
    revision: Revision,
}

impl User {
    pub fn new(email: Email, name: Option<String>, init_ts: String) -> Self {
        Self {
            email,
            name,
            password_hash: None,
            banned: false,
            init_ts,
            revision: Revision::default(),
        }
    }

    pub fn set_password(&mut self, password: &str) -> Result<()> {
        let hash = uvn_crypto::password::hash_password(password)
            .map_err(|e| RegistryError::crypto("password hash", e))?;
        self.password_hash = Some(hash);
        self.revision.mark();
        Ok(())
    }

    pub fn verify_password(&self, password: &str) -> Result<bool> {
        match &self.password_hash {
            None => Ok(false),
            Some(hash) => uvn_crypto::password::verify_password(password, hash)
                .map_err(|e| RegistryError::crypto("password verify", e)),
        }
    }

    /// Serialized view with secret-bearing fields elided.
    pub fn public_view(&self) -> Self {
        let mut view = self.clone();
        view.password_hash = None;
        view
    }

    pub fn set_name(&mut self, name: Option<String>) -> bool {
        crate::versioned::set_field(&mut self.revision, &mut self.name, name)
    }

    pub fn set_banned(&mut self, banned: bool) -> bool {
        crate::versioned::set_field(&mut self.revision, &mut self.banned, banned)
    }
}

// Equality over semantic properties; init_ts and revision are excluded so
// reloaded trees compare equal to the ones that produced them.
impl PartialEq for User {
    fn eq(&self, other: &Self) -> bool {
        self.email == other.email
            && self.name == other.name
            && self.password_hash == other.password_hash
            && self.banned == other.banned
    }
}

impl Eq for User {}

impl Versioned for User {
    fn revision(&self) -> &Revision {
        &self.revision
    }

    fn revision_mut(&mut self) -> &mut Revision {
        &mut self.revision
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> User {
        User::new(
            Email::parse("alice@acme.example.com").unwrap(),
            Some("Alice".to_string()),
            "2024-01-01T00:00:00".to_string(),
        )
    }

    #[test]
    fn test_password_round_trip() {
        let mut u = user();
        assert!(!u.verify_password("secret").unwrap());
        u.set_password("secret").unwrap();
        assert!(u.verify_password("secret").unwrap());
        assert!(!u.verify_password("other").unwrap());
    }

    #[test]
    fn test_public_view_elides_password() {
        let mut u = user();
        u.set_password("secret").unwrap();
        let yaml = serde_yaml::to_string(&u.public_view()).unwrap();
        assert!(!yaml.contains("argon2"));
    }

    #[test]
    fn test_equality_ignores_init_ts() {
        let a = user();
        let mut b = user();
        b.init_ts = "2030-01-01T00:00:00".to_string();
        assert_eq!(a, b);
    }
}
