//! Validated identifiers for registry entities.
//!
//! Entity identity is semantic: users are keyed by email, cells and
//! particles by name. Both kinds of identifier are validated once at the
//! boundary and then carried as cheap immutable strings.

use crate::error::{InputError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

fn email_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").unwrap()
    })
}

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z0-9]([a-z0-9._-]*[a-z0-9])?$").unwrap())
}

/// A validated, lower-cased email address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Email(String);

impl Email {
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim().to_lowercase();
        if !email_pattern().is_match(&value) {
            return Err(InputError::InvalidEmail(value));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Email {
    type Error = InputError;

    fn try_from(value: String) -> Result<Self> {
        Email::parse(&value)
    }
}

impl From<Email> for String {
    fn from(value: Email) -> Self {
        value.0
    }
}

impl fmt::Display for Email {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A validated entity name (cell, particle, or UVN name).
///
/// Names end up in DNS-ish labels, interface comments and file names, so the
/// accepted alphabet is deliberately narrow: lowercase alphanumerics plus
/// `.`, `_` and `-`, never at the edges.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityName(String);

impl EntityName {
    pub const MAX_LEN: usize = 63;

    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim().to_string();
        if value.is_empty() || value.len() > Self::MAX_LEN || !name_pattern().is_match(&value) {
            return Err(InputError::InvalidName(value));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The name mangled for use in an environment variable suffix:
    /// uppercase, with every non-alphanumeric character replaced by `_`.
    pub fn env_suffix(&self) -> String {
        self.0
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

impl TryFrom<String> for EntityName {
    type Error = InputError;

    fn try_from(value: String) -> Result<Self> {
        EntityName::parse(&value)
    }
}

impl From<EntityName> for String {
    fn from(value: EntityName) -> Self {
        value.0
    }
}

impl fmt::Display for EntityName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_email_validation() {
        assert!(Email::parse("admin@acme.example.com").is_ok());
        assert!(Email::parse("  Mixed.Case@Example.COM ").is_ok());
        assert!(Email::parse("not-an-email").is_err());
        assert!(Email::parse("missing@tld").is_err());
    }

    #[test]
    fn test_email_is_normalized() {
        let email = Email::parse("Admin@Acme.Example.Com").unwrap();
        assert_eq!(email.as_str(), "admin@acme.example.com");
    }

    #[test]
    fn test_name_validation() {
        assert!(EntityName::parse("east").is_ok());
        assert!(EntityName::parse("acme.example.com").is_ok());
        assert!(EntityName::parse("cell-01").is_ok());
        assert!(EntityName::parse("-leading").is_err());
        assert!(EntityName::parse("trailing-").is_err());
        assert!(EntityName::parse("UPPER").is_err());
        assert!(EntityName::parse("").is_err());
    }

    #[test]
    fn test_env_suffix() {
        let name = EntityName::parse("east.acme-1").unwrap();
        assert_eq!(name.env_suffix(), "EAST_ACME_1");
    }

    #[test]
    fn test_serde_round_trip() {
        let name = EntityName::parse("west").unwrap();
        let yaml = serde_yaml::to_string(&name).unwrap();
        let back: EntityName = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(name, back);
    }
}
