//! Cells: the sites participating in the UVN.

use crate::versioned::{Revision, Versioned};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uvn_types::{Email, EntityName};

pub const DEFAULT_HTTPD_PORT: u16 = 8080;

fn default_true() -> bool {
    true
}

fn default_httpd_port() -> u16 {
    DEFAULT_HTTPD_PORT
}

// Missing non-required keys fall back to their defaults on load; only the
// identity fields are required.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cell {
    /// Stable id, assigned densely at creation and never reused.
    pub id: u16,
    pub name: EntityName,
    pub owner: Email,
    /// Public endpoint; a cell without one can only join as a private peer.
    #[serde(default)]
    pub address: Option<String>,
    /// Private LANs this cell attaches to the UVN. Disjoint across cells.
    #[serde(default)]
    pub allowed_lans: BTreeSet<Ipv4Network>,
    #[serde(default = "default_true")]
    pub enable_particles_vpn: bool,
    #[serde(default = "default_httpd_port")]
    pub httpd_port: u16,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub banned: bool,
    #[serde(default)]
    pub init_ts: String,
    #[serde(skip)]
    revision: Revision,
}

impl Cell {
    pub fn new(id: u16, name: EntityName, owner: Email, init_ts: String) -> Self {
        Self {
            id,
            name,
            owner,
            address: None,
            allowed_lans: BTreeSet::new(),
            enable_particles_vpn: true,
            httpd_port: DEFAULT_HTTPD_PORT,
            location: None,
            banned: false,
            init_ts,
            revision: Revision::default(),
        }
    }

    /// A cell is a public peer iff it has an address, the registry itself
    /// is reachable, and the cell is not banned.
    pub fn is_public(&self, registry_has_address: bool) -> bool {
        self.address.is_some() && registry_has_address && !self.banned
    }

    pub fn set_address(&mut self, address: Option<String>) -> bool {
        crate::versioned::set_field(&mut self.revision, &mut self.address, address)
    }

    pub fn set_allowed_lans(&mut self, lans: BTreeSet<Ipv4Network>) -> bool {
        crate::versioned::set_field(&mut self.revision, &mut self.allowed_lans, lans)
    }

    pub fn set_enable_particles_vpn(&mut self, flag: bool) -> bool {
        crate::versioned::set_field(&mut self.revision, &mut self.enable_particles_vpn, flag)
    }

    pub fn set_httpd_port(&mut self, port: u16) -> bool {
        crate::versioned::set_field(&mut self.revision, &mut self.httpd_port, port)
    }

    pub fn set_location(&mut self, location: Option<String>) -> bool {
        crate::versioned::set_field(&mut self.revision, &mut self.location, location)
    }

    pub fn set_banned(&mut self, banned: bool) -> bool {
        crate::versioned::set_field(&mut self.revision, &mut self.banned, banned)
    }
}

impl PartialEq for Cell {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.name == other.name
            && self.owner == other.owner
            && self.address == other.address
            && self.allowed_lans == other.allowed_lans
            && self.enable_particles_vpn == other.enable_particles_vpn
            && self.httpd_port == other.httpd_port
            && self.location == other.location
            && self.banned == other.banned
    }
}

impl Eq for Cell {}

impl Versioned for Cell {
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

    fn cell() -> Cell {
        Cell::new(
            1,
            EntityName::parse("east").unwrap(),
            Email::parse("admin@acme.example.com").unwrap(),
            "2024-01-01T00:00:00".to_string(),
        )
    }

    #[test]
    fn test_public_requires_address_and_registry() {
        let mut c = cell();
        assert!(!c.is_public(true));
        c.address = Some("east.acme.example.com".to_string());
        assert!(c.is_public(true));
        assert!(!c.is_public(false));
        c.banned = true;
        assert!(!c.is_public(true));
    }

    #[test]
    fn test_serde_round_trip_preserves_equality() {
        let mut c = cell();
        c.allowed_lans.insert("10.0.1.0/24".parse().unwrap());
        let yaml = serde_yaml::to_string(&c).unwrap();
        let back: Cell = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(c, back);
    }

    #[test]
    fn test_missing_optional_keys_default() {
        let yaml = "id: 3\nname: south\nowner: admin@acme.example.com\nextra_key: ignored\n";
        let c: Cell = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(c.id, 3);
        assert!(c.enable_particles_vpn);
        assert_eq!(c.httpd_port, DEFAULT_HTTPD_PORT);
        assert!(c.address.is_none());
        assert!(!c.banned);
    }
}
