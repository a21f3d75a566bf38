//! Particles: roaming single-node clients of the UVN.

use crate::versioned::{Revision, Versioned};
use serde::{Deserialize, Serialize};
use uvn_types::{Email, EntityName};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Particle {
    pub id: u16,
    pub name: EntityName,
    pub owner: Email,
    #[serde(default)]
    pub banned: bool,
    #[serde(default)]
    pub init_ts: String,
    #[serde(skip)]
    revision: Revision,
}

impl Particle {
    pub fn new(id: u16, name: EntityName, owner: Email, init_ts: String) -> Self {
        Self {
            id,
            name,
            owner,
            banned: false,
            init_ts,
            revision: Revision::default(),
        }
    }

    pub fn set_banned(&mut self, banned: bool) -> bool {
        crate::versioned::set_field(&mut self.revision, &mut self.banned, banned)
    }
}

impl PartialEq for Particle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.name == other.name
            && self.owner == other.owner
            && self.banned == other.banned
    }
}

impl Eq for Particle {}

impl Versioned for Particle {
    fn revision(&self) -> &Revision {
        &self.revision
    }

    fn revision_mut(&mut self) -> &mut Revision {
        &mut self.revision
    }
}
