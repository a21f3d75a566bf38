//! The UVN root object. Exactly one exists per registry.

use crate::model::settings::UvnSettings;
use crate::versioned::{Revision, Versioned};
use serde::{Deserialize, Serialize};
use uvn_types::{Email, EntityName};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Uvn {
    /// Unique identifier; doubles as the CA organization name.
    pub name: EntityName,
    pub owner: Email,
    /// DNS name or IP used as the root VPN endpoint.
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub settings: UvnSettings,
    #[serde(default)]
    pub banned: bool,
    #[serde(default)]
    pub init_ts: String,
    #[serde(skip)]
    revision: Revision,
}

impl Uvn {
    pub fn new(name: EntityName, owner: Email, address: Option<String>, init_ts: String) -> Self {
        Self {
            name,
            owner,
            address,
            settings: UvnSettings::default(),
            banned: false,
            init_ts,
            revision: Revision::default(),
        }
    }
}

impl PartialEq for Uvn {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.owner == other.owner
            && self.address == other.address
            && self.settings == other.settings
            && self.banned == other.banned
    }
}

impl Eq for Uvn {}

impl Versioned for Uvn {
    fn revision(&self) -> &Revision {
        &self.revision
    }

    fn revision_mut(&mut self) -> &mut Revision {
        &mut self.revision
    }
}
