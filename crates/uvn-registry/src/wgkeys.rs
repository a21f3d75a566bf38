//! WireGuard key material for the root and particles VPN families.
//!
//! Backbone link keys live with the deployment (they are rebuilt on every
//! redeploy); the keys here persist across deployments and only change on
//! explicit rekey.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uvn_crypto::{PresharedKey, WgKeyPair};

/// One endpoint's WireGuard key pair, base64-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WgEndpointKeys {
    pub public_key: String,
    pub private_key: String,
}

impl WgEndpointKeys {
    pub fn generate() -> Self {
        let pair = WgKeyPair::generate();
        Self {
            public_key: pair.public_key_base64(),
            private_key: pair.private_key_base64(),
        }
    }

    pub fn redacted(&self) -> Self {
        Self {
            public_key: self.public_key.clone(),
            private_key: String::new(),
        }
    }
}

/// A particle's keys for one admitting cell, plus the link's preshared key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticleLinkKeys {
    pub keys: WgEndpointKeys,
    pub psk: String,
}

impl ParticleLinkKeys {
    pub fn generate() -> Self {
        Self {
            keys: WgEndpointKeys::generate(),
            psk: PresharedKey::generate().to_base64(),
        }
    }
}

/// Persistent key store for the root and particles families.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VpnKeyStore {
    pub root_server: Option<WgEndpointKeys>,
    /// Root VPN client keys, by cell id.
    pub root_cells: BTreeMap<u16, WgEndpointKeys>,
    /// Particles VPN server keys, by cell id.
    pub particles_servers: BTreeMap<u16, WgEndpointKeys>,
    /// Particle client keys, by (particle id, cell id).
    pub particles: BTreeMap<(u16, u16), ParticleLinkKeys>,
}

impl VpnKeyStore {
    /// Fill in any missing material for the given cell/particle id sets.
    /// Existing keys are never touched; returns whether anything was added.
    pub fn ensure(&mut self, cell_ids: &[u16], particle_ids: &[u16]) -> bool {
        let mut changed = false;
        if self.root_server.is_none() {
            self.root_server = Some(WgEndpointKeys::generate());
            changed = true;
        }
        for id in cell_ids {
            changed |= ensure_entry(&mut self.root_cells, *id);
            changed |= ensure_entry(&mut self.particles_servers, *id);
            for particle in particle_ids {
                if !self.particles.contains_key(&(*particle, *id)) {
                    self.particles
                        .insert((*particle, *id), ParticleLinkKeys::generate());
                    changed = true;
                }
            }
        }
        changed
    }

    pub fn rekey_root_server(&mut self) {
        self.root_server = Some(WgEndpointKeys::generate());
    }

    pub fn rekey_root_cell(&mut self, cell_id: u16) {
        self.root_cells.insert(cell_id, WgEndpointKeys::generate());
    }

    /// Roll the whole root VPN: the server and every cell client.
    pub fn rekey_root_vpn(&mut self) {
        self.rekey_root_server();
        for keys in self.root_cells.values_mut() {
            *keys = WgEndpointKeys::generate();
        }
    }

    pub fn rekey_particles_server(&mut self, cell_id: u16) {
        self.particles_servers
            .insert(cell_id, WgEndpointKeys::generate());
        for ((_, cell), link) in self.particles.iter_mut() {
            if *cell == cell_id {
                *link = ParticleLinkKeys::generate();
            }
        }
    }

    /// Roll the whole particles VPN: every server and every particle link.
    pub fn rekey_particles_vpn(&mut self) {
        for keys in self.particles_servers.values_mut() {
            *keys = WgEndpointKeys::generate();
        }
        for link in self.particles.values_mut() {
            *link = ParticleLinkKeys::generate();
        }
    }

    /// Roll one particle's keys, optionally restricted to some cells.
    pub fn rekey_particle(&mut self, particle_id: u16, cells: Option<&[u16]>) {
        for ((particle, cell), link) in self.particles.iter_mut() {
            if *particle != particle_id {
                continue;
            }
            if let Some(filter) = cells {
                if !filter.contains(cell) {
                    continue;
                }
            }
            *link = ParticleLinkKeys::generate();
        }
    }

    /// Drop material for entities that no longer exist.
    pub fn retain(&mut self, cell_ids: &[u16], particle_ids: &[u16]) {
        self.root_cells.retain(|id, _| cell_ids.contains(id));
        self.particles_servers.retain(|id, _| cell_ids.contains(id));
        self.particles
            .retain(|(p, c), _| particle_ids.contains(p) && cell_ids.contains(c));
    }

    /// Serialized view with private halves elided.
    pub fn public_view(&self) -> Self {
        Self {
            root_server: self.root_server.as_ref().map(WgEndpointKeys::redacted),
            root_cells: self
                .root_cells
                .iter()
                .map(|(id, k)| (*id, k.redacted()))
                .collect(),
            particles_servers: self
                .particles_servers
                .iter()
                .map(|(id, k)| (*id, k.redacted()))
                .collect(),
            particles: self
                .particles
                .iter()
                .map(|(key, link)| {
                    (
                        *key,
                        ParticleLinkKeys {
                            keys: link.keys.redacted(),
                            psk: String::new(),
                        },
                    )
                })
                .collect(),
        }
    }
}

fn ensure_entry(map: &mut BTreeMap<u16, WgEndpointKeys>, id: u16) -> bool {
    if map.contains_key(&id) {
        return false;
    }
    map.insert(id, WgEndpointKeys::generate());
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_is_idempotent() {
        let mut store = VpnKeyStore::default();
        assert!(store.ensure(&[1, 2], &[1]));
        let snapshot = store.clone();
        assert!(!store.ensure(&[1, 2], &[1]));
        assert_eq!(store, snapshot);
    }

    #[test]
    fn test_rekey_root_cell_is_local() {
        let mut store = VpnKeyStore::default();
        store.ensure(&[1, 2], &[]);
        let west_before = store.root_cells[&2].clone();
        let server_before = store.root_server.clone();
        store.rekey_root_cell(1);
        assert_eq!(store.root_cells[&2], west_before);
        assert_eq!(store.root_server, server_before);
    }

    #[test]
    fn test_rekey_particle_scoped_to_cells() {
        let mut store = VpnKeyStore::default();
        store.ensure(&[1, 2], &[1]);
        let east_link = store.particles[&(1, 1)].clone();
        let west_link = store.particles[&(1, 2)].clone();
        store.rekey_particle(1, Some(&[1]));
        assert_ne!(store.particles[&(1, 1)], east_link);
        assert_eq!(store.particles[&(1, 2)], west_link);
    }

    #[test]
    fn test_retain_drops_stale_entries() {
        let mut store = VpnKeyStore::default();
        store.ensure(&[1, 2], &[1]);
        store.retain(&[1], &[1]);
        assert!(store.root_cells.contains_key(&1));
        assert!(!store.root_cells.contains_key(&2));
        assert!(!store.particles.contains_key(&(1, 2)));
    }

    #[test]
    fn test_public_view_has_no_private_keys() {
        let mut store = VpnKeyStore::default();
        store.ensure(&[1], &[1]);
        let yaml = serde_yaml::to_string(&store.public_view()).unwrap();
        for (_, link) in store.particles.iter() {
            assert!(!yaml.contains(&link.psk));
        }
        assert!(!yaml.contains(&store.root_cells[&1].private_key));
    }
}
