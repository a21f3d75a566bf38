//! The registry: single public API over the UVN model.
//!
//! On-disk layout under the registry root:
//!
//! ```text
//! registry.yaml (+ .sig)        uvn, id high-water marks, deployment ref
//! users.yaml, cells.yaml, particles.yaml (+ .sig)
//! vpn-keys.yaml (+ .sig)        root/particles WireGuard material
//! keys/                         KeysBackend database
//! deployments/<id>/             deployment.yaml, deployment.md, bundles
//! particles/                    particle bundles
//! .uno-auth-<target>            sidecar passphrases
//! .lock                         exclusive advisory lock
//! ```
//!
//! A registry is single-writer: every mutating operation takes the
//! advisory lock for its duration. There is no rollback; a failed
//! `generate_artifacts` leaves the tree dirty and the caller retries.

use crate::deploy::{Deployment, DeploymentStrategy, LinkKeyMap, PskMap, StrategyInput};
use crate::error::{RegistryError, Result};
use crate::model::{Cell, DeploymentSettings, Particle, User, Uvn, UvnSettings};
use crate::packager;
use crate::render::{DeploymentSummaryCtx, SummaryCellCtx, TemplateRenderer};
use crate::versioned::{Revision, Versioned};
use crate::wgkeys::VpnKeyStore;
use chrono::Utc;
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uvn_crypto::fsutil::{restrict_file, write_atomic};
use uvn_identity::{Key, KeyId, KeysBackend, KeysBackendConfig};
use uvn_network::{networks_overlap, P2pLinkAllocationMap};
use uvn_types::{Email, EntityName};

const REGISTRY_FILE: &str = "registry.yaml";
const USERS_FILE: &str = "users.yaml";
const CELLS_FILE: &str = "cells.yaml";
const PARTICLES_FILE: &str = "particles.yaml";
const VPN_KEYS_FILE: &str = "vpn-keys.yaml";
const DEPLOYMENT_FILE: &str = "deployment.yaml";
const DEPLOYMENT_SUMMARY_FILE: &str = "deployment.md";
const DEPLOYMENTS_DIR: &str = "deployments";
const PARTICLES_DIR: &str = "particles";
const LOCK_FILE: &str = ".lock";
const TS_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Optional fields for cell creation and update.
#[derive(Debug, Clone, Default)]
pub struct CellConfig {
    pub address: Option<String>,
    pub allowed_lans: Option<BTreeSet<Ipv4Network>>,
    pub enable_particles_vpn: Option<bool>,
    pub httpd_port: Option<u16>,
    pub location: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct RegistryState {
    uvn: Uvn,
    cell_id_high_water: u16,
    particle_id_high_water: u16,
    current_deployment: Option<String>,
}

pub struct Registry {
    root: PathBuf,
    uvn: Uvn,
    users: BTreeMap<Email, User>,
    cells: BTreeMap<EntityName, Cell>,
    particles: BTreeMap<EntityName, Particle>,
    cell_id_high_water: u16,
    particle_id_high_water: u16,
    vpn_keys: VpnKeyStore,
    deployment: Option<Deployment>,
    backend: KeysBackend,
    renderer: TemplateRenderer,
    revision: Revision,
}

impl Registry {
    /// Create a new registry rooted at `root`.
    ///
    /// Fails if the directory already holds one. Generates the owner user,
    /// the Uvn object, both CAs and the root key, and persists everything.
    pub fn create(
        name: &str,
        owner_email: &str,
        owner_name: Option<&str>,
        password: Option<&str>,
        address: Option<&str>,
        root: &Path,
        settings: UvnSettings,
    ) -> Result<Registry> {
        let name = EntityName::parse(name)?;
        let owner = Email::parse(owner_email)?;
        fs::create_dir_all(root)?;
        if root.join(REGISTRY_FILE).exists() {
            return Err(RegistryError::Validation(format!(
                "{} already contains a registry",
                root.display()
            )));
        }

        let now = Utc::now();
        let init_ts = now.format(TS_FORMAT).to_string();
        let mut user = User::new(owner.clone(), owner_name.map(str::to_string), init_ts.clone());
        if let Some(password) = password {
            user.set_password(password)?;
        }

        let mut uvn = Uvn::new(
            name.clone(),
            owner.clone(),
            address.map(str::to_string),
            init_ts.clone(),
        );
        uvn.settings = settings;
        Self::validate_vpn_subnets(&uvn.settings)?;

        let backend = KeysBackend::create(
            root,
            KeysBackendConfig {
                organization: name.to_string(),
                owner: owner.clone(),
                dds_domain: uvn.settings.dds_domain,
                enable_dds_security: uvn.settings.enable_dds_security,
                init_ts: now.timestamp(),
            },
        )?;
        backend.generate_key(&KeyId::root(owner.clone(), name.as_str()))?;

        let mut registry = Registry {
            root: root.to_path_buf(),
            uvn,
            users: BTreeMap::from([(owner, user)]),
            cells: BTreeMap::new(),
            particles: BTreeMap::new(),
            cell_id_high_water: 0,
            particle_id_high_water: 0,
            vpn_keys: VpnKeyStore::default(),
            deployment: None,
            backend,
            renderer: TemplateRenderer::new()?,
            revision: Revision::default(),
        };
        registry.revision.mark();
        registry.save()?;
        info!(uvn = %registry.uvn.name, root = %root.display(), "registry created");
        Ok(registry)
    }

    /// Load a registry from disk, verifying every signed state file.
    pub fn open(root: &Path) -> Result<Registry> {
        let backend = KeysBackend::open(root)?;
        let config = backend.config().clone();
        let root_key =
            backend.get_key(&KeyId::root(config.owner.clone(), config.organization.clone()))?;

        let state: RegistryState =
            serde_yaml::from_str(&Self::read_verified(&backend, &root_key, &root.join(REGISTRY_FILE))?)?;
        let users: BTreeMap<Email, User> =
            serde_yaml::from_str(&Self::read_verified(&backend, &root_key, &root.join(USERS_FILE))?)?;
        let cells: BTreeMap<EntityName, Cell> =
            serde_yaml::from_str(&Self::read_verified(&backend, &root_key, &root.join(CELLS_FILE))?)?;
        let particles: BTreeMap<EntityName, Particle> = serde_yaml::from_str(
            &Self::read_verified(&backend, &root_key, &root.join(PARTICLES_FILE))?,
        )?;
        let vpn_keys: VpnKeyStore = serde_yaml::from_str(&Self::read_verified(
            &backend,
            &root_key,
            &root.join(VPN_KEYS_FILE),
        )?)?;

        let deployment = match &state.current_deployment {
            None => None,
            Some(id) => {
                let path = root.join(DEPLOYMENTS_DIR).join(id).join(DEPLOYMENT_FILE);
                Some(serde_yaml::from_str(&Self::read_verified(
                    &backend, &root_key, &path,
                )?)?)
            }
        };

        debug!(uvn = %state.uvn.name, "registry opened");
        Ok(Registry {
            root: root.to_path_buf(),
            uvn: state.uvn,
            users,
            cells,
            particles,
            cell_id_high_water: state.cell_id_high_water,
            particle_id_high_water: state.particle_id_high_water,
            vpn_keys,
            deployment,
            backend,
            renderer: TemplateRenderer::new()?,
            revision: Revision::default(),
        })
    }

    fn read_verified(backend: &KeysBackend, root_key: &Key, path: &Path) -> Result<String> {
        let signature = packager::signature_path_for(path);
        backend
            .verify_signature(root_key, &signature, path)
            .map_err(RegistryError::from)?;
        Ok(fs::read_to_string(path)?)
    }

    // -- accessors ----------------------------------------------------------

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn uvn(&self) -> &Uvn {
        &self.uvn
    }

    pub fn backend(&self) -> &KeysBackend {
        &self.backend
    }

    pub fn users(&self) -> &BTreeMap<Email, User> {
        &self.users
    }

    pub fn cells(&self) -> &BTreeMap<EntityName, Cell> {
        &self.cells
    }

    pub fn particles(&self) -> &BTreeMap<EntityName, Particle> {
        &self.particles
    }

    pub fn deployment(&self) -> Option<&Deployment> {
        self.deployment.as_ref()
    }

    pub fn vpn_keys(&self) -> &VpnKeyStore {
        &self.vpn_keys
    }

    pub fn cell(&self, name: &str) -> Result<&Cell> {
        let name = EntityName::parse(name)?;
        self.cells
            .get(&name)
            .ok_or_else(|| RegistryError::Validation(format!("no such cell: {}", name)))
    }

    pub fn particle(&self, name: &str) -> Result<&Particle> {
        let name = EntityName::parse(name)?;
        self.particles
            .get(&name)
            .ok_or_else(|| RegistryError::Validation(format!("no such particle: {}", name)))
    }

    fn root_key(&self) -> Result<Key> {
        Ok(self.backend.get_key(&KeyId::root(
            self.uvn.owner.clone(),
            self.uvn.name.as_str(),
        ))?)
    }

    /// Cells participating in the next deployment.
    pub fn active_cells(&self) -> Vec<&Cell> {
        if self.uvn.banned {
            return Vec::new();
        }
        self.cells
            .values()
            .filter(|c| !c.banned && !self.owner_banned(&c.owner))
            .collect()
    }

    pub fn active_particles(&self) -> Vec<&Particle> {
        if self.uvn.banned {
            return Vec::new();
        }
        self.particles
            .values()
            .filter(|p| !p.banned && !self.owner_banned(&p.owner))
            .collect()
    }

    fn owner_banned(&self, owner: &Email) -> bool {
        self.users.get(owner).map(|u| u.banned).unwrap_or(false)
    }

    pub fn is_dirty(&self) -> bool {
        self.revision.dirty
            || self.uvn.is_dirty()
            || self.users.values().any(|u| u.is_dirty())
            || self.cells.values().any(|c| c.is_dirty())
            || self.particles.values().any(|p| p.is_dirty())
    }

    // -- user operations ----------------------------------------------------

    pub fn add_user(
        &mut self,
        email: &str,
        name: Option<&str>,
        password: Option<&str>,
    ) -> Result<&User> {
        let _lock = self.acquire_lock()?;
        let email = Email::parse(email)?;
        if self.users.contains_key(&email) {
            return Err(RegistryError::Validation(format!(
                "user already exists: {}",
                email
            )));
        }
        let mut user = User::new(
            email.clone(),
            name.map(str::to_string),
            Utc::now().format(TS_FORMAT).to_string(),
        );
        if let Some(password) = password {
            user.set_password(password)?;
        }
        self.users.insert(email.clone(), user);
        self.revision.mark();
        info!(user = %email, "user added");
        Ok(&self.users[&email])
    }

    pub fn update_user(
        &mut self,
        email: &str,
        name: Option<&str>,
        password: Option<&str>,
    ) -> Result<()> {
        let _lock = self.acquire_lock()?;
        let email = Email::parse(email)?;
        let user = self
            .users
            .get_mut(&email)
            .ok_or_else(|| RegistryError::Validation(format!("no such user: {}", email)))?;
        let mut changed = false;
        if let Some(name) = name {
            changed |= user.set_name(Some(name.to_string()));
        }
        if let Some(password) = password {
            user.set_password(password)?;
            changed = true;
        }
        if changed {
            self.revision.mark();
        }
        Ok(())
    }

    /// Delete a user. Refused while they still own cells or particles.
    pub fn delete_user(&mut self, email: &str) -> Result<()> {
        let _lock = self.acquire_lock()?;
        let email = Email::parse(email)?;
        if self.uvn.owner == email {
            return Err(RegistryError::Validation(
                "cannot delete the registry owner".to_string(),
            ));
        }
        let owned_cells: Vec<_> = self
            .cells
            .values()
            .filter(|c| c.owner == email)
            .map(|c| c.name.to_string())
            .collect();
        let owned_particles: Vec<_> = self
            .particles
            .values()
            .filter(|p| p.owner == email)
            .map(|p| p.name.to_string())
            .collect();
        if !owned_cells.is_empty() || !owned_particles.is_empty() {
            return Err(RegistryError::Validation(format!(
                "user {} still owns cells [{}] and particles [{}]",
                email,
                owned_cells.join(", "),
                owned_particles.join(", ")
            )));
        }
        if self.users.remove(&email).is_none() {
            return Err(RegistryError::Validation(format!("no such user: {}", email)));
        }
        self.revision.mark();
        info!(user = %email, "user deleted");
        Ok(())
    }

    // -- cell operations ----------------------------------------------------

    pub fn add_cell(&mut self, name: &str, owner: &str, config: CellConfig) -> Result<&Cell> {
        let _lock = self.acquire_lock()?;
        let name = EntityName::parse(name)?;
        let owner = Email::parse(owner)?;
        if self.cells.contains_key(&name) {
            return Err(RegistryError::Validation(format!(
                "cell already exists: {}",
                name
            )));
        }
        if !self.users.contains_key(&owner) {
            return Err(RegistryError::Validation(format!("no such user: {}", owner)));
        }
        if let Some(lans) = &config.allowed_lans {
            self.validate_lans(&name, lans)?;
        }

        let id = self.cell_id_high_water + 1;
        let mut cell = Cell::new(
            id,
            name.clone(),
            owner.clone(),
            Utc::now().format(TS_FORMAT).to_string(),
        );
        apply_cell_config(&mut cell, config);

        self.backend
            .generate_key(&KeyId::cell(owner, name.as_str()))?;
        self.cell_id_high_water = id;
        self.cells.insert(name.clone(), cell);
        self.revision.mark();
        info!(cell = %name, id, "cell added");
        Ok(&self.cells[&name])
    }

    pub fn update_cell(&mut self, name: &str, config: CellConfig) -> Result<()> {
        let _lock = self.acquire_lock()?;
        let name = EntityName::parse(name)?;
        if let Some(lans) = &config.allowed_lans {
            self.validate_lans(&name, lans)?;
        }
        let cell = self
            .cells
            .get_mut(&name)
            .ok_or_else(|| RegistryError::Validation(format!("no such cell: {}", name)))?;
        let mut changed = false;
        if let Some(address) = config.address {
            changed |= cell.set_address(Some(address));
        }
        if let Some(lans) = config.allowed_lans {
            changed |= cell.set_allowed_lans(lans);
        }
        if let Some(flag) = config.enable_particles_vpn {
            changed |= cell.set_enable_particles_vpn(flag);
        }
        if let Some(port) = config.httpd_port {
            changed |= cell.set_httpd_port(port);
        }
        if let Some(location) = config.location {
            changed |= cell.set_location(Some(location));
        }
        if changed {
            self.revision.mark();
        }
        Ok(())
    }

    /// Delete a cell. Its stable id is never reused.
    pub fn delete_cell(&mut self, name: &str) -> Result<()> {
        let _lock = self.acquire_lock()?;
        let name = EntityName::parse(name)?;
        let cell = self
            .cells
            .remove(&name)
            .ok_or_else(|| RegistryError::Validation(format!("no such cell: {}", name)))?;
        if let Ok(key) = self
            .backend
            .get_key(&KeyId::cell(cell.owner.clone(), name.as_str()))
        {
            self.backend.drop_key(&key)?;
        }
        let cell_ids: Vec<u16> = self.cells.values().map(|c| c.id).collect();
        let particle_ids: Vec<u16> = self.particles.values().map(|p| p.id).collect();
        self.vpn_keys.retain(&cell_ids, &particle_ids);
        self.revision.mark();
        info!(cell = %name, "cell deleted");
        Ok(())
    }

    // -- particle operations ------------------------------------------------

    pub fn add_particle(&mut self, name: &str, owner: &str) -> Result<&Particle> {
        let _lock = self.acquire_lock()?;
        let name = EntityName::parse(name)?;
        let owner = Email::parse(owner)?;
        if self.particles.contains_key(&name) {
            return Err(RegistryError::Validation(format!(
                "particle already exists: {}",
                name
            )));
        }
        if !self.users.contains_key(&owner) {
            return Err(RegistryError::Validation(format!("no such user: {}", owner)));
        }
        let id = self.particle_id_high_water + 1;
        let particle = Particle::new(
            id,
            name.clone(),
            owner.clone(),
            Utc::now().format(TS_FORMAT).to_string(),
        );
        self.backend
            .generate_key(&KeyId::particle(owner, name.as_str()))?;
        self.particle_id_high_water = id;
        self.particles.insert(name.clone(), particle);
        self.revision.mark();
        info!(particle = %name, id, "particle added");
        Ok(&self.particles[&name])
    }

    pub fn delete_particle(&mut self, name: &str) -> Result<()> {
        let _lock = self.acquire_lock()?;
        let name = EntityName::parse(name)?;
        let particle = self
            .particles
            .remove(&name)
            .ok_or_else(|| RegistryError::Validation(format!("no such particle: {}", name)))?;
        if let Ok(key) = self
            .backend
            .get_key(&KeyId::particle(particle.owner.clone(), name.as_str()))
        {
            self.backend.drop_key(&key)?;
        }
        let cell_ids: Vec<u16> = self.cells.values().map(|c| c.id).collect();
        let particle_ids: Vec<u16> = self.particles.values().map(|p| p.id).collect();
        self.vpn_keys.retain(&cell_ids, &particle_ids);
        self.revision.mark();
        info!(particle = %name, "particle deleted");
        Ok(())
    }

    /// Transfer a particle to a new owner.
    pub fn update_particle(&mut self, name: &str, owner: &str) -> Result<()> {
        let _lock = self.acquire_lock()?;
        let name = EntityName::parse(name)?;
        let owner = Email::parse(owner)?;
        if !self.users.contains_key(&owner) {
            return Err(RegistryError::Validation(format!("no such user: {}", owner)));
        }
        let particle = self
            .particles
            .get_mut(&name)
            .ok_or_else(|| RegistryError::Validation(format!("no such particle: {}", name)))?;
        if particle.owner == owner {
            return Ok(());
        }
        let previous = particle.owner.clone();
        particle.owner = owner.clone();
        particle.mark_dirty();
        // The key triple embeds the owner, so ownership transfer reissues it.
        if let Ok(key) = self
            .backend
            .get_key(&KeyId::particle(previous, name.as_str()))
        {
            self.backend.drop_key(&key)?;
        }
        self.backend
            .generate_key(&KeyId::particle(owner, name.as_str()))?;
        self.revision.mark();
        Ok(())
    }

    // -- uvn operations -------------------------------------------------------

    /// Update the UVN's public address and/or settings tree.
    pub fn update_uvn(&mut self, address: Option<&str>, settings: Option<UvnSettings>) -> Result<()> {
        let _lock = self.acquire_lock()?;
        let mut changed = false;
        if let Some(address) = address {
            if self.uvn.address.as_deref() != Some(address) {
                self.uvn.address = Some(address.to_string());
                changed = true;
            }
        }
        if let Some(settings) = settings {
            Self::validate_vpn_subnets(&settings)?;
            for cell in self.cells.values() {
                for lan in &cell.allowed_lans {
                    for subnet in settings.vpn_subnets() {
                        if networks_overlap(*lan, subnet) {
                            return Err(RegistryError::Validation(format!(
                                "LAN {} of cell {} overlaps VPN subnet {}",
                                lan, cell.name, subnet
                            )));
                        }
                    }
                }
            }
            if self.uvn.settings != settings {
                self.uvn.settings = settings;
                changed = true;
            }
        }
        if changed {
            self.uvn.mark_dirty();
            self.revision.mark();
        }
        Ok(())
    }

    // -- ban ----------------------------------------------------------------

    /// Ban or unban entities by name or email. Key material is untouched;
    /// a ban only excludes the entity from the next deployment.
    pub fn ban(&mut self, entities: &[&str], banned: bool) -> Result<()> {
        let _lock = self.acquire_lock()?;
        for entity in entities {
            let mut found = false;
            if let Ok(name) = EntityName::parse(entity) {
                if let Some(cell) = self.cells.get_mut(&name) {
                    if cell.set_banned(banned) {
                        self.revision.mark();
                    }
                    found = true;
                }
                if let Some(particle) = self.particles.get_mut(&name) {
                    if particle.set_banned(banned) {
                        self.revision.mark();
                    }
                    found = true;
                }
            }
            if let Ok(email) = Email::parse(entity) {
                if let Some(user) = self.users.get_mut(&email) {
                    if user.set_banned(banned) {
                        self.revision.mark();
                    }
                    found = true;
                }
            }
            if !found {
                return Err(RegistryError::Validation(format!(
                    "no such entity: {}",
                    entity
                )));
            }
            info!(entity, banned, "ban flag updated");
        }
        Ok(())
    }

    // -- rekey ---------------------------------------------------------------

    /// Regenerate UVN-level VPN key material.
    pub fn rekey_uvn(&mut self, root_vpn: bool, particles_vpn: bool) -> Result<()> {
        let _lock = self.acquire_lock()?;
        self.ensure_vpn_keys();
        if root_vpn {
            self.vpn_keys.rekey_root_vpn();
        }
        if particles_vpn {
            self.vpn_keys.rekey_particles_vpn();
        }
        if root_vpn || particles_vpn {
            self.revision.mark();
        }
        Ok(())
    }

    /// Regenerate one cell's key material: its identity key, the selected
    /// VPN families, and (when deployed) its backbone link keys plus the
    /// preshared keys of its links. No other cell's identity changes.
    pub fn rekey_cell(&mut self, name: &str, root_vpn: bool, particles_vpn: bool) -> Result<()> {
        let _lock = self.acquire_lock()?;
        let name = EntityName::parse(name)?;
        let (id, owner) = {
            let cell = self
                .cells
                .get(&name)
                .ok_or_else(|| RegistryError::Validation(format!("no such cell: {}", name)))?;
            (cell.id, cell.owner.clone())
        };
        self.ensure_vpn_keys();

        self.backend.generate_key(&KeyId::cell(owner, name.as_str()))?;
        if root_vpn {
            self.vpn_keys.rekey_root_cell(id);
        }
        if particles_vpn {
            self.vpn_keys.rekey_particles_server(id);
        }
        if let Some(deployment) = &mut self.deployment {
            deployment.link_keys.rekey_endpoint(id);
            for pair in deployment.link_keys.pairs_touching(id) {
                deployment.psks.set(
                    pair.low(),
                    pair.high(),
                    uvn_crypto::PresharedKey::generate().to_base64(),
                );
            }
        }
        self.revision.mark();
        info!(cell = %name, "cell rekeyed");
        Ok(())
    }

    /// Regenerate a particle's key material, optionally only for some cells.
    pub fn rekey_particle(&mut self, name: &str, cells: Option<&[&str]>) -> Result<()> {
        let _lock = self.acquire_lock()?;
        let name = EntityName::parse(name)?;
        let (id, owner) = {
            let particle = self
                .particles
                .get(&name)
                .ok_or_else(|| RegistryError::Validation(format!("no such particle: {}", name)))?;
            (particle.id, particle.owner.clone())
        };
        self.ensure_vpn_keys();

        let cell_ids = match cells {
            None => None,
            Some(names) => {
                let mut ids = Vec::new();
                for cell_name in names {
                    ids.push(self.cell(cell_name)?.id);
                }
                Some(ids)
            }
        };
        self.backend
            .generate_key(&KeyId::particle(owner, name.as_str()))?;
        self.vpn_keys.rekey_particle(id, cell_ids.as_deref());
        self.revision.mark();
        info!(particle = %name, "particle rekeyed");
        Ok(())
    }

    // -- deployment ----------------------------------------------------------

    /// Recompute the backbone from scratch, optionally reconfiguring the
    /// deployment settings first.
    ///
    /// The previous link allocation map is dropped, so addresses are
    /// allocated fresh; earlier deployments stay archived on disk.
    pub fn redeploy(&mut self, settings: Option<DeploymentSettings>) -> Result<&Deployment> {
        let _lock = self.acquire_lock()?;
        if let Some(settings) = settings {
            if self.uvn.settings.deployment != settings {
                self.uvn.settings.deployment = settings;
                self.uvn.mark_dirty();
            }
        }
        let registry_reachable = self.uvn.address.is_some();
        let active = self.active_cells();
        let peers: BTreeSet<u16> = active.iter().map(|c| c.id).collect();
        let private: BTreeSet<u16> = active
            .iter()
            .filter(|c| !c.is_public(registry_reachable))
            .map(|c| c.id)
            .collect();

        let settings = &self.uvn.settings.deployment;
        let mut allocations = P2pLinkAllocationMap::new(self.uvn.settings.backbone_vpn.subnet);
        let mut strategy = DeploymentStrategy::new(settings.strategy);
        let map = strategy.deploy(
            StrategyInput {
                peers: &peers,
                private_peers: &private,
                args: &settings.strategy_args,
            },
            &mut allocations,
        )?;

        let mut psks = PskMap::new();
        let mut link_keys = LinkKeyMap::new();
        for pair in map.edges() {
            psks.assert_psk(pair.low(), pair.high());
            link_keys.assert_pair(pair.low(), pair.high());
        }

        let now = Utc::now();
        let mut id = now.format("%Y%m%d-%H%M%S").to_string();
        while self.root.join(DEPLOYMENTS_DIR).join(&id).exists() {
            id.push('x');
        }

        let deployment = Deployment {
            id,
            strategy: settings.strategy,
            generated: now.format(TS_FORMAT).to_string(),
            cells: peers.iter().copied().collect(),
            map,
            psks,
            link_keys,
            allocations,
        };
        info!(
            deployment = %deployment.id,
            links = deployment.map.link_count(),
            "backbone deployed"
        );
        self.deployment = Some(deployment);
        self.revision.mark();
        Ok(self.deployment.as_ref().ok_or_else(|| {
            RegistryError::Deployment("deployment vanished after redeploy".to_string())
        })?)
    }

    // -- artifact generation -------------------------------------------------

    /// Regenerate on-disk artifacts for everything dirty.
    ///
    /// Processing order is fixed: settings, users, cells by ascending id,
    /// particles by ascending id, the deployment map, then the packager.
    /// Returns whether anything changed.
    pub fn generate_artifacts(&mut self, force: bool) -> Result<bool> {
        if !force && !self.is_dirty() {
            return Ok(false);
        }
        let _lock = self.acquire_lock()?;

        self.ensure_vpn_keys();
        self.save()?;

        if let Some(deployment) = &self.deployment {
            let active_ids: BTreeSet<u16> = self.active_cells().iter().map(|c| c.id).collect();
            if deployment.is_stale(&active_ids) {
                warn!(
                    deployment = %deployment.id,
                    "deployment is stale for the current cell set; redeploy to rebuild the backbone"
                );
            }
            let deployment_dir = self.root.join(DEPLOYMENTS_DIR).join(&deployment.id);
            fs::create_dir_all(&deployment_dir)?;
            self.write_signed(
                &deployment_dir.join(DEPLOYMENT_FILE),
                &serde_yaml::to_string(deployment)?,
            )?;
            let summary = self.deployment_summary(deployment)?;
            write_atomic(
                &deployment_dir.join(DEPLOYMENT_SUMMARY_FILE),
                summary.as_bytes(),
            )
            .map_err(|e| RegistryError::crypto("deployment summary write", e))?;

            let root_key = self.root_key()?;
            let ctx = packager::PackagerCtx {
                uvn: &self.uvn,
                cells: &self.cells,
                particles: &self.particles,
                vpn_keys: &self.vpn_keys,
                deployment,
                backend: &self.backend,
                renderer: &self.renderer,
                root_key: &root_key,
            };

            let mut expected = Vec::new();
            let mut active = self.active_cells();
            active.sort_by_key(|c| c.id);
            for cell in active {
                expected.push(packager::build_cell_bundle(&ctx, cell, &deployment_dir)?);
            }
            packager::gc_stale_archives(&deployment_dir, &expected)?;

            let particles_dir = self.root.join(PARTICLES_DIR);
            let mut expected_particles = Vec::new();
            let mut active_particles = self.active_particles();
            active_particles.sort_by_key(|p| p.id);
            for particle in active_particles {
                expected_particles.push(packager::build_particle_bundle(
                    &ctx,
                    particle,
                    &particles_dir,
                )?);
            }
            packager::gc_stale_archives(&particles_dir, &expected_particles)?;
        }

        self.uvn.clear_dirty();
        for user in self.users.values_mut() {
            user.clear_dirty();
        }
        for cell in self.cells.values_mut() {
            cell.clear_dirty();
        }
        for particle in self.particles.values_mut() {
            particle.clear_dirty();
        }
        self.revision.clear();
        info!(uvn = %self.uvn.name, "artifacts generated");
        Ok(true)
    }

    fn deployment_summary(&self, deployment: &Deployment) -> Result<String> {
        let mut cells = Vec::new();
        let mut sorted: Vec<&Cell> = self.cells.values().collect();
        sorted.sort_by_key(|c| c.id);
        for cell in sorted {
            let Some(entry) = deployment.peer_entry(cell.id) else {
                continue;
            };
            let links = entry
                .peers
                .iter()
                .map(|(peer_id, link)| {
                    let peer_name = self
                        .cells
                        .values()
                        .find(|c| c.id == *peer_id)
                        .map(|c| c.name.to_string())
                        .unwrap_or_else(|| peer_id.to_string());
                    format!("{} ({})", peer_name, link.network)
                })
                .collect();
            cells.push(SummaryCellCtx {
                name: cell.name.to_string(),
                id: cell.id,
                links,
            });
        }
        let ctx = DeploymentSummaryCtx {
            uvn: self.uvn.name.to_string(),
            deployment_id: deployment.id.clone(),
            strategy: deployment.strategy.to_string(),
            generated: deployment.generated.clone(),
            link_count: deployment.map.link_count(),
            cells,
        };
        self.renderer.render("deployment.md", &ctx)
    }

    // -- persistence ---------------------------------------------------------

    fn save(&self) -> Result<()> {
        let state = RegistryState {
            uvn: self.uvn.clone(),
            cell_id_high_water: self.cell_id_high_water,
            particle_id_high_water: self.particle_id_high_water,
            current_deployment: self.deployment.as_ref().map(|d| d.id.clone()),
        };
        self.write_signed(&self.root.join(REGISTRY_FILE), &serde_yaml::to_string(&state)?)?;
        self.write_signed(&self.root.join(USERS_FILE), &serde_yaml::to_string(&self.users)?)?;
        self.write_signed(&self.root.join(CELLS_FILE), &serde_yaml::to_string(&self.cells)?)?;
        self.write_signed(
            &self.root.join(PARTICLES_FILE),
            &serde_yaml::to_string(&self.particles)?,
        )?;
        let vpn_keys_path = self.root.join(VPN_KEYS_FILE);
        self.write_signed(&vpn_keys_path, &serde_yaml::to_string(&self.vpn_keys)?)?;
        restrict_file(&vpn_keys_path).map_err(|e| RegistryError::crypto("chmod", e))?;
        Ok(())
    }

    fn write_signed(&self, path: &Path, content: &str) -> Result<()> {
        write_atomic(path, content.as_bytes())
            .map_err(|e| RegistryError::crypto("state write", e))?;
        let root_key = self.root_key()?;
        self.backend
            .sign_file(&root_key, path, &packager::signature_path_for(path))?;
        Ok(())
    }

    fn ensure_vpn_keys(&mut self) {
        let cell_ids: Vec<u16> = self.cells.values().map(|c| c.id).collect();
        let particle_ids: Vec<u16> = self.particles.values().map(|p| p.id).collect();
        if self.vpn_keys.ensure(&cell_ids, &particle_ids) {
            self.revision.mark();
        }
    }

    // -- validation ----------------------------------------------------------

    fn validate_vpn_subnets(settings: &UvnSettings) -> Result<()> {
        let subnets = settings.vpn_subnets();
        for (i, a) in subnets.iter().enumerate() {
            for b in subnets.iter().skip(i + 1) {
                if networks_overlap(*a, *b) {
                    return Err(RegistryError::Validation(format!(
                        "VPN subnets overlap: {} and {}",
                        a, b
                    )));
                }
            }
        }
        Ok(())
    }

    /// Cell LANs must be disjoint from every other cell's LANs and from
    /// every VPN subnet: the UVN routes a union of disjoint networks.
    fn validate_lans(&self, cell_name: &EntityName, lans: &BTreeSet<Ipv4Network>) -> Result<()> {
        for lan in lans {
            for subnet in self.uvn.settings.vpn_subnets() {
                if networks_overlap(*lan, subnet) {
                    return Err(RegistryError::Validation(format!(
                        "LAN {} overlaps VPN subnet {}",
                        lan, subnet
                    )));
                }
            }
            for other in self.cells.values() {
                if other.name == *cell_name {
                    continue;
                }
                for other_lan in &other.allowed_lans {
                    if networks_overlap(*lan, *other_lan) {
                        return Err(RegistryError::Validation(format!(
                            "LAN {} overlaps {} attached to cell {}",
                            lan, other_lan, other.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn acquire_lock(&self) -> Result<LockGuard> {
        LockGuard::acquire(&self.root.join(LOCK_FILE))
    }
}

fn apply_cell_config(cell: &mut Cell, config: CellConfig) {
    if let Some(address) = config.address {
        cell.address = Some(address);
    }
    if let Some(lans) = config.allowed_lans {
        cell.allowed_lans = lans;
    }
    if let Some(flag) = config.enable_particles_vpn {
        cell.enable_particles_vpn = flag;
    }
    if let Some(port) = config.httpd_port {
        cell.httpd_port = port;
    }
    if let Some(location) = config.location {
        cell.location = Some(location);
    }
}

/// Exclusive advisory lock: a `.lock` file created with `create_new`,
/// removed on drop.
struct LockGuard {
    path: PathBuf,
}

impl LockGuard {
    fn acquire(path: &Path) -> Result<LockGuard> {
        match fs::OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(_) => Ok(LockGuard {
                path: path.to_path_buf(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(RegistryError::Io(std::io::Error::new(
                    std::io::ErrorKind::WouldBlock,
                    format!("registry is locked ({})", path.display()),
                )))
            }
            Err(e) => Err(RegistryError::Io(e)),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
