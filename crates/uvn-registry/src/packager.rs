//! Bundle assembly: per-cell and per-particle deployment packages.
//!
//! A cell bundle is a gzip'd tar holding the cell's key material, the CA
//! records, the governance document and every rendered configuration file,
//! listed in a fingerprinted manifest. The clear tarball is signed with
//! the registry identity key (detached), then sealed to the cell's
//! encryption key:
//!
//! `deployments/<deployment-id>/<cell>.tar.gz.enc` + `.tar.gz.enc.sig`
//!
//! Particle bundles carry one WireGuard client config (plus an SVG QR) per
//! admitting cell and live under `particles/`.

use crate::deploy::Deployment;
use crate::error::{RegistryError, Result};
use crate::model::{Cell, Particle, Uvn};
use crate::render::{
    OspfCtx, OspfNetworkCtx, TemplateRenderer, WgConfigCtx, WgInterfaceCtx, WgPeerCtx, ZebraCtx,
};
use crate::wgkeys::VpnKeyStore;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uvn_identity::{topic_grants, Key, KeysBackend, KeyType};
use uvn_network::{peer_port, ParticlesVpnPlan, RootVpnPlan};
use uvn_types::EntityName;

pub const MANIFEST_FILE: &str = "manifest.yaml";

/// Everything the packager needs from the registry, borrowed for one run.
pub struct PackagerCtx<'a> {
    pub uvn: &'a Uvn,
    pub cells: &'a BTreeMap<EntityName, Cell>,
    pub particles: &'a BTreeMap<EntityName, Particle>,
    pub vpn_keys: &'a VpnKeyStore,
    pub deployment: &'a Deployment,
    pub backend: &'a KeysBackend,
    pub renderer: &'a TemplateRenderer,
    pub root_key: &'a Key,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub path: String,
    pub sha256: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleManifest {
    pub uvn: String,
    pub deployment_id: String,
    pub target: String,
    pub generated: String,
    pub files: Vec<ManifestEntry>,
}

impl PackagerCtx<'_> {
    fn root_plan(&self) -> RootVpnPlan {
        RootVpnPlan::new(self.uvn.settings.root_vpn.subnet)
    }

    fn particles_plan(&self) -> Result<ParticlesVpnPlan> {
        let settings = &self.uvn.settings.particles_vpn;
        Ok(ParticlesVpnPlan::new(
            settings.subnet,
            settings
                .slice_prefix
                .unwrap_or(ParticlesVpnPlan::DEFAULT_SLICE_PREFIX),
        )?)
    }

    fn cell_by_id(&self, id: u16) -> Option<&Cell> {
        self.cells.values().find(|c| c.id == id)
    }

    fn active_particles(&self, cell: &Cell) -> Vec<&Particle> {
        if !self.uvn.settings.enable_particles_vpn || !cell.enable_particles_vpn {
            return Vec::new();
        }
        self.particles.values().filter(|p| !p.banned).collect()
    }
}

/// Build, sign and seal the bundle for one cell. Returns the archive path.
pub fn build_cell_bundle(ctx: &PackagerCtx<'_>, cell: &Cell, out_dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(out_dir)?;
    let mut entries: Vec<(String, Vec<u8>)> = Vec::new();

    // Key material, staged through the backend's export path.
    let staging = out_dir.join(format!(".stage-{}", cell.name));
    let cell_key = ctx
        .backend
        .get_key(&uvn_identity::KeyId::cell(cell.owner.clone(), cell.name.as_str()))?;
    for path in ctx.backend.export_key(&cell_key, &staging, true)? {
        entries.push((
            format!("keys/cell/{}/{}", cell.owner, file_name(&path)?),
            fs::read(&path)?,
        ));
    }
    for path in ctx.backend.export_key(ctx.root_key, &staging, false)? {
        entries.push((
            format!("keys/root/{}/{}", ctx.uvn.owner, file_name(&path)?),
            fs::read(&path)?,
        ));
    }
    fs::remove_dir_all(&staging)?;

    // Rendered configuration.
    entries.push((
        "config/wg-root.conf".to_string(),
        render_cell_root_config(ctx, cell)?.into_bytes(),
    ));
    entries.push((
        "config/wg-particles.conf".to_string(),
        render_cell_particles_config(ctx, cell)?.into_bytes(),
    ));
    for (peer_id, config) in render_cell_backbone_configs(ctx, cell)? {
        let peer_name = ctx
            .cell_by_id(peer_id)
            .map(|c| c.name.to_string())
            .unwrap_or_else(|| peer_id.to_string());
        entries.push((
            format!("config/wg-backbone-{}.conf", peer_name),
            config.into_bytes(),
        ));
    }
    entries.push((
        "config/ospfd.conf".to_string(),
        render_cell_ospfd(ctx, cell)?.into_bytes(),
    ));
    entries.push((
        "config/zebra.conf".to_string(),
        render_cell_zebra(ctx, cell)?.into_bytes(),
    ));
    entries.push((
        "config/dds.xml".to_string(),
        render_cell_dds(ctx, cell)?.into_bytes(),
    ));

    // The deployment map travels along in its public form; preshared keys
    // and link private keys are already baked into the rendered configs.
    entries.push((
        "deployment.yaml".to_string(),
        serde_yaml::to_string(&ctx.deployment.public_view())?.into_bytes(),
    ));

    let archive_path = out_dir.join(format!("{}.tar.gz.enc", cell.name));
    seal_bundle(ctx, cell.name.as_str(), &cell_key, entries, &archive_path)?;
    info!(cell = %cell.name, path = %archive_path.display(), "cell bundle written");
    Ok(archive_path)
}

/// Build, sign and seal the bundle for one particle.
pub fn build_particle_bundle(
    ctx: &PackagerCtx<'_>,
    particle: &Particle,
    out_dir: &Path,
) -> Result<PathBuf> {
    fs::create_dir_all(out_dir)?;
    let mut entries: Vec<(String, Vec<u8>)> = Vec::new();

    for cell in ctx.cells.values() {
        if cell.banned || !cell.enable_particles_vpn || !ctx.uvn.settings.enable_particles_vpn {
            continue;
        }
        let config = render_particle_config(ctx, particle, cell)?;
        let qr = uvn_crypto::qr::render_svg(&config)
            .map_err(|e| RegistryError::crypto("qr render", e))?;
        entries.push((
            format!("config/wg-particle-{}.conf", cell.name),
            config.into_bytes(),
        ));
        entries.push((format!("config/wg-particle-{}.svg", cell.name), qr.into_bytes()));
    }

    let particle_key = ctx.backend.get_key(&uvn_identity::KeyId::particle(
        particle.owner.clone(),
        particle.name.as_str(),
    ))?;
    let stem = format!(
        "uvn-{}-{}-{}",
        ctx.uvn.name, ctx.deployment.id, particle.name
    );
    let archive_path = out_dir.join(format!("{}.tar.gz.enc", stem));
    seal_bundle(ctx, particle.name.as_str(), &particle_key, entries, &archive_path)?;
    info!(particle = %particle.name, path = %archive_path.display(), "particle bundle written");
    Ok(archive_path)
}

/// Decrypt and verify an existing bundle. Returns its manifest.
pub fn verify_bundle(
    backend: &KeysBackend,
    root_key: &Key,
    recipient: &Key,
    archive_path: &Path,
) -> Result<BundleManifest> {
    let signature_path = signature_path_for(archive_path);
    let clear = archive_path.with_extension("check");
    let result = (|| -> Result<BundleManifest> {
        backend.decrypt_file(recipient, archive_path, &clear)?;
        backend.verify_signature(root_key, &signature_path, &clear)?;
        let entries = read_bundle(&fs::read(&clear)?)?;
        let manifest_bytes = entries
            .iter()
            .find(|(name, _)| name == MANIFEST_FILE)
            .map(|(_, data)| data.clone())
            .ok_or_else(|| RegistryError::Validation("bundle has no manifest".to_string()))?;
        let manifest: BundleManifest = serde_yaml::from_slice(&manifest_bytes)?;
        for entry in &manifest.files {
            let data = entries
                .iter()
                .find(|(name, _)| *name == entry.path)
                .map(|(_, data)| data)
                .ok_or_else(|| {
                    RegistryError::Validation(format!("bundle missing {}", entry.path))
                })?;
            if sha256_hex(data) != entry.sha256 {
                return Err(RegistryError::Validation(format!(
                    "fingerprint mismatch for {}",
                    entry.path
                )));
            }
        }
        Ok(manifest)
    })();
    if clear.exists() {
        fs::remove_file(&clear)?;
    }
    result
}

/// Delete archives in `dir` that are not in `expected` or cannot be paired
/// with a signature. Returns how many were collected.
pub fn gc_stale_archives(dir: &Path, expected: &[PathBuf]) -> Result<usize> {
    if !dir.is_dir() {
        return Ok(0);
    }
    let mut removed = 0;
    let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<std::io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.ends_with(".tar.gz.enc") {
            continue;
        }
        let stale = !expected.contains(&path) || !signature_path_for(&path).exists();
        if stale {
            warn!(path = %path.display(), "collecting stale archive");
            fs::remove_file(&path)?;
            let sig = signature_path_for(&path);
            if sig.exists() {
                fs::remove_file(&sig)?;
            }
            removed += 1;
        }
    }
    Ok(removed)
}

pub fn signature_path_for(archive_path: &Path) -> PathBuf {
    let mut name = archive_path.as_os_str().to_os_string();
    name.push(".sig");
    PathBuf::from(name)
}

// -- configuration rendering ------------------------------------------------

fn render_cell_root_config(ctx: &PackagerCtx<'_>, cell: &Cell) -> Result<String> {
    let settings = &ctx.uvn.settings.root_vpn;
    let plan = ctx.root_plan();
    let keys = ctx
        .vpn_keys
        .root_cells
        .get(&cell.id)
        .ok_or_else(|| RegistryError::MissingKey(format!("root vpn keys for {}", cell.name)))?;
    let server = ctx
        .vpn_keys
        .root_server
        .as_ref()
        .ok_or_else(|| RegistryError::MissingKey("root vpn server keys".to_string()))?;

    let endpoint = ctx
        .uvn
        .address
        .as_ref()
        .map(|address| format!("{}:{}", address, settings.port));
    let ctx_wg = WgConfigCtx {
        interface: WgInterfaceCtx {
            private_key: keys.private_key.clone(),
            address: plan.cell_address(cell.id)?.to_string(),
            prefix: settings.subnet.prefix(),
            listen_port: None,
            mtu: Some(settings.peer_mtu),
        },
        peers: vec![WgPeerCtx {
            public_key: server.public_key.clone(),
            preshared_key: None,
            allowed_ips: settings.subnet.to_string(),
            endpoint,
            keepalive: Some(settings.keepalive),
        }],
    };
    ctx.renderer.render("wg.conf", &ctx_wg)
}

fn render_cell_particles_config(ctx: &PackagerCtx<'_>, cell: &Cell) -> Result<String> {
    let settings = &ctx.uvn.settings.particles_vpn;
    let plan = ctx.particles_plan()?;
    let server = ctx
        .vpn_keys
        .particles_servers
        .get(&cell.id)
        .ok_or_else(|| RegistryError::MissingKey(format!("particles keys for {}", cell.name)))?;

    let mut peers = Vec::new();
    for particle in ctx.active_particles(cell) {
        let link = ctx
            .vpn_keys
            .particles
            .get(&(particle.id, cell.id))
            .ok_or_else(|| {
                RegistryError::MissingKey(format!(
                    "particle keys for {} on {}",
                    particle.name, cell.name
                ))
            })?;
        peers.push(WgPeerCtx {
            public_key: link.keys.public_key.clone(),
            preshared_key: Some(link.psk.clone()),
            allowed_ips: format!("{}/32", plan.particle_address(cell.id, particle.id)?),
            endpoint: None,
            keepalive: None,
        });
    }

    let ctx_wg = WgConfigCtx {
        interface: WgInterfaceCtx {
            private_key: server.private_key.clone(),
            address: plan.cell_server_address(cell.id)?.to_string(),
            prefix: plan.slice_prefix(),
            listen_port: Some(settings.port),
            mtu: Some(settings.peer_mtu),
        },
        peers,
    };
    ctx.renderer.render("wg.conf", &ctx_wg)
}

fn render_cell_backbone_configs(
    ctx: &PackagerCtx<'_>,
    cell: &Cell,
) -> Result<Vec<(u16, String)>> {
    let settings = &ctx.uvn.settings.backbone_vpn;
    let mut configs = Vec::new();
    let Some(entry) = ctx.deployment.peer_entry(cell.id) else {
        return Ok(configs);
    };

    for (peer_id, link) in &entry.peers {
        let peer = ctx.cell_by_id(*peer_id).ok_or_else(|| {
            RegistryError::Deployment(format!("deployment references unknown cell {}", peer_id))
        })?;
        let (own_keys, peer_keys) = ctx
            .deployment
            .link_keys
            .endpoint_keys(cell.id, *peer_id, cell.id)
            .ok_or_else(|| {
                RegistryError::MissingKey(format!("link keys for {}<->{}", cell.id, peer_id))
            })?;
        let psk = ctx
            .deployment
            .psks
            .get(cell.id, *peer_id)
            .ok_or_else(|| {
                RegistryError::MissingKey(format!("psk for {}<->{}", cell.id, peer_id))
            })?;

        // The remote's listen port comes from its own side of the map.
        let peer_entry = ctx.deployment.peer_entry(*peer_id);
        let peer_port_idx = peer_entry
            .and_then(|e| e.peers.get(&cell.id))
            .map(|l| l.port_idx)
            .unwrap_or(0);
        let endpoint = peer
            .address
            .as_ref()
            .map(|address| format!("{}:{}", address, peer_port(settings.port, peer_port_idx)));

        let mut allowed = vec![format!("{}/32", link.remote_addr)];
        allowed.extend(peer.allowed_lans.iter().map(|lan| lan.to_string()));

        let ctx_wg = WgConfigCtx {
            interface: WgInterfaceCtx {
                private_key: own_keys.private_key.clone(),
                address: link.local_addr.to_string(),
                prefix: link.network.prefix(),
                listen_port: Some(peer_port(settings.port, link.port_idx)),
                mtu: Some(settings.peer_mtu),
            },
            peers: vec![WgPeerCtx {
                public_key: peer_keys.public_key.clone(),
                preshared_key: Some(psk.to_string()),
                allowed_ips: allowed.join(","),
                endpoint,
                keepalive: Some(settings.keepalive),
            }],
        };
        configs.push((*peer_id, ctx.renderer.render("wg.conf", &ctx_wg)?));
    }
    Ok(configs)
}

fn render_cell_ospfd(ctx: &PackagerCtx<'_>, cell: &Cell) -> Result<String> {
    let plan = ctx.root_plan();
    let mut interfaces = vec![ctx.uvn.settings.root_vpn.interface_name(0)];
    let mut networks = Vec::new();

    if let Some(entry) = ctx.deployment.peer_entry(cell.id) {
        for link in entry.peers.values() {
            interfaces.push(ctx.uvn.settings.backbone_vpn.interface_name(link.port_idx));
            networks.push(OspfNetworkCtx {
                subnet: link.network.to_string(),
                area: link.network.network().to_string(),
            });
        }
    }
    for lan in &cell.allowed_lans {
        networks.push(OspfNetworkCtx {
            subnet: lan.to_string(),
            area: "0.0.0.0".to_string(),
        });
    }

    let ctx_ospf = OspfCtx {
        hostname: cell.name.to_string(),
        password: "zebra".to_string(),
        log_file: "/var/log/quagga/ospfd.log".to_string(),
        interfaces,
        router_id: plan.cell_address(cell.id)?.to_string(),
        networks,
    };
    ctx.renderer.render("ospfd.conf", &ctx_ospf)
}

fn render_cell_zebra(ctx: &PackagerCtx<'_>, cell: &Cell) -> Result<String> {
    let mut interfaces = vec![
        ctx.uvn.settings.root_vpn.interface_name(0),
        ctx.uvn.settings.particles_vpn.interface_name(0),
    ];
    if let Some(entry) = ctx.deployment.peer_entry(cell.id) {
        for link in entry.peers.values() {
            interfaces.push(ctx.uvn.settings.backbone_vpn.interface_name(link.port_idx));
        }
    }
    let ctx_zebra = ZebraCtx {
        hostname: cell.name.to_string(),
        password: "zebra".to_string(),
        log_file: "/var/log/quagga/zebra.log".to_string(),
        interfaces,
    };
    ctx.renderer.render("zebra.conf", &ctx_zebra)
}

fn render_cell_dds(ctx: &PackagerCtx<'_>, cell: &Cell) -> Result<String> {
    let grants = topic_grants(KeyType::Cell);
    let ctx_dds = crate::render::DdsCtx {
        participant: format!("{}@{}", cell.name, ctx.uvn.name),
        domain_id: ctx.uvn.settings.dds_domain,
        timing: ctx.uvn.settings.timing_profile.settings(),
        publish: grants.publish.iter().map(|t| t.to_string()).collect(),
        subscribe: grants.subscribe.iter().map(|t| t.to_string()).collect(),
    };
    ctx.renderer.render("dds.xml", &ctx_dds)
}

fn render_particle_config(
    ctx: &PackagerCtx<'_>,
    particle: &Particle,
    cell: &Cell,
) -> Result<String> {
    let settings = &ctx.uvn.settings.particles_vpn;
    let plan = ctx.particles_plan()?;
    let link = ctx
        .vpn_keys
        .particles
        .get(&(particle.id, cell.id))
        .ok_or_else(|| {
            RegistryError::MissingKey(format!(
                "particle keys for {} on {}",
                particle.name, cell.name
            ))
        })?;
    let server = ctx
        .vpn_keys
        .particles_servers
        .get(&cell.id)
        .ok_or_else(|| RegistryError::MissingKey(format!("particles keys for {}", cell.name)))?;

    let mut allowed = vec![
        plan.cell_slice(cell.id)?.to_string(),
        ctx.uvn.settings.root_vpn.subnet.to_string(),
    ];
    allowed.extend(cell.allowed_lans.iter().map(|lan| lan.to_string()));

    let ctx_wg = WgConfigCtx {
        interface: WgInterfaceCtx {
            private_key: link.keys.private_key.clone(),
            address: plan.particle_address(cell.id, particle.id)?.to_string(),
            prefix: plan.slice_prefix(),
            listen_port: None,
            mtu: Some(settings.peer_mtu),
        },
        peers: vec![WgPeerCtx {
            public_key: server.public_key.clone(),
            preshared_key: Some(link.psk.clone()),
            allowed_ips: allowed.join(","),
            endpoint: cell
                .address
                .as_ref()
                .map(|address| format!("{}:{}", address, settings.port)),
            keepalive: Some(settings.keepalive),
        }],
    };
    ctx.renderer.render("wg.conf", &ctx_wg)
}

// -- archive plumbing -------------------------------------------------------

fn seal_bundle(
    ctx: &PackagerCtx<'_>,
    target: &str,
    recipient: &Key,
    mut entries: Vec<(String, Vec<u8>)>,
    archive_path: &Path,
) -> Result<()> {
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let manifest = BundleManifest {
        uvn: ctx.uvn.name.to_string(),
        deployment_id: ctx.deployment.id.clone(),
        target: target.to_string(),
        generated: ctx.deployment.generated.clone(),
        files: entries
            .iter()
            .map(|(path, data)| ManifestEntry {
                path: path.clone(),
                sha256: sha256_hex(data),
                size: data.len() as u64,
            })
            .collect(),
    };
    let mut all = vec![(MANIFEST_FILE.to_string(), serde_yaml::to_string(&manifest)?.into_bytes())];
    all.extend(entries);

    let tar_gz = write_archive(&all)?;
    let clear_path = archive_path.with_extension("clear");
    fs::write(&clear_path, &tar_gz)?;

    let result = (|| -> Result<()> {
        ctx.backend
            .sign_file(ctx.root_key, &clear_path, &signature_path_for(archive_path))?;
        ctx.backend
            .encrypt_file(recipient, &clear_path, archive_path)?;
        Ok(())
    })();
    fs::remove_file(&clear_path)?;
    debug!(target, files = manifest.files.len(), "bundle sealed");
    result
}

fn write_archive(entries: &[(String, Vec<u8>)]) -> Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (path, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(if path.starts_with("keys/") { 0o600 } else { 0o644 });
        header.set_mtime(0);
        header.set_cksum();
        builder.append_data(&mut header, path, data.as_slice())?;
    }
    let encoder = builder.into_inner()?;
    Ok(encoder.finish()?)
}

/// Extract every entry of a clear tar.gz bundle.
pub fn read_bundle(tar_gz: &[u8]) -> Result<Vec<(String, Vec<u8>)>> {
    let mut archive = tar::Archive::new(GzDecoder::new(tar_gz));
    let mut entries = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_string_lossy().to_string();
        if path.contains("..") {
            return Err(RegistryError::Validation(format!(
                "bundle entry escapes archive: {}",
                path
            )));
        }
        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;
        entries.push((path, data));
    }
    Ok(entries)
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| RegistryError::Validation(format!("not a file: {}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_archive_round_trip() {
        let entries = vec![
            ("config/wg-root.conf".to_string(), b"[Interface]\n".to_vec()),
            ("manifest.yaml".to_string(), b"files: []\n".to_vec()),
        ];
        let tar_gz = write_archive(&entries).unwrap();
        let back = read_bundle(&tar_gz).unwrap();
        assert_eq!(back, entries);
    }

    #[test]
    fn test_archive_is_deterministic() {
        let entries = vec![("a".to_string(), b"1".to_vec()), ("b".to_string(), b"2".to_vec())];
        assert_eq!(write_archive(&entries).unwrap(), write_archive(&entries).unwrap());
    }

    #[test]
    fn test_signature_path() {
        assert_eq!(
            signature_path_for(Path::new("/x/east.tar.gz.enc")),
            PathBuf::from("/x/east.tar.gz.enc.sig")
        );
    }
}
