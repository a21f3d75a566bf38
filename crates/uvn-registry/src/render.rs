//! Text artifact rendering.
//!
//! A single tera environment with an explicit registration table of
//! embedded templates; entities are serialized to plain context structs
//! before rendering, so templates never see live model objects.

use crate::error::Result;
use serde::Serialize;
use std::path::Path;
use tera::Tera;
use uvn_types::TimingSettings;

const TEMPLATES: &[(&str, &str)] = &[
    ("wg.conf", include_str!("../templates/wg.conf.tera")),
    ("ospfd.conf", include_str!("../templates/ospfd.conf.tera")),
    ("zebra.conf", include_str!("../templates/zebra.conf.tera")),
    ("dds.xml", include_str!("../templates/dds.xml.tera")),
    ("deployment.md", include_str!("../templates/deployment.md.tera")),
];

pub struct TemplateRenderer {
    tera: Tera,
}

impl TemplateRenderer {
    pub fn new() -> Result<Self> {
        let mut tera = Tera::default();
        for (name, source) in TEMPLATES {
            tera.add_raw_template(name, source)?;
        }
        Ok(Self { tera })
    }

    pub fn render(&self, template: &str, ctx: &impl Serialize) -> Result<String> {
        let context = tera::Context::from_serialize(ctx)?;
        Ok(self.tera.render(template, &context)?)
    }

    pub fn render_to(&self, template: &str, ctx: &impl Serialize, path: &Path) -> Result<()> {
        let output = self.render(template, ctx)?;
        uvn_crypto::fsutil::write_atomic(path, output.as_bytes())
            .map_err(|e| crate::error::RegistryError::crypto("render output", e))?;
        Ok(())
    }
}

/// wg-quick `[Interface]` section.
#[derive(Debug, Clone, Serialize)]
pub struct WgInterfaceCtx {
    pub private_key: String,
    pub address: String,
    pub prefix: u8,
    pub listen_port: Option<u16>,
    pub mtu: Option<u16>,
}

/// wg-quick `[Peer]` section.
#[derive(Debug, Clone, Serialize)]
pub struct WgPeerCtx {
    pub public_key: String,
    pub preshared_key: Option<String>,
    pub allowed_ips: String,
    pub endpoint: Option<String>,
    pub keepalive: Option<u16>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WgConfigCtx {
    pub interface: WgInterfaceCtx,
    pub peers: Vec<WgPeerCtx>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OspfNetworkCtx {
    pub subnet: String,
    /// Each backbone /31 lives in its own area, keyed by the link's
    /// network address, so LSAs never flood across the whole overlay.
    pub area: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct OspfCtx {
    pub hostname: String,
    pub password: String,
    pub log_file: String,
    pub interfaces: Vec<String>,
    pub router_id: String,
    pub networks: Vec<OspfNetworkCtx>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ZebraCtx {
    pub hostname: String,
    pub password: String,
    pub log_file: String,
    pub interfaces: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DdsCtx {
    pub participant: String,
    pub domain_id: u32,
    pub timing: TimingSettings,
    pub publish: Vec<String>,
    pub subscribe: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SummaryCellCtx {
    pub name: String,
    pub id: u16,
    pub links: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeploymentSummaryCtx {
    pub uvn: String,
    pub deployment_id: String,
    pub strategy: String,
    pub generated: String,
    pub link_count: usize,
    pub cells: Vec<SummaryCellCtx>,
}
