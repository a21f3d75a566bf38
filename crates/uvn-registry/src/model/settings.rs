//! UVN settings: the three VPN families and the deployment strategy.

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use uvn_types::{TimingProfile, VpnKind};

use crate::deploy::strategy::StrategyKind;

/// Settings for one VPN family. The per-kind defaults come from
/// [`VpnSettings::defaults`]; a single struct plus the kind discriminant
/// replaces a subtype per family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VpnSettings {
    pub kind: VpnKind,
    pub port: u16,
    /// Distinct push port; only the root family uses one.
    pub peer_port: Option<u16>,
    pub subnet: Ipv4Network,
    pub peer_mtu: u16,
    pub masquerade: bool,
    pub forward: bool,
    pub tunnel: bool,
    pub keepalive: u16,
    /// Number of backbone ports a cell exposes by default.
    pub peer_port_count: usize,
    /// Size of each cell's particle slice; particles family only.
    pub slice_prefix: Option<u8>,
}

impl VpnSettings {
    pub fn defaults(kind: VpnKind) -> Self {
        match kind {
            VpnKind::Root => Self {
                kind,
                port: 63550,
                peer_port: Some(63551),
                subnet: "10.255.128.0/22".parse().unwrap(),
                peer_mtu: 1420,
                masquerade: false,
                forward: true,
                tunnel: true,
                keepalive: 25,
                peer_port_count: 0,
                slice_prefix: None,
            },
            VpnKind::Particles => Self {
                kind,
                port: 63449,
                peer_port: None,
                subnet: "10.254.0.0/16".parse().unwrap(),
                peer_mtu: 1420,
                masquerade: true,
                forward: true,
                tunnel: false,
                keepalive: 25,
                peer_port_count: 0,
                slice_prefix: Some(uvn_network::ParticlesVpnPlan::DEFAULT_SLICE_PREFIX),
            },
            VpnKind::Backbone => Self {
                kind,
                port: uvn_network::DEFAULT_PEER_PORT_BASE,
                peer_port: None,
                subnet: "10.255.192.0/20".parse().unwrap(),
                peer_mtu: 1420,
                masquerade: false,
                forward: true,
                tunnel: true,
                keepalive: 25,
                peer_port_count: uvn_network::DEFAULT_PEER_PORT_COUNT,
                slice_prefix: None,
            },
        }
    }

    /// Interface name of the n-th interface of this family.
    pub fn interface_name(&self, n: usize) -> String {
        self.kind.interface_name(n)
    }
}

/// Deployment strategy selection plus strategy-specific arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentSettings {
    pub strategy: StrategyKind,
    #[serde(default)]
    pub strategy_args: serde_yaml::Mapping,
}

impl Default for DeploymentSettings {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::Crossed,
            strategy_args: serde_yaml::Mapping::new(),
        }
    }
}

/// The full settings tree owned by the Uvn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UvnSettings {
    pub timing_profile: TimingProfile,
    pub enable_root_vpn: bool,
    pub enable_particles_vpn: bool,
    pub enable_dds_security: bool,
    pub dds_domain: u32,
    pub deployment: DeploymentSettings,
    pub root_vpn: VpnSettings,
    pub particles_vpn: VpnSettings,
    pub backbone_vpn: VpnSettings,
}

impl Default for UvnSettings {
    fn default() -> Self {
        Self {
            timing_profile: TimingProfile::Default,
            enable_root_vpn: true,
            enable_particles_vpn: true,
            enable_dds_security: false,
            dds_domain: 46,
            deployment: DeploymentSettings::default(),
            root_vpn: VpnSettings::defaults(VpnKind::Root),
            particles_vpn: VpnSettings::defaults(VpnKind::Particles),
            backbone_vpn: VpnSettings::defaults(VpnKind::Backbone),
        }
    }
}

impl UvnSettings {
    /// All VPN subnets, for overlap validation against cell LANs.
    pub fn vpn_subnets(&self) -> [Ipv4Network; 3] {
        [
            self.root_vpn.subnet,
            self.particles_vpn.subnet,
            self.backbone_vpn.subnet,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_defaults() {
        let root = VpnSettings::defaults(VpnKind::Root);
        assert_eq!(root.port, 63550);
        assert_eq!(root.peer_port, Some(63551));
        assert_eq!(root.subnet.to_string(), "10.255.128.0/22");

        let particles = VpnSettings::defaults(VpnKind::Particles);
        assert_eq!(particles.port, 63449);
        assert_eq!(particles.slice_prefix, Some(24));

        let backbone = VpnSettings::defaults(VpnKind::Backbone);
        assert_eq!(backbone.subnet.prefix(), 20);
        assert_eq!(backbone.peer_port_count, 3);
    }

    #[test]
    fn test_interface_templates() {
        assert_eq!(VpnSettings::defaults(VpnKind::Root).interface_name(0), "uwg-v0");
        assert_eq!(
            VpnSettings::defaults(VpnKind::Backbone).interface_name(1),
            "uwg-b1"
        );
    }

    #[test]
    fn test_settings_round_trip() {
        let settings = UvnSettings::default();
        let yaml = serde_yaml::to_string(&settings).unwrap();
        let back: UvnSettings = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(settings, back);
    }
}
