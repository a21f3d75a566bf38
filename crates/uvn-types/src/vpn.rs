//! The three VPN families managed by the registry.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Discriminant for the three VPN families.
///
/// Per-family defaults (subnets, ports, interface templates) live with the
/// settings factory in the registry crate; this enum only carries the
/// identity and the stable bits shared by every consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VpnKind {
    Root,
    Particles,
    Backbone,
}

impl VpnKind {
    /// Interface name for the n-th interface of this family, e.g. `uwg-b2`.
    pub fn interface_name(&self, n: usize) -> String {
        match self {
            VpnKind::Root => format!("uwg-v{}", n),
            VpnKind::Particles => format!("uwg-p{}", n),
            VpnKind::Backbone => format!("uwg-b{}", n),
        }
    }
}

impl fmt::Display for VpnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VpnKind::Root => f.write_str("root"),
            VpnKind::Particles => f.write_str("particles"),
            VpnKind::Backbone => f.write_str("backbone"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interface_names() {
        assert_eq!(VpnKind::Root.interface_name(0), "uwg-v0");
        assert_eq!(VpnKind::Particles.interface_name(0), "uwg-p0");
        assert_eq!(VpnKind::Backbone.interface_name(2), "uwg-b2");
    }
}
