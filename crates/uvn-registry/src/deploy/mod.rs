//! Backbone deployments: the peer-pair graph and its key material.

pub mod strategy;

use crate::error::{RegistryError, Result};
use crate::wgkeys::WgEndpointKeys;
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use uvn_crypto::PresharedKey;
use uvn_network::{LinkAllocation, P2pLinkAllocationMap, PeerPair, PortIndexer};

pub use strategy::{DeploymentStrategy, StrategyInput, StrategyKind, StrategyState};

/// One direction of a backbone link, as seen from the owning peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerLink {
    /// Port index on the owning endpoint; unique across its links.
    pub port_idx: usize,
    pub local_addr: Ipv4Addr,
    pub remote_addr: Ipv4Addr,
    pub network: Ipv4Network,
}

/// A peer's slice of the deployment map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployedPeer {
    /// Deterministic local index, assigned over the sorted peer ids.
    pub n: usize,
    pub peers: BTreeMap<u16, PeerLink>,
}

/// The symmetric peer-pair graph produced by a deployment run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct P2pLinksMap {
    pub peers: BTreeMap<u16, DeployedPeer>,
}

impl P2pLinksMap {
    pub fn edges(&self) -> BTreeSet<PeerPair> {
        let mut edges = BTreeSet::new();
        for (id, entry) in &self.peers {
            for other in entry.peers.keys() {
                edges.insert(PeerPair::new(*id, *other));
            }
        }
        edges
    }

    pub fn link_count(&self) -> usize {
        self.edges().len()
    }

    /// Both directions of every edge are present and agree on the /31.
    pub fn is_symmetric(&self) -> bool {
        self.peers.iter().all(|(id, entry)| {
            entry.peers.iter().all(|(other, link)| {
                self.peers
                    .get(other)
                    .and_then(|e| e.peers.get(id))
                    .map(|mirror| {
                        mirror.network == link.network
                            && mirror.local_addr == link.remote_addr
                            && mirror.remote_addr == link.local_addr
                    })
                    .unwrap_or(false)
            })
        })
    }

    pub fn degree(&self, peer: u16) -> usize {
        self.peers.get(&peer).map(|e| e.peers.len()).unwrap_or(0)
    }
}

/// Build the symmetric links map for `edges`, pinning /31s in the
/// allocation map and assigning per-endpoint port indexes in deterministic
/// edge order.
pub fn build_links_map(
    peers: &BTreeSet<u16>,
    edges: &BTreeSet<PeerPair>,
    allocations: &mut P2pLinkAllocationMap,
) -> Result<P2pLinksMap> {
    let mut map = P2pLinksMap::default();
    for (n, id) in peers.iter().enumerate() {
        map.peers.insert(
            *id,
            DeployedPeer {
                n,
                peers: BTreeMap::new(),
            },
        );
    }

    // Port tables extend past the configured default when a hub needs more
    // links than the default count; degree is bounded by the peer count.
    let port_limit = peers.len().max(1);
    let mut ports = PortIndexer::new();

    for pair in edges {
        if pair.low() == pair.high() {
            return Err(RegistryError::Deployment(format!(
                "peer {} linked to itself",
                pair.low()
            )));
        }
        if !peers.contains(&pair.low()) || !peers.contains(&pair.high()) {
            return Err(RegistryError::Deployment(format!(
                "link {}<->{} references an unknown peer",
                pair.low(),
                pair.high()
            )));
        }
        let allocation: LinkAllocation = allocations.assert_pair(pair.low(), pair.high())?;
        let low_port = ports.assign(pair.low(), port_limit)?;
        let high_port = ports.assign(pair.high(), port_limit)?;

        if let Some(entry) = map.peers.get_mut(&pair.low()) {
            entry.peers.insert(
                pair.high(),
                PeerLink {
                    port_idx: low_port,
                    local_addr: allocation.low_addr,
                    remote_addr: allocation.high_addr,
                    network: allocation.network,
                },
            );
        }
        if let Some(entry) = map.peers.get_mut(&pair.high()) {
            entry.peers.insert(
                pair.low(),
                PeerLink {
                    port_idx: high_port,
                    local_addr: allocation.high_addr,
                    remote_addr: allocation.low_addr,
                    network: allocation.network,
                },
            );
        }
    }
    Ok(map)
}

/// Per-pair preshared keys, shared by both directions of a link.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PskMap(BTreeMap<PeerPair, String>);

impl PskMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotently assert a preshared key for the unordered pair.
    pub fn assert_psk(&mut self, a: u16, b: u16) -> &str {
        self.0
            .entry(PeerPair::new(a, b))
            .or_insert_with(|| PresharedKey::generate().to_base64())
    }

    pub fn get(&self, a: u16, b: u16) -> Option<&str> {
        self.0.get(&PeerPair::new(a, b)).map(String::as_str)
    }

    pub fn set(&mut self, a: u16, b: u16, psk: String) {
        self.0.insert(PeerPair::new(a, b), psk);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Per-pair link endpoint keys; `low`/`high` follow the pair order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkKeyMap(BTreeMap<PeerPair, (WgEndpointKeys, WgEndpointKeys)>);

impl LinkKeyMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assert_pair(&mut self, a: u16, b: u16) -> &(WgEndpointKeys, WgEndpointKeys) {
        self.0
            .entry(PeerPair::new(a, b))
            .or_insert_with(|| (WgEndpointKeys::generate(), WgEndpointKeys::generate()))
    }

    pub fn get(&self, a: u16, b: u16) -> Option<&(WgEndpointKeys, WgEndpointKeys)> {
        self.0.get(&PeerPair::new(a, b))
    }

    /// The (own, peer) keys for `peer` on the pair (a, b).
    pub fn endpoint_keys(&self, a: u16, b: u16, peer: u16) -> Option<(&WgEndpointKeys, &WgEndpointKeys)> {
        let pair = PeerPair::new(a, b);
        self.0.get(&pair).map(|(low, high)| {
            if peer == pair.low() {
                (low, high)
            } else {
                (high, low)
            }
        })
    }

    /// Regenerate the key material of `peer`'s side on every pair touching
    /// it. The other endpoint's keys are untouched.
    pub fn rekey_endpoint(&mut self, peer: u16) {
        for (pair, (low, high)) in self.0.iter_mut() {
            if pair.low() == peer {
                *low = WgEndpointKeys::generate();
            } else if pair.high() == peer {
                *high = WgEndpointKeys::generate();
            }
        }
    }

    pub fn pairs_touching(&self, peer: u16) -> Vec<PeerPair> {
        self.0
            .keys()
            .filter(|pair| pair.low() == peer || pair.high() == peer)
            .copied()
            .collect()
    }
}

/// A versioned deployment: the graph, its addresses and its key material.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub strategy: StrategyKind,
    pub generated: String,
    /// Ids of the cells this deployment was computed from.
    pub cells: Vec<u16>,
    pub map: P2pLinksMap,
    pub psks: PskMap,
    pub link_keys: LinkKeyMap,
    pub allocations: P2pLinkAllocationMap,
}

impl Deployment {
    /// Stale when the active cell set has drifted from the deployed one.
    pub fn is_stale(&self, active: &BTreeSet<u16>) -> bool {
        let deployed: BTreeSet<u16> = self.cells.iter().copied().collect();
        deployed != *active
    }

    pub fn peer_entry(&self, cell_id: u16) -> Option<&DeployedPeer> {
        self.map.peers.get(&cell_id)
    }

    /// Serialized view with preshared keys and private link keys elided.
    pub fn public_view(&self) -> Deployment {
        let mut view = self.clone();
        view.psks = PskMap::new();
        view.link_keys = LinkKeyMap(
            self.link_keys
                .0
                .iter()
                .map(|(pair, (low, high))| (*pair, (low.redacted(), high.redacted())))
                .collect(),
        );
        view
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backbone() -> P2pLinkAllocationMap {
        P2pLinkAllocationMap::new("10.255.192.0/20".parse().unwrap())
    }

    fn ids(v: &[u16]) -> BTreeSet<u16> {
        v.iter().copied().collect()
    }

    #[test]
    fn test_build_links_map_symmetry() {
        let peers = ids(&[1, 2, 3]);
        let edges: BTreeSet<_> = [PeerPair::new(1, 2), PeerPair::new(2, 3)].into();
        let mut alloc = backbone();
        let map = build_links_map(&peers, &edges, &mut alloc).unwrap();
        assert!(map.is_symmetric());
        assert_eq!(map.link_count(), 2);
        assert_eq!(map.degree(2), 2);
    }

    #[test]
    fn test_peer_indexes_follow_sorted_ids() {
        let peers = ids(&[5, 2, 9]);
        let edges = BTreeSet::new();
        let mut alloc = backbone();
        let map = build_links_map(&peers, &edges, &mut alloc).unwrap();
        assert_eq!(map.peers[&2].n, 0);
        assert_eq!(map.peers[&5].n, 1);
        assert_eq!(map.peers[&9].n, 2);
    }

    #[test]
    fn test_unknown_peer_rejected() {
        let peers = ids(&[1, 2]);
        let edges: BTreeSet<_> = [PeerPair::new(1, 7)].into();
        let mut alloc = backbone();
        assert!(build_links_map(&peers, &edges, &mut alloc).is_err());
    }

    #[test]
    fn test_psk_map_is_symmetric_and_idempotent() {
        let mut psks = PskMap::new();
        let first = psks.assert_psk(1, 2).to_string();
        assert_eq!(psks.assert_psk(2, 1), first);
        assert_eq!(psks.get(2, 1), Some(first.as_str()));
        assert_eq!(psks.len(), 1);
    }

    #[test]
    fn test_link_keys_rekey_one_endpoint() {
        let mut keys = LinkKeyMap::new();
        keys.assert_pair(1, 2);
        keys.assert_pair(2, 3);
        let peer1_before = keys.get(1, 2).unwrap().0.clone();
        let peer2_before = keys.get(1, 2).unwrap().1.clone();
        let peer3_before = keys.get(2, 3).unwrap().1.clone();

        keys.rekey_endpoint(2);
        // Peer 2's side changed on both links; 1 and 3 kept theirs.
        assert_eq!(keys.get(1, 2).unwrap().0, peer1_before);
        assert_ne!(keys.get(1, 2).unwrap().1, peer2_before);
        assert_eq!(keys.get(2, 3).unwrap().1, peer3_before);
    }

    #[test]
    fn test_public_view_redacts_secrets() {
        let mut keys = LinkKeyMap::new();
        keys.assert_pair(1, 2);
        let mut psks = PskMap::new();
        psks.assert_psk(1, 2);
        let deployment = Deployment {
            id: "d1".to_string(),
            strategy: StrategyKind::Crossed,
            generated: "2024-01-01T00:00:00".to_string(),
            cells: vec![1, 2],
            map: P2pLinksMap::default(),
            psks,
            link_keys: keys,
            allocations: backbone(),
        };
        let view = deployment.public_view();
        assert!(view.psks.is_empty());
        assert!(view
            .link_keys
            .get(1, 2)
            .map(|(low, _)| low.private_key.is_empty())
            .unwrap_or(false));
    }

    #[test]
    fn test_staleness() {
        let deployment = Deployment {
            id: "d1".to_string(),
            strategy: StrategyKind::Crossed,
            generated: "2024-01-01T00:00:00".to_string(),
            cells: vec![1, 2],
            map: P2pLinksMap::default(),
            psks: PskMap::new(),
            link_keys: LinkKeyMap::new(),
            allocations: backbone(),
        };
        assert!(!deployment.is_stale(&ids(&[1, 2])));
        assert!(deployment.is_stale(&ids(&[1])));
        assert!(deployment.is_stale(&ids(&[1, 2, 3])));
    }
}
