//! Backbone link allocation: pairwise /31 networks and per-endpoint ports.

use crate::allocator::offset;
use crate::error::{NetworkError, Result};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

/// Default UDP ports a cell exposes for backbone links.
pub const DEFAULT_PEER_PORT_BASE: u16 = 63450;
pub const DEFAULT_PEER_PORT_COUNT: usize = 3;

/// Normalized unordered pair of peer ids, `low < high`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct PeerPair(pub u16, pub u16);

impl PeerPair {
    pub fn new(a: u16, b: u16) -> Self {
        if a <= b {
            Self(a, b)
        } else {
            Self(b, a)
        }
    }

    pub fn low(&self) -> u16 {
        self.0
    }

    pub fn high(&self) -> u16 {
        self.1
    }
}

/// Addresses pinned to one backbone pair: the /31 and its two hosts.
///
/// `.0` belongs to the lower peer id, `.1` to the higher one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkAllocation {
    pub network: Ipv4Network,
    pub low_addr: Ipv4Addr,
    pub high_addr: Ipv4Addr,
}

impl LinkAllocation {
    /// The (local, remote) addresses as seen from `peer`.
    pub fn addresses_for(&self, pair: PeerPair, peer: u16) -> (Ipv4Addr, Ipv4Addr) {
        if peer == pair.low() {
            (self.low_addr, self.high_addr)
        } else {
            (self.high_addr, self.low_addr)
        }
    }
}

/// Allocation map for the backbone subnet.
///
/// /31 links are consumed in order starting at `base + 2`; once a pair is
/// allocated, re-asserting it returns the pinned addresses, so reruns after
/// non-topology changes never renumber existing links.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct P2pLinkAllocationMap {
    subnet: Ipv4Network,
    next_offset: u32,
    pairs: BTreeMap<PeerPair, LinkAllocation>,
}

impl P2pLinkAllocationMap {
    pub fn new(subnet: Ipv4Network) -> Self {
        Self {
            subnet,
            next_offset: 2,
            pairs: BTreeMap::new(),
        }
    }

    pub fn subnet(&self) -> Ipv4Network {
        self.subnet
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn get(&self, a: u16, b: u16) -> Option<&LinkAllocation> {
        self.pairs.get(&PeerPair::new(a, b))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PeerPair, &LinkAllocation)> {
        self.pairs.iter()
    }

    /// Return the allocation for the pair, allocating a fresh /31 if the
    /// pair has none yet. Idempotent.
    pub fn assert_pair(&mut self, a: u16, b: u16) -> Result<LinkAllocation> {
        let pair = PeerPair::new(a, b);
        if let Some(existing) = self.pairs.get(&pair) {
            return Ok(*existing);
        }

        let low_addr = offset(self.subnet.network(), self.next_offset);
        let high_addr = offset(self.subnet.network(), self.next_offset + 1);
        if !self.subnet.contains(low_addr) || !self.subnet.contains(high_addr) {
            return Err(NetworkError::SubnetExhausted {
                subnet: self.subnet.to_string(),
                what: format!("link {}<->{}", pair.low(), pair.high()),
            });
        }
        let network = Ipv4Network::new(low_addr, 31)
            .map_err(|e| NetworkError::InvalidSubnet(e.to_string()))?;

        let allocation = LinkAllocation {
            network,
            low_addr,
            high_addr,
        };
        self.pairs.insert(pair, allocation);
        self.next_offset += 2;
        Ok(allocation)
    }
}

/// Per-endpoint port-index assignment.
///
/// Each endpoint's links must use distinct port indexes; index `i` maps to
/// UDP port `base + i`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortIndexer {
    used: BTreeMap<u16, usize>,
}

impl PortIndexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign the next free port index on `endpoint`, bounded by `limit`.
    pub fn assign(&mut self, endpoint: u16, limit: usize) -> Result<usize> {
        let next = self.used.entry(endpoint).or_insert(0);
        if *next >= limit {
            return Err(NetworkError::PortsExhausted { endpoint, limit });
        }
        let index = *next;
        *next += 1;
        Ok(index)
    }

    pub fn assigned(&self, endpoint: u16) -> usize {
        self.used.get(&endpoint).copied().unwrap_or(0)
    }
}

/// UDP port for a backbone port index.
pub fn peer_port(base: u16, index: usize) -> u16 {
    base + index as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Ipv4Network {
        s.parse().unwrap()
    }

    #[test]
    fn test_first_link_matches_backbone_plan() {
        // First /31 out of the default backbone subnet starts at base + 2.
        let mut map = P2pLinkAllocationMap::new(net("10.255.192.0/20"));
        let link = map.assert_pair(1, 2).unwrap();
        assert_eq!(link.network, net("10.255.192.2/31"));
        assert_eq!(link.low_addr, "10.255.192.2".parse::<Ipv4Addr>().unwrap());
        assert_eq!(link.high_addr, "10.255.192.3".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn test_pair_order_does_not_matter() {
        let mut map = P2pLinkAllocationMap::new(net("10.255.192.0/20"));
        let ab = map.assert_pair(2, 1).unwrap();
        let ba = map.assert_pair(1, 2).unwrap();
        assert_eq!(ab, ba);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_low_id_gets_low_address() {
        let mut map = P2pLinkAllocationMap::new(net("10.255.192.0/20"));
        let link = map.assert_pair(7, 3).unwrap();
        let pair = PeerPair::new(7, 3);
        let (local, remote) = link.addresses_for(pair, 3);
        assert_eq!(local, link.low_addr);
        assert_eq!(remote, link.high_addr);
        let (local, remote) = link.addresses_for(pair, 7);
        assert_eq!(local, link.high_addr);
        assert_eq!(remote, link.low_addr);
    }

    #[test]
    fn test_links_consumed_in_order() {
        let mut map = P2pLinkAllocationMap::new(net("10.255.192.0/20"));
        let first = map.assert_pair(1, 2).unwrap();
        let second = map.assert_pair(1, 3).unwrap();
        let third = map.assert_pair(2, 3).unwrap();
        assert_eq!(first.network, net("10.255.192.2/31"));
        assert_eq!(second.network, net("10.255.192.4/31"));
        assert_eq!(third.network, net("10.255.192.6/31"));
    }

    #[test]
    fn test_subnet_exhaustion() {
        let mut map = P2pLinkAllocationMap::new(net("10.255.192.0/30"));
        assert!(map.assert_pair(1, 2).is_ok());
        assert!(map.assert_pair(1, 3).is_err());
    }

    #[test]
    fn test_port_indexer() {
        let mut ports = PortIndexer::new();
        assert_eq!(ports.assign(1, 3).unwrap(), 0);
        assert_eq!(ports.assign(1, 3).unwrap(), 1);
        assert_eq!(ports.assign(2, 3).unwrap(), 0);
        assert_eq!(ports.assign(1, 3).unwrap(), 2);
        assert!(ports.assign(1, 3).is_err());
    }

    #[test]
    fn test_peer_port_mapping() {
        assert_eq!(peer_port(DEFAULT_PEER_PORT_BASE, 0), 63450);
        assert_eq!(peer_port(DEFAULT_PEER_PORT_BASE, 2), 63452);
    }
}
