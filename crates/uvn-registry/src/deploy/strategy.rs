//! Deployment strategies: turn a peer set into a backbone graph.
//!
//! The strategy set is a closed enum; selection dispatches exhaustively.
//! Every strategy excludes direct links between two private peers: a
//! private peer can only reach the backbone through a public one.

use crate::deploy::{build_links_map, P2pLinksMap};
use crate::error::{RegistryError, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uvn_network::{P2pLinkAllocationMap, PeerPair};

const DEFAULT_MIN_EDGES: usize = 1;
const DEFAULT_OK_EDGES: usize = 2;
const DEFAULT_MAX_EDGES: usize = 3;
const DEFAULT_ATTEMPTS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Static,
    FullMesh,
    Circular,
    Crossed,
    Random,
}

impl StrategyKind {
    pub fn parse(value: &str) -> std::result::Result<Self, uvn_types::InputError> {
        match value.to_lowercase().as_str() {
            "static" => Ok(StrategyKind::Static),
            "full_mesh" | "full-mesh" => Ok(StrategyKind::FullMesh),
            "circular" => Ok(StrategyKind::Circular),
            "crossed" => Ok(StrategyKind::Crossed),
            "random" => Ok(StrategyKind::Random),
            other => Err(uvn_types::InputError::UnknownStrategy(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Static => "static",
            StrategyKind::FullMesh => "full_mesh",
            StrategyKind::Circular => "circular",
            StrategyKind::Crossed => "crossed",
            StrategyKind::Random => "random",
        }
    }

    /// Whether an all-private peer set yields an empty deployment instead
    /// of an error.
    pub fn allows_private_peers(&self) -> bool {
        matches!(self, StrategyKind::Static | StrategyKind::FullMesh)
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyState {
    Created,
    Deploying,
    Deployed,
    Failed,
}

pub struct StrategyInput<'a> {
    pub peers: &'a BTreeSet<u16>,
    pub private_peers: &'a BTreeSet<u16>,
    pub args: &'a serde_yaml::Mapping,
}

/// A single deployment run. Not reusable after it reaches a terminal state.
pub struct DeploymentStrategy {
    kind: StrategyKind,
    state: StrategyState,
}

impl DeploymentStrategy {
    pub fn new(kind: StrategyKind) -> Self {
        Self {
            kind,
            state: StrategyState::Created,
        }
    }

    pub fn kind(&self) -> StrategyKind {
        self.kind
    }

    pub fn state(&self) -> StrategyState {
        self.state
    }

    /// Compute the peer graph and pin its /31 links in `network_map`.
    pub fn deploy(
        &mut self,
        input: StrategyInput<'_>,
        network_map: &mut P2pLinkAllocationMap,
    ) -> Result<P2pLinksMap> {
        if self.state != StrategyState::Created {
            return Err(RegistryError::Deployment(format!(
                "strategy {} already ran",
                self.kind
            )));
        }
        self.state = StrategyState::Deploying;
        let result = self
            .compute_edges(&input)
            .and_then(|edges| build_links_map(input.peers, &edges, network_map));
        self.state = match &result {
            Ok(_) => StrategyState::Deployed,
            Err(_) => StrategyState::Failed,
        };
        result
    }

    fn compute_edges(&self, input: &StrategyInput<'_>) -> Result<BTreeSet<PeerPair>> {
        if !input.private_peers.is_subset(input.peers) {
            return Err(RegistryError::Input(
                "private peers must be a subset of peers".to_string(),
            ));
        }
        let publics: Vec<u16> = input
            .peers
            .iter()
            .copied()
            .filter(|p| !input.private_peers.contains(p))
            .collect();
        let privates: Vec<u16> = input.private_peers.iter().copied().collect();

        if publics.is_empty() && !privates.is_empty() {
            return if self.kind.allows_private_peers() {
                Ok(BTreeSet::new())
            } else {
                Err(RegistryError::Deployment(format!(
                    "strategy {} needs at least one public peer",
                    self.kind
                )))
            };
        }

        let mut rng = rng_from_args(input.args);
        match self.kind {
            StrategyKind::Static => static_edges(input),
            StrategyKind::FullMesh => Ok(full_mesh_edges(input.peers, input.private_peers)),
            StrategyKind::Circular => Ok(ring_edges(publics, privates, &mut rng, false)),
            StrategyKind::Crossed => Ok(ring_edges(publics, privates, &mut rng, true)),
            StrategyKind::Random => random_edges(input, publics, &mut rng),
        }
    }
}

fn rng_from_args(args: &serde_yaml::Mapping) -> StdRng {
    match arg_u64(args, "seed") {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

fn arg_u64(args: &serde_yaml::Mapping, key: &str) -> Option<u64> {
    args.get(key).and_then(|v| v.as_u64())
}

fn is_private(privates: &BTreeSet<u16>, peer: u16) -> bool {
    privates.contains(&peer)
}

/// STATIC: the author's explicit adjacency list.
///
/// The list is auto-symmetrized, so writing one direction is enough;
/// unknown peer ids and private-to-private links are rejected.
fn static_edges(input: &StrategyInput<'_>) -> Result<BTreeSet<PeerPair>> {
    let value = input.args.get("peers_map").ok_or_else(|| {
        RegistryError::Input("static strategy requires a peers_map argument".to_string())
    })?;
    let peers_map: Vec<(u16, Vec<u16>)> = serde_yaml::from_value(value.clone())
        .map_err(|e| RegistryError::Input(format!("malformed peers_map: {}", e)))?;

    let mut edges = BTreeSet::new();
    for (peer, neighbors) in peers_map {
        if !input.peers.contains(&peer) {
            return Err(RegistryError::Input(format!(
                "peers_map references unknown peer {}",
                peer
            )));
        }
        for neighbor in neighbors {
            if !input.peers.contains(&neighbor) {
                return Err(RegistryError::Input(format!(
                    "peers_map references unknown peer {}",
                    neighbor
                )));
            }
            if neighbor == peer {
                return Err(RegistryError::Input(format!(
                    "peers_map links {} to itself",
                    peer
                )));
            }
            if is_private(input.private_peers, peer) && is_private(input.private_peers, neighbor) {
                return Err(RegistryError::Deployment(format!(
                    "peers_map links private peers {} and {}",
                    peer, neighbor
                )));
            }
            edges.insert(PeerPair::new(peer, neighbor));
        }
    }
    Ok(edges)
}

/// FULL_MESH: complete graph minus private-to-private edges.
fn full_mesh_edges(peers: &BTreeSet<u16>, privates: &BTreeSet<u16>) -> BTreeSet<PeerPair> {
    let all: Vec<u16> = peers.iter().copied().collect();
    let mut edges = BTreeSet::new();
    for (i, a) in all.iter().enumerate() {
        for b in all.iter().skip(i + 1) {
            if is_private(privates, *a) && is_private(privates, *b) {
                continue;
            }
            edges.insert(PeerPair::new(*a, *b));
        }
    }
    edges
}

/// CIRCULAR / CROSSED: public peers in a shuffled ring, private peers
/// distributed round-robin as leaves. CROSSED additionally links each
/// public peer to the one across the ring (offset n/2).
fn ring_edges(
    mut publics: Vec<u16>,
    mut privates: Vec<u16>,
    rng: &mut StdRng,
    crossed: bool,
) -> BTreeSet<PeerPair> {
    publics.shuffle(rng);
    privates.shuffle(rng);

    let mut edges = BTreeSet::new();
    let n = publics.len();
    if n == 2 {
        edges.insert(PeerPair::new(publics[0], publics[1]));
    } else if n >= 3 {
        for i in 0..n {
            edges.insert(PeerPair::new(publics[i], publics[(i + 1) % n]));
        }
        if crossed {
            let offset = n / 2;
            for i in 0..n {
                let across = if i < offset { (i + offset) % n } else { i - offset };
                if across != i {
                    edges.insert(PeerPair::new(publics[i], publics[across]));
                }
            }
        }
    }

    for (j, private) in privates.iter().enumerate() {
        edges.insert(PeerPair::new(*private, publics[j % n.max(1)]));
    }
    edges
}

/// RANDOM: accumulate random spanning walks until every peer reaches its
/// target degree, or the attempt budget runs out.
///
/// The walk attaches each peer to a random already-visited peer (private
/// peers only through public ones), so every attempt yields a connected
/// spanning tree whose edges accumulate across attempts. The per-peer
/// target is `ok_edges` clamped by the peer's admissible neighbor count;
/// `min_edges` is enforced unclamped at the end.
fn random_edges(
    input: &StrategyInput<'_>,
    publics: Vec<u16>,
    rng: &mut StdRng,
) -> Result<BTreeSet<PeerPair>> {
    let min_edges = arg_u64(input.args, "min_edges").map(|v| v as usize).unwrap_or(DEFAULT_MIN_EDGES);
    let ok_edges = arg_u64(input.args, "ok_edges").map(|v| v as usize).unwrap_or(DEFAULT_OK_EDGES);
    let max_edges = arg_u64(input.args, "max_edges").map(|v| v as usize).unwrap_or(DEFAULT_MAX_EDGES);
    let attempts = arg_u64(input.args, "attempts").map(|v| v as usize).unwrap_or(DEFAULT_ATTEMPTS);

    if publics.is_empty() {
        return Ok(BTreeSet::new());
    }

    let peer_count = input.peers.len();
    let admissible_count = |peer: u16| -> usize {
        if is_private(input.private_peers, peer) {
            publics.len()
        } else {
            peer_count - 1
        }
    };
    let ok_target = |peer: u16| ok_edges.min(admissible_count(peer));

    let mut edges: BTreeSet<PeerPair> = BTreeSet::new();
    let degree = |edges: &BTreeSet<PeerPair>, peer: u16| -> usize {
        edges
            .iter()
            .filter(|pair| pair.low() == peer || pair.high() == peer)
            .count()
    };

    for _ in 0..attempts {
        let mut order: Vec<u16> = input.peers.iter().copied().collect();
        order.shuffle(rng);
        if let Some(first_public) = order.iter().position(|p| !is_private(input.private_peers, *p))
        {
            order.swap(0, first_public);
        }

        let mut visited: Vec<u16> = vec![order[0]];
        for &peer in &order[1..] {
            let candidates: Vec<u16> = visited
                .iter()
                .copied()
                .filter(|v| {
                    !(is_private(input.private_peers, *v) && is_private(input.private_peers, peer))
                })
                .collect();
            // Prefer attachment points that still have headroom.
            let under_max: Vec<u16> = candidates
                .iter()
                .copied()
                .filter(|c| degree(&edges, *c) < max_edges)
                .collect();
            let pool = if under_max.is_empty() { &candidates } else { &under_max };
            let target = pool[rng.gen_range(0..pool.len())];
            edges.insert(PeerPair::new(target, peer));
            visited.push(peer);
        }

        if input
            .peers
            .iter()
            .all(|p| degree(&edges, *p) >= ok_target(*p))
        {
            break;
        }
    }

    if let Some(short) = input
        .peers
        .iter()
        .find(|p| degree(&edges, **p) < min_edges)
    {
        return Err(RegistryError::Deployment(format!(
            "random strategy could not give peer {} at least {} links; \
             adjust min_edges/ok_edges or use the static strategy",
            short, min_edges
        )));
    }
    Ok(edges)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(v: &[u16]) -> BTreeSet<u16> {
        v.iter().copied().collect()
    }

    fn args_with_seed(seed: u64) -> serde_yaml::Mapping {
        let mut args = serde_yaml::Mapping::new();
        args.insert("seed".into(), seed.into());
        args
    }

    fn deploy(
        kind: StrategyKind,
        peers: &[u16],
        privates: &[u16],
        args: serde_yaml::Mapping,
    ) -> Result<P2pLinksMap> {
        let peers = ids(peers);
        let privates = ids(privates);
        let mut alloc = P2pLinkAllocationMap::new("10.255.192.0/20".parse().unwrap());
        let mut strategy = DeploymentStrategy::new(kind);
        strategy.deploy(
            StrategyInput {
                peers: &peers,
                private_peers: &privates,
                args: &args,
            },
            &mut alloc,
        )
    }

    #[test]
    fn test_state_machine() {
        let peers = ids(&[1, 2]);
        let privates = BTreeSet::new();
        let args = serde_yaml::Mapping::new();
        let mut alloc = P2pLinkAllocationMap::new("10.255.192.0/20".parse().unwrap());
        let mut strategy = DeploymentStrategy::new(StrategyKind::FullMesh);
        assert_eq!(strategy.state(), StrategyState::Created);
        strategy
            .deploy(
                StrategyInput {
                    peers: &peers,
                    private_peers: &privates,
                    args: &args,
                },
                &mut alloc,
            )
            .unwrap();
        assert_eq!(strategy.state(), StrategyState::Deployed);
        // A terminal strategy refuses to run again.
        assert!(strategy
            .deploy(
                StrategyInput {
                    peers: &peers,
                    private_peers: &privates,
                    args: &args,
                },
                &mut alloc,
            )
            .is_err());
    }

    #[test]
    fn test_full_mesh_excludes_private_pairs() {
        let map = deploy(
            StrategyKind::FullMesh,
            &[1, 2, 3, 4],
            &[3, 4],
            serde_yaml::Mapping::new(),
        )
        .unwrap();
        // 6 possible edges minus the private-private one.
        assert_eq!(map.link_count(), 5);
        assert!(map.is_symmetric());
        assert!(map.peers[&3].peers.get(&4).is_none());
    }

    #[test]
    fn test_circular_ring_degrees() {
        let map = deploy(
            StrategyKind::Circular,
            &[1, 2, 3, 4, 5],
            &[],
            args_with_seed(7),
        )
        .unwrap();
        assert!(map.is_symmetric());
        for id in 1..=5 {
            assert_eq!(map.degree(id), 2);
        }
    }

    #[test]
    fn test_circular_two_peers() {
        let map = deploy(StrategyKind::Circular, &[1, 2], &[], args_with_seed(7)).unwrap();
        assert_eq!(map.link_count(), 1);
        assert_eq!(map.degree(1), 1);
    }

    #[test]
    fn test_circular_distributes_private_leaves() {
        let map = deploy(
            StrategyKind::Circular,
            &[1, 2, 3, 4, 5, 6],
            &[4, 5, 6],
            args_with_seed(11),
        )
        .unwrap();
        // Each private peer is a leaf on exactly one public peer.
        for private in [4, 5, 6] {
            assert_eq!(map.degree(private), 1);
        }
        // Publics carry the ring (2) plus exactly one leaf each.
        for public in [1, 2, 3] {
            assert_eq!(map.degree(public), 3);
        }
    }

    #[test]
    fn test_crossed_adds_across_links() {
        let map = deploy(
            StrategyKind::Crossed,
            &[1, 2, 3, 4],
            &[],
            args_with_seed(3),
        )
        .unwrap();
        // Ring of 4 has 4 edges; the two across links bring it to 6.
        assert_eq!(map.link_count(), 6);
        for id in 1..=4 {
            assert_eq!(map.degree(id), 3);
        }
    }

    #[test]
    fn test_crossed_single_public_hub() {
        let map = deploy(
            StrategyKind::Crossed,
            &[1, 2, 3],
            &[2, 3],
            args_with_seed(3),
        )
        .unwrap();
        assert_eq!(map.degree(1), 2);
        assert_eq!(map.degree(2), 1);
        assert_eq!(map.degree(3), 1);
    }

    #[test]
    fn test_seeded_runs_are_reproducible() {
        let a = deploy(
            StrategyKind::Crossed,
            &[1, 2, 3, 4, 5],
            &[5],
            args_with_seed(42),
        )
        .unwrap();
        let b = deploy(
            StrategyKind::Crossed,
            &[1, 2, 3, 4, 5],
            &[5],
            args_with_seed(42),
        )
        .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_static_symmetrizes_and_validates() {
        let mut args = serde_yaml::Mapping::new();
        let peers_map: Vec<(u16, Vec<u16>)> = vec![(1, vec![2]), (2, vec![3])];
        args.insert("peers_map".into(), serde_yaml::to_value(peers_map).unwrap());
        let map = deploy(StrategyKind::Static, &[1, 2, 3], &[], args).unwrap();
        assert_eq!(map.link_count(), 2);
        assert!(map.is_symmetric());

        let mut bad = serde_yaml::Mapping::new();
        let peers_map: Vec<(u16, Vec<u16>)> = vec![(1, vec![9])];
        bad.insert("peers_map".into(), serde_yaml::to_value(peers_map).unwrap());
        assert!(deploy(StrategyKind::Static, &[1, 2, 3], &[], bad).is_err());
    }

    #[test]
    fn test_static_rejects_private_links() {
        let mut args = serde_yaml::Mapping::new();
        let peers_map: Vec<(u16, Vec<u16>)> = vec![(2, vec![3])];
        args.insert("peers_map".into(), serde_yaml::to_value(peers_map).unwrap());
        assert!(deploy(StrategyKind::Static, &[1, 2, 3], &[2, 3], args).is_err());
    }

    #[test]
    fn test_random_star_with_impossible_ok() {
        // One public hub, four private leaves, ok=3: only a star is
        // admissible, and it is accepted because ok is clamped by the
        // admissible degree.
        let mut args = args_with_seed(5);
        args.insert("ok_edges".into(), 3u64.into());
        let map = deploy(
            StrategyKind::Random,
            &[1, 2, 3, 4, 5],
            &[2, 3, 4, 5],
            args,
        )
        .unwrap();
        assert_eq!(map.degree(1), 4);
        for leaf in [2, 3, 4, 5] {
            assert_eq!(map.degree(leaf), 1);
        }
    }

    #[test]
    fn test_random_fails_when_min_unreachable() {
        let mut args = args_with_seed(5);
        args.insert("ok_edges".into(), 3u64.into());
        args.insert("min_edges".into(), 3u64.into());
        let result = deploy(
            StrategyKind::Random,
            &[1, 2, 3, 4, 5],
            &[2, 3, 4, 5],
            args,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_random_connects_everyone() {
        let map = deploy(
            StrategyKind::Random,
            &[1, 2, 3, 4, 5, 6, 7],
            &[6, 7],
            args_with_seed(23),
        )
        .unwrap();
        assert!(map.is_symmetric());
        for id in 1..=7 {
            assert!(map.degree(id) >= 1);
        }
        assert!(map.peers[&6].peers.get(&7).is_none());
    }

    #[test]
    fn test_all_private_peers() {
        // FULL_MESH tolerates an all-private set (empty deployment);
        // ring strategies refuse it.
        let empty = deploy(
            StrategyKind::FullMesh,
            &[1, 2],
            &[1, 2],
            serde_yaml::Mapping::new(),
        )
        .unwrap();
        assert_eq!(empty.link_count(), 0);
        assert!(deploy(StrategyKind::Circular, &[1, 2], &[1, 2], args_with_seed(1)).is_err());
    }
}
