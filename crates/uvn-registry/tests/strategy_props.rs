use proptest::prelude::*;
use std::collections::BTreeSet;
use uvn_network::P2pLinkAllocationMap;
use uvn_registry::{DeploymentStrategy, StrategyInput, StrategyKind};

fn run(
    kind: StrategyKind,
    peers: &BTreeSet<u16>,
    privates: &BTreeSet<u16>,
    seed: u64,
) -> Result<uvn_registry::P2pLinksMap, uvn_registry::RegistryError> {
    let mut args = serde_yaml::Mapping::new();
    args.insert("seed".into(), seed.into());
    let mut alloc = P2pLinkAllocationMap::new("10.255.192.0/20".parse().unwrap());
    DeploymentStrategy::new(kind).deploy(
        StrategyInput {
            peers,
            private_peers: privates,
            args: &args,
        },
        &mut alloc,
    )
}

fn peer_sets() -> impl Strategy<Value = (BTreeSet<u16>, BTreeSet<u16>)> {
    prop::collection::btree_set(1u16..40, 2..12).prop_flat_map(|peers| {
        let peers_vec: Vec<u16> = peers.iter().copied().collect();
        let len = peers_vec.len();
        // Keep at least one public peer.
        prop::collection::vec(any::<bool>(), len).prop_map(move |mask| {
            let mut privates = BTreeSet::new();
            for (peer, private) in peers_vec.iter().zip(&mask) {
                if *private {
                    privates.insert(*peer);
                }
            }
            if privates.len() == peers_vec.len() {
                privates.remove(&peers_vec[0]);
            }
            (peers_vec.iter().copied().collect(), privates)
        })
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    // Property 2: every deployment map is symmetric with shared /31s.
    #[test]
    fn prop_maps_are_symmetric((peers, privates) in peer_sets(), seed in any::<u64>()) {
        for kind in [StrategyKind::FullMesh, StrategyKind::Circular, StrategyKind::Crossed] {
            let map = run(kind, &peers, &privates, seed).unwrap();
            prop_assert!(map.is_symmetric());
        }
    }

    // Property 5: with at least one public peer (and two peers total),
    // every public peer ends up with at least one neighbor.
    #[test]
    fn prop_public_peers_are_connected((peers, privates) in peer_sets(), seed in any::<u64>()) {
        for kind in [StrategyKind::FullMesh, StrategyKind::Circular, StrategyKind::Crossed] {
            let map = run(kind, &peers, &privates, seed).unwrap();
            if peers.len() - privates.len() >= 2 || !privates.is_empty() {
                for peer in peers.iter().filter(|p| !privates.contains(p)) {
                    prop_assert!(
                        map.degree(*peer) >= 1,
                        "{} degree 0 under {:?}",
                        peer,
                        kind
                    );
                }
            }
        }
    }

    // No strategy ever links two private peers directly.
    #[test]
    fn prop_no_private_private_links((peers, privates) in peer_sets(), seed in any::<u64>()) {
        for kind in [
            StrategyKind::FullMesh,
            StrategyKind::Circular,
            StrategyKind::Crossed,
            StrategyKind::Random,
        ] {
            let map = run(kind, &peers, &privates, seed).unwrap();
            for pair in map.edges() {
                prop_assert!(
                    !(privates.contains(&pair.low()) && privates.contains(&pair.high())),
                    "private pair {:?} linked under {:?}",
                    pair,
                    kind
                );
            }
        }
    }

    // Private peers always hang off exactly one public peer in ring
    // strategies.
    #[test]
    fn prop_ring_private_leaves((peers, privates) in peer_sets(), seed in any::<u64>()) {
        let map = run(StrategyKind::Circular, &peers, &privates, seed).unwrap();
        for private in &privates {
            prop_assert_eq!(map.degree(*private), 1);
        }
    }
}
