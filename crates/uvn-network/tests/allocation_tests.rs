use ipnetwork::Ipv4Network;
use proptest::prelude::*;
use uvn_network::{P2pLinkAllocationMap, PeerPair, RootVpnPlan};

fn backbone() -> Ipv4Network {
    "10.255.192.0/20".parse().unwrap()
}

proptest! {
    #[test]
    fn prop_assert_pair_is_idempotent(pairs in prop::collection::vec((1u16..60, 1u16..60), 1..40)) {
        let mut map = P2pLinkAllocationMap::new(backbone());
        let mut recorded = Vec::new();
        for (a, b) in pairs.iter().copied().filter(|(a, b)| a != b) {
            recorded.push(((a, b), map.assert_pair(a, b).unwrap()));
        }
        // Re-asserting every pair in any order returns the pinned allocation.
        for ((a, b), alloc) in recorded.iter().rev() {
            prop_assert_eq!(map.assert_pair(*b, *a).unwrap(), *alloc);
        }
    }

    #[test]
    fn prop_links_never_overlap(pairs in prop::collection::vec((1u16..60, 1u16..60), 1..40)) {
        let mut map = P2pLinkAllocationMap::new(backbone());
        for (a, b) in pairs.iter().copied().filter(|(a, b)| a != b) {
            map.assert_pair(a, b).unwrap();
        }
        let networks: Vec<_> = map.iter().map(|(_, l)| l.network).collect();
        for (i, a) in networks.iter().enumerate() {
            for b in networks.iter().skip(i + 1) {
                prop_assert_ne!(a, b);
                prop_assert!(!a.contains(b.network()));
            }
        }
    }

    #[test]
    fn prop_low_peer_owns_even_address(a in 1u16..100, b in 1u16..100) {
        prop_assume!(a != b);
        let mut map = P2pLinkAllocationMap::new(backbone());
        let link = map.assert_pair(a, b).unwrap();
        let pair = PeerPair::new(a, b);
        let (low_local, _) = link.addresses_for(pair, pair.low());
        prop_assert_eq!(low_local, link.low_addr);
        prop_assert_eq!(u32::from(link.low_addr) % 2, 0);
        prop_assert_eq!(u32::from(link.high_addr), u32::from(link.low_addr) + 1);
    }

    #[test]
    fn prop_root_addresses_are_unique(ids in prop::collection::btree_set(1u16..200, 2..50)) {
        let plan = RootVpnPlan::new("10.255.128.0/22".parse().unwrap());
        let addrs: Vec<_> = ids.iter().map(|id| plan.cell_address(*id).unwrap()).collect();
        let mut deduped = addrs.clone();
        deduped.sort();
        deduped.dedup();
        prop_assert_eq!(addrs.len(), deduped.len());
    }
}
