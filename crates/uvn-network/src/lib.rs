pub mod allocator;
pub mod error;
pub mod links;

pub use allocator::{networks_overlap, ParticlesVpnPlan, RootVpnPlan};
pub use error::{NetworkError, Result};
pub use links::{
    peer_port, LinkAllocation, P2pLinkAllocationMap, PeerPair, PortIndexer,
    DEFAULT_PEER_PORT_BASE, DEFAULT_PEER_PORT_COUNT,
};
