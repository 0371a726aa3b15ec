//! Choosing which peers hold this node's remote checkpoints.
//!
//! Copies should land away from the node's busiest links, so that a failure
//! taking out one neighbourhood leaves a copy elsewhere. The policy is a trait;
//! the node picks one at construction.

use rand::{seq::IteratorRandom, thread_rng};

use crate::envelope::PeerId;
use crate::registry::{NeighborEntry, PeerStatus};

pub trait HolderSelector: Send + Sync {
    fn select(&self, neighbors: &[NeighborEntry], count: usize) -> Vec<PeerId>;
}

/// Active peers with the fewest interactions first, identifier ascending.
#[derive(Debug, Default, Clone, Copy)]
pub struct DistantPeers;

impl HolderSelector for DistantPeers {
    fn select(&self, neighbors: &[NeighborEntry], count: usize) -> Vec<PeerId> {
        let mut active: Vec<&NeighborEntry> = neighbors.iter().filter(|n| n.status == PeerStatus::Active).collect();
        active.sort_by(|a, b| a.degree.cmp(&b.degree).then_with(|| a.address.cmp(&b.address)));
        active.into_iter().take(count).map(|n| n.address.clone()).collect()
    }
}

/// Uniform sample over active peers.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomSpread;

impl HolderSelector for RandomSpread {
    fn select(&self, neighbors: &[NeighborEntry], count: usize) -> Vec<PeerId> {
        let mut rng = thread_rng();
        neighbors.iter().filter(|n| n.status == PeerStatus::Active).map(|n| n.address.clone()).choose_multiple(&mut rng, count)
    }
}
