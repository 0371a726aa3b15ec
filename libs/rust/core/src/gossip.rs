//! Degree-ranked gossip dissemination.
//!
//! - Targets are the first `fanout` entries of the registry's candidate order
//! - A confirmed delivery bumps the target's degree exactly once
//! - A failed delivery leaves the target untouched (liveness handles failures)
//! - Peers that announced they are behind get the envelope on top of `fanout`
//! - So do the round's train-set members, which otherwise wait on a peer whose
//!   degree never ranks them among its targets
//!
//! Successful peers accumulate degree and keep being picked, so efficient paths
//! reinforce themselves without a separate topology manager.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::envelope::{ModelEnvelope, PeerId};
use crate::error::Result;
use crate::registry::NeighborRegistry;
use crate::telemetry::METRICS;
use crate::transport::Transport;
use crate::wire::WireMessage;

#[derive(Debug, Default, Clone)]
pub struct GossipStats {
    pub published: u64,
    pub delivered: u64,
    pub failed: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PropagationReport {
    pub delivered: Vec<PeerId>,
    pub failed: Vec<PeerId>,
}

pub struct GossipDisseminator {
    node_id: PeerId,
    registry: Arc<NeighborRegistry>,
    transport: Arc<dyn Transport>,
    stats: RwLock<GossipStats>,
}

impl GossipDisseminator {
    pub fn new(node_id: impl Into<PeerId>, registry: Arc<NeighborRegistry>, transport: Arc<dyn Transport>) -> Self {
        Self { node_id: node_id.into(), registry, transport, stats: RwLock::new(GossipStats::default()) }
    }

    /// Active candidates ranked by degree, local node excluded.
    pub fn candidates(&self) -> Vec<PeerId> {
        let exclude: HashSet<PeerId> = [self.node_id.clone()].into_iter().collect();
        self.registry.candidates(&exclude)
    }

    /// Up to `fanout` targets; under-supply returns everything available.
    pub fn select_targets(&self, fanout: usize) -> Vec<PeerId> { self.candidates().into_iter().take(fanout).collect() }

    pub async fn propagate(&self, envelope: &ModelEnvelope, fanout: usize) -> Result<PropagationReport> {
        self.propagate_to(envelope, fanout, &[]).await
    }

    /// As [`propagate`](Self::propagate), plus every active peer in `members`.
    pub async fn propagate_to(&self, envelope: &ModelEnvelope, fanout: usize, members: &[PeerId]) -> Result<PropagationReport> {
        let mut targets = self.select_targets(fanout);
        let active = self.registry.active_peers();
        let extra = self.registry.behind_peers().into_iter().chain(members.iter().filter(|p| active.contains(*p)).cloned());
        for peer in extra {
            if peer != self.node_id && !targets.contains(&peer) { targets.push(peer); }
        }
        let bytes = WireMessage::Update { envelope: envelope.into() }.encode()?;
        self.stats.write().published += 1;
        let report = self.deliver(&targets, bytes, true).await;
        debug!(version=envelope.version(), delivered=report.delivered.len(), failed=report.failed.len(), "envelope_propagated");
        Ok(report)
    }

    /// Control frames (votes, status); degrees are not touched.
    pub async fn broadcast(&self, msg: &WireMessage, peers: &[PeerId]) -> Result<PropagationReport> {
        let bytes = msg.encode()?;
        Ok(self.deliver(peers, bytes, false).await)
    }

    pub async fn send_to(&self, peer: &str, msg: &WireMessage) -> Result<()> { self.transport.send(peer, msg.encode()?).await }

    async fn deliver(&self, targets: &[PeerId], bytes: Vec<u8>, counts_as_exchange: bool) -> PropagationReport {
        let sends = targets.iter().map(|peer| {
            let bytes = bytes.clone();
            async move { (peer.clone(), self.transport.send(peer, bytes).await) }
        });
        let mut report = PropagationReport::default();
        for (peer, res) in join_all(sends).await {
            match res {
                Ok(()) => {
                    if counts_as_exchange {
                        self.registry.record_interaction(&peer);
                        METRICS.gossip_delivered.add(1, &[]);
                    }
                    report.delivered.push(peer);
                }
                Err(e) => {
                    if counts_as_exchange { METRICS.gossip_failed.add(1, &[]); }
                    warn!(%peer, error=%e, "gossip_delivery_failed");
                    report.failed.push(peer);
                }
            }
        }
        if counts_as_exchange {
            let mut st = self.stats.write();
            st.delivered += report.delivered.len() as u64;
            st.failed += report.failed.len() as u64;
        }
        report
    }

    pub fn stats(&self) -> GossipStats { self.stats.read().clone() }
    pub fn registry(&self) -> &Arc<NeighborRegistry> { &self.registry }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::PeerStatus;
    use crate::transport::InMemoryNetwork;

    fn setup(peers: &[&str]) -> (InMemoryNetwork, GossipDisseminator, Vec<crate::transport::Inbox>) {
        let net = InMemoryNetwork::new();
        let (tx, _own) = net.join("self");
        let registry = Arc::new(NeighborRegistry::new());
        let mut inboxes = Vec::new();
        for p in peers {
            let (_t, rx) = net.join(p);
            inboxes.push(rx);
            registry.add_peer(p);
        }
        (net, GossipDisseminator::new("self", registry, tx), inboxes)
    }

    #[test]
    fn under_supply_returns_all() {
        let (_net, g, _in) = setup(&["a", "b"]);
        assert_eq!(g.select_targets(5).len(), 2);
        assert_eq!(g.select_targets(1).len(), 1);
    }

    #[tokio::test]
    async fn success_bumps_degree_failure_does_not() {
        let (net, g, _in) = setup(&["a", "b", "c"]);
        g.registry().record_interaction("c");
        net.set_down("b", true);
        let env = ModelEnvelope::new("self", 1, 1.0, vec![0; 4]).unwrap();
        let report = g.propagate(&env, 3).await.unwrap();
        assert_eq!(report.failed, vec!["b".to_string()]);
        assert_eq!(g.registry().degree("a"), 1);
        assert_eq!(g.registry().degree("b"), 0);
        assert_eq!(g.registry().degree("c"), 2);
        assert_eq!(g.select_targets(1), vec!["c".to_string()]);
        assert_eq!(g.stats().delivered, 2);
    }

    #[tokio::test]
    async fn behind_peers_get_extra_push() {
        let (_net, g, mut inboxes) = setup(&["a", "b", "c"]);
        g.registry().record_interaction("a");
        g.registry().set_behind("c", true);
        g.registry().mark_status("b", PeerStatus::Suspected).unwrap();
        let env = ModelEnvelope::new("self", 2, 1.0, vec![]).unwrap();
        let report = g.propagate(&env, 1).await.unwrap();
        assert_eq!(report.delivered, vec!["a".to_string(), "c".to_string()]);
        assert!(inboxes[2].try_recv().is_ok());
        assert!(inboxes[1].try_recv().is_err());
    }

    #[tokio::test]
    async fn train_set_members_reached_beyond_fanout() {
        let (_net, g, mut inboxes) = setup(&["a", "b", "c", "d"]);
        for p in ["a", "b"] { g.registry().record_interaction(p); }
        g.registry().mark_status("c", PeerStatus::Failed).unwrap();
        let env = ModelEnvelope::new("self", 0, 1.0, vec![]).unwrap();
        let members: Vec<PeerId> = ["self", "a", "c", "d"].iter().map(|s| s.to_string()).collect();
        let report = g.propagate_to(&env, 1, &members).await.unwrap();
        assert_eq!(report.delivered, vec!["a".to_string(), "d".to_string()]);
        assert!(inboxes[3].try_recv().is_ok());
        assert!(inboxes[1].try_recv().is_err());
        assert!(inboxes[2].try_recv().is_err());
        assert_eq!(g.registry().degree("d"), 1);
    }
}
