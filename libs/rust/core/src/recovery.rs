//! Rejoin procedure for a node coming back from failure.
//!
//! Tiers are tried in order until one succeeds:
//! 1. local checkpoints (`local`, then `aggregated`, then `round_finished`)
//! 2. remote copies held by neighbors, newest reachable first
//! 3. a fresh default model, which cannot fail
//!
//! Whatever tier wins, the node then announces itself as `behind` to every
//! peer it previously knew as active, so they push fresher models to it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::checkpoint::{reconstruct_chain, CheckpointKind, CheckpointManager, CheckpointRecord, NodeSnapshot};
use crate::envelope::{ModelParameters, PeerId, Round};
use crate::error::{Result, SwarmError};
use crate::gossip::GossipDisseminator;
use crate::registry::PeerStatus;
use crate::resilience::{retry_async, RetryConfig};
use crate::telemetry::METRICS;
use crate::wire::{SyncStatus, WireMessage};

/// Where remote checkpoints are fetched from during recovery.
#[async_trait]
pub trait RemoteCheckpointSource: Send + Sync {
    /// Newest remote record `holder` keeps for `owner` at or before `up_to`,
    /// followed by its delta ancestors, newest first.
    async fn fetch_chain(&self, holder: &str, owner: &str, up_to: Round) -> Result<Vec<CheckpointRecord>>;
}

/// In-process directory of every node's checkpoint manager.
#[derive(Default)]
pub struct StoreDirectory {
    holders: RwLock<HashMap<PeerId, Arc<CheckpointManager>>>,
}

impl StoreDirectory {
    pub fn new() -> Self { Self::default() }
    pub fn register(&self, holder: &str, manager: Arc<CheckpointManager>) { self.holders.write().insert(holder.to_string(), manager); }
    pub fn unregister(&self, holder: &str) { self.holders.write().remove(holder); }
}

#[async_trait]
impl RemoteCheckpointSource for StoreDirectory {
    async fn fetch_chain(&self, holder: &str, owner: &str, up_to: Round) -> Result<Vec<CheckpointRecord>> {
        let manager = self.holders.read().get(holder).cloned()
            .ok_or_else(|| SwarmError::Transient(format!("holder {holder} unreachable")))?;
        manager.remote_chain(owner, up_to).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryTier { Local, Remote, Fresh }

impl RecoveryTier {
    pub fn as_str(self) -> &'static str {
        match self { RecoveryTier::Local => "local", RecoveryTier::Remote => "remote", RecoveryTier::Fresh => "fresh" }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryOutcome {
    pub tier: RecoveryTier,
    /// Round of the checkpoint restored; `None` after a fresh start.
    pub restored_round: Option<Round>,
    pub snapshot: NodeSnapshot,
    pub target_round: Round,
    pub reconnected: Vec<PeerId>,
    pub unreachable: Vec<PeerId>,
}

pub struct RecoveryOrchestrator {
    node_id: PeerId,
    checkpoints: Arc<CheckpointManager>,
    gossip: Arc<GossipDisseminator>,
    remote: Arc<dyn RemoteCheckpointSource>,
    retry: RetryConfig,
    model_dim: usize,
}

impl RecoveryOrchestrator {
    pub fn new(checkpoints: Arc<CheckpointManager>, gossip: Arc<GossipDisseminator>, remote: Arc<dyn RemoteCheckpointSource>, model_dim: usize) -> Self {
        Self { node_id: checkpoints.node_id().to_string(), checkpoints, gossip, remote, retry: RetryConfig::default(), model_dim }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self { self.retry = retry; self }

    /// Never fails; the outcome reports which tier restored the node.
    pub async fn rejoin(&self, target_round: Round) -> RecoveryOutcome {
        let (tier, snapshot) = match self.recover_local(target_round).await {
            Ok(s) => (RecoveryTier::Local, s),
            Err(local_err) => {
                info!(node=%self.node_id, error=%local_err, "local_recovery_unavailable");
                match self.recover_remote(target_round).await {
                    Ok(s) => (RecoveryTier::Remote, s),
                    Err(remote_err) => {
                        warn!(node=%self.node_id, error=%remote_err, "remote_recovery_unavailable_starting_fresh");
                        (RecoveryTier::Fresh, NodeSnapshot { round: target_round, parameters: ModelParameters::zeros(self.model_dim), train_set: Vec::new() })
                    }
                }
            }
        };
        let restored_round = (tier != RecoveryTier::Fresh).then_some(snapshot.round);
        let (reconnected, unreachable) = self.reconnect().await;
        METRICS.recoveries.add(1, &[KeyValue::new("tier", tier.as_str())]);
        info!(node=%self.node_id, tier=tier.as_str(), ?restored_round, target_round, reconnected=reconnected.len(), "recovery_tier_succeeded");
        RecoveryOutcome { tier, restored_round, snapshot, target_round, reconnected, unreachable }
    }

    async fn recover_local(&self, target_round: Round) -> Result<NodeSnapshot> {
        let last_completed = match self.checkpoints.latest_round(CheckpointKind::RoundFinished, target_round).await? {
            Some(r) => Some(r),
            None => {
                let local = self.checkpoints.latest_round(CheckpointKind::Local, target_round).await?;
                let aggregated = self.checkpoints.latest_round(CheckpointKind::Aggregated, target_round).await?;
                local.max(aggregated)
            }
        };
        let round = last_completed.ok_or_else(|| SwarmError::NotFound(format!("no local checkpoint for {} up to round {target_round}", self.node_id)))?;
        let mut last_err = None;
        for kind in [CheckpointKind::Local, CheckpointKind::Aggregated, CheckpointKind::RoundFinished] {
            match self.checkpoints.load(kind, round).await.and_then(|rec| NodeSnapshot::decode(&rec.state)) {
                Ok(snapshot) => {
                    info!(node=%self.node_id, %kind, round, "local_checkpoint_restored");
                    return Ok(snapshot);
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| SwarmError::NotFound(format!("round {round}"))))
    }

    async fn recover_remote(&self, target_round: Round) -> Result<NodeSnapshot> {
        let mut found: Vec<(PeerId, Vec<CheckpointRecord>)> = Vec::new();
        for holder in self.gossip.candidates() {
            match retry_async(&self.retry, |_| self.remote.fetch_chain(&holder, &self.node_id, target_round)).await {
                Ok(chain) if !chain.is_empty() => found.push((holder, chain)),
                Ok(_) => {}
                Err(e) => info!(node=%self.node_id, %holder, error=%e, "remote_checkpoint_query_failed"),
            }
        }
        // newest first; ties keep candidate (degree) order
        found.sort_by(|a, b| b.1[0].round.cmp(&a.1[0].round));
        let mut last_err = SwarmError::NotFound(format!("no holder has a remote checkpoint for {} up to round {target_round}", self.node_id));
        for (holder, mut chain) in found {
            // an unusable chain sends us back to the same holder for an older one
            loop {
                let round = chain[0].round;
                let ancestors: BTreeMap<Round, CheckpointRecord> = chain[1..].iter().map(|r| (r.round, r.clone())).collect();
                match reconstruct_chain(&chain[0], &ancestors).and_then(|state| NodeSnapshot::decode(&state)) {
                    Ok(snapshot) => {
                        info!(node=%self.node_id, %holder, round, "remote_checkpoint_restored");
                        return Ok(snapshot);
                    }
                    Err(e) => { warn!(node=%self.node_id, %holder, round, error=%e, "remote_checkpoint_unusable"); last_err = e; }
                }
                let Some(older) = round.checked_sub(1) else { break };
                match retry_async(&self.retry, |_| self.remote.fetch_chain(&holder, &self.node_id, older)).await {
                    Ok(c) if !c.is_empty() && c[0].round < round => chain = c,
                    _ => break,
                }
            }
        }
        Err(last_err)
    }

    /// Announces `behind` to the previously active neighbors.
    async fn reconnect(&self) -> (Vec<PeerId>, Vec<PeerId>) {
        let known: Vec<PeerId> = self.gossip.registry().snapshot().into_iter()
            .filter(|n| n.status == PeerStatus::Active && n.address != self.node_id)
            .map(|n| n.address)
            .collect();
        match self.gossip.broadcast(&WireMessage::Status { sync: SyncStatus::Behind }, &known).await {
            Ok(report) => (report.delivered, report.failed),
            Err(e) => { warn!(node=%self.node_id, error=%e, "behind_announcement_failed"); (Vec::new(), known) }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryStore;
    use crate::config::ProtocolConfig;
    use crate::registry::NeighborRegistry;
    use crate::transport::InMemoryNetwork;

    fn snapshot(round: Round, v: f32) -> NodeSnapshot { NodeSnapshot { round, parameters: ModelParameters(vec![v; 4]), train_set: vec![] } }

    struct Fixture {
        store: Arc<MemoryStore>,
        checkpoints: Arc<CheckpointManager>,
        orchestrator: RecoveryOrchestrator,
    }

    /// Serves a directory's chains with every record from round `from` on garbled.
    struct Garbling {
        inner: StoreDirectory,
        from: Round,
    }

    #[async_trait]
    impl RemoteCheckpointSource for Garbling {
        async fn fetch_chain(&self, holder: &str, owner: &str, up_to: Round) -> Result<Vec<CheckpointRecord>> {
            let mut chain = self.inner.fetch_chain(holder, owner, up_to).await?;
            for r in chain.iter_mut().filter(|r| r.round >= self.from) { r.digest = "garbled".into(); }
            Ok(chain)
        }
    }

    fn fixture(directory: Arc<dyn RemoteCheckpointSource>) -> Fixture {
        let net = InMemoryNetwork::new();
        let (tx, _in) = net.join("n");
        let registry = Arc::new(NeighborRegistry::new());
        registry.add_peer("h");
        let store = Arc::new(MemoryStore::new());
        let checkpoints = Arc::new(CheckpointManager::new("exp", "n", store.clone(), &ProtocolConfig::default()));
        let gossip = Arc::new(GossipDisseminator::new("n", registry, tx));
        let fast = RetryConfig { max_retries: 0, ..RetryConfig::default() };
        let orchestrator = RecoveryOrchestrator::new(checkpoints.clone(), gossip, directory, 4).with_retry(fast);
        Fixture { store, checkpoints, orchestrator }
    }

    #[tokio::test]
    async fn local_tier_falls_back_across_kinds() {
        let f = fixture(Arc::new(StoreDirectory::new()));
        f.checkpoints.save(CheckpointKind::RoundFinished, 6, snapshot(6, 6.0).encode().unwrap()).await.unwrap();
        f.checkpoints.save(CheckpointKind::Aggregated, 6, snapshot(6, 5.0).encode().unwrap()).await.unwrap();
        let out = f.orchestrator.rejoin(9).await;
        assert_eq!(out.tier, RecoveryTier::Local);
        assert_eq!(out.snapshot, snapshot(6, 5.0));
        assert_eq!(out.restored_round, Some(6));
    }

    #[tokio::test]
    async fn fresh_when_nothing_is_available() {
        let f = fixture(Arc::new(StoreDirectory::new()));
        f.store.set_unavailable(true);
        let out = f.orchestrator.rejoin(4).await;
        assert_eq!(out.tier, RecoveryTier::Fresh);
        assert_eq!(out.restored_round, None);
        assert_eq!(out.snapshot.parameters, ModelParameters::zeros(4));
        assert_eq!(out.snapshot.round, 4);
    }

    #[tokio::test]
    async fn remote_tier_uses_holder_copy() {
        let directory = Arc::new(StoreDirectory::new());
        let f = fixture(directory.clone());
        let holder = Arc::new(CheckpointManager::new("exp", "h", Arc::new(MemoryStore::new()), &ProtocolConfig::default()));
        directory.register("h", holder.clone());
        let r3 = f.checkpoints.save(CheckpointKind::Remote, 3, snapshot(3, 1.0).encode().unwrap()).await.unwrap();
        let r6 = f.checkpoints.save(CheckpointKind::Remote, 6, snapshot(6, 2.0).encode().unwrap()).await.unwrap();
        holder.accept_remote("n", r3).await.unwrap();
        holder.accept_remote("n", r6).await.unwrap();
        f.store.clear();
        let out = f.orchestrator.rejoin(8).await;
        assert_eq!(out.tier, RecoveryTier::Remote);
        assert_eq!(out.snapshot, snapshot(6, 2.0));
        assert_eq!(out.target_round, 8);
    }

    #[tokio::test]
    async fn unusable_chain_falls_back_to_older_copy_on_same_holder() {
        let source = Arc::new(Garbling { inner: StoreDirectory::new(), from: 6 });
        let f = fixture(source.clone());
        let holder = Arc::new(CheckpointManager::new("exp", "h", Arc::new(MemoryStore::new()), &ProtocolConfig::default()));
        source.inner.register("h", holder.clone());
        let r3 = f.checkpoints.save(CheckpointKind::Remote, 3, snapshot(3, 1.0).encode().unwrap()).await.unwrap();
        let r6 = f.checkpoints.save(CheckpointKind::Remote, 6, snapshot(6, 2.0).encode().unwrap()).await.unwrap();
        holder.accept_remote("n", r3).await.unwrap();
        holder.accept_remote("n", r6).await.unwrap();
        f.store.clear();
        let out = f.orchestrator.rejoin(8).await;
        assert_eq!(out.tier, RecoveryTier::Remote);
        assert_eq!(out.restored_round, Some(3));
        assert_eq!(out.snapshot, snapshot(3, 1.0));
    }
}
