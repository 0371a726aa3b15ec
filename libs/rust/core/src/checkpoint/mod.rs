//! Tiered checkpoints of aggregator + model state.
//!
//! Kinds: `local` (after local training), `aggregated` (after finalize),
//! `round_finished` (end of round) and `remote` (copies pushed to other peers,
//! delta-encoded against the previous remote copy). The receiving holder is the
//! authoritative source of a remote copy during recovery.
//!
//! A holder counts as having a round only once it acknowledged storing it, and
//! only such a round is used as the base of the delta it is sent next. Remote
//! chains restart from a full snapshot every `checkpoint_retention` deltas so
//! that pruning can drop the old chain.

pub mod delta;
pub mod holders;
pub mod store;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ProtocolConfig;
use crate::envelope::{ModelParameters, PeerId, Round};
use crate::error::{Result, SwarmError};
use crate::gossip::GossipDisseminator;
use crate::resilience::{retry_async, RetryConfig};
use crate::telemetry::METRICS;
use crate::wire::WireMessage;

pub use delta::{digest, reconstruct_chain, StateDelta};
pub use holders::{DistantPeers, HolderSelector, RandomSpread};
pub use store::{CheckpointKey, CheckpointStore, MemoryStore, SledStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind { Local, RoundFinished, Aggregated, Remote }

impl CheckpointKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CheckpointKind::Local => "local",
            CheckpointKind::RoundFinished => "round_finished",
            CheckpointKind::Aggregated => "aggregated",
            CheckpointKind::Remote => "remote",
        }
    }
}

impl fmt::Display for CheckpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub kind: CheckpointKind,
    pub round: Round,
    pub owner: PeerId,
    /// Round of the remote record this delta applies to; `None` means `state` is a full snapshot.
    pub base_round: Option<Round>,
    pub state: Vec<u8>,
    /// SHA-256 of the full state, checked after reconstruction.
    pub digest: String,
    pub created_at: i64,
}

impl CheckpointRecord {
    fn full(kind: CheckpointKind, round: Round, owner: &str, state: Vec<u8>) -> Self {
        Self { kind, round, owner: owner.to_string(), base_round: None, digest: digest(&state), state, created_at: chrono::Utc::now().timestamp_millis() }
    }

    pub fn is_delta(&self) -> bool { self.base_round.is_some() }
}

/// Serialized aggregator + model state carried inside checkpoint records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub round: Round,
    pub parameters: ModelParameters,
    pub train_set: Vec<PeerId>,
}

impl NodeSnapshot {
    pub fn encode(&self) -> Result<Vec<u8>> { Ok(serde_json::to_vec(self)?) }
    pub fn decode(bytes: &[u8]) -> Result<Self> { Ok(serde_json::from_slice(bytes)?) }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DistributionReport {
    pub round: Round,
    pub full: Vec<PeerId>,
    pub delta: Vec<PeerId>,
    pub failed: Vec<PeerId>,
}

#[derive(Debug, Clone)]
struct RemoteHead {
    round: Round,
    state: Arc<Vec<u8>>,
    full: CheckpointRecord,
    delta: Option<CheckpointRecord>,
}

#[derive(Debug, Default)]
struct RemoteChain {
    head: Option<RemoteHead>,
    /// Last remote round each holder confirmed receiving.
    holder_rounds: HashMap<PeerId, Round>,
    deltas_since_full: usize,
}

pub struct CheckpointManager {
    experiment: String,
    node_id: PeerId,
    store: Arc<dyn CheckpointStore>,
    selector: Box<dyn HolderSelector>,
    holders: usize,
    retention: usize,
    retry: RetryConfig,
    remote: Mutex<RemoteChain>,
    /// Other owners whose remote records this node holds.
    held: Mutex<BTreeSet<PeerId>>,
}

impl CheckpointManager {
    pub fn new(experiment: impl Into<String>, node_id: impl Into<PeerId>, store: Arc<dyn CheckpointStore>, cfg: &ProtocolConfig) -> Self {
        Self {
            experiment: experiment.into(),
            node_id: node_id.into(),
            store,
            selector: Box::new(DistantPeers),
            holders: cfg.checkpoint_holders,
            retention: cfg.checkpoint_retention,
            retry: RetryConfig::default(),
            remote: Mutex::new(RemoteChain::default()),
            held: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn with_selector(mut self, selector: Box<dyn HolderSelector>) -> Self { self.selector = selector; self }
    pub fn with_retry(mut self, retry: RetryConfig) -> Self { self.retry = retry; self }

    pub fn node_id(&self) -> &str { &self.node_id }

    /// Persists a record for this node. Remote records are delta-encoded
    /// against the previous remote record when one exists, unless the chain
    /// is due for a fresh full snapshot.
    pub async fn save(&self, kind: CheckpointKind, round: Round, state: Vec<u8>) -> Result<CheckpointRecord> {
        if kind != CheckpointKind::Remote {
            let record = CheckpointRecord::full(kind, round, &self.node_id, state);
            self.persist(&self.node_id, &record).await?;
            return Ok(record);
        }
        let full = CheckpointRecord::full(kind, round, &self.node_id, state);
        let delta = {
            let chain = self.remote.lock();
            let restart = self.retention > 0 && chain.deltas_since_full >= self.retention;
            chain.head.as_ref().filter(|h| h.round < round && !restart).map(|h| {
                let d = delta::encode(&h.state, &full.state);
                serde_json::to_vec(&d).map(|bytes| CheckpointRecord { base_round: Some(h.round), state: bytes, ..full.clone() })
            }).transpose()?
        };
        let stored = delta.clone().unwrap_or_else(|| full.clone());
        self.persist(&self.node_id, &stored).await?;
        let state = Arc::new(full.state.clone());
        let mut chain = self.remote.lock();
        let since_full = if delta.is_some() { chain.deltas_since_full + 1 } else { 0 };
        chain.deltas_since_full = since_full;
        chain.head = Some(RemoteHead { round, state, full, delta });
        Ok(stored)
    }

    async fn persist(&self, owner: &str, record: &CheckpointRecord) -> Result<()> {
        let key = CheckpointKey::new(&self.experiment, owner, record.round, record.kind);
        let bytes = serde_json::to_vec(record)?;
        retry_async(&self.retry, |_| self.store.put(&key, bytes.clone())).await?;
        METRICS.checkpoints_saved.add(1, &[]);
        debug!(%key, delta=record.is_delta(), size=bytes.len(), "checkpoint_saved");
        Ok(())
    }

    /// Pushes the remote checkpoint of `round` to holders picked by the
    /// selector. A holder gets the delta only if it acknowledged the delta's
    /// base; everyone else gets the full snapshot. A successful send is not an
    /// acknowledgement.
    pub async fn distribute(&self, round: Round, gossip: &GossipDisseminator) -> Result<DistributionReport> {
        let (head, known) = {
            let chain = self.remote.lock();
            let head = chain.head.clone().filter(|h| h.round == round)
                .ok_or_else(|| SwarmError::NotFound(format!("remote checkpoint {}/{round}", self.node_id)))?;
            (head, chain.holder_rounds.clone())
        };
        let neighbors: Vec<_> = gossip.registry().snapshot().into_iter().filter(|n| n.address != self.node_id).collect();
        let targets = self.selector.select(&neighbors, self.holders);
        let mut report = DistributionReport { round, ..Default::default() };
        for holder in targets {
            let record = match &head.delta {
                Some(d) if known.get(&holder).copied() == d.base_round => d.clone(),
                _ => head.full.clone(),
            };
            let is_delta = record.is_delta();
            match gossip.send_to(&holder, &WireMessage::Checkpoint { owner: self.node_id.clone(), record }).await {
                Ok(()) => {
                    METRICS.checkpoints_distributed.add(1, &[]);
                    if is_delta { report.delta.push(holder); } else { report.full.push(holder); }
                }
                Err(e) => { warn!(%holder, round, error=%e, "checkpoint_distribution_failed"); report.failed.push(holder); }
            }
        }
        info!(round, full=report.full.len(), delta=report.delta.len(), failed=report.failed.len(), "remote_checkpoint_distributed");
        Ok(report)
    }

    /// Records that `holder` stored this node's remote record of `round`.
    pub fn confirm_holder(&self, holder: &str, round: Round) {
        let mut chain = self.remote.lock();
        let known = chain.holder_rounds.entry(holder.to_string()).or_insert(round);
        if *known < round { *known = round; }
        debug!(%holder, round, "remote_checkpoint_acknowledged");
    }

    /// Stores a remote record pushed by `owner`; this node becomes a holder.
    /// A delta whose base is not held here is refused, so the owner keeps
    /// sending full snapshots until one is acknowledged.
    pub async fn accept_remote(&self, owner: &str, record: CheckpointRecord) -> Result<()> {
        if record.kind != CheckpointKind::Remote || record.owner != owner {
            return Err(SwarmError::ProtocolViolation(format!("{owner} pushed a {} record owned by {}", record.kind, record.owner)));
        }
        if let Some(base) = record.base_round {
            let key = CheckpointKey::new(&self.experiment, owner, base, CheckpointKind::Remote);
            if self.store.get(&key).await?.is_none() {
                warn!(%owner, round=record.round, base, "remote_delta_without_base_refused");
                return Err(SwarmError::ChainBroken { round: base, reason: format!("base of {owner}'s round {} is not held here", record.round) });
            }
        }
        self.persist(owner, &record).await?;
        if owner != self.node_id { self.held.lock().insert(owner.to_string()); }
        Ok(())
    }

    pub async fn load(&self, kind: CheckpointKind, round: Round) -> Result<CheckpointRecord> { self.load_for(&self.node_id, kind, round).await }

    pub async fn load_for(&self, node: &str, kind: CheckpointKind, round: Round) -> Result<CheckpointRecord> {
        let key = CheckpointKey::new(&self.experiment, node, round, kind);
        let bytes = retry_async(&self.retry, |_| self.store.get(&key)).await?
            .ok_or_else(|| SwarmError::NotFound(key.to_string()))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Newest stored round of `kind` for this node not after `up_to`.
    pub async fn latest_round(&self, kind: CheckpointKind, up_to: Round) -> Result<Option<Round>> {
        Ok(self.store.rounds(&self.experiment, &self.node_id, kind).await?.into_iter().filter(|r| *r <= up_to).max())
    }

    /// The newest remote record held for `owner` at or before `up_to` whose
    /// chain resolves, followed by every ancestor it needs, newest first.
    /// Records with a broken chain are skipped in favour of older ones.
    pub async fn remote_chain(&self, owner: &str, up_to: Round) -> Result<Vec<CheckpointRecord>> {
        let mut rounds: Vec<Round> = self.store.rounds(&self.experiment, owner, CheckpointKind::Remote).await?
            .into_iter().filter(|r| *r <= up_to).collect();
        rounds.sort_unstable_by(|a, b| b.cmp(a));
        let mut last_err = SwarmError::NotFound(format!("no remote checkpoint for {owner} up to round {up_to}"));
        for newest in rounds {
            let chain = match self.chain_from(owner, newest).await {
                Ok(c) => c,
                Err(e) if e.is_transient() || !e.is_recoverable() => return Err(e),
                Err(e) => { last_err = e; continue; }
            };
            let ancestors: BTreeMap<Round, CheckpointRecord> = chain[1..].iter().map(|r| (r.round, r.clone())).collect();
            match reconstruct_chain(&chain[0], &ancestors) {
                Ok(_) => return Ok(chain),
                Err(e) => {
                    warn!(%owner, round=newest, error=%e, "remote_chain_unresolvable_trying_older");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    async fn chain_from(&self, owner: &str, newest: Round) -> Result<Vec<CheckpointRecord>> {
        let mut chain = vec![self.load_for(owner, CheckpointKind::Remote, newest).await?];
        while let Some(base) = chain.last().and_then(|r| r.base_round) {
            match self.load_for(owner, CheckpointKind::Remote, base).await {
                Ok(rec) => chain.push(rec),
                // the caller's reconstruct reports the gap
                Err(SwarmError::NotFound(_)) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(chain)
    }

    /// Full state behind a remote record, resolving its delta chain from this
    /// node's store.
    pub async fn reconstruct(&self, record: &CheckpointRecord) -> Result<Vec<u8>> {
        let mut ancestors = BTreeMap::new();
        let mut next = record.base_round;
        while let Some(base) = next {
            if base >= record.round || ancestors.contains_key(&base) { break; }
            match self.load_for(&record.owner, CheckpointKind::Remote, base).await {
                Ok(rec) => { next = rec.base_round; ancestors.insert(base, rec); }
                Err(SwarmError::NotFound(_)) => break,
                Err(e) => return Err(e),
            }
        }
        reconstruct_chain(record, &ancestors)
    }

    /// Keeps the newest `keep_latest` records of `kind`. For remote records the
    /// bases of kept deltas are kept too.
    pub async fn prune(&self, kind: CheckpointKind, keep_latest: usize) -> Result<usize> {
        self.prune_for(&self.node_id, kind, keep_latest).await
    }

    pub async fn prune_for(&self, owner: &str, kind: CheckpointKind, keep_latest: usize) -> Result<usize> {
        let rounds = self.store.rounds(&self.experiment, owner, kind).await?;
        let cut = rounds.len().saturating_sub(keep_latest);
        let mut keep: Vec<Round> = rounds[cut..].to_vec();
        if kind == CheckpointKind::Remote {
            let mut i = 0;
            while i < keep.len() {
                match self.load_for(owner, kind, keep[i]).await {
                    Ok(rec) => if let Some(base) = rec.base_round { if !keep.contains(&base) { keep.push(base); } },
                    Err(SwarmError::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
                i += 1;
            }
        }
        let mut removed = 0;
        for r in rounds.into_iter().filter(|r| !keep.contains(r)) {
            self.store.delete(&CheckpointKey::new(&self.experiment, owner, r, kind)).await?;
            removed += 1;
        }
        debug!(%owner, %kind, removed, kept=keep.len(), "checkpoints_pruned");
        Ok(removed)
    }

    /// Prunes every kind of this node's records, and the remote records held
    /// for other owners, down to `checkpoint_retention`. Zero keeps everything.
    pub async fn enforce_retention(&self) -> Result<usize> {
        if self.retention == 0 { return Ok(0); }
        let mut removed = 0;
        for kind in [CheckpointKind::Local, CheckpointKind::Aggregated, CheckpointKind::RoundFinished, CheckpointKind::Remote] {
            removed += self.prune(kind, self.retention).await?;
        }
        let held: Vec<PeerId> = self.held.lock().iter().cloned().collect();
        for owner in held {
            removed += self.prune_for(&owner, CheckpointKind::Remote, self.retention).await?;
        }
        if removed > 0 { info!(removed, retention=self.retention, "checkpoint_retention_applied"); }
        Ok(removed)
    }
}
