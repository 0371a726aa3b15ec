//! The per-node round loop.
//!
//! A round is: train → vote → open round → submit own envelope → propagate →
//! collect until ready or deadline → finalize → apply → checkpoint. Frames from
//! the transport and liveness events are served while voting and collecting.
//! Checkpoint I/O is spawned so a stalled store never holds up a round.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::aggregator::{DeadlineAction, RoundOutput, RoundPhase, StalenessAggregator};
use crate::checkpoint::{CheckpointKind, CheckpointManager, CheckpointStore, DistributionReport, HolderSelector, NodeSnapshot};
use crate::config::ProtocolConfig;
use crate::election::TrainSetElection;
use crate::envelope::{ModelEnvelope, ModelParameters, PeerId, Round};
use crate::error::{Result, SwarmError};
use crate::gossip::GossipDisseminator;
use crate::recovery::{RecoveryOrchestrator, RecoveryOutcome, RecoveryTier, RemoteCheckpointSource};
use crate::registry::{LivenessEvent, NeighborRegistry, PeerStatus};
use crate::transport::{Inbox, Transport};
use crate::wire::{SyncStatus, WireMessage};

#[async_trait]
pub trait Learner: Send + Sync {
    /// Trains from `model` on local data. Returns the encoded trained
    /// parameters and the sample weight they carry.
    async fn train_locally(&self, model: &ModelParameters) -> Result<(Vec<u8>, f64)>;

    /// Folds an aggregated payload into `model`.
    fn apply(&self, model: &mut ModelParameters, payload: &[u8]) -> Result<()>;
}

/// Shared view of a running node, readable from health handlers.
#[derive(Debug)]
pub struct NodeStatus {
    node_id: PeerId,
    round: AtomicU64,
    behind: AtomicBool,
    running: AtomicBool,
    storage_exhausted: AtomicBool,
    last_recovery: RwLock<Option<RecoveryTier>>,
    last_output: RwLock<Option<Arc<RoundOutput>>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusView {
    pub node_id: PeerId,
    pub round: Round,
    pub sync: SyncStatus,
    pub running: bool,
    pub storage_exhausted: bool,
    pub last_recovery: Option<RecoveryTier>,
    pub last_round_partial: Option<bool>,
    pub last_round_contributors: Option<usize>,
}

impl NodeStatus {
    fn new(node_id: PeerId) -> Self {
        Self {
            node_id,
            round: AtomicU64::new(0),
            behind: AtomicBool::new(false),
            running: AtomicBool::new(false),
            storage_exhausted: AtomicBool::new(false),
            last_recovery: RwLock::new(None),
            last_output: RwLock::new(None),
        }
    }

    pub fn node_id(&self) -> &str { &self.node_id }
    pub fn round(&self) -> Round { self.round.load(Ordering::SeqCst) }
    pub fn sync(&self) -> SyncStatus { if self.behind.load(Ordering::SeqCst) { SyncStatus::Behind } else { SyncStatus::Synced } }
    pub fn is_running(&self) -> bool { self.running.load(Ordering::SeqCst) }
    pub fn storage_exhausted(&self) -> bool { self.storage_exhausted.load(Ordering::SeqCst) }
    pub fn last_recovery(&self) -> Option<RecoveryTier> { *self.last_recovery.read() }
    pub fn last_output(&self) -> Option<Arc<RoundOutput>> { self.last_output.read().clone() }

    pub fn view(&self) -> StatusView {
        let last = self.last_output();
        StatusView {
            node_id: self.node_id.clone(),
            round: self.round(),
            sync: self.sync(),
            running: self.is_running(),
            storage_exhausted: self.storage_exhausted(),
            last_recovery: self.last_recovery(),
            last_round_partial: last.as_ref().map(|o| o.partial),
            last_round_contributors: last.as_ref().map(|o| o.contributions.len()),
        }
    }
}

/// Everything a node is wired from.
pub struct NodeParts {
    pub experiment: String,
    pub node_id: PeerId,
    pub protocol: ProtocolConfig,
    pub neighbors: Vec<PeerId>,
    pub transport: Arc<dyn Transport>,
    pub inbox: Inbox,
    pub liveness: mpsc::Receiver<LivenessEvent>,
    pub store: Arc<dyn CheckpointStore>,
    pub remote_source: Arc<dyn RemoteCheckpointSource>,
    pub holder_selector: Box<dyn HolderSelector>,
    pub learner: Arc<dyn Learner>,
    pub initial_model: ModelParameters,
}

#[derive(Debug, PartialEq, Eq)]
enum Pumped { Handled, TimedOut }

pub struct LearningNode {
    id: PeerId,
    cfg: ProtocolConfig,
    registry: Arc<NeighborRegistry>,
    gossip: Arc<GossipDisseminator>,
    aggregator: StalenessAggregator,
    checkpoints: Arc<CheckpointManager>,
    recovery: RecoveryOrchestrator,
    learner: Arc<dyn Learner>,
    election: TrainSetElection,
    inbox: Inbox,
    inbox_open: bool,
    liveness: mpsc::Receiver<LivenessEvent>,
    liveness_open: bool,
    model: ModelParameters,
    round: Round,
    remote_lane: Arc<AsyncMutex<()>>,
    status: Arc<NodeStatus>,
}

impl LearningNode {
    pub fn new(parts: NodeParts) -> Self {
        let id = parts.node_id;
        let registry = Arc::new(NeighborRegistry::new());
        for peer in parts.neighbors.iter().filter(|p| **p != id) { registry.add_peer(peer); }
        let gossip = Arc::new(GossipDisseminator::new(id.clone(), registry.clone(), parts.transport));
        let checkpoints = Arc::new(
            CheckpointManager::new(parts.experiment, id.clone(), parts.store, &parts.protocol).with_selector(parts.holder_selector),
        );
        let recovery = RecoveryOrchestrator::new(checkpoints.clone(), gossip.clone(), parts.remote_source, parts.initial_model.len());
        Self {
            aggregator: StalenessAggregator::new(id.clone(), &parts.protocol),
            status: Arc::new(NodeStatus::new(id.clone())),
            id,
            cfg: parts.protocol,
            registry,
            gossip,
            checkpoints,
            recovery,
            learner: parts.learner,
            election: TrainSetElection::new(),
            inbox: parts.inbox,
            inbox_open: true,
            liveness: parts.liveness,
            liveness_open: true,
            model: parts.initial_model,
            round: 0,
            remote_lane: Arc::new(AsyncMutex::new(())),
        }
    }

    pub fn id(&self) -> &str { &self.id }
    pub fn round(&self) -> Round { self.round }
    pub fn model(&self) -> &ModelParameters { &self.model }
    pub fn status(&self) -> Arc<NodeStatus> { self.status.clone() }
    pub fn registry(&self) -> &Arc<NeighborRegistry> { &self.registry }
    pub fn gossip(&self) -> &Arc<GossipDisseminator> { &self.gossip }
    pub fn checkpoints(&self) -> Arc<CheckpointManager> { self.checkpoints.clone() }
    pub fn aggregator(&self) -> &StalenessAggregator { &self.aggregator }

    /// Runs rounds until `shutdown` flips to true. Only permanent storage
    /// exhaustion ends the loop with an error.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.status.running.store(true, Ordering::SeqCst);
        info!(node=%self.id, round=self.round, "round_loop_started");
        let res = loop {
            if *shutdown.borrow() { break Ok(()); }
            tokio::select! {
                res = self.run_round() => {
                    if let Err(e) = res { warn!(node=%self.id, round=self.round, error=%e, "round_failed"); }
                }
                _ = shutdown.changed() => break Ok(()),
            }
            if self.status.storage_exhausted() {
                error!(node=%self.id, round=self.round, "round_loop_halted_storage_exhausted");
                break Err(SwarmError::StorageExhausted(format!("checkpoint store of {} is full", self.id)));
            }
        };
        self.status.running.store(false, Ordering::SeqCst);
        info!(node=%self.id, round=self.round, "round_loop_stopped");
        res
    }

    pub async fn run_rounds(&mut self, rounds: u64) -> Result<Vec<Arc<RoundOutput>>> {
        let mut out = Vec::with_capacity(rounds as usize);
        for _ in 0..rounds {
            out.push(self.run_round().await?);
            if self.status.storage_exhausted() {
                return Err(SwarmError::StorageExhausted(format!("checkpoint store of {} is full", self.id)));
            }
        }
        Ok(out)
    }

    pub async fn run_round(&mut self) -> Result<Arc<RoundOutput>> {
        // a round interrupted by shutdown is closed by finalizing it early
        if matches!(self.aggregator.phase(), Some(p) if p != RoundPhase::Finalized) {
            self.aggregator.finalize()?;
        }
        let round = self.round;
        let own = self.train(round).await;
        let train_set = self.elect(round).await;
        self.aggregator.begin_round(round, train_set.clone())?;
        if let Some(envelope) = own {
            if let Err(e) = self.aggregator.submit(envelope.clone()) { warn!(node=%self.id, round, error=%e, "own_envelope_rejected"); }
            self.spawn_propagate(envelope, &train_set);
        }
        self.seed_from_cache(round, &train_set);
        let output = self.collect().await?;
        self.finish_round(&output, &train_set).await;
        // a node without peers never waits on anything; let spawned checkpoint work run
        tokio::task::yield_now().await;
        Ok(output)
    }

    /// Restores state after a failure and marks the node `behind` until its
    /// next finalized round.
    pub async fn rejoin(&mut self, target_round: Round) -> RecoveryOutcome {
        let outcome = self.recovery.rejoin(target_round).await;
        if !outcome.snapshot.parameters.is_empty() { self.model = outcome.snapshot.parameters.clone(); }
        self.round = target_round;
        self.status.round.store(target_round, Ordering::SeqCst);
        self.status.behind.store(true, Ordering::SeqCst);
        *self.status.last_recovery.write() = Some(outcome.tier);
        outcome
    }

    async fn train(&mut self, round: Round) -> Option<Arc<ModelEnvelope>> {
        let (payload, weight) = match self.learner.train_locally(&self.model).await {
            Ok(v) => v,
            Err(e) => {
                warn!(node=%self.id, round, error=%e, "local_training_failed");
                return None;
            }
        };
        if let Ok(params) = ModelParameters::from_bytes(&payload) { self.model = params; }
        self.spawn_checkpoint(CheckpointKind::Local, self.snapshot(round, Vec::new()));
        match ModelEnvelope::new(self.id.clone(), round, weight, payload) {
            Ok(env) => Some(Arc::new(env)),
            Err(e) => {
                warn!(node=%self.id, round, error=%e, "local_envelope_invalid");
                None
            }
        }
    }

    async fn elect(&mut self, round: Round) -> BTreeSet<PeerId> {
        let size = self.cfg.train_set_size.max(1);
        let ballot = TrainSetElection::ballot(&self.id, &self.gossip.candidates(), size);
        self.election.record(&self.id, round, ballot.clone());
        let voters: Vec<PeerId> = self.registry.active_peers().into_iter().collect();
        if let Err(e) = self.gossip.broadcast(&WireMessage::Vote { round, candidates: ballot }, &voters).await {
            warn!(node=%self.id, round, error=%e, "vote_broadcast_failed");
        }
        let deadline = Instant::now() + self.cfg.voting_timeout();
        while !self.election.complete(round, &self.registry.active_peers()) {
            if self.pump(deadline).await == Pumped::TimedOut {
                debug!(node=%self.id, round, "voting_timed_out");
                break;
            }
        }
        let mut eligible = self.registry.active_peers();
        eligible.insert(self.id.clone());
        let train_set = self.election.tally(&self.id, &eligible, size);
        debug!(node=%self.id, round, train_set=?train_set, "train_set_elected");
        train_set
    }

    /// Envelopes that arrived before this round opened.
    fn seed_from_cache(&self, round: Round, train_set: &BTreeSet<PeerId>) {
        for peer in train_set.iter().filter(|p| **p != self.id) {
            if let Some(env) = self.registry.last_model(peer).filter(|e| e.version() >= round) {
                if self.aggregator.submit(env).is_ok() { debug!(node=%self.id, %peer, round, "cached_envelope_submitted"); }
            }
        }
    }

    async fn collect(&mut self) -> Result<Arc<RoundOutput>> {
        let mut deadline = Instant::now() + self.cfg.aggregation_timeout();
        loop {
            if self.aggregator.is_ready() { return self.aggregator.finalize(); }
            if self.pump(deadline).await == Pumped::TimedOut {
                match self.aggregator.on_deadline(&self.registry.non_active_peers())? {
                    DeadlineAction::Finalized(out) => return Ok(out),
                    DeadlineAction::Grace(d) => deadline = Instant::now() + d,
                }
            }
        }
    }

    async fn finish_round(&mut self, output: &Arc<RoundOutput>, train_set: &BTreeSet<PeerId>) {
        let round = output.round;
        let members: Vec<PeerId> = train_set.iter().cloned().collect();
        if let Some(params) = &output.parameters {
            if let Err(e) = self.learner.apply(&mut self.model, &params.to_bytes()) {
                warn!(node=%self.id, round, error=%e, "aggregate_apply_failed");
            }
            self.spawn_checkpoint(CheckpointKind::Aggregated, NodeSnapshot { round, parameters: params.clone(), train_set: members.clone() });
        }
        let finished = self.snapshot(round, members);
        self.spawn_checkpoint(CheckpointKind::RoundFinished, finished.clone());
        if self.cfg.checkpoint_due(round) { self.spawn_remote_checkpoint(finished); }
        self.spawn_retention();

        *self.status.last_output.write() = Some(output.clone());
        if self.status.sync() == SyncStatus::Behind {
            self.status.behind.store(false, Ordering::SeqCst);
            let peers: Vec<PeerId> = self.registry.active_peers().into_iter().collect();
            if let Err(e) = self.gossip.broadcast(&WireMessage::Status { sync: SyncStatus::Synced }, &peers).await {
                warn!(node=%self.id, error=%e, "synced_announcement_failed");
            }
            info!(node=%self.id, round, "caught_up");
        }
        self.round = round + 1;
        self.status.round.store(self.round, Ordering::SeqCst);
    }

    /// Serves one inbound frame or liveness event, or reports the deadline.
    async fn pump(&mut self, deadline: Instant) -> Pumped {
        tokio::select! {
            frame = self.inbox.recv(), if self.inbox_open => {
                match frame {
                    Some((from, bytes)) => self.handle_frame(&from, &bytes),
                    None => {
                        warn!(node=%self.id, "transport_inbox_closed");
                        self.inbox_open = false;
                    }
                }
                Pumped::Handled
            }
            event = self.liveness.recv(), if self.liveness_open => {
                match event {
                    Some(ev) => self.handle_liveness(ev),
                    None => self.liveness_open = false,
                }
                Pumped::Handled
            }
            _ = sleep_until(deadline) => Pumped::TimedOut,
        }
    }

    pub fn handle_frame(&mut self, from: &str, bytes: &[u8]) {
        let msg = match WireMessage::decode(bytes) {
            Ok(m) => m,
            Err(e) => {
                warn!(node=%self.id, %from, error=%e, "frame_dropped");
                return;
            }
        };
        match msg {
            WireMessage::Update { envelope } => match ModelEnvelope::try_from(envelope) {
                Ok(env) => self.accept_envelope(from, Arc::new(env)),
                Err(e) => warn!(node=%self.id, %from, error=%e, "envelope_invalid"),
            },
            WireMessage::Vote { round, candidates } => self.election.record(from, round, candidates),
            WireMessage::Status { sync } => {
                debug!(node=%self.id, peer=%from, ?sync, "peer_sync_status");
                self.registry.set_behind(from, sync == SyncStatus::Behind);
            }
            WireMessage::Checkpoint { owner, record } => {
                if owner != from {
                    warn!(node=%self.id, %from, %owner, "checkpoint_owner_mismatch");
                    return;
                }
                let checkpoints = self.checkpoints.clone();
                let gossip = self.gossip.clone();
                let status = self.status.clone();
                tokio::spawn(async move {
                    let round = record.round;
                    match checkpoints.accept_remote(&owner, record).await {
                        Ok(()) => {
                            if let Err(e) = gossip.send_to(&owner, &WireMessage::CheckpointAck { round }).await {
                                debug!(%owner, round, error=%e, "checkpoint_ack_failed");
                            }
                        }
                        Err(e) => checkpoint_failed(&status, "accept_remote", e),
                    }
                });
            }
            WireMessage::CheckpointAck { round } => self.checkpoints.confirm_holder(from, round),
        }
    }

    fn accept_envelope(&mut self, from: &str, envelope: Arc<ModelEnvelope>) {
        if envelope.sender_id() != from {
            warn!(node=%self.id, %from, sender=envelope.sender_id(), "envelope_sender_mismatch");
            return;
        }
        self.registry.update_last_model(from, envelope.clone());
        let open = matches!(self.aggregator.phase(), Some(p) if p != RoundPhase::Finalized);
        if !open && self.aggregator.current_round().map_or(true, |r| envelope.version() > r) {
            debug!(node=%self.id, %from, version=envelope.version(), "envelope_cached_for_next_round");
            return;
        }
        // rejections are logged by the aggregator
        let _ = self.aggregator.submit(envelope);
    }

    pub fn handle_liveness(&mut self, event: LivenessEvent) {
        if event.peer == self.id { return; }
        if let Err(e) = self.registry.apply(&event) {
            warn!(node=%self.id, peer=%event.peer, error=%e, "liveness_event_ignored");
            return;
        }
        if event.status != PeerStatus::Active { self.election.forget(&event.peer); }
        let mut alive = self.registry.active_peers();
        alive.insert(self.id.clone());
        let still: BTreeSet<PeerId> = self.aggregator.train_set().intersection(&alive).cloned().collect();
        self.aggregator.sync_train_set(&still);
    }

    fn snapshot(&self, round: Round, train_set: Vec<PeerId>) -> NodeSnapshot {
        NodeSnapshot { round, parameters: self.model.clone(), train_set }
    }

    fn spawn_propagate(&self, envelope: Arc<ModelEnvelope>, train_set: &BTreeSet<PeerId>) {
        let gossip = self.gossip.clone();
        let fanout = self.cfg.fanout;
        let members: Vec<PeerId> = train_set.iter().cloned().collect();
        tokio::spawn(async move {
            if let Err(e) = gossip.propagate_to(&envelope, fanout, &members).await {
                warn!(version=envelope.version(), error=%e, "propagation_failed");
            }
        });
    }

    fn spawn_checkpoint(&self, kind: CheckpointKind, snapshot: NodeSnapshot) {
        let checkpoints = self.checkpoints.clone();
        let status = self.status.clone();
        tokio::spawn(async move {
            let res = match snapshot.encode() {
                Ok(bytes) => checkpoints.save(kind, snapshot.round, bytes).await.map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = res { checkpoint_failed(&status, kind.as_str(), e); }
        });
    }

    /// Remote saves are serialized so each delta is built on the previous head.
    fn spawn_remote_checkpoint(&self, snapshot: NodeSnapshot) {
        let checkpoints = self.checkpoints.clone();
        let gossip = self.gossip.clone();
        let status = self.status.clone();
        let lane = self.remote_lane.clone();
        tokio::spawn(async move {
            let _turn = lane.lock().await;
            let round = snapshot.round;
            let res: Result<DistributionReport> = async {
                checkpoints.save(CheckpointKind::Remote, round, snapshot.encode()?).await?;
                checkpoints.distribute(round, &gossip).await
            }.await;
            match res {
                Ok(report) => debug!(round, holders=report.full.len() + report.delta.len(), "remote_checkpoint_cycle_done"),
                Err(e) => checkpoint_failed(&status, "remote", e),
            }
        });
    }

    /// Shares the remote lane so pruning never races a delta being built.
    fn spawn_retention(&self) {
        let checkpoints = self.checkpoints.clone();
        let status = self.status.clone();
        let lane = self.remote_lane.clone();
        tokio::spawn(async move {
            let _turn = lane.lock().await;
            if let Err(e) = checkpoints.enforce_retention().await { checkpoint_failed(&status, "retention", e); }
        });
    }
}

fn checkpoint_failed(status: &NodeStatus, what: &str, err: SwarmError) {
    if err.is_recoverable() {
        warn!(node=%status.node_id, what, error=%err, "checkpoint_io_failed");
    } else {
        error!(node=%status.node_id, what, error=%err, "checkpoint_storage_exhausted");
        status.storage_exhausted.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{DistantPeers, MemoryStore};
    use crate::recovery::StoreDirectory;
    use crate::transport::InMemoryNetwork;

    struct Shift(f32);

    #[async_trait]
    impl Learner for Shift {
        async fn train_locally(&self, model: &ModelParameters) -> Result<(Vec<u8>, f64)> {
            Ok((ModelParameters(model.0.iter().map(|v| v + self.0).collect()).to_bytes(), 1.0))
        }
        fn apply(&self, model: &mut ModelParameters, payload: &[u8]) -> Result<()> {
            *model = ModelParameters::from_bytes(payload)?;
            Ok(())
        }
    }

    fn protocol() -> ProtocolConfig {
        ProtocolConfig { voting_timeout_ms: 50, aggregation_timeout_ms: 200, grace_period_ms: 100, checkpoint_interval: 1, ..ProtocolConfig::default() }
    }

    fn node(net: &InMemoryNetwork, id: &str, peers: &[&str], store: Arc<MemoryStore>) -> (LearningNode, mpsc::Sender<LivenessEvent>) {
        node_with(net, id, peers, store, protocol())
    }

    fn node_with(net: &InMemoryNetwork, id: &str, peers: &[&str], store: Arc<MemoryStore>, cfg: ProtocolConfig) -> (LearningNode, mpsc::Sender<LivenessEvent>) {
        let (transport, inbox) = net.join(id);
        let (tx, rx) = mpsc::channel(16);
        let node = LearningNode::new(NodeParts {
            experiment: "exp".into(),
            node_id: id.into(),
            protocol: cfg,
            neighbors: peers.iter().map(|p| p.to_string()).collect(),
            transport,
            inbox,
            liveness: rx,
            store,
            remote_source: Arc::new(StoreDirectory::new()),
            holder_selector: Box::new(DistantPeers),
            learner: Arc::new(Shift(1.0)),
            initial_model: ModelParameters::zeros(2),
        });
        (node, tx)
    }

    #[tokio::test(start_paused = true)]
    async fn lone_node_finalizes_its_own_update() {
        let net = InMemoryNetwork::new();
        let (mut n, _live) = node(&net, "a", &[], Arc::new(MemoryStore::new()));
        let out = n.run_round().await.unwrap();
        assert_eq!(out.round, 0);
        assert!(!out.partial);
        assert_eq!(out.parameters, Some(ModelParameters(vec![1.0, 1.0])));
        assert_eq!(n.round(), 1);
        assert_eq!(n.status().round(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_costs_one_grace_period() {
        let net = InMemoryNetwork::new();
        let (mut n, _live) = node(&net, "a", &["b"], Arc::new(MemoryStore::new()));
        let _b = net.join("b");
        let out = n.run_round().await.unwrap();
        assert!(out.partial);
        assert_eq!(out.missing, vec!["b".to_string()]);
        assert_eq!(out.contributions.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_peer_leaves_train_set_without_grace() {
        let net = InMemoryNetwork::new();
        let (mut n, live) = node(&net, "a", &["b"], Arc::new(MemoryStore::new()));
        let _b = net.join("b");
        live.send(LivenessEvent { peer: "b".into(), status: PeerStatus::Failed }).await.unwrap();
        let started = Instant::now();
        let out = n.run_round().await.unwrap();
        assert!(!out.partial);
        assert!(started.elapsed() < protocol().aggregation_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_store_stops_the_loop() {
        let net = InMemoryNetwork::new();
        let (n, _live) = node(&net, "a", &[], Arc::new(MemoryStore::with_capacity(4)));
        let (_tx, rx) = watch::channel(false);
        let err = n.run(rx).await.unwrap_err();
        assert!(!err.is_recoverable());
    }

    #[tokio::test(start_paused = true)]
    async fn rejoin_marks_behind_until_next_round() {
        let net = InMemoryNetwork::new();
        let (mut n, _live) = node(&net, "a", &[], Arc::new(MemoryStore::new()));
        let outcome = n.rejoin(7).await;
        assert_eq!(outcome.tier, RecoveryTier::Fresh);
        assert_eq!(n.status().sync(), SyncStatus::Behind);
        assert_eq!(n.status().last_recovery(), Some(RecoveryTier::Fresh));
        let out = n.run_round().await.unwrap();
        assert_eq!(out.round, 7);
        assert_eq!(n.status().sync(), SyncStatus::Synced);
    }

    #[tokio::test(start_paused = true)]
    async fn holder_acknowledges_only_stored_records() {
        let net = InMemoryNetwork::new();
        let (mut n, _live) = node(&net, "a", &["b"], Arc::new(MemoryStore::new()));
        let (_b, mut b_inbox) = net.join("b");
        let owner = CheckpointManager::new("exp", "b", Arc::new(MemoryStore::new()), &protocol());
        let r3 = owner.save(CheckpointKind::Remote, 3, vec![1, 2, 3]).await.unwrap();
        n.handle_frame("b", &WireMessage::Checkpoint { owner: "b".into(), record: r3 }.encode().unwrap());
        let (from, bytes) = b_inbox.recv().await.unwrap();
        assert_eq!(from, "a");
        assert!(matches!(WireMessage::decode(&bytes).unwrap(), WireMessage::CheckpointAck { round: 3 }));
        assert_eq!(n.checkpoints().remote_chain("b", 3).await.unwrap().len(), 1);

        // round 9 is a delta on round 6, which a never received
        owner.save(CheckpointKind::Remote, 6, vec![1, 2, 4]).await.unwrap();
        let r9 = owner.save(CheckpointKind::Remote, 9, vec![1, 2, 5]).await.unwrap();
        n.handle_frame("b", &WireMessage::Checkpoint { owner: "b".into(), record: r9 }.encode().unwrap());
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(b_inbox.try_recv().is_err());
        assert_eq!(n.checkpoints().remote_chain("b", 9).await.unwrap()[0].round, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn finished_rounds_prune_old_checkpoints() {
        let net = InMemoryNetwork::new();
        let store = Arc::new(MemoryStore::new());
        let cfg = ProtocolConfig { checkpoint_retention: 2, ..protocol() };
        let (mut n, _live) = node_with(&net, "a", &[], store.clone(), cfg);
        n.run_rounds(6).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        for kind in [CheckpointKind::Local, CheckpointKind::RoundFinished] {
            let kept = store.rounds("exp", "a", kind).await.unwrap();
            assert!(kept.len() <= 3 && kept.contains(&5), "{kind}: {kept:?}");
        }
    }
}
