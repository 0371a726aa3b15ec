//! Gossip-based decentralized training core.
//!
//! Each node trains locally, spreads its model to degree-ranked neighbors,
//! aggregates whatever it receives with staleness-decayed weights, and keeps
//! tiered checkpoints so it can rejoin after a failure.

pub mod aggregator;
pub mod checkpoint;
pub mod config;
pub mod election;
pub mod envelope;
pub mod error;
pub mod gossip;
pub mod health;
pub mod node;
pub mod recovery;
pub mod registry;
mod resilience;
pub mod telemetry;
pub mod transport;
pub mod wire;

pub use aggregator::{decay, effective_weight, staleness, AggregationMethod, Contribution, DeadlineAction, RoundOutput, RoundPhase, StalenessAggregator};
pub use checkpoint::{
    CheckpointKey, CheckpointKind, CheckpointManager, CheckpointRecord, CheckpointStore, DistantPeers, DistributionReport, HolderSelector,
    MemoryStore, NodeSnapshot, RandomSpread, SledStore,
};
pub use config::{load_config, NodeConfig, ProtocolConfig};
pub use envelope::{EnvelopeFrame, ModelEnvelope, ModelParameters, PeerId, Round};
pub use error::{Result, SwarmError};
pub use gossip::{GossipDisseminator, GossipStats, PropagationReport};
pub use health::{clear_ready, mark_not_live, mark_ready, start_health_server};
pub use node::{Learner, LearningNode, NodeParts, NodeStatus, StatusView};
pub use recovery::{RecoveryOrchestrator, RecoveryOutcome, RecoveryTier, RemoteCheckpointSource, StoreDirectory};
pub use registry::{LivenessEvent, NeighborEntry, NeighborRegistry, PeerStatus};
pub use resilience::{retry_async, RetryConfig};
pub use telemetry::{init_tracing, LearningMetrics, METRICS};
pub use transport::{InMemoryNetwork, InMemoryTransport, Inbound, Inbox, Transport};
pub use wire::{SyncStatus, WireMessage};
