//! Layered node configuration: defaults, optional file (`SWARM_CONFIG_FILE`),
//! then `SWARM__*` environment overrides.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::aggregator::AggregationMethod;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub aggregation_timeout_ms: u64,
    pub voting_timeout_ms: u64,
    /// Single extra wait after the aggregation deadline before forcing.
    pub grace_period_ms: u64,
    /// Remote checkpoint distribution every N rounds; 0 disables it.
    pub checkpoint_interval: u64,
    pub checkpoint_holders: usize,
    /// Records of each kind kept per owner, and deltas between full remote
    /// snapshots; 0 keeps everything.
    pub checkpoint_retention: usize,
    pub fanout: usize,
    pub train_set_size: usize,
    pub method: AggregationMethod,
    pub partial_aggregation: HashMap<AggregationMethod, bool>,
    /// Reject envelopes from the future instead of clamping their staleness.
    pub strict_versions: bool,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            aggregation_timeout_ms: 30_000,
            voting_timeout_ms: 5_000,
            grace_period_ms: 5_000,
            checkpoint_interval: 5,
            checkpoint_holders: 2,
            checkpoint_retention: 8,
            fanout: 4,
            train_set_size: 8,
            method: AggregationMethod::StalenessWeighted,
            partial_aggregation: HashMap::from([(AggregationMethod::StalenessWeighted, true), (AggregationMethod::FedAvg, false)]),
            strict_versions: false,
        }
    }
}

impl ProtocolConfig {
    pub fn aggregation_timeout(&self) -> Duration { Duration::from_millis(self.aggregation_timeout_ms) }
    pub fn voting_timeout(&self) -> Duration { Duration::from_millis(self.voting_timeout_ms) }
    pub fn grace_period(&self) -> Duration { Duration::from_millis(self.grace_period_ms) }

    pub fn partial_allowed(&self, method: AggregationMethod) -> bool {
        self.partial_aggregation.get(&method).copied().unwrap_or_else(|| method.supports_partial())
    }

    pub fn checkpoint_due(&self, round: u64) -> bool { self.checkpoint_interval > 0 && round > 0 && round % self.checkpoint_interval == 0 }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub experiment: String,
    pub node_id: String,
    pub nats_url: String,
    pub subject_prefix: String,
    pub health_port: u16,
    pub store_path: String,
    /// Length of the flat parameter vector every node trains.
    pub model_dim: usize,
    /// Presence announcements; a peer silent for 2× is suspected, 4× failed.
    pub heartbeat_ms: u64,
    pub protocol: ProtocolConfig,
}

impl NodeConfig {
    pub fn heartbeat(&self) -> Duration { Duration::from_millis(self.heartbeat_ms) }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            experiment: "default".into(),
            node_id: format!("node-{}", uuid::Uuid::new_v4().simple()),
            nats_url: "127.0.0.1:4222".into(),
            subject_prefix: "swarm.learning".into(),
            health_port: 8081,
            store_path: "./data/checkpoints".into(),
            model_dim: 16,
            heartbeat_ms: 2_000,
            protocol: ProtocolConfig::default(),
        }
    }
}

pub fn load_config(service: &str) -> Result<NodeConfig> {
    let defaults = NodeConfig::default();
    let mut builder = config::Config::builder()
        .set_default("experiment", service)?
        .set_default("node_id", defaults.node_id.clone())?;
    if let Ok(file) = std::env::var("SWARM_CONFIG_FILE") {
        builder = builder.add_source(config::File::with_name(&file).required(false));
    }
    builder = builder.add_source(config::Environment::with_prefix("SWARM").separator("__"));
    let cfg: NodeConfig = builder.build()?.try_deserialize()?;
    tracing::info!(experiment=%cfg.experiment, node_id=%cfg.node_id, fanout=cfg.protocol.fanout, "config_loaded");
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_lookup_per_method() {
        let cfg = ProtocolConfig::default();
        assert!(cfg.partial_allowed(AggregationMethod::StalenessWeighted));
        assert!(!cfg.partial_allowed(AggregationMethod::FedAvg));
        let empty = ProtocolConfig { partial_aggregation: HashMap::new(), ..ProtocolConfig::default() };
        assert!(empty.partial_allowed(AggregationMethod::StalenessWeighted));
    }

    #[test]
    fn checkpoint_interval() {
        let cfg = ProtocolConfig { checkpoint_interval: 3, ..ProtocolConfig::default() };
        assert!(!cfg.checkpoint_due(0));
        assert!(cfg.checkpoint_due(3));
        assert!(!cfg.checkpoint_due(4));
        assert!(!ProtocolConfig { checkpoint_interval: 0, ..cfg }.checkpoint_due(3));
    }

    #[test]
    fn loads_defaults_without_sources() {
        let cfg = load_config("unit-test").unwrap();
        assert!(cfg.node_id.starts_with("node-"));
        assert_eq!(cfg.protocol.fanout, ProtocolConfig::default().fanout);
    }
}
