use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use swarm_learning::{
    clear_ready, init_tracing, load_config, mark_not_live, mark_ready, start_health_server, CheckpointKind, DistantPeers, LearningNode,
    ModelParameters, NodeParts, Round, SledStore,
};

mod learner;
mod liveness;
mod nats;

use learner::DriftLearner;
use nats::{NatsCheckpointSource, NatsTransport, Subjects};

const SERVICE: &str = "learning-node";

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing(SERVICE)?;
    let cfg = load_config(SERVICE)?;
    info!(target: "learning-node", nats_url=%cfg.nats_url, node_id=%cfg.node_id, experiment=%cfg.experiment, "Starting learning-node service");

    let nc = async_nats::connect(cfg.nats_url.clone()).await?;
    let subjects = Subjects::new(&cfg.subject_prefix, &cfg.experiment);
    let (transport, inbox) = NatsTransport::start(nc.clone(), subjects.clone(), cfg.node_id.clone()).await?;
    let (live_tx, live_rx) = mpsc::channel(256);
    liveness::spawn(nc.clone(), subjects.clone(), cfg.node_id.clone(), cfg.heartbeat(), live_tx).await?;

    let store = Arc::new(SledStore::open(&cfg.store_path)?);
    let query_timeout = cfg.heartbeat() * 2;
    let mut node = LearningNode::new(NodeParts {
        experiment: cfg.experiment.clone(),
        node_id: cfg.node_id.clone(),
        protocol: cfg.protocol.clone(),
        neighbors: Vec::new(),
        transport,
        inbox,
        liveness: live_rx,
        store,
        remote_source: Arc::new(NatsCheckpointSource::new(nc.clone(), subjects.clone(), query_timeout)),
        holder_selector: Box::new(DistantPeers),
        learner: Arc::new(DriftLearner::new(cfg.model_dim, 0.3, Duration::from_millis(200))),
        initial_model: ModelParameters::zeros(cfg.model_dim),
    });
    start_health_server(cfg.health_port, node.status()).await?;
    nats::serve_checkpoints(nc.clone(), subjects, cfg.node_id.clone(), node.checkpoints()).await?;

    // resume after a restart, or at an explicit round after losing local state
    let explicit: Option<Round> = std::env::var("SWARM_REJOIN_ROUND").ok().and_then(|v| v.parse().ok());
    let resume = match explicit {
        Some(r) => Some(r),
        None => node.checkpoints().latest_round(CheckpointKind::RoundFinished, Round::MAX).await?.map(|r| r + 1),
    };
    if let Some(target) = resume {
        // give presence a beat so remote holders are known
        tokio::time::sleep(cfg.heartbeat() * 2).await;
        let outcome = node.rejoin(target).await;
        info!(tier=outcome.tier.as_str(), restored_round=?outcome.restored_round, target, "node_rejoined");
    }

    mark_ready();
    let (stop_tx, stop_rx) = watch::channel(false);
    let mut round_loop = tokio::spawn(node.run(stop_rx));
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("shutdown_signal_received"),
        res = &mut round_loop => {
            mark_not_live();
            clear_ready();
            warn!(?res, "round_loop_exited");
            res??;
            return Ok(());
        }
    }
    clear_ready();
    let _ = stop_tx.send(true);
    round_loop.await??;
    Ok(())
}
