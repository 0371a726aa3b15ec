//! Tracing setup and the opentelemetry instruments shared by the learning core.
//!
//! The library never installs an exporter; without one the global meter is a
//! no-op and recording is free.

use anyhow::Result;
use once_cell::sync::{Lazy, OnceCell};
use opentelemetry::metrics::{Counter, Histogram, Meter, Unit};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static TRACING_INIT: OnceCell<()> = OnceCell::new();

/// Installs the fmt subscriber once. `SWARM_JSON_LOG=1|true` switches to JSON lines.
pub fn init_tracing(service: &str) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| -> Result<()> {
        let json = std::env::var("SWARM_JSON_LOG").ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let registry = tracing_subscriber::registry().with(env_filter);
        if json {
            registry.with(tracing_subscriber::fmt::layer().json().flatten_event(true).with_current_span(true).with_span_list(false)).try_init()?;
        } else {
            registry.with(tracing_subscriber::fmt::layer().with_target(true).with_thread_ids(false).with_line_number(true)).try_init()?;
        }
        Ok(())
    })?;
    info!(target: "swarm_learning", %service, "tracing_initialized");
    Ok(())
}

static LEARNING_METER: Lazy<Meter> = Lazy::new(|| opentelemetry::global::meter("swarm_learning"));

#[derive(Clone, Debug)]
pub struct LearningMetrics {
    pub envelopes_accepted: Counter<u64>,
    pub envelopes_rejected: Counter<u64>,
    pub rounds_finalized: Counter<u64>,
    pub partial_rounds: Counter<u64>,
    pub aggregation_latency_ms: Histogram<f64>,
    pub gossip_delivered: Counter<u64>,
    pub gossip_failed: Counter<u64>,
    pub checkpoints_saved: Counter<u64>,
    pub checkpoints_distributed: Counter<u64>,
    pub recoveries: Counter<u64>,
}

pub static METRICS: Lazy<LearningMetrics> = Lazy::new(|| LearningMetrics {
    envelopes_accepted: LEARNING_METER.u64_counter("swarm_learning_envelopes_accepted_total")
        .with_description("Envelopes accepted into a round")
        .init(),
    envelopes_rejected: LEARNING_METER.u64_counter("swarm_learning_envelopes_rejected_total")
        .with_description("Envelopes dropped as protocol violations")
        .init(),
    rounds_finalized: LEARNING_METER.u64_counter("swarm_learning_rounds_finalized_total")
        .with_description("Rounds finalized")
        .init(),
    partial_rounds: LEARNING_METER.u64_counter("swarm_learning_partial_rounds_total")
        .with_description("Rounds finalized without every train-set member")
        .init(),
    aggregation_latency_ms: LEARNING_METER.f64_histogram("swarm_learning_round_duration_ms")
        .with_description("Time from round start to finalize (ms)")
        .with_unit(Unit::new("ms"))
        .init(),
    gossip_delivered: LEARNING_METER.u64_counter("swarm_learning_gossip_delivered_total")
        .with_description("Envelope deliveries confirmed by the transport")
        .init(),
    gossip_failed: LEARNING_METER.u64_counter("swarm_learning_gossip_failed_total")
        .with_description("Envelope deliveries that failed")
        .init(),
    checkpoints_saved: LEARNING_METER.u64_counter("swarm_learning_checkpoints_saved_total")
        .with_description("Checkpoint records persisted")
        .init(),
    checkpoints_distributed: LEARNING_METER.u64_counter("swarm_learning_checkpoints_distributed_total")
        .with_description("Remote checkpoint records delivered to holders")
        .init(),
    recoveries: LEARNING_METER.u64_counter("swarm_learning_recoveries_total")
        .with_description("Rejoin procedures completed, labelled by tier")
        .init(),
});
