//! Staleness-aware round aggregation.
//!
//! Per round the state machine is `collecting → ready → finalized`. Each
//! submission is weighted by `weight × 1/(1 + staleness)` and the result is the
//! weighted mean over the submissions actually received, so a stale or missing
//! contributor only loses its own share.
//!
//! The round state is mutated by the node's receive path and its deadline
//! timer only; a mutex around it is the whole synchronization story.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ProtocolConfig;
use crate::envelope::{ModelEnvelope, ModelParameters, PeerId, Round};
use crate::error::{Result, SwarmError};
use crate::telemetry::METRICS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationMethod {
    /// Contribution weight decayed by staleness.
    StalenessWeighted,
    /// Plain sample-weighted mean; staleness is reported but not applied.
    FedAvg,
}

impl AggregationMethod {
    pub fn supports_partial(self) -> bool { matches!(self, AggregationMethod::StalenessWeighted) }

    fn applies_decay(self) -> bool { matches!(self, AggregationMethod::StalenessWeighted) }
}

/// `current_round − version`, clamped at zero for envelopes from the future.
pub fn staleness(version: Round, current_round: Round) -> u64 { current_round.saturating_sub(version) }

pub fn decay(staleness: u64) -> f64 { 1.0 / (1.0 + staleness as f64) }

pub fn effective_weight(envelope: &ModelEnvelope, current_round: Round) -> f64 {
    envelope.weight() * decay(staleness(envelope.version(), current_round))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundPhase { Collecting, Ready, Finalized }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contribution {
    pub sender: PeerId,
    pub version: Round,
    pub weight: f64,
    pub staleness: u64,
    pub effective_weight: f64,
}

/// Authoritative, immutable result of a finalized round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundOutput {
    pub round: Round,
    /// `None` when nothing usable was submitted.
    pub parameters: Option<ModelParameters>,
    pub contributions: Vec<Contribution>,
    /// Finalized without every train-set member.
    pub partial: bool,
    /// Required peers that never contributed.
    pub missing: Vec<PeerId>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeadlineAction {
    Finalized(Arc<RoundOutput>),
    /// Wait this long once more, then call `on_deadline` again.
    Grace(Duration),
}

#[derive(Debug)]
struct RoundState {
    round: Round,
    phase: RoundPhase,
    train_set: BTreeSet<PeerId>,
    submissions: BTreeMap<PeerId, Arc<ModelEnvelope>>,
    started_at: Instant,
    grace_used: bool,
    output: Option<Arc<RoundOutput>>,
}

impl RoundState {
    fn missing(&self) -> Vec<PeerId> { self.train_set.iter().filter(|p| !self.submissions.contains_key(*p)).cloned().collect() }

    fn refresh_readiness(&mut self) {
        if self.phase == RoundPhase::Collecting && self.missing().is_empty() { self.phase = RoundPhase::Ready; }
    }
}

pub struct StalenessAggregator {
    node_id: PeerId,
    method: AggregationMethod,
    partial_allowed: bool,
    strict_versions: bool,
    grace_period: Duration,
    state: Mutex<Option<RoundState>>,
}

impl StalenessAggregator {
    pub fn new(node_id: impl Into<PeerId>, cfg: &ProtocolConfig) -> Self {
        Self {
            node_id: node_id.into(),
            method: cfg.method,
            partial_allowed: cfg.partial_allowed(cfg.method),
            strict_versions: cfg.strict_versions,
            grace_period: cfg.grace_period(),
            state: Mutex::new(None),
        }
    }

    /// Opens `round`. The previous round must have been finalized; there is no
    /// mid-round rollback.
    pub fn begin_round(&self, round: Round, train_set: BTreeSet<PeerId>) -> Result<()> {
        let mut guard = self.state.lock();
        if let Some(st) = guard.as_ref() {
            if st.phase != RoundPhase::Finalized {
                return Err(SwarmError::ProtocolViolation(format!("round {} still open", st.round)));
            }
        }
        debug!(node=%self.node_id, round, train_set=train_set.len(), "round_opened");
        *guard = Some(RoundState { round, phase: RoundPhase::Collecting, train_set, submissions: BTreeMap::new(), started_at: Instant::now(), grace_used: false, output: None });
        Ok(())
    }

    /// Last write wins per sender. Rejections are protocol violations the
    /// caller logs and drops.
    pub fn submit(&self, envelope: Arc<ModelEnvelope>) -> Result<RoundPhase> {
        let mut guard = self.state.lock();
        let st = guard.as_mut().ok_or_else(|| SwarmError::ProtocolViolation("no round open".into()))?;
        let sender = envelope.sender_id().to_string();
        let violation = if st.phase == RoundPhase::Finalized {
            Some(format!("late envelope from {sender} for finalized round {}", st.round))
        } else if !st.train_set.contains(&sender) {
            Some(format!("{sender} not in train set of round {}", st.round))
        } else if self.strict_versions && envelope.version() > st.round {
            Some(format!("{sender} claims version {} ahead of round {}", envelope.version(), st.round))
        } else {
            None
        };
        if let Some(reason) = violation {
            METRICS.envelopes_rejected.add(1, &[]);
            warn!(node=%self.node_id, %reason, "envelope_rejected");
            return Err(SwarmError::ProtocolViolation(reason));
        }
        if st.submissions.insert(sender.clone(), envelope).is_some() {
            debug!(node=%self.node_id, %sender, round=st.round, "submission_replaced");
        }
        METRICS.envelopes_accepted.add(1, &[]);
        st.refresh_readiness();
        Ok(st.phase)
    }

    /// Adopts `active` when every peer still owed a submission has left it.
    /// Returns whether the set was adopted.
    pub fn sync_train_set(&self, active: &BTreeSet<PeerId>) -> bool {
        let mut guard = self.state.lock();
        let Some(st) = guard.as_mut() else { return false };
        if st.phase == RoundPhase::Finalized || &st.train_set == active { return false; }
        let missing = st.missing();
        if missing.iter().any(|p| active.contains(p)) { return false; }
        info!(node=%self.node_id, round=st.round, departed=?missing, "train_set_adopted");
        st.train_set = active.clone();
        st.refresh_readiness();
        true
    }

    /// Deadline policy. Gaps fully explained by non-active peers finalize at
    /// once when partial aggregation is admissible; otherwise one grace period
    /// is granted before finalizing with whatever arrived.
    pub fn on_deadline(&self, non_active: &BTreeSet<PeerId>) -> Result<DeadlineAction> {
        let mut guard = self.state.lock();
        let st = guard.as_mut().ok_or_else(|| SwarmError::ProtocolViolation("no round open".into()))?;
        if let Some(out) = &st.output { return Ok(DeadlineAction::Finalized(out.clone())); }
        let missing = st.missing();
        if missing.is_empty() || (self.partial_allowed && missing.iter().all(|p| non_active.contains(p))) {
            st.phase = RoundPhase::Ready;
            return Ok(DeadlineAction::Finalized(self.finalize_locked(st)));
        }
        if !st.grace_used {
            st.grace_used = true;
            info!(node=%self.node_id, round=st.round, ?missing, grace=?self.grace_period, "aggregation_grace_started");
            return Ok(DeadlineAction::Grace(self.grace_period));
        }
        warn!(node=%self.node_id, round=st.round, ?missing, "forcing_finalize_required_peers_missing");
        Ok(DeadlineAction::Finalized(self.finalize_locked(st)))
    }

    /// Idempotent: a second call returns the stored output unchanged.
    pub fn finalize(&self) -> Result<Arc<RoundOutput>> {
        let mut guard = self.state.lock();
        let st = guard.as_mut().ok_or_else(|| SwarmError::ProtocolViolation("no round open".into()))?;
        if let Some(out) = &st.output { return Ok(out.clone()); }
        Ok(self.finalize_locked(st))
    }

    fn finalize_locked(&self, st: &mut RoundState) -> Arc<RoundOutput> {
        let missing = st.missing();
        let (parameters, contributions) = self.aggregate(st.round, &st.submissions);
        let out = Arc::new(RoundOutput { round: st.round, parameters, contributions, partial: !missing.is_empty(), missing });
        st.phase = RoundPhase::Finalized;
        st.output = Some(out.clone());
        METRICS.rounds_finalized.add(1, &[]);
        if out.partial { METRICS.partial_rounds.add(1, &[]); }
        METRICS.aggregation_latency_ms.record(st.started_at.elapsed().as_secs_f64() * 1000.0, &[]);
        info!(node=%self.node_id, round=st.round, contributors=out.contributions.len(), partial=out.partial, "round_finalized");
        out
    }

    fn aggregate(&self, round: Round, submissions: &BTreeMap<PeerId, Arc<ModelEnvelope>>) -> (Option<ModelParameters>, Vec<Contribution>) {
        let mut acc: Vec<f64> = Vec::new();
        let mut total = 0f64;
        let mut contributions = Vec::with_capacity(submissions.len());
        for (sender, env) in submissions {
            let params = match env.parameters() {
                Ok(p) => p,
                Err(e) => { warn!(%sender, error=%e, "undecodable_payload_skipped"); continue; }
            };
            if contributions.is_empty() { acc = vec![0f64; params.len()]; }
            else if params.len() != acc.len() {
                warn!(%sender, expected=acc.len(), got=params.len(), "dimension_mismatch_skipped");
                continue;
            }
            let s = staleness(env.version(), round);
            let ew = if self.method.applies_decay() { effective_weight(env, round) } else { env.weight() };
            for (a, v) in acc.iter_mut().zip(params.0.iter()) { *a += *v as f64 * ew; }
            total += ew;
            contributions.push(Contribution { sender: sender.clone(), version: env.version(), weight: env.weight(), staleness: s, effective_weight: ew });
        }
        if contributions.is_empty() || total <= 0.0 { return (None, contributions); }
        (Some(ModelParameters(acc.into_iter().map(|a| (a / total) as f32).collect())), contributions)
    }

    pub fn phase(&self) -> Option<RoundPhase> { self.state.lock().as_ref().map(|s| s.phase) }
    pub fn current_round(&self) -> Option<Round> { self.state.lock().as_ref().map(|s| s.round) }
    pub fn train_set(&self) -> BTreeSet<PeerId> { self.state.lock().as_ref().map(|s| s.train_set.clone()).unwrap_or_default() }
    pub fn output(&self) -> Option<Arc<RoundOutput>> { self.state.lock().as_ref().and_then(|s| s.output.clone()) }
    pub fn is_ready(&self) -> bool { self.phase() == Some(RoundPhase::Ready) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ids: &[&str]) -> BTreeSet<PeerId> { ids.iter().map(|s| s.to_string()).collect() }

    fn env(sender: &str, version: Round, weight: f64, params: &[f32]) -> Arc<ModelEnvelope> {
        Arc::new(ModelEnvelope::new(sender, version, weight, ModelParameters(params.to_vec()).to_bytes()).unwrap())
    }

    fn agg() -> StalenessAggregator { StalenessAggregator::new("a", &ProtocolConfig::default()) }

    #[test]
    fn decay_is_strictly_decreasing() {
        assert_eq!(decay(0), 1.0);
        for s in 0..50 { assert!(decay(s + 1) < decay(s)); }
        assert_eq!(staleness(12, 10), 0);
    }

    #[test]
    fn stale_contributor_gets_one_third() {
        let agg = agg();
        agg.begin_round(10, set(&["A", "B"])).unwrap();
        agg.submit(env("A", 8, 1.0, &[3.0])).unwrap();
        assert_eq!(agg.submit(env("B", 10, 1.0, &[7.0])).unwrap(), RoundPhase::Ready);
        let out = agg.finalize().unwrap();
        let w: Vec<f64> = out.contributions.iter().map(|c| c.effective_weight).collect();
        assert!((w[0] - 1.0 / 3.0).abs() < 1e-12);
        assert_eq!(w[1], 1.0);
        // (3 * 1/3 + 7 * 1) / (4/3)
        assert!((out.parameters.as_ref().unwrap().0[0] - 6.0).abs() < 1e-6);
        assert!(!out.partial);
    }

    #[test]
    fn missing_member_is_not_zero_padded() {
        let agg = agg();
        agg.begin_round(4, set(&["a", "b", "c"])).unwrap();
        agg.submit(env("a", 4, 2.0, &[1.0, 2.0])).unwrap();
        agg.submit(env("b", 4, 2.0, &[3.0, 4.0])).unwrap();
        let out = agg.finalize().unwrap();
        assert_eq!(out.parameters.as_ref().unwrap().0, vec![2.0, 3.0]);
        assert!(out.partial);
        assert_eq!(out.missing, vec!["c".to_string()]);
    }

    #[test]
    fn last_write_wins_and_foreign_senders_rejected() {
        let agg = agg();
        agg.begin_round(1, set(&["a", "b"])).unwrap();
        agg.submit(env("a", 1, 1.0, &[1.0])).unwrap();
        agg.submit(env("a", 1, 1.0, &[5.0])).unwrap();
        assert!(matches!(agg.submit(env("z", 1, 1.0, &[9.0])), Err(SwarmError::ProtocolViolation(_))));
        let out = agg.finalize().unwrap();
        assert_eq!(out.parameters.clone().unwrap().0, vec![5.0]);
        assert_eq!(out.contributions.len(), 1);
    }

    #[test]
    fn finalize_is_idempotent_and_late_envelopes_excluded() {
        let agg = agg();
        agg.begin_round(2, set(&["a", "b"])).unwrap();
        agg.submit(env("a", 2, 1.0, &[1.0])).unwrap();
        let first = agg.finalize().unwrap();
        assert!(agg.submit(env("b", 2, 1.0, &[100.0])).is_err());
        let second = agg.finalize().unwrap();
        assert_eq!(first, second);
        assert_eq!(second.parameters.as_ref().unwrap().0, vec![1.0]);
        assert_eq!(agg.phase(), Some(RoundPhase::Finalized));
    }

    #[test]
    fn cannot_open_next_round_before_finalize() {
        let agg = agg();
        agg.begin_round(1, set(&["a"])).unwrap();
        assert!(agg.begin_round(2, set(&["a"])).is_err());
        agg.finalize().unwrap();
        assert!(agg.begin_round(2, set(&["a"])).is_ok());
    }

    #[test]
    fn departure_explains_gap() {
        let agg = agg();
        agg.begin_round(5, set(&["a", "b", "c", "d"])).unwrap();
        for p in ["a", "b", "c"] { agg.submit(env(p, 5, 1.0, &[1.0])).unwrap(); }
        assert!(!agg.is_ready());
        // a gap not explained by the new view is not adopted
        assert!(!agg.sync_train_set(&set(&["a", "b", "d"])));
        assert!(agg.sync_train_set(&set(&["a", "b", "c"])));
        assert!(agg.is_ready());
    }

    #[test]
    fn future_versions_clamped_or_rejected() {
        let agg = agg();
        agg.begin_round(3, set(&["a"])).unwrap();
        agg.submit(env("a", 9, 1.0, &[2.0])).unwrap();
        let out = agg.finalize().unwrap();
        assert_eq!(out.contributions[0].staleness, 0);
        assert_eq!(out.contributions[0].effective_weight, 1.0);

        let strict = StalenessAggregator::new("a", &ProtocolConfig { strict_versions: true, ..ProtocolConfig::default() });
        strict.begin_round(3, set(&["a"])).unwrap();
        assert!(strict.submit(env("a", 9, 1.0, &[2.0])).is_err());
    }

    #[test]
    fn deadline_finalizes_when_gap_is_non_active() {
        let agg = agg();
        agg.begin_round(1, set(&["a", "b"])).unwrap();
        agg.submit(env("a", 1, 1.0, &[1.0])).unwrap();
        match agg.on_deadline(&set(&["b"])).unwrap() {
            DeadlineAction::Finalized(out) => { assert!(out.partial); assert_eq!(out.missing, vec!["b".to_string()]); }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn deadline_grants_one_grace_then_forces() {
        let agg = agg();
        agg.begin_round(1, set(&["a", "b"])).unwrap();
        agg.submit(env("a", 1, 1.0, &[1.0])).unwrap();
        assert!(matches!(agg.on_deadline(&BTreeSet::new()).unwrap(), DeadlineAction::Grace(_)));
        match agg.on_deadline(&BTreeSet::new()).unwrap() {
            DeadlineAction::Finalized(out) => assert_eq!(out.missing, vec!["b".to_string()]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn fed_avg_ignores_staleness_and_always_takes_grace() {
        let cfg = ProtocolConfig { method: AggregationMethod::FedAvg, ..ProtocolConfig::default() };
        let agg = StalenessAggregator::new("a", &cfg);
        agg.begin_round(10, set(&["A", "B", "C"])).unwrap();
        agg.submit(env("A", 8, 1.0, &[3.0])).unwrap();
        agg.submit(env("B", 10, 1.0, &[7.0])).unwrap();
        assert!(matches!(agg.on_deadline(&set(&["C"])).unwrap(), DeadlineAction::Grace(_)));
        let out = agg.finalize().unwrap();
        assert_eq!(out.parameters.clone().unwrap().0, vec![5.0]);
        assert_eq!(out.contributions[0].staleness, 2);
    }
}
