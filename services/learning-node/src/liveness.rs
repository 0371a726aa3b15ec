//! Heartbeat-based liveness signal.
//!
//! Every node announces itself on the `hello` subject. A peer that stays
//! silent for two heartbeats is reported `suspected`, four heartbeats `failed`.
//! A suspected peer that speaks again is reported failed and then active, since
//! the registry only re-admits peers from `failed`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use swarm_learning::{LivenessEvent, PeerId, PeerStatus};

use crate::nats::Subjects;

#[derive(Debug)]
pub struct PresenceTracker {
    interval: Duration,
    peers: HashMap<PeerId, (Instant, PeerStatus)>,
}

impl PresenceTracker {
    pub fn new(interval: Duration) -> Self { Self { interval, peers: HashMap::new() } }

    pub fn heard(&mut self, peer: &str, now: Instant) -> Vec<LivenessEvent> {
        let ev = |status| LivenessEvent { peer: peer.to_string(), status };
        let prev = self.peers.insert(peer.to_string(), (now, PeerStatus::Active)).map(|(_, s)| s);
        match prev {
            None | Some(PeerStatus::Failed) => vec![ev(PeerStatus::Active)],
            Some(PeerStatus::Suspected) => vec![ev(PeerStatus::Failed), ev(PeerStatus::Active)],
            Some(PeerStatus::Active) => Vec::new(),
        }
    }

    pub fn sweep(&mut self, now: Instant) -> Vec<LivenessEvent> {
        let mut out = Vec::new();
        for (peer, (seen, status)) in self.peers.iter_mut() {
            let silent = now.saturating_duration_since(*seen);
            let next = if silent >= self.interval * 4 { PeerStatus::Failed }
                else if silent >= self.interval * 2 { PeerStatus::Suspected }
                else { continue };
            if next != *status && !(next == PeerStatus::Suspected && *status == PeerStatus::Failed) {
                *status = next;
                out.push(LivenessEvent { peer: peer.clone(), status: next });
            }
        }
        out.sort_by(|a, b| a.peer.cmp(&b.peer));
        out
    }
}

/// Starts the heartbeat publisher, the presence listener and the sweeper.
pub async fn spawn(nc: async_nats::Client, subjects: Subjects, local: PeerId, interval: Duration, events: mpsc::Sender<LivenessEvent>) -> anyhow::Result<()> {
    let tracker = Arc::new(Mutex::new(PresenceTracker::new(interval)));
    let mut sub = nc.subscribe(subjects.hello()).await?;

    let hello_nc = nc.clone();
    let hello_subject = subjects.hello();
    let hello_id = local.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        loop {
            tick.tick().await;
            if let Err(e) = hello_nc.publish(hello_subject.clone(), hello_id.clone().into_bytes().into()).await {
                warn!(error=%e, "heartbeat_publish_failed");
            }
        }
    });

    let listen_tracker = tracker.clone();
    let listen_events = events.clone();
    tokio::spawn(async move {
        while let Some(msg) = sub.next().await {
            let Ok(peer) = std::str::from_utf8(&msg.payload) else { continue };
            if peer == local || peer.is_empty() { continue; }
            let out = listen_tracker.lock().heard(peer, Instant::now());
            for ev in out {
                debug!(peer=%ev.peer, status=?ev.status, "peer_presence");
                if listen_events.send(ev).await.is_err() { return; }
            }
        }
        warn!("presence_subscription_ended");
    });

    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        loop {
            tick.tick().await;
            let out = tracker.lock().sweep(Instant::now());
            for ev in out {
                info!(peer=%ev.peer, status=?ev.status, "peer_presence_lost");
                if events.send(ev).await.is_err() { return; }
            }
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn statuses(events: &[LivenessEvent]) -> Vec<PeerStatus> { events.iter().map(|e| e.status).collect() }

    #[test]
    fn silence_escalates_then_recovery_readmits() {
        let hb = Duration::from_secs(1);
        let t0 = Instant::now();
        let mut tracker = PresenceTracker::new(hb);
        assert_eq!(statuses(&tracker.heard("b", t0)), vec![PeerStatus::Active]);
        assert!(tracker.heard("b", t0).is_empty());
        assert!(tracker.sweep(t0 + hb).is_empty());
        assert_eq!(statuses(&tracker.sweep(t0 + hb * 2)), vec![PeerStatus::Suspected]);
        assert!(tracker.sweep(t0 + hb * 3).is_empty());
        assert_eq!(statuses(&tracker.heard("b", t0 + hb * 3)), vec![PeerStatus::Failed, PeerStatus::Active]);
        assert_eq!(statuses(&tracker.sweep(t0 + hb * 8)), vec![PeerStatus::Failed]);
        assert!(tracker.sweep(t0 + hb * 9).is_empty());
        assert_eq!(statuses(&tracker.heard("b", t0 + hb * 9)), vec![PeerStatus::Active]);
    }
}
