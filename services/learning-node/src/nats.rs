//! NATS plumbing: peer frames, presence, and checkpoint request/reply.
//!
//! Subjects live under `{prefix}.{experiment}`:
//! - `peer.{to}.{from}` carries wire frames
//! - `hello` carries presence announcements
//! - `ckpt.{holder}` answers remote checkpoint queries

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use swarm_learning::{CheckpointManager, CheckpointRecord, Inbox, PeerId, RemoteCheckpointSource, Round, SwarmError, Transport};

const INBOX_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct Subjects {
    base: String,
}

impl Subjects {
    pub fn new(prefix: &str, experiment: &str) -> Self { Self { base: format!("{prefix}.{experiment}") } }
    pub fn peer(&self, to: &str, from: &str) -> String { format!("{}.peer.{to}.{from}", self.base) }
    pub fn peer_inbox(&self, node: &str) -> String { format!("{}.peer.{node}.*", self.base) }
    pub fn hello(&self) -> String { format!("{}.hello", self.base) }
    pub fn checkpoints(&self, holder: &str) -> String { format!("{}.ckpt.{holder}", self.base) }
}

/// Last token of a `peer.{to}.{from}` subject.
pub fn sender_of(subject: &str) -> Option<&str> { subject.rsplit('.').next().filter(|s| !s.is_empty()) }

pub struct NatsTransport {
    nc: async_nats::Client,
    subjects: Subjects,
    local: PeerId,
}

impl NatsTransport {
    /// Subscribes to this node's peer subject and pumps frames into the inbox.
    pub async fn start(nc: async_nats::Client, subjects: Subjects, local: PeerId) -> anyhow::Result<(Arc<Self>, Inbox)> {
        let mut sub = nc.subscribe(subjects.peer_inbox(&local)).await?;
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        tokio::spawn(async move {
            while let Some(msg) = sub.next().await {
                let Some(from) = sender_of(msg.subject.as_str()) else { continue };
                if tx.send((from.to_string(), msg.payload.to_vec())).await.is_err() { break; }
            }
            warn!("peer_subscription_ended");
        });
        Ok((Arc::new(Self { nc, subjects, local }), rx))
    }
}

#[async_trait]
impl Transport for NatsTransport {
    async fn send(&self, peer: &str, bytes: Vec<u8>) -> swarm_learning::Result<()> {
        self.nc.publish(self.subjects.peer(peer, &self.local), bytes.into()).await
            .map_err(|e| SwarmError::Transient(format!("publish to {peer}: {e}")))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ChainRequest {
    owner: PeerId,
    up_to: Round,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum ChainReply {
    Found { records: Vec<CheckpointRecord> },
    Missing { reason: String },
}

pub struct NatsCheckpointSource {
    nc: async_nats::Client,
    subjects: Subjects,
    timeout: Duration,
}

impl NatsCheckpointSource {
    pub fn new(nc: async_nats::Client, subjects: Subjects, timeout: Duration) -> Self { Self { nc, subjects, timeout } }
}

#[async_trait]
impl RemoteCheckpointSource for NatsCheckpointSource {
    async fn fetch_chain(&self, holder: &str, owner: &str, up_to: Round) -> swarm_learning::Result<Vec<CheckpointRecord>> {
        let body = serde_json::to_vec(&ChainRequest { owner: owner.to_string(), up_to })?;
        let reply = tokio::time::timeout(self.timeout, self.nc.request(self.subjects.checkpoints(holder), body.into())).await
            .map_err(|_| SwarmError::Transient(format!("checkpoint query to {holder} timed out")))?
            .map_err(|e| SwarmError::Transient(format!("checkpoint query to {holder}: {e}")))?;
        match serde_json::from_slice::<ChainReply>(&reply.payload)? {
            ChainReply::Found { records } => Ok(records),
            ChainReply::Missing { reason } => Err(SwarmError::NotFound(reason)),
        }
    }
}

/// Answers remote checkpoint queries addressed to `local` from its store.
pub async fn serve_checkpoints(nc: async_nats::Client, subjects: Subjects, local: PeerId, checkpoints: Arc<CheckpointManager>) -> anyhow::Result<()> {
    let mut sub = nc.subscribe(subjects.checkpoints(&local)).await?;
    tokio::spawn(async move {
        while let Some(msg) = sub.next().await {
            let Some(reply) = msg.reply.clone() else { continue };
            let answer = match serde_json::from_slice::<ChainRequest>(&msg.payload) {
                Ok(req) => match checkpoints.remote_chain(&req.owner, req.up_to).await {
                    Ok(records) => {
                        debug!(owner=%req.owner, up_to=req.up_to, records=records.len(), "checkpoint_query_served");
                        ChainReply::Found { records }
                    }
                    Err(e) => ChainReply::Missing { reason: e.to_string() },
                },
                Err(e) => ChainReply::Missing { reason: format!("bad request: {e}") },
            };
            match serde_json::to_vec(&answer) {
                Ok(bytes) => {
                    if let Err(e) = nc.publish(reply, bytes.into()).await { warn!(error=%e, "checkpoint_reply_failed"); }
                }
                Err(e) => warn!(error=%e, "checkpoint_reply_encode_failed"),
            }
        }
        warn!("checkpoint_subscription_ended");
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_subjects_carry_the_sender() {
        let s = Subjects::new("swarm.learning", "exp1");
        assert_eq!(s.peer("node-b", "node-a"), "swarm.learning.exp1.peer.node-b.node-a");
        assert_eq!(sender_of(&s.peer("node-b", "node-a")), Some("node-a"));
        assert_eq!(s.peer_inbox("node-b"), "swarm.learning.exp1.peer.node-b.*");
        assert_eq!(sender_of("trailing."), None);
    }

    #[test]
    fn missing_reply_is_tagged() {
        let bytes = serde_json::to_vec(&ChainReply::Missing { reason: "none".into() }).unwrap();
        let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v["status"], "missing");
        assert!(matches!(serde_json::from_slice::<ChainReply>(&bytes).unwrap(), ChainReply::Missing { .. }));
    }
}
