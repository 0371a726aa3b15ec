//! Transport seam. The core only needs `send(peer, bytes)` plus an inbound
//! stream of `(peer, bytes)`; delivery and ordering are not guaranteed.
//!
//! [`InMemoryNetwork`] is an in-process hub over tokio channels used by the
//! integration tests and local simulations; links can be taken down to model
//! node failure.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::envelope::PeerId;
use crate::error::{Result, SwarmError};

/// Frame as seen by the receiver: `(sender, bytes)`.
pub type Inbound = (PeerId, Vec<u8>);
pub type Inbox = mpsc::Receiver<Inbound>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// At-most-once delivery attempt; `Err(Transient)` on failure.
    async fn send(&self, peer: &str, bytes: Vec<u8>) -> Result<()>;
}

const INBOX_CAPACITY: usize = 1024;

#[derive(Clone, Default)]
pub struct InMemoryNetwork {
    inboxes: Arc<RwLock<HashMap<PeerId, mpsc::Sender<Inbound>>>>,
    down: Arc<RwLock<HashSet<PeerId>>>,
}

impl InMemoryNetwork {
    pub fn new() -> Self { Self::default() }

    /// Attaches (or re-attaches) `node`; a previous inbox for it is dropped.
    pub fn join(&self, node: &str) -> (Arc<InMemoryTransport>, Inbox) {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        self.inboxes.write().insert(node.to_string(), tx);
        self.down.write().remove(node);
        (Arc::new(InMemoryTransport { local: node.to_string(), net: self.clone() }), rx)
    }

    /// While down, nothing is delivered to or from `node`.
    pub fn set_down(&self, node: &str, down: bool) {
        let mut set = self.down.write();
        if down { set.insert(node.to_string()); } else { set.remove(node); }
    }

    pub fn is_down(&self, node: &str) -> bool { self.down.read().contains(node) }
}

pub struct InMemoryTransport {
    local: PeerId,
    net: InMemoryNetwork,
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send(&self, peer: &str, bytes: Vec<u8>) -> Result<()> {
        if self.net.is_down(&self.local) || self.net.is_down(peer) {
            return Err(SwarmError::Transient(format!("link {} -> {peer} down", self.local)));
        }
        let tx = self.net.inboxes.read().get(peer).cloned()
            .ok_or_else(|| SwarmError::Transient(format!("unknown peer {peer}")))?;
        tx.try_send((self.local.clone(), bytes)).map_err(|e| SwarmError::Transient(format!("deliver to {peer}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_and_fails_when_down() {
        let net = InMemoryNetwork::new();
        let (a, _a_in) = net.join("a");
        let (_b, mut b_in) = net.join("b");
        a.send("b", b"hi".to_vec()).await.unwrap();
        assert_eq!(b_in.recv().await.unwrap(), ("a".to_string(), b"hi".to_vec()));
        net.set_down("b", true);
        assert!(a.send("b", vec![]).await.unwrap_err().is_transient());
        assert!(a.send("nobody", vec![]).await.is_err());
    }
}
