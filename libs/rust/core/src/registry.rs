//! Neighbor registry: known peers, their liveness and interaction degree.
//!
//! Local-only bookkeeping, no network I/O. Liveness arrives as events from an
//! external detector; the registry only enforces which transitions are legal.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::envelope::{ModelEnvelope, PeerId};
use crate::error::{Result, SwarmError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerStatus { Active, Suspected, Failed }

/// `(peer, status)` as emitted by the liveness detector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivenessEvent {
    pub peer: PeerId,
    pub status: PeerStatus,
}

#[derive(Debug, Clone)]
pub struct NeighborEntry {
    pub address: PeerId,
    pub degree: u64,
    pub status: PeerStatus,
    pub last_model: Option<Arc<ModelEnvelope>>,
    /// Peer announced it is catching up after a rejoin.
    pub behind: bool,
}

impl NeighborEntry {
    fn new(address: PeerId, status: PeerStatus) -> Self { Self { address, degree: 0, status, last_model: None, behind: false } }
}

#[derive(Default)]
pub struct NeighborRegistry {
    entries: RwLock<HashMap<PeerId, NeighborEntry>>,
}

impl NeighborRegistry {
    pub fn new() -> Self { Self::default() }

    /// Registers a peer without counting an interaction.
    pub fn add_peer(&self, peer: &str) {
        self.entries.write().entry(peer.to_string()).or_insert_with(|| NeighborEntry::new(peer.to_string(), PeerStatus::Active));
    }

    /// One successful envelope exchange. Returns the new degree.
    pub fn record_interaction(&self, peer: &str) -> u64 {
        let mut map = self.entries.write();
        let entry = map.entry(peer.to_string()).or_insert_with(|| NeighborEntry::new(peer.to_string(), PeerStatus::Active));
        entry.degree += 1;
        entry.degree
    }

    /// Most-recent-wins: the previous envelope is dropped, never merged or version-compared.
    pub fn update_last_model(&self, peer: &str, envelope: Arc<ModelEnvelope>) {
        let mut map = self.entries.write();
        let entry = map.entry(peer.to_string()).or_insert_with(|| NeighborEntry::new(peer.to_string(), PeerStatus::Active));
        entry.last_model = Some(envelope);
    }

    /// Applies a liveness verdict. Legal moves are `active → suspected → failed`,
    /// `active → failed` (a detector that skips suspicion) and `failed → active`.
    /// `suspected → active` is rejected.
    pub fn mark_status(&self, peer: &str, status: PeerStatus) -> Result<PeerStatus> {
        let mut map = self.entries.write();
        let entry = match map.get_mut(peer) {
            Some(e) => e,
            None => {
                map.insert(peer.to_string(), NeighborEntry::new(peer.to_string(), status));
                debug!(%peer, ?status, "neighbor_discovered_via_liveness");
                return Ok(status);
            }
        };
        use PeerStatus::*;
        match (entry.status, status) {
            (from, to) if from == to => {}
            (Active, Suspected) | (Suspected, Failed) | (Active, Failed) | (Failed, Active) => {
                debug!(%peer, from=?entry.status, to=?status, "neighbor_status_changed");
                entry.status = status;
            }
            (from, to) => {
                warn!(%peer, ?from, ?to, "illegal_status_transition");
                return Err(SwarmError::ProtocolViolation(format!("{peer}: {from:?} -> {to:?}")));
            }
        }
        if entry.status == Failed { entry.behind = false; }
        Ok(entry.status)
    }

    pub fn apply(&self, event: &LivenessEvent) -> Result<PeerStatus> { self.mark_status(&event.peer, event.status) }

    /// Active peers minus `exclude`, degree descending, identifier ascending.
    pub fn candidates(&self, exclude: &HashSet<PeerId>) -> Vec<PeerId> {
        let map = self.entries.read();
        let mut active: Vec<(&PeerId, u64)> = map.values()
            .filter(|e| e.status == PeerStatus::Active && !exclude.contains(&e.address))
            .map(|e| (&e.address, e.degree))
            .collect();
        active.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        active.into_iter().map(|(p, _)| p.clone()).collect()
    }

    pub fn set_behind(&self, peer: &str, behind: bool) {
        if let Some(e) = self.entries.write().get_mut(peer) { e.behind = behind; }
    }

    /// Active peers that announced they are behind, identifier ascending.
    pub fn behind_peers(&self) -> Vec<PeerId> {
        let mut out: Vec<PeerId> = self.entries.read().values()
            .filter(|e| e.behind && e.status == PeerStatus::Active)
            .map(|e| e.address.clone())
            .collect();
        out.sort();
        out
    }

    pub fn status(&self, peer: &str) -> Option<PeerStatus> { self.entries.read().get(peer).map(|e| e.status) }
    pub fn degree(&self, peer: &str) -> u64 { self.entries.read().get(peer).map(|e| e.degree).unwrap_or(0) }
    pub fn last_model(&self, peer: &str) -> Option<Arc<ModelEnvelope>> { self.entries.read().get(peer).and_then(|e| e.last_model.clone()) }

    pub fn active_peers(&self) -> BTreeSet<PeerId> { self.with_status(|s| s == PeerStatus::Active) }
    pub fn non_active_peers(&self) -> BTreeSet<PeerId> { self.with_status(|s| s != PeerStatus::Active) }

    fn with_status(&self, pred: impl Fn(PeerStatus) -> bool) -> BTreeSet<PeerId> {
        self.entries.read().values().filter(|e| pred(e.status)).map(|e| e.address.clone()).collect()
    }

    pub fn snapshot(&self) -> Vec<NeighborEntry> {
        let mut v: Vec<NeighborEntry> = self.entries.read().values().cloned().collect();
        v.sort_by(|a, b| a.address.cmp(&b.address));
        v
    }

    pub fn len(&self) -> usize { self.entries.read().len() }
    pub fn is_empty(&self) -> bool { self.entries.read().is_empty() }
}
