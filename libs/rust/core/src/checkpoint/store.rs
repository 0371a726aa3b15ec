//! Persistent key-value seam for checkpoints, keyed by
//! `(experiment, node, round, kind)`.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::CheckpointKind;
use crate::envelope::{PeerId, Round};
use crate::error::{Result, SwarmError};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CheckpointKey {
    pub experiment: String,
    pub node: PeerId,
    pub round: Round,
    pub kind: CheckpointKind,
}

impl CheckpointKey {
    pub fn new(experiment: &str, node: &str, round: Round, kind: CheckpointKind) -> Self {
        Self { experiment: experiment.to_string(), node: node.to_string(), round, kind }
    }

    /// Prefix shared by every round of `(experiment, node, kind)`.
    pub fn prefix(experiment: &str, node: &str, kind: CheckpointKind) -> String { format!("ckpt/{experiment}/{node}/{}/", kind.as_str()) }
}

impl fmt::Display for CheckpointKey {
    // zero-padded so lexicographic order is round order
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:020}", Self::prefix(&self.experiment, &self.node, self.kind), self.round)
    }
}

fn round_from_key(key: &[u8]) -> Option<Round> {
    std::str::from_utf8(key).ok()?.rsplit('/').next()?.parse().ok()
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn put(&self, key: &CheckpointKey, bytes: Vec<u8>) -> Result<()>;
    async fn get(&self, key: &CheckpointKey) -> Result<Option<Vec<u8>>>;
    /// Stored rounds for `(experiment, node, kind)`, ascending.
    async fn rounds(&self, experiment: &str, node: &str, kind: CheckpointKind) -> Result<Vec<Round>>;
    async fn delete(&self, key: &CheckpointKey) -> Result<()>;
}

/// In-memory store with an optional byte budget. Exceeding the budget is
/// `StorageExhausted`; `set_unavailable` makes every call fail transiently.
#[derive(Default)]
pub struct MemoryStore {
    data: RwLock<BTreeMap<String, Vec<u8>>>,
    capacity: Option<usize>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }
    pub fn with_capacity(bytes: usize) -> Self { Self { capacity: Some(bytes), ..Self::default() } }

    pub fn set_unavailable(&self, down: bool) { self.unavailable.store(down, Ordering::SeqCst); }

    pub fn clear(&self) { self.data.write().clear(); }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) { return Err(SwarmError::Transient("store unavailable".into())); }
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn put(&self, key: &CheckpointKey, bytes: Vec<u8>) -> Result<()> {
        self.check()?;
        let mut data = self.data.write();
        let k = key.to_string();
        if let Some(cap) = self.capacity {
            let used: usize = data.iter().filter(|(existing, _)| **existing != k).map(|(_, v)| v.len()).sum();
            if used + bytes.len() > cap {
                return Err(SwarmError::StorageExhausted(format!("{} bytes over a {cap} byte budget", used + bytes.len())));
            }
        }
        data.insert(k, bytes);
        Ok(())
    }

    async fn get(&self, key: &CheckpointKey) -> Result<Option<Vec<u8>>> {
        self.check()?;
        Ok(self.data.read().get(&key.to_string()).cloned())
    }

    async fn rounds(&self, experiment: &str, node: &str, kind: CheckpointKind) -> Result<Vec<Round>> {
        self.check()?;
        let prefix = CheckpointKey::prefix(experiment, node, kind);
        Ok(self.data.read().range(prefix.clone()..).take_while(|(k, _)| k.starts_with(&prefix)).filter_map(|(k, _)| round_from_key(k.as_bytes())).collect())
    }

    async fn delete(&self, key: &CheckpointKey) -> Result<()> {
        self.check()?;
        self.data.write().remove(&key.to_string());
        Ok(())
    }
}

pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> { Ok(Self { db: sled::open(path)? }) }

    pub fn temporary() -> Result<Self> { Ok(Self { db: sled::Config::new().temporary(true).open()? }) }
}

#[async_trait]
impl CheckpointStore for SledStore {
    async fn put(&self, key: &CheckpointKey, bytes: Vec<u8>) -> Result<()> {
        self.db.insert(key.to_string().as_bytes(), bytes)?;
        self.db.flush_async().await?;
        Ok(())
    }

    async fn get(&self, key: &CheckpointKey) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(key.to_string().as_bytes())?.map(|v| v.to_vec()))
    }

    async fn rounds(&self, experiment: &str, node: &str, kind: CheckpointKind) -> Result<Vec<Round>> {
        let mut out = Vec::new();
        for kv in self.db.scan_prefix(CheckpointKey::prefix(experiment, node, kind).as_bytes()) {
            let (k, _) = kv?;
            if let Some(r) = round_from_key(&k) { out.push(r); }
        }
        Ok(out)
    }

    async fn delete(&self, key: &CheckpointKey) -> Result<()> {
        self.db.remove(key.to_string().as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exercise(store: &dyn CheckpointStore) {
        for r in [3, 1, 12] {
            store.put(&CheckpointKey::new("exp", "a", r, CheckpointKind::Local), vec![r as u8]).await.unwrap();
        }
        store.put(&CheckpointKey::new("exp", "a", 2, CheckpointKind::Remote), vec![0]).await.unwrap();
        store.put(&CheckpointKey::new("exp", "ab", 5, CheckpointKind::Local), vec![0]).await.unwrap();
        assert_eq!(store.rounds("exp", "a", CheckpointKind::Local).await.unwrap(), vec![1, 3, 12]);
        let key = CheckpointKey::new("exp", "a", 12, CheckpointKind::Local);
        assert_eq!(store.get(&key).await.unwrap(), Some(vec![12]));
        store.delete(&key).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn memory_store_contract() { exercise(&MemoryStore::new()).await; }

    #[tokio::test]
    async fn sled_store_contract() { exercise(&SledStore::temporary().unwrap()).await; }

    #[tokio::test]
    async fn memory_budget_and_outage() {
        let store = MemoryStore::with_capacity(8);
        let key = CheckpointKey::new("exp", "a", 1, CheckpointKind::Local);
        store.put(&key, vec![0; 8]).await.unwrap();
        // overwriting the same key reuses its space
        store.put(&key, vec![1; 8]).await.unwrap();
        let err = store.put(&CheckpointKey::new("exp", "a", 2, CheckpointKind::Local), vec![0; 1]).await.unwrap_err();
        assert!(!err.is_recoverable());
        store.set_unavailable(true);
        assert!(store.get(&key).await.unwrap_err().is_transient());
    }
}
