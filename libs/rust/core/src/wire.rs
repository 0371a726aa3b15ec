//! Frames exchanged between nodes, JSON encoded.

use serde::{Deserialize, Serialize};

use crate::checkpoint::CheckpointRecord;
use crate::envelope::{EnvelopeFrame, PeerId, Round};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus { Synced, Behind }

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WireMessage {
    Update { envelope: EnvelopeFrame },
    Vote { round: Round, candidates: Vec<PeerId> },
    Status { sync: SyncStatus },
    Checkpoint { owner: PeerId, record: CheckpointRecord },
    /// Holder stored the owner's remote record of `round`.
    CheckpointAck { round: Round },
}

impl WireMessage {
    pub fn encode(&self) -> Result<Vec<u8>> { Ok(serde_json::to_vec(self)?) }
    pub fn decode(bytes: &[u8]) -> Result<Self> { Ok(serde_json::from_slice(bytes)?) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_layout() {
        let bytes = WireMessage::Status { sync: SyncStatus::Behind }.encode().unwrap();
        let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v["kind"], "status");
        assert_eq!(v["sync"], "behind");
        assert!(WireMessage::decode(b"{\"kind\":\"bogus\"}").is_err());
        let ack: serde_json::Value = serde_json::from_slice(&WireMessage::CheckpointAck { round: 7 }.encode().unwrap()).unwrap();
        assert_eq!(ack["kind"], "checkpoint_ack");
        assert_eq!(ack["round"], 7);
    }
}
