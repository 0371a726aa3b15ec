//! Byte-level delta encoding for remote checkpoints.
//!
//! A delta is the target length plus the byte ranges that differ from the
//! base. Nearby ranges are merged so a dense change does not explode into
//! thousands of one-byte patches.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::CheckpointRecord;
use crate::envelope::Round;
use crate::error::{Result, SwarmError};

/// Unchanged runs shorter than this are folded into the surrounding patch.
const MERGE_GAP: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    pub offset: usize,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDelta {
    pub target_len: usize,
    pub patches: Vec<Patch>,
}

pub fn digest(state: &[u8]) -> String { hex::encode(Sha256::digest(state)) }

pub fn encode(base: &[u8], target: &[u8]) -> StateDelta {
    let differs = |i: usize| i >= base.len() || base[i] != target[i];
    let mut ranges: Vec<(usize, usize)> = Vec::new();
    let mut i = 0;
    while i < target.len() {
        if !differs(i) { i += 1; continue; }
        let start = i;
        while i < target.len() && differs(i) { i += 1; }
        match ranges.last_mut() {
            Some((_, end)) if start - *end < MERGE_GAP => *end = i,
            _ => ranges.push((start, i)),
        }
    }
    StateDelta { target_len: target.len(), patches: ranges.into_iter().map(|(s, e)| Patch { offset: s, bytes: target[s..e].to_vec() }).collect() }
}

pub fn apply(base: &[u8], delta: &StateDelta) -> std::result::Result<Vec<u8>, String> {
    let mut out = base[..base.len().min(delta.target_len)].to_vec();
    out.resize(delta.target_len, 0);
    for p in &delta.patches {
        let end = p.offset.checked_add(p.bytes.len()).filter(|e| *e <= delta.target_len)
            .ok_or_else(|| format!("patch at {} overruns length {}", p.offset, delta.target_len))?;
        out[p.offset..end].copy_from_slice(&p.bytes);
    }
    Ok(out)
}

/// Resolves `record` back to its nearest full snapshot through `ancestors`
/// (keyed by round) and replays the deltas forward, verifying every digest.
pub fn reconstruct_chain(record: &CheckpointRecord, ancestors: &BTreeMap<Round, CheckpointRecord>) -> Result<Vec<u8>> {
    let mut chain = vec![record];
    let mut cur = record;
    while let Some(base) = cur.base_round {
        if base >= cur.round {
            return Err(SwarmError::ChainBroken { round: cur.round, reason: format!("base {base} not older than record") });
        }
        cur = ancestors.get(&base).ok_or_else(|| SwarmError::ChainBroken { round: base, reason: "missing link".into() })?;
        chain.push(cur);
    }
    let mut state = cur.state.clone();
    for rec in chain.iter().rev() {
        if rec.base_round.is_some() {
            let delta: StateDelta = serde_json::from_slice(&rec.state)
                .map_err(|e| SwarmError::ChainBroken { round: rec.round, reason: format!("undecodable delta: {e}") })?;
            state = apply(&state, &delta).map_err(|reason| SwarmError::ChainBroken { round: rec.round, reason })?;
        }
        if digest(&state) != rec.digest {
            return Err(SwarmError::ChainBroken { round: rec.round, reason: "digest mismatch".into() });
        }
    }
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_inverts_encode_across_lengths() {
        let cases: [(&[u8], &[u8]); 6] = [
            (&b""[..], &b"hello world"[..]),
            (&b"hello world"[..], &b""[..]),
            (&b"hello world"[..], &b"hello world"[..]),
            (&b"hello world"[..], &b"jello world, and more"[..]),
            (&b"a much longer base state than the target"[..], &b"a much shorter"[..]),
            (&[0u8; 64][..], &[1u8; 64][..]),
        ];
        for (base, target) in cases {
            let d = encode(base, target);
            assert_eq!(apply(base, &d).unwrap(), target, "base={base:?}");
        }
    }

    #[test]
    fn sparse_changes_stay_small() {
        let base = vec![7u8; 4096];
        let mut target = base.clone();
        target[10] = 1;
        target[12] = 1;
        target[3000] = 2;
        let d = encode(&base, &target);
        assert_eq!(d.patches.len(), 2);
        assert_eq!(d.patches[0], Patch { offset: 10, bytes: vec![1, 7, 1] });
    }

    #[test]
    fn overrunning_patch_is_rejected() {
        let d = StateDelta { target_len: 2, patches: vec![Patch { offset: 1, bytes: vec![1, 2] }] };
        assert!(apply(b"ab", &d).is_err());
    }
}
