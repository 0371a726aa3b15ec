//! Model update envelope: a versioned, weighted, immutable payload.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SwarmError};

pub type PeerId = String;
pub type Round = u64;

/// Opaque serialized model parameters plus the metadata receivers weight them by.
///
/// Fields are private: an envelope is validated once in [`ModelEnvelope::new`]
/// and never mutated afterwards. Receivers share it through `Arc`.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelEnvelope {
    sender_id: PeerId,
    version: Round,
    weight: f64,
    payload: Arc<[u8]>,
}

impl ModelEnvelope {
    pub fn new(sender_id: impl Into<PeerId>, version: Round, weight: f64, payload: Vec<u8>) -> Result<Self> {
        let sender_id = sender_id.into();
        if sender_id.is_empty() { return Err(SwarmError::ProtocolViolation("empty sender id".into())); }
        if !weight.is_finite() || weight <= 0.0 {
            return Err(SwarmError::ProtocolViolation(format!("non-positive weight {weight} from {sender_id}")));
        }
        Ok(Self { sender_id, version, weight, payload: payload.into() })
    }

    pub fn sender_id(&self) -> &str { &self.sender_id }
    pub fn version(&self) -> Round { self.version }
    pub fn weight(&self) -> f64 { self.weight }
    pub fn payload(&self) -> &[u8] { &self.payload }

    /// Decodes the payload as a parameter vector.
    pub fn parameters(&self) -> Result<ModelParameters> { ModelParameters::from_bytes(&self.payload) }
}

/// Wire form; decoding re-runs [`ModelEnvelope::new`] validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeFrame {
    pub sender_id: PeerId,
    pub version: Round,
    pub weight: f64,
    pub payload: Vec<u8>,
}

impl From<&ModelEnvelope> for EnvelopeFrame {
    fn from(e: &ModelEnvelope) -> Self {
        Self { sender_id: e.sender_id.clone(), version: e.version, weight: e.weight, payload: e.payload.to_vec() }
    }
}

impl TryFrom<EnvelopeFrame> for ModelEnvelope {
    type Error = SwarmError;
    fn try_from(f: EnvelopeFrame) -> Result<Self> { ModelEnvelope::new(f.sender_id, f.version, f.weight, f.payload) }
}

/// Flat parameter vector, encoded little-endian f32 inside envelope payloads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelParameters(pub Vec<f32>);

impl ModelParameters {
    pub fn zeros(dim: usize) -> Self { Self(vec![0.0; dim]) }

    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    pub fn to_bytes(&self) -> Vec<u8> { self.0.iter().flat_map(|v| v.to_le_bytes()).collect() }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() % 4 != 0 {
            return Err(SwarmError::Codec(format!("payload length {} is not a multiple of 4", bytes.len())));
        }
        Ok(Self(bytes.chunks_exact(4).map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_positive_weight() {
        assert!(ModelEnvelope::new("a", 1, 0.0, vec![]).is_err());
        assert!(ModelEnvelope::new("a", 1, -2.0, vec![]).is_err());
        assert!(ModelEnvelope::new("a", 1, f64::NAN, vec![]).is_err());
        assert!(ModelEnvelope::new("", 1, 1.0, vec![]).is_err());
        assert!(ModelEnvelope::new("a", 1, 0.5, vec![]).is_ok());
    }

    #[test]
    fn frame_decode_revalidates() {
        let frame = EnvelopeFrame { sender_id: "b".into(), version: 3, weight: 0.0, payload: vec![] };
        assert!(ModelEnvelope::try_from(frame).is_err());
    }

    #[test]
    fn parameters_decode() {
        let p = ModelParameters(vec![1.5, -2.0, 0.25]);
        let env = ModelEnvelope::new("a", 0, 1.0, p.to_bytes()).unwrap();
        assert_eq!(env.parameters().unwrap(), p);
        assert!(ModelParameters::from_bytes(&[1, 2, 3]).is_err());
    }
}
