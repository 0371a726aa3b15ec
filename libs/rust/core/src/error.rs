//! Error taxonomy shared by every component of the learning core.
//!
//! Nothing here is allowed to halt a node's round loop: each variant maps to a
//! fallback (retry, next recovery tier, partial aggregation, drop-and-log).
//! The single exception is [`SwarmError::StorageExhausted`], which is reported
//! upward as unrecoverable.

use thiserror::Error;

use crate::envelope::Round;

#[derive(Debug, Error)]
pub enum SwarmError {
    /// Delivery failure, timeout or a flaky store; retried or tolerated.
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("checkpoint not found: {0}")]
    NotFound(String),
    #[error("delta chain broken at round {round}: {reason}")]
    ChainBroken { round: Round, reason: String },
    /// Non-train-set sender, submission after finalize, illegal status transition.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("undecodable frame: {0}")]
    Codec(String),
    #[error("storage exhausted: {0}")]
    StorageExhausted(String),
}

impl SwarmError {
    pub fn is_recoverable(&self) -> bool { !matches!(self, SwarmError::StorageExhausted(_)) }

    pub fn is_transient(&self) -> bool { matches!(self, SwarmError::Transient(_)) }
}

impl From<serde_json::Error> for SwarmError {
    fn from(e: serde_json::Error) -> Self { SwarmError::Codec(e.to_string()) }
}

impl From<sled::Error> for SwarmError {
    fn from(e: sled::Error) -> Self {
        match e {
            // ENOSPC / EDQUOT
            sled::Error::Io(io) if matches!(io.raw_os_error(), Some(28) | Some(122)) => SwarmError::StorageExhausted(io.to_string()),
            other => SwarmError::Transient(other.to_string()),
        }
    }
}

pub type Result<T, E = SwarmError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_storage_exhaustion_is_fatal() {
        assert!(SwarmError::Transient("send".into()).is_recoverable());
        assert!(SwarmError::NotFound("local/3".into()).is_recoverable());
        assert!(SwarmError::ChainBroken { round: 4, reason: "missing base".into() }.is_recoverable());
        assert!(SwarmError::ProtocolViolation("late".into()).is_recoverable());
        assert!(!SwarmError::StorageExhausted("disk full".into()).is_recoverable());
    }

    #[test]
    fn enospc_maps_to_exhaustion() {
        let io = std::io::Error::from_raw_os_error(28);
        assert!(matches!(SwarmError::from(sled::Error::Io(io)), SwarmError::StorageExhausted(_)));
        let other = std::io::Error::new(std::io::ErrorKind::Other, "flaky");
        assert!(SwarmError::from(sled::Error::Io(other)).is_transient());
    }
}
