//! Error taxonomy for block ledgers, the path codec and the CAS access loop

use ipnet::IpNet;
use std::net::IpAddr;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A path was requested for a key that carries no CIDR.
    #[error("insufficient identifiers: block key has no CIDR")]
    InsufficientIdentifiers,

    /// The path matched the block layout but its CIDR part is unusable.
    #[error("malformed block path {path}: {reason}")]
    MalformedBlockPath { path: String, reason: String },

    #[error("block {cidr} has too many addresses to track")]
    BlockTooLarge { cidr: IpNet },

    /// Strict affinity reserves the block for another host.
    #[error("block {cidr} is strictly affine to {owner}, not {requester}")]
    AffinityViolation {
        cidr: IpNet,
        owner: String,
        requester: String,
    },

    #[error("ordinal {ordinal} in block {cidr} is already unallocated")]
    AlreadyUnallocated { cidr: IpNet, ordinal: usize },

    #[error("ordinal {ordinal} in block {cidr} is already allocated")]
    AlreadyAllocated { cidr: IpNet, ordinal: usize },

    #[error("ordinal {ordinal} is outside block {cidr}")]
    OrdinalOutOfRange { cidr: IpNet, ordinal: usize },

    #[error("address {ip} is not inside block {cidr}")]
    AddressNotInBlock { cidr: IpNet, ip: IpAddr },

    #[error("no allocation block stored for {cidr}")]
    BlockNotFound { cidr: IpNet },

    /// The datastore rejected a write made against a stale revision.
    #[error("revision conflict writing {path}")]
    RevisionConflict { path: String },

    #[error("gave up updating block {cidr} after {attempts} conflicting attempts")]
    ConcurrentModification { cidr: IpNet, attempts: usize },

    #[error("block {cidr} is corrupt: {reason}")]
    CorruptBlock { cidr: IpNet, reason: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    /// Failure reported by a [`Datastore`](crate::Datastore) backend
    /// itself (connection, timeout, permissions). Never retried.
    #[error("datastore error: {0}")]
    Datastore(String),
}

impl Error {
    /// Only a lost compare-and-swap race is worth retrying in place.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::RevisionConflict { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_revision_conflicts_retry() {
        let cidr: IpNet = "10.0.0.0/30".parse().unwrap();
        assert!(Error::RevisionConflict { path: "/x".into() }.is_retryable());
        assert!(!Error::ConcurrentModification { cidr, attempts: 3 }.is_retryable());
        assert!(!Error::InsufficientIdentifiers.is_retryable());
    }

    #[test]
    fn messages_carry_context() {
        let cidr: IpNet = "10.0.0.0/30".parse().unwrap();
        let msg = Error::AlreadyUnallocated { cidr, ordinal: 2 }.to_string();
        assert!(msg.contains("10.0.0.0/30"));
        assert!(msg.contains('2'));
    }
}
