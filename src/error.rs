//! Error types for ledger validation
//!
//! Every rejection carries a DoS penalty that the caller may charge to the
//! peer which relayed the offending item.

use thiserror::Error;

use crate::types::{short_hash, Hash};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsensusError {
    #[error("structural check failed: {reason}")]
    Structural { reason: String, dos: u32 },

    #[error("parent block {} unknown", short_hash(.0))]
    MissingParent(Hash),

    #[error("inputs not found")]
    MissingInputs,

    #[error("stake data unavailable: {0}")]
    MissingStakeData(String),

    #[error("consensus rule violated: {reason}")]
    Violation { reason: String, dos: u32 },

    #[error("resource limit: {0}")]
    ResourceLimit(String),

    #[error("{} already known", short_hash(.0))]
    AlreadyKnown(Hash),

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Coarse classification of a rejection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed regardless of context
    Structural,
    /// Could be valid once missing data arrives
    ContextualUnknown,
    /// Contradicts chain state
    ConsensusViolation,
    /// Size, count or rate limit exceeded
    ResourceLimit,
    /// Already seen
    Duplicate,
    /// Storage or encoding fault on this node
    Internal,
}

impl ConsensusError {
    pub fn structural(reason: impl Into<String>, dos: u32) -> Self {
        ConsensusError::Structural { reason: reason.into(), dos }
    }

    pub fn violation(reason: impl Into<String>, dos: u32) -> Self {
        ConsensusError::Violation { reason: reason.into(), dos }
    }

    /// Misbehavior penalty for the relaying peer
    pub fn dos_score(&self) -> u32 {
        match self {
            ConsensusError::Structural { dos, .. } | ConsensusError::Violation { dos, .. } => *dos,
            _ => 0,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ConsensusError::Structural { .. } | ConsensusError::Serialization(_) => ErrorKind::Structural,
            ConsensusError::MissingParent(_)
            | ConsensusError::MissingInputs
            | ConsensusError::MissingStakeData(_) => ErrorKind::ContextualUnknown,
            ConsensusError::Violation { .. } => ErrorKind::ConsensusViolation,
            ConsensusError::ResourceLimit(_) => ErrorKind::ResourceLimit,
            ConsensusError::AlreadyKnown(_) => ErrorKind::Duplicate,
            ConsensusError::Storage(_) => ErrorKind::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, ConsensusError>;
