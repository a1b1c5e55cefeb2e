//! Consensus and ledger errors

use thiserror::Error;

use crate::types::{Address, PeerIndex, RequestId};

/// Consensus operator errors
#[derive(Error, Debug)]
pub enum ConsensusError {
    #[error("Invalid committee size {0}")]
    InvalidCommitteeSize(usize),

    #[error("Invalid public key for peer {0}")]
    InvalidPublicKey(PeerIndex),

    #[error("Peer {0} is not a committee member")]
    UnknownPeer(PeerIndex),

    #[error("Request message missing for {0}")]
    MissingRequestMessage(RequestId),

    #[error("Duplicate signature share from peer {0}")]
    DuplicateShare(PeerIndex),

    #[error("Not enough signature shares: have {have}, need {need}")]
    InsufficientShares { have: usize, need: usize },

    #[error("Aggregated signature failed verification")]
    InvalidAggregate,

    #[error("Batch execution failed: {0}")]
    Execution(String),

    #[error("Peer {0} unreachable")]
    Unreachable(PeerIndex),

    #[error("Operator is missing its {0}")]
    MissingCollaborator(&'static str),

    #[error("Invalid operator config: {0}")]
    InvalidConfig(&'static str),

    #[error("Message codec error: {0}")]
    Codec(#[from] borsh::io::Error),
}

/// Failures reported by ledger-side collaborators
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Ledger unavailable: {0}")]
    Unavailable(String),

    #[error("Unknown address {0}")]
    UnknownAddress(Address),

    #[error("Transaction rejected: {0}")]
    Rejected(String),
}
