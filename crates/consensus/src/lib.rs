//! Committee Consensus - leader proposes, quorum confirms
//!
//! Architecture:
//! - The leader of the current state index fetches the committee balances,
//!   selects a request batch and broadcasts it to the committee
//! - Every member executes the batch deterministically and signs the essence
//!   hash of the resulting transaction with its key share
//! - The leader aggregates a quorum of matching shares and posts the
//!   finalized transaction to the ledger
//! - Confirmation of a new state transaction resets the round and rotates the
//!   per-request bookkeeping

pub mod broadcast;
pub mod committee;
pub mod crypto;
pub mod error;
pub mod executor;
pub mod leader;
pub mod ledger;
pub mod operator;
pub mod quorum;
pub mod requests;
pub mod submit;
pub mod subordinate;
pub mod transition;
pub mod types;

#[cfg(test)]
mod tests;

pub use broadcast::{LocalNetwork, LocalTransport, PeerTransport};
pub use committee::{Committee, CommitteeMember, LeaderRotation, RoundRobinRotation, SeededRotation};
pub use crypto::{KeyShare, SignatureShare, ThresholdSignature};
pub use error::{ConsensusError, LedgerError};
pub use executor::{run_batch, BatchContext, BatchExecutor, DigestExecutor, ExecutionOutcome};
pub use leader::{LeaderStatus, RoundPhase, SignedResult};
pub use ledger::{BalanceOracle, TransactionSubmitter};
pub use operator::{Operator, OperatorBuilder, OperatorEvent, OperatorHandle};
pub use requests::{BatchSelector, NotifiedBatchSelector, RequestBook, SelectionContext};
pub use submit::RetryPolicy;
pub use types::*;
