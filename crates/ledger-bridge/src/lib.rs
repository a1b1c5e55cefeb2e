//! Ledger Bridge - the committee's view of the ledger
//!
//! Provides the ledger side of committee consensus:
//! - Answering balance queries for the committee address
//! - Accepting finalized, threshold-signed state transactions
//! - Relaying confirmed state transactions back to every operator

pub mod ledger;
pub mod relay;

pub use ledger::{Confirmation, LedgerSummary, MemoryLedger};
pub use relay::ConfirmationRelay;
