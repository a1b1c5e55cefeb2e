//! Ledger-side collaborators consumed by the operator

use async_trait::async_trait;

use crate::error::LedgerError;
use crate::types::{Address, BalancesResponse, ResultTransaction};

/// On-demand snapshot of an address's funds.
///
/// Queries carry no ordering guarantee; the operator throttles them itself.
#[async_trait]
pub trait BalanceOracle: Send + Sync {
    async fn get_balances(&self, address: &Address) -> Result<BalancesResponse, LedgerError>;
}

/// Posts finalized transactions to the ledger.
///
/// Posting an already confirmed transaction again must be harmless.
#[async_trait]
pub trait TransactionSubmitter: Send + Sync {
    async fn post_transaction(&self, tx: &ResultTransaction) -> Result<(), LedgerError>;
}
