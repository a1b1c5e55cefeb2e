//! In-memory ledger holding one committee-controlled chain
//!
//! Accepts a state transaction only if it extends the current state and
//! carries a valid threshold signature of the committee. Every accepted
//! transaction is published to subscribers as a [`Confirmation`].

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use committee_consensus::{
    Address, BalanceOracle, Balances, BalancesResponse, Committee, LedgerError,
    ResultTransaction, StateIndex, StateSnapshot, TransactionSubmitter,
};

/// Capacity of the confirmation channel
const CONFIRMATION_BUFFER: usize = 64;

/// A state transaction the ledger accepted
#[derive(Debug, Clone)]
pub struct Confirmation {
    pub state_tx: ResultTransaction,
    pub snapshot: StateSnapshot,
}

/// Point-in-time view of the ledger, for status output
#[derive(Debug, Clone, Serialize)]
pub struct LedgerSummary {
    pub address: String,
    pub state_index: StateIndex,
    pub anchor: String,
    pub confirmed: usize,
    pub rejected: u64,
    pub balances: Vec<(String, u64)>,
}

struct LedgerState {
    current: ResultTransaction,
    balances: Balances,
    /// Accepted transactions, origin first
    history: Vec<ResultTransaction>,
    rejected: u64,
    /// Posts to fail with `Unavailable` before accepting again
    failures_pending: u32,
}

/// Ledger for a single committee address
pub struct MemoryLedger {
    committee: Arc<Committee>,
    state: RwLock<LedgerState>,
    confirmations: broadcast::Sender<Confirmation>,
}

impl MemoryLedger {
    /// Create a ledger whose chain starts at `origin`
    pub fn new(committee: Arc<Committee>, origin: ResultTransaction) -> Self {
        let (confirmations, _) = broadcast::channel(CONFIRMATION_BUFFER);
        Self {
            committee,
            state: RwLock::new(LedgerState {
                balances: origin.essence.balances.clone(),
                current: origin.clone(),
                history: vec![origin],
                rejected: 0,
                failures_pending: 0,
            }),
            confirmations,
        }
    }

    pub fn address(&self) -> Address {
        self.committee.address()
    }

    /// Receive every transaction accepted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<Confirmation> {
        self.confirmations.subscribe()
    }

    /// Latest accepted state transaction
    pub async fn current(&self) -> ResultTransaction {
        self.state.read().await.current.clone()
    }

    pub async fn confirmation(&self) -> Confirmation {
        let current = self.current().await;
        Confirmation {
            snapshot: current.snapshot(),
            state_tx: current,
        }
    }

    pub async fn state_index(&self) -> StateIndex {
        self.state.read().await.current.state_index()
    }

    pub async fn history(&self) -> Vec<ResultTransaction> {
        self.state.read().await.history.clone()
    }

    /// Make the next `count` posts fail as if the ledger were unreachable
    pub async fn fail_next_posts(&self, count: u32) {
        self.state.write().await.failures_pending = count;
    }

    pub async fn summary(&self) -> LedgerSummary {
        let state = self.state.read().await;
        LedgerSummary {
            address: self.address().to_base58(),
            state_index: state.current.state_index(),
            anchor: state.current.id().to_base58(),
            confirmed: state.history.len(),
            rejected: state.rejected,
            balances: state
                .balances
                .iter()
                .map(|(color, amount)| (color.to_base58(), *amount))
                .collect(),
        }
    }

    fn validate(&self, state: &LedgerState, tx: &ResultTransaction) -> Result<(), LedgerError> {
        let expected = state.current.state_index().checked_add(1);
        if Some(tx.state_index()) != expected {
            return Err(LedgerError::Rejected(format!(
                "state index {} does not follow {}",
                tx.state_index(),
                state.current.state_index()
            )));
        }
        if tx.essence.prev_state_hash != state.current.essence.state_hash {
            return Err(LedgerError::Rejected(format!(
                "previous state hash {} does not match {}",
                tx.essence.prev_state_hash, state.current.essence.state_hash
            )));
        }
        if !tx.signatures_valid(&self.committee) {
            return Err(LedgerError::Rejected("invalid threshold signature".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl BalanceOracle for MemoryLedger {
    async fn get_balances(&self, address: &Address) -> Result<BalancesResponse, LedgerError> {
        if *address != self.address() {
            return Err(LedgerError::UnknownAddress(*address));
        }
        let state = self.state.read().await;
        Ok(BalancesResponse {
            address: *address,
            anchor: state.current.id(),
            balances: state.balances.clone(),
        })
    }
}

#[async_trait]
impl TransactionSubmitter for MemoryLedger {
    async fn post_transaction(&self, tx: &ResultTransaction) -> Result<(), LedgerError> {
        let mut state = self.state.write().await;
        if state.failures_pending > 0 {
            state.failures_pending -= 1;
            return Err(LedgerError::Unavailable("injected failure".into()));
        }
        if tx.id() == state.current.id() {
            tracing::debug!("Transaction {} already confirmed", tx.id());
            return Ok(());
        }
        if let Err(e) = self.validate(&state, tx) {
            state.rejected += 1;
            tracing::warn!("Rejected transaction {}: {}", tx.id(), e);
            return Err(e);
        }

        state.balances = tx.essence.balances.clone();
        state.current = tx.clone();
        state.history.push(tx.clone());
        tracing::info!(
            "Ledger confirmed state {} (tx {}, {} requests)",
            tx.state_index(),
            tx.id(),
            tx.essence.request_ids.len()
        );

        // no subscribers is fine
        let _ = self.confirmations.send(Confirmation {
            state_tx: tx.clone(),
            snapshot: tx.snapshot(),
        });
        Ok(())
    }
}
