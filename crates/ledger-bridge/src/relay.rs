//! Confirmation Relay - delivers ledger confirmations to committee operators

use std::sync::Arc;
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinHandle;

use committee_consensus::{OperatorHandle, StateIndex};

use crate::ledger::Confirmation;

/// Forwards every confirmed state transaction to a set of operators
pub struct ConfirmationRelay {
    targets: Vec<OperatorHandle>,
    /// Last state index forwarded
    last_confirmed: Arc<RwLock<Option<StateIndex>>>,
}

impl ConfirmationRelay {
    pub fn new() -> Self {
        Self {
            targets: Vec::new(),
            last_confirmed: Arc::new(RwLock::new(None)),
        }
    }

    /// Add an operator to deliver confirmations to
    pub fn with_target(mut self, handle: OperatorHandle) -> Self {
        self.targets.push(handle);
        self
    }

    pub fn targets(&self) -> usize {
        self.targets.len()
    }

    /// Shared view of the last forwarded state index
    pub fn last_confirmed(&self) -> Arc<RwLock<Option<StateIndex>>> {
        self.last_confirmed.clone()
    }

    /// Deliver one confirmation to every operator; returns how many accepted it
    pub async fn forward(&self, confirmation: &Confirmation) -> usize {
        *self.last_confirmed.write().await = Some(confirmation.snapshot.state_index);
        let delivered = self
            .targets
            .iter()
            .filter(|handle| {
                handle.confirm_state(confirmation.state_tx.clone(), confirmation.snapshot)
            })
            .count();
        tracing::debug!(
            "Relayed state {} to {}/{} operators",
            confirmation.snapshot.state_index,
            delivered,
            self.targets.len()
        );
        delivered
    }

    /// Forward confirmations from `source` until it closes or `shutdown` flips
    pub fn spawn(
        self,
        mut source: broadcast::Receiver<Confirmation>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    received = source.recv() => match received {
                        Ok(confirmation) => {
                            self.forward(&confirmation).await;
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!("Relay lagged, {} confirmations skipped", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            tracing::info!("Confirmation relay stopped");
        })
    }
}

impl Default for ConfirmationRelay {
    fn default() -> Self {
        Self::new()
    }
}
