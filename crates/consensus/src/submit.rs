//! Fire-and-forget posting of finalized transactions with bounded retry

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::ledger::TransactionSubmitter;
use crate::types::ResultTransaction;

/// Fixed-interval retry bounded by a total window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Pause between attempts
    pub interval: Duration,
    /// No attempt starts later than this after the first one
    pub max_window: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            max_window: Duration::from_secs(7),
        }
    }
}

/// Spawn the posting loop. Abort the handle to cancel it.
///
/// The task yields `true` once the ledger accepted the transaction.
pub fn spawn_submission(
    submitter: Arc<dyn TransactionSubmitter>,
    tx: ResultTransaction,
    policy: RetryPolicy,
) -> JoinHandle<bool> {
    tokio::spawn(async move { submit_with_retry(submitter.as_ref(), &tx, policy).await })
}

/// Post `tx`, retrying on failure until the policy window is spent
pub async fn submit_with_retry(
    submitter: &dyn TransactionSubmitter,
    tx: &ResultTransaction,
    policy: RetryPolicy,
) -> bool {
    let started = Instant::now();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match submitter.post_transaction(tx).await {
            Ok(()) => {
                tracing::info!(
                    "Posted transaction {} for state {} (attempt {})",
                    tx.id(),
                    tx.state_index(),
                    attempt
                );
                return true;
            }
            Err(e) => {
                if started.elapsed() + policy.interval > policy.max_window {
                    tracing::warn!(
                        "Giving up posting transaction {} after {} attempts: {}",
                        tx.id(),
                        attempt,
                        e
                    );
                    return false;
                }
                tracing::debug!(
                    "Posting transaction {} failed, retrying in {:?}: {}",
                    tx.id(),
                    policy.interval,
                    e
                );
                tokio::time::sleep(policy.interval).await;
            }
        }
    }
}
