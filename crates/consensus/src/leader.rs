//! Leader round controller - balance acquisition, batch selection and proposal

use tokio::time::Instant;

use crate::crypto::SignatureShare;
use crate::error::LedgerError;
use crate::executor::{BatchContext, ExecutionParams};
use crate::operator::Operator;
use crate::requests::SelectionContext;
use crate::types::{
    batch_hash, now_millis, Digest, PeerIndex, PeerMessage, RequestId, ResultTransaction,
    StartProcessing, StateIndex,
};

/// One member's result for the round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignedResult {
    pub essence_hash: Digest,
    pub share: SignatureShare,
}

/// Bookkeeping of the round this node leads
#[derive(Debug, Clone)]
pub struct LeaderStatus {
    /// State transaction the round runs against
    pub(crate) anchor: Digest,
    pub(crate) state_index: StateIndex,
    pub(crate) requests: Vec<RequestId>,
    pub(crate) batch_hash: Digest,
    pub(crate) timestamp: u64,
    pub(crate) signed_results: Vec<Option<SignedResult>>,
    pub(crate) result_tx: Option<ResultTransaction>,
    pub(crate) finalized: bool,
}

impl LeaderStatus {
    pub(crate) fn new(
        anchor: Digest,
        state_index: StateIndex,
        requests: Vec<RequestId>,
        timestamp: u64,
        committee_size: PeerIndex,
    ) -> Self {
        Self {
            anchor,
            state_index,
            batch_hash: batch_hash(&requests),
            requests,
            timestamp,
            signed_results: vec![None; committee_size as usize],
            result_tx: None,
            finalized: false,
        }
    }

    pub fn anchor(&self) -> Digest {
        self.anchor
    }

    pub fn state_index(&self) -> StateIndex {
        self.state_index
    }

    pub fn requests(&self) -> &[RequestId] {
        &self.requests
    }

    pub fn batch_hash(&self) -> Digest {
        self.batch_hash
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn signed_result(&self, peer: PeerIndex) -> Option<&SignedResult> {
        self.signed_results.get(peer as usize).and_then(Option::as_ref)
    }

    pub fn result_tx(&self) -> Option<&ResultTransaction> {
        self.result_tx.as_ref()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }
}

/// Where the round led by this node stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundPhase {
    /// Not leading, or nothing in flight
    Idle,
    /// Leading, balances not known yet
    AwaitingBalances,
    /// Batch broadcast, own execution still running
    Proposed,
    /// Own result known, collecting shares
    AwaitingQuorum,
    Finalized,
}

impl Operator {
    /// Whether the rotation names this node leader of the current state
    pub fn is_current_leader(&self) -> bool {
        match self.state_index() {
            Some(state_index) => {
                self.rotation.leader_for_state(state_index, self.member.size()) == self.own_index()
            }
            None => false,
        }
    }

    pub fn round_phase(&self) -> RoundPhase {
        match &self.leader_status {
            Some(status) if status.finalized => RoundPhase::Finalized,
            Some(status) if status.result_tx.is_some() => RoundPhase::AwaitingQuorum,
            Some(_) => RoundPhase::Proposed,
            None if self.is_current_leader() && self.balances.is_none() => {
                RoundPhase::AwaitingBalances
            }
            None => RoundPhase::Idle,
        }
    }

    pub(crate) fn do_leader(&mut self) {
        if !self.is_current_leader() {
            return;
        }
        if self.balances.is_none() {
            self.request_balances();
        } else {
            self.start_processing();
        }
    }

    /// Ask the oracle for balances, at most once per `balances_timeout`
    pub(crate) fn request_balances(&mut self) {
        let now = Instant::now();
        if self.balances.is_some() || now < self.balances_deadline {
            return;
        }

        let oracle = self.oracle.clone();
        let handle = self.handle.clone();
        let address = self.member.address();
        tokio::spawn(async move {
            match oracle.get_balances(&address).await {
                Ok(response) => {
                    handle.deliver_balances(response);
                }
                Err(LedgerError::UnknownAddress(addr)) => {
                    tracing::warn!("Ledger does not know committee address {}", addr);
                }
                Err(e) => tracing::warn!("Balance request for {} failed: {}", address, e),
            }
        });

        self.balances_deadline = now + self.config.balances_timeout;
        self.stats.balance_requests += 1;
        tracing::debug!("Requested balances of {}", address);
    }

    /// Select a batch, broadcast it and start executing it locally
    pub(crate) fn start_processing(&mut self) {
        let Some(balances) = self.balances.clone() else {
            return;
        };
        if self.leader_status.is_some() {
            // batch already selected and execution started
            return;
        }
        let (Some(snapshot), Some(anchor)) = (self.snapshot, self.anchor()) else {
            return;
        };

        let timestamp = now_millis();
        let ctx = SelectionContext {
            state_index: snapshot.state_index,
            timestamp,
            quorum: self.member.quorum(),
            max_batch_size: self.config.max_batch_size,
        };
        let candidates = self.requests.candidates(timestamp);
        let request_ids = self.selector.select(&candidates, &ctx);
        if request_ids.is_empty() {
            tracing::debug!("Can't select requests to process at state {}", snapshot.state_index);
            return;
        }

        // every selected id must have its message
        let messages = match self.requests.take_messages(&request_ids) {
            Ok(messages) => messages,
            Err(e) => {
                tracing::error!("Selected batch is not executable: {}", e);
                return;
            }
        };

        tracing::debug!(
            "Requests selected to process at state {}: batch size {}",
            snapshot.state_index,
            request_ids.len()
        );

        let reward_target = self.reward_target();
        let message = PeerMessage::StartProcessing(StartProcessing {
            state_index: snapshot.state_index,
            timestamp,
            reward_target,
            balances: balances.clone(),
            request_ids: request_ids.clone(),
        });
        let sent = self.transport.broadcast(&message);
        let needed = self.member.quorum().saturating_sub(1) as usize;
        if sent < needed {
            tracing::error!(
                "Only {} StartProcessing sends succeeded at state {}, need {}",
                sent,
                snapshot.state_index,
                needed
            );
            self.stats.rounds_aborted += 1;
            return;
        }

        self.requests.mark_processed(&request_ids);
        let status = LeaderStatus::new(
            anchor,
            snapshot.state_index,
            request_ids,
            timestamp,
            self.member.size(),
        );
        let batch = status.batch_hash;
        self.leader_status = Some(status);
        self.stats.rounds_started += 1;
        tracing::debug!("StartProcessing for batch {} sent to {} peers", batch, sent);

        let leader = self.own_index();
        self.spawn_execution(ExecutionParams {
            anchor,
            batch_hash: batch,
            context: BatchContext {
                snapshot,
                balances,
                reward_target,
                timestamp,
                leader,
            },
            requests: messages,
        });
    }
}
