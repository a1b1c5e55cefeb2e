//! Consensus operator - owns all per-chain consensus state
//!
//! The operator is driven by one task: ticks call [`Operator::take_action`],
//! everything else (peer messages, balances, confirmations, execution results)
//! arrives as an [`OperatorEvent`] on its channel. Background work never
//! touches operator state directly; it reports back through the same channel.

use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::broadcast::PeerTransport;
use crate::committee::{CommitteeMember, LeaderRotation, RoundRobinRotation};
use crate::error::ConsensusError;
use crate::executor::{run_batch, BatchExecutor, ExecutionOutcome, ExecutionParams};
use crate::leader::{LeaderStatus, SignedResult};
use crate::ledger::{BalanceOracle, TransactionSubmitter};
use crate::requests::{BatchSelector, NotifiedBatchSelector, RequestBook};
use crate::subordinate::ComputationQueue;
use crate::types::{
    Address, Balances, BalancesResponse, ConsensusConfig, Digest, OperatorStats, PeerIndex,
    PeerMessage, RequestId, RequestMessage, ResultTransaction, SignedResultMessage, StateIndex,
    StateSnapshot,
};

/// Inputs to the operator
#[derive(Debug)]
pub enum OperatorEvent {
    /// A request addressed to the chain arrived at this node
    Request(RequestMessage),
    /// Message from another committee member
    Peer { from: PeerIndex, message: PeerMessage },
    /// Answer to a balance query
    Balances(BalancesResponse),
    /// The ledger confirmed a new state transaction
    NewState {
        state_tx: ResultTransaction,
        snapshot: StateSnapshot,
    },
    /// An execution task finished
    Executed(ExecutionOutcome),
    /// An execution task returned an error
    ExecutionFailed {
        anchor: Digest,
        leader: PeerIndex,
        batch_hash: Digest,
        timestamp: u64,
        request_ids: Vec<RequestId>,
    },
}

/// Cloneable sender side of an operator's event channel
#[derive(Debug, Clone)]
pub struct OperatorHandle {
    events: mpsc::UnboundedSender<OperatorEvent>,
}

impl OperatorHandle {
    /// New event channel: the handle and the receiver an operator drains
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<OperatorEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Self { events }, rx)
    }

    pub fn send(&self, event: OperatorEvent) -> bool {
        self.events.send(event).is_ok()
    }

    pub fn post_request(&self, request: RequestMessage) -> bool {
        self.send(OperatorEvent::Request(request))
    }

    pub fn deliver_peer_message(&self, from: PeerIndex, message: PeerMessage) -> bool {
        self.send(OperatorEvent::Peer { from, message })
    }

    pub fn deliver_balances(&self, response: BalancesResponse) -> bool {
        self.send(OperatorEvent::Balances(response))
    }

    pub fn confirm_state(&self, state_tx: ResultTransaction, snapshot: StateSnapshot) -> bool {
        self.send(OperatorEvent::NewState { state_tx, snapshot })
    }
}

/// Per-chain committee consensus state machine
pub struct Operator {
    pub(crate) member: CommitteeMember,
    pub(crate) rotation: Arc<dyn LeaderRotation>,
    pub(crate) selector: Box<dyn BatchSelector>,
    pub(crate) executor: Arc<dyn BatchExecutor>,
    pub(crate) oracle: Arc<dyn BalanceOracle>,
    pub(crate) submitter: Arc<dyn TransactionSubmitter>,
    pub(crate) transport: Arc<dyn PeerTransport>,
    pub(crate) config: ConsensusConfig,
    pub(crate) handle: OperatorHandle,

    /// Latest confirmed state transaction and its committed state
    pub(crate) state_tx: Option<ResultTransaction>,
    pub(crate) snapshot: Option<StateSnapshot>,
    pub(crate) balances: Option<Balances>,
    pub(crate) balances_deadline: Instant,
    pub(crate) leader_status: Option<LeaderStatus>,
    pub(crate) requests: RequestBook,
    pub(crate) computations: ComputationQueue,
    pub(crate) submission: Option<JoinHandle<bool>>,
    pub(crate) stats: OperatorStats,
}

impl Operator {
    pub fn handle(&self) -> OperatorHandle {
        self.handle.clone()
    }

    pub fn own_index(&self) -> PeerIndex {
        self.member.own_index()
    }

    pub fn member(&self) -> &CommitteeMember {
        &self.member
    }

    pub fn state_index(&self) -> Option<StateIndex> {
        self.snapshot.map(|s| s.state_index)
    }

    /// Id of the current state transaction
    pub fn anchor(&self) -> Option<Digest> {
        self.state_tx.as_ref().map(ResultTransaction::id)
    }

    pub fn balances(&self) -> Option<&Balances> {
        self.balances.as_ref()
    }

    pub fn leader_status(&self) -> Option<&LeaderStatus> {
        self.leader_status.as_ref()
    }

    pub fn requests(&self) -> &RequestBook {
        &self.requests
    }

    pub fn computations(&self) -> &ComputationQueue {
        &self.computations
    }

    pub fn stats(&self) -> OperatorStats {
        let mut stats = self.stats.clone();
        stats.state_index = self.state_index();
        stats
    }

    pub(crate) fn reward_target(&self) -> Address {
        self.config.reward_target.unwrap_or_else(|| self.member.address())
    }

    /// One scheduler tick: subordinate dispatch, leader role, quorum check
    pub fn take_action(&mut self) {
        if self.snapshot.is_none() {
            tracing::trace!("Peer {} has no committed state yet", self.own_index());
            return;
        }
        self.do_subordinate();
        self.do_leader();
        self.check_quorum();
    }

    pub fn handle_event(&mut self, event: OperatorEvent) {
        match event {
            OperatorEvent::Request(request) => self.on_request(request),
            OperatorEvent::Peer { from, message } => self.on_peer_message(from, message),
            OperatorEvent::Balances(response) => self.on_balances(response),
            OperatorEvent::NewState { state_tx, snapshot } => self.set_new_state(state_tx, snapshot),
            OperatorEvent::Executed(outcome) => self.on_execution_outcome(outcome),
            OperatorEvent::ExecutionFailed {
                anchor,
                leader,
                batch_hash,
                timestamp,
                request_ids,
            } => self.on_execution_failed(anchor, leader, batch_hash, timestamp, &request_ids),
        }
    }

    /// Drive the operator until `shutdown` flips; returns its final counters
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<OperatorEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> OperatorStats {
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            "Operator {} running (committee of {}, quorum {})",
            self.own_index(),
            self.member.size(),
            self.member.quorum()
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
                _ = ticker.tick() => self.take_action(),
            }
        }

        if let Some(submission) = self.submission.take() {
            submission.abort();
        }
        tracing::info!("Operator {} stopped", self.own_index());
        self.stats()
    }

    fn on_request(&mut self, request: RequestMessage) {
        let id = request.id;
        if !self.requests.add_message(request) {
            return;
        }
        tracing::debug!("Peer {} received request {}", self.own_index(), id);
        if let Some(state_index) = self.state_index() {
            self.transport.broadcast(&PeerMessage::NotifyRequests {
                state_index,
                request_ids: vec![id],
            });
        }
    }

    fn on_peer_message(&mut self, from: PeerIndex, message: PeerMessage) {
        if from >= self.member.size() || from == self.own_index() {
            tracing::warn!("Dropping {} from invalid sender {}", message.kind(), from);
            return;
        }
        match message {
            PeerMessage::NotifyRequests {
                state_index,
                request_ids,
            } => self.on_notify_requests(from, state_index, &request_ids),
            PeerMessage::StartProcessing(msg) => self.on_start_processing(from, msg),
            PeerMessage::SignedResult(msg) => self.on_signed_result(from, msg),
        }
    }

    fn on_notify_requests(&mut self, from: PeerIndex, state_index: StateIndex, ids: &[RequestId]) {
        let Some(current) = self.state_index() else {
            return;
        };
        if state_index == current {
            self.requests.record_notification(from, ids, false);
        } else if Some(state_index) == current.checked_add(1) {
            self.requests.record_notification(from, ids, true);
        } else {
            tracing::trace!(
                "Ignoring notification from {} for state {} (current {})",
                from,
                state_index,
                current
            );
        }
    }

    fn on_balances(&mut self, response: BalancesResponse) {
        if response.address != self.member.address() {
            tracing::warn!("Balances for foreign address {} ignored", response.address);
            return;
        }
        if Some(response.anchor) != self.anchor() {
            tracing::debug!("Stale balances for anchor {} dropped", response.anchor);
            return;
        }
        if self.balances.is_none() {
            tracing::debug!(
                "Balances received for state {:?}: {} colors",
                self.state_index(),
                response.balances.len()
            );
            self.balances = Some(response.balances);
        }
    }

    /// Launch an execution task; the outcome comes back as an event
    pub(crate) fn spawn_execution(&mut self, params: ExecutionParams) {
        let executor = self.executor.clone();
        let member = self.member.clone();
        let handle = self.handle.clone();
        self.stats.batches_executed += 1;

        tokio::task::spawn_blocking(move || {
            let failed = OperatorEvent::ExecutionFailed {
                anchor: params.anchor,
                leader: params.context.leader,
                batch_hash: params.batch_hash,
                timestamp: params.context.timestamp,
                request_ids: params.requests.iter().map(|r| r.id).collect(),
            };
            match run_batch(executor.as_ref(), &member, params) {
                Ok(outcome) => {
                    handle.send(OperatorEvent::Executed(outcome));
                }
                Err(e) => {
                    tracing::error!("Batch execution failed: {}", e);
                    handle.send(failed);
                }
            }
        });
    }

    /// Abandon a round whose own execution failed so the next tick can propose again.
    ///
    /// A subordinate keeps its proposal processed; the leader's retry arrives
    /// with a new timestamp and replaces it.
    pub(crate) fn on_execution_failed(
        &mut self,
        anchor: Digest,
        leader: PeerIndex,
        batch_hash: Digest,
        timestamp: u64,
        request_ids: &[RequestId],
    ) {
        if Some(anchor) != self.anchor() || leader != self.own_index() {
            return;
        }
        let matches = self
            .leader_status
            .as_ref()
            .map_or(false, |s| s.batch_hash == batch_hash && s.timestamp == timestamp);
        if !matches {
            return;
        }

        self.leader_status = None;
        self.requests.unmark_processed(request_ids);
        self.stats.rounds_aborted += 1;
        tracing::warn!(
            "Round for batch {} abandoned after execution failure; {} requests released",
            batch_hash,
            request_ids.len()
        );
    }

    /// Accept an execution result: keep it as leader, or return it to the leader.
    ///
    /// Results computed against a state other than the current one are dropped.
    pub(crate) fn on_execution_outcome(&mut self, outcome: ExecutionOutcome) {
        if Some(outcome.anchor) != self.anchor() {
            tracing::debug!(
                "Dropping execution result for stale state {} (batch {})",
                outcome.state_index,
                outcome.batch_hash
            );
            self.stats.stale_results_dropped += 1;
            return;
        }

        let own = self.own_index();
        if outcome.leader == own {
            let status = match self.leader_status.as_mut() {
                Some(status)
                    if status.batch_hash == outcome.batch_hash
                        && status.timestamp == outcome.timestamp =>
                {
                    status
                }
                _ => {
                    tracing::debug!("Dropping own result for abandoned batch {}", outcome.batch_hash);
                    self.stats.stale_results_dropped += 1;
                    return;
                }
            };
            status.record_result(
                own,
                SignedResult {
                    essence_hash: outcome.essence_hash,
                    share: outcome.share,
                },
            );
            if status.result_tx.is_none() {
                status.result_tx = Some(outcome.transaction);
            }
            return;
        }

        let message = PeerMessage::SignedResult(SignedResultMessage {
            state_index: outcome.state_index,
            batch_hash: outcome.batch_hash,
            timestamp: outcome.timestamp,
            essence_hash: outcome.essence_hash,
            share: outcome.share,
        });
        if let Err(e) = self.transport.send(outcome.leader, &message) {
            tracing::warn!("Failed to return result to leader {}: {}", outcome.leader, e);
        }
    }
}

/// Builder for Operator
pub struct OperatorBuilder {
    member: CommitteeMember,
    config: ConsensusConfig,
    rotation: Arc<dyn LeaderRotation>,
    selector: Box<dyn BatchSelector>,
    executor: Option<Arc<dyn BatchExecutor>>,
    oracle: Option<Arc<dyn BalanceOracle>>,
    submitter: Option<Arc<dyn TransactionSubmitter>>,
    transport: Option<Arc<dyn PeerTransport>>,
}

impl OperatorBuilder {
    pub fn new(member: CommitteeMember) -> Self {
        Self {
            member,
            config: ConsensusConfig::default(),
            rotation: Arc::new(RoundRobinRotation),
            selector: Box::new(NotifiedBatchSelector::default()),
            executor: None,
            oracle: None,
            submitter: None,
            transport: None,
        }
    }

    pub fn config(mut self, config: ConsensusConfig) -> Self {
        self.config = config;
        self
    }

    pub fn rotation(mut self, rotation: Arc<dyn LeaderRotation>) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn selector(mut self, selector: Box<dyn BatchSelector>) -> Self {
        self.selector = selector;
        self
    }

    pub fn executor(mut self, executor: Arc<dyn BatchExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn oracle(mut self, oracle: Arc<dyn BalanceOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    pub fn submitter(mut self, submitter: Arc<dyn TransactionSubmitter>) -> Self {
        self.submitter = Some(submitter);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn PeerTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Build the operator and the receiving end of its event channel
    pub fn build(self) -> Result<(Operator, mpsc::UnboundedReceiver<OperatorEvent>), ConsensusError> {
        let executor = self
            .executor
            .ok_or(ConsensusError::MissingCollaborator("batch executor"))?;
        let oracle = self
            .oracle
            .ok_or(ConsensusError::MissingCollaborator("balance oracle"))?;
        let submitter = self
            .submitter
            .ok_or(ConsensusError::MissingCollaborator("transaction submitter"))?;
        let transport = self
            .transport
            .ok_or(ConsensusError::MissingCollaborator("peer transport"))?;
        if self.config.tick_interval.is_zero() {
            return Err(ConsensusError::InvalidConfig("tick interval must be positive"));
        }

        let (handle, rx) = OperatorHandle::channel();
        let size = self.member.size();
        let own = self.member.own_index();

        let operator = Operator {
            member: self.member,
            rotation: self.rotation,
            selector: self.selector,
            executor,
            oracle,
            submitter,
            transport,
            config: self.config,
            handle,
            state_tx: None,
            snapshot: None,
            balances: None,
            balances_deadline: Instant::now(),
            leader_status: None,
            requests: RequestBook::new(size, own),
            computations: ComputationQueue::default(),
            submission: None,
            stats: OperatorStats::default(),
        };
        Ok((operator, rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::LocalNetwork;
    use crate::committee::Committee;
    use crate::executor::DigestExecutor;
    use crate::tests::harness::TestLedger;
    use std::time::Duration;

    #[test]
    fn test_zero_tick_interval_is_rejected() {
        let (committee, shares) = Committee::generate(4, [21u8; 32]).unwrap();
        let committee = Arc::new(committee);
        let ledger = Arc::new(TestLedger::new(committee.address(), Digest::ZERO));
        let network = LocalNetwork::new(4);
        let share = shares.into_iter().next().unwrap();
        let member = CommitteeMember::new(committee, share).unwrap();

        let result = OperatorBuilder::new(member)
            .config(ConsensusConfig {
                tick_interval: Duration::ZERO,
                ..ConsensusConfig::default()
            })
            .executor(Arc::new(DigestExecutor))
            .oracle(ledger.clone())
            .submitter(ledger)
            .transport(Arc::new(network.transport(0)))
            .build();
        assert!(matches!(result, Err(ConsensusError::InvalidConfig(_))));
    }
}
