//! In-process committee used by the scenario tests

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::broadcast::LocalNetwork;
use crate::committee::{Committee, CommitteeMember};
use crate::error::{ConsensusError, LedgerError};
use crate::executor::{BatchContext, BatchExecutor, DigestExecutor};
use crate::ledger::{BalanceOracle, TransactionSubmitter};
use crate::operator::{Operator, OperatorBuilder, OperatorEvent};
use crate::types::{
    Address, Balances, BalancesResponse, Color, ConsensusConfig, Digest, PeerIndex,
    RequestMessage, ResultTransaction, StateIndex, TransactionEssence,
};

/// Ledger double: answers balance queries and records posted transactions
pub struct TestLedger {
    address: Address,
    anchor: Mutex<Digest>,
    balances: Balances,
    responsive: AtomicBool,
    balance_calls: AtomicUsize,
    posted: Mutex<Vec<ResultTransaction>>,
}

impl TestLedger {
    pub fn new(address: Address, anchor: Digest) -> Self {
        Self {
            address,
            anchor: Mutex::new(anchor),
            balances: Balances::from([(Color::NATIVE, 1_000_000)]),
            responsive: AtomicBool::new(true),
            balance_calls: AtomicUsize::new(0),
            posted: Mutex::new(Vec::new()),
        }
    }

    pub fn set_responsive(&self, responsive: bool) {
        self.responsive.store(responsive, Ordering::SeqCst);
    }

    pub fn balance_calls(&self) -> usize {
        self.balance_calls.load(Ordering::SeqCst)
    }

    pub fn posted(&self) -> Vec<ResultTransaction> {
        self.posted.lock().clone()
    }

    fn set_anchor(&self, anchor: Digest) {
        *self.anchor.lock() = anchor;
    }
}

#[async_trait]
impl BalanceOracle for TestLedger {
    async fn get_balances(&self, address: &Address) -> Result<BalancesResponse, LedgerError> {
        self.balance_calls.fetch_add(1, Ordering::SeqCst);
        if !self.responsive.load(Ordering::SeqCst) {
            return Err(LedgerError::Unavailable("offline".into()));
        }
        if *address != self.address {
            return Err(LedgerError::UnknownAddress(*address));
        }
        Ok(BalancesResponse {
            address: self.address,
            anchor: *self.anchor.lock(),
            balances: self.balances.clone(),
        })
    }
}

#[async_trait]
impl TransactionSubmitter for TestLedger {
    async fn post_transaction(&self, tx: &ResultTransaction) -> Result<(), LedgerError> {
        self.posted.lock().push(tx.clone());
        Ok(())
    }
}

/// Executor producing a different state hash than honest members
pub struct DivergentExecutor;

impl BatchExecutor for DivergentExecutor {
    fn execute(
        &self,
        ctx: &BatchContext,
        requests: &[RequestMessage],
    ) -> Result<ResultTransaction, ConsensusError> {
        let mut tx = DigestExecutor.execute(ctx, requests)?;
        tx.essence.state_hash = Digest::of(b"diverged");
        Ok(tx)
    }
}

/// Executor that fails its first `failures` batches, then behaves honestly
pub struct FlakyExecutor {
    failures_left: AtomicUsize,
}

impl FlakyExecutor {
    pub fn new(failures: usize) -> Self {
        Self {
            failures_left: AtomicUsize::new(failures),
        }
    }
}

impl BatchExecutor for FlakyExecutor {
    fn execute(
        &self,
        ctx: &BatchContext,
        requests: &[RequestMessage],
    ) -> Result<ResultTransaction, ConsensusError> {
        let fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(ConsensusError::Execution("injected failure".into()));
        }
        DigestExecutor.execute(ctx, requests)
    }
}

pub struct Node {
    pub operator: Operator,
    pub events: mpsc::UnboundedReceiver<OperatorEvent>,
}

pub struct Harness {
    pub committee: Arc<Committee>,
    pub network: LocalNetwork,
    pub ledger: Arc<TestLedger>,
    pub nodes: Vec<Node>,
    pub origin: ResultTransaction,
}

impl Harness {
    pub fn new(size: PeerIndex) -> Self {
        Self::with_executors(size, |_| -> Arc<dyn BatchExecutor> { Arc::new(DigestExecutor) })
    }

    pub fn with_executors(
        size: PeerIndex,
        executor_for: impl Fn(PeerIndex) -> Arc<dyn BatchExecutor>,
    ) -> Self {
        let (committee, shares) = Committee::generate(size, [77u8; 32]).unwrap();
        let committee = Arc::new(committee);
        let origin = ResultTransaction::origin(committee.address(), Balances::new());
        let ledger = Arc::new(TestLedger::new(committee.address(), origin.id()));
        let network = LocalNetwork::new(size);

        let nodes = shares
            .into_iter()
            .map(|share| {
                let index = share.index();
                let member = CommitteeMember::new(committee.clone(), share).unwrap();
                let (operator, events) = OperatorBuilder::new(member)
                    .config(ConsensusConfig::default())
                    .executor(executor_for(index))
                    .oracle(ledger.clone())
                    .submitter(ledger.clone())
                    .transport(Arc::new(network.transport(index)))
                    .build()
                    .unwrap();
                network.register(index, operator.handle());
                Node { operator, events }
            })
            .collect();

        Self {
            committee,
            network,
            ledger,
            nodes,
            origin,
        }
    }

    pub fn node(&self, index: PeerIndex) -> &Operator {
        &self.nodes[index as usize].operator
    }

    pub fn node_mut(&mut self, index: PeerIndex) -> &mut Operator {
        &mut self.nodes[index as usize].operator
    }

    /// A state transaction at `state_index`, as if the ledger confirmed it
    pub fn state_at(&self, state_index: StateIndex) -> ResultTransaction {
        ResultTransaction::new(TransactionEssence {
            state_index,
            prev_state_hash: Digest::of(&(state_index.wrapping_sub(1)).to_le_bytes()),
            state_hash: Digest::of(&state_index.to_le_bytes()),
            timestamp: 0,
            reward_target: self.committee.address(),
            balances: Balances::new(),
            request_ids: Vec::new(),
        })
    }

    /// Deliver a confirmed state to every node
    pub fn confirm(&mut self, state_tx: &ResultTransaction) {
        self.ledger.set_anchor(state_tx.id());
        for node in &mut self.nodes {
            node.operator.set_new_state(state_tx.clone(), state_tx.snapshot());
        }
        self.pump();
    }

    pub fn post_request(&mut self, request: &RequestMessage) {
        for node in &mut self.nodes {
            node.operator
                .handle_event(OperatorEvent::Request(request.clone()));
        }
        self.pump();
    }

    pub fn tick(&mut self) {
        for node in &mut self.nodes {
            node.operator.take_action();
        }
    }

    /// Handle queued events until every channel is empty
    pub fn pump(&mut self) -> usize {
        let mut handled = 0;
        loop {
            let mut progressed = false;
            for node in &mut self.nodes {
                while let Ok(event) = node.events.try_recv() {
                    node.operator.handle_event(event);
                    handled += 1;
                    progressed = true;
                }
            }
            if !progressed {
                return handled;
            }
        }
    }

    /// Pump until background tasks stop producing events
    pub async fn settle(&mut self) {
        let mut quiet = 0;
        while quiet < 3 {
            if self.pump() == 0 {
                quiet += 1;
                tokio::time::sleep(Duration::from_millis(5)).await;
            } else {
                quiet = 0;
            }
        }
    }

    /// Tick and settle until `done` holds, at most `max_rounds` times
    pub async fn drive(&mut self, max_rounds: usize, done: impl Fn(&Harness) -> bool) -> bool {
        for _ in 0..max_rounds {
            if done(self) {
                return true;
            }
            self.tick();
            self.settle().await;
        }
        done(self)
    }
}

pub fn request(nonce: u64) -> RequestMessage {
    RequestMessage::new(Address([0xAB; 32]), format!("request-{}", nonce).into_bytes(), nonce)
}
