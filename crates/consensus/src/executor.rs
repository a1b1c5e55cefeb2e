//! Batch execution task - turns a request batch into a signed candidate transaction

use crate::committee::CommitteeMember;
use crate::crypto::SignatureShare;
use crate::error::ConsensusError;
use crate::types::{
    Address, Balances, Digest, PeerIndex, RequestMessage, ResultTransaction, StateIndex,
    StateSnapshot, TransactionEssence,
};

/// Everything besides the requests that determines an execution result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchContext {
    pub snapshot: StateSnapshot,
    pub balances: Balances,
    pub reward_target: Address,
    /// Leader's round timestamp (unix millis)
    pub timestamp: u64,
    pub leader: PeerIndex,
}

/// Deterministic execution engine.
///
/// Identical context and requests must always produce a transaction with the
/// same essence hash, on every node.
pub trait BatchExecutor: Send + Sync {
    fn execute(
        &self,
        ctx: &BatchContext,
        requests: &[RequestMessage],
    ) -> Result<ResultTransaction, ConsensusError>;
}

/// Reference executor: folds request payloads into the next state hash
#[derive(Debug, Clone, Copy, Default)]
pub struct DigestExecutor;

impl BatchExecutor for DigestExecutor {
    fn execute(
        &self,
        ctx: &BatchContext,
        requests: &[RequestMessage],
    ) -> Result<ResultTransaction, ConsensusError> {
        let state_index = ctx
            .snapshot
            .state_index
            .checked_add(1)
            .ok_or_else(|| ConsensusError::Execution("state index overflow".into()))?;

        let mut hasher = blake3::Hasher::new();
        hasher.update(ctx.snapshot.state_hash.as_ref());
        hasher.update(&ctx.timestamp.to_le_bytes());
        hasher.update(ctx.reward_target.as_ref());
        for request in requests {
            hasher.update(request.id.as_ref());
            hasher.update(request.sender.as_ref());
            hasher.update(&request.payload);
        }

        Ok(ResultTransaction::new(TransactionEssence {
            state_index,
            prev_state_hash: ctx.snapshot.state_hash,
            state_hash: Digest(*hasher.finalize().as_bytes()),
            timestamp: ctx.timestamp,
            reward_target: ctx.reward_target,
            balances: ctx.balances.clone(),
            request_ids: requests.iter().map(|r| r.id).collect(),
        }))
    }
}

/// Input of one execution task
#[derive(Debug, Clone)]
pub struct ExecutionParams {
    /// State transaction the batch runs against
    pub anchor: Digest,
    pub batch_hash: Digest,
    pub context: BatchContext,
    pub requests: Vec<RequestMessage>,
}

/// Result of one execution task, handed back to the operator
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    /// Index of the state the batch ran against
    pub state_index: StateIndex,
    pub anchor: Digest,
    pub leader: PeerIndex,
    pub batch_hash: Digest,
    pub timestamp: u64,
    pub transaction: ResultTransaction,
    pub essence_hash: Digest,
    pub share: SignatureShare,
}

/// Execute a batch and sign the resulting essence with this node's key share
pub fn run_batch(
    executor: &dyn BatchExecutor,
    member: &CommitteeMember,
    params: ExecutionParams,
) -> Result<ExecutionOutcome, ConsensusError> {
    let transaction = executor.execute(&params.context, &params.requests)?;
    let essence_hash = transaction.essence_hash();
    let share = member.sign(&essence_hash);

    tracing::debug!(
        "Executed batch {} ({} requests) for state {}: essence {}",
        params.batch_hash,
        params.requests.len(),
        params.context.snapshot.state_index,
        essence_hash
    );

    Ok(ExecutionOutcome {
        state_index: params.context.snapshot.state_index,
        anchor: params.anchor,
        leader: params.context.leader,
        batch_hash: params.batch_hash,
        timestamp: params.context.timestamp,
        transaction,
        essence_hash,
        share,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::committee::Committee;
    use crate::types::{batch_hash, Color};
    use std::sync::Arc;

    fn members() -> Vec<CommitteeMember> {
        let (committee, shares) = Committee::generate(4, [11u8; 32]).unwrap();
        let committee = Arc::new(committee);
        shares
            .into_iter()
            .map(|s| CommitteeMember::new(committee.clone(), s).unwrap())
            .collect()
    }

    fn params(timestamp: u64) -> ExecutionParams {
        let requests: Vec<RequestMessage> = (0..3)
            .map(|n| RequestMessage::new(Address([2; 32]), vec![n; 4], n as u64))
            .collect();
        let ids: Vec<_> = requests.iter().map(|r| r.id).collect();
        ExecutionParams {
            anchor: Digest::of(b"anchor"),
            batch_hash: batch_hash(&ids),
            context: BatchContext {
                snapshot: StateSnapshot {
                    state_index: 10,
                    state_hash: Digest::of(b"state-10"),
                },
                balances: Balances::from([(Color::NATIVE, 1_000)]),
                reward_target: Address([9; 32]),
                timestamp,
                leader: 2,
            },
            requests,
        }
    }

    #[test]
    fn test_execution_is_deterministic() {
        let nodes = members();
        let first = run_batch(&DigestExecutor, &nodes[0], params(1_700)).unwrap();
        let again = run_batch(&DigestExecutor, &nodes[0], params(1_700)).unwrap();
        let other = run_batch(&DigestExecutor, &nodes[3], params(1_700)).unwrap();

        assert_eq!(first.essence_hash, again.essence_hash);
        assert_eq!(first.essence_hash, other.essence_hash);
        assert_eq!(first.transaction, other.transaction);
        assert_eq!(first.transaction.state_index(), 11);
        assert_eq!(first.leader, 2);
    }

    #[test]
    fn test_inputs_change_essence() {
        let nodes = members();
        let base = run_batch(&DigestExecutor, &nodes[0], params(1_700)).unwrap();
        let later = run_batch(&DigestExecutor, &nodes[0], params(1_701)).unwrap();
        assert_ne!(base.essence_hash, later.essence_hash);

        let mut richer = params(1_700);
        richer.context.balances.insert(Color::NATIVE, 2_000);
        let richer = run_batch(&DigestExecutor, &nodes[0], richer).unwrap();
        assert_ne!(base.essence_hash, richer.essence_hash);
    }

    #[test]
    fn test_share_signs_essence() {
        let nodes = members();
        let outcome = run_batch(&DigestExecutor, &nodes[1], params(5)).unwrap();
        assert_eq!(outcome.share.signer, 1);
        assert!(nodes[1]
            .committee()
            .verify_share(&outcome.essence_hash, &outcome.share));
    }
}
