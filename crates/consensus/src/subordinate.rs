//! Subordinate role - queue leader proposals and execute them once requests are known

use crate::executor::{BatchContext, ExecutionParams};
use crate::operator::Operator;
use crate::requests::RequestBook;
use crate::types::{batch_hash, Digest, PeerIndex, StartProcessing, StateIndex};

/// A leader's proposal this node has to execute
#[derive(Debug, Clone)]
pub struct ComputationRequest {
    pub leader: PeerIndex,
    pub batch_hash: Digest,
    pub start: StartProcessing,
    processed: bool,
}

impl ComputationRequest {
    fn key(&self) -> (StateIndex, PeerIndex, Digest) {
        (self.start.state_index, self.leader, self.batch_hash)
    }

    pub fn is_processed(&self) -> bool {
        self.processed
    }
}

/// Where an incoming proposal ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Current,
    Next,
    /// Same batch re-proposed with a new timestamp; the old entry was dropped
    Replaced,
    Duplicate,
    Stale,
}

/// Proposals for the current state and those that arrived early for the next one
#[derive(Debug, Default)]
pub struct ComputationQueue {
    current: Vec<ComputationRequest>,
    next: Vec<ComputationRequest>,
}

impl ComputationQueue {
    pub fn current(&self) -> &[ComputationRequest] {
        &self.current
    }

    pub fn next(&self) -> &[ComputationRequest] {
        &self.next
    }

    /// Queue a proposal from `leader`, relative to the node's current state
    pub fn enqueue(&mut self, leader: PeerIndex, start: StartProcessing, current: StateIndex) -> Enqueued {
        let request = ComputationRequest {
            leader,
            batch_hash: batch_hash(&start.request_ids),
            start,
            processed: false,
        };
        let (queue, placed) = if request.start.state_index == current {
            (&mut self.current, Enqueued::Current)
        } else if Some(request.start.state_index) == current.checked_add(1) {
            (&mut self.next, Enqueued::Next)
        } else {
            return Enqueued::Stale;
        };

        match queue.iter_mut().find(|c| c.key() == request.key()) {
            Some(existing) if existing.start.timestamp == request.start.timestamp => {
                Enqueued::Duplicate
            }
            Some(existing) => {
                *existing = request;
                Enqueued::Replaced
            }
            None => {
                queue.push(request);
                placed
            }
        }
    }

    /// Current-state proposals whose request messages are all known.
    ///
    /// Returned entries are marked processed and never returned again.
    pub fn take_ready(&mut self, book: &RequestBook) -> Vec<ComputationRequest> {
        let mut ready = Vec::new();
        for request in self.current.iter_mut() {
            if request.processed || !book.all_known(&request.start.request_ids) {
                continue;
            }
            request.processed = true;
            ready.push(request.clone());
        }
        ready
    }

    /// Promote next-state proposals once `new_index` is committed
    pub fn rotate(&mut self, new_index: StateIndex) {
        self.current = std::mem::take(&mut self.next);
        self.current.retain(|c| c.start.state_index == new_index);
    }
}

impl Operator {
    /// Accept a proposal only from the leader the rotation names for its state
    pub(crate) fn on_start_processing(&mut self, from: PeerIndex, start: StartProcessing) {
        let Some(current) = self.state_index() else {
            tracing::debug!("StartProcessing from {} before any committed state", from);
            return;
        };
        let expected = self.rotation.leader_for_state(start.state_index, self.member.size());
        if from != expected {
            tracing::warn!(
                "Rejected StartProcessing for state {} from {}: leader is {}",
                start.state_index,
                from,
                expected
            );
            return;
        }

        let state_index = start.state_index;
        let size = start.request_ids.len();
        match self.computations.enqueue(from, start, current) {
            Enqueued::Current | Enqueued::Next => tracing::debug!(
                "Queued batch of {} requests from leader {} for state {}",
                size,
                from,
                state_index
            ),
            Enqueued::Replaced => tracing::debug!(
                "Leader {} re-proposed batch for state {}; replacing the queued one",
                from,
                state_index
            ),
            Enqueued::Duplicate => tracing::trace!("Duplicate StartProcessing from {}", from),
            Enqueued::Stale => tracing::debug!(
                "Stale StartProcessing for state {} (current {})",
                state_index,
                current
            ),
        }
    }

    /// Dispatch every queued proposal that became executable
    pub(crate) fn do_subordinate(&mut self) {
        let (Some(snapshot), Some(anchor)) = (self.snapshot, self.anchor()) else {
            return;
        };

        for request in self.computations.take_ready(&self.requests) {
            let messages = match self.requests.take_messages(&request.start.request_ids) {
                Ok(messages) => messages,
                Err(e) => {
                    tracing::warn!("Skipping batch {}: {}", request.batch_hash, e);
                    continue;
                }
            };
            self.requests.mark_processed(&request.start.request_ids);

            self.spawn_execution(ExecutionParams {
                anchor,
                batch_hash: request.batch_hash,
                context: BatchContext {
                    snapshot,
                    balances: request.start.balances,
                    reward_target: request.start.reward_target,
                    timestamp: request.start.timestamp,
                    leader: request.leader,
                },
                requests: messages,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Address, Balances, RequestId, RequestMessage};

    fn start(state_index: StateIndex, ids: Vec<RequestId>) -> StartProcessing {
        start_at(state_index, 1, ids)
    }

    fn start_at(state_index: StateIndex, timestamp: u64, ids: Vec<RequestId>) -> StartProcessing {
        StartProcessing {
            state_index,
            timestamp,
            reward_target: Address([1; 32]),
            balances: Balances::new(),
            request_ids: ids,
        }
    }

    #[test]
    fn test_enqueue_by_state() {
        let mut queue = ComputationQueue::default();
        let ids = vec![RequestId([1; 32])];

        assert_eq!(queue.enqueue(1, start(5, ids.clone()), 5), Enqueued::Current);
        assert_eq!(queue.enqueue(1, start(5, ids.clone()), 5), Enqueued::Duplicate);
        assert_eq!(queue.enqueue(2, start(6, ids.clone()), 5), Enqueued::Next);
        assert_eq!(queue.enqueue(2, start(4, ids.clone()), 5), Enqueued::Stale);
        assert_eq!(queue.enqueue(2, start(9, ids), 5), Enqueued::Stale);
        assert_eq!(queue.current().len(), 1);
        assert_eq!(queue.next().len(), 1);
    }

    #[test]
    fn test_ready_waits_for_messages_and_fires_once() {
        let mut book = RequestBook::new(4, 0);
        let msg = RequestMessage::new(Address([3; 32]), vec![7], 0);
        let mut queue = ComputationQueue::default();
        queue.enqueue(1, start(5, vec![msg.id]), 5);

        assert!(queue.take_ready(&book).is_empty());

        book.add_message(msg);
        let ready = queue.take_ready(&book);
        assert_eq!(ready.len(), 1);
        assert!(queue.current()[0].is_processed());
        assert!(queue.take_ready(&book).is_empty());
    }

    #[test]
    fn test_reproposal_with_new_timestamp_replaces_entry() {
        let mut book = RequestBook::new(4, 0);
        let msg = RequestMessage::new(Address([3; 32]), vec![7], 0);
        book.add_message(msg.clone());
        let mut queue = ComputationQueue::default();

        queue.enqueue(1, start_at(5, 100, vec![msg.id]), 5);
        assert_eq!(queue.take_ready(&book).len(), 1);

        assert_eq!(
            queue.enqueue(1, start_at(5, 100, vec![msg.id]), 5),
            Enqueued::Duplicate
        );
        assert_eq!(
            queue.enqueue(1, start_at(5, 250, vec![msg.id]), 5),
            Enqueued::Replaced
        );
        assert_eq!(queue.current().len(), 1);
        assert!(!queue.current()[0].is_processed());

        let ready = queue.take_ready(&book);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].start.timestamp, 250);
    }

    #[test]
    fn test_rotate_promotes_next_state() {
        let mut queue = ComputationQueue::default();
        queue.enqueue(1, start(5, vec![RequestId([1; 32])]), 5);
        queue.enqueue(2, start(6, vec![RequestId([2; 32])]), 5);

        queue.rotate(6);
        assert_eq!(queue.current().len(), 1);
        assert_eq!(queue.current()[0].leader, 2);
        assert!(queue.next().is_empty());

        queue.rotate(9);
        assert!(queue.current().is_empty());
    }
}
