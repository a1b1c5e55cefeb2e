//! State transition tracking - adopt a confirmed state and reset the round

use tokio::time::Instant;

use crate::operator::Operator;
use crate::types::{PeerMessage, ResultTransaction, StateSnapshot};

impl Operator {
    /// Adopt a newly confirmed state transaction and its committed state
    pub fn set_new_state(&mut self, state_tx: ResultTransaction, snapshot: StateSnapshot) {
        let id = state_tx.id();
        if self.anchor() == Some(id) {
            tracing::trace!("State transaction {} already adopted", id);
            return;
        }

        let previous = self.state_index();
        let sequential = matches!(
            previous,
            Some(prev) if prev.checked_add(1) == Some(snapshot.state_index)
        );
        let completed = state_tx.essence.request_ids.clone();

        self.state_tx = Some(state_tx);
        self.snapshot = Some(snapshot);
        self.balances = None;
        self.balances_deadline = Instant::now();
        if let Some(submission) = self.submission.take() {
            submission.abort();
        }

        self.reset_leader();
        self.computations.rotate(snapshot.state_index);
        self.requests.rotate(sequential);
        let removed = self.requests.remove(&completed);

        tracing::info!(
            "Peer {} adopted state {} (tx {}, previous {:?}, sequential {}, {} requests completed)",
            self.own_index(),
            snapshot.state_index,
            id,
            previous,
            sequential,
            removed
        );

        self.announce_backlog();
    }

    /// Discard the round in flight; it referenced the previous state
    fn reset_leader(&mut self) {
        if let Some(status) = self.leader_status.take() {
            tracing::debug!(
                "Round for batch {} at state {} reset (finalized: {})",
                status.batch_hash,
                status.state_index,
                status.finalized
            );
        }
    }

    /// Tell peers which requests this node holds for the new state
    fn announce_backlog(&mut self) {
        let Some(state_index) = self.state_index() else {
            return;
        };
        let request_ids = self.requests.backlog_ids();
        if request_ids.is_empty() {
            return;
        }
        let sent = self.transport.broadcast(&PeerMessage::NotifyRequests {
            state_index,
            request_ids,
        });
        tracing::trace!("Backlog announced to {} peers", sent);
    }
}
