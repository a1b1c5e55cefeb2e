//! Quorum detection, signature aggregation and finalization

use crate::committee::Committee;
use crate::crypto::SignatureShare;
use crate::error::ConsensusError;
use crate::leader::{LeaderStatus, SignedResult};
use crate::operator::Operator;
use crate::submit::spawn_submission;
use crate::types::{PeerIndex, ResultTransaction, SignedResultMessage};

impl LeaderStatus {
    /// Fill a peer's slot. A slot is written at most once.
    pub fn record_result(&mut self, peer: PeerIndex, result: SignedResult) -> bool {
        match self.signed_results.get_mut(peer as usize) {
            Some(slot) if slot.is_none() => {
                *slot = Some(result);
                true
            }
            _ => false,
        }
    }

    /// Shares agreeing with this node's own essence hash
    pub fn matching_shares(&self, own: PeerIndex) -> Vec<SignatureShare> {
        let Some(main) = self.signed_result(own) else {
            return Vec::new();
        };
        self.signed_results
            .iter()
            .flatten()
            .filter(|r| r.essence_hash == main.essence_hash)
            .map(|r| r.share)
            .collect()
    }

    /// Try to finalize the round.
    ///
    /// `Ok(None)` means "keep waiting". On success the signed transaction is
    /// returned and the round is marked finalized; later calls return `Ok(None)`.
    pub fn check_quorum(
        &mut self,
        committee: &Committee,
        own: PeerIndex,
    ) -> Result<Option<ResultTransaction>, ConsensusError> {
        if self.finalized || self.result_tx.is_none() {
            return Ok(None);
        }
        let Some(main_hash) = self.signed_result(own).map(|r| r.essence_hash) else {
            return Ok(None);
        };

        let shares = self.matching_shares(own);
        if shares.len() < committee.quorum() as usize {
            return Ok(None);
        }

        let signature = committee.aggregate(&main_hash, &shares)?;
        let Some(tx) = self.result_tx.as_mut() else {
            return Ok(None);
        };
        tx.signature = Some(signature);
        if !tx.signatures_valid(committee) {
            return Err(ConsensusError::InvalidAggregate);
        }

        self.finalized = true;
        Ok(Some(tx.clone()))
    }
}

impl Operator {
    /// Finalize and post the round's transaction once a quorum agrees
    pub(crate) fn check_quorum(&mut self) -> bool {
        let own = self.own_index();
        let committee = self.member.committee().clone();
        let Some(status) = self.leader_status.as_mut() else {
            return false;
        };

        match status.check_quorum(&committee, own) {
            Ok(Some(tx)) => {
                tracing::info!(
                    "Finalized result for state {}. Posting transaction {}",
                    status.state_index,
                    tx.id()
                );
                self.stats.rounds_finalized += 1;
                self.submission = Some(spawn_submission(
                    self.submitter.clone(),
                    tx,
                    self.config.submit_retry,
                ));
                true
            }
            Ok(None) => false,
            Err(e) => {
                tracing::error!("Quorum check failed for batch {}: {}", status.batch_hash, e);
                false
            }
        }
    }

    /// Record a share returned by another member for the live round
    pub(crate) fn on_signed_result(&mut self, from: PeerIndex, msg: SignedResultMessage) {
        let committee = self.member.committee().clone();
        let Some(status) = self.leader_status.as_mut() else {
            tracing::debug!("Result from {} without a round in flight", from);
            self.stats.stale_results_dropped += 1;
            return;
        };

        // a share for an aborted proposal of the same batch carries its old timestamp
        if msg.state_index != status.state_index
            || msg.batch_hash != status.batch_hash
            || msg.timestamp != status.timestamp
        {
            tracing::debug!(
                "Dropping result from {} for state {} batch {} at {}",
                from,
                msg.state_index,
                msg.batch_hash,
                msg.timestamp
            );
            self.stats.stale_results_dropped += 1;
            return;
        }
        if msg.share.signer != from || !committee.verify_share(&msg.essence_hash, &msg.share) {
            tracing::warn!("Invalid signature share from peer {}", from);
            self.stats.shares_rejected += 1;
            return;
        }

        let result = SignedResult {
            essence_hash: msg.essence_hash,
            share: msg.share,
        };
        if status.record_result(from, result) {
            self.stats.shares_received += 1;
            tracing::debug!("Result from {} recorded: essence {}", from, msg.essence_hash);
        } else {
            tracing::debug!("Duplicate result from {} ignored", from);
        }
    }
}
