//! Request backlog, per-peer notification tracking and batch selection

use std::collections::BTreeMap;

use crate::error::ConsensusError;
use crate::types::{PeerIndex, RequestId, RequestMessage, StateIndex};

/// What this node knows about one request
#[derive(Debug, Clone)]
pub struct RequestRecord {
    id: RequestId,
    message: Option<RequestMessage>,
    /// Peers known to hold the request for the current state
    notified_current: Vec<bool>,
    /// Peers that announced the request for the next state
    notified_next: Vec<bool>,
    /// Already dispatched for execution by this node in the current state
    processed: bool,
}

impl RequestRecord {
    fn new(id: RequestId, committee_size: usize) -> Self {
        Self {
            id,
            message: None,
            notified_current: vec![false; committee_size],
            notified_next: vec![false; committee_size],
            processed: false,
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn message(&self) -> Option<&RequestMessage> {
        self.message.as_ref()
    }

    pub fn is_known(&self) -> bool {
        self.message.is_some()
    }

    pub fn is_processed(&self) -> bool {
        self.processed
    }

    pub fn notified_current(&self) -> &[bool] {
        &self.notified_current
    }

    pub fn notified_next(&self) -> &[bool] {
        &self.notified_next
    }

    /// Number of peers that hold the request in the current state
    pub fn current_notifications(&self) -> usize {
        self.notified_current.iter().filter(|n| **n).count()
    }
}

/// All requests this node has seen, keyed by id
#[derive(Debug)]
pub struct RequestBook {
    own_index: PeerIndex,
    committee_size: usize,
    records: BTreeMap<RequestId, RequestRecord>,
}

impl RequestBook {
    pub fn new(committee_size: PeerIndex, own_index: PeerIndex) -> Self {
        Self {
            own_index,
            committee_size: committee_size as usize,
            records: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: &RequestId) -> Option<&RequestRecord> {
        self.records.get(id)
    }

    fn entry(&mut self, id: RequestId) -> &mut RequestRecord {
        let size = self.committee_size;
        self.records
            .entry(id)
            .or_insert_with(|| RequestRecord::new(id, size))
    }

    /// Store a request message. Returns false if it was already known.
    pub fn add_message(&mut self, message: RequestMessage) -> bool {
        let own = self.own_index as usize;
        let record = self.entry(message.id);
        if record.message.is_some() {
            return false;
        }
        record.message = Some(message);
        record.notified_current[own] = true;
        record.notified_next[own] = true;
        true
    }

    /// Record that `from` holds `ids`, for the current or the next state
    pub fn record_notification(&mut self, from: PeerIndex, ids: &[RequestId], next_state: bool) {
        if from as usize >= self.committee_size {
            return;
        }
        for id in ids {
            let record = self.entry(*id);
            if next_state {
                record.notified_next[from as usize] = true;
            } else {
                record.notified_current[from as usize] = true;
            }
        }
    }

    /// Known, unprocessed requests not time-locked at `timestamp_ms`, in id order
    pub fn candidates(&self, timestamp_ms: u64) -> Vec<&RequestRecord> {
        self.records
            .values()
            .filter(|r| !r.processed)
            .filter(|r| matches!(&r.message, Some(m) if !m.is_time_locked(timestamp_ms)))
            .collect()
    }

    pub fn all_known(&self, ids: &[RequestId]) -> bool {
        ids.iter()
            .all(|id| self.records.get(id).map(RequestRecord::is_known).unwrap_or(false))
    }

    /// Messages for `ids` in the given order; fails if any is missing
    pub fn take_messages(&self, ids: &[RequestId]) -> Result<Vec<RequestMessage>, ConsensusError> {
        ids.iter()
            .map(|id| {
                self.records
                    .get(id)
                    .and_then(|r| r.message.clone())
                    .ok_or(ConsensusError::MissingRequestMessage(*id))
            })
            .collect()
    }

    pub fn mark_processed(&mut self, ids: &[RequestId]) {
        for id in ids {
            if let Some(record) = self.records.get_mut(id) {
                record.processed = true;
            }
        }
    }

    /// Make requests selectable again after their round was abandoned
    pub fn unmark_processed(&mut self, ids: &[RequestId]) {
        for id in ids {
            if let Some(record) = self.records.get_mut(id) {
                record.processed = false;
            }
        }
    }

    /// Ids of all requests whose message this node holds
    pub fn backlog_ids(&self) -> Vec<RequestId> {
        self.records
            .values()
            .filter(|r| r.is_known())
            .map(|r| r.id)
            .collect()
    }

    pub fn remove(&mut self, ids: &[RequestId]) -> usize {
        ids.iter().filter(|id| self.records.remove(id).is_some()).count()
    }

    /// Move bookkeeping to a newly committed state.
    ///
    /// On a sequential transition the next-state vectors become the current
    /// ones; otherwise both are cleared. In either case the own slot of both
    /// vectors is then set for every request whose message is held, so after a
    /// gap this node's own notification is the only one that survives.
    /// Processed flags are cleared.
    pub fn rotate(&mut self, sequential: bool) {
        let own = self.own_index as usize;
        for record in self.records.values_mut() {
            if sequential {
                std::mem::swap(&mut record.notified_current, &mut record.notified_next);
                record.notified_next.fill(false);
            } else {
                record.notified_current.fill(false);
                record.notified_next.fill(false);
            }
            record.processed = false;
            if record.message.is_some() {
                record.notified_current[own] = true;
                record.notified_next[own] = true;
            }
        }
    }
}

/// Inputs to a batch selection
#[derive(Debug, Clone, Copy)]
pub struct SelectionContext {
    pub state_index: StateIndex,
    pub timestamp: u64,
    pub quorum: PeerIndex,
    pub max_batch_size: usize,
}

/// Picks the next batch from the candidate requests.
///
/// Must be deterministic: honest peers seeing the same candidates must pick
/// the same batch.
pub trait BatchSelector: Send + Sync {
    fn select(&self, candidates: &[&RequestRecord], ctx: &SelectionContext) -> Vec<RequestId>;
}

/// Selects requests enough peers already hold, in id order
#[derive(Debug, Clone, Copy, Default)]
pub struct NotifiedBatchSelector {
    /// Required notifications; the committee quorum when unset
    min_notifications: Option<usize>,
}

impl NotifiedBatchSelector {
    pub fn with_min_notifications(min: usize) -> Self {
        Self {
            min_notifications: Some(min),
        }
    }
}

impl BatchSelector for NotifiedBatchSelector {
    fn select(&self, candidates: &[&RequestRecord], ctx: &SelectionContext) -> Vec<RequestId> {
        let needed = self.min_notifications.unwrap_or(ctx.quorum as usize);
        let mut ids: Vec<RequestId> = candidates
            .iter()
            .filter(|r| r.current_notifications() >= needed)
            .map(|r| r.id())
            .collect();
        ids.sort_unstable();
        ids.truncate(ctx.max_batch_size);
        ids
    }
}
