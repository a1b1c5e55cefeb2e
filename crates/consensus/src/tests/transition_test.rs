use super::harness::{request, Harness};
use crate::executor::{run_batch, BatchContext, DigestExecutor, ExecutionParams};
use crate::operator::OperatorEvent;
use crate::types::{
    batch_hash, Address, Balances, PeerMessage, SignedResultMessage, StartProcessing,
};

/// Node 0 holds the request; peer 2 notified for state 3, peer 1 for state 4
fn notified_at_state_3(h: &mut Harness) -> crate::types::RequestId {
    let state = h.state_at(3);
    h.confirm(&state);
    let r = request(5);
    h.node_mut(0).handle_event(OperatorEvent::Request(r.clone()));
    h.node_mut(0).handle_event(OperatorEvent::Peer {
        from: 1,
        message: PeerMessage::NotifyRequests {
            state_index: 4,
            request_ids: vec![r.id],
        },
    });
    h.node_mut(0).handle_event(OperatorEvent::Peer {
        from: 2,
        message: PeerMessage::NotifyRequests {
            state_index: 3,
            request_ids: vec![r.id],
        },
    });

    let record = h.node(0).requests().get(&r.id).unwrap();
    assert_eq!(record.notified_current(), &[true, false, true, false]);
    assert_eq!(record.notified_next(), &[true, true, false, false]);
    r.id
}

#[tokio::test]
async fn test_sequential_transition_carries_next_notifications() {
    let mut h = Harness::new(4);
    let id = notified_at_state_3(&mut h);

    let next = h.state_at(4);
    h.node_mut(0).set_new_state(next.clone(), next.snapshot());

    let record = h.node(0).requests().get(&id).unwrap();
    assert_eq!(record.notified_current(), &[true, true, false, false]);
    assert_eq!(record.notified_next(), &[true, false, false, false]);
    assert!(!record.is_processed());
}

#[tokio::test]
async fn test_gap_transition_clears_notifications() {
    let mut h = Harness::new(4);
    let id = notified_at_state_3(&mut h);

    let far = h.state_at(8);
    h.node_mut(0).set_new_state(far.clone(), far.snapshot());

    // peer notifications are gone; the held message keeps the own slot
    let record = h.node(0).requests().get(&id).unwrap();
    assert_eq!(record.notified_current(), &[true, false, false, false]);
    assert_eq!(record.notified_next(), &[true, false, false, false]);
    assert_eq!(h.node(0).state_index(), Some(8));
}

#[tokio::test]
async fn test_duplicate_confirmation_keeps_round() {
    let mut h = Harness::new(4);
    let origin = h.origin.clone();
    h.confirm(&origin);
    h.post_request(&request(1));
    assert!(h.drive(10, |h| h.node(0).leader_status().is_some()).await);
    let batch = h.node(0).leader_status().unwrap().batch_hash();

    h.node_mut(0).set_new_state(origin.clone(), origin.snapshot());

    assert_eq!(h.node(0).leader_status().unwrap().batch_hash(), batch);
    assert!(h.node(0).balances().is_some());
}

#[tokio::test]
async fn test_results_from_previous_state_are_dropped() {
    let mut h = Harness::new(4);
    let origin = h.origin.clone();
    h.confirm(&origin);
    let r = request(1);
    h.post_request(&r);
    assert!(h.drive(10, |h| h.node(0).leader_status().is_some()).await);

    let old = h.node(0).leader_status().unwrap().clone();
    let peer1 = h.node(1).member().clone();
    let stale_outcome = run_batch(
        &DigestExecutor,
        &peer1,
        ExecutionParams {
            anchor: origin.id(),
            batch_hash: old.batch_hash(),
            context: BatchContext {
                snapshot: origin.snapshot(),
                balances: Balances::new(),
                reward_target: Address([9; 32]),
                timestamp: old.timestamp(),
                leader: 1,
            },
            requests: vec![r.clone()],
        },
    )
    .unwrap();
    let stale_share = SignedResultMessage {
        state_index: 0,
        batch_hash: old.batch_hash(),
        timestamp: old.timestamp(),
        essence_hash: stale_outcome.essence_hash,
        share: stale_outcome.share,
    };

    let next = h.state_at(1);
    h.confirm(&next);
    assert!(h.node(0).leader_status().is_none());

    // peer 1 leads state 1; its round must not pick up state 0 results
    assert!(h.drive(10, |h| h.node(1).leader_status().is_some()).await);
    let live = h.node(1).leader_status().unwrap().clone();
    assert_eq!(live.state_index(), 1);
    assert_eq!(live.anchor(), next.id());

    let dropped = h.node(1).stats().stale_results_dropped;
    h.node_mut(1).handle_event(OperatorEvent::Executed(stale_outcome));
    h.node_mut(1).handle_event(OperatorEvent::Peer {
        from: 2,
        message: PeerMessage::SignedResult(stale_share),
    });
    assert_eq!(h.node(1).stats().stale_results_dropped, dropped + 2);

    let after = h.node(1).leader_status().unwrap();
    assert_eq!(after.batch_hash(), live.batch_hash());
    assert_eq!(after.signed_result(1), live.signed_result(1));
    assert_eq!(after.signed_result(2), live.signed_result(2));
}

#[tokio::test]
async fn test_early_proposal_promoted_on_next_state() {
    let mut h = Harness::new(4);
    let origin = h.origin.clone();
    h.confirm(&origin);
    let r = request(4);

    let start = StartProcessing {
        state_index: 1,
        timestamp: 1,
        reward_target: Address([9; 32]),
        balances: Balances::new(),
        request_ids: vec![r.id],
    };
    h.node_mut(3).handle_event(OperatorEvent::Peer {
        from: 1,
        message: PeerMessage::StartProcessing(start),
    });
    assert!(h.node(3).computations().current().is_empty());
    assert_eq!(h.node(3).computations().next().len(), 1);

    let next = h.state_at(1);
    h.node_mut(3).set_new_state(next.clone(), next.snapshot());
    let current = h.node(3).computations().current();
    assert_eq!(current.len(), 1);
    assert_eq!(current[0].batch_hash, batch_hash(&[r.id]));
    assert!(!current[0].is_processed());

    // executed once the request message arrives
    h.node_mut(3).handle_event(OperatorEvent::Request(r));
    h.node_mut(3).take_action();
    assert!(h.node(3).computations().current()[0].is_processed());
    assert_eq!(h.node(3).stats().batches_executed, 1);
}
