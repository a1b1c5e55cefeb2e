//! Core types for committee consensus and peer messaging

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::committee::Committee;
use crate::crypto::{SignatureShare, ThresholdSignature};
use crate::submit::RetryPolicy;

/// Generation counter of the committed chain state
pub type StateIndex = u32;

/// Stable position of a peer inside the committee
pub type PeerIndex = u16;

macro_rules! fixed_bytes {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash,
            BorshSerialize, BorshDeserialize, Serialize, Deserialize,
        )]
        pub struct $name(pub [u8; 32]);

        impl $name {
            pub const fn new(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            pub fn to_base58(&self) -> String {
                bs58::encode(self.0).into_string()
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_base58())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let encoded = self.to_base58();
                let short = encoded.get(..8).unwrap_or(&encoded);
                write!(f, "{}({})", stringify!($name), short)
            }
        }
    };
}

fixed_bytes!(
    /// blake3 digest (state hashes, batch hashes, essence hashes)
    Digest
);
fixed_bytes!(
    /// Identifier of an inbound request
    RequestId
);
fixed_bytes!(
    /// Ledger address (the committee address or a reward target)
    Address
);
fixed_bytes!(
    /// Asset color on the ledger
    Color
);

impl Digest {
    pub const ZERO: Digest = Digest([0u8; 32]);

    /// Hash arbitrary bytes
    pub fn of(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }
}

impl Color {
    /// Native token of the ledger
    pub const NATIVE: Color = Color([0u8; 32]);
}

impl RequestId {
    /// Derive a request id from its origin
    pub fn derive(sender: &Address, payload: &[u8], nonce: u64) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(sender.as_ref());
        hasher.update(&nonce.to_le_bytes());
        hasher.update(payload);
        Self(*hasher.finalize().as_bytes())
    }
}

/// Point-in-time funds of an address, per color
pub type Balances = BTreeMap<Color, u64>;

/// Order-independent commitment to a set of request ids.
///
/// Ids are sorted and deduplicated before hashing, so any permutation of the
/// same set yields the same digest.
pub fn batch_hash(ids: &[RequestId]) -> Digest {
    let mut sorted = ids.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut hasher = blake3::Hasher::new();
    for id in &sorted {
        hasher.update(id.as_ref());
    }
    Digest(*hasher.finalize().as_bytes())
}

/// Current unix time in milliseconds
pub fn now_millis() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
}

/// A request as delivered to the committee
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct RequestMessage {
    pub id: RequestId,
    pub sender: Address,
    pub payload: Vec<u8>,
    /// Unix seconds before which the request must not be processed (0 = none)
    pub time_lock: u64,
}

impl RequestMessage {
    pub fn new(sender: Address, payload: Vec<u8>, nonce: u64) -> Self {
        Self {
            id: RequestId::derive(&sender, &payload, nonce),
            sender,
            payload,
            time_lock: 0,
        }
    }

    pub fn with_time_lock(mut self, unix_secs: u64) -> Self {
        self.time_lock = unix_secs;
        self
    }

    /// Whether the request is still locked at the given round timestamp
    pub fn is_time_locked(&self, timestamp_ms: u64) -> bool {
        self.time_lock > timestamp_ms / 1000
    }
}

/// Committed variable state the next batch executes against
#[derive(Debug, Clone, Copy, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct StateSnapshot {
    pub state_index: StateIndex,
    pub state_hash: Digest,
}

/// Signable content of a result transaction
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct TransactionEssence {
    /// Index of the state this transaction anchors
    pub state_index: StateIndex,
    pub prev_state_hash: Digest,
    pub state_hash: Digest,
    /// Round timestamp chosen by the leader (unix millis)
    pub timestamp: u64,
    pub reward_target: Address,
    /// Committee balances the batch was executed with, as taken from the proposal
    pub balances: Balances,
    pub request_ids: Vec<RequestId>,
}

impl TransactionEssence {
    /// Compute the essence hash (the digest every member signs)
    pub fn hash(&self) -> Digest {
        Digest::of(&borsh::to_vec(self).expect("TransactionEssence serialization should not fail"))
    }
}

/// State-anchoring transaction produced by executing a batch
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ResultTransaction {
    pub essence: TransactionEssence,
    pub signature: Option<ThresholdSignature>,
}

impl ResultTransaction {
    pub fn new(essence: TransactionEssence) -> Self {
        Self {
            essence,
            signature: None,
        }
    }

    /// Origin transaction of a chain (state index 0, unsigned)
    pub fn origin(address: Address, balances: Balances) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"origin");
        hasher.update(address.as_ref());
        Self::new(TransactionEssence {
            state_index: 0,
            prev_state_hash: Digest::ZERO,
            state_hash: Digest(*hasher.finalize().as_bytes()),
            timestamp: 0,
            reward_target: address,
            balances,
            request_ids: Vec::new(),
        })
    }

    /// Transaction id; the signature is not part of it
    pub fn id(&self) -> Digest {
        self.essence.hash()
    }

    pub fn essence_hash(&self) -> Digest {
        self.essence.hash()
    }

    pub fn state_index(&self) -> StateIndex {
        self.essence.state_index
    }

    /// Variable state committed by this transaction
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            state_index: self.essence.state_index,
            state_hash: self.essence.state_hash,
        }
    }

    /// Check the attached threshold signature against the committee
    pub fn signatures_valid(&self, committee: &Committee) -> bool {
        match &self.signature {
            Some(signature) => committee.verify(&self.essence_hash(), signature),
            None => false,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        borsh::to_vec(self).expect("ResultTransaction serialization should not fail")
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, borsh::io::Error> {
        borsh::from_slice(data)
    }
}

/// Leader's proposal of a batch for the current state
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct StartProcessing {
    pub state_index: StateIndex,
    pub timestamp: u64,
    pub reward_target: Address,
    pub balances: Balances,
    pub request_ids: Vec<RequestId>,
}

/// A member's signed execution result, returned to the leader
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct SignedResultMessage {
    pub state_index: StateIndex,
    pub batch_hash: Digest,
    /// Round timestamp the batch was executed with
    pub timestamp: u64,
    pub essence_hash: Digest,
    pub share: SignatureShare,
}

/// Message types exchanged between committee peers
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum PeerMessage {
    /// Sender holds these requests in its backlog for the given state
    NotifyRequests {
        state_index: StateIndex,
        request_ids: Vec<RequestId>,
    },

    /// Leader asking every peer to execute a batch
    StartProcessing(StartProcessing),

    /// Member returning its signature share to the leader
    SignedResult(SignedResultMessage),
}

impl PeerMessage {
    pub fn to_bytes(&self) -> Vec<u8> {
        borsh::to_vec(self).expect("PeerMessage serialization should not fail")
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, borsh::io::Error> {
        borsh::from_slice(data)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::NotifyRequests { .. } => "NotifyRequests",
            PeerMessage::StartProcessing(_) => "StartProcessing",
            PeerMessage::SignedResult(_) => "SignedResult",
        }
    }
}

/// Ledger answer to a balance query
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct BalancesResponse {
    pub address: Address,
    /// Id of the latest state transaction the ledger had seen
    pub anchor: Digest,
    pub balances: Balances,
}

/// Configuration for a consensus operator
#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    /// Period of `take_action`
    pub tick_interval: Duration,
    /// Minimum spacing between balance requests
    pub balances_timeout: Duration,
    /// Retry policy for posting finalized transactions
    pub submit_retry: RetryPolicy,
    /// Upper bound on requests per batch
    pub max_batch_size: usize,
    /// Reward target; the committee address when unset
    pub reward_target: Option<Address>,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(100),
            balances_timeout: Duration::from_secs(1),
            submit_retry: RetryPolicy::default(),
            max_batch_size: 100,
            reward_target: None,
        }
    }
}

/// Counters about an operator's activity
#[derive(Debug, Clone, Default, Serialize)]
pub struct OperatorStats {
    pub state_index: Option<StateIndex>,
    pub balance_requests: u64,
    pub rounds_started: u64,
    pub rounds_aborted: u64,
    pub rounds_finalized: u64,
    pub batches_executed: u64,
    pub shares_received: u64,
    pub shares_rejected: u64,
    pub stale_results_dropped: u64,
}
