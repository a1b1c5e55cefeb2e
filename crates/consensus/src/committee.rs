//! Committee membership, quorum threshold and leader rotation

use ed25519_dalek::VerifyingKey;
use std::sync::Arc;

use crate::crypto::{KeyShare, SignatureShare, ThresholdSignature};
use crate::error::ConsensusError;
use crate::types::{Address, Digest, PeerIndex, StateIndex};

/// Fixed set of peers jointly controlling one chain
#[derive(Debug, Clone)]
pub struct Committee {
    address: Address,
    members: Vec<VerifyingKey>,
}

impl Committee {
    /// Create a committee from member public keys, ordered by peer index
    pub fn new(public_keys: &[[u8; 32]]) -> Result<Self, ConsensusError> {
        if public_keys.is_empty() || public_keys.len() > PeerIndex::MAX as usize {
            return Err(ConsensusError::InvalidCommitteeSize(public_keys.len()));
        }
        let members = public_keys
            .iter()
            .enumerate()
            .map(|(i, bytes)| {
                VerifyingKey::from_bytes(bytes)
                    .map_err(|_| ConsensusError::InvalidPublicKey(i as PeerIndex))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::from_keys(members))
    }

    /// Deterministically derive a committee and its key shares from a seed
    pub fn generate(size: PeerIndex, seed: [u8; 32]) -> Result<(Self, Vec<KeyShare>), ConsensusError> {
        if size == 0 {
            return Err(ConsensusError::InvalidCommitteeSize(0));
        }
        let shares: Vec<KeyShare> = (0..size)
            .map(|i| {
                let mut hasher = blake3::Hasher::new();
                hasher.update(&seed);
                hasher.update(&i.to_le_bytes());
                KeyShare::from_seed(i, *hasher.finalize().as_bytes())
            })
            .collect();
        let members = shares.iter().map(KeyShare::verifying_key).collect();
        Ok((Self::from_keys(members), shares))
    }

    fn from_keys(members: Vec<VerifyingKey>) -> Self {
        let mut hasher = blake3::Hasher::new();
        for key in &members {
            hasher.update(key.as_bytes());
        }
        Self {
            address: Address(*hasher.finalize().as_bytes()),
            members,
        }
    }

    pub fn size(&self) -> PeerIndex {
        self.members.len() as PeerIndex
    }

    /// Address controlled by the committee
    pub fn address(&self) -> Address {
        self.address
    }

    /// Byzantine-safe threshold: floor(2N/3) + 1
    pub fn quorum(&self) -> PeerIndex {
        let n = self.members.len() as u32;
        (2 * n / 3 + 1) as PeerIndex
    }

    pub fn public_key(&self, index: PeerIndex) -> Option<&VerifyingKey> {
        self.members.get(index as usize)
    }

    /// Check a single share against its claimed signer
    pub fn verify_share(&self, digest: &Digest, share: &SignatureShare) -> bool {
        self.public_key(share.signer)
            .map(|key| share.verify(key, digest))
            .unwrap_or(false)
    }

    /// Combine shares into a threshold signature.
    ///
    /// The result does not depend on the order of `shares`. Individual shares
    /// are not verified here; use [`Committee::verify`] on the result.
    pub fn aggregate(
        &self,
        digest: &Digest,
        shares: &[SignatureShare],
    ) -> Result<ThresholdSignature, ConsensusError> {
        let mut sorted = shares.to_vec();
        sorted.sort_by_key(|s| s.signer);

        for pair in sorted.windows(2) {
            if pair[0].signer == pair[1].signer {
                return Err(ConsensusError::DuplicateShare(pair[0].signer));
            }
        }
        if let Some(share) = sorted.iter().find(|s| s.signer >= self.size()) {
            return Err(ConsensusError::UnknownPeer(share.signer));
        }
        if sorted.len() < self.quorum() as usize {
            return Err(ConsensusError::InsufficientShares {
                have: sorted.len(),
                need: self.quorum() as usize,
            });
        }

        tracing::trace!("Aggregated {} shares over {}", sorted.len(), digest);
        Ok(ThresholdSignature::from_sorted(sorted))
    }

    /// Verify a threshold signature: quorum of distinct members, all valid
    pub fn verify(&self, digest: &Digest, signature: &ThresholdSignature) -> bool {
        if signature.len() < self.quorum() as usize {
            return false;
        }
        let ordered = signature
            .shares()
            .windows(2)
            .all(|pair| pair[0].signer < pair[1].signer);
        ordered && signature.shares().iter().all(|s| self.verify_share(digest, s))
    }
}

/// The committee as seen by one member
#[derive(Debug, Clone)]
pub struct CommitteeMember {
    committee: Arc<Committee>,
    key_share: Arc<KeyShare>,
}

impl CommitteeMember {
    pub fn new(committee: Arc<Committee>, key_share: KeyShare) -> Result<Self, ConsensusError> {
        let index = key_share.index();
        match committee.public_key(index) {
            Some(key) if key.to_bytes() == key_share.public_key() => Ok(Self {
                committee,
                key_share: Arc::new(key_share),
            }),
            Some(_) => Err(ConsensusError::InvalidPublicKey(index)),
            None => Err(ConsensusError::UnknownPeer(index)),
        }
    }

    pub fn committee(&self) -> &Arc<Committee> {
        &self.committee
    }

    pub fn size(&self) -> PeerIndex {
        self.committee.size()
    }

    pub fn own_index(&self) -> PeerIndex {
        self.key_share.index()
    }

    pub fn address(&self) -> Address {
        self.committee.address()
    }

    pub fn quorum(&self) -> PeerIndex {
        self.committee.quorum()
    }

    pub fn sign(&self, digest: &Digest) -> SignatureShare {
        self.key_share.sign(digest)
    }
}

/// Strategy naming the leader for each state index.
///
/// Every honest peer must use the same strategy, otherwise no peer's
/// `StartProcessing` is accepted and the chain stalls.
pub trait LeaderRotation: Send + Sync {
    fn leader_for_state(&self, state_index: StateIndex, committee_size: PeerIndex) -> PeerIndex;
}

/// Leader = state index modulo committee size
#[derive(Debug, Clone, Copy, Default)]
pub struct RoundRobinRotation;

impl LeaderRotation for RoundRobinRotation {
    fn leader_for_state(&self, state_index: StateIndex, committee_size: PeerIndex) -> PeerIndex {
        (state_index % committee_size.max(1) as u32) as PeerIndex
    }
}

/// Pseudo-random leader order derived from a shared seed
#[derive(Debug, Clone, Copy)]
pub struct SeededRotation {
    seed: Digest,
}

impl SeededRotation {
    pub fn new(seed: Digest) -> Self {
        Self { seed }
    }
}

impl LeaderRotation for SeededRotation {
    fn leader_for_state(&self, state_index: StateIndex, committee_size: PeerIndex) -> PeerIndex {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.seed.as_ref());
        hasher.update(&state_index.to_le_bytes());
        let hash = hasher.finalize();
        let mut word = [0u8; 8];
        word.copy_from_slice(&hash.as_bytes()[..8]);
        (u64::from_le_bytes(word) % committee_size.max(1) as u64) as PeerIndex
    }
}
