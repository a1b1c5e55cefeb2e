//! Key shares and k-of-n signature aggregation
//!
//! Every committee member signs the essence hash with its own ed25519 key.
//! A threshold signature is the signer-ordered set of at least `quorum()`
//! member signatures over the same digest.

use borsh::{BorshDeserialize, BorshSerialize};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use std::fmt;

use crate::types::{Digest, PeerIndex};

/// One member's partial signature over a digest
#[derive(Debug, Clone, Copy, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct SignatureShare {
    pub signer: PeerIndex,
    pub signature: [u8; 64],
}

impl SignatureShare {
    /// Check the share against the signer's public key
    pub fn verify(&self, key: &VerifyingKey, digest: &Digest) -> bool {
        let signature = Signature::from_bytes(&self.signature);
        key.verify_strict(digest.as_ref(), &signature).is_ok()
    }
}

/// Aggregated committee signature
#[derive(Debug, Clone, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ThresholdSignature {
    shares: Vec<SignatureShare>,
}

impl ThresholdSignature {
    /// Build from shares already sorted by signer with no duplicates
    pub(crate) fn from_sorted(shares: Vec<SignatureShare>) -> Self {
        Self { shares }
    }

    pub fn shares(&self) -> &[SignatureShare] {
        &self.shares
    }

    pub fn signers(&self) -> impl Iterator<Item = PeerIndex> + '_ {
        self.shares.iter().map(|s| s.signer)
    }

    pub fn len(&self) -> usize {
        self.shares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shares.is_empty()
    }
}

/// This node's committee signing key
pub struct KeyShare {
    index: PeerIndex,
    key: SigningKey,
}

impl KeyShare {
    pub fn from_seed(index: PeerIndex, seed: [u8; 32]) -> Self {
        Self {
            index,
            key: SigningKey::from_bytes(&seed),
        }
    }

    pub fn index(&self) -> PeerIndex {
        self.index
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.key.verifying_key().to_bytes()
    }

    /// Sign a digest, producing this member's share
    pub fn sign(&self, digest: &Digest) -> SignatureShare {
        SignatureShare {
            signer: self.index,
            signature: self.key.sign(digest.as_ref()).to_bytes(),
        }
    }
}

impl fmt::Debug for KeyShare {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyShare")
            .field("index", &self.index)
            .field("public_key", &bs58::encode(self.public_key()).into_string())
            .finish()
    }
}
