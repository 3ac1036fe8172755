//! Commitments, proofs and the L1 finality record

use crate::{
    block::BatchId,
    hash::{domain_hasher, Hash32},
};
use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

/// L1 finality state of a batch id. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinalityStatus {
    Uncommitted,
    Committed,
    Verified,
    Rejected,
}

impl FinalityStatus {
    pub fn can_transition_to(self, next: FinalityStatus) -> bool {
        matches!(
            (self, next),
            (Self::Uncommitted, Self::Committed)
                | (Self::Committed, Self::Verified)
                | (Self::Committed, Self::Rejected)
        )
    }

    pub fn is_final(self) -> bool {
        matches!(self, Self::Verified | Self::Rejected)
    }
}

/// Digest of a batch as stored on L1
#[derive(Debug, Clone, Copy, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct Commitment {
    pub batch_id: BatchId,
    pub digest: Hash32,
    pub first_height: u64,
    pub last_height: u64,
}

/// Opaque validity certificate for exactly one batch
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct Proof {
    pub batch_id: BatchId,
    pub certificate: Vec<u8>,
}

/// Certificate the stub proof system issues for a batch digest.
///
/// Stands in for a real proving system: the prover emits it, the L1 contract
/// recomputes it from the stored commitment.
pub fn certify(batch_id: BatchId, digest: &Hash32) -> Vec<u8> {
    let mut hasher = domain_hasher(b"rollup/proof/v1");
    hasher.update(&batch_id.to_le_bytes());
    hasher.update(digest.as_ref());
    hasher.finalize().as_bytes().to_vec()
}

impl Proof {
    /// Whether this proof certifies `commitment`
    pub fn certifies(&self, commitment: &Commitment) -> bool {
        self.batch_id == commitment.batch_id
            && self.certificate == certify(commitment.batch_id, &commitment.digest)
    }
}
