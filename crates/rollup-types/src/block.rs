//! Blocks and batches

use crate::{
    bridge::WithdrawalLeaf,
    hash::{domain_hasher, Hash32},
    receipt::{ExecutionStatus, FailureReason},
    transaction::{Transaction, TxHash, TxKind},
};
use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

pub type BlockHash = Hash32;

/// Aggregator-assigned batch identifier, strictly increasing from 1
pub type BatchId = u64;

/// Reference to the ledger snapshot produced by a block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct StateRef {
    pub height: u64,
    pub root: Hash32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct BlockRef {
    pub height: u64,
    pub hash: BlockHash,
}

/// An L2 block. `results[i]` is the execution status of `txs[i]`.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct Block {
    pub height: u64,
    pub parent_ref: BlockHash,
    pub txs: Vec<Transaction>,
    pub results: Vec<ExecutionStatus>,
    pub state_ref: StateRef,
    pub timestamp_ms: u64,
}

impl Block {
    pub fn hash(&self) -> BlockHash {
        let mut hasher = domain_hasher(b"rollup/block/v1");
        hasher.update(&self.height.to_le_bytes());
        hasher.update(self.parent_ref.as_ref());
        hasher.update(&(self.txs.len() as u64).to_le_bytes());
        for (tx, result) in self.txs.iter().zip(&self.results) {
            hasher.update(tx.hash().as_ref());
            hash_status(&mut hasher, result);
        }
        hasher.update(&self.state_ref.height.to_le_bytes());
        hasher.update(self.state_ref.root.as_ref());
        hasher.update(&self.timestamp_ms.to_le_bytes());
        hasher.finalize().into()
    }

    pub fn block_ref(&self) -> BlockRef {
        BlockRef {
            height: self.height,
            hash: self.hash(),
        }
    }

    pub fn tx_hashes(&self) -> Vec<TxHash> {
        self.txs.iter().map(Transaction::hash).collect()
    }

    /// Successful withdraw intents in this block
    pub fn withdrawals(&self) -> Vec<WithdrawalLeaf> {
        self.txs
            .iter()
            .zip(&self.results)
            .filter(|(tx, result)| tx.kind() == TxKind::WithdrawIntent && result.is_success())
            .map(|(tx, _)| WithdrawalLeaf {
                tx_ref: tx.hash(),
                from: tx.from,
                value: tx.value,
                block_height: self.height,
            })
            .collect()
    }
}

fn hash_status(hasher: &mut blake3::Hasher, status: &ExecutionStatus) {
    match status {
        ExecutionStatus::Success => {
            hasher.update(&[0]);
        }
        ExecutionStatus::Failed(reason) => {
            hasher.update(&[1]);
            let code: u8 = match reason {
                FailureReason::InsufficientBalance { .. } => 1,
                FailureReason::UnauthorizedMint => 2,
                FailureReason::BalanceOverflow => 3,
                FailureReason::CensorshipTimeout { .. } => 4,
            };
            hasher.update(&[code]);
        }
    }
}

/// A contiguous run of blocks closed by the aggregator
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub blocks: Vec<Block>,
}

impl Batch {
    /// Content digest committed on L1
    pub fn digest(&self) -> Hash32 {
        let mut hasher = domain_hasher(b"rollup/batch/v1");
        hasher.update(&self.id.to_le_bytes());
        hasher.update(&(self.blocks.len() as u64).to_le_bytes());
        for block in &self.blocks {
            hasher.update(block.hash().as_ref());
        }
        hasher.finalize().into()
    }

    pub fn first_height(&self) -> Option<u64> {
        self.blocks.first().map(|b| b.height)
    }

    pub fn last_height(&self) -> Option<u64> {
        self.blocks.last().map(|b| b.height)
    }

    pub fn tx_count(&self) -> usize {
        self.blocks.iter().map(|b| b.txs.len()).sum()
    }

    /// Every transaction hash with the height of the block containing it
    pub fn tx_index(&self) -> Vec<(TxHash, u64)> {
        self.blocks
            .iter()
            .flat_map(|b| b.txs.iter().map(move |tx| (tx.hash(), b.height)))
            .collect()
    }

    pub fn withdrawals(&self) -> Vec<WithdrawalLeaf> {
        self.blocks.iter().flat_map(Block::withdrawals).collect()
    }
}
