//! Batch builder
//!
//! Accumulates contiguous blocks and decides when a batch closes. Holds no
//! tasks or channels; the aggregator loop drives it with the current time.

use rollup_types::{Batch, BatchId, Block, BlockRef, Hash32};
use std::{collections::VecDeque, time::Instant};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BatchError {
    #[error("block {got_height} (parent {got_parent}) does not extend {expected_height} ({expected_parent})")]
    NonContiguousBlock {
        expected_height: u64,
        expected_parent: Hash32,
        got_height: u64,
        got_parent: Hash32,
    },

    #[error("unknown batch {0}")]
    UnknownBatch(BatchId),

    #[error("batch {batch_id} is not stalled ({state})")]
    NotStalled { batch_id: BatchId, state: String },

    #[error("aggregator stopped")]
    Stopped,
}

#[derive(Clone, Debug)]
pub struct BatchPolicy {
    pub max_blocks_per_batch: usize,
    /// Measured from the first block of the open batch
    pub max_batch_wait_ms: u64,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            max_blocks_per_batch: 16,
            max_batch_wait_ms: 2_000,
        }
    }
}

pub struct BatchBuilder {
    policy: BatchPolicy,
    next_id: BatchId,
    /// Last ingested block; the next one must extend it
    tip: BlockRef,
    pending: VecDeque<(Block, Instant)>,
}

impl BatchBuilder {
    /// Builder expecting the block after `anchor` as its first input
    pub fn new(policy: BatchPolicy, anchor: BlockRef) -> Self {
        Self {
            policy,
            next_id: 1,
            tip: anchor,
            pending: VecDeque::new(),
        }
    }

    pub fn ingest(&mut self, block: Block, now: Instant) -> Result<(), BatchError> {
        if block.height != self.tip.height + 1 || block.parent_ref != self.tip.hash {
            return Err(BatchError::NonContiguousBlock {
                expected_height: self.tip.height + 1,
                expected_parent: self.tip.hash,
                got_height: block.height,
                got_parent: block.parent_ref,
            });
        }
        self.tip = block.block_ref();
        self.pending.push_back((block, now));
        Ok(())
    }

    /// Whether the open batch reached its size or age limit
    pub fn should_close(&self, now: Instant) -> bool {
        match self.pending.front() {
            None => false,
            Some(_) if self.pending.len() >= self.policy.max_blocks_per_batch.max(1) => true,
            Some((_, opened)) => {
                now.saturating_duration_since(*opened).as_millis() as u64
                    >= self.policy.max_batch_wait_ms
            }
        }
    }

    /// Close the open batch. Blocks past the size limit stay queued and open
    /// the next batch with their own arrival time.
    pub fn close(&mut self) -> Option<Batch> {
        if self.pending.is_empty() {
            return None;
        }
        let take = self.pending.len().min(self.policy.max_blocks_per_batch.max(1));
        let blocks = self.pending.drain(..take).map(|(block, _)| block).collect();

        let batch = Batch {
            id: self.next_id,
            blocks,
        };
        self.next_id += 1;
        Some(batch)
    }

    pub fn unbatched(&self) -> usize {
        self.pending.len()
    }

    pub fn next_id(&self) -> BatchId {
        self.next_id
    }

    pub fn tip(&self) -> BlockRef {
        self.tip
    }
}
