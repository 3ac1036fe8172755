//! L2 Runtime - execution side of the rollup
//!
//! This crate provides the L2 half of the pipeline:
//! - Versioned ledger snapshots and the transaction processor
//! - General and force-inclusion mempools
//! - Receipt delivery with awaitable handles
//! - The sequencer block loop with sled-backed crash recovery

pub mod ledger;
pub mod mempool;
pub mod persistence;
pub mod processor;
pub mod receipts;
pub mod sequencer;

#[cfg(test)]
mod tests;

pub use ledger::{LedgerError, LedgerState, LedgerStore};
pub use mempool::{ForceTxPool, MempoolError, TxPool};
pub use persistence::{ChainHead, ChainStore};
pub use processor::{L2Processor, TransactionResult};
pub use receipts::{ReceiptBook, ReceiptHandle, Registration, WaitError};
pub use sequencer::{
    BlockUpdate, ChainView, Sequencer, SequencerConfig, SequencerError, StopHandle, TxSubmitter,
};

/// Default block time in milliseconds
pub const BLOCK_TIME_MS: u64 = 200;

/// Maximum transactions per block
pub const MAX_TXS_PER_BLOCK: usize = 64;

/// Blocks ahead of a force deadline at which the entry takes priority
pub const FORCE_LOOKAHEAD_BLOCKS: u64 = 2;
