//! Shared types for the L1/L2 rollup pipeline
//!
//! Every actor in the workspace (sequencer, aggregator, prover, relayer and the
//! two L1 contracts) exchanges the messages defined here:
//! - Addresses and origins (closed enums)
//! - Transactions, blocks and batches with their content hashes
//! - Receipts and the per-transaction lifecycle
//! - Commitments, proofs and the L1 finality record
//! - Bridge records and force-inclusion entries

pub mod address;
pub mod block;
pub mod bridge;
pub mod finality;
pub mod hash;
pub mod receipt;
pub mod transaction;

pub use address::{Address, Origin, ADDRESS_LEN, L2_BRIDGE_ADDRESS};
pub use block::{Batch, BatchId, Block, BlockHash, BlockRef, StateRef};
pub use bridge::{
    BridgeDirection, BridgeRecord, BridgeRecordStatus, CensorshipTimeout, ForceTxEntry,
    ForceTxStatus, WithdrawalLeaf,
};
pub use finality::{certify, Commitment, FinalityStatus, Proof};
pub use hash::{Hash32, ParseError};
pub use receipt::{ExecutionStatus, FailureReason, Receipt, ReceiptStatus, TxLifecycle};
pub use transaction::{MalformedTxError, Transaction, TxHash, TxKind};

/// Current time in unix milliseconds
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
