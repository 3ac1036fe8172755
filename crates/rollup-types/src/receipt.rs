//! Receipts and transaction lifecycle

use crate::{block::BlockRef, transaction::TxHash};
use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a transaction did not take effect
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub enum FailureReason {
    InsufficientBalance { needed: u128, available: u128 },
    /// Bridge-originated transaction that did not come from L1
    UnauthorizedMint,
    BalanceOverflow,
    /// Force transaction not included before its deadline
    CensorshipTimeout { deadline: u64 },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientBalance { needed, available } => {
                write!(f, "insufficient balance: needed {}, available {}", needed, available)
            }
            Self::UnauthorizedMint => f.write_str("mint not originated on L1"),
            Self::BalanceOverflow => f.write_str("balance overflow"),
            Self::CensorshipTimeout { deadline } => {
                write!(f, "force transaction missed deadline {}", deadline)
            }
        }
    }
}

/// Per-transaction execution result recorded in a block
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Success,
    Failed(FailureReason),
}

impl ExecutionStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceiptStatus {
    Pending,
    Confirmed,
    Failed(FailureReason),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub tx_ref: TxHash,
    pub status: ReceiptStatus,
    pub block_ref: Option<BlockRef>,
}

impl Receipt {
    pub fn pending(tx_ref: TxHash) -> Self {
        Self {
            tx_ref,
            status: ReceiptStatus::Pending,
            block_ref: None,
        }
    }

    /// Receipt for a transaction included in `block`
    pub fn executed(tx_ref: TxHash, status: &ExecutionStatus, block: BlockRef) -> Self {
        let status = match status {
            ExecutionStatus::Success => ReceiptStatus::Confirmed,
            ExecutionStatus::Failed(reason) => ReceiptStatus::Failed(reason.clone()),
        };
        Self {
            tx_ref,
            status,
            block_ref: Some(block),
        }
    }

    /// Receipt for a transaction that left the pool without inclusion
    pub fn dropped(tx_ref: TxHash, reason: FailureReason) -> Self {
        Self {
            tx_ref,
            status: ReceiptStatus::Failed(reason),
            block_ref: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self.status, ReceiptStatus::Pending)
    }
}

/// Where a transaction is in the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxLifecycle {
    Submitted,
    Sequenced,
    Executed { success: bool },
    /// Withdraw intents only: executed, batch not yet verified on L1
    AwaitingL1Finality,
    Finalized,
    Rejected,
}
