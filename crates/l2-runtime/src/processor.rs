//! L2 Transaction Processor
//!
//! Applies transactions to a working copy of the ledger, strictly in order.
//! A failing transaction leaves the state untouched and does not stop the
//! remaining transactions of the block.

use crate::ledger::LedgerState;
use rollup_types::{
    ExecutionStatus, FailureReason, Transaction, TxHash, TxKind, L2_BRIDGE_ADDRESS,
};

/// Result of processing a single transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionResult {
    pub tx_hash: TxHash,
    pub height: u64,
    pub status: ExecutionStatus,
}

impl TransactionResult {
    pub fn success(&self) -> bool {
        self.status.is_success()
    }
}

/// L2 Transaction Processor
#[derive(Debug, Default, Clone)]
pub struct L2Processor {
    processed: u64,
    failed: u64,
}

impl L2Processor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process transactions for block `height` against `state`
    pub fn process_transactions(
        &mut self,
        state: &mut LedgerState,
        transactions: &[Transaction],
        height: u64,
    ) -> Vec<TransactionResult> {
        let mut results = Vec::with_capacity(transactions.len());

        for tx in transactions {
            let tx_hash = tx.hash();
            let status = match Self::apply(state, tx) {
                Ok(()) => ExecutionStatus::Success,
                Err(reason) => {
                    tracing::debug!("Transaction {} failed: {}", tx_hash, reason);
                    self.failed += 1;
                    ExecutionStatus::Failed(reason)
                }
            };
            self.processed += 1;

            results.push(TransactionResult {
                tx_hash,
                height,
                status,
            });
        }

        results
    }

    fn apply(state: &mut LedgerState, tx: &Transaction) -> Result<(), FailureReason> {
        match tx.kind() {
            TxKind::DepositMint => state.credit(tx.to, tx.value),
            _ if tx.from == L2_BRIDGE_ADDRESS => Err(FailureReason::UnauthorizedMint),
            // Burned on L2; the L1 bridge pays out once the batch is verified
            TxKind::WithdrawIntent => state.debit(tx.from, tx.value),
            TxKind::Transfer => {
                let available = state.balance(&tx.from);
                if available < tx.value {
                    return Err(FailureReason::InsufficientBalance {
                        needed: tx.value,
                        available,
                    });
                }
                if tx.from == tx.to {
                    return Ok(());
                }
                // Check the credit side before touching anything
                state
                    .balance(&tx.to)
                    .checked_add(tx.value)
                    .ok_or(FailureReason::BalanceOverflow)?;
                state.debit(tx.from, tx.value)?;
                state.credit(tx.to, tx.value)
            }
        }
    }

    /// Total transactions processed
    pub fn processed_count(&self) -> u64 {
        self.processed
    }

    /// Total transactions that failed
    pub fn failed_count(&self) -> u64 {
        self.failed
    }
}
