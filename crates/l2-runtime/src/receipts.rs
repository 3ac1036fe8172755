//! Receipt book
//!
//! One entry per submitted transaction. Each entry holds a `watch` channel so
//! any number of callers can await the same receipt, give up after a timeout
//! and come back later. The terminal receipt is written exactly once.
//!
//! With a retention bound, settled entries (terminal receipt, no L1 finality
//! pending) are evicted oldest first once the bound is exceeded. Only use it
//! when a chain store can answer for executed transactions.

use dashmap::{mapref::entry::Entry, DashMap};
use parking_lot::Mutex;
use rollup_types::{Receipt, ReceiptStatus, TxHash, TxLifecycle};
use std::{collections::VecDeque, time::Duration};
use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WaitError {
    #[error("timed out waiting for receipt of {0}")]
    Timeout(TxHash),

    #[error("receipt for {0} was dropped from the book")]
    Closed(TxHash),
}

struct ReceiptEntry {
    sender: watch::Sender<Receipt>,
    lifecycle: TxLifecycle,
    is_withdraw: bool,
}

/// Outcome of registering a transaction hash
pub enum Registration {
    /// First time this hash was seen
    New(ReceiptHandle),
    /// Hash already known; the caller joins the existing receipt
    Existing(ReceiptHandle),
}

impl Registration {
    pub fn into_handle(self) -> ReceiptHandle {
        match self {
            Self::New(handle) | Self::Existing(handle) => handle,
        }
    }
}

#[derive(Default)]
pub struct ReceiptBook {
    entries: DashMap<TxHash, ReceiptEntry>,
    /// Settled hashes, oldest first
    settled: Mutex<VecDeque<TxHash>>,
    retention: Option<usize>,
}

impl ReceiptBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `retention` settled entries
    pub fn with_retention(retention: usize) -> Self {
        Self {
            retention: Some(retention),
            ..Self::default()
        }
    }

    /// Register a submitted transaction, or join the receipt it already has
    pub fn register(&self, tx_hash: TxHash, is_withdraw: bool) -> Registration {
        match self.entries.entry(tx_hash) {
            Entry::Occupied(entry) => Registration::Existing(ReceiptHandle {
                tx_hash,
                receiver: entry.get().sender.subscribe(),
            }),
            Entry::Vacant(entry) => {
                let (sender, receiver) = watch::channel(Receipt::pending(tx_hash));
                entry.insert(ReceiptEntry {
                    sender,
                    lifecycle: TxLifecycle::Submitted,
                    is_withdraw,
                });
                Registration::New(ReceiptHandle { tx_hash, receiver })
            }
        }
    }

    /// Write the terminal receipt. Returns false if the hash is unknown or a
    /// terminal receipt was already delivered.
    pub fn deliver(&self, receipt: Receipt) -> bool {
        let Some(mut entry) = self.entries.get_mut(&receipt.tx_ref) else {
            return false;
        };
        if entry.sender.borrow().is_terminal() || !receipt.is_terminal() {
            return false;
        }

        entry.lifecycle = match (&receipt.status, receipt.block_ref) {
            (ReceiptStatus::Confirmed, Some(_)) if entry.is_withdraw => {
                TxLifecycle::AwaitingL1Finality
            }
            (ReceiptStatus::Confirmed, _) => TxLifecycle::Executed { success: true },
            (ReceiptStatus::Failed(_), Some(_)) => TxLifecycle::Executed { success: false },
            // Left the pool without being included
            _ => TxLifecycle::Rejected,
        };
        let settled = entry.lifecycle != TxLifecycle::AwaitingL1Finality;
        let tx_hash = receipt.tx_ref;
        entry.sender.send_replace(receipt);
        drop(entry);

        if settled {
            self.settle(tx_hash);
        }
        true
    }

    /// Move confirmed withdraw intents of a finalized batch to their final stage
    pub fn record_batch_finality<'a>(
        &self,
        tx_hashes: impl IntoIterator<Item = &'a TxHash>,
        verified: bool,
    ) -> usize {
        let mut updated = 0;
        for hash in tx_hashes {
            if let Some(mut entry) = self.entries.get_mut(hash) {
                if entry.lifecycle == TxLifecycle::AwaitingL1Finality {
                    entry.lifecycle = if verified {
                        TxLifecycle::Finalized
                    } else {
                        TxLifecycle::Rejected
                    };
                    updated += 1;
                    drop(entry);
                    self.settle(*hash);
                }
            }
        }
        updated
    }

    fn settle(&self, tx_hash: TxHash) {
        let Some(retention) = self.retention else {
            return;
        };
        let evicted: Vec<TxHash> = {
            let mut settled = self.settled.lock();
            settled.push_back(tx_hash);
            let excess = settled.len().saturating_sub(retention);
            settled.drain(..excess).collect()
        };
        for hash in evicted {
            self.entries.remove(&hash);
        }
    }

    /// A fresh handle on an existing receipt
    pub fn subscribe(&self, tx_hash: &TxHash) -> Option<ReceiptHandle> {
        self.entries.get(tx_hash).map(|entry| ReceiptHandle {
            tx_hash: *tx_hash,
            receiver: entry.sender.subscribe(),
        })
    }

    pub fn get(&self, tx_hash: &TxHash) -> Option<Receipt> {
        self.entries
            .get(tx_hash)
            .map(|entry| entry.sender.borrow().clone())
    }

    pub fn lifecycle(&self, tx_hash: &TxHash) -> Option<TxLifecycle> {
        self.entries.get(tx_hash).map(|entry| entry.lifecycle)
    }

    pub fn is_terminal(&self, tx_hash: &TxHash) -> bool {
        self.entries
            .get(tx_hash)
            .map(|entry| entry.sender.borrow().is_terminal())
            .unwrap_or(false)
    }

    /// Drop an entry. Outstanding handles see `WaitError::Closed` unless the
    /// receipt was already terminal.
    pub fn forget(&self, tx_hash: &TxHash) {
        self.entries.remove(tx_hash);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Awaitable receipt of one transaction
#[derive(Clone, Debug)]
pub struct ReceiptHandle {
    tx_hash: TxHash,
    receiver: watch::Receiver<Receipt>,
}

impl ReceiptHandle {
    pub fn tx_hash(&self) -> TxHash {
        self.tx_hash
    }

    /// Current receipt (Pending until the block is produced)
    pub fn current(&self) -> Receipt {
        self.receiver.borrow().clone()
    }

    /// Wait for the terminal receipt. On timeout the handle stays usable and the
    /// transaction stays live.
    pub async fn wait(&mut self, timeout: Duration) -> Result<Receipt, WaitError> {
        let tx_hash = self.tx_hash;
        match tokio::time::timeout(timeout, self.receiver.wait_for(Receipt::is_terminal)).await {
            Ok(Ok(receipt)) => Ok(receipt.clone()),
            Ok(Err(_)) => Err(WaitError::Closed(tx_hash)),
            Err(_) => Err(WaitError::Timeout(tx_hash)),
        }
    }
}
