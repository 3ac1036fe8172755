//! Mempools
//!
//! Two pools feed the sequencer:
//! - `TxPool`: general L2 transactions, drained FIFO
//! - `ForceTxPool`: L1-registered force transactions, drained by deadline
//!
//! Both accept concurrent inserts from any number of submitters and are drained
//! by the sequencer alone. A drain takes the pool lock once, so a block sees a
//! consistent cut of the pool.

use crate::persistence::ChainStore;
use parking_lot::Mutex;
use rollup_types::{ForceTxEntry, MalformedTxError, Origin, Transaction, TxHash};
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::Arc,
};
use thiserror::Error;

/// Default general pool capacity
pub const DEFAULT_POOL_CAPACITY: usize = 65_536;

#[derive(Debug, Error)]
pub enum MempoolError {
    #[error("malformed transaction: {0}")]
    Malformed(#[from] MalformedTxError),

    #[error("transaction {0} is already pending")]
    Duplicate(TxHash),

    #[error("transaction {0} was already executed")]
    AlreadyExecuted(TxHash),

    #[error("mempool full ({0} entries)")]
    Full(usize),

    #[error("mempool journal error: {0}")]
    Journal(String),
}

#[derive(Default)]
struct PoolInner {
    order: VecDeque<TxHash>,
    txs: HashMap<TxHash, Transaction>,
}

/// General L2 mempool
pub struct TxPool {
    inner: Mutex<PoolInner>,
    capacity: usize,
    journal: Option<Arc<ChainStore>>,
}

impl TxPool {
    pub fn new(capacity: usize, journal: Option<Arc<ChainStore>>) -> Self {
        Self {
            inner: Mutex::new(PoolInner::default()),
            capacity,
            journal,
        }
    }

    /// Validate and enqueue a transaction
    pub fn insert(&self, tx: Transaction) -> Result<TxHash, MempoolError> {
        tx.validate()?;
        let hash = tx.hash();
        check_not_executed(self.journal.as_deref(), &hash)?;

        let mut inner = self.inner.lock();
        if inner.txs.contains_key(&hash) {
            return Err(MempoolError::Duplicate(hash));
        }
        if inner.txs.len() >= self.capacity {
            return Err(MempoolError::Full(self.capacity));
        }
        if let Some(journal) = &self.journal {
            journal
                .journal_pending(&tx)
                .map_err(|e| MempoolError::Journal(e.to_string()))?;
        }

        inner.order.push_back(hash);
        inner.txs.insert(hash, tx);
        Ok(hash)
    }

    /// Take up to `max` transactions in arrival order
    pub fn drain(&self, max: usize) -> Vec<Transaction> {
        let mut inner = self.inner.lock();
        let mut drained = Vec::with_capacity(max.min(inner.order.len()));

        while drained.len() < max {
            let Some(hash) = inner.order.pop_front() else {
                break;
            };
            if let Some(tx) = inner.txs.remove(&hash) {
                drained.push(tx);
            }
        }

        drained
    }

    /// Put drained transactions back at the front, keeping their order
    pub fn requeue(&self, txs: Vec<Transaction>) {
        let mut inner = self.inner.lock();
        for tx in txs.into_iter().rev() {
            let hash = tx.hash();
            if inner.txs.insert(hash, tx).is_none() {
                inner.order.push_front(hash);
            }
        }
    }

    /// Reload journaled entries after a restart (no journal write)
    pub fn restore(&self, txs: Vec<Transaction>) -> usize {
        let mut inner = self.inner.lock();
        let mut restored = 0;
        for tx in txs {
            let hash = tx.hash();
            if inner.txs.insert(hash, tx).is_none() {
                inner.order.push_back(hash);
                restored += 1;
            }
        }
        restored
    }

    pub fn contains(&self, hash: &TxHash) -> bool {
        self.inner.lock().txs.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
struct ForcePoolInner {
    /// Keyed by (deadline, arrival sequence)
    by_deadline: BTreeMap<(u64, u64), ForceTxEntry>,
    index: HashMap<TxHash, (u64, u64)>,
    seq: u64,
}

impl ForcePoolInner {
    fn push(&mut self, hash: TxHash, entry: ForceTxEntry) -> bool {
        if self.index.contains_key(&hash) {
            return false;
        }
        let key = (entry.deadline, self.seq);
        self.seq += 1;
        self.index.insert(hash, key);
        self.by_deadline.insert(key, entry);
        true
    }

    fn take(&mut self, key: (u64, u64)) -> Option<ForceTxEntry> {
        let entry = self.by_deadline.remove(&key)?;
        self.index.remove(&entry.hash());
        Some(entry)
    }
}

/// Force-inclusion mempool with per-entry deadlines
pub struct ForceTxPool {
    inner: Mutex<ForcePoolInner>,
    journal: Option<Arc<ChainStore>>,
}

impl ForceTxPool {
    pub fn new(journal: Option<Arc<ChainStore>>) -> Self {
        Self {
            inner: Mutex::new(ForcePoolInner::default()),
            journal,
        }
    }

    /// Enqueue an L1-registered force transaction
    pub fn insert(&self, entry: ForceTxEntry) -> Result<TxHash, MempoolError> {
        entry.tx.validate()?;
        if entry.tx.origin != Origin::L1 {
            return Err(MalformedTxError::UnexpectedOrigin(entry.tx.origin).into());
        }
        let hash = entry.hash();
        check_not_executed(self.journal.as_deref(), &hash)?;

        let mut inner = self.inner.lock();
        if inner.index.contains_key(&hash) {
            return Err(MempoolError::Duplicate(hash));
        }
        if let Some(journal) = &self.journal {
            journal
                .journal_force(&entry)
                .map_err(|e| MempoolError::Journal(e.to_string()))?;
        }
        inner.push(hash, entry);
        Ok(hash)
    }

    /// Take up to `max` entries with `deadline <= next_height + lookahead`,
    /// earliest deadline first
    pub fn drain_due(&self, next_height: u64, lookahead: u64, max: usize) -> Vec<ForceTxEntry> {
        self.drain_until(next_height.saturating_add(lookahead), max)
    }

    /// Take up to `max` entries regardless of deadline, earliest first
    pub fn drain_any(&self, max: usize) -> Vec<ForceTxEntry> {
        self.drain_until(u64::MAX, max)
    }

    fn drain_until(&self, horizon: u64, max: usize) -> Vec<ForceTxEntry> {
        let mut inner = self.inner.lock();
        let keys: Vec<(u64, u64)> = inner
            .by_deadline
            .keys()
            .take_while(|(deadline, _)| *deadline <= horizon)
            .take(max)
            .copied()
            .collect();
        keys.into_iter().filter_map(|key| inner.take(key)).collect()
    }

    /// Remove entries that can no longer make their deadline
    /// (`deadline < next_height`)
    pub fn take_expired(&self, next_height: u64) -> Vec<ForceTxEntry> {
        let mut inner = self.inner.lock();
        let keys: Vec<(u64, u64)> = inner
            .by_deadline
            .keys()
            .take_while(|(deadline, _)| *deadline < next_height)
            .copied()
            .collect();
        keys.into_iter().filter_map(|key| inner.take(key)).collect()
    }

    /// Put drained entries back
    pub fn requeue(&self, entries: Vec<ForceTxEntry>) {
        let mut inner = self.inner.lock();
        for entry in entries {
            inner.push(entry.hash(), entry);
        }
    }

    /// Reload journaled entries after a restart (no journal write)
    pub fn restore(&self, entries: Vec<ForceTxEntry>) -> usize {
        let mut inner = self.inner.lock();
        entries
            .into_iter()
            .filter(|entry| inner.push(entry.hash(), entry.clone()))
            .count()
    }

    pub fn contains(&self, hash: &TxHash) -> bool {
        self.inner.lock().index.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn check_not_executed(journal: Option<&ChainStore>, hash: &TxHash) -> Result<(), MempoolError> {
    let Some(journal) = journal else {
        return Ok(());
    };
    match journal.is_executed(hash) {
        Ok(true) => Err(MempoolError::AlreadyExecuted(*hash)),
        Ok(false) => Ok(()),
        Err(e) => Err(MempoolError::Journal(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollup_types::Address;

    fn transfer(n: u128) -> Transaction {
        Transaction::transfer(
            Address::user_from_seed("alice"),
            Address::user_from_seed("bob"),
            n,
        )
    }

    fn force(n: u128, deadline: u64) -> ForceTxEntry {
        ForceTxEntry {
            tx: Transaction::new(
                Address::user_from_seed("carol"),
                Address::user_from_seed("dave"),
                n,
                Origin::L1,
            ),
            deadline,
        }
    }

    #[test]
    fn test_fifo_drain() {
        let pool = TxPool::new(16, None);
        for n in 1..=5 {
            pool.insert(transfer(n)).unwrap();
        }

        let first = pool.drain(3);
        assert_eq!(first.iter().map(|t| t.value).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(pool.len(), 2);

        pool.requeue(first);
        let all = pool.drain(10);
        assert_eq!(
            all.iter().map(|t| t.value).collect::<Vec<_>>(),
            vec![1, 2, 3, 4, 5]
        );
    }

    #[test]
    fn test_rejects_duplicates_and_malformed() {
        let pool = TxPool::new(16, None);
        let tx = transfer(1);
        pool.insert(tx.clone()).unwrap();
        assert!(matches!(pool.insert(tx), Err(MempoolError::Duplicate(_))));

        let bad = Transaction::transfer(Address::User([0u8; 20]), Address::user_from_seed("b"), 1);
        assert!(matches!(
            pool.insert(bad),
            Err(MempoolError::Malformed(MalformedTxError::EmptySender))
        ));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_capacity() {
        let pool = TxPool::new(2, None);
        pool.insert(transfer(1)).unwrap();
        pool.insert(transfer(2)).unwrap();
        assert!(matches!(pool.insert(transfer(3)), Err(MempoolError::Full(2))));
    }

    #[test]
    fn test_force_drain_by_deadline() {
        let pool = ForceTxPool::new(None);
        pool.insert(force(1, 20)).unwrap();
        pool.insert(force(2, 12)).unwrap();
        pool.insert(force(3, 15)).unwrap();
        pool.insert(force(4, 12)).unwrap();

        // next height 10, lookahead 5: deadlines <= 15 are due
        let due = pool.drain_due(10, 5, 10);
        assert_eq!(due.iter().map(|e| e.tx.value).collect::<Vec<_>>(), vec![2, 4, 3]);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_force_expiry() {
        let pool = ForceTxPool::new(None);
        pool.insert(force(1, 4)).unwrap();
        pool.insert(force(2, 5)).unwrap();

        // A block at height 5 can still include the deadline-5 entry
        let expired = pool.take_expired(5);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].deadline, 4);
        assert!(pool.contains(&force(2, 5).hash()));
    }

    #[test]
    fn test_force_requires_l1_origin() {
        let pool = ForceTxPool::new(None);
        let entry = ForceTxEntry {
            tx: transfer(1),
            deadline: 10,
        };
        assert!(matches!(
            pool.insert(entry),
            Err(MempoolError::Malformed(MalformedTxError::UnexpectedOrigin(Origin::L2)))
        ));
    }

    #[test]
    fn test_concurrent_inserts() {
        let pool = Arc::new(TxPool::new(10_000, None));
        let handles: Vec<_> = (0..8u128)
            .map(|worker| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for i in 0..100u128 {
                        pool.insert(transfer(worker * 1000 + i)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(pool.len(), 800);
        assert_eq!(pool.drain(usize::MAX).len(), 800);
    }
}
