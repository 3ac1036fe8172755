//! Persistence Layer for L2 State
//!
//! Uses sled embedded database so a restarted sequencer can pick up where it
//! stopped:
//! - Pending mempool and force-pool entries are journaled before a submission
//!   is acknowledged
//! - Each produced block is written atomically together with its executed-tx
//!   markers, the ledger snapshot and the chain head
//!
//! A block is the commit point. On restart any journaled entry that already
//! has an executed marker is discarded instead of being applied again.

use crate::ledger::LedgerState;
use rollup_types::{Block, ForceTxEntry, Hash32, Receipt, Transaction, TxHash};
use serde::{Deserialize, Serialize};
use sled::{
    transaction::{ConflictableTransactionError, TransactionError},
    Db, Transactional,
};
use std::path::Path;

const HEAD_KEY: &str = "head";

/// Metadata about the last persisted block
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ChainHead {
    /// Height of the last persisted block
    pub height: u64,
    /// Hash of that block
    pub block_hash: Hash32,
    /// Root of the snapshot it produced
    pub state_root: Hash32,
    /// Last save timestamp
    pub last_save_ts: i64,
}

/// Persistent storage for the sequencer
pub struct ChainStore {
    /// Sled database instance
    db: Db,
    /// Pending general-pool transactions (hash -> tx)
    pending: sled::Tree,
    /// Pending force entries (hash -> entry)
    force_pending: sled::Tree,
    /// Executed transactions (hash -> block height)
    executed: sled::Tree,
    /// Blocks by height
    blocks: sled::Tree,
    /// Ledger snapshot of the head block
    snapshots: sled::Tree,
    /// Chain head
    metadata: sled::Tree,
}

impl ChainStore {
    /// Open or create a store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let db = sled::open(&path)?;
        let pending = db.open_tree("pending")?;
        let force_pending = db.open_tree("force_pending")?;
        let executed = db.open_tree("executed")?;
        let blocks = db.open_tree("blocks")?;
        let snapshots = db.open_tree("snapshots")?;
        let metadata = db.open_tree("metadata")?;

        tracing::info!("Opened chain store at {:?}", path.as_ref());

        Ok(Self {
            db,
            pending,
            force_pending,
            executed,
            blocks,
            snapshots,
            metadata,
        })
    }

    /// Journal a pending transaction
    pub fn journal_pending(&self, tx: &Transaction) -> anyhow::Result<()> {
        let bytes = bincode::serialize(tx)?;
        self.pending.insert(tx.hash().as_ref(), bytes)?;
        Ok(())
    }

    pub fn remove_pending(&self, hash: &TxHash) -> anyhow::Result<()> {
        self.pending.remove(hash.as_ref())?;
        Ok(())
    }

    /// All journaled general-pool transactions
    pub fn load_pending(&self) -> anyhow::Result<Vec<Transaction>> {
        let mut txs = Vec::new();
        for result in self.pending.iter() {
            let (_, value) = result?;
            txs.push(bincode::deserialize(&value)?);
        }
        Ok(txs)
    }

    /// Journal a pending force entry
    pub fn journal_force(&self, entry: &ForceTxEntry) -> anyhow::Result<()> {
        let bytes = bincode::serialize(entry)?;
        self.force_pending.insert(entry.hash().as_ref(), bytes)?;
        Ok(())
    }

    pub fn remove_force(&self, hash: &TxHash) -> anyhow::Result<()> {
        self.force_pending.remove(hash.as_ref())?;
        Ok(())
    }

    pub fn load_force(&self) -> anyhow::Result<Vec<ForceTxEntry>> {
        let mut entries = Vec::new();
        for result in self.force_pending.iter() {
            let (_, value) = result?;
            entries.push(bincode::deserialize(&value)?);
        }
        Ok(entries)
    }

    /// Height of the block that executed `hash`, if any
    pub fn executed_height(&self, hash: &TxHash) -> anyhow::Result<Option<u64>> {
        match self.executed.get(hash.as_ref())? {
            Some(bytes) => {
                let arr: [u8; 8] = bytes
                    .as_ref()
                    .try_into()
                    .map_err(|_| anyhow::anyhow!("Invalid executed marker for {}", hash))?;
                Ok(Some(u64::from_be_bytes(arr)))
            }
            None => Ok(None),
        }
    }

    pub fn is_executed(&self, hash: &TxHash) -> anyhow::Result<bool> {
        Ok(self.executed.contains_key(hash.as_ref())?)
    }

    /// Rebuild the receipt of an executed transaction from its block
    pub fn load_receipt(&self, hash: &TxHash) -> anyhow::Result<Option<Receipt>> {
        let Some(height) = self.executed_height(hash)? else {
            return Ok(None);
        };
        let block = self
            .load_block(height)?
            .ok_or_else(|| anyhow::anyhow!("Block {} missing for executed tx {}", height, hash))?;
        let block_ref = block.block_ref();
        Ok(block
            .txs
            .iter()
            .zip(&block.results)
            .find(|(tx, _)| tx.hash() == *hash)
            .map(|(_, status)| Receipt::executed(*hash, status, block_ref)))
    }

    /// Persist a produced block and the state it leads to, atomically
    pub fn persist_block(&self, block: &Block, state: &LedgerState) -> anyhow::Result<()> {
        let key = block.height.to_be_bytes();
        let block_bytes = bincode::serialize(block)?;
        let state_bytes = bincode::serialize(state)?;
        let head = ChainHead {
            height: block.height,
            block_hash: block.hash(),
            state_root: block.state_ref.root,
            last_save_ts: chrono::Utc::now().timestamp(),
        };
        let head_bytes = bincode::serialize(&head)?;
        let tx_hashes = block.tx_hashes();
        let previous = block.height.checked_sub(1).map(u64::to_be_bytes);

        (&self.blocks, &self.executed, &self.snapshots, &self.metadata)
            .transaction(|(blocks, executed, snapshots, metadata)| {
                blocks.insert(&key[..], block_bytes.as_slice())?;
                for hash in &tx_hashes {
                    executed.insert(hash.as_ref(), &key[..])?;
                }
                snapshots.insert(&key[..], state_bytes.as_slice())?;
                if let Some(prev) = &previous {
                    snapshots.remove(&prev[..])?;
                }
                metadata.insert(HEAD_KEY, head_bytes.as_slice())?;
                Ok::<(), ConflictableTransactionError<()>>(())
            })
            .map_err(|e: TransactionError<()>| {
                anyhow::anyhow!("Failed to persist block {}: {:?}", block.height, e)
            })?;

        self.db.flush()?;
        Ok(())
    }

    /// Load the chain head
    pub fn load_head(&self) -> anyhow::Result<Option<ChainHead>> {
        match self.metadata.get(HEAD_KEY)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn load_block(&self, height: u64) -> anyhow::Result<Option<Block>> {
        match self.blocks.get(height.to_be_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Ledger snapshot stored for `height` (only the head is kept)
    pub fn load_snapshot(&self, height: u64) -> anyhow::Result<Option<LedgerState>> {
        match self.snapshots.get(height.to_be_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Flush all pending writes to disk
    pub fn flush(&self) -> anyhow::Result<()> {
        self.db.flush()?;
        Ok(())
    }

    /// Number of journaled general-pool transactions
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
