//! Sequencer - block production loop
//!
//! Drains the force and general mempools on a fixed cadence, executes the
//! selected transactions against a working copy of the latest ledger snapshot
//! and emits the block. Selection order per block:
//! 1. Force entries past their deadline are dropped and reported as censored
//! 2. Force entries due within the lookahead, earliest deadline first
//! 3. General pool, FIFO, up to the block capacity
//! 4. Remaining force entries fill any leftover capacity

use crate::{
    ledger::{LedgerError, LedgerState, LedgerStore},
    mempool::{ForceTxPool, MempoolError, TxPool, DEFAULT_POOL_CAPACITY},
    persistence::ChainStore,
    processor::L2Processor,
    receipts::{ReceiptBook, ReceiptHandle, Registration},
    BLOCK_TIME_MS, FORCE_LOOKAHEAD_BLOCKS, MAX_TXS_PER_BLOCK,
};
use rollup_types::{
    now_ms, Address, Block, BlockRef, CensorshipTimeout, FailureReason, ForceTxEntry, Hash32,
    MalformedTxError, Origin, Receipt, StateRef, Transaction, TxKind,
};
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};

/// Block update event sent to subscribers
#[derive(Clone, Debug)]
pub struct BlockUpdate {
    pub block: Arc<Block>,
    pub block_ref: BlockRef,
    /// Snapshot produced by this block
    pub state: Arc<LedgerState>,
    /// Block production time in microseconds
    pub processing_time_us: u64,
}

/// Latest head and snapshot, for read-only views
#[derive(Clone, Debug)]
pub struct ChainView {
    pub head: BlockRef,
    pub state: Arc<LedgerState>,
}

#[derive(Clone, Debug)]
pub struct SequencerConfig {
    /// Block time in milliseconds
    pub block_time_ms: u64,
    /// Maximum transactions per block
    pub max_txs_per_block: usize,
    /// Force entries with `deadline <= next height + lookahead` go first
    pub force_lookahead: u64,
    /// Produce blocks even when both pools are empty
    pub produce_empty_blocks: bool,
    /// General mempool capacity
    pub mempool_capacity: usize,
    /// Ledger snapshots kept in memory
    pub snapshot_retention: usize,
    /// Settled receipts kept in memory when a chain store backs lookups
    pub receipt_retention: usize,
    /// Enable verbose logging
    pub verbose: bool,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            block_time_ms: BLOCK_TIME_MS,
            max_txs_per_block: MAX_TXS_PER_BLOCK,
            force_lookahead: FORCE_LOOKAHEAD_BLOCKS,
            produce_empty_blocks: false,
            mempool_capacity: DEFAULT_POOL_CAPACITY,
            snapshot_retention: 128,
            receipt_retention: 100_000,
            verbose: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum SequencerError {
    #[error(transparent)]
    Mempool(#[from] MempoolError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("storage error: {0}")]
    Storage(String),
}

impl SequencerError {
    /// Whether the same submission may succeed later
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Mempool(MempoolError::Full(_) | MempoolError::Journal(_)) | Self::Storage(_)
        )
    }
}

impl From<MalformedTxError> for SequencerError {
    fn from(e: MalformedTxError) -> Self {
        Self::Mempool(MempoolError::Malformed(e))
    }
}

struct Pools {
    general: TxPool,
    force: ForceTxPool,
    receipts: Arc<ReceiptBook>,
    store: Option<Arc<ChainStore>>,
}

impl Pools {
    fn has_pending(&self) -> bool {
        !self.general.is_empty() || !self.force.is_empty()
    }
}

/// Handle for submitting transactions to the sequencer
#[derive(Clone)]
pub struct TxSubmitter {
    pools: Arc<Pools>,
    chain: watch::Receiver<ChainView>,
}

impl TxSubmitter {
    /// Public L2 submission path
    pub fn submit(&self, tx: Transaction) -> Result<ReceiptHandle, SequencerError> {
        tx.validate()?;
        if tx.origin != Origin::L2 {
            return Err(MalformedTxError::UnexpectedOrigin(tx.origin).into());
        }
        let is_withdraw = tx.kind() == TxKind::WithdrawIntent;
        self.enqueue(tx.hash(), is_withdraw, || self.pools.general.insert(tx))
    }

    /// L1-originated message (deposit mint) handed over by the relayer
    pub fn submit_l1_message(&self, tx: Transaction) -> Result<ReceiptHandle, SequencerError> {
        tx.validate()?;
        if tx.origin != Origin::L1 {
            return Err(MalformedTxError::UnexpectedOrigin(tx.origin).into());
        }
        self.enqueue(tx.hash(), false, || self.pools.general.insert(tx))
    }

    /// Force transaction registered on L1
    pub fn submit_force(&self, entry: ForceTxEntry) -> Result<ReceiptHandle, SequencerError> {
        entry.tx.validate()?;
        let is_withdraw = entry.tx.kind() == TxKind::WithdrawIntent;
        self.enqueue(entry.hash(), is_withdraw, || self.pools.force.insert(entry))
    }

    /// Burn `value` on L2 for a later L1 release
    pub fn withdraw(&self, from: Address, value: u128) -> Result<ReceiptHandle, SequencerError> {
        self.submit(Transaction::withdraw_intent(from, value))
    }

    pub fn receipts(&self) -> Arc<ReceiptBook> {
        self.pools.receipts.clone()
    }

    /// Height of the latest produced block
    pub fn head_height(&self) -> u64 {
        self.chain.borrow().head.height
    }

    /// Pending (general, force) pool sizes
    pub fn pool_sizes(&self) -> (usize, usize) {
        (self.pools.general.len(), self.pools.force.len())
    }

    fn enqueue(
        &self,
        hash: Hash32,
        is_withdraw: bool,
        insert: impl FnOnce() -> Result<Hash32, MempoolError>,
    ) -> Result<ReceiptHandle, SequencerError> {
        let handle = match self.pools.receipts.register(hash, is_withdraw) {
            Registration::Existing(handle) => return Ok(handle),
            Registration::New(handle) => handle,
        };

        match insert() {
            Ok(_) => Ok(handle),
            Err(MempoolError::AlreadyExecuted(hash)) => {
                // Executed before a restart: answer from the stored block
                let stored = self
                    .pools
                    .store
                    .as_ref()
                    .map(|store| store.load_receipt(&hash))
                    .transpose()
                    .map_err(|e| SequencerError::Storage(e.to_string()))?
                    .flatten();
                match stored {
                    Some(receipt) => {
                        self.pools.receipts.deliver(receipt);
                        Ok(handle)
                    }
                    None => {
                        self.pools.receipts.forget(&hash);
                        Err(MempoolError::AlreadyExecuted(hash).into())
                    }
                }
            }
            Err(e) => {
                self.pools.receipts.forget(&hash);
                Err(e.into())
            }
        }
    }
}

/// Stops a running sequencer loop
#[derive(Clone)]
pub struct StopHandle {
    running: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Sequencer
///
/// Sole owner of the ledger. Runs the block loop, producing blocks from the
/// mempools.
pub struct Sequencer {
    pools: Arc<Pools>,
    ledger: LedgerStore,
    processor: L2Processor,
    head: BlockRef,
    store: Option<Arc<ChainStore>>,
    /// Block update broadcaster
    update_sender: broadcast::Sender<BlockUpdate>,
    view_sender: watch::Sender<ChainView>,
    block_sink: Option<mpsc::Sender<Block>>,
    censorship_sink: Option<mpsc::UnboundedSender<CensorshipTimeout>>,
    config: SequencerConfig,
    running: Arc<AtomicBool>,
}

impl Sequencer {
    /// Create a sequencer, resuming from `store` when it holds a chain
    pub fn open(
        genesis: LedgerState,
        config: SequencerConfig,
        store: Option<Arc<ChainStore>>,
    ) -> Result<Self, SequencerError> {
        let storage_err = |e: anyhow::Error| SequencerError::Storage(e.to_string());

        let head = match &store {
            Some(store) => store.load_head().map_err(storage_err)?,
            None => None,
        };
        let (ledger, head_ref) = match (&store, head) {
            (Some(store), Some(head)) => {
                let snapshot = store
                    .load_snapshot(head.height)
                    .map_err(storage_err)?
                    .ok_or_else(|| {
                        SequencerError::Storage(format!("missing snapshot for head {}", head.height))
                    })?;
                tracing::info!(
                    "Resuming chain at height {} (block {})",
                    head.height,
                    head.block_hash
                );
                (
                    LedgerStore::from_snapshot(head.height, snapshot, config.snapshot_retention),
                    BlockRef {
                        height: head.height,
                        hash: head.block_hash,
                    },
                )
            }
            _ => (
                LedgerStore::new(genesis, config.snapshot_retention),
                BlockRef::default(),
            ),
        };

        let pools = Arc::new(Pools {
            general: TxPool::new(config.mempool_capacity, store.clone()),
            force: ForceTxPool::new(store.clone()),
            // Without a store the book is the only record of executed txs
            receipts: Arc::new(match &store {
                Some(_) => ReceiptBook::with_retention(config.receipt_retention),
                None => ReceiptBook::new(),
            }),
            store: store.clone(),
        });
        if let Some(store) = &store {
            Self::recover_pools(&pools, store).map_err(storage_err)?;
        }

        let (update_sender, _) = broadcast::channel(256);
        let (view_sender, _) = watch::channel(ChainView {
            head: head_ref,
            state: ledger.latest().1,
        });

        Ok(Self {
            pools,
            ledger,
            processor: L2Processor::new(),
            head: head_ref,
            store,
            update_sender,
            view_sender,
            block_sink: None,
            censorship_sink: None,
            config,
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Reload journaled entries, discarding any that a persisted block
    /// already executed
    fn recover_pools(pools: &Pools, store: &ChainStore) -> anyhow::Result<()> {
        let mut restored = Vec::new();
        let mut discarded = 0usize;
        for tx in store.load_pending()? {
            let hash = tx.hash();
            if store.is_executed(&hash)? {
                store.remove_pending(&hash)?;
                discarded += 1;
            } else {
                pools
                    .receipts
                    .register(hash, tx.kind() == TxKind::WithdrawIntent);
                restored.push(tx);
            }
        }
        let general = pools.general.restore(restored);

        let mut restored = Vec::new();
        for entry in store.load_force()? {
            let hash = entry.hash();
            if store.is_executed(&hash)? {
                store.remove_force(&hash)?;
                discarded += 1;
            } else {
                pools
                    .receipts
                    .register(hash, entry.tx.kind() == TxKind::WithdrawIntent);
                restored.push(entry);
            }
        }
        let force = pools.force.restore(restored);

        tracing::info!(
            "Recovered mempool: {} general, {} force, {} already executed",
            general,
            force,
            discarded
        );
        Ok(())
    }

    /// Forward every produced block (aggregator input)
    pub fn with_block_sink(mut self, sink: mpsc::Sender<Block>) -> Self {
        self.block_sink = Some(sink);
        self
    }

    /// Route censorship reports (relayer input)
    pub fn with_censorship_sink(mut self, sink: mpsc::UnboundedSender<CensorshipTimeout>) -> Self {
        self.censorship_sink = Some(sink);
        self
    }

    /// Get a handle for submitting transactions
    pub fn transaction_sender(&self) -> TxSubmitter {
        TxSubmitter {
            pools: self.pools.clone(),
            chain: self.view_sender.subscribe(),
        }
    }

    /// Subscribe to block updates
    pub fn subscribe(&self) -> broadcast::Receiver<BlockUpdate> {
        self.update_sender.subscribe()
    }

    pub fn chain_view(&self) -> watch::Receiver<ChainView> {
        self.view_sender.subscribe()
    }

    pub fn receipts(&self) -> Arc<ReceiptBook> {
        self.pools.receipts.clone()
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            running: self.running.clone(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn head(&self) -> BlockRef {
        self.head
    }

    pub fn latest_state(&self) -> Arc<LedgerState> {
        self.ledger.latest().1
    }

    /// Whether the run loop would produce a block now
    pub fn has_work(&self) -> bool {
        self.config.produce_empty_blocks || self.pools.has_pending()
    }

    /// Produce the next block from the current pools
    pub async fn produce_block(&mut self) -> Result<Arc<Block>, SequencerError> {
        let tick_start = Instant::now();
        let height = self.head.height + 1;
        let capacity = self.config.max_txs_per_block;

        self.expire_force_entries(height);

        let due = self
            .pools
            .force
            .drain_due(height, self.config.force_lookahead, capacity);
        let general = self.pools.general.drain(capacity - due.len());
        let leftover = self
            .pools
            .force
            .drain_any(capacity - due.len() - general.len());

        let mut seen = HashSet::new();
        let mut txs = Vec::with_capacity(due.len() + general.len() + leftover.len());
        let selected = due
            .iter()
            .map(|e| &e.tx)
            .chain(general.iter())
            .chain(leftover.iter().map(|e| &e.tx));
        for tx in selected {
            let hash = tx.hash();
            if !seen.insert(hash) || self.already_executed(&hash) {
                tracing::warn!("Skipping already-executed transaction {}", hash);
                continue;
            }
            txs.push(tx.clone());
        }

        let (_, latest) = self.ledger.latest();
        let mut working = (*latest).clone();
        let results = self
            .processor
            .process_transactions(&mut working, &txs, height);

        let block = Block {
            height,
            parent_ref: self.head.hash,
            txs,
            results: results.into_iter().map(|r| r.status).collect(),
            state_ref: StateRef {
                height,
                root: working.root(),
            },
            timestamp_ms: now_ms(),
        };

        if let Some(store) = &self.store {
            if let Err(e) = store.persist_block(&block, &working) {
                tracing::error!("Failed to persist block {}: {:?}", height, e);
                self.pools.general.requeue(general);
                let mut forced = due;
                forced.extend(leftover);
                self.pools.force.requeue(forced);
                return Err(SequencerError::Storage(e.to_string()));
            }
        }

        let state_ref = self.ledger.commit(height, working)?;
        let block_ref = block.block_ref();
        self.head = block_ref;
        debug_assert_eq!(state_ref, block.state_ref);

        if let Some(store) = &self.store {
            let failed = general
                .iter()
                .map(|tx| store.remove_pending(&tx.hash()))
                .chain(due.iter().chain(&leftover).map(|e| store.remove_force(&e.hash())))
                .filter_map(Result::err)
                .count();
            if failed > 0 {
                tracing::warn!("Failed to clear {} journal entries for block {}", failed, height);
            }
        }

        for (tx, status) in block.txs.iter().zip(&block.results) {
            self.pools
                .receipts
                .deliver(Receipt::executed(tx.hash(), status, block_ref));
        }

        let block = Arc::new(block);
        let state = self.ledger.latest().1;
        let processing_time = tick_start.elapsed();

        self.view_sender.send_replace(ChainView {
            head: block_ref,
            state: state.clone(),
        });
        // No subscribers is fine
        let _ = self.update_sender.send(BlockUpdate {
            block: block.clone(),
            block_ref,
            state,
            processing_time_us: processing_time.as_micros() as u64,
        });

        if let Some(sink) = &self.block_sink {
            if sink.send((*block).clone()).await.is_err() {
                tracing::warn!("Block sink closed, block {} not forwarded", height);
            }
        }

        if self.config.verbose || !block.txs.is_empty() {
            tracing::debug!(
                "Block {} | {} txs | {:.2}ms",
                height,
                block.txs.len(),
                processing_time.as_secs_f64() * 1000.0
            );
        }

        Ok(block)
    }

    fn already_executed(&self, hash: &Hash32) -> bool {
        match &self.store {
            Some(store) => store.is_executed(hash).unwrap_or(false),
            None => false,
        }
    }

    /// Drop force entries whose deadline is below `height` and report them
    fn expire_force_entries(&self, height: u64) {
        for entry in self.pools.force.take_expired(height) {
            let tx_ref = entry.hash();
            tracing::warn!(
                target: "censorship",
                "Force transaction {} missed deadline {} (next height {})",
                tx_ref,
                entry.deadline,
                height
            );

            if let Some(store) = &self.store {
                if let Err(e) = store.remove_force(&tx_ref) {
                    tracing::warn!("Failed to clear force journal entry {}: {:?}", tx_ref, e);
                }
            }
            self.pools.receipts.deliver(Receipt::dropped(
                tx_ref,
                FailureReason::CensorshipTimeout {
                    deadline: entry.deadline,
                },
            ));

            if let Some(sink) = &self.censorship_sink {
                let report = CensorshipTimeout {
                    tx_ref,
                    deadline: entry.deadline,
                    observed_height: height,
                };
                if sink.send(report).is_err() {
                    tracing::warn!(target: "censorship", "Censorship sink closed");
                }
            }
        }
    }

    /// Run the sequencer loop (tokio)
    pub async fn run_async(mut self) {
        let block_duration = Duration::from_millis(self.config.block_time_ms.max(1));
        let mut interval = tokio::time::interval(block_duration);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        tracing::info!(
            "Sequencer started ({}ms blocks, up to {} txs)",
            self.config.block_time_ms,
            self.config.max_txs_per_block
        );

        while self.running.load(Ordering::SeqCst) {
            interval.tick().await;
            if !self.has_work() {
                continue;
            }

            let tick_start = Instant::now();
            match self.produce_block().await {
                Ok(_) => {
                    let elapsed = tick_start.elapsed();
                    if elapsed > block_duration {
                        tracing::warn!(
                            "Block {} took {:.2}ms (target: {}ms)",
                            self.head.height,
                            elapsed.as_secs_f64() * 1000.0,
                            self.config.block_time_ms
                        );
                    }
                }
                Err(e) => tracing::error!("Block production failed: {}", e),
            }
        }

        if let Some(store) = &self.store {
            if let Err(e) = store.flush() {
                tracing::warn!("Failed to flush chain store: {:?}", e);
            }
        }
        tracing::info!("Sequencer stopped at height {}", self.head.height);
    }
}
