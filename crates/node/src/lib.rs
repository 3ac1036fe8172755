//! Rollup Node - wires the L2 pipeline to the L1 contracts
//!
//! One process runs every actor:
//! - Sequencer, fed by the RPC server and the relayer
//! - Aggregator with the stub prover, consuming the sequencer's blocks
//! - Relayer listeners draining the L1 outboxes
//! - L1 rollup and bridge contract actors
//! - A finality watcher that moves withdraw receipts to their final stage

pub mod config;

#[cfg(test)]
mod tests;

pub use config::{GenesisAccount, NodeConfig};

use aggregator::{Aggregator, AggregatorHandle};
use l1_contracts::{spawn_bridge, spawn_rollup, BridgeHandle, RollupEvent, RollupHandle};
use l2_runtime::{ChainStore, ChainView, ReceiptBook, Sequencer, StopHandle, TxSubmitter};
use prover::StubProver;
use relayer::Relayer;
use rollup_types::FinalityStatus;
use rpc_server::{HttpRpcServer, RpcContext};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
};

/// Capacity of the sequencer → aggregator block channel
const BLOCK_CHANNEL_CAPACITY: usize = 1_024;

/// How long shutdown waits for in-flight batches
const AGGREGATOR_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct RollupNode {
    pub submitter: TxSubmitter,
    pub receipts: Arc<ReceiptBook>,
    pub chain: watch::Receiver<ChainView>,
    pub rollup: RollupHandle,
    pub bridge: BridgeHandle,
    pub aggregator: AggregatorHandle,
    pub relayer: Arc<Relayer>,
    store: Option<Arc<ChainStore>>,
    stop: StopHandle,
    sequencer_task: JoinHandle<()>,
    aggregator_task: JoinHandle<()>,
    background: Vec<JoinHandle<()>>,
}

impl RollupNode {
    /// Open the chain store, spawn every actor and start sequencing
    pub async fn launch(config: NodeConfig) -> anyhow::Result<Self> {
        let store = match &config.data_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                Some(Arc::new(ChainStore::open(dir)?))
            }
            None => None,
        };

        let call_timeout = Duration::from_millis(config.l1_call_timeout_ms);
        let (rollup, rollup_outbox) = spawn_rollup(config.rollup(), call_timeout);
        let (bridge, bridge_outbox) =
            spawn_bridge(config.l1_genesis_balances(), rollup.clone(), call_timeout);

        let (block_tx, block_rx) = mpsc::channel(BLOCK_CHANNEL_CAPACITY);
        let (censorship_tx, censorship_rx) = mpsc::unbounded_channel();
        let sequencer = Sequencer::open(config.l2_genesis_state(), config.sequencer(), store.clone())?
            .with_block_sink(block_tx)
            .with_censorship_sink(censorship_tx);

        let submitter = sequencer.transaction_sender();
        let receipts = sequencer.receipts();
        let chain = sequencer.chain_view();
        let stop = sequencer.stop_handle();
        let head = sequencer.head();

        let relayer = Arc::new(Relayer::new(
            rollup.clone(),
            bridge.clone(),
            submitter.clone(),
            config.relayer(),
        ));
        let mut background = relayer.spawn_listeners(rollup_outbox, bridge_outbox, censorship_rx);

        let (aggregator, aggregator_handle) = Aggregator::new(
            config.aggregator(),
            head,
            Arc::new(StubProver::new(config.prover())),
            relayer.clone(),
        );
        let aggregator_task = tokio::spawn(aggregator.run(block_rx));

        background.push(spawn_finality_watcher(rollup.subscribe(), receipts.clone()));

        let sequencer_task = tokio::spawn(sequencer.run_async());

        tracing::info!(
            "Rollup node running from height {} ({}ms blocks, batches of up to {} blocks)",
            head.height,
            config.block_time_ms,
            config.max_blocks_per_batch
        );

        Ok(Self {
            submitter,
            receipts,
            chain,
            rollup,
            bridge,
            aggregator: aggregator_handle,
            relayer,
            store,
            stop,
            sequencer_task,
            aggregator_task,
            background,
        })
    }

    pub fn rpc_context(&self) -> Arc<RpcContext> {
        Arc::new(RpcContext {
            submitter: self.submitter.clone(),
            receipts: self.receipts.clone(),
            chain: self.chain.clone(),
            rollup: self.rollup.clone(),
            bridge: self.bridge.clone(),
            store: self.store.clone(),
            aggregator: Some(self.aggregator.clone()),
        })
    }

    /// Start the HTTP RPC server on `addr`
    pub fn serve_rpc(&mut self, addr: String) {
        let server = HttpRpcServer::new(self.rpc_context());
        self.background.push(tokio::spawn(async move {
            if let Err(e) = server.run(&addr).await {
                tracing::error!("HTTP RPC server error: {}", e);
            }
        }));
    }

    /// Current L2 head height
    pub fn height(&self) -> u64 {
        self.chain.borrow().head.height
    }

    /// Stop sequencing, let in-flight batches settle and release the store
    pub async fn shutdown(self) {
        tracing::info!("Shutting down...");
        self.stop.stop();
        if let Err(e) = self.sequencer_task.await {
            tracing::error!("Sequencer task failed: {}", e);
        }

        // The sequencer dropped its block sink; the aggregator drains and exits
        let mut aggregator_task = self.aggregator_task;
        if tokio::time::timeout(AGGREGATOR_DRAIN_TIMEOUT, &mut aggregator_task)
            .await
            .is_err()
        {
            tracing::warn!("Aggregator did not drain in time, aborting");
            aggregator_task.abort();
            let _ = aggregator_task.await;
        }

        for task in self.background {
            task.abort();
            let _ = task.await;
        }

        if let Some(store) = &self.store {
            if let Err(e) = store.flush() {
                tracing::error!("Failed to flush chain store: {}", e);
            }
        }
        tracing::info!("Rollup node stopped");
    }
}

/// Move withdraw receipts of finalized batches to Finalized or Rejected
fn spawn_finality_watcher(
    mut events: broadcast::Receiver<RollupEvent>,
    receipts: Arc<ReceiptBook>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(RollupEvent::Finalized {
                    batch_id,
                    status,
                    tx_refs,
                }) => {
                    let verified = status == FinalityStatus::Verified;
                    let updated = receipts.record_batch_finality(&tx_refs, verified);
                    if updated > 0 {
                        tracing::info!(
                            "Batch {} {:?}: {} withdrawals settled on L2 receipts",
                            batch_id,
                            status,
                            updated
                        );
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Finality watcher lagged, {} rollup events skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
