//! Aggregator - turns the sequencer's block stream into settled batches
//!
//! Blocks are grouped by `BatchBuilder`. Every closed batch gets its own
//! pipeline: the commitment goes to L1 right away while the proof is produced
//! in parallel, then the proof follows the commitment through the relayer.
//! Pipelines never block ingestion or each other.

pub mod batcher;

pub use batcher::{BatchBuilder, BatchError, BatchPolicy};

use prover::{spawn_proof_job, Prover, ProverError};
use relayer::{RelayError, Relayer, RetryPolicy};
use rollup_types::{Batch, BatchId, Block, BlockRef, FinalityStatus, Proof};
use std::{
    collections::BTreeMap,
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    task::JoinHandle,
};

#[derive(Clone, Debug)]
pub struct AggregatorConfig {
    pub policy: BatchPolicy,
    /// Closed batches not yet Verified, Rejected or Invalid
    pub max_outstanding_batches: usize,
    /// Deadline for one proving attempt
    pub proof_timeout_ms: u64,
    /// Attempts and backoff for infrastructure failures of the prover
    pub proof_retry: RetryPolicy,
    pub tick_ms: u64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            policy: BatchPolicy::default(),
            max_outstanding_batches: 8,
            proof_timeout_ms: 30_000,
            proof_retry: RetryPolicy {
                max_attempts: 3,
                initial_backoff_ms: 200,
                max_backoff_ms: 5_000,
            },
            tick_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    /// Closed, commitment and proof in flight
    Closed,
    /// On L1, proof still in flight
    Committed,
    Stalled,
    Verified,
    Rejected,
    Invalid,
}

impl BatchState {
    /// No further work will happen for the batch
    pub fn is_resolved(self) -> bool {
        matches!(self, Self::Verified | Self::Rejected | Self::Invalid)
    }
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregatorEvent {
    BatchClosed {
        batch_id: BatchId,
        first_height: u64,
        last_height: u64,
    },
    BatchCommitted { batch_id: BatchId },
    BatchVerified { batch_id: BatchId },
    BatchRejected { batch_id: BatchId },
    BatchStalled { batch_id: BatchId, reason: String },
    BatchInvalid { batch_id: BatchId, reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregatorStatus {
    pub outstanding: usize,
    pub stalled: Vec<BatchId>,
    pub unbatched_blocks: usize,
    pub next_batch_id: BatchId,
    pub last_ingested: u64,
}

enum Command {
    RetryStalled {
        batch_id: BatchId,
        reply: oneshot::Sender<Result<(), BatchError>>,
    },
    Status {
        reply: oneshot::Sender<AggregatorStatus>,
    },
    State {
        batch_id: BatchId,
        reply: oneshot::Sender<Option<BatchState>>,
    },
}

/// Outcome reported by a pipeline task, tagged with the attempt it belongs to
struct StageReport {
    batch_id: BatchId,
    attempt: u32,
    stage: Stage,
}

enum Stage {
    Committed,
    CommitFailed(String),
    Finalized(FinalityStatus),
    ProofFailed(ProverError),
    VerifyFailed(String),
}

struct Tracked {
    batch: Arc<Batch>,
    state: BatchState,
    attempt: u32,
    tasks: Vec<JoinHandle<()>>,
}

/// Cheap handle for operators and the RPC layer
#[derive(Clone)]
pub struct AggregatorHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<AggregatorEvent>,
}

impl AggregatorHandle {
    /// Re-drive a stalled batch through commitment and proving
    pub async fn retry_stalled(&self, batch_id: BatchId) -> Result<(), BatchError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::RetryStalled { batch_id, reply })
            .await
            .map_err(|_| BatchError::Stopped)?;
        rx.await.map_err(|_| BatchError::Stopped)?
    }

    pub async fn status(&self) -> Result<AggregatorStatus, BatchError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Status { reply })
            .await
            .map_err(|_| BatchError::Stopped)?;
        rx.await.map_err(|_| BatchError::Stopped)
    }

    pub async fn batch_state(&self, batch_id: BatchId) -> Result<Option<BatchState>, BatchError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::State { batch_id, reply })
            .await
            .map_err(|_| BatchError::Stopped)?;
        rx.await.map_err(|_| BatchError::Stopped)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AggregatorEvent> {
        self.events.subscribe()
    }
}

pub struct Aggregator {
    builder: BatchBuilder,
    batches: BTreeMap<BatchId, Tracked>,
    prover: Arc<dyn Prover>,
    relayer: Arc<Relayer>,
    config: AggregatorConfig,
    events: broadcast::Sender<AggregatorEvent>,
    commands: mpsc::Receiver<Command>,
    reports_tx: mpsc::UnboundedSender<StageReport>,
    reports: mpsc::UnboundedReceiver<StageReport>,
}

impl Aggregator {
    /// Aggregator whose first block must extend `anchor`
    pub fn new(
        config: AggregatorConfig,
        anchor: BlockRef,
        prover: Arc<dyn Prover>,
        relayer: Arc<Relayer>,
    ) -> (Self, AggregatorHandle) {
        let (commands_tx, commands) = mpsc::channel(64);
        let (events, _) = broadcast::channel(256);
        let (reports_tx, reports) = mpsc::unbounded_channel();

        let aggregator = Self {
            builder: BatchBuilder::new(config.policy.clone(), anchor),
            batches: BTreeMap::new(),
            prover,
            relayer,
            config,
            events: events.clone(),
            commands,
            reports_tx,
            reports,
        };
        let handle = AggregatorHandle {
            commands: commands_tx,
            events,
        };
        (aggregator, handle)
    }

    /// Consume blocks until the sequencer's channel closes
    pub async fn run(mut self, mut blocks: mpsc::Receiver<Block>) {
        tracing::info!(
            "Aggregator started (max {} blocks / {}ms per batch, {} outstanding)",
            self.config.policy.max_blocks_per_batch,
            self.config.policy.max_batch_wait_ms,
            self.config.max_outstanding_batches
        );
        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.tick_ms.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                block = blocks.recv() => match block {
                    Some(block) => self.ingest(block),
                    None => break,
                },
                Some(report) = self.reports.recv() => self.apply(report),
                Some(command) = self.commands.recv() => self.handle(command),
                _ = ticker.tick() => {}
            }
            self.close_ready(Instant::now());
        }

        // Let in-flight pipelines finish once the sequencer is gone
        while self.outstanding_in_flight() > 0 {
            tokio::select! {
                Some(report) = self.reports.recv() => self.apply(report),
                Some(command) = self.commands.recv() => self.handle(command),
                else => break,
            }
        }
        tracing::info!("Aggregator stopped");
    }

    fn ingest(&mut self, block: Block) {
        let height = block.height;
        if let Err(e) = self.builder.ingest(block, Instant::now()) {
            tracing::error!("Dropping block {}: {}", height, e);
        }
    }

    fn outstanding(&self) -> usize {
        self.batches
            .values()
            .filter(|t| !t.state.is_resolved())
            .count()
    }

    fn outstanding_in_flight(&self) -> usize {
        self.batches
            .values()
            .filter(|t| matches!(t.state, BatchState::Closed | BatchState::Committed))
            .count()
    }

    fn close_ready(&mut self, now: Instant) {
        while self.builder.should_close(now) {
            if self.outstanding() >= self.config.max_outstanding_batches {
                tracing::debug!(
                    "Outstanding cap reached, {} blocks unbatched",
                    self.builder.unbatched()
                );
                return;
            }
            let Some(batch) = self.builder.close() else {
                return;
            };
            let batch = Arc::new(batch);
            let first_height = batch.first_height().unwrap_or_default();
            let last_height = batch.last_height().unwrap_or_default();
            tracing::info!(
                "Closed batch {} (blocks {}..={}, {} txs)",
                batch.id,
                first_height,
                last_height,
                batch.tx_count()
            );
            let _ = self.events.send(AggregatorEvent::BatchClosed {
                batch_id: batch.id,
                first_height,
                last_height,
            });

            let mut tracked = Tracked {
                batch,
                state: BatchState::Closed,
                attempt: 0,
                tasks: Vec::new(),
            };
            self.start_pipeline(&mut tracked);
            self.batches.insert(tracked.batch.id, tracked);
        }
    }

    fn start_pipeline(&self, tracked: &mut Tracked) {
        for task in tracked.tasks.drain(..) {
            task.abort();
        }
        tracked.attempt += 1;
        tracked.state = BatchState::Closed;

        let batch_id = tracked.batch.id;
        let attempt = tracked.attempt;
        self.relayer.lanes().reopen(batch_id);

        let relayer = self.relayer.clone();
        let batch = tracked.batch.clone();
        let reports = self.reports_tx.clone();
        let commit_task = tokio::spawn(async move {
            let stage = match relayer.relay_commitment(batch).await {
                Ok(_) => Stage::Committed,
                Err(e) => Stage::CommitFailed(e.to_string()),
            };
            let _ = reports.send(StageReport {
                batch_id,
                attempt,
                stage,
            });
        });

        let relayer = self.relayer.clone();
        let prover = self.prover.clone();
        let batch = tracked.batch.clone();
        let reports = self.reports_tx.clone();
        let timeout = Duration::from_millis(self.config.proof_timeout_ms);
        let retry = self.config.proof_retry.clone();
        let proof_task = tokio::spawn(async move {
            let stage = match prove_with_retry(prover, batch, timeout, &retry).await {
                Err(e) => Stage::ProofFailed(e),
                Ok(proof) => match relayer.relay_proof(batch_id, proof).await {
                    Ok(outcome) => Stage::Finalized(outcome.status),
                    Err(e) => Stage::VerifyFailed(describe(&e)),
                },
            };
            let _ = reports.send(StageReport {
                batch_id,
                attempt,
                stage,
            });
        });

        tracked.tasks = vec![commit_task, proof_task];
    }

    fn apply(&mut self, report: StageReport) {
        let Some(tracked) = self.batches.get_mut(&report.batch_id) else {
            return;
        };
        let batch_id = report.batch_id;
        if tracked.state.is_resolved() {
            // A late sibling task may have recreated the lane
            self.relayer.lanes().close(batch_id);
            return;
        }
        if report.attempt != tracked.attempt {
            return;
        }

        let event = match report.stage {
            Stage::Committed => {
                if tracked.state != BatchState::Closed {
                    return;
                }
                tracked.state = BatchState::Committed;
                tracing::info!("Batch {} committed on L1", batch_id);
                AggregatorEvent::BatchCommitted { batch_id }
            }
            Stage::Finalized(FinalityStatus::Verified) => {
                tracked.state = BatchState::Verified;
                tracing::info!("Batch {} verified", batch_id);
                AggregatorEvent::BatchVerified { batch_id }
            }
            Stage::Finalized(status) => {
                tracked.state = BatchState::Rejected;
                tracing::error!("ALERT: batch {} finalized as {:?}", batch_id, status);
                AggregatorEvent::BatchRejected { batch_id }
            }
            Stage::ProofFailed(ProverError::InvalidBatch { reason, .. }) => {
                tracked.state = BatchState::Invalid;
                tracing::error!("ALERT: batch {} is invalid: {}", batch_id, reason);
                AggregatorEvent::BatchInvalid { batch_id, reason }
            }
            // The first failure of an attempt stalls it; the sibling task's
            // failure is the same incident
            _ if tracked.state == BatchState::Stalled => return,
            Stage::ProofFailed(e) => stall(tracked, e.to_string()),
            Stage::CommitFailed(reason) | Stage::VerifyFailed(reason) => stall(tracked, reason),
        };
        if tracked.state.is_resolved() {
            self.relayer.lanes().close(batch_id);
        }
        let _ = self.events.send(event);
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::RetryStalled { batch_id, reply } => {
                let result = self.retry_stalled(batch_id);
                let _ = reply.send(result);
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Command::State { batch_id, reply } => {
                let _ = reply.send(self.batches.get(&batch_id).map(|t| t.state));
            }
        }
    }

    fn retry_stalled(&mut self, batch_id: BatchId) -> Result<(), BatchError> {
        let mut tracked = self
            .batches
            .remove(&batch_id)
            .ok_or(BatchError::UnknownBatch(batch_id))?;
        if tracked.state != BatchState::Stalled {
            let state = tracked.state.to_string();
            self.batches.insert(batch_id, tracked);
            return Err(BatchError::NotStalled { batch_id, state });
        }

        tracing::info!("Retrying stalled batch {}", batch_id);
        self.start_pipeline(&mut tracked);
        self.batches.insert(batch_id, tracked);
        Ok(())
    }

    fn status(&self) -> AggregatorStatus {
        AggregatorStatus {
            outstanding: self.outstanding(),
            stalled: self
                .batches
                .iter()
                .filter(|(_, t)| t.state == BatchState::Stalled)
                .map(|(id, _)| *id)
                .collect(),
            unbatched_blocks: self.builder.unbatched(),
            next_batch_id: self.builder.next_id(),
            last_ingested: self.builder.tip().height,
        }
    }
}

impl Drop for Aggregator {
    fn drop(&mut self) {
        for (batch_id, tracked) in self.batches.iter_mut() {
            for task in tracked.tasks.drain(..) {
                task.abort();
            }
            self.relayer.lanes().close(*batch_id);
        }
    }
}

fn stall(tracked: &mut Tracked, reason: String) -> AggregatorEvent {
    tracked.state = BatchState::Stalled;
    tracing::error!("ALERT: batch {} stalled: {}", tracked.batch.id, reason);
    AggregatorEvent::BatchStalled {
        batch_id: tracked.batch.id,
        reason,
    }
}

fn describe(e: &RelayError) -> String {
    if e.is_transport() {
        format!("L1 unreachable: {}", e)
    } else {
        e.to_string()
    }
}

/// Prove `batch`, retrying infrastructure failures and attempt timeouts
async fn prove_with_retry(
    prover: Arc<dyn Prover>,
    batch: Arc<Batch>,
    timeout: Duration,
    retry: &RetryPolicy,
) -> Result<Proof, ProverError> {
    let max_attempts = retry.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let mut job = spawn_proof_job(prover.clone(), batch.clone());
        let error = match tokio::time::timeout(timeout, &mut job).await {
            Ok(Ok(proof)) => return Ok(proof),
            Ok(Err(e)) if !e.is_retryable() => return Err(e),
            Ok(Err(e)) => e,
            Err(_) => {
                job.cancel();
                ProverError::Infrastructure(format!("proving timed out after {:?}", timeout))
            }
        };

        if attempt >= max_attempts {
            return Err(error);
        }
        let delay = retry.backoff(attempt);
        tracing::warn!(
            "Proof attempt {}/{} for batch {} failed: {} (retrying in {:?})",
            attempt,
            max_attempts,
            batch.id,
            error,
            delay
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
