//! Relayer - moves messages between L2 and the L1 contracts
//!
//! - Batches: commitment first, then the proof, per batch id in order
//! - Deposits: L1 bridge records become L1-origin mint transactions on L2
//! - Force transactions: L1 registrations enter the L2 force pool
//! - Censorship: sequencer expiry reports go to the L1 rollup fallback
//!
//! L1 transport failures are retried with jittered backoff; contract errors
//! are returned as they are.

pub mod lane;
pub mod retry;

pub use lane::{Lane, LaneStatus, Lanes};
pub use retry::{retry_transport, RetryError, RetryPolicy};

use l1_contracts::{
    BridgeHandle, BridgeOutbox, L1Error, RollupError, RollupHandle, RollupOutbox, VerifyOutcome,
};
use l2_runtime::{ReceiptHandle, SequencerError, TxSubmitter};
use rollup_types::{
    Batch, BatchId, BridgeRecord, CensorshipTimeout, Commitment, ForceTxEntry, Proof, Transaction,
};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};

#[derive(Debug, Error)]
pub enum RelayError {
    /// The contract refused the call
    #[error("L1 rejected the call: {0}")]
    Rejected(L1Error),

    #[error("L1 unreachable after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: L1Error },

    #[error("no commitment for batch {0} within the wait bound")]
    CommitTimeout(BatchId),

    #[error("commitment for batch {0} failed")]
    CommitFailed(BatchId),

    #[error("L2 submission failed: {0}")]
    Sequencer(#[from] SequencerError),
}

impl From<RetryError> for RelayError {
    fn from(e: RetryError) -> Self {
        match e {
            RetryError::Rejected(e) => Self::Rejected(e),
            RetryError::Exhausted { attempts, last } => Self::Exhausted { attempts, last },
        }
    }
}

impl RelayError {
    /// Whether this is an infrastructure failure rather than a protocol one
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Exhausted { .. } | Self::CommitTimeout(_) | Self::CommitFailed(_)
        )
    }
}

#[derive(Clone, Debug)]
pub struct RelayerConfig {
    pub retry: RetryPolicy,
    /// How long a proof relay waits for its batch's commitment
    pub commit_wait_ms: u64,
}

impl Default for RelayerConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            commit_wait_ms: 10_000,
        }
    }
}

pub struct Relayer {
    rollup: RollupHandle,
    bridge: BridgeHandle,
    submitter: TxSubmitter,
    lanes: Lanes,
    config: RelayerConfig,
}

impl Relayer {
    pub fn new(
        rollup: RollupHandle,
        bridge: BridgeHandle,
        submitter: TxSubmitter,
        config: RelayerConfig,
    ) -> Self {
        Self {
            rollup,
            bridge,
            submitter,
            lanes: Lanes::default(),
            config,
        }
    }

    /// Commit a closed batch on L1
    pub async fn relay_commitment(&self, batch: Arc<Batch>) -> Result<Commitment, RelayError> {
        let lane = self.lanes.get(batch.id);
        let _gate = lane.gate.lock().await;
        match lane.status() {
            LaneStatus::Committed(commitment) => return Ok(commitment),
            LaneStatus::CommitFailed => lane.set(LaneStatus::Pending),
            LaneStatus::Pending => {}
        }

        let what = format!("commit batch {}", batch.id);
        let result = retry_transport(&self.config.retry, &what, || {
            self.rollup.commit(batch.clone())
        })
        .await;

        let commitment = match result {
            Ok(commitment) => commitment,
            // A retried commit may have landed before its reply was lost
            Err(RetryError::Rejected(L1Error::Rollup(RollupError::DuplicateCommitment {
                batch_id,
                digest,
            }))) if digest == batch.digest() => {
                tracing::debug!("Batch {} already committed with matching digest", batch_id);
                Commitment {
                    batch_id,
                    digest,
                    first_height: batch.first_height().unwrap_or_default(),
                    last_height: batch.last_height().unwrap_or_default(),
                }
            }
            Err(e) => {
                lane.set(LaneStatus::CommitFailed);
                return Err(e.into());
            }
        };

        lane.set(LaneStatus::Committed(commitment));
        Ok(commitment)
    }

    /// Submit a proof once the batch's commitment is on L1
    pub async fn relay_proof(&self, batch_id: BatchId, proof: Proof) -> Result<VerifyOutcome, RelayError> {
        let lane = self.lanes.get(batch_id);
        let mut status = lane.watch();
        let wait = Duration::from_millis(self.config.commit_wait_ms);

        let committed = tokio::time::timeout(
            wait,
            status.wait_for(|s| !matches!(s, LaneStatus::Pending)),
        )
        .await
        .map(|seen| seen.map(|s| matches!(*s, LaneStatus::Committed(_))));
        match committed {
            Ok(Ok(true)) => {}
            Ok(_) => return Err(RelayError::CommitFailed(batch_id)),
            Err(_) => return Err(RelayError::CommitTimeout(batch_id)),
        }

        let _gate = lane.gate.lock().await;
        let what = format!("verify batch {}", batch_id);
        let result = retry_transport(&self.config.retry, &what, || {
            self.rollup.verify(batch_id, proof.clone())
        })
        .await;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(RetryError::Rejected(L1Error::Rollup(RollupError::AlreadyFinalized {
                batch_id,
                status,
            }))) => VerifyOutcome {
                batch_id,
                status,
                tx_refs: Vec::new(),
            },
            Err(e) => return Err(e.into()),
        };

        self.lanes.close(batch_id);
        Ok(outcome)
    }

    /// Turn a locked L1 deposit into an L2 mint. A full or failing mempool is
    /// retried with backoff; if it never clears the record is marked
    /// `RelayFailed` on L1 and can be relayed again later.
    pub async fn relay_bridge_deposit(&self, record: BridgeRecord) -> Result<ReceiptHandle, RelayError> {
        let handle = match self.hand_off_deposit(&record).await {
            Ok(handle) => handle,
            Err(e) => {
                let what = format!("mark deposit {} relay failed", record.id);
                if let Err(mark) = retry_transport(&self.config.retry, &what, || {
                    self.bridge.mark_relay_failed(record.id)
                })
                .await
                {
                    tracing::warn!("Deposit {} not marked failed: {:?}", record.id, mark);
                }
                return Err(e.into());
            }
        };

        let what = format!("mark deposit {} relayed", record.id);
        if let Err(e) = retry_transport(&self.config.retry, &what, || {
            self.bridge.mark_relayed(record.id)
        })
        .await
        {
            tracing::warn!("Deposit {} minted but not marked relayed: {:?}", record.id, e);
        }

        tracing::debug!("Relayed deposit {} as L2 tx {}", record.id, handle.tx_hash());
        Ok(handle)
    }

    async fn hand_off_deposit(&self, record: &BridgeRecord) -> Result<ReceiptHandle, SequencerError> {
        let max_attempts = self.config.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.submitter.submit_l1_message(record.mint_transaction()) {
                Ok(handle) => return Ok(handle),
                Err(e) if !e.is_transient() || attempt >= max_attempts => {
                    tracing::error!(
                        "Deposit {} hand-off failed after {} attempts: {}",
                        record.id,
                        attempt,
                        e
                    );
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.config.retry.backoff(attempt);
                    tracing::warn!(
                        "Deposit {} hand-off attempt {}/{} failed: {} (retrying in {:?})",
                        record.id,
                        attempt,
                        max_attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Hand an L1-registered force transaction to the sequencer. The deadline
    /// is first anchored on L1 against the current L2 head, so the sequencer
    /// always gets the full window of new blocks to include it.
    pub async fn relay_force_tx(&self, tx: Transaction, deadline: u64) -> Result<ReceiptHandle, RelayError> {
        let tx_ref = tx.hash();
        let l2_head = self.submitter.head_height();
        let what = format!("anchor force tx {}", tx_ref);
        let deadline = match retry_transport(&self.config.retry, &what, || {
            self.rollup.anchor_force_tx(tx_ref, l2_head)
        })
        .await
        {
            Ok(anchored) => anchored.deadline,
            Err(RetryError::Exhausted { .. }) => {
                tracing::warn!(
                    target: "censorship",
                    "Force tx {} relayed unanchored (deadline {})",
                    tx_ref,
                    deadline
                );
                deadline
            }
            Err(e) => return Err(e.into()),
        };

        let handle = self.submitter.submit_force(ForceTxEntry { tx, deadline })?;
        tracing::debug!(
            "Relayed force tx {} (L2 head {}, deadline {})",
            tx_ref,
            l2_head,
            deadline
        );
        Ok(handle)
    }

    /// Forward a sequencer expiry report to the rollup fallback
    pub async fn relay_censorship_timeout(&self, report: CensorshipTimeout) -> Result<bool, RelayError> {
        tracing::warn!(
            target: "censorship",
            "Reporting missed force deadline for {} (deadline {}, height {})",
            report.tx_ref,
            report.deadline,
            report.observed_height
        );
        let what = format!("report censorship of {}", report.tx_ref);
        Ok(retry_transport(&self.config.retry, &what, || {
            self.rollup.report_censorship(report.clone())
        })
        .await?)
    }

    pub fn lanes(&self) -> &Lanes {
        &self.lanes
    }

    /// Drain the L1 outboxes and the sequencer's censorship reports
    pub fn spawn_listeners(
        self: &Arc<Self>,
        rollup_outbox: RollupOutbox,
        bridge_outbox: BridgeOutbox,
        mut censorship: mpsc::UnboundedReceiver<CensorshipTimeout>,
    ) -> Vec<JoinHandle<()>> {
        let RollupOutbox { mut force_txs } = rollup_outbox;
        let BridgeOutbox { mut deposits } = bridge_outbox;

        let relayer = self.clone();
        let deposit_task = tokio::spawn(async move {
            while let Some(record) = deposits.recv().await {
                if let Err(e) = relayer.relay_bridge_deposit(record.clone()).await {
                    tracing::error!("Failed to relay deposit {}: {}", record.id, e);
                }
            }
            tracing::debug!("Deposit listener stopped");
        });

        let relayer = self.clone();
        let force_task = tokio::spawn(async move {
            while let Some(entry) = force_txs.recv().await {
                let tx_ref = entry.hash();
                if let Err(e) = relayer.relay_force_tx(entry.tx, entry.deadline).await {
                    tracing::error!("Failed to relay force tx {}: {}", tx_ref, e);
                }
            }
            tracing::debug!("Force tx listener stopped");
        });

        let relayer = self.clone();
        let censorship_task = tokio::spawn(async move {
            while let Some(report) = censorship.recv().await {
                let tx_ref = report.tx_ref;
                if let Err(e) = relayer.relay_censorship_timeout(report).await {
                    tracing::error!(target: "censorship", "Failed to report {}: {}", tx_ref, e);
                }
            }
            tracing::debug!("Censorship listener stopped");
        });

        vec![deposit_task, force_task, censorship_task]
    }
}

#[cfg(test)]
mod tests;
