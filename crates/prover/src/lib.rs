//! Prover - validity proofs for closed batches
//!
//! A proof request runs as its own tokio task so the caller can await it with a
//! deadline, or cancel it, without blocking anything else:
//! - `Prover`: the proving backend seam
//! - `ProofJob`: awaitable, cancelable handle on one request
//! - `StubProver`: deterministic backend used by the node and tests

pub mod stub;

pub use stub::{StubProver, StubProverConfig};

use async_trait::async_trait;
use rollup_types::{Batch, BatchId, Proof};
use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};
use thiserror::Error;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProverError {
    /// Transient backend failure; the same batch may succeed on retry
    #[error("prover infrastructure failure: {0}")]
    Infrastructure(String),

    /// The batch cannot be proven, retrying will not help
    #[error("batch {batch_id} is not provable: {reason}")]
    InvalidBatch { batch_id: BatchId, reason: String },
}

impl ProverError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Infrastructure(_))
    }
}

/// Proving backend
#[async_trait]
pub trait Prover: Send + Sync + 'static {
    /// Produce a proof for `batch`. Must be deterministic in the batch content.
    async fn prove(&self, batch: &Batch) -> Result<Proof, ProverError>;
}

/// Handle on a running proof request
///
/// Awaiting the job yields the prover's result. Dropping the handle aborts the
/// task, so a caller that is itself cancelled leaves no proving work behind.
pub struct ProofJob {
    batch_id: BatchId,
    handle: JoinHandle<Result<Proof, ProverError>>,
}

impl ProofJob {
    pub fn batch_id(&self) -> BatchId {
        self.batch_id
    }

    /// Abort the underlying task
    pub fn cancel(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for ProofJob {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl Future for ProofJob {
    type Output = Result<Proof, ProverError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let batch_id = self.batch_id;
        Pin::new(&mut self.handle).poll(cx).map(|joined| match joined {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(ProverError::Infrastructure(format!(
                "proof job for batch {} cancelled",
                batch_id
            ))),
            Err(e) => Err(ProverError::Infrastructure(format!(
                "proof job for batch {} panicked: {}",
                batch_id, e
            ))),
        })
    }
}

/// Start proving `batch` on a background task
pub fn spawn_proof_job(prover: Arc<dyn Prover>, batch: Arc<Batch>) -> ProofJob {
    let batch_id = batch.id;
    let handle = tokio::spawn(async move {
        tracing::debug!("Proving batch {} ({} blocks)", batch.id, batch.blocks.len());
        prover.prove(&batch).await
    });
    ProofJob { batch_id, handle }
}
