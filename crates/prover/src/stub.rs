//! Deterministic stub prover
//!
//! Checks that a batch describes a provable execution and issues the
//! certificate the L1 rollup contract recomputes on verification.

use crate::{Prover, ProverError};
use async_trait::async_trait;
use rollup_types::{certify, Batch, Proof};
use std::{
    sync::atomic::{AtomicU32, Ordering},
    time::Duration,
};

#[derive(Clone, Debug, Default)]
pub struct StubProverConfig {
    /// Simulated proving time per batch
    pub latency_ms: u64,
    /// Fail this many requests with an infrastructure error before succeeding
    pub transient_failures: u32,
}

pub struct StubProver {
    config: StubProverConfig,
    remaining_failures: AtomicU32,
}

impl StubProver {
    pub fn new(config: StubProverConfig) -> Self {
        Self {
            remaining_failures: AtomicU32::new(config.transient_failures),
            config,
        }
    }

    /// Structural checks a real circuit would enforce
    pub fn check_provable(batch: &Batch) -> Result<(), ProverError> {
        let invalid = |reason: String| ProverError::InvalidBatch {
            batch_id: batch.id,
            reason,
        };

        if batch.blocks.is_empty() {
            return Err(invalid("batch has no blocks".into()));
        }

        for (i, block) in batch.blocks.iter().enumerate() {
            if block.txs.len() != block.results.len() {
                return Err(invalid(format!(
                    "block {} has {} txs but {} results",
                    block.height,
                    block.txs.len(),
                    block.results.len()
                )));
            }
            if block.state_ref.height != block.height {
                return Err(invalid(format!(
                    "block {} references state at height {}",
                    block.height, block.state_ref.height
                )));
            }
            if let Some(prev) = i.checked_sub(1).map(|p| &batch.blocks[p]) {
                if block.height != prev.height + 1 {
                    return Err(invalid(format!(
                        "height gap between {} and {}",
                        prev.height, block.height
                    )));
                }
                if block.parent_ref != prev.hash() {
                    return Err(invalid(format!(
                        "block {} does not link to block {}",
                        block.height, prev.height
                    )));
                }
            }
        }

        Ok(())
    }

    fn take_failure(&self) -> bool {
        self.remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for StubProver {
    fn default() -> Self {
        Self::new(StubProverConfig::default())
    }
}

#[async_trait]
impl Prover for StubProver {
    async fn prove(&self, batch: &Batch) -> Result<Proof, ProverError> {
        if self.config.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.latency_ms)).await;
        }
        if self.take_failure() {
            tracing::debug!("Injected prover failure for batch {}", batch.id);
            return Err(ProverError::Infrastructure(format!(
                "prover unavailable for batch {}",
                batch.id
            )));
        }

        Self::check_provable(batch)?;

        Ok(Proof {
            batch_id: batch.id,
            certificate: certify(batch.id, &batch.digest()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollup_types::{Block, Commitment, Hash32, StateRef};

    fn chain(heights: std::ops::RangeInclusive<u64>) -> Vec<Block> {
        let mut parent = Hash32::ZERO;
        heights
            .map(|height| {
                let block = Block {
                    height,
                    parent_ref: parent,
                    txs: vec![],
                    results: vec![],
                    state_ref: StateRef {
                        height,
                        root: Hash32::ZERO,
                    },
                    timestamp_ms: height,
                };
                parent = block.hash();
                block
            })
            .collect()
    }

    #[tokio::test]
    async fn test_deterministic_proof_verifies() {
        let batch = Batch {
            id: 1,
            blocks: chain(1..=3),
        };
        let prover = StubProver::default();

        let first = prover.prove(&batch).await.unwrap();
        let second = prover.prove(&batch).await.unwrap();
        assert_eq!(first, second);

        let commitment = Commitment {
            batch_id: 1,
            digest: batch.digest(),
            first_height: 1,
            last_height: 3,
        };
        assert!(first.certifies(&commitment));
    }

    #[tokio::test]
    async fn test_rejects_unprovable_batches() {
        let prover = StubProver::default();

        let empty = Batch { id: 2, blocks: vec![] };
        assert!(matches!(
            prover.prove(&empty).await,
            Err(ProverError::InvalidBatch { batch_id: 2, .. })
        ));

        let mut blocks = chain(1..=3);
        blocks.remove(1);
        let gapped = Batch { id: 3, blocks };
        assert!(matches!(
            prover.prove(&gapped).await,
            Err(ProverError::InvalidBatch { batch_id: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_transient_failures_then_success() {
        let prover = StubProver::new(StubProverConfig {
            latency_ms: 0,
            transient_failures: 2,
        });
        let batch = Batch {
            id: 4,
            blocks: chain(5..=5),
        };

        assert!(prover.prove(&batch).await.unwrap_err().is_retryable());
        assert!(prover.prove(&batch).await.unwrap_err().is_retryable());
        assert!(prover.prove(&batch).await.is_ok());
    }
}
