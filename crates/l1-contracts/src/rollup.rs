//! L1 Rollup Contract
//!
//! Anchors L2 batches on L1. Per batch id the finality record moves
//! Uncommitted -> Committed -> Verified | Rejected and never back. Committing a
//! batch also indexes its transactions and withdrawal leaves so the bridge can
//! gate releases on finality.
//!
//! The contract also runs the force-inclusion registry: a transaction
//! registered here must show up in a committed L2 block by its deadline or the
//! rollup switches to its censorship fallback.

use rollup_types::{
    Batch, BatchId, CensorshipTimeout, Commitment, FinalityStatus, ForceTxEntry, ForceTxStatus,
    Hash32, MalformedTxError, Origin, Proof, Transaction, TxHash, WithdrawalLeaf,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

/// Default force-inclusion window in L2 blocks
pub const DEFAULT_FORCE_INCLUSION_WINDOW: u64 = 64;

/// Default bound on how far an anchored L2 head may run past committed heights
pub const DEFAULT_MAX_HEAD_LEAD: u64 = 1_024;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RollupError {
    #[error("batch {0} has no commitment")]
    NoCommitment(BatchId),

    #[error("batch {batch_id} is already {status:?}")]
    AlreadyFinalized {
        batch_id: BatchId,
        status: FinalityStatus,
    },

    #[error("proof for batch {got} submitted against batch {expected}")]
    ProofBatchMismatch { expected: BatchId, got: BatchId },

    #[error("batch {batch_id} already committed with digest {digest}")]
    DuplicateCommitment { batch_id: BatchId, digest: Hash32 },

    #[error("batch {0} has no blocks")]
    EmptyBatch(BatchId),

    #[error("batch {batch_id} overlaps committed heights {first}..={last}")]
    OverlappingBatch {
        batch_id: BatchId,
        first: u64,
        last: u64,
    },

    #[error("invalid force transaction: {0}")]
    InvalidForceTx(#[from] MalformedTxError),

    #[error("force transaction {0} already registered")]
    DuplicateForceTx(TxHash),

    #[error("unknown force transaction {0}")]
    UnknownForceTx(TxHash),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RollupMode {
    Normal,
    /// A force transaction missed its deadline; the escape hatch is open
    Censored,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FallbackEvent {
    CensorshipTimeout {
        tx_ref: TxHash,
        deadline: u64,
        observed_height: u64,
    },
}

#[derive(Clone, Debug)]
pub struct RollupConfig {
    /// L2 blocks a force tx has to land in, counted from the L2 head it was
    /// anchored at (the contiguous committed height until then)
    pub force_inclusion_window: u64,
    /// Anchors further than this past the contiguous committed height are
    /// clamped
    pub max_head_lead: u64,
}

impl Default for RollupConfig {
    fn default() -> Self {
        Self {
            force_inclusion_window: DEFAULT_FORCE_INCLUSION_WINDOW,
            max_head_lead: DEFAULT_MAX_HEAD_LEAD,
        }
    }
}

/// Finality record of one batch id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalityRecord {
    pub batch_id: BatchId,
    pub status: FinalityStatus,
    pub commitment: Option<Commitment>,
}

#[derive(Debug, Clone)]
struct BatchRecord {
    commitment: Commitment,
    status: FinalityStatus,
    tx_refs: Vec<TxHash>,
}

#[derive(Debug, Clone)]
struct ForceRecord {
    entry: ForceTxEntry,
    status: ForceTxStatus,
    anchored: bool,
}

/// Outcome of a successful verification call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyOutcome {
    pub batch_id: BatchId,
    pub status: FinalityStatus,
    /// Transactions of the batch, for receipt bookkeeping
    pub tx_refs: Vec<TxHash>,
}

pub struct RollupContract {
    config: RollupConfig,
    records: BTreeMap<BatchId, BatchRecord>,
    /// tx hash -> (batch id, block height)
    tx_index: HashMap<TxHash, (BatchId, u64)>,
    withdrawals: HashMap<TxHash, (BatchId, WithdrawalLeaf)>,
    /// Committed height ranges, first -> last
    ranges: BTreeMap<u64, u64>,
    contiguous_height: u64,
    force: HashMap<TxHash, ForceRecord>,
    mode: RollupMode,
    fallback_events: Vec<FallbackEvent>,
}

impl RollupContract {
    pub fn new(config: RollupConfig) -> Self {
        Self {
            config,
            records: BTreeMap::new(),
            tx_index: HashMap::new(),
            withdrawals: HashMap::new(),
            ranges: BTreeMap::new(),
            contiguous_height: 0,
            force: HashMap::new(),
            mode: RollupMode::Normal,
            fallback_events: Vec::new(),
        }
    }

    /// Write-once commitment of a batch
    pub fn commit(&mut self, batch: &Batch) -> Result<Commitment, RollupError> {
        if let Some(existing) = self.records.get(&batch.id) {
            return Err(RollupError::DuplicateCommitment {
                batch_id: batch.id,
                digest: existing.commitment.digest,
            });
        }
        let (Some(first_height), Some(last_height)) = (batch.first_height(), batch.last_height())
        else {
            return Err(RollupError::EmptyBatch(batch.id));
        };
        if let Some((&first, &last)) = self
            .ranges
            .range(..=last_height)
            .next_back()
            .filter(|&(_, &last)| last >= first_height)
        {
            return Err(RollupError::OverlappingBatch {
                batch_id: batch.id,
                first,
                last,
            });
        }

        let commitment = Commitment {
            batch_id: batch.id,
            digest: batch.digest(),
            first_height,
            last_height,
        };

        let tx_index = batch.tx_index();
        for (tx_ref, height) in &tx_index {
            self.tx_index.insert(*tx_ref, (batch.id, *height));
        }
        for leaf in batch.withdrawals() {
            self.withdrawals.insert(leaf.tx_ref, (batch.id, leaf));
        }
        self.records.insert(
            batch.id,
            BatchRecord {
                commitment,
                status: FinalityStatus::Committed,
                tx_refs: tx_index.iter().map(|(tx_ref, _)| *tx_ref).collect(),
            },
        );

        self.ranges.insert(first_height, last_height);
        while let Some(&last) = self.ranges.get(&(self.contiguous_height + 1)) {
            self.contiguous_height = last;
        }

        tracing::info!(
            "Committed batch {} (heights {}..={}, digest {})",
            batch.id,
            first_height,
            last_height,
            commitment.digest
        );

        for (tx_ref, height) in tx_index {
            self.settle_force_inclusion(tx_ref, height);
        }
        self.expire_force_entries();

        Ok(commitment)
    }

    /// Check a proof against the stored commitment
    pub fn verify(&mut self, batch_id: BatchId, proof: &Proof) -> Result<VerifyOutcome, RollupError> {
        let record = self
            .records
            .get_mut(&batch_id)
            .ok_or(RollupError::NoCommitment(batch_id))?;
        if record.status.is_final() {
            return Err(RollupError::AlreadyFinalized {
                batch_id,
                status: record.status,
            });
        }
        if proof.batch_id != batch_id {
            return Err(RollupError::ProofBatchMismatch {
                expected: batch_id,
                got: proof.batch_id,
            });
        }

        let next = if proof.certifies(&record.commitment) {
            FinalityStatus::Verified
        } else {
            FinalityStatus::Rejected
        };
        debug_assert!(record.status.can_transition_to(next));
        record.status = next;

        match next {
            FinalityStatus::Verified => tracing::info!("Batch {} verified", batch_id),
            _ => tracing::warn!("Batch {} rejected: certificate does not match", batch_id),
        }

        Ok(VerifyOutcome {
            batch_id,
            status: next,
            tx_refs: record.tx_refs.clone(),
        })
    }

    /// Register a force transaction from an L1 user
    pub fn register_force_tx(&mut self, mut tx: Transaction) -> Result<ForceTxEntry, RollupError> {
        tx.validate()?;
        if tx.from.is_contract() {
            return Err(MalformedTxError::UnauthorizedSender(tx.from).into());
        }
        tx.origin = Origin::L1;

        let tx_ref = tx.hash();
        if self.force.contains_key(&tx_ref) {
            return Err(RollupError::DuplicateForceTx(tx_ref));
        }

        let entry = ForceTxEntry {
            tx,
            deadline: self.contiguous_height + self.config.force_inclusion_window,
        };
        self.force.insert(
            tx_ref,
            ForceRecord {
                entry: entry.clone(),
                status: ForceTxStatus::Pending,
                anchored: false,
            },
        );
        tracing::info!(
            "Registered force transaction {} (deadline {})",
            tx_ref,
            entry.deadline
        );

        if let Some(&(_, height)) = self.tx_index.get(&tx_ref) {
            self.settle_force_inclusion(tx_ref, height);
        }
        Ok(entry)
    }

    /// Re-base the deadline of a pending force transaction on the L2 head it
    /// was handed to. The sequencer may run ahead of committed heights, so the
    /// registration deadline alone could expire before any block sees the tx.
    /// Anchoring happens once and never moves a deadline earlier.
    pub fn anchor_force_tx(&mut self, tx_ref: TxHash, l2_head: u64) -> Result<ForceTxEntry, RollupError> {
        let contiguous = self.contiguous_height;
        let window = self.config.force_inclusion_window;
        let max_lead = self.config.max_head_lead;
        let record = self
            .force
            .get_mut(&tx_ref)
            .ok_or(RollupError::UnknownForceTx(tx_ref))?;
        if record.anchored || record.status != ForceTxStatus::Pending {
            return Ok(record.entry.clone());
        }

        let head = l2_head.clamp(contiguous, contiguous.saturating_add(max_lead));
        if head < l2_head {
            tracing::warn!(
                target: "censorship",
                "Anchor for force tx {} clamped from L2 height {} to {}",
                tx_ref,
                l2_head,
                head
            );
        }
        record.entry.deadline = record.entry.deadline.max(head + window);
        record.anchored = true;
        tracing::debug!(
            "Anchored force transaction {} at L2 height {} (deadline {})",
            tx_ref,
            head,
            record.entry.deadline
        );
        Ok(record.entry.clone())
    }

    /// Sequencer report that a force transaction expired unincluded.
    /// Returns whether the report changed anything.
    pub fn report_censorship(&mut self, report: &CensorshipTimeout) -> Result<bool, RollupError> {
        let record = self
            .force
            .get(&report.tx_ref)
            .ok_or(RollupError::UnknownForceTx(report.tx_ref))?;
        if record.status != ForceTxStatus::Pending {
            return Ok(false);
        }
        let deadline = record.entry.deadline;
        self.censor(report.tx_ref, deadline, report.observed_height);
        Ok(true)
    }

    fn settle_force_inclusion(&mut self, tx_ref: TxHash, height: u64) {
        let Some(record) = self.force.get_mut(&tx_ref) else {
            return;
        };
        if record.status != ForceTxStatus::Pending {
            return;
        }
        if height <= record.entry.deadline {
            record.status = ForceTxStatus::Included { height };
            tracing::debug!("Force transaction {} included at height {}", tx_ref, height);
        } else {
            let deadline = record.entry.deadline;
            self.censor(tx_ref, deadline, height);
        }
    }

    /// Every height up to the contiguous committed height is known, so a
    /// pending entry whose deadline is at or below it was never included in time
    fn expire_force_entries(&mut self) {
        let contiguous = self.contiguous_height;
        let expired: Vec<(TxHash, u64)> = self
            .force
            .iter()
            .filter(|(_, r)| r.status == ForceTxStatus::Pending && r.entry.deadline <= contiguous)
            .map(|(tx_ref, r)| (*tx_ref, r.entry.deadline))
            .collect();
        for (tx_ref, deadline) in expired {
            self.censor(tx_ref, deadline, contiguous);
        }
    }

    fn censor(&mut self, tx_ref: TxHash, deadline: u64, observed_height: u64) {
        if let Some(record) = self.force.get_mut(&tx_ref) {
            record.status = ForceTxStatus::Censored;
        }
        if self.mode != RollupMode::Censored {
            tracing::error!(
                target: "censorship",
                "Rollup entering censorship fallback: force tx {} missed deadline {}",
                tx_ref,
                deadline
            );
        }
        self.mode = RollupMode::Censored;
        self.fallback_events.push(FallbackEvent::CensorshipTimeout {
            tx_ref,
            deadline,
            observed_height,
        });
    }

    pub fn finality_status(&self, batch_id: BatchId) -> FinalityStatus {
        self.records
            .get(&batch_id)
            .map(|r| r.status)
            .unwrap_or(FinalityStatus::Uncommitted)
    }

    pub fn finality_record(&self, batch_id: BatchId) -> FinalityRecord {
        match self.records.get(&batch_id) {
            Some(record) => FinalityRecord {
                batch_id,
                status: record.status,
                commitment: Some(record.commitment),
            },
            None => FinalityRecord {
                batch_id,
                status: FinalityStatus::Uncommitted,
                commitment: None,
            },
        }
    }

    pub fn commitment(&self, batch_id: BatchId) -> Option<Commitment> {
        self.records.get(&batch_id).map(|r| r.commitment)
    }

    /// Withdrawal leaf of `tx_ref` and the finality of its batch
    pub fn withdrawal(&self, tx_ref: &TxHash) -> Option<(WithdrawalLeaf, FinalityStatus)> {
        self.withdrawals
            .get(tx_ref)
            .map(|(batch_id, leaf)| (leaf.clone(), self.finality_status(*batch_id)))
    }

    /// Batch id and block height of a committed transaction
    pub fn tx_location(&self, tx_ref: &TxHash) -> Option<(BatchId, u64)> {
        self.tx_index.get(tx_ref).copied()
    }

    pub fn force_status(&self, tx_ref: &TxHash) -> Option<ForceTxStatus> {
        self.force.get(tx_ref).map(|r| r.status)
    }

    pub fn contiguous_height(&self) -> u64 {
        self.contiguous_height
    }

    pub fn mode(&self) -> RollupMode {
        self.mode
    }

    pub fn fallback_events(&self) -> &[FallbackEvent] {
        &self.fallback_events
    }
}
