//! Relayer Integration Tests
//!
//! Runs the relayer against live L1 actors and an in-memory sequencer:
//! - Commit-before-verify ordering per batch lane
//! - Transport retries and duplicate-commit handling
//! - Deposit, force-tx and censorship relays through the listeners
//! - Recovery after failed commits and full mempools

use std::{sync::Arc, time::Duration};

use l1_contracts::{
    spawn_bridge, spawn_rollup, BridgeHandle, RollupConfig, RollupHandle, RollupMode,
};
use l2_runtime::{LedgerState, MempoolError, Sequencer, SequencerConfig, SequencerError};
use rollup_types::{
    certify, Address, Batch, BatchId, Block, BridgeRecordStatus, CensorshipTimeout,
    FinalityStatus, ForceTxStatus, Hash32, Proof, ReceiptStatus, StateRef, Transaction,
};
use tokio::sync::mpsc;

use crate::{LaneStatus, RelayError, Relayer, RelayerConfig, RetryPolicy};

fn config() -> RelayerConfig {
    RelayerConfig {
        retry: RetryPolicy {
            max_attempts: 4,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
        },
        commit_wait_ms: 500,
    }
}

fn batch(id: BatchId, height: u64) -> Arc<Batch> {
    Arc::new(Batch {
        id,
        blocks: vec![Block {
            height,
            parent_ref: Hash32::ZERO,
            txs: vec![],
            results: vec![],
            state_ref: StateRef {
                height,
                root: Hash32::ZERO,
            },
            timestamp_ms: 0,
        }],
    })
}

fn proof(batch: &Batch) -> Proof {
    Proof {
        batch_id: batch.id,
        certificate: certify(batch.id, &batch.digest()),
    }
}

struct Harness {
    relayer: Arc<Relayer>,
    rollup: RollupHandle,
    bridge: BridgeHandle,
    sequencer: Sequencer,
}

fn harness(l1_genesis: Vec<(Address, u128)>) -> (Harness, l1_contracts::RollupOutbox, l1_contracts::BridgeOutbox) {
    harness_with(l1_genesis, SequencerConfig::default())
}

fn harness_with(
    l1_genesis: Vec<(Address, u128)>,
    sequencer_config: SequencerConfig,
) -> (Harness, l1_contracts::RollupOutbox, l1_contracts::BridgeOutbox) {
    let timeout = Duration::from_millis(500);
    let (rollup, rollup_outbox) = spawn_rollup(
        RollupConfig {
            force_inclusion_window: 4,
            ..RollupConfig::default()
        },
        timeout,
    );
    let (bridge, bridge_outbox) = spawn_bridge(l1_genesis, rollup.clone(), timeout);
    let sequencer = Sequencer::open(LedgerState::new(), sequencer_config, None).unwrap();
    let relayer = Arc::new(Relayer::new(
        rollup.clone(),
        bridge.clone(),
        sequencer.transaction_sender(),
        config(),
    ));
    (
        Harness {
            relayer,
            rollup,
            bridge,
            sequencer,
        },
        rollup_outbox,
        bridge_outbox,
    )
}

#[tokio::test]
async fn test_proof_waits_for_commitment() {
    let (h, _, _) = harness(vec![]);
    let b = batch(1, 1);

    // Proof arrives first; it must not reach L1 before the commit
    let relayer = h.relayer.clone();
    let early_proof = proof(&b);
    let proof_task = tokio::spawn(async move { relayer.relay_proof(1, early_proof).await });

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(
        h.rollup.finality_record(1).await.unwrap().status,
        FinalityStatus::Uncommitted
    );

    h.relayer.relay_commitment(b.clone()).await.unwrap();
    let outcome = proof_task.await.unwrap().unwrap();
    assert_eq!(outcome.status, FinalityStatus::Verified);
    assert_eq!(
        h.rollup.finality_record(1).await.unwrap().status,
        FinalityStatus::Verified
    );
    assert!(h.relayer.lanes().is_empty());
}

#[tokio::test]
async fn test_proof_without_commitment_times_out() {
    let (h, _, _) = harness(vec![]);
    let b = batch(1, 1);

    let err = h.relayer.relay_proof(1, proof(&b)).await.unwrap_err();
    assert!(matches!(err, RelayError::CommitTimeout(1)));
    assert!(err.is_transport());
}

#[tokio::test]
async fn test_batches_pipeline_independently() {
    let (h, _, _) = harness(vec![]);
    let batches: Vec<_> = (1..=4).map(|id| batch(id, id)).collect();

    let commits = batches.iter().map(|b| h.relayer.relay_commitment(b.clone()));
    let proofs = batches.iter().map(|b| h.relayer.relay_proof(b.id, proof(b)));
    let (committed, verified) = tokio::join!(
        futures::future::join_all(commits),
        futures::future::join_all(proofs)
    );

    assert!(committed.iter().all(Result::is_ok));
    for outcome in verified {
        assert_eq!(outcome.unwrap().status, FinalityStatus::Verified);
    }
}

#[tokio::test]
async fn test_transport_faults_are_retried() {
    let (h, _, _) = harness(vec![]);
    let b = batch(1, 1);

    h.rollup.inject_faults(2);
    let commitment = h.relayer.relay_commitment(b.clone()).await.unwrap();
    assert_eq!(commitment.digest, b.digest());

    h.rollup.inject_faults(10);
    let err = h.relayer.relay_proof(1, proof(&b)).await.unwrap_err();
    assert!(matches!(err, RelayError::Exhausted { attempts: 4, .. }));
    h.rollup.inject_faults(0);
    assert_eq!(
        h.rollup.finality_record(1).await.unwrap().status,
        FinalityStatus::Committed
    );
}

#[tokio::test]
async fn test_commit_retry_after_failure_verifies() {
    let (h, _, _) = harness(vec![]);
    let b = batch(1, 1);

    h.rollup.inject_faults(100);
    let err = h.relayer.relay_commitment(b.clone()).await.unwrap_err();
    assert!(matches!(err, RelayError::Exhausted { .. }));
    assert_eq!(h.relayer.lanes().get(1).status(), LaneStatus::CommitFailed);
    h.rollup.inject_faults(0);

    // A new attempt starts clean: its proof waits for the retried commit
    h.relayer.lanes().reopen(1);
    let relayer = h.relayer.clone();
    let retry_proof = proof(&b);
    let proof_task = tokio::spawn(async move { relayer.relay_proof(1, retry_proof).await });

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!proof_task.is_finished());

    h.relayer.relay_commitment(b.clone()).await.unwrap();
    let outcome = proof_task.await.unwrap().unwrap();
    assert_eq!(outcome.status, FinalityStatus::Verified);
    assert!(h.relayer.lanes().is_empty());
}

#[tokio::test]
async fn test_commit_after_failure_resets_lane() {
    let (h, _, _) = harness(vec![]);
    let b = batch(1, 1);

    h.rollup.inject_faults(100);
    assert!(h.relayer.relay_commitment(b.clone()).await.is_err());
    h.rollup.inject_faults(0);

    h.relayer.relay_commitment(b.clone()).await.unwrap();
    let outcome = h.relayer.relay_proof(1, proof(&b)).await.unwrap();
    assert_eq!(outcome.status, FinalityStatus::Verified);
}

#[tokio::test]
async fn test_matching_duplicate_commit_counts_as_success() {
    let (h, _, _) = harness(vec![]);
    let b = batch(1, 1);

    h.rollup.commit(b.clone()).await.unwrap();
    let commitment = h.relayer.relay_commitment(b.clone()).await.unwrap();
    assert_eq!(commitment.digest, b.digest());

    // A different batch under the same id is a protocol error
    let other = batch(1, 2);
    let other_relayer = Relayer::new(
        h.rollup.clone(),
        h.bridge.clone(),
        h.sequencer.transaction_sender(),
        config(),
    );
    let err = other_relayer.relay_commitment(other).await.unwrap_err();
    assert!(matches!(err, RelayError::Rejected(_)));
    assert!(!err.is_transport());
}

#[tokio::test]
async fn test_deposit_relayed_as_l2_mint() {
    let alice = Address::user_from_seed("alice");
    let (mut h, rollup_outbox, bridge_outbox) = harness(vec![(alice, 100)]);
    let (_censor_tx, censor_rx) = mpsc::unbounded_channel();
    let _listeners = h
        .relayer
        .spawn_listeners(rollup_outbox, bridge_outbox, censor_rx);

    let record = h.bridge.deposit(alice, alice, 70).await.unwrap();
    let mint = record.mint_transaction();
    let receipts = h.sequencer.receipts();

    let mut handle = loop {
        if let Some(handle) = receipts.subscribe(&mint.hash()) {
            break handle;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    h.sequencer.produce_block().await.unwrap();

    let receipt = handle.wait(Duration::from_secs(1)).await.unwrap();
    assert_eq!(receipt.status, ReceiptStatus::Confirmed);
    assert_eq!(h.sequencer.latest_state().balance(&alice), 70);
    assert_eq!(h.bridge.l1_balance(alice).await.unwrap(), 30);

    // Marked once the mint is queued
    let status = loop {
        match h.bridge.record_status(record.id).await.unwrap() {
            Some(BridgeRecordStatus::Locked) => tokio::time::sleep(Duration::from_millis(5)).await,
            other => break other,
        }
    };
    assert_eq!(status, Some(BridgeRecordStatus::Relayed));
}

#[tokio::test]
async fn test_force_tx_relayed_and_censorship_reported() {
    let (mut h, rollup_outbox, bridge_outbox) = harness(vec![]);
    let (censor_tx, censor_rx) = mpsc::unbounded_channel();
    let _listeners = h
        .relayer
        .spawn_listeners(rollup_outbox, bridge_outbox, censor_rx);

    let tx = Transaction::transfer(
        Address::user_from_seed("carol"),
        Address::user_from_seed("dave"),
        1,
    );
    let entry = h.rollup.register_force_tx(tx).await.unwrap();
    assert_eq!(entry.deadline, 4);

    let receipts = h.sequencer.receipts();
    while receipts.get(&entry.hash()).is_none() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(h.sequencer.transaction_sender().pool_sizes(), (0, 1));

    // The sequencer never includes it; report the miss as it would
    censor_tx
        .send(CensorshipTimeout {
            tx_ref: entry.hash(),
            deadline: entry.deadline,
            observed_height: entry.deadline + 1,
        })
        .unwrap();

    let mode = loop {
        let (mode, _) = h.rollup.mode().await.unwrap();
        if mode == RollupMode::Censored {
            break mode;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    assert_eq!(mode, RollupMode::Censored);
    assert_eq!(
        h.rollup.force_status(entry.hash()).await.unwrap(),
        Some(ForceTxStatus::Censored)
    );
}

#[tokio::test]
async fn test_force_deadline_anchored_to_l2_head() {
    let (mut h, rollup_outbox, bridge_outbox) = harness(vec![]);
    let (_censor_tx, censor_rx) = mpsc::unbounded_channel();
    let _listeners = h
        .relayer
        .spawn_listeners(rollup_outbox, bridge_outbox, censor_rx);

    // L2 runs ahead of L1: six blocks, none committed
    let mut blocks = Vec::new();
    for _ in 0..6 {
        blocks.push(h.sequencer.produce_block().await.unwrap());
    }

    let tx = Transaction::transfer(
        Address::user_from_seed("carol"),
        Address::user_from_seed("dave"),
        1,
    );
    let entry = h.rollup.register_force_tx(tx).await.unwrap();
    assert_eq!(entry.deadline, 4);

    let receipts = h.sequencer.receipts();
    let mut handle = loop {
        if let Some(handle) = receipts.subscribe(&entry.hash()) {
            break handle;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };

    let block = h.sequencer.produce_block().await.unwrap();
    assert_eq!(block.height, 7);
    assert!(block.txs.iter().any(|tx| tx.hash() == entry.hash()));
    blocks.push(block);

    let receipt = handle.wait(Duration::from_secs(1)).await.unwrap();
    assert_eq!(receipt.block_ref.map(|r| r.height), Some(7));

    let settled = Arc::new(Batch {
        id: 1,
        blocks: blocks.iter().map(|b| (**b).clone()).collect(),
    });
    h.rollup.commit(settled).await.unwrap();
    assert_eq!(
        h.rollup.force_status(entry.hash()).await.unwrap(),
        Some(ForceTxStatus::Included { height: 7 })
    );
    assert_eq!(h.rollup.mode().await.unwrap().0, RollupMode::Normal);
}

fn small_pool() -> SequencerConfig {
    SequencerConfig {
        mempool_capacity: 1,
        ..SequencerConfig::default()
    }
}

fn fill_pool(h: &Harness) {
    let filler = Transaction::transfer(
        Address::user_from_seed("bob"),
        Address::user_from_seed("carol"),
        1,
    );
    h.sequencer.transaction_sender().submit(filler).unwrap();
}

#[tokio::test]
async fn test_deposit_waits_out_full_mempool() {
    let alice = Address::user_from_seed("alice");
    let (mut h, _, _) = harness_with(vec![(alice, 100)], small_pool());
    fill_pool(&h);

    let patient = Arc::new(Relayer::new(
        h.rollup.clone(),
        h.bridge.clone(),
        h.sequencer.transaction_sender(),
        RelayerConfig {
            retry: RetryPolicy {
                max_attempts: 100,
                initial_backoff_ms: 2,
                max_backoff_ms: 5,
            },
            commit_wait_ms: 500,
        },
    ));
    let record = h.bridge.deposit(alice, alice, 70).await.unwrap();
    let relay = tokio::spawn({
        let patient = patient.clone();
        let record = record.clone();
        async move { patient.relay_bridge_deposit(record).await }
    });

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!relay.is_finished());
    h.sequencer.produce_block().await.unwrap();

    let mut handle = relay.await.unwrap().unwrap();
    h.sequencer.produce_block().await.unwrap();
    let receipt = handle.wait(Duration::from_secs(1)).await.unwrap();
    assert_eq!(receipt.status, ReceiptStatus::Confirmed);
    assert_eq!(h.sequencer.latest_state().balance(&alice), 70);
    assert_eq!(
        h.bridge.record_status(record.id).await.unwrap(),
        Some(BridgeRecordStatus::Relayed)
    );
}

#[tokio::test]
async fn test_deposit_marked_failed_when_mempool_stays_full() {
    let alice = Address::user_from_seed("alice");
    let (mut h, _, _) = harness_with(vec![(alice, 100)], small_pool());
    fill_pool(&h);

    let record = h.bridge.deposit(alice, alice, 70).await.unwrap();
    let err = h
        .relayer
        .relay_bridge_deposit(record.clone())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RelayError::Sequencer(SequencerError::Mempool(MempoolError::Full(1)))
    ));
    assert_eq!(
        h.bridge.record_status(record.id).await.unwrap(),
        Some(BridgeRecordStatus::RelayFailed)
    );
    assert_eq!(h.bridge.l1_balance(alice).await.unwrap(), 30);

    // Relaying again once the pool drains completes the deposit
    h.sequencer.produce_block().await.unwrap();
    h.relayer.relay_bridge_deposit(record.clone()).await.unwrap();
    assert_eq!(
        h.bridge.record_status(record.id).await.unwrap(),
        Some(BridgeRecordStatus::Relayed)
    );
}
