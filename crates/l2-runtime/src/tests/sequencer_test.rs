//! Sequencer Integration Tests
//!
//! Exercises the block loop end to end:
//! - Force / general ordering within a block
//! - Failed transactions inside an otherwise valid block
//! - Concurrent submission and exactly-once inclusion
//! - Crash recovery from the sled journal
//! - Force deadline expiry and censorship reports

use std::{collections::HashSet, sync::Arc, time::Duration};

use rollup_types::{
    Address, Block, ExecutionStatus, FailureReason, ForceTxEntry, Hash32, MalformedTxError,
    Origin, ReceiptStatus, Transaction, TxLifecycle,
};
use tempfile::tempdir;
use tokio::sync::mpsc;

use crate::{
    ledger::LedgerState,
    mempool::MempoolError,
    persistence::ChainStore,
    sequencer::{Sequencer, SequencerConfig, SequencerError},
};

fn alice() -> Address {
    Address::user_from_seed("alice")
}

fn bob() -> Address {
    Address::user_from_seed("bob")
}

fn config(max_txs_per_block: usize) -> SequencerConfig {
    SequencerConfig {
        max_txs_per_block,
        force_lookahead: 2,
        ..Default::default()
    }
}

fn force_entry(value: u128, deadline: u64) -> ForceTxEntry {
    ForceTxEntry {
        tx: Transaction::new(alice(), bob(), value, Origin::L1),
        deadline,
    }
}

#[tokio::test]
async fn test_force_entries_ordered_before_general_pool() {
    let genesis = LedgerState::with_balances([(alice(), 1_000)]);
    let mut sequencer = Sequencer::open(genesis, config(4), None).unwrap();
    let submitter = sequencer.transaction_sender();

    submitter.submit(Transaction::transfer(alice(), bob(), 1)).unwrap();
    submitter.submit(Transaction::transfer(alice(), bob(), 2)).unwrap();
    // Not due yet (next height 1 + lookahead 2 = 3)
    submitter.submit_force(force_entry(30, 10)).unwrap();
    // Both due; deadline order beats arrival order
    submitter.submit_force(force_entry(20, 3)).unwrap();
    submitter.submit_force(force_entry(10, 2)).unwrap();

    let block = sequencer.produce_block().await.unwrap();
    let values: Vec<u128> = block.txs.iter().map(|tx| tx.value).collect();
    assert_eq!(values, vec![10, 20, 1, 2]);

    // The not-yet-due force entry fills the next block
    let block = sequencer.produce_block().await.unwrap();
    let values: Vec<u128> = block.txs.iter().map(|tx| tx.value).collect();
    assert_eq!(values, vec![30]);
    assert_eq!(sequencer.latest_state().balance(&bob()), 63);
}

#[tokio::test]
async fn test_failed_transaction_keeps_block_going() {
    let genesis = LedgerState::with_balances([(alice(), 50)]);
    let mut sequencer = Sequencer::open(genesis, config(8), None).unwrap();
    let submitter = sequencer.transaction_sender();

    let mut overdraw = submitter
        .submit(Transaction::transfer(bob(), alice(), 5))
        .unwrap();
    let mut transfer = submitter
        .submit(Transaction::transfer(alice(), bob(), 20))
        .unwrap();

    let block = sequencer.produce_block().await.unwrap();
    assert_eq!(block.txs.len(), 2);

    let failed = overdraw.wait(Duration::from_secs(1)).await.unwrap();
    assert_eq!(
        failed.status,
        ReceiptStatus::Failed(FailureReason::InsufficientBalance {
            needed: 5,
            available: 0
        })
    );
    let confirmed = transfer.wait(Duration::from_secs(1)).await.unwrap();
    assert_eq!(confirmed.status, ReceiptStatus::Confirmed);
    assert_eq!(confirmed.block_ref.unwrap().height, 1);

    let state = sequencer.latest_state();
    assert_eq!(state.balance(&alice()), 30);
    assert_eq!(state.balance(&bob()), 20);
}

#[tokio::test]
async fn test_receipt_wait_times_out_then_resumes() {
    let genesis = LedgerState::with_balances([(alice(), 10)]);
    let mut sequencer = Sequencer::open(genesis, config(8), None).unwrap();
    let submitter = sequencer.transaction_sender();

    let tx = Transaction::transfer(alice(), bob(), 3);
    let mut handle = submitter.submit(tx.clone()).unwrap();
    assert!(handle.wait(Duration::from_millis(20)).await.is_err());
    assert_eq!(
        submitter.receipts().lifecycle(&tx.hash()),
        Some(TxLifecycle::Submitted)
    );

    sequencer.produce_block().await.unwrap();

    let receipt = handle.wait(Duration::from_millis(20)).await.unwrap();
    assert_eq!(receipt.status, ReceiptStatus::Confirmed);

    // A late subscriber sees the same terminal receipt
    let mut late = submitter.receipts().subscribe(&tx.hash()).unwrap();
    assert_eq!(late.wait(Duration::from_millis(20)).await.unwrap(), receipt);
}

#[tokio::test]
async fn test_duplicate_submission_joins_existing_receipt() {
    let genesis = LedgerState::with_balances([(alice(), 10)]);
    let mut sequencer = Sequencer::open(genesis, config(8), None).unwrap();
    let submitter = sequencer.transaction_sender();

    let tx = Transaction::transfer(alice(), bob(), 4);
    let first = submitter.submit(tx.clone()).unwrap();
    let mut second = submitter.submit(tx.clone()).unwrap();
    assert_eq!(first.tx_hash(), second.tx_hash());
    assert_eq!(submitter.pool_sizes(), (1, 0));

    let block = sequencer.produce_block().await.unwrap();
    assert_eq!(block.txs, vec![tx]);
    assert_eq!(
        second.wait(Duration::from_secs(1)).await.unwrap().status,
        ReceiptStatus::Confirmed
    );
    assert_eq!(sequencer.latest_state().balance(&bob()), 4);
}

#[tokio::test]
async fn test_public_path_rejects_malformed_and_l1_origin() {
    let sequencer = Sequencer::open(LedgerState::new(), config(8), None).unwrap();
    let submitter = sequencer.transaction_sender();

    let l1 = Transaction::new(alice(), bob(), 1, Origin::L1);
    assert!(matches!(
        submitter.submit(l1),
        Err(SequencerError::Mempool(MempoolError::Malformed(
            MalformedTxError::UnexpectedOrigin(Origin::L1)
        )))
    ));

    let empty = Transaction::transfer(alice(), Address::User([0u8; 20]), 1);
    assert!(matches!(
        submitter.submit(empty),
        Err(SequencerError::Mempool(MempoolError::Malformed(
            MalformedTxError::EmptyRecipient
        )))
    ));
    assert_eq!(submitter.pool_sizes(), (0, 0));
    assert!(submitter.receipts().is_empty());
}

#[tokio::test]
async fn test_concurrent_submissions_included_exactly_once() {
    const SUBMITTERS: u128 = 8;
    const PER_SUBMITTER: u128 = 25;

    let genesis = LedgerState::with_balances([(alice(), 1_000_000)]);
    let mut sequencer = Sequencer::open(genesis, config(16), None).unwrap();
    let submitter = sequencer.transaction_sender();

    let tasks: Vec<_> = (0..SUBMITTERS)
        .map(|worker| {
            let submitter = submitter.clone();
            tokio::spawn(async move {
                (0..PER_SUBMITTER)
                    .map(|i| {
                        let tx = Transaction::transfer(alice(), bob(), worker * 1_000 + i + 1);
                        submitter.submit(tx).unwrap().tx_hash()
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let submitted: HashSet<Hash32> = futures::future::join_all(tasks)
        .await
        .into_iter()
        .flat_map(|r| r.unwrap())
        .collect();
    assert_eq!(submitted.len(), (SUBMITTERS * PER_SUBMITTER) as usize);

    let mut included = Vec::new();
    while sequencer.has_work() {
        let block = sequencer.produce_block().await.unwrap();
        assert!(block.txs.len() <= 16);
        included.extend(block.tx_hashes());
    }

    let unique: HashSet<Hash32> = included.iter().copied().collect();
    assert_eq!(included.len(), unique.len());
    assert_eq!(unique, submitted);
}

#[tokio::test]
async fn test_blocks_forwarded_with_parent_links() {
    let (block_tx, mut block_rx) = mpsc::channel::<Block>(16);
    let genesis = LedgerState::with_balances([(alice(), 10)]);
    let mut sequencer = Sequencer::open(genesis, config(8), None)
        .unwrap()
        .with_block_sink(block_tx);
    let mut updates = sequencer.subscribe();
    let submitter = sequencer.transaction_sender();

    submitter.submit(Transaction::transfer(alice(), bob(), 1)).unwrap();
    sequencer.produce_block().await.unwrap();
    submitter.submit(Transaction::transfer(alice(), bob(), 2)).unwrap();
    sequencer.produce_block().await.unwrap();

    let first = block_rx.recv().await.unwrap();
    let second = block_rx.recv().await.unwrap();
    assert_eq!(first.parent_ref, Hash32::ZERO);
    assert_eq!(second.parent_ref, first.hash());
    assert_eq!(second.height, 2);

    let update = updates.recv().await.unwrap();
    assert_eq!(update.block_ref, first.block_ref());
    assert_eq!(update.state.balance(&bob()), 1);
    assert_eq!(sequencer.chain_view().borrow().head, second.block_ref());
}

#[tokio::test]
async fn test_expired_force_entry_reports_censorship() {
    let (censor_tx, mut censor_rx) = mpsc::unbounded_channel();
    let genesis = LedgerState::with_balances([(alice(), 10)]);
    let mut sequencer = Sequencer::open(genesis, config(8), None)
        .unwrap()
        .with_censorship_sink(censor_tx);
    let submitter = sequencer.transaction_sender();

    sequencer.produce_block().await.unwrap();
    sequencer.produce_block().await.unwrap();

    // Deadline 1 is already behind the chain
    let entry = force_entry(5, 1);
    let mut handle = submitter.submit_force(entry.clone()).unwrap();
    let block = sequencer.produce_block().await.unwrap();
    assert!(block.txs.is_empty());

    let receipt = handle.wait(Duration::from_secs(1)).await.unwrap();
    assert_eq!(
        receipt.status,
        ReceiptStatus::Failed(FailureReason::CensorshipTimeout { deadline: 1 })
    );
    assert!(receipt.block_ref.is_none());

    let report = censor_rx.recv().await.unwrap();
    assert_eq!(report.tx_ref, entry.hash());
    assert_eq!(report.deadline, 1);
    assert_eq!(report.observed_height, 3);
    assert_eq!(sequencer.latest_state().balance(&bob()), 0);
}

#[tokio::test]
async fn test_force_entry_included_at_deadline() {
    let genesis = LedgerState::with_balances([(alice(), 10)]);
    let mut sequencer = Sequencer::open(genesis, config(1), None).unwrap();
    let submitter = sequencer.transaction_sender();

    submitter.submit(Transaction::transfer(alice(), bob(), 1)).unwrap();
    submitter.submit(Transaction::transfer(alice(), bob(), 2)).unwrap();
    let mut forced = submitter.submit_force(force_entry(3, 1)).unwrap();

    // Capacity 1: the due force entry takes the only slot
    let block = sequencer.produce_block().await.unwrap();
    assert_eq!(block.txs[0].origin, Origin::L1);
    let receipt = forced.wait(Duration::from_secs(1)).await.unwrap();
    assert_eq!(receipt.block_ref.unwrap().height, 1);
}

#[tokio::test]
async fn test_restart_does_not_reapply_executed_transactions() {
    let dir = tempdir().unwrap();
    let genesis = LedgerState::with_balances([(alice(), 100)]);
    let first = Transaction::transfer(alice(), bob(), 10);
    let second = Transaction::transfer(alice(), bob(), 20);
    let head;

    {
        let store = Arc::new(ChainStore::open(dir.path()).unwrap());
        let mut sequencer =
            Sequencer::open(genesis.clone(), config(1), Some(store.clone())).unwrap();
        let submitter = sequencer.transaction_sender();
        submitter.submit(first.clone()).unwrap();
        submitter.submit(second.clone()).unwrap();

        // Only the first fits; the second stays journaled
        let block = sequencer.produce_block().await.unwrap();
        assert_eq!(block.txs, vec![first.clone()]);
        head = block.block_ref();
        assert_eq!(store.pending_count(), 1);
    }

    let store = Arc::new(ChainStore::open(dir.path()).unwrap());
    let mut sequencer = Sequencer::open(genesis, config(8), Some(store)).unwrap();
    assert_eq!(sequencer.head(), head);
    assert_eq!(sequencer.latest_state().balance(&bob()), 10);

    let submitter = sequencer.transaction_sender();
    assert_eq!(submitter.pool_sizes(), (1, 0));

    // Resubmitting an executed tx answers from the stored block
    let mut replay = submitter.submit(first.clone()).unwrap();
    let receipt = replay.wait(Duration::from_secs(1)).await.unwrap();
    assert_eq!(receipt.block_ref, Some(head));
    assert_eq!(submitter.pool_sizes(), (1, 0));

    let block = sequencer.produce_block().await.unwrap();
    assert_eq!(block.txs, vec![second]);
    assert_eq!(block.parent_ref, head.hash);
    assert_eq!(block.results, vec![ExecutionStatus::Success]);

    let state = sequencer.latest_state();
    assert_eq!(state.balance(&alice()), 70);
    assert_eq!(state.balance(&bob()), 30);
}
