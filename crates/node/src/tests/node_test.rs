//! Node End-to-End Tests
//!
//! Runs the whole pipeline in one process:
//! - deposit → transfer → withdraw, released on L1 only after verification
//! - L2 state survives a restart from the data directory

use std::time::Duration;

use l1_contracts::{BridgeError, L1Error};
use rollup_types::{Address, FinalityStatus, ReceiptStatus, TxLifecycle};

use crate::{GenesisAccount, NodeConfig, RollupNode};

fn config() -> NodeConfig {
    NodeConfig {
        rpc_addr: None,
        block_time_ms: 10,
        max_blocks_per_batch: 4,
        max_batch_wait_ms: 50,
        proof_timeout_ms: 2_000,
        commit_wait_ms: 2_000,
        l1_genesis: vec![GenesisAccount {
            address: Address::user_from_seed("alice"),
            balance: 200,
        }],
        ..NodeConfig::default()
    }
}

async fn wait_until<F: Fn() -> bool>(what: &str, check: F) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", what));
}

#[tokio::test]
async fn test_deposit_transfer_withdraw() {
    let alice = Address::user_from_seed("alice");
    let bob = Address::user_from_seed("bob");
    let node = RollupNode::launch(config()).await.unwrap();

    // Deposit on L1, minted on L2 by the relayer
    node.bridge.deposit(alice, alice, 120).await.unwrap();
    wait_until("deposit mint", || node.chain.borrow().state.balance(&alice) == 120).await;
    assert_eq!(node.bridge.l1_balance(alice).await.unwrap(), 80);

    let mut transfer = node
        .submitter
        .submit(rollup_types::Transaction::transfer(alice, bob, 40))
        .unwrap();
    let receipt = transfer.wait(Duration::from_secs(5)).await.unwrap();
    assert_eq!(receipt.status, ReceiptStatus::Confirmed);
    {
        let view = node.chain.borrow();
        assert_eq!(view.state.balance(&alice), 80);
        assert_eq!(view.state.balance(&bob), 40);
    }

    let mut withdraw = node.submitter.withdraw(alice, 80).unwrap();
    let tx_ref = withdraw.tx_hash();
    let receipt = withdraw.wait(Duration::from_secs(5)).await.unwrap();
    assert_eq!(receipt.status, ReceiptStatus::Confirmed);
    assert_eq!(node.chain.borrow().state.balance(&alice), 0);

    // Released only once the withdraw's batch is verified
    let record = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match node.bridge.withdraw(alice, alice, 80, tx_ref).await {
                Ok(record) => break record,
                Err(L1Error::Bridge(BridgeError::NotFinalized(_))) => {
                    tokio::time::sleep(Duration::from_millis(10)).await
                }
                Err(e) => panic!("unexpected withdraw error: {}", e),
            }
        }
    })
    .await
    .expect("withdrawal finalized");
    assert_eq!(record.value, 80);

    let (batch_id, _) = node.rollup.tx_location(tx_ref).await.unwrap().unwrap();
    assert_eq!(
        node.rollup.finality_record(batch_id).await.unwrap().status,
        FinalityStatus::Verified
    );
    assert_eq!(node.bridge.l1_balance(alice).await.unwrap(), 160);
    assert_eq!(node.bridge.custody().await.unwrap(), 40);

    // No double release
    assert!(matches!(
        node.bridge.withdraw(alice, alice, 80, tx_ref).await,
        Err(L1Error::Bridge(BridgeError::AlreadyReleased(_)))
    ));

    let receipts = node.receipts.clone();
    wait_until("withdraw finality on L2", || {
        receipts.lifecycle(&tx_ref) == Some(TxLifecycle::Finalized)
    })
    .await;

    node.shutdown().await;
}

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let alice = Address::user_from_seed("alice");
    let bob = Address::user_from_seed("bob");
    let config = NodeConfig {
        data_dir: Some(dir.path().to_path_buf()),
        l2_genesis: vec![GenesisAccount {
            address: alice,
            balance: 50,
        }],
        ..config()
    };

    let node = RollupNode::launch(config.clone()).await.unwrap();
    let mut handle = node
        .submitter
        .submit(rollup_types::Transaction::transfer(alice, bob, 20))
        .unwrap();
    let tx_ref = handle.tx_hash();
    handle.wait(Duration::from_secs(5)).await.unwrap();
    let height = node.height();

    let aggregator = node.aggregator.clone();
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let status = aggregator.status().await.unwrap();
            if status.outstanding == 0 && status.unbatched_blocks == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("batches settled");
    node.shutdown().await;

    let node = RollupNode::launch(config).await.unwrap();
    assert_eq!(node.height(), height);
    {
        let view = node.chain.borrow();
        assert_eq!(view.state.balance(&alice), 30);
        assert_eq!(view.state.balance(&bob), 20);
    }

    // Answered from the stored block, never re-applied
    let mut again = node
        .submitter
        .submit(rollup_types::Transaction::transfer(alice, bob, 20))
        .unwrap();
    assert_eq!(again.tx_hash(), tx_ref);
    let receipt = again.wait(Duration::from_secs(1)).await.unwrap();
    assert_eq!(receipt.status, ReceiptStatus::Confirmed);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(node.chain.borrow().state.balance(&bob), 20);

    node.shutdown().await;
}
