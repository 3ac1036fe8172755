//! Bridge records and force-inclusion entries

use crate::{
    address::Address,
    hash::{domain_hasher, Hash32},
    transaction::{Transaction, TxHash},
};
use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub enum BridgeDirection {
    Deposit,
    Withdraw,
}

/// A pending or settled bridge request, keyed by its originating transaction
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct BridgeRecord {
    pub id: Hash32,
    pub direction: BridgeDirection,
    pub from: Address,
    pub to: Address,
    pub value: u128,
    /// Withdrawals: the L2 withdraw intent that must be in a verified batch
    pub l2_tx_ref: Option<TxHash>,
}

impl BridgeRecord {
    /// Deposit record; `nonce` distinguishes repeated identical deposits
    pub fn deposit(from: Address, to: Address, value: u128, nonce: u64) -> Self {
        let mut hasher = domain_hasher(b"rollup/deposit/v1");
        hasher.update(&[0]);
        hasher.update(from.bytes());
        hasher.update(&[0]);
        hasher.update(to.bytes());
        hasher.update(&value.to_le_bytes());
        hasher.update(&nonce.to_le_bytes());
        Self {
            id: hasher.finalize().into(),
            direction: BridgeDirection::Deposit,
            from,
            to,
            value,
            l2_tx_ref: None,
        }
    }

    /// Withdraw record; its id is the L2 withdraw intent hash
    pub fn withdraw(from: Address, to: Address, value: u128, l2_tx_ref: TxHash) -> Self {
        Self {
            id: l2_tx_ref,
            direction: BridgeDirection::Withdraw,
            from,
            to,
            value,
            l2_tx_ref: Some(l2_tx_ref),
        }
    }

    /// The L2 mint transaction this deposit turns into
    pub fn mint_transaction(&self) -> Transaction {
        Transaction::deposit_mint(self.to, self.value, self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BridgeRecordStatus {
    /// Funds in custody, record not yet handed to the relayer
    Locked,
    /// Handed to the relayer for minting on L2
    Relayed,
    /// The L2 hand-off kept failing; funds stay in custody until re-relayed
    RelayFailed,
    /// Withdrawal paid out on L1
    Released,
}

/// A successful L2 withdraw intent, as indexed by the rollup contract
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct WithdrawalLeaf {
    pub tx_ref: TxHash,
    pub from: Address,
    pub value: u128,
    pub block_height: u64,
}

/// A transaction registered on L1 that must land on L2 by `deadline` (block height)
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct ForceTxEntry {
    pub tx: Transaction,
    pub deadline: u64,
}

impl ForceTxEntry {
    pub fn hash(&self) -> TxHash {
        self.tx.hash()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForceTxStatus {
    Pending,
    Included { height: u64 },
    /// Deadline missed: the rollup fell back to its escape hatch
    Censored,
}

/// Sequencer report that a force transaction expired without inclusion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CensorshipTimeout {
    pub tx_ref: TxHash,
    pub deadline: u64,
    /// Height of the first block produced past the deadline
    pub observed_height: u64,
}
