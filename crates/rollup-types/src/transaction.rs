//! Transactions
//!
//! A transaction is immutable once built. Its identity is the blake3 hash of its
//! canonical field encoding, which is also the idempotency key across the
//! mempool, the receipt book and the L1 contracts.

use crate::{
    address::{Address, Origin, L2_BRIDGE_ADDRESS},
    hash::{domain_hasher, Hash32},
};
use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type TxHash = Hash32;

/// Reasons a submission is rejected before it reaches a pool
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedTxError {
    #[error("sender address is empty")]
    EmptySender,

    #[error("recipient address is empty")]
    EmptyRecipient,

    #[error("value must be non-negative")]
    NegativeValue,

    #[error("origin {0:?} is not accepted on this path")]
    UnexpectedOrigin(Origin),

    #[error("sender {0} cannot originate this transaction")]
    UnauthorizedSender(Address),
}

/// How the sequencer treats a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxKind {
    Transfer,
    /// Relayed L1 deposit, credited out of bridge custody
    DepositMint,
    /// L2 half of a withdrawal, burned on L2 and released on L1 after finality
    WithdrawIntent,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct Transaction {
    pub from: Address,
    pub to: Address,
    pub value: u128,
    pub origin: Origin,
    #[serde(default)]
    pub fees: Option<u128>,
    #[serde(default)]
    pub gas_price: Option<u128>,
    #[serde(default)]
    pub calldata: Option<Vec<u8>>,
}

impl Transaction {
    pub fn new(from: Address, to: Address, value: u128, origin: Origin) -> Self {
        Self {
            from,
            to,
            value,
            origin,
            fees: None,
            gas_price: None,
            calldata: None,
        }
    }

    /// Plain L2 transfer
    pub fn transfer(from: Address, to: Address, value: u128) -> Self {
        Self::new(from, to, value, Origin::L2)
    }

    /// Mint for a relayed L1 deposit. The deposit id goes into calldata so two
    /// identical deposits still hash differently.
    pub fn deposit_mint(to: Address, value: u128, deposit_id: Hash32) -> Self {
        Self::new(L2_BRIDGE_ADDRESS, to, value, Origin::L1).with_calldata(deposit_id.0.to_vec())
    }

    /// L2 withdraw intent; releasable on L1 once its batch is verified
    pub fn withdraw_intent(from: Address, value: u128) -> Self {
        Self::new(from, L2_BRIDGE_ADDRESS, value, Origin::L2)
    }

    pub fn with_fees(mut self, fees: u128) -> Self {
        self.fees = Some(fees);
        self
    }

    pub fn with_gas_price(mut self, gas_price: u128) -> Self {
        self.gas_price = Some(gas_price);
        self
    }

    pub fn with_calldata(mut self, calldata: Vec<u8>) -> Self {
        self.calldata = Some(calldata);
        self
    }

    pub fn kind(&self) -> TxKind {
        if self.from == L2_BRIDGE_ADDRESS && self.origin == Origin::L1 {
            TxKind::DepositMint
        } else if self.to == L2_BRIDGE_ADDRESS {
            TxKind::WithdrawIntent
        } else {
            TxKind::Transfer
        }
    }

    /// Structural checks shared by every submission path
    pub fn validate(&self) -> Result<(), MalformedTxError> {
        if self.from.is_empty() {
            return Err(MalformedTxError::EmptySender);
        }
        if self.to.is_empty() {
            return Err(MalformedTxError::EmptyRecipient);
        }
        Ok(())
    }

    /// Content hash
    pub fn hash(&self) -> TxHash {
        let mut hasher = domain_hasher(b"rollup/tx/v1");
        self.from.hash_into(&mut hasher);
        self.to.hash_into(&mut hasher);
        hasher.update(&self.value.to_le_bytes());
        hasher.update(&[self.origin.tag()]);
        hash_optional_u128(&mut hasher, self.fees);
        hash_optional_u128(&mut hasher, self.gas_price);
        match &self.calldata {
            Some(data) => {
                hasher.update(&[1]);
                hasher.update(&(data.len() as u64).to_le_bytes());
                hasher.update(data);
            }
            None => {
                hasher.update(&[0]);
            }
        }
        hasher.finalize().into()
    }
}

fn hash_optional_u128(hasher: &mut blake3::Hasher, value: Option<u128>) {
    match value {
        Some(v) => {
            hasher.update(&[1]);
            hasher.update(&v.to_le_bytes());
        }
        None => {
            hasher.update(&[0]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::ADDRESS_LEN;

    #[test]
    fn test_hash_is_content_bound() {
        let alice = Address::user_from_seed("alice");
        let bob = Address::user_from_seed("bob");

        let a = Transaction::transfer(alice, bob, 10);
        let b = Transaction::transfer(alice, bob, 10);
        assert_eq!(a.hash(), b.hash());

        assert_ne!(a.hash(), Transaction::transfer(alice, bob, 11).hash());
        assert_ne!(a.hash(), a.clone().with_fees(1).hash());
        assert_ne!(a.hash(), Transaction::new(alice, bob, 10, Origin::L1).hash());
        // None and an empty calldata are different contents
        assert_ne!(a.hash(), a.clone().with_calldata(vec![]).hash());
    }

    #[test]
    fn test_kinds() {
        let alice = Address::user_from_seed("alice");
        let bob = Address::user_from_seed("bob");

        assert_eq!(Transaction::transfer(alice, bob, 1).kind(), TxKind::Transfer);
        assert_eq!(
            Transaction::deposit_mint(alice, 1, Hash32::ZERO).kind(),
            TxKind::DepositMint
        );
        assert_eq!(Transaction::withdraw_intent(alice, 1).kind(), TxKind::WithdrawIntent);

        // Bridge-originated L2 transactions are not mints
        let forged = Transaction::new(L2_BRIDGE_ADDRESS, alice, 1, Origin::L2);
        assert_eq!(forged.kind(), TxKind::Transfer);
    }

    #[test]
    fn test_deposits_with_distinct_ids_differ() {
        let alice = Address::user_from_seed("alice");
        let first = Transaction::deposit_mint(alice, 100, Hash32([1u8; 32]));
        let second = Transaction::deposit_mint(alice, 100, Hash32([2u8; 32]));
        assert_ne!(first.hash(), second.hash());
    }

    #[test]
    fn test_validate() {
        let alice = Address::user_from_seed("alice");
        let empty = Address::User([0u8; ADDRESS_LEN]);

        assert!(Transaction::transfer(alice, alice, 0).validate().is_ok());
        assert_eq!(
            Transaction::transfer(empty, alice, 1).validate(),
            Err(MalformedTxError::EmptySender)
        );
        assert_eq!(
            Transaction::transfer(alice, empty, 1).validate(),
            Err(MalformedTxError::EmptyRecipient)
        );
    }

    #[test]
    fn test_bincode_round_trip_keeps_hash() {
        let tx = Transaction::transfer(Address::user_from_seed("a"), Address::user_from_seed("b"), 5)
            .with_gas_price(3)
            .with_calldata(vec![1, 2, 3]);
        let bytes = bincode::serialize(&tx).unwrap();
        let decoded: Transaction = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded.hash(), tx.hash());
    }
}
