//! L1 Bridge Contract
//!
//! Holds deposited value in custody and pays withdrawals out of it. A
//! withdrawal is released only when the rollup contract reports the
//! originating L2 withdraw intent inside a Verified batch, and at most once.

use rollup_types::{
    Address, BridgeRecord, BridgeRecordStatus, FinalityStatus, Hash32, MalformedTxError, TxHash,
    WithdrawalLeaf,
};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BridgeError {
    #[error("insufficient L1 balance: needed {needed}, available {available}")]
    InsufficientL1Balance { needed: u128, available: u128 },

    /// The intent's batch is not (yet) verified; retry later
    #[error("withdrawal {0} is not finalized on L1")]
    NotFinalized(TxHash),

    #[error("withdrawal {0} belongs to a rejected batch")]
    FinalityRejected(TxHash),

    #[error("withdrawal {0} does not match its L2 intent")]
    WithdrawalMismatch(TxHash),

    #[error("withdrawal {0} was already released")]
    AlreadyReleased(TxHash),

    #[error("bridge custody holds {available}, cannot release {needed}")]
    InsufficientCustody { needed: u128, available: u128 },

    #[error("malformed bridge request: {0}")]
    Malformed(#[from] MalformedTxError),
}

impl BridgeError {
    /// Whether the same call can succeed later without any change by the caller
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NotFinalized(_))
    }
}

#[derive(Default)]
pub struct BridgeContract {
    l1_balances: HashMap<Address, u128>,
    custody: u128,
    deposit_nonce: u64,
    records: HashMap<Hash32, (BridgeRecord, BridgeRecordStatus)>,
    released: HashSet<TxHash>,
}

impl BridgeContract {
    /// Bridge with genesis-funded L1 balances
    pub fn new(genesis: impl IntoIterator<Item = (Address, u128)>) -> Self {
        Self {
            l1_balances: genesis.into_iter().filter(|(_, v)| *v > 0).collect(),
            ..Default::default()
        }
    }

    /// Lock `value` from `from` into custody for minting to `to` on L2
    pub fn deposit(&mut self, from: Address, to: Address, value: u128) -> Result<BridgeRecord, BridgeError> {
        if from.is_empty() {
            return Err(MalformedTxError::EmptySender.into());
        }
        if to.is_empty() {
            return Err(MalformedTxError::EmptyRecipient.into());
        }

        let available = self.l1_balance(&from);
        let remaining = available
            .checked_sub(value)
            .ok_or(BridgeError::InsufficientL1Balance {
                needed: value,
                available,
            })?;
        self.set_balance(from, remaining);
        self.custody += value;

        let record = BridgeRecord::deposit(from, to, value, self.deposit_nonce);
        self.deposit_nonce += 1;
        self.records
            .insert(record.id, (record.clone(), BridgeRecordStatus::Locked));

        tracing::info!("Deposit {} locked: {} from {} to {}", record.id, value, from, to);
        Ok(record)
    }

    /// Deposit handed to the relayer
    pub fn mark_relayed(&mut self, id: &Hash32) {
        if let Some((_, status)) = self.records.get_mut(id) {
            if matches!(
                *status,
                BridgeRecordStatus::Locked | BridgeRecordStatus::RelayFailed
            ) {
                *status = BridgeRecordStatus::Relayed;
            }
        }
    }

    /// The relayer gave up minting a deposit on L2
    pub fn mark_relay_failed(&mut self, id: &Hash32) {
        if let Some((_, status)) = self.records.get_mut(id) {
            if *status == BridgeRecordStatus::Locked {
                *status = BridgeRecordStatus::RelayFailed;
                tracing::warn!("Deposit {} could not be relayed, custody kept", id);
            }
        }
    }

    /// Release custody for a verified L2 withdraw intent.
    ///
    /// `proof` is what the rollup contract holds for `l2_tx_ref`: the
    /// withdrawal leaf and the finality of its batch.
    pub fn withdraw(
        &mut self,
        from: Address,
        to: Address,
        value: u128,
        l2_tx_ref: TxHash,
        proof: Option<(WithdrawalLeaf, FinalityStatus)>,
    ) -> Result<BridgeRecord, BridgeError> {
        if to.is_empty() {
            return Err(MalformedTxError::EmptyRecipient.into());
        }
        if self.released.contains(&l2_tx_ref) {
            return Err(BridgeError::AlreadyReleased(l2_tx_ref));
        }

        let Some((leaf, status)) = proof else {
            return Err(BridgeError::NotFinalized(l2_tx_ref));
        };
        match status {
            FinalityStatus::Verified => {}
            FinalityStatus::Rejected => return Err(BridgeError::FinalityRejected(l2_tx_ref)),
            FinalityStatus::Uncommitted | FinalityStatus::Committed => {
                return Err(BridgeError::NotFinalized(l2_tx_ref))
            }
        }
        if leaf.tx_ref != l2_tx_ref || leaf.from != from || leaf.value != value {
            return Err(BridgeError::WithdrawalMismatch(l2_tx_ref));
        }

        let custody = self
            .custody
            .checked_sub(value)
            .ok_or(BridgeError::InsufficientCustody {
                needed: value,
                available: self.custody,
            })?;
        self.custody = custody;
        let credited = self.l1_balance(&to).saturating_add(value);
        self.set_balance(to, credited);
        self.released.insert(l2_tx_ref);

        let record = BridgeRecord::withdraw(from, to, value, l2_tx_ref);
        self.records
            .insert(record.id, (record.clone(), BridgeRecordStatus::Released));

        tracing::info!("Withdrawal {} released: {} to {}", l2_tx_ref, value, to);
        Ok(record)
    }

    pub fn l1_balance(&self, address: &Address) -> u128 {
        self.l1_balances.get(address).copied().unwrap_or(0)
    }

    fn set_balance(&mut self, address: Address, amount: u128) {
        if amount == 0 {
            self.l1_balances.remove(&address);
        } else {
            self.l1_balances.insert(address, amount);
        }
    }

    pub fn custody(&self) -> u128 {
        self.custody
    }

    pub fn record(&self, id: &Hash32) -> Option<BridgeRecord> {
        self.records.get(id).map(|(record, _)| record.clone())
    }

    pub fn record_status(&self, id: &Hash32) -> Option<BridgeRecordStatus> {
        self.records.get(id).map(|(_, status)| *status)
    }

    pub fn is_released(&self, l2_tx_ref: &TxHash) -> bool {
        self.released.contains(l2_tx_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> Address {
        Address::user_from_seed("alice")
    }

    fn leaf(tx_ref: TxHash, value: u128) -> WithdrawalLeaf {
        WithdrawalLeaf {
            tx_ref,
            from: alice(),
            value,
            block_height: 3,
        }
    }

    #[test]
    fn test_deposit_locks_custody() {
        let mut bridge = BridgeContract::new([(alice(), 100)]);
        let record = bridge.deposit(alice(), alice(), 60).unwrap();

        assert_eq!(bridge.l1_balance(&alice()), 40);
        assert_eq!(bridge.custody(), 60);
        assert_eq!(bridge.record_status(&record.id), Some(BridgeRecordStatus::Locked));

        assert_eq!(
            bridge.deposit(alice(), alice(), 41),
            Err(BridgeError::InsufficientL1Balance {
                needed: 41,
                available: 40
            })
        );

        // Identical deposits get distinct ids
        let again = bridge.deposit(alice(), alice(), 20).unwrap();
        let third = bridge.deposit(alice(), alice(), 20).unwrap();
        assert_ne!(again.id, third.id);
    }

    #[test]
    fn test_failed_relay_keeps_custody_until_relayed() {
        let mut bridge = BridgeContract::new([(alice(), 100)]);
        let record = bridge.deposit(alice(), alice(), 60).unwrap();

        bridge.mark_relay_failed(&record.id);
        assert_eq!(
            bridge.record_status(&record.id),
            Some(BridgeRecordStatus::RelayFailed)
        );
        assert_eq!(bridge.custody(), 60);

        bridge.mark_relayed(&record.id);
        assert_eq!(bridge.record_status(&record.id), Some(BridgeRecordStatus::Relayed));
        // A relayed record never goes back to failed
        bridge.mark_relay_failed(&record.id);
        assert_eq!(bridge.record_status(&record.id), Some(BridgeRecordStatus::Relayed));
    }

    #[test]
    fn test_withdraw_gated_on_finality() {
        let mut bridge = BridgeContract::new([(alice(), 100)]);
        bridge.deposit(alice(), alice(), 100).unwrap();
        let tx_ref = Hash32([7u8; 32]);

        assert_eq!(
            bridge.withdraw(alice(), alice(), 50, tx_ref, None),
            Err(BridgeError::NotFinalized(tx_ref))
        );
        assert_eq!(
            bridge.withdraw(
                alice(),
                alice(),
                50,
                tx_ref,
                Some((leaf(tx_ref, 50), FinalityStatus::Committed))
            ),
            Err(BridgeError::NotFinalized(tx_ref))
        );
        assert_eq!(
            bridge.withdraw(
                alice(),
                alice(),
                50,
                tx_ref,
                Some((leaf(tx_ref, 50), FinalityStatus::Rejected))
            ),
            Err(BridgeError::FinalityRejected(tx_ref))
        );
        assert_eq!(bridge.custody(), 100);
        assert_eq!(bridge.l1_balance(&alice()), 0);
    }

    #[test]
    fn test_no_double_release() {
        let mut bridge = BridgeContract::new([(alice(), 100)]);
        bridge.deposit(alice(), alice(), 100).unwrap();
        let tx_ref = Hash32([8u8; 32]);
        let verified = Some((leaf(tx_ref, 30), FinalityStatus::Verified));
        let recipient = Address::user_from_seed("l1-wallet");

        let record = bridge
            .withdraw(alice(), recipient, 30, tx_ref, verified.clone())
            .unwrap();
        assert_eq!(bridge.l1_balance(&recipient), 30);
        assert_eq!(bridge.record_status(&record.id), Some(BridgeRecordStatus::Released));

        assert_eq!(
            bridge.withdraw(alice(), recipient, 30, tx_ref, verified),
            Err(BridgeError::AlreadyReleased(tx_ref))
        );
        assert_eq!(bridge.l1_balance(&recipient), 30);
        assert_eq!(bridge.custody(), 70);
    }

    #[test]
    fn test_withdraw_must_match_intent() {
        let mut bridge = BridgeContract::new([(alice(), 100)]);
        bridge.deposit(alice(), alice(), 100).unwrap();
        let tx_ref = Hash32([9u8; 32]);
        let verified = Some((leaf(tx_ref, 30), FinalityStatus::Verified));

        assert_eq!(
            bridge.withdraw(alice(), alice(), 31, tx_ref, verified.clone()),
            Err(BridgeError::WithdrawalMismatch(tx_ref))
        );
        let mallory = Address::user_from_seed("mallory");
        assert_eq!(
            bridge.withdraw(mallory, mallory, 30, tx_ref, verified),
            Err(BridgeError::WithdrawalMismatch(tx_ref))
        );
        assert!(!bridge.is_released(&tx_ref));
    }
}
