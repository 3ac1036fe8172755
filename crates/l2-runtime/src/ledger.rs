//! Versioned ledger storage
//!
//! The ledger keeps one immutable snapshot per L2 block. Only the sequencer owns
//! a `LedgerStore`; other components see `Arc<LedgerState>` snapshots that ride
//! along with block updates and never mutate them.

use rollup_types::{Address, FailureReason, Hash32, StateRef};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, sync::Arc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("snapshot for height {got} does not extend head {head}")]
    NonSequential { head: u64, got: u64 },
}

/// Balances plus an opaque storage blob
///
/// Zero balances are not stored, so two states with the same balances always
/// have the same root.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerState {
    balances: BTreeMap<Address, u128>,
    storage: Vec<u8>,
}

impl LedgerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a genesis state from initial balances
    pub fn with_balances(balances: impl IntoIterator<Item = (Address, u128)>) -> Self {
        let mut state = Self::new();
        for (address, amount) in balances {
            if amount > 0 {
                state.balances.insert(address, amount);
            }
        }
        state
    }

    /// Get a balance (0 for unknown accounts)
    pub fn balance(&self, address: &Address) -> u128 {
        self.balances.get(address).copied().unwrap_or(0)
    }

    pub fn balances(&self) -> impl Iterator<Item = (&Address, &u128)> {
        self.balances.iter()
    }

    pub fn account_count(&self) -> usize {
        self.balances.len()
    }

    pub fn storage(&self) -> &[u8] {
        &self.storage
    }

    pub fn set_storage(&mut self, storage: Vec<u8>) {
        self.storage = storage;
    }

    /// Add `amount` to an account
    pub fn credit(&mut self, address: Address, amount: u128) -> Result<(), FailureReason> {
        let updated = self
            .balance(&address)
            .checked_add(amount)
            .ok_or(FailureReason::BalanceOverflow)?;
        self.put(address, updated);
        Ok(())
    }

    /// Remove `amount` from an account
    pub fn debit(&mut self, address: Address, amount: u128) -> Result<(), FailureReason> {
        let available = self.balance(&address);
        let updated = available
            .checked_sub(amount)
            .ok_or(FailureReason::InsufficientBalance {
                needed: amount,
                available,
            })?;
        self.put(address, updated);
        Ok(())
    }

    fn put(&mut self, address: Address, amount: u128) {
        if amount == 0 {
            self.balances.remove(&address);
        } else {
            self.balances.insert(address, amount);
        }
    }

    /// Root over sorted balances and the storage blob
    pub fn root(&self) -> Hash32 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"rollup/state/v1");
        hasher.update(&(self.balances.len() as u64).to_le_bytes());
        for (address, amount) in &self.balances {
            hasher.update(address.to_string().as_bytes());
            hasher.update(&amount.to_le_bytes());
        }
        hasher.update(&(self.storage.len() as u64).to_le_bytes());
        hasher.update(&self.storage);
        hasher.finalize().into()
    }
}

/// Snapshot history, one entry per block height
pub struct LedgerStore {
    head_height: u64,
    head: Arc<LedgerState>,
    history: BTreeMap<u64, Arc<LedgerState>>,
    /// How many snapshots to keep in memory
    retention: usize,
}

impl LedgerStore {
    /// Start from a genesis state at height 0
    pub fn new(genesis: LedgerState, retention: usize) -> Self {
        Self::from_snapshot(0, genesis, retention)
    }

    /// Resume from a persisted snapshot
    pub fn from_snapshot(height: u64, state: LedgerState, retention: usize) -> Self {
        let head = Arc::new(state);
        let mut history = BTreeMap::new();
        history.insert(height, head.clone());
        Self {
            head_height: height,
            head,
            history,
            retention: retention.max(1),
        }
    }

    /// Latest snapshot and its height
    pub fn latest(&self) -> (u64, Arc<LedgerState>) {
        (self.head_height, self.head.clone())
    }

    pub fn height(&self) -> u64 {
        self.head_height
    }

    /// Snapshot at a given height, if still retained
    pub fn snapshot(&self, height: u64) -> Option<Arc<LedgerState>> {
        self.history.get(&height).cloned()
    }

    /// Record the state produced by block `height`
    pub fn commit(&mut self, height: u64, state: LedgerState) -> Result<StateRef, LedgerError> {
        if height != self.head_height + 1 {
            return Err(LedgerError::NonSequential {
                head: self.head_height,
                got: height,
            });
        }

        let root = state.root();
        let state = Arc::new(state);
        self.history.insert(height, state.clone());
        self.head = state;
        self.head_height = height;

        while self.history.len() > self.retention {
            self.history.pop_first();
        }

        Ok(StateRef { height, root })
    }
}
