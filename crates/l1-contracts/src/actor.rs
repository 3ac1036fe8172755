//! L1 actors
//!
//! Each contract is owned by one tokio task. Callers talk to it through a
//! cloneable handle: every call is a command with a oneshot reply, bounded by
//! a call timeout. Transport failures (`Unavailable`, `Timeout`) are distinct
//! from contract errors so callers know what is safe to retry.
//!
//! Contracts push their asynchronous output (force registrations, locked
//! deposits) into unbounded outboxes drained by the relayer.

use crate::{
    bridge::{BridgeContract, BridgeError},
    rollup::{
        FallbackEvent, FinalityRecord, RollupConfig, RollupContract, RollupError, RollupMode,
        VerifyOutcome,
    },
};
use rollup_types::{
    Address, Batch, BatchId, BridgeRecord, BridgeRecordStatus, CensorshipTimeout, Commitment,
    FinalityStatus, ForceTxEntry, ForceTxStatus, Hash32, Proof, Transaction, TxHash,
    WithdrawalLeaf,
};
use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};

/// Default bound on a single L1 call
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 2_000;

const COMMAND_QUEUE: usize = 256;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum L1Error {
    #[error(transparent)]
    Rollup(#[from] RollupError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error("L1 actor unavailable")]
    Unavailable,

    #[error("L1 call timed out after {0:?}")]
    Timeout(Duration),
}

impl L1Error {
    /// Failure of the call itself rather than a contract decision
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Unavailable | Self::Timeout(_))
    }
}

/// Rollup contract notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollupEvent {
    Committed(Commitment),
    Finalized {
        batch_id: BatchId,
        status: FinalityStatus,
        tx_refs: Vec<TxHash>,
    },
    ForceTxRegistered(ForceTxEntry),
    Fallback(FallbackEvent),
}

/// Command channel plus call policy, shared by all handle clones
struct Link<C> {
    sender: mpsc::Sender<C>,
    call_timeout: Duration,
    /// Calls to fail with `Unavailable` before reaching the actor
    injected_faults: Arc<AtomicU32>,
}

impl<C> Clone for Link<C> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            call_timeout: self.call_timeout,
            injected_faults: self.injected_faults.clone(),
        }
    }
}

impl<C> Link<C> {
    fn new(sender: mpsc::Sender<C>, call_timeout: Duration) -> Self {
        Self {
            sender,
            call_timeout,
            injected_faults: Arc::new(AtomicU32::new(0)),
        }
    }

    async fn call<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> C) -> Result<T, L1Error> {
        let faulted = self
            .injected_faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if faulted {
            return Err(L1Error::Unavailable);
        }

        let (reply, response) = oneshot::channel();
        let round_trip = async {
            self.sender
                .send(command(reply))
                .await
                .map_err(|_| L1Error::Unavailable)?;
            response.await.map_err(|_| L1Error::Unavailable)
        };
        tokio::time::timeout(self.call_timeout, round_trip)
            .await
            .map_err(|_| L1Error::Timeout(self.call_timeout))?
    }

    fn inject_faults(&self, count: u32) {
        self.injected_faults.store(count, Ordering::SeqCst);
    }
}

enum RollupCommand {
    Commit {
        batch: Arc<Batch>,
        reply: oneshot::Sender<Result<Commitment, RollupError>>,
    },
    Verify {
        batch_id: BatchId,
        proof: Proof,
        reply: oneshot::Sender<Result<VerifyOutcome, RollupError>>,
    },
    RegisterForceTx {
        tx: Transaction,
        reply: oneshot::Sender<Result<ForceTxEntry, RollupError>>,
    },
    AnchorForceTx {
        tx_ref: TxHash,
        l2_head: u64,
        reply: oneshot::Sender<Result<ForceTxEntry, RollupError>>,
    },
    ReportCensorship {
        report: CensorshipTimeout,
        reply: oneshot::Sender<Result<bool, RollupError>>,
    },
    FinalityRecord {
        batch_id: BatchId,
        reply: oneshot::Sender<FinalityRecord>,
    },
    Withdrawal {
        tx_ref: TxHash,
        reply: oneshot::Sender<Option<(WithdrawalLeaf, FinalityStatus)>>,
    },
    ForceStatus {
        tx_ref: TxHash,
        reply: oneshot::Sender<Option<ForceTxStatus>>,
    },
    TxLocation {
        tx_ref: TxHash,
        reply: oneshot::Sender<Option<(BatchId, u64)>>,
    },
    Mode {
        reply: oneshot::Sender<(RollupMode, Vec<FallbackEvent>)>,
    },
}

/// Handle on the rollup contract actor
#[derive(Clone)]
pub struct RollupHandle {
    link: Link<RollupCommand>,
    events: broadcast::Sender<RollupEvent>,
}

/// Asynchronous output of the rollup contract
pub struct RollupOutbox {
    /// Registered force transactions, for the relayer
    pub force_txs: mpsc::UnboundedReceiver<ForceTxEntry>,
}

impl RollupHandle {
    pub async fn commit(&self, batch: Arc<Batch>) -> Result<Commitment, L1Error> {
        Ok(self
            .link
            .call(|reply| RollupCommand::Commit { batch, reply })
            .await??)
    }

    pub async fn verify(&self, batch_id: BatchId, proof: Proof) -> Result<VerifyOutcome, L1Error> {
        Ok(self
            .link
            .call(|reply| RollupCommand::Verify {
                batch_id,
                proof,
                reply,
            })
            .await??)
    }

    /// L1 user entry point for force inclusion
    pub async fn register_force_tx(&self, tx: Transaction) -> Result<ForceTxEntry, L1Error> {
        Ok(self
            .link
            .call(|reply| RollupCommand::RegisterForceTx { tx, reply })
            .await??)
    }

    /// Fix the deadline of a relayed force tx against the L2 head
    pub async fn anchor_force_tx(&self, tx_ref: TxHash, l2_head: u64) -> Result<ForceTxEntry, L1Error> {
        Ok(self
            .link
            .call(|reply| RollupCommand::AnchorForceTx {
                tx_ref,
                l2_head,
                reply,
            })
            .await??)
    }

    pub async fn report_censorship(&self, report: CensorshipTimeout) -> Result<bool, L1Error> {
        Ok(self
            .link
            .call(|reply| RollupCommand::ReportCensorship { report, reply })
            .await??)
    }

    pub async fn finality_record(&self, batch_id: BatchId) -> Result<FinalityRecord, L1Error> {
        self.link
            .call(|reply| RollupCommand::FinalityRecord { batch_id, reply })
            .await
    }

    pub async fn withdrawal(
        &self,
        tx_ref: TxHash,
    ) -> Result<Option<(WithdrawalLeaf, FinalityStatus)>, L1Error> {
        self.link
            .call(|reply| RollupCommand::Withdrawal { tx_ref, reply })
            .await
    }

    pub async fn force_status(&self, tx_ref: TxHash) -> Result<Option<ForceTxStatus>, L1Error> {
        self.link
            .call(|reply| RollupCommand::ForceStatus { tx_ref, reply })
            .await
    }

    pub async fn tx_location(&self, tx_ref: TxHash) -> Result<Option<(BatchId, u64)>, L1Error> {
        self.link
            .call(|reply| RollupCommand::TxLocation { tx_ref, reply })
            .await
    }

    /// Current mode and every fallback event recorded so far
    pub async fn mode(&self) -> Result<(RollupMode, Vec<FallbackEvent>), L1Error> {
        self.link.call(|reply| RollupCommand::Mode { reply }).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RollupEvent> {
        self.events.subscribe()
    }

    /// Make the next `count` calls through any clone of this handle fail with
    /// `Unavailable`
    pub fn inject_faults(&self, count: u32) {
        self.link.inject_faults(count);
    }
}

/// Start the rollup contract actor
pub fn spawn_rollup(config: RollupConfig, call_timeout: Duration) -> (RollupHandle, RollupOutbox) {
    let (sender, mut commands) = mpsc::channel(COMMAND_QUEUE);
    let (force_tx, force_txs) = mpsc::unbounded_channel();
    let (events, _) = broadcast::channel(256);
    let handle = RollupHandle {
        link: Link::new(sender, call_timeout),
        events: events.clone(),
    };

    tokio::spawn(async move {
        let mut contract = RollupContract::new(config);
        tracing::info!("Rollup contract actor started");

        while let Some(command) = commands.recv().await {
            let fallbacks_before = contract.fallback_events().len();

            match command {
                RollupCommand::Commit { batch, reply } => {
                    let result = contract.commit(&batch);
                    if let Ok(commitment) = &result {
                        let _ = events.send(RollupEvent::Committed(*commitment));
                    }
                    let _ = reply.send(result);
                }
                RollupCommand::Verify {
                    batch_id,
                    proof,
                    reply,
                } => {
                    let result = contract.verify(batch_id, &proof);
                    if let Ok(outcome) = &result {
                        let _ = events.send(RollupEvent::Finalized {
                            batch_id,
                            status: outcome.status,
                            tx_refs: outcome.tx_refs.clone(),
                        });
                    }
                    let _ = reply.send(result);
                }
                RollupCommand::RegisterForceTx { tx, reply } => {
                    let result = contract.register_force_tx(tx);
                    if let Ok(entry) = &result {
                        if force_tx.send(entry.clone()).is_err() {
                            tracing::warn!("Force tx outbox closed, {} not relayed", entry.hash());
                        }
                        let _ = events.send(RollupEvent::ForceTxRegistered(entry.clone()));
                    }
                    let _ = reply.send(result);
                }
                RollupCommand::AnchorForceTx {
                    tx_ref,
                    l2_head,
                    reply,
                } => {
                    let _ = reply.send(contract.anchor_force_tx(tx_ref, l2_head));
                }
                RollupCommand::ReportCensorship { report, reply } => {
                    let _ = reply.send(contract.report_censorship(&report));
                }
                RollupCommand::FinalityRecord { batch_id, reply } => {
                    let _ = reply.send(contract.finality_record(batch_id));
                }
                RollupCommand::Withdrawal { tx_ref, reply } => {
                    let _ = reply.send(contract.withdrawal(&tx_ref));
                }
                RollupCommand::ForceStatus { tx_ref, reply } => {
                    let _ = reply.send(contract.force_status(&tx_ref));
                }
                RollupCommand::TxLocation { tx_ref, reply } => {
                    let _ = reply.send(contract.tx_location(&tx_ref));
                }
                RollupCommand::Mode { reply } => {
                    let _ = reply.send((contract.mode(), contract.fallback_events().to_vec()));
                }
            }

            for event in &contract.fallback_events()[fallbacks_before..] {
                let _ = events.send(RollupEvent::Fallback(event.clone()));
            }
        }

        tracing::info!("Rollup contract actor stopped");
    });

    (handle, RollupOutbox { force_txs })
}

enum BridgeCommand {
    Deposit {
        from: Address,
        to: Address,
        value: u128,
        reply: oneshot::Sender<Result<BridgeRecord, BridgeError>>,
    },
    MarkRelayed {
        id: Hash32,
        reply: oneshot::Sender<()>,
    },
    MarkRelayFailed {
        id: Hash32,
        reply: oneshot::Sender<()>,
    },
    Withdraw {
        from: Address,
        to: Address,
        value: u128,
        l2_tx_ref: TxHash,
        reply: oneshot::Sender<Result<BridgeRecord, L1Error>>,
    },
    Record {
        id: Hash32,
        reply: oneshot::Sender<Option<(BridgeRecord, BridgeRecordStatus)>>,
    },
    L1Balance {
        address: Address,
        reply: oneshot::Sender<u128>,
    },
    Custody {
        reply: oneshot::Sender<u128>,
    },
}

/// Handle on the bridge contract actor
#[derive(Clone)]
pub struct BridgeHandle {
    link: Link<BridgeCommand>,
}

/// Asynchronous output of the bridge contract
pub struct BridgeOutbox {
    /// Locked deposits awaiting relay to L2
    pub deposits: mpsc::UnboundedReceiver<BridgeRecord>,
}

impl BridgeHandle {
    pub async fn deposit(&self, from: Address, to: Address, value: u128) -> Result<BridgeRecord, L1Error> {
        Ok(self
            .link
            .call(|reply| BridgeCommand::Deposit {
                from,
                to,
                value,
                reply,
            })
            .await??)
    }

    pub async fn mark_relayed(&self, id: Hash32) -> Result<(), L1Error> {
        self.link
            .call(|reply| BridgeCommand::MarkRelayed { id, reply })
            .await
    }

    pub async fn mark_relay_failed(&self, id: Hash32) -> Result<(), L1Error> {
        self.link
            .call(|reply| BridgeCommand::MarkRelayFailed { id, reply })
            .await
    }

    pub async fn withdraw(
        &self,
        from: Address,
        to: Address,
        value: u128,
        l2_tx_ref: TxHash,
    ) -> Result<BridgeRecord, L1Error> {
        self.link
            .call(|reply| BridgeCommand::Withdraw {
                from,
                to,
                value,
                l2_tx_ref,
                reply,
            })
            .await?
    }

    pub async fn record(&self, id: Hash32) -> Result<Option<(BridgeRecord, BridgeRecordStatus)>, L1Error> {
        self.link
            .call(|reply| BridgeCommand::Record { id, reply })
            .await
    }

    pub async fn record_status(&self, id: Hash32) -> Result<Option<BridgeRecordStatus>, L1Error> {
        Ok(self.record(id).await?.map(|(_, status)| status))
    }

    pub async fn l1_balance(&self, address: Address) -> Result<u128, L1Error> {
        self.link
            .call(|reply| BridgeCommand::L1Balance { address, reply })
            .await
    }

    pub async fn custody(&self) -> Result<u128, L1Error> {
        self.link.call(|reply| BridgeCommand::Custody { reply }).await
    }

    pub fn inject_faults(&self, count: u32) {
        self.link.inject_faults(count);
    }
}

/// Start the bridge contract actor. Withdrawals consult `rollup` for finality.
pub fn spawn_bridge(
    genesis: Vec<(Address, u128)>,
    rollup: RollupHandle,
    call_timeout: Duration,
) -> (BridgeHandle, BridgeOutbox) {
    let (sender, mut commands) = mpsc::channel(COMMAND_QUEUE);
    let (deposit_tx, deposits) = mpsc::unbounded_channel();
    let handle = BridgeHandle {
        link: Link::new(sender, call_timeout),
    };

    tokio::spawn(async move {
        let mut contract = BridgeContract::new(genesis);
        tracing::info!("Bridge contract actor started");

        while let Some(command) = commands.recv().await {
            match command {
                BridgeCommand::Deposit {
                    from,
                    to,
                    value,
                    reply,
                } => {
                    let result = contract.deposit(from, to, value);
                    if let Ok(record) = &result {
                        if deposit_tx.send(record.clone()).is_err() {
                            tracing::warn!("Deposit outbox closed, {} not relayed", record.id);
                        }
                    }
                    let _ = reply.send(result);
                }
                BridgeCommand::MarkRelayed { id, reply } => {
                    contract.mark_relayed(&id);
                    let _ = reply.send(());
                }
                BridgeCommand::MarkRelayFailed { id, reply } => {
                    contract.mark_relay_failed(&id);
                    let _ = reply.send(());
                }
                BridgeCommand::Withdraw {
                    from,
                    to,
                    value,
                    l2_tx_ref,
                    reply,
                } => {
                    let result = match rollup.withdrawal(l2_tx_ref).await {
                        Ok(proof) => contract
                            .withdraw(from, to, value, l2_tx_ref, proof)
                            .map_err(L1Error::from),
                        Err(e) => Err(e),
                    };
                    let _ = reply.send(result);
                }
                BridgeCommand::Record { id, reply } => {
                    let record = contract
                        .record(&id)
                        .zip(contract.record_status(&id));
                    let _ = reply.send(record);
                }
                BridgeCommand::L1Balance { address, reply } => {
                    let _ = reply.send(contract.l1_balance(&address));
                }
                BridgeCommand::Custody { reply } => {
                    let _ = reply.send(contract.custody());
                }
            }
        }

        tracing::info!("Bridge contract actor stopped");
    });

    (handle, BridgeOutbox { deposits })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollup_types::{certify, Block, ExecutionStatus, StateRef};

    fn timeout() -> Duration {
        Duration::from_millis(DEFAULT_CALL_TIMEOUT_MS)
    }

    fn batch_with(id: BatchId, height: u64, txs: Vec<Transaction>) -> Arc<Batch> {
        let results = txs.iter().map(|_| ExecutionStatus::Success).collect();
        Arc::new(Batch {
            id,
            blocks: vec![Block {
                height,
                parent_ref: Hash32::ZERO,
                txs,
                results,
                state_ref: StateRef {
                    height,
                    root: Hash32::ZERO,
                },
                timestamp_ms: 0,
            }],
        })
    }

    #[tokio::test]
    async fn test_withdrawal_waits_for_verification() {
        let alice = Address::user_from_seed("alice");
        let (rollup, _rollup_outbox) = spawn_rollup(RollupConfig::default(), timeout());
        let (bridge, mut bridge_outbox) = spawn_bridge(vec![(alice, 100)], rollup.clone(), timeout());
        let mut events = rollup.subscribe();

        let record = bridge.deposit(alice, alice, 100).await.unwrap();
        assert_eq!(bridge_outbox.deposits.recv().await.unwrap(), record);

        let intent = Transaction::withdraw_intent(alice, 60);
        let batch = batch_with(1, 1, vec![intent.clone()]);

        assert_eq!(
            bridge.withdraw(alice, alice, 60, intent.hash()).await,
            Err(L1Error::Bridge(BridgeError::NotFinalized(intent.hash())))
        );

        rollup.commit(batch.clone()).await.unwrap();
        assert_eq!(
            bridge.withdraw(alice, alice, 60, intent.hash()).await,
            Err(L1Error::Bridge(BridgeError::NotFinalized(intent.hash())))
        );

        let proof = Proof {
            batch_id: 1,
            certificate: certify(1, &batch.digest()),
        };
        rollup.verify(1, proof).await.unwrap();
        bridge.withdraw(alice, alice, 60, intent.hash()).await.unwrap();
        assert_eq!(bridge.l1_balance(alice).await.unwrap(), 60);
        assert_eq!(bridge.custody().await.unwrap(), 40);

        assert!(matches!(events.recv().await.unwrap(), RollupEvent::Committed(_)));
        assert!(matches!(
            events.recv().await.unwrap(),
            RollupEvent::Finalized {
                batch_id: 1,
                status: FinalityStatus::Verified,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_injected_faults_are_transport_errors() {
        let (rollup, _outbox) = spawn_rollup(RollupConfig::default(), timeout());
        rollup.inject_faults(1);

        let err = rollup.finality_record(1).await.unwrap_err();
        assert!(err.is_transport());

        let record = rollup.finality_record(1).await.unwrap();
        assert_eq!(record.status, FinalityStatus::Uncommitted);
    }

    #[tokio::test]
    async fn test_force_registration_reaches_outbox() {
        let (rollup, mut outbox) = spawn_rollup(RollupConfig::default(), timeout());
        let tx = Transaction::transfer(
            Address::user_from_seed("carol"),
            Address::user_from_seed("dave"),
            5,
        );

        let entry = rollup.register_force_tx(tx).await.unwrap();
        assert_eq!(outbox.force_txs.recv().await.unwrap(), entry);
        assert_eq!(
            rollup.force_status(entry.hash()).await.unwrap(),
            Some(ForceTxStatus::Pending)
        );

        let report = CensorshipTimeout {
            tx_ref: entry.hash(),
            deadline: entry.deadline,
            observed_height: entry.deadline + 1,
        };
        assert!(rollup.report_censorship(report).await.unwrap());
        let (mode, events) = rollup.mode().await.unwrap();
        assert_eq!(mode, RollupMode::Censored);
        assert_eq!(events.len(), 1);
    }
}
