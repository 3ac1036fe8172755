//! RPC Methods - JSON-RPC method handlers
//!
//! Submission goes through the sequencer's `TxSubmitter`; everything else is a
//! read-only projection of the chain view, the receipt book or the L1 actors.

use aggregator::AggregatorHandle;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use l1_contracts::{BridgeHandle, FallbackEvent, FinalityRecord, L1Error, RollupHandle, RollupMode};
use l2_runtime::{ChainStore, ChainView, ReceiptBook, SequencerError, TxSubmitter};
use rollup_types::{
    Address, BatchId, BridgeRecord, BridgeRecordStatus, ForceTxStatus, Hash32, Receipt,
    Transaction, TxLifecycle,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

/// RPC context shared across handlers
pub struct RpcContext {
    pub submitter: TxSubmitter,
    pub receipts: Arc<ReceiptBook>,
    pub chain: watch::Receiver<ChainView>,
    pub rollup: RollupHandle,
    pub bridge: BridgeHandle,
    pub store: Option<Arc<ChainStore>>,
    pub aggregator: Option<AggregatorHandle>,
}

// ============ Request/Response Types ============

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendTransactionRequest {
    pub from: Address,
    pub to: Address,
    pub value: u128,
    #[serde(default)]
    pub fees: Option<u128>,
    #[serde(default)]
    pub gas_price: Option<u128>,
    /// Base64 encoded
    #[serde(default)]
    pub calldata: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WithdrawRequest {
    pub from: Address,
    pub value: u128,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseWithdrawalRequest {
    pub from: Address,
    pub to: Address,
    pub value: u128,
    pub tx_ref: Hash32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReceiptResponse {
    pub receipt: Receipt,
    /// Unknown once the node restarted; the receipt comes from storage then
    pub lifecycle: Option<TxLifecycle>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BalanceResponse {
    pub address: Address,
    pub l2: u128,
    pub height: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub l1: Option<u128>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BridgeRecordResponse {
    pub record: BridgeRecord,
    pub status: BridgeRecordStatus,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollupModeResponse {
    pub mode: RollupMode,
    pub fallback_events: Vec<FallbackEvent>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub height: u64,
    pub pending_txs: usize,
    pub pending_force_txs: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outstanding_batches: Option<usize>,
    #[serde(default)]
    pub stalled_batches: Vec<BatchId>,
}

// ============ RPC Handlers ============

/// Handle sendTransaction RPC method
pub fn handle_send_transaction(
    ctx: &RpcContext,
    params: SendTransactionRequest,
) -> Result<Hash32, RpcError> {
    let mut tx = Transaction::transfer(params.from, params.to, params.value);
    tx.fees = params.fees;
    tx.gas_price = params.gas_price;
    if let Some(calldata) = params.calldata {
        let bytes = BASE64
            .decode(&calldata)
            .map_err(|_| RpcError::InvalidParams("Invalid base64 calldata".to_string()))?;
        tx = tx.with_calldata(bytes);
    }

    let handle = ctx.submitter.submit(tx)?;
    Ok(handle.tx_hash())
}

/// Handle withdrawToL1 RPC method: the L2 half of a withdrawal
pub fn handle_withdraw_to_l1(ctx: &RpcContext, params: WithdrawRequest) -> Result<Hash32, RpcError> {
    let handle = ctx.submitter.withdraw(params.from, params.value)?;
    Ok(handle.tx_hash())
}

/// Handle releaseWithdrawal RPC method: the L1 half, once the batch is verified
pub async fn handle_release_withdrawal(
    ctx: &RpcContext,
    params: ReleaseWithdrawalRequest,
) -> Result<BridgeRecord, RpcError> {
    Ok(ctx
        .bridge
        .withdraw(params.from, params.to, params.value, params.tx_ref)
        .await?)
}

/// Handle getReceipt RPC method
pub fn handle_get_receipt(ctx: &RpcContext, tx_ref: &Hash32) -> Result<ReceiptResponse, RpcError> {
    if let Some(receipt) = ctx.receipts.get(tx_ref) {
        return Ok(ReceiptResponse {
            receipt,
            lifecycle: ctx.receipts.lifecycle(tx_ref),
        });
    }

    let stored = match &ctx.store {
        Some(store) => store
            .load_receipt(tx_ref)
            .map_err(|e| RpcError::InternalError(e.to_string()))?,
        None => None,
    };
    stored
        .map(|receipt| ReceiptResponse {
            receipt,
            lifecycle: None,
        })
        .ok_or_else(|| RpcError::NotFound(format!("transaction {}", tx_ref)))
}

/// Handle getBalance RPC method
pub async fn handle_get_balance(
    ctx: &RpcContext,
    address: Address,
    include_l1: bool,
) -> Result<BalanceResponse, RpcError> {
    let (height, l2) = {
        let view = ctx.chain.borrow();
        (view.head.height, view.state.balance(&address))
    };
    let l1 = if include_l1 {
        Some(ctx.bridge.l1_balance(address).await?)
    } else {
        None
    };

    Ok(BalanceResponse {
        address,
        l2,
        height,
        l1,
    })
}

/// Handle getBlockHeight RPC method
pub fn handle_get_block_height(ctx: &RpcContext) -> u64 {
    ctx.chain.borrow().head.height
}

/// Handle getFinalityRecord RPC method
pub async fn handle_get_finality_record(
    ctx: &RpcContext,
    batch_id: BatchId,
) -> Result<FinalityRecord, RpcError> {
    Ok(ctx.rollup.finality_record(batch_id).await?)
}

/// Handle getBridgeRecord RPC method
pub async fn handle_get_bridge_record(
    ctx: &RpcContext,
    id: Hash32,
) -> Result<BridgeRecordResponse, RpcError> {
    ctx.bridge
        .record(id)
        .await?
        .map(|(record, status)| BridgeRecordResponse { record, status })
        .ok_or_else(|| RpcError::NotFound(format!("bridge record {}", id)))
}

/// Handle getForceTxStatus RPC method
pub async fn handle_get_force_tx_status(
    ctx: &RpcContext,
    tx_ref: Hash32,
) -> Result<ForceTxStatus, RpcError> {
    ctx.rollup
        .force_status(tx_ref)
        .await?
        .ok_or_else(|| RpcError::NotFound(format!("force transaction {}", tx_ref)))
}

/// Handle getRollupMode RPC method
pub async fn handle_get_rollup_mode(ctx: &RpcContext) -> Result<RollupModeResponse, RpcError> {
    let (mode, fallback_events) = ctx.rollup.mode().await?;
    Ok(RollupModeResponse {
        mode,
        fallback_events,
    })
}

/// Handle getHealth RPC method
pub async fn handle_get_health(ctx: &RpcContext) -> Result<HealthResponse, RpcError> {
    let height = handle_get_block_height(ctx);
    let (pending_txs, pending_force_txs) = ctx.submitter.pool_sizes();

    let mut response = HealthResponse {
        status: "ok".to_string(),
        height,
        pending_txs,
        pending_force_txs,
        outstanding_batches: None,
        stalled_batches: Vec::new(),
    };

    if let Some(aggregator) = &ctx.aggregator {
        match aggregator.status().await {
            Ok(status) => {
                if !status.stalled.is_empty() {
                    response.status = "degraded".to_string();
                }
                response.outstanding_batches = Some(status.outstanding);
                response.stalled_batches = status.stalled;
            }
            Err(_) => response.status = "aggregator stopped".to_string(),
        }
    }
    Ok(response)
}

// ============ Error Types ============

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("Invalid params: {0}")]
    InvalidParams(String),
    #[error("Internal error: {0}")]
    InternalError(String),
    #[error("Method not found: {0}")]
    MethodNotFound(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Rejected: {0}")]
    Submission(#[from] SequencerError),
    #[error("L1: {0}")]
    L1(#[from] L1Error),
}
