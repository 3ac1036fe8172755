//! HTTP JSON-RPC Server
//!
//! Provides HTTP endpoint for JSON-RPC methods. Parameters are positional.

use crate::methods::{
    handle_get_balance, handle_get_block_height, handle_get_bridge_record,
    handle_get_finality_record, handle_get_force_tx_status, handle_get_health,
    handle_get_receipt, handle_get_rollup_mode, handle_release_withdrawal,
    handle_send_transaction, handle_withdraw_to_l1, RpcContext, RpcError,
    ReleaseWithdrawalRequest, SendTransactionRequest, WithdrawRequest,
};
use axum::{
    extract::State,
    http::{header, Method},
    routing::post,
    Json, Router,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

/// JSON-RPC request
#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// JSON-RPC response
#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
}

/// HTTP RPC Server
pub struct HttpRpcServer {
    context: Arc<RpcContext>,
}

impl HttpRpcServer {
    /// Create a new HTTP RPC server
    pub fn new(context: Arc<RpcContext>) -> Self {
        Self { context }
    }

    /// Create the Axum router
    pub fn router(self) -> Router {
        // CORS layer to allow browser clients
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE, header::ACCEPT]);

        Router::new()
            .route("/", post(handle_rpc))
            .layer(cors)
            .with_state(self.context)
    }

    /// Run the server
    pub async fn run(self, addr: &str) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("HTTP RPC server listening on {}", addr);

        axum::serve(listener, self.router()).await?;
        Ok(())
    }
}

/// Handle JSON-RPC request
pub async fn handle_rpc(
    State(context): State<Arc<RpcContext>>,
    Json(request): Json<JsonRpcRequest>,
) -> Json<JsonRpcResponse> {
    if request.jsonrpc != "2.0" {
        return Json(error_response(
            request.id,
            &RpcError::InvalidParams(format!("unsupported jsonrpc version {}", request.jsonrpc)),
        ));
    }

    let response = match dispatch_method(&context, &request.method, request.params).await {
        Ok(value) => JsonRpcResponse {
            jsonrpc: "2.0".to_string(),
            id: request.id,
            result: Some(value),
            error: None,
        },
        Err(e) => {
            tracing::debug!("RPC {} failed: {}", request.method, e);
            error_response(request.id, &e)
        }
    };

    Json(response)
}

fn error_response(id: Value, e: &RpcError) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: "2.0".to_string(),
        id,
        result: None,
        error: Some(JsonRpcError {
            code: error_code(e),
            message: e.to_string(),
        }),
    }
}

/// Positional parameter `index`
fn param<T: DeserializeOwned>(params: &[Value], index: usize, name: &str) -> Result<T, RpcError> {
    let value = params
        .get(index)
        .cloned()
        .ok_or_else(|| RpcError::InvalidParams(format!("Missing {}", name)))?;
    serde_json::from_value(value)
        .map_err(|e| RpcError::InvalidParams(format!("Invalid {}: {}", name, e)))
}

fn to_value<T: Serialize>(value: T) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(|e| RpcError::InternalError(e.to_string()))
}

/// Dispatch to appropriate method handler
pub async fn dispatch_method(ctx: &RpcContext, method: &str, params: Value) -> Result<Value, RpcError> {
    tracing::debug!("RPC method called: {}", method);
    let params: Vec<Value> = match params {
        Value::Null => Vec::new(),
        Value::Array(params) => params,
        other => vec![other],
    };

    match method {
        "sendTransaction" => {
            let request: SendTransactionRequest = param(&params, 0, "transaction")?;
            let tx_ref = handle_send_transaction(ctx, request)?;
            Ok(json!(tx_ref))
        }

        "withdrawToL1" => {
            let request = WithdrawRequest {
                from: param(&params, 0, "from")?,
                value: param(&params, 1, "value")?,
            };
            let tx_ref = handle_withdraw_to_l1(ctx, request)?;
            Ok(json!(tx_ref))
        }

        "releaseWithdrawal" => {
            let request: ReleaseWithdrawalRequest = param(&params, 0, "withdrawal")?;
            to_value(handle_release_withdrawal(ctx, request).await?)
        }

        "getReceipt" => {
            let tx_ref = param(&params, 0, "tx hash")?;
            to_value(handle_get_receipt(ctx, &tx_ref)?)
        }

        "getBalance" => {
            let address = param(&params, 0, "address")?;
            let include_l1 = params
                .get(1)
                .and_then(|v| v.get("includeL1"))
                .and_then(Value::as_bool)
                .unwrap_or(false);
            to_value(handle_get_balance(ctx, address, include_l1).await?)
        }

        "getBlockHeight" => Ok(json!(handle_get_block_height(ctx))),

        "getFinalityRecord" => {
            let batch_id = param(&params, 0, "batch id")?;
            to_value(handle_get_finality_record(ctx, batch_id).await?)
        }

        "getBridgeRecord" => {
            let id = param(&params, 0, "record id")?;
            to_value(handle_get_bridge_record(ctx, id).await?)
        }

        "getForceTxStatus" => {
            let tx_ref = param(&params, 0, "tx hash")?;
            to_value(handle_get_force_tx_status(ctx, tx_ref).await?)
        }

        "getRollupMode" => to_value(handle_get_rollup_mode(ctx).await?),

        "getHealth" => to_value(handle_get_health(ctx).await?),

        "getVersion" => Ok(json!({
            "rollup-node": env!("CARGO_PKG_VERSION"),
        })),

        _ => Err(RpcError::MethodNotFound(method.to_string())),
    }
}

/// Map error to JSON-RPC error code
pub fn error_code(error: &RpcError) -> i32 {
    match error {
        RpcError::InvalidParams(_) => -32602,
        RpcError::MethodNotFound(_) => -32601,
        RpcError::InternalError(_) => -32603,
        RpcError::NotFound(_) => -32001,
        RpcError::Submission(_) => -32002,
        RpcError::L1(e) if e.is_transport() => -32004,
        RpcError::L1(_) => -32003,
    }
}
