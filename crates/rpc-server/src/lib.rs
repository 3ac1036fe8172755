//! RPC Server - JSON-RPC over HTTP for the rollup node
//!
//! Provides:
//! - Submission: sendTransaction, withdrawToL1, releaseWithdrawal
//! - Reads: getReceipt, getBalance, getBlockHeight, getFinalityRecord,
//!   getBridgeRecord, getForceTxStatus, getRollupMode, getHealth
//!
//! The pipeline never depends on this crate; it only holds handles.

pub mod http_server;
pub mod methods;


pub use http_server::{dispatch_method, HttpRpcServer, JsonRpcRequest, JsonRpcResponse};
pub use methods::{RpcContext, RpcError};

/// RPC Server configuration
#[derive(Clone, Debug)]
pub struct RpcServerConfig {
    /// HTTP RPC bind address
    pub http_addr: String,
    /// Enable verbose logging
    pub verbose: bool,
}

impl Default for RpcServerConfig {
    fn default() -> Self {
        Self {
            http_addr: "127.0.0.1:8899".to_string(),
            verbose: false,
        }
    }
}
