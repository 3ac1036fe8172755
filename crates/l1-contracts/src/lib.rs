//! L1 Contracts - settlement layer of the rollup
//!
//! Two contracts, each owned by its own actor:
//! - Rollup: commitments, proof verification, finality records and the
//!   force-inclusion registry with its censorship fallback
//! - Bridge: custody of deposits and finality-gated withdrawals

pub mod actor;
pub mod bridge;
pub mod rollup;

pub use actor::{
    spawn_bridge, spawn_rollup, BridgeHandle, BridgeOutbox, L1Error, RollupEvent, RollupHandle,
    RollupOutbox, DEFAULT_CALL_TIMEOUT_MS,
};
pub use bridge::{BridgeContract, BridgeError};
pub use rollup::{
    FallbackEvent, FinalityRecord, RollupConfig, RollupContract, RollupError, RollupMode,
    VerifyOutcome, DEFAULT_FORCE_INCLUSION_WINDOW, DEFAULT_MAX_HEAD_LEAD,
};
