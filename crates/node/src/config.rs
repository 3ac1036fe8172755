//! Node Configuration

use aggregator::{AggregatorConfig, BatchPolicy};
use anyhow::Context;
use l1_contracts::{RollupConfig, DEFAULT_CALL_TIMEOUT_MS, DEFAULT_FORCE_INCLUSION_WINDOW};
use l2_runtime::{LedgerState, SequencerConfig};
use prover::StubProverConfig;
use relayer::{RelayerConfig, RetryPolicy};
use rollup_types::Address;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisAccount {
    pub address: Address,
    pub balance: u128,
}

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// HTTP RPC bind address; no RPC server when unset
    pub rpc_addr: Option<String>,
    /// Chain store directory; in-memory only when unset
    pub data_dir: Option<PathBuf>,

    /// Block time in milliseconds
    pub block_time_ms: u64,
    pub max_txs_per_block: usize,
    pub force_lookahead: u64,
    pub produce_empty_blocks: bool,
    pub mempool_capacity: usize,

    pub max_blocks_per_batch: usize,
    pub max_batch_wait_ms: u64,
    pub max_outstanding_batches: usize,
    pub proof_timeout_ms: u64,
    pub proof_attempts: u32,
    pub prover_latency_ms: u64,

    pub relay_attempts: u32,
    pub commit_wait_ms: u64,

    pub force_inclusion_window: u64,
    pub l1_call_timeout_ms: u64,

    pub l2_genesis: Vec<GenesisAccount>,
    pub l1_genesis: Vec<GenesisAccount>,

    /// Enable verbose logging
    pub verbose: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let sequencer = SequencerConfig::default();
        let aggregator = AggregatorConfig::default();
        let relayer = RelayerConfig::default();
        Self {
            rpc_addr: Some("127.0.0.1:8899".to_string()),
            data_dir: None,
            block_time_ms: sequencer.block_time_ms,
            max_txs_per_block: sequencer.max_txs_per_block,
            force_lookahead: sequencer.force_lookahead,
            produce_empty_blocks: sequencer.produce_empty_blocks,
            mempool_capacity: sequencer.mempool_capacity,
            max_blocks_per_batch: aggregator.policy.max_blocks_per_batch,
            max_batch_wait_ms: aggregator.policy.max_batch_wait_ms,
            max_outstanding_batches: aggregator.max_outstanding_batches,
            proof_timeout_ms: aggregator.proof_timeout_ms,
            proof_attempts: aggregator.proof_retry.max_attempts,
            prover_latency_ms: 0,
            relay_attempts: relayer.retry.max_attempts,
            commit_wait_ms: relayer.commit_wait_ms,
            force_inclusion_window: DEFAULT_FORCE_INCLUSION_WINDOW,
            l1_call_timeout_ms: DEFAULT_CALL_TIMEOUT_MS,
            l2_genesis: Vec::new(),
            l1_genesis: Vec::new(),
            verbose: false,
        }
    }
}

impl NodeConfig {
    /// Load a JSON config file; missing fields take their defaults
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn sequencer(&self) -> SequencerConfig {
        SequencerConfig {
            block_time_ms: self.block_time_ms,
            max_txs_per_block: self.max_txs_per_block,
            force_lookahead: self.force_lookahead,
            produce_empty_blocks: self.produce_empty_blocks,
            mempool_capacity: self.mempool_capacity,
            verbose: self.verbose,
            ..SequencerConfig::default()
        }
    }

    pub fn aggregator(&self) -> AggregatorConfig {
        let defaults = AggregatorConfig::default();
        AggregatorConfig {
            policy: BatchPolicy {
                max_blocks_per_batch: self.max_blocks_per_batch,
                max_batch_wait_ms: self.max_batch_wait_ms,
            },
            max_outstanding_batches: self.max_outstanding_batches,
            proof_timeout_ms: self.proof_timeout_ms,
            proof_retry: RetryPolicy {
                max_attempts: self.proof_attempts,
                ..defaults.proof_retry
            },
            ..defaults
        }
    }

    pub fn relayer(&self) -> RelayerConfig {
        RelayerConfig {
            retry: RetryPolicy {
                max_attempts: self.relay_attempts,
                ..RetryPolicy::default()
            },
            commit_wait_ms: self.commit_wait_ms,
        }
    }

    pub fn prover(&self) -> StubProverConfig {
        StubProverConfig {
            latency_ms: self.prover_latency_ms,
            transient_failures: 0,
        }
    }

    pub fn rollup(&self) -> RollupConfig {
        RollupConfig {
            force_inclusion_window: self.force_inclusion_window,
            ..RollupConfig::default()
        }
    }

    pub fn l2_genesis_state(&self) -> LedgerState {
        LedgerState::with_balances(self.l2_genesis.iter().map(|a| (a.address, a.balance)))
    }

    pub fn l1_genesis_balances(&self) -> Vec<(Address, u128)> {
        self.l1_genesis
            .iter()
            .map(|a| (a.address, a.balance))
            .collect()
    }
}
