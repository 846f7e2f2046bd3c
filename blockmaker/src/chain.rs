//! Interfaces to the rest of the node.
//!
//! The block maker reads chain state, network state and coins through these
//! traits and hands solved blocks back through [`BlockSink`]. Each
//! implementation does its own locking; none of these are called from inside
//! the nonce loop except the cheap tip and peer queries made at each
//! staleness check.

use bitcoin::pow::CompactTarget;
use bitcoin::{Block, BlockHash, ScriptBuf, Transaction};
use thiserror::Error;

use crate::utxo::CoinsOverlay;

/// The block a new template builds on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainTip {
    pub hash: BlockHash,
    pub height: u32,
    pub median_time_past: u32,
}

impl ChainTip {
    /// Height of a block extending this tip.
    pub fn next_height(&self) -> u32 {
        self.height + 1
    }

    /// Earliest timestamp a block extending this tip may carry.
    pub fn min_time(&self) -> u32 {
        self.median_time_past + 1
    }
}

/// Read access to the active chain.
pub trait ChainIndex: Send + Sync {
    /// Current best block, or `None` before the chain is loaded.
    fn tip(&self) -> Option<ChainTip>;

    /// Difficulty bits required of a block extending `tip` at `time`.
    fn next_work_required(&self, tip: &ChainTip, time: u32) -> CompactTarget;
}

/// Network-level facts the miner gates on.
pub trait NetworkStatus: Send + Sync {
    /// Wall clock corrected by peer offsets, in UNIX seconds.
    fn adjusted_time(&self) -> u32;

    /// Whether blocks should only be mined while connected.
    fn requires_peers(&self) -> bool;

    fn peer_count(&self) -> usize;

    /// Test networks where elapsed time can lower the required difficulty.
    fn allows_min_difficulty(&self) -> bool;

    fn is_initial_block_download(&self) -> bool {
        false
    }
}

/// Why the acceptance path refused a solved block.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("block builds on {0}, which is no longer the tip")]
    Stale(BlockHash),

    #[error("block rejected: {0}")]
    Rejected(String),
}

/// Acceptance path for solved blocks.
pub trait BlockSink: Send + Sync {
    /// Validate and connect `block`. A block whose parent is no longer the
    /// tip is reported as [`SubmitError::Stale`].
    fn submit(&self, block: Block) -> Result<(), SubmitError>;
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PayoutError {
    #[error("no payout key available")]
    Unavailable,

    #[error("payout provider failed: {0}")]
    Provider(String),
}

/// Source of the script paid by the coinbase.
pub trait PayoutProvider: Send + Sync {
    fn payout_script(&self) -> Result<ScriptBuf, PayoutError>;

    /// Called once a block paying the current script was accepted, so a
    /// wallet can mark the reserved key as used.
    fn keep(&self) {}
}

/// Pays every block to one fixed script.
#[derive(Debug, Clone)]
pub struct StaticPayout(ScriptBuf);

impl StaticPayout {
    pub fn new(script: ScriptBuf) -> Self {
        Self(script)
    }
}

impl PayoutProvider for StaticPayout {
    fn payout_script(&self) -> Result<ScriptBuf, PayoutError> {
        Ok(self.0.clone())
    }
}

/// Full script and input validation, owned by the consensus layer.
///
/// Consulted for every transaction before it is counted into a template.
/// `coins` reflects the transactions already selected for the block.
pub trait TransactionValidator: Send + Sync {
    fn check_inputs(
        &self,
        tx: &Transaction,
        coins: &CoinsOverlay<'_>,
        height: u32,
    ) -> anyhow::Result<()>;
}
