//! Nonce search over a block header.
//!
//! # State Machine
//!
//! ```text
//!              hash <= target
//!  Searching ─────────────────► Found
//!   │     │
//!   │     │ batch boundary: tip moved, mempool changed,
//!   │     │ peers lost or cancelled
//!   │     └───────────────────► Stale
//!   │
//!   │ nonce reached the limit
//!   └─────────────────────────► Exhausted
//! ```
//!
//! Nonces are hashed in batches of [`CHECK_INTERVAL`]. Between batches the
//! searcher records the batch with the hash meter, checks for staleness and
//! refreshes the header time, so a cancellation is seen within one batch.

pub mod hasher;
pub mod meter;
pub mod retarget;

use std::time::{Duration, Instant};

use bitcoin::BlockHash;
use bitcoin::block::Header;
use strum::Display;
use tokio_util::sync::CancellationToken;

use crate::chain::{ChainIndex, ChainTip, NetworkStatus};
use crate::mempool::Mempool;
use crate::target::DifficultyTarget;
use hasher::PowHasher;
use meter::HashMeter;
use retarget::DifficultyRetargeter;

/// Nonces hashed between staleness checks.
pub const CHECK_INTERVAL: u32 = 256;

/// Default nonce at which a search gives up.
pub const DEFAULT_NONCE_LIMIT: u32 = 0xffff_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum StaleReason {
    Cancelled,
    NoPeers,
    NewTip,
    MempoolChanged,
    InvalidTarget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum SearchState {
    /// The header now meets its target.
    Found,

    /// The template no longer extends the node's best view.
    Stale(StaleReason),

    /// Nonce range used up without a solution.
    Exhausted,
}

/// Detects when a template in search has been overtaken.
pub struct StaleWatch<'a> {
    cancel: &'a CancellationToken,
    chain: &'a dyn ChainIndex,
    mempool: &'a dyn Mempool,
    network: &'a dyn NetworkStatus,
    mempool_refresh: Duration,
    tip: Option<ChainTip>,
    mempool_version: u64,
    started: Instant,
}

impl<'a> StaleWatch<'a> {
    pub fn new(
        cancel: &'a CancellationToken,
        chain: &'a dyn ChainIndex,
        mempool: &'a dyn Mempool,
        network: &'a dyn NetworkStatus,
    ) -> Self {
        Self {
            cancel,
            chain,
            mempool,
            network,
            mempool_refresh: Duration::from_secs(60),
            tip: None,
            mempool_version: 0,
            started: Instant::now(),
        }
    }

    /// How long a search runs before mempool changes make it stale.
    pub fn with_mempool_refresh(mut self, interval: Duration) -> Self {
        self.mempool_refresh = interval;
        self
    }

    /// Start watching a template built on `tip` from the mempool as of
    /// `mempool_version`.
    pub fn watch(&mut self, tip: ChainTip, mempool_version: u64) {
        self.tip = Some(tip);
        self.mempool_version = mempool_version;
        self.started = Instant::now();
    }

    pub fn tip(&self) -> Option<&ChainTip> {
        self.tip.as_ref()
    }

    /// Why the watched template is stale, if it is.
    pub fn check(&self) -> Option<StaleReason> {
        if self.cancel.is_cancelled() {
            return Some(StaleReason::Cancelled);
        }
        if self.network.requires_peers() && self.network.peer_count() == 0 {
            return Some(StaleReason::NoPeers);
        }

        let current = self.chain.tip().map(|tip| tip.hash);
        let watched: Option<BlockHash> = self.tip.map(|tip| tip.hash);
        if current.is_none() || current != watched {
            return Some(StaleReason::NewTip);
        }

        if self.mempool.transaction_set_version() != self.mempool_version
            && self.started.elapsed() > self.mempool_refresh
        {
            return Some(StaleReason::MempoolChanged);
        }

        None
    }
}

/// Runs the nonce loop for one header.
pub struct ProofOfWorkSearcher<'a> {
    hasher: &'a dyn PowHasher,
    meter: &'a HashMeter,
    retargeter: DifficultyRetargeter<'a>,
    nonce_limit: u32,
}

impl<'a> ProofOfWorkSearcher<'a> {
    pub fn new(
        hasher: &'a dyn PowHasher,
        meter: &'a HashMeter,
        retargeter: DifficultyRetargeter<'a>,
    ) -> Self {
        Self {
            hasher,
            meter,
            retargeter,
            nonce_limit: DEFAULT_NONCE_LIMIT,
        }
    }

    pub fn with_nonce_limit(mut self, limit: u32) -> Self {
        self.nonce_limit = limit;
        self
    }

    /// Search nonces from zero until `header` meets its target or the
    /// search ends otherwise.
    ///
    /// On [`SearchState::Found`] the header holds the winning nonce. On any
    /// other outcome its nonce and time are scratch values.
    pub fn search(&self, header: &mut Header, watch: &StaleWatch<'_>) -> SearchState {
        let Ok(mut target) = DifficultyTarget::from_compact(header.bits) else {
            return SearchState::Stale(StaleReason::InvalidTarget);
        };
        header.nonce = 0;

        loop {
            let mut hashes = 0u64;
            let mut exhausted = false;
            loop {
                let hash = self.hasher.hash(header);
                hashes += 1;
                if target.is_met_by(&hash) {
                    self.meter.record(hashes);
                    return SearchState::Found;
                }

                let Some(next) = header.nonce.checked_add(1) else {
                    exhausted = true;
                    break;
                };
                header.nonce = next;
                if next >= self.nonce_limit {
                    exhausted = true;
                    break;
                }
                if next % CHECK_INTERVAL == 0 {
                    break;
                }
            }
            self.meter.record(hashes);

            if let Some(reason) = watch.check() {
                return SearchState::Stale(reason);
            }
            if exhausted {
                return SearchState::Exhausted;
            }

            let Some(tip) = watch.tip() else {
                return SearchState::Stale(StaleReason::NewTip);
            };
            let bits = header.bits;
            self.retargeter.refresh_time(header, tip);
            if header.bits != bits {
                match DifficultyTarget::from_compact(header.bits) {
                    Ok(next) => target = next,
                    Err(_) => return SearchState::Stale(StaleReason::InvalidTarget),
                }
            }
        }
    }
}
