//! Block production for a proof-of-work full node.
//!
//! The node supplies its chain index, mempool, coins view and network state
//! through the traits in [`chain`], [`mempool`] and [`utxo`]. From those a
//! [`TemplateBuilder`] assembles candidate blocks, and the threads of a
//! [`MinerPool`] search their nonce space and hand solved blocks back to the
//! node's [`BlockSink`].
//!
//! ```text
//!  MinerPool ──spawns──► MinerWorker (one per thread)
//!                          │
//!                          ├─ TemplateBuilder ── CoinbaseComposer
//!                          ├─ ExtraNonceState
//!                          └─ ProofOfWorkSearcher ── DifficultyRetargeter
//!                                                 └─ HashMeter (shared)
//! ```
//!
//! [`TemplateBuilder`]: template::TemplateBuilder
//! [`MinerPool`]: pool::MinerPool
//! [`BlockSink`]: chain::BlockSink

pub mod backoff;
pub mod chain;
pub mod config;
pub mod consensus;
pub mod error;
pub mod mempool;
pub mod pool;
pub mod search;
pub mod target;
pub mod template;
pub mod tracing;
pub mod types;
pub mod utxo;
pub mod worker;

#[cfg(test)]
mod testing;

pub use chain::{
    BlockSink, ChainIndex, ChainTip, NetworkStatus, PayoutError, PayoutProvider, StaticPayout,
    SubmitError, TransactionValidator,
};
pub use config::{BlockLimits, ConfigError, MinerConfig};
pub use consensus::ConsensusParams;
pub use error::{Error, Result};
pub use mempool::{Mempool, MempoolEntry, MempoolSnapshot};
pub use pool::{MinerContext, MinerEvent, MinerPool};
pub use search::hasher::{PowHasher, Sha256dHasher};
pub use target::{DifficultyTarget, TargetError};
pub use template::{BlockTemplate, BuildError, TemplateBuilder, TemplateStats};
pub use types::HashRate;
pub use utxo::{Coin, CoinsView};
