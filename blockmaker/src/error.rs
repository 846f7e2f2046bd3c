//! Crate-level error type.

use thiserror::Error;

use crate::chain::{PayoutError, SubmitError};
use crate::config::ConfigError;
use crate::target::TargetError;
use crate::template::BuildError;
use crate::template::coinbase::CoinbaseError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("template build failed: {0}")]
    Build(#[from] BuildError),

    #[error(transparent)]
    Target(#[from] TargetError),

    #[error(transparent)]
    Coinbase(#[from] CoinbaseError),

    #[error("block submission failed: {0}")]
    Submit(#[from] SubmitError),

    #[error(transparent)]
    Payout(#[from] PayoutError),

    #[error("failed to spawn miner thread: {0}")]
    Spawn(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
