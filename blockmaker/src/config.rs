//! Mining policy configuration.
//!
//! Everything here is local policy and can differ between nodes. Chain rules
//! live in [`crate::consensus`].

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::consensus::{ConsensusParams, MAX_COINBASE_SCRIPT_SIG};
use crate::template::coinbase::DEFAULT_COINBASE_FLAGS;

/// Prefix of environment variables read by [`MinerConfig::from_env`].
pub const ENV_PREFIX: &str = "BLOCKMAKER_";

/// Bytes reserved for the coinbase and block header while selecting.
pub const COINBASE_RESERVED_SIZE: u32 = 1_000;

/// Sigops reserved for the coinbase while selecting.
pub const COINBASE_RESERVED_SIGOPS: u32 = 100;

/// Longest coinbase prefix: height push (6) plus extra nonce push (10).
const COINBASE_PREFIX_MAX: usize = 16;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),

    #[error("nonce limit must be greater than zero")]
    ZeroNonceLimit,

    #[error("coinbase flags are {len} bytes, at most {max} fit in the coinbase script")]
    CoinbaseFlagsTooLong { len: usize, max: usize },

    #[error("block sigop limit {limit} leaves no room past the coinbase reservation")]
    SigopLimitTooLow { limit: u32 },

    #[error("build retry initial delay {initial:?} exceeds maximum {max:?}")]
    RetryRange { initial: Duration, max: Duration },

    #[error("invalid value {value:?} for {name}")]
    InvalidVar { name: String, value: String },
}

/// Knobs for block assembly and the mining threads.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MinerConfig {
    /// Whether mining runs at all.
    pub generate: bool,

    /// Worker threads. `None` uses one per available core.
    pub threads: Option<usize>,

    /// Largest block to assemble (bytes). Clamped into the range consensus
    /// allows.
    pub block_max_size: u32,

    /// Size up to which fee-less transactions are still accepted.
    pub block_min_size: u32,

    /// Bytes filled by priority before switching to fee rate ordering.
    pub block_priority_size: u32,

    /// Sigop limit. `None` uses the consensus maximum.
    pub block_max_sigops: Option<u32>,

    /// Header version override, for test networks.
    pub block_version: Option<i32>,

    /// Bytes pushed at the end of the coinbase script.
    pub coinbase_flags: String,

    /// Fee rate (sat/kB) below which transactions count as free.
    pub min_relay_fee_per_kb: u64,

    /// Minimum search time before a changed mempool triggers a rebuild.
    pub mempool_refresh_interval: Duration,

    /// Nonce at which the search gives up and rebuilds.
    pub nonce_limit: u32,

    pub hash_meter_window: Duration,
    pub hash_log_interval: Duration,
    pub peer_poll_interval: Duration,
    pub mempool_poll_interval: Duration,

    /// Wait for pending transactions before building.
    pub require_transactions: bool,

    /// Below this tip height mining proceeds with an empty mempool.
    pub bootstrap_height: u32,

    /// Search templates with no transactions besides the coinbase.
    pub allow_empty_blocks: bool,

    pub build_retry_initial: Duration,
    pub build_retry_max: Duration,
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            generate: false,
            threads: None,
            block_max_size: 1_000_000,
            block_min_size: 0,
            block_priority_size: 1_000_000,
            block_max_sigops: None,
            block_version: None,
            coinbase_flags: String::from_utf8_lossy(DEFAULT_COINBASE_FLAGS).into_owned(),
            min_relay_fee_per_kb: 1_000,
            mempool_refresh_interval: Duration::from_secs(60),
            nonce_limit: 0xffff_0000,
            hash_meter_window: Duration::from_secs(4),
            hash_log_interval: Duration::from_secs(30 * 60),
            peer_poll_interval: Duration::from_secs(1),
            mempool_poll_interval: Duration::from_millis(300),
            require_transactions: true,
            bootstrap_height: 3_100,
            allow_empty_blocks: false,
            build_retry_initial: Duration::from_millis(500),
            build_retry_max: Duration::from_secs(30),
        }
    }
}

impl MinerConfig {
    /// Defaults overridden by `BLOCKMAKER_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_vars(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Apply overrides looked up by full variable name.
    ///
    /// Durations are given in milliseconds. `THREADS` accepts `auto`.
    pub fn apply_vars<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| {
            let name = format!("{ENV_PREFIX}{key}");
            lookup(&name).map(|value| (name, value))
        };

        if let Some((name, value)) = var("GENERATE") {
            self.generate = parse_bool(&name, &value)?;
        }
        if let Some((name, value)) = var("THREADS") {
            self.threads = match value.trim() {
                "auto" | "" => None,
                other => Some(parse(&name, other)?),
            };
        }
        if let Some((name, value)) = var("BLOCK_MAX_SIZE") {
            self.block_max_size = parse(&name, &value)?;
        }
        if let Some((name, value)) = var("BLOCK_MIN_SIZE") {
            self.block_min_size = parse(&name, &value)?;
        }
        if let Some((name, value)) = var("BLOCK_PRIORITY_SIZE") {
            self.block_priority_size = parse(&name, &value)?;
        }
        if let Some((name, value)) = var("BLOCK_MAX_SIGOPS") {
            self.block_max_sigops = Some(parse(&name, &value)?);
        }
        if let Some((name, value)) = var("BLOCK_VERSION") {
            self.block_version = Some(parse(&name, &value)?);
        }
        if let Some((_, value)) = var("COINBASE_FLAGS") {
            self.coinbase_flags = value;
        }
        if let Some((name, value)) = var("MIN_RELAY_FEE") {
            self.min_relay_fee_per_kb = parse(&name, &value)?;
        }
        if let Some((name, value)) = var("MEMPOOL_REFRESH_MS") {
            self.mempool_refresh_interval = parse_millis(&name, &value)?;
        }
        if let Some((name, value)) = var("NONCE_LIMIT") {
            self.nonce_limit = parse(&name, &value)?;
        }
        if let Some((name, value)) = var("REQUIRE_TRANSACTIONS") {
            self.require_transactions = parse_bool(&name, &value)?;
        }
        if let Some((name, value)) = var("BOOTSTRAP_HEIGHT") {
            self.bootstrap_height = parse(&name, &value)?;
        }
        if let Some((name, value)) = var("ALLOW_EMPTY_BLOCKS") {
            self.allow_empty_blocks = parse_bool(&name, &value)?;
        }

        Ok(())
    }

    /// Reject settings no pool could run with.
    pub fn validate(&self, params: &ConsensusParams) -> Result<(), ConfigError> {
        for (name, interval) in [
            ("mempool_refresh_interval", self.mempool_refresh_interval),
            ("hash_meter_window", self.hash_meter_window),
            ("peer_poll_interval", self.peer_poll_interval),
            ("mempool_poll_interval", self.mempool_poll_interval),
            ("build_retry_initial", self.build_retry_initial),
        ] {
            if interval.is_zero() {
                return Err(ConfigError::ZeroInterval(name));
            }
        }

        if self.nonce_limit == 0 {
            return Err(ConfigError::ZeroNonceLimit);
        }

        let max_flags = MAX_COINBASE_SCRIPT_SIG - COINBASE_PREFIX_MAX;
        // A push of more than 75 bytes needs a two byte prefix.
        let flags_len = match self.coinbase_flags.len() {
            0 => 0,
            len @ 1..=75 => len + 1,
            len => len + 2,
        };
        if flags_len > max_flags {
            return Err(ConfigError::CoinbaseFlagsTooLong {
                len: self.coinbase_flags.len(),
                max: max_flags - 2,
            });
        }

        let limits = BlockLimits::from_config(self, params);
        if limits.max_block_sigops <= COINBASE_RESERVED_SIGOPS {
            return Err(ConfigError::SigopLimitTooLow {
                limit: limits.max_block_sigops,
            });
        }

        if self.build_retry_initial > self.build_retry_max {
            return Err(ConfigError::RetryRange {
                initial: self.build_retry_initial,
                max: self.build_retry_max,
            });
        }

        Ok(())
    }

    /// Worker count after resolving `threads = None`.
    pub fn worker_count(&self) -> usize {
        match self.threads {
            Some(count) => count,
            None => std::thread::available_parallelism().map_or(1, |n| n.get()),
        }
    }
}

/// Resource limits for one template, after clamping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLimits {
    pub max_block_size: u32,
    pub max_block_sigops: u32,
    pub priority_size: u32,
    pub min_block_size: u32,
}

impl BlockLimits {
    /// Clamp configured sizes into what consensus permits.
    ///
    /// The maximum keeps 1000 bytes of headroom at both ends; priority and
    /// minimum sizes never exceed the maximum.
    pub fn from_config(config: &MinerConfig, params: &ConsensusParams) -> Self {
        let ceiling = params.max_block_size.saturating_sub(COINBASE_RESERVED_SIZE);
        let max_block_size = config
            .block_max_size
            .min(ceiling)
            .max(COINBASE_RESERVED_SIZE);

        Self {
            max_block_size,
            max_block_sigops: config
                .block_max_sigops
                .map_or(params.max_block_sigops, |limit| {
                    limit.min(params.max_block_sigops)
                }),
            priority_size: config.block_priority_size.min(max_block_size),
            min_block_size: config.block_min_size.min(max_block_size),
        }
    }
}

fn parse<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidVar {
        name: name.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidVar {
            name: name.to_string(),
            value: value.to_string(),
        }),
    }
}

fn parse_millis(name: &str, value: &str) -> Result<Duration, ConfigError> {
    parse(name, value).map(Duration::from_millis)
}
