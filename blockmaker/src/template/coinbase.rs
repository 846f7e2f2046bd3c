//! The reward transaction at the head of every block.
//!
//! The coinbase has one null input and one output. Its input script is free
//! form apart from the leading height push, which this crate lays out as:
//!
//! ```text
//! <height> <extra nonce> <flags>
//! ```
//!
//! The extra nonce is a minimally encoded script number (zero is an empty
//! push) so rolling it changes the transaction id without changing the
//! rest of the block.

use bitcoin::absolute::LockTime;
use bitcoin::script::{Builder, PushBytesBuf};
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};
use thiserror::Error;

use crate::consensus::MAX_COINBASE_SCRIPT_SIG;

/// Flags advertised in the coinbase unless configured otherwise.
pub const DEFAULT_COINBASE_FLAGS: &[u8] = b"/P2SH/";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoinbaseError {
    #[error("coinbase script is {len} bytes, limit is {max}")]
    ScriptTooLong { len: usize, max: usize },
}

/// Builds coinbase transactions carrying fixed flag bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoinbaseComposer {
    flags: Vec<u8>,
}

impl CoinbaseComposer {
    pub fn new(flags: impl Into<Vec<u8>>) -> Self {
        Self {
            flags: flags.into(),
        }
    }

    pub fn flags(&self) -> &[u8] {
        &self.flags
    }

    /// Coinbase input script for `height` carrying `extra_nonce`.
    pub fn script_sig(&self, height: u32, extra_nonce: u64) -> Result<ScriptBuf, CoinbaseError> {
        let too_long = |len| CoinbaseError::ScriptTooLong {
            len,
            max: MAX_COINBASE_SCRIPT_SIG,
        };

        let nonce = PushBytesBuf::try_from(script_num(extra_nonce))
            .map_err(|_| too_long(usize::MAX))?;
        let mut builder = Builder::new()
            .push_int(i64::from(height))
            .push_slice(nonce);
        if !self.flags.is_empty() {
            let flags =
                PushBytesBuf::try_from(self.flags.clone()).map_err(|_| too_long(usize::MAX))?;
            builder = builder.push_slice(flags);
        }

        let script = builder.into_script();
        if script.len() > MAX_COINBASE_SCRIPT_SIG {
            return Err(too_long(script.len()));
        }
        Ok(script)
    }

    /// Coinbase paying `reward` to `payout`.
    pub fn compose(
        &self,
        height: u32,
        reward: Amount,
        payout: ScriptBuf,
        extra_nonce: u64,
    ) -> Result<Transaction, CoinbaseError> {
        Ok(Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: self.script_sig(height, extra_nonce)?,
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: reward,
                script_pubkey: payout,
            }],
        })
    }
}

impl Default for CoinbaseComposer {
    fn default() -> Self {
        Self::new(DEFAULT_COINBASE_FLAGS)
    }
}

/// Minimal little-endian script number encoding of a non-negative value.
fn script_num(value: u64) -> Vec<u8> {
    let mut bytes: Vec<u8> = value
        .to_le_bytes()
        .into_iter()
        .rev()
        .skip_while(|&b| b == 0)
        .collect();
    bytes.reverse();

    // Top bit is the sign; pad so the value stays positive.
    if bytes.last().is_some_and(|&b| b & 0x80 != 0) {
        bytes.push(0);
    }
    bytes
}
