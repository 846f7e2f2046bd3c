//! Per-worker extra nonce.
//!
//! The header nonce covers 2^32 hashes. Past that a worker rolls the extra
//! nonce in the coinbase script, which changes the coinbase txid and with it
//! the merkle root, giving a fresh header to search.

use bitcoin::BlockHash;

use super::BlockTemplate;
use super::coinbase::{CoinbaseComposer, CoinbaseError};
use crate::chain::ChainTip;
use crate::tracing::prelude::*;

/// Extra nonce counter of one worker.
///
/// The counter restarts whenever a template builds on a different parent,
/// so the first template on a new tip always carries extra nonce 1.
#[derive(Debug, Clone)]
pub struct ExtraNonceState {
    composer: CoinbaseComposer,
    last_prev: Option<BlockHash>,
    counter: u64,
}

impl ExtraNonceState {
    pub fn new(composer: CoinbaseComposer) -> Self {
        Self {
            composer,
            last_prev: None,
            counter: 0,
        }
    }

    /// Last value written into a coinbase.
    pub fn value(&self) -> u64 {
        self.counter
    }

    /// Roll the counter and write it into `template`'s coinbase.
    ///
    /// Returns the value now embedded. On error the template is left
    /// unchanged.
    pub fn increment(
        &mut self,
        template: &mut BlockTemplate,
        tip: &ChainTip,
    ) -> Result<u64, CoinbaseError> {
        let prev = template.prev_blockhash();
        let counter = if self.last_prev == Some(prev) {
            self.counter + 1
        } else {
            1
        };

        let script = self.composer.script_sig(tip.next_height(), counter)?;
        trace!(
            extra_nonce = counter,
            script = %hex::encode(script.as_bytes()),
            "Rolled coinbase extra nonce"
        );
        template.set_coinbase_script(script);

        self.last_prev = Some(prev);
        self.counter = counter;
        Ok(counter)
    }
}
