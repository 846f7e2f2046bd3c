//! Unspent outputs as seen by one template build.

use std::collections::{HashMap, HashSet};

use bitcoin::{OutPoint, Transaction, TxOut};

/// An unspent output and where it was created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coin {
    pub output: TxOut,
    pub height: u32,
    pub is_coinbase: bool,
}

/// Read access to the node's UTXO set at the current tip.
pub trait CoinsView: Send + Sync {
    fn coin(&self, outpoint: &OutPoint) -> Option<Coin>;
}

/// Write overlay over a [`CoinsView`].
///
/// Transactions applied to the overlay spend their inputs and create their
/// outputs without touching the base view, so later lookups in the same
/// build see in-block parents and in-block double spends. Dropped when the
/// build finishes.
pub struct CoinsOverlay<'a> {
    base: &'a dyn CoinsView,
    added: HashMap<OutPoint, Coin>,
    spent: HashSet<OutPoint>,
}

impl<'a> CoinsOverlay<'a> {
    pub fn new(base: &'a dyn CoinsView) -> Self {
        Self {
            base,
            added: HashMap::new(),
            spent: HashSet::new(),
        }
    }

    pub fn coin(&self, outpoint: &OutPoint) -> Option<Coin> {
        if self.spent.contains(outpoint) {
            return None;
        }
        match self.added.get(outpoint) {
            Some(coin) => Some(coin.clone()),
            None => self.base.coin(outpoint),
        }
    }

    /// Whether every input of `tx` is currently unspent.
    pub fn has_inputs(&self, tx: &Transaction) -> bool {
        tx.input
            .iter()
            .all(|input| self.coin(&input.previous_output).is_some())
    }

    /// Spend the inputs of `tx` and add its outputs as coins at `height`.
    pub fn apply(&mut self, tx: &Transaction, height: u32) {
        for input in &tx.input {
            if self.added.remove(&input.previous_output).is_none() {
                self.spent.insert(input.previous_output);
            }
        }

        let txid = tx.compute_txid();
        let is_coinbase = tx.is_coinbase();
        for (vout, output) in tx.output.iter().enumerate() {
            self.added.insert(
                OutPoint::new(txid, vout as u32),
                Coin {
                    output: output.clone(),
                    height,
                    is_coinbase,
                },
            );
        }
    }
}
