//! Block template assembly.
//!
//! A build walks a mempool snapshot in priority order, switching to fee rate
//! order once the priority area of the block is full, and keeps every
//! transaction that fits the size and sigop limits, spends coins that still
//! exist, and passes input validation. Transactions spending other pending
//! transactions wait until all of their parents are in the block. The
//! coinbase is composed last, once the fees are known.

pub mod coinbase;
pub mod extranonce;

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use bitcoin::block::{Header, Version};
use bitcoin::hashes::Hash;
use bitcoin::{Amount, Block, BlockHash, ScriptBuf, Transaction, TxMerkleNode, Txid, merkle_tree};
use thiserror::Error;

use crate::chain::{ChainIndex, ChainTip, NetworkStatus, PayoutError, TransactionValidator};
use crate::config::{BlockLimits, COINBASE_RESERVED_SIGOPS, COINBASE_RESERVED_SIZE};
use crate::consensus::{ConsensusParams, is_final_tx, legacy_sigops, p2sh_sigops};
use crate::mempool::{CandidateQueue, CandidateTransaction, MempoolEntry, MempoolSnapshot};
use crate::target::{DifficultyTarget, TargetError};
use crate::tracing::prelude::*;
use crate::utxo::{CoinsOverlay, CoinsView};
use coinbase::{CoinbaseComposer, CoinbaseError};

/// Header version used unless overridden.
pub const DEFAULT_BLOCK_VERSION: i32 = 2;

/// Serialized block header size.
const HEADER_SIZE: usize = 80;

/// Reasons a template could not be built. None are fatal to the worker.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("no active chain tip")]
    NoChainTip,

    #[error("block reward overflows: subsidy {subsidy} plus fees {fees}")]
    RewardOverflow { subsidy: Amount, fees: Amount },

    #[error("invalid difficulty bits: {0}")]
    InvalidBits(#[from] TargetError),

    #[error("payout script unavailable: {0}")]
    Payout(#[from] PayoutError),

    #[error(transparent)]
    Coinbase(#[from] CoinbaseError),
}

/// A candidate block awaiting proof of work.
///
/// The transaction list is fixed once built. Only the coinbase script and
/// the header fields derived from it may change afterwards, through
/// [`extranonce::ExtraNonceState`].
#[derive(Debug, Clone)]
pub struct BlockTemplate {
    header: Header,
    transactions: Vec<Transaction>,
    fees: Vec<Amount>,
    sigops: Vec<u32>,
    height: u32,
    total_fees: Amount,
}

impl BlockTemplate {
    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn prev_blockhash(&self) -> BlockHash {
        self.header.prev_blockhash
    }

    /// Every transaction, coinbase first.
    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn coinbase(&self) -> &Transaction {
        &self.transactions[0]
    }

    /// Fee paid by each transaction, parallel to [`Self::transactions`].
    /// The coinbase entry is zero.
    pub fn fees(&self) -> &[Amount] {
        &self.fees
    }

    /// Sigops of each transaction, parallel to [`Self::transactions`].
    pub fn sigops(&self) -> &[u32] {
        &self.sigops
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn total_fees(&self) -> Amount {
        self.total_fees
    }

    /// Value paid by the coinbase.
    pub fn reward(&self) -> Amount {
        self.coinbase().output.iter().map(|output| output.value).sum()
    }

    pub fn tx_count(&self) -> usize {
        self.transactions.len()
    }

    /// Whether the block holds nothing but the coinbase.
    pub fn is_empty(&self) -> bool {
        self.transactions.len() == 1
    }

    pub fn total_sigops(&self) -> u32 {
        self.sigops.iter().sum()
    }

    /// Serialized size of the transactions alone.
    pub fn transactions_size(&self) -> usize {
        self.transactions.iter().map(Transaction::total_size).sum()
    }

    /// Serialized size of the full block.
    pub fn size(&self) -> usize {
        HEADER_SIZE + compact_size_len(self.transactions.len()) + self.transactions_size()
    }

    /// Assemble the block with a solved `header`.
    pub fn into_block(self, header: Header) -> Block {
        Block {
            header,
            txdata: self.transactions,
        }
    }

    /// Replace the coinbase input script and refresh the merkle root.
    pub(crate) fn set_coinbase_script(&mut self, script: ScriptBuf) {
        self.transactions[0].input[0].script_sig = script;
        self.sigops[0] = legacy_sigops(&self.transactions[0]);
        self.header.merkle_root = merkle_root(&self.transactions);
    }
}

/// Summary of a finished build.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemplateStats {
    pub height: u32,
    pub tx_count: usize,
    pub size: usize,
    pub sigops: u32,
    pub fees: Amount,
    pub elapsed: Duration,
}

#[derive(Debug)]
pub struct BuildOutput {
    pub template: BlockTemplate,

    /// Transactions whose inputs no longer exist. The caller should evict
    /// them from the mempool.
    pub evicted: Vec<Txid>,

    pub stats: TemplateStats,
}

/// Assembles block templates against the node's current state.
pub struct TemplateBuilder<'a> {
    params: &'a ConsensusParams,
    chain: &'a dyn ChainIndex,
    network: &'a dyn NetworkStatus,
    validator: &'a dyn TransactionValidator,
    composer: &'a CoinbaseComposer,
    block_version: Version,
    min_relay_fee_per_kb: u64,
}

impl<'a> TemplateBuilder<'a> {
    pub fn new(
        params: &'a ConsensusParams,
        chain: &'a dyn ChainIndex,
        network: &'a dyn NetworkStatus,
        validator: &'a dyn TransactionValidator,
        composer: &'a CoinbaseComposer,
    ) -> Self {
        Self {
            params,
            chain,
            network,
            validator,
            composer,
            block_version: Version::from_consensus(DEFAULT_BLOCK_VERSION),
            min_relay_fee_per_kb: 1_000,
        }
    }

    pub fn with_block_version(mut self, version: i32) -> Self {
        self.block_version = Version::from_consensus(version);
        self
    }

    pub fn with_min_relay_fee(mut self, fee_per_kb: u64) -> Self {
        self.min_relay_fee_per_kb = fee_per_kb;
        self
    }

    /// Build a template extending `tip`.
    ///
    /// Nothing here mutates the mempool or the coins view; unusable
    /// transactions are reported in [`BuildOutput::evicted`].
    pub fn build(
        &self,
        payout: ScriptBuf,
        tip: Option<&ChainTip>,
        snapshot: &MempoolSnapshot,
        coins: &dyn CoinsView,
        limits: &BlockLimits,
    ) -> Result<BuildOutput, BuildError> {
        let started = Instant::now();
        let tip = tip.ok_or(BuildError::NoChainTip)?;
        let height = tip.next_height();
        let time = tip.min_time().max(self.network.adjusted_time());

        let mut selection = Selection::new(coins, height);
        let mut pending = self.classify(snapshot, &mut selection, time);
        self.select(snapshot, &mut selection, &mut pending, limits);

        let subsidy = self.params.subsidy.subsidy_at(height);
        let fees = selection.total_fees;
        let reward = subsidy
            .checked_add(fees)
            .filter(|reward| self.params.money_range(*reward))
            .ok_or(BuildError::RewardOverflow { subsidy, fees })?;

        let coinbase = self.composer.compose(height, reward, payout, 0)?;
        let mut sigops = selection.sigops;
        let mut fees_by_tx = selection.fees;
        let mut transactions = selection.transactions;
        sigops.insert(0, legacy_sigops(&coinbase));
        fees_by_tx.insert(0, Amount::ZERO);
        transactions.insert(0, coinbase);

        let bits = self.chain.next_work_required(tip, time);
        DifficultyTarget::from_compact(bits)?;

        let header = Header {
            version: self.block_version,
            prev_blockhash: tip.hash,
            merkle_root: merkle_root(&transactions),
            time,
            bits,
            nonce: 0,
        };

        let template = BlockTemplate {
            header,
            transactions,
            fees: fees_by_tx,
            sigops,
            height,
            total_fees: fees,
        };

        let stats = TemplateStats {
            height,
            tx_count: template.tx_count(),
            size: template.size(),
            sigops: template.total_sigops(),
            fees,
            elapsed: started.elapsed(),
        };
        debug!(
            height,
            txs = stats.tx_count,
            size = stats.size,
            sigops = stats.sigops,
            fees = %fees,
            evicted = selection.evicted.len(),
            elapsed_ms = stats.elapsed.as_millis() as u64,
            "Assembled block template"
        );

        Ok(BuildOutput {
            template,
            evicted: selection.evicted,
            stats,
        })
    }

    /// Sort snapshot entries into ready candidates and orphans waiting on
    /// pending parents. Transactions with unresolvable inputs go straight to
    /// the eviction list.
    fn classify(
        &self,
        snapshot: &MempoolSnapshot,
        selection: &mut Selection<'_>,
        time: u32,
    ) -> Pending {
        let mut pending = Pending::default();

        for (index, entry) in snapshot.entries().iter().enumerate() {
            let tx = &entry.tx;
            if tx.is_coinbase() || !is_final_tx(tx, selection.height, time) {
                continue;
            }

            let mut orphan = Orphan::default();
            let mut missing = false;
            for input in &tx.input {
                let prevout = &input.previous_output;
                if let Some(coin) = selection.coins.coin(prevout) {
                    let confirmations = selection.height.saturating_sub(coin.height);
                    orphan.input_age += coin.output.value.to_sat() as f64 * confirmations as f64;
                    orphan.value_in = orphan
                        .value_in
                        .and_then(|total| total.checked_add(coin.output.value));
                    continue;
                }

                let parent_output = snapshot
                    .get(&prevout.txid)
                    .and_then(|parent| parent.tx.output.get(prevout.vout as usize));
                match parent_output {
                    Some(output) => {
                        orphan.value_in = orphan
                            .value_in
                            .and_then(|total| total.checked_add(output.value));
                        if orphan.waiting_on.insert(prevout.txid) {
                            pending.dependers.entry(prevout.txid).or_default().push(index);
                        }
                    }
                    None => {
                        missing = true;
                        break;
                    }
                }
            }

            if missing {
                trace!(txid = %entry.txid, "Transaction spends missing coins");
                selection.evict(entry.txid);
            } else if orphan.waiting_on.is_empty() {
                if let Some(candidate) = self.candidate(index, entry, &orphan) {
                    pending.ready.push(candidate);
                }
            } else {
                pending.orphans.insert(index, orphan);
            }
        }

        pending
    }

    fn select(
        &self,
        snapshot: &MempoolSnapshot,
        selection: &mut Selection<'_>,
        pending: &mut Pending,
        limits: &BlockLimits,
    ) {
        let mut queue = CandidateQueue::new(limits.priority_size == 0);
        for candidate in pending.ready.drain(..) {
            queue.push(candidate);
        }

        while let Some(candidate) = queue.pop() {
            let entry = &snapshot.entries()[candidate.index];
            let size = entry.size as u64;
            let next_size = selection.block_size + size;

            if next_size > u64::from(limits.max_block_size) {
                continue;
            }
            if selection.block_sigops + entry.sigops > limits.max_block_sigops {
                continue;
            }

            // Free transactions only fill the block up to its minimum size.
            if queue.is_by_fee()
                && candidate.fee_per_kb < self.min_relay_fee_per_kb
                && next_size >= u64::from(limits.min_block_size)
            {
                continue;
            }

            // Past the priority area, or out of high priority transactions:
            // everything left goes by fee rate.
            if !queue.is_by_fee()
                && (next_size >= u64::from(limits.priority_size) || !candidate.allows_free())
            {
                queue.sort_by_fee();
                queue.push(candidate);
                continue;
            }

            let tx = &entry.tx;
            if !selection.coins.has_inputs(tx) {
                trace!(txid = %entry.txid, "Transaction conflicts with block contents");
                selection.evict(entry.txid);
                continue;
            }

            let sigops = entry.sigops
                + p2sh_sigops(tx, |outpoint| {
                    selection
                        .coins
                        .coin(outpoint)
                        .map(|coin| coin.output.script_pubkey)
                });
            if selection.block_sigops + sigops > limits.max_block_sigops {
                continue;
            }

            if let Err(e) = self
                .validator
                .check_inputs(tx, &selection.coins, selection.height)
            {
                debug!(txid = %entry.txid, error = %e, "Transaction failed input checks");
                continue;
            }

            selection.include(entry, candidate.fee, sigops);

            let Some(children) = pending.dependers.remove(&entry.txid) else {
                continue;
            };
            for child in children {
                let Some(orphan) = pending.orphans.get_mut(&child) else {
                    continue;
                };
                orphan.waiting_on.remove(&entry.txid);
                if !orphan.waiting_on.is_empty() {
                    continue;
                }
                let Some(orphan) = pending.orphans.remove(&child) else {
                    continue;
                };
                if let Some(candidate) = self.candidate(child, &snapshot.entries()[child], &orphan)
                {
                    queue.push(candidate);
                }
            }
        }
    }

    /// Ordering keys for a transaction whose inputs are all accounted for.
    /// `None` if its amounts are invalid.
    fn candidate(
        &self,
        index: usize,
        entry: &MempoolEntry,
        orphan: &Orphan,
    ) -> Option<CandidateTransaction> {
        let value_out = entry
            .tx
            .output
            .iter()
            .try_fold(Amount::ZERO, |total, output| total.checked_add(output.value))
            .filter(|value| self.params.money_range(*value));
        let fee = orphan
            .value_in
            .zip(value_out)
            .and_then(|(value_in, value_out)| value_in.checked_sub(value_out));

        match fee {
            Some(fee) => Some(CandidateTransaction::new(
                index,
                &entry.tx,
                entry.size,
                orphan.input_age,
                fee,
            )),
            None => {
                debug!(txid = %entry.txid, "Transaction spends more than its inputs");
                None
            }
        }
    }
}

/// Inputs of one snapshot transaction, as far as they are resolved.
struct Orphan {
    /// Pending parents not yet in the block.
    waiting_on: HashSet<Txid>,

    /// Sum of value times confirmations over confirmed inputs.
    input_age: f64,

    /// `None` once the sum overflows.
    value_in: Option<Amount>,
}

impl Default for Orphan {
    fn default() -> Self {
        Self {
            waiting_on: HashSet::new(),
            input_age: 0.0,
            value_in: Some(Amount::ZERO),
        }
    }
}

#[derive(Default)]
struct Pending {
    ready: Vec<CandidateTransaction>,
    orphans: HashMap<usize, Orphan>,
    dependers: HashMap<Txid, Vec<usize>>,
}

/// Block contents while a build is in progress.
struct Selection<'a> {
    coins: CoinsOverlay<'a>,
    height: u32,
    transactions: Vec<Transaction>,
    fees: Vec<Amount>,
    sigops: Vec<u32>,
    block_size: u64,
    block_sigops: u32,
    total_fees: Amount,
    evicted: Vec<Txid>,
}

impl<'a> Selection<'a> {
    fn new(coins: &'a dyn CoinsView, height: u32) -> Self {
        Self {
            coins: CoinsOverlay::new(coins),
            height,
            transactions: Vec::new(),
            fees: Vec::new(),
            sigops: Vec::new(),
            block_size: u64::from(COINBASE_RESERVED_SIZE),
            block_sigops: COINBASE_RESERVED_SIGOPS,
            total_fees: Amount::ZERO,
            evicted: Vec::new(),
        }
    }

    fn include(&mut self, entry: &MempoolEntry, fee: Amount, sigops: u32) {
        self.coins.apply(&entry.tx, self.height);
        self.transactions.push((*entry.tx).clone());
        self.fees.push(fee);
        self.sigops.push(sigops);
        self.block_size += entry.size as u64;
        self.block_sigops += sigops;
        // Fees are bounded by inputs already checked against the money
        // range; the final reward check catches anything larger.
        self.total_fees = self.total_fees.checked_add(fee).unwrap_or(Amount::MAX);
    }

    fn evict(&mut self, txid: Txid) {
        if !self.evicted.contains(&txid) {
            self.evicted.push(txid);
        }
    }
}

fn merkle_root(transactions: &[Transaction]) -> TxMerkleNode {
    let hashes = transactions.iter().map(|tx| tx.compute_txid().to_raw_hash());
    merkle_tree::calculate_root(hashes)
        .map(TxMerkleNode::from_raw_hash)
        .unwrap_or_else(TxMerkleNode::all_zeros)
}

fn compact_size_len(n: usize) -> usize {
    match n {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}
