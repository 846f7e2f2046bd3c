//! In-memory stand-ins for the node and transaction builders used by tests.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use bitcoin::absolute::LockTime;
use bitcoin::block::Header;
use bitcoin::hashes::Hash;
use bitcoin::pow::CompactTarget;
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, Block, BlockHash, OutPoint, PubkeyHash, ScriptBuf, Sequence, Transaction, TxIn,
    TxOut, Txid, Witness,
};
use parking_lot::Mutex;

use crate::chain::{
    BlockSink, ChainIndex, ChainTip, NetworkStatus, PayoutError, PayoutProvider, SubmitError,
    TransactionValidator,
};
use crate::mempool::{Mempool, MempoolEntry, MempoolSnapshot};
use crate::search::hasher::PowHasher;
use crate::utxo::{Coin, CoinsOverlay, CoinsView};

/// Regtest-style bits: roughly every other hash meets the target.
pub const EASY_BITS: u32 = 0x207f_ffff;

/// Median time past of every fake tip.
pub const TIP_TIME: u32 = 1_600_000_000;

pub fn txid(n: u8) -> Txid {
    Txid::from_byte_array([n; 32])
}

pub fn block_hash(n: u32) -> BlockHash {
    let mut bytes = [0u8; 32];
    bytes[..4].copy_from_slice(&n.to_le_bytes());
    bytes[31] = 0xb1;
    BlockHash::from_byte_array(bytes)
}

pub fn p2pkh_script(n: u8) -> ScriptBuf {
    ScriptBuf::new_p2pkh(&PubkeyHash::from_byte_array([n; 20]))
}

/// Transaction spending `inputs` into outputs of the given values.
pub fn spend(inputs: &[(Txid, u32)], outputs: &[u64]) -> Transaction {
    Transaction {
        version: Version::ONE,
        lock_time: LockTime::ZERO,
        input: inputs
            .iter()
            .map(|&(txid, vout)| TxIn {
                previous_output: OutPoint::new(txid, vout),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            })
            .collect(),
        output: outputs
            .iter()
            .map(|&value| TxOut {
                value: Amount::from_sat(value),
                script_pubkey: p2pkh_script(0xaa),
            })
            .collect(),
    }
}

pub fn tx_with_lock_time(lock_time: u32) -> Transaction {
    let mut tx = spend(&[(txid(9), 0)], &[1_000]);
    tx.lock_time = LockTime::from_consensus(lock_time);
    tx
}

pub fn tip_at(height: u32) -> ChainTip {
    ChainTip {
        hash: block_hash(height),
        height,
        median_time_past: TIP_TIME,
    }
}

pub fn header_on(tip: &ChainTip, bits: u32) -> Header {
    Header {
        version: bitcoin::block::Version::TWO,
        prev_blockhash: tip.hash,
        merkle_root: bitcoin::TxMerkleNode::all_zeros(),
        time: tip.min_time(),
        bits: CompactTarget::from_consensus(bits),
        nonce: 0,
    }
}

#[derive(Default)]
pub struct MemoryCoins {
    coins: Mutex<HashMap<OutPoint, Coin>>,
}

impl MemoryCoins {
    pub fn insert(&self, outpoint: OutPoint, value: u64, height: u32) {
        self.coins.lock().insert(
            outpoint,
            Coin {
                output: TxOut {
                    value: Amount::from_sat(value),
                    script_pubkey: p2pkh_script(0xcc),
                },
                height,
                is_coinbase: false,
            },
        );
    }

    pub fn insert_script(&self, outpoint: OutPoint, value: u64, height: u32, script: ScriptBuf) {
        self.coins.lock().insert(
            outpoint,
            Coin {
                output: TxOut {
                    value: Amount::from_sat(value),
                    script_pubkey: script,
                },
                height,
                is_coinbase: false,
            },
        );
    }
}

impl CoinsView for MemoryCoins {
    fn coin(&self, outpoint: &OutPoint) -> Option<Coin> {
        self.coins.lock().get(outpoint).cloned()
    }
}

pub struct FakeChain {
    tip: Mutex<Option<ChainTip>>,
    bits: AtomicU32,
    min_difficulty_bits: AtomicU32,
}

impl FakeChain {
    pub fn at(height: u32) -> Self {
        Self {
            tip: Mutex::new(Some(tip_at(height))),
            bits: AtomicU32::new(EASY_BITS),
            min_difficulty_bits: AtomicU32::new(EASY_BITS),
        }
    }

    pub fn empty() -> Self {
        Self {
            tip: Mutex::new(None),
            bits: AtomicU32::new(EASY_BITS),
            min_difficulty_bits: AtomicU32::new(EASY_BITS),
        }
    }

    pub fn set_bits(&self, bits: u32) {
        self.bits.store(bits, Ordering::SeqCst);
    }

    /// Bits returned once a block time is past the tip by more than an hour.
    pub fn set_min_difficulty_bits(&self, bits: u32) {
        self.min_difficulty_bits.store(bits, Ordering::SeqCst);
    }

    /// Move the tip forward one block.
    pub fn advance(&self) -> ChainTip {
        let mut tip = self.tip.lock();
        let next = tip_at(tip.map_or(0, |t| t.height + 1));
        *tip = Some(next);
        next
    }
}

impl ChainIndex for FakeChain {
    fn tip(&self) -> Option<ChainTip> {
        *self.tip.lock()
    }

    fn next_work_required(&self, tip: &ChainTip, time: u32) -> CompactTarget {
        let raw = if time > tip.median_time_past + 3_600 {
            self.min_difficulty_bits.load(Ordering::SeqCst)
        } else {
            self.bits.load(Ordering::SeqCst)
        };
        CompactTarget::from_consensus(raw)
    }
}

pub struct FakeNetwork {
    pub time: AtomicU32,
    pub requires_peers: AtomicBool,
    pub peers: AtomicUsize,
    pub min_difficulty: AtomicBool,
    pub initial_download: AtomicBool,
}

impl Default for FakeNetwork {
    fn default() -> Self {
        Self {
            time: AtomicU32::new(TIP_TIME + 600),
            requires_peers: AtomicBool::new(false),
            peers: AtomicUsize::new(0),
            min_difficulty: AtomicBool::new(false),
            initial_download: AtomicBool::new(false),
        }
    }
}

impl NetworkStatus for FakeNetwork {
    fn adjusted_time(&self) -> u32 {
        self.time.load(Ordering::SeqCst)
    }

    fn requires_peers(&self) -> bool {
        self.requires_peers.load(Ordering::SeqCst)
    }

    fn peer_count(&self) -> usize {
        self.peers.load(Ordering::SeqCst)
    }

    fn allows_min_difficulty(&self) -> bool {
        self.min_difficulty.load(Ordering::SeqCst)
    }

    fn is_initial_block_download(&self) -> bool {
        self.initial_download.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct FakeMempool {
    txs: Mutex<Vec<Transaction>>,
    version: AtomicU64,
    evicted: Mutex<Vec<Txid>>,
}

impl FakeMempool {
    pub fn add(&self, tx: Transaction) {
        self.txs.lock().push(tx);
        self.version.fetch_add(1, Ordering::SeqCst);
    }

    pub fn evicted(&self) -> Vec<Txid> {
        self.evicted.lock().clone()
    }
}

impl Mempool for FakeMempool {
    fn snapshot(&self) -> MempoolSnapshot {
        let entries = self
            .txs
            .lock()
            .iter()
            .cloned()
            .map(MempoolEntry::new)
            .collect();
        MempoolSnapshot::from_entries(entries)
    }

    fn transaction_set_version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    fn evict(&self, txids: &[Txid]) {
        let mut txs = self.txs.lock();
        txs.retain(|tx| !txids.contains(&tx.compute_txid()));
        self.evicted.lock().extend_from_slice(txids);
        self.version.fetch_add(1, Ordering::SeqCst);
    }

    fn len(&self) -> usize {
        self.txs.lock().len()
    }
}

/// Records submitted blocks, optionally advancing a chain on acceptance.
#[derive(Default)]
pub struct RecordingSink {
    blocks: Mutex<Vec<Block>>,
    reject: Mutex<Option<SubmitError>>,
    chain: Option<Arc<FakeChain>>,
}

impl RecordingSink {
    pub fn extending(chain: Arc<FakeChain>) -> Self {
        Self {
            chain: Some(chain),
            ..Self::default()
        }
    }

    pub fn reject_with(&self, error: SubmitError) {
        *self.reject.lock() = Some(error);
    }

    pub fn blocks(&self) -> Vec<Block> {
        self.blocks.lock().clone()
    }
}

impl BlockSink for RecordingSink {
    fn submit(&self, block: Block) -> Result<(), SubmitError> {
        if let Some(error) = self.reject.lock().clone() {
            return Err(error);
        }
        self.blocks.lock().push(block);
        if let Some(chain) = &self.chain {
            chain.advance();
        }
        Ok(())
    }
}

pub struct CountingPayout {
    script: ScriptBuf,
    pub kept: AtomicUsize,
    pub unavailable: AtomicBool,
}

impl CountingPayout {
    pub fn new(script: ScriptBuf) -> Self {
        Self {
            script,
            kept: AtomicUsize::new(0),
            unavailable: AtomicBool::new(false),
        }
    }
}

impl PayoutProvider for CountingPayout {
    fn payout_script(&self) -> Result<ScriptBuf, PayoutError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(PayoutError::Unavailable);
        }
        Ok(self.script.clone())
    }

    fn keep(&self) {
        self.kept.fetch_add(1, Ordering::SeqCst);
    }
}

/// Accepts every transaction except the listed ones.
#[derive(Default)]
pub struct FakeValidator {
    pub rejected: HashSet<Txid>,
}

impl TransactionValidator for FakeValidator {
    fn check_inputs(
        &self,
        tx: &Transaction,
        _coins: &CoinsOverlay<'_>,
        _height: u32,
    ) -> anyhow::Result<()> {
        let txid = tx.compute_txid();
        if self.rejected.contains(&txid) {
            anyhow::bail!("script verification failed for {txid}");
        }
        Ok(())
    }
}

/// Meets any target at one nonce and misses everywhere else.
pub struct WinningNonce(pub Option<u32>);

impl PowHasher for WinningNonce {
    fn hash(&self, header: &Header) -> [u8; 32] {
        if Some(header.nonce) == self.0 {
            [0; 32]
        } else {
            [0xff; 32]
        }
    }
}
