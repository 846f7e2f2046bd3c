//! Pending transactions and the order they are offered to a template.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

use bitcoin::{Amount, Transaction, Txid};

use crate::consensus::{COIN, legacy_sigops};

/// Priority above which a transaction may be mined without paying the
/// minimum relay fee. One coin a day old in a 250-byte transaction.
pub const FREE_PRIORITY_THRESHOLD: f64 = (COIN * 144 / 250) as f64;

/// One mempool transaction with the figures the block maker needs.
#[derive(Debug, Clone)]
pub struct MempoolEntry {
    pub txid: Txid,
    pub tx: Arc<Transaction>,

    /// Serialized size in bytes.
    pub size: usize,

    /// Legacy signature operations. P2SH sigops need the spent outputs and
    /// are counted during the build.
    pub sigops: u32,
}

impl MempoolEntry {
    pub fn new(tx: Transaction) -> Self {
        Self {
            txid: tx.compute_txid(),
            size: tx.total_size(),
            sigops: legacy_sigops(&tx),
            tx: Arc::new(tx),
        }
    }
}

/// Point-in-time copy of the mempool.
///
/// Entries keep the mempool's own iteration order; ordering for block
/// inclusion is decided by the builder.
#[derive(Debug, Clone, Default)]
pub struct MempoolSnapshot {
    entries: Vec<MempoolEntry>,
    by_txid: HashMap<Txid, usize>,
}

impl MempoolSnapshot {
    /// Index `entries` by txid.
    pub fn from_entries(entries: Vec<MempoolEntry>) -> Self {
        let by_txid: HashMap<Txid, usize> = entries
            .iter()
            .enumerate()
            .map(|(i, entry)| (entry.txid, i))
            .collect();

        Self { entries, by_txid }
    }

    pub fn entries(&self) -> &[MempoolEntry] {
        &self.entries
    }

    pub fn get(&self, txid: &Txid) -> Option<&MempoolEntry> {
        self.by_txid.get(txid).map(|&i| &self.entries[i])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The node's transaction memory pool.
pub trait Mempool: Send + Sync {
    fn snapshot(&self) -> MempoolSnapshot;

    /// Changes whenever the set of transactions changes.
    fn transaction_set_version(&self) -> u64;

    /// Remove transactions found unusable during a build.
    fn evict(&self, txids: &[Txid]);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A snapshot entry ready for selection, with its ordering keys.
#[derive(Debug, Clone, Copy)]
pub struct CandidateTransaction {
    /// Position in the snapshot.
    pub index: usize,

    /// Value-weighted input age per byte.
    pub priority: f64,

    pub fee: Amount,

    /// Fee in satoshis per 1000 bytes.
    pub fee_per_kb: u64,
}

impl CandidateTransaction {
    pub fn new(index: usize, tx: &Transaction, size: usize, input_age: f64, fee: Amount) -> Self {
        Self {
            index,
            priority: priority(tx, size, input_age),
            fee,
            fee_per_kb: fee_per_kb(fee, size),
        }
    }

    /// Whether the transaction is old and valuable enough to mine for free.
    pub fn allows_free(&self) -> bool {
        self.priority > FREE_PRIORITY_THRESHOLD
    }
}

/// Size used for priority, discounting the bytes every input must spend.
pub fn modified_size(tx: &Transaction, size: usize) -> usize {
    tx.input.iter().fold(size, |size, input| {
        let offset = 41 + input.script_sig.len().min(110);
        if size > offset { size - offset } else { size }
    })
}

/// `input_age` is the sum of input value times confirmations.
pub fn priority(tx: &Transaction, size: usize, input_age: f64) -> f64 {
    match modified_size(tx, size) {
        0 => 0.0,
        size => input_age / size as f64,
    }
}

pub fn fee_per_kb(fee: Amount, size: usize) -> u64 {
    if size == 0 {
        return 0;
    }
    fee.to_sat().saturating_mul(1000) / size as u64
}

/// Max-heap of candidates ordered by priority or by fee rate.
pub(crate) struct CandidateQueue {
    heap: BinaryHeap<Ranked>,
    by_fee: bool,
}

impl CandidateQueue {
    pub fn new(by_fee: bool) -> Self {
        Self {
            heap: BinaryHeap::new(),
            by_fee,
        }
    }

    pub fn is_by_fee(&self) -> bool {
        self.by_fee
    }

    pub fn push(&mut self, candidate: CandidateTransaction) {
        self.heap.push(Ranked {
            candidate,
            by_fee: self.by_fee,
        });
    }

    pub fn pop(&mut self) -> Option<CandidateTransaction> {
        self.heap.pop().map(|ranked| ranked.candidate)
    }

    /// Re-rank everything still queued by fee rate.
    pub fn sort_by_fee(&mut self) {
        if self.by_fee {
            return;
        }
        self.by_fee = true;
        let queued = std::mem::take(&mut self.heap);
        self.heap = queued
            .into_iter()
            .map(|ranked| Ranked {
                by_fee: true,
                ..ranked
            })
            .collect();
    }
}

struct Ranked {
    candidate: CandidateTransaction,
    by_fee: bool,
}

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        let (a, b) = (&self.candidate, &other.candidate);
        let by_priority = a.priority.total_cmp(&b.priority);
        let by_fee = a.fee_per_kb.cmp(&b.fee_per_kb);
        let primary = if self.by_fee {
            by_fee.then(by_priority)
        } else {
            by_priority.then(by_fee)
        };
        // Earlier snapshot position wins ties.
        primary.then_with(|| b.index.cmp(&a.index))
    }
}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ranked {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{spend, txid};
    use test_case::test_case;

    fn candidate(index: usize, priority: f64, fee_per_kb: u64) -> CandidateTransaction {
        CandidateTransaction {
            index,
            priority,
            fee: Amount::from_sat(fee_per_kb),
            fee_per_kb,
        }
    }

    #[test]
    fn snapshot_keeps_order_and_indexes_by_txid() {
        let parent = spend(&[(txid(1), 0)], &[1_000, 1_000]);
        let parent_id = parent.compute_txid();
        let child = spend(&[(parent_id, 0), (parent_id, 1), (txid(2), 0)], &[1_500]);
        let child_id = child.compute_txid();

        let snapshot =
            MempoolSnapshot::from_entries(vec![MempoolEntry::new(child), MempoolEntry::new(parent)]);

        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.entries()[0].txid, child_id);
        assert_eq!(snapshot.get(&parent_id).unwrap().txid, parent_id);
        assert!(snapshot.get(&txid(2)).is_none());
    }

    #[test]
    fn queue_orders_by_priority_then_switches_to_fee() {
        let mut queue = CandidateQueue::new(false);
        queue.push(candidate(0, 10.0, 500));
        queue.push(candidate(1, 30.0, 100));
        queue.push(candidate(2, 20.0, 900));

        assert_eq!(queue.pop().unwrap().index, 1);

        queue.sort_by_fee();
        assert!(queue.is_by_fee());
        assert_eq!(queue.pop().unwrap().index, 2);
        assert_eq!(queue.pop().unwrap().index, 0);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn ties_keep_snapshot_order() {
        let mut queue = CandidateQueue::new(true);
        queue.push(candidate(3, 0.0, 1_000));
        queue.push(candidate(1, 0.0, 1_000));
        queue.push(candidate(2, 0.0, 1_000));
        let order: Vec<usize> = std::iter::from_fn(|| queue.pop()).map(|c| c.index).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test_case(10_000, 250, 40_000; "typical")]
    #[test_case(0, 250, 0; "free")]
    #[test_case(1_000, 0, 0; "empty_size")]
    fn fee_rate_per_kilobyte(fee: u64, size: usize, expected: u64) {
        assert_eq!(fee_per_kb(Amount::from_sat(fee), size), expected);
    }

    #[test]
    fn priority_discounts_input_overhead() {
        let tx = spend(&[(txid(1), 0)], &[1_000]);
        // Empty script_sig: 41 bytes discounted per input.
        assert_eq!(modified_size(&tx, 200), 159);
        assert_eq!(modified_size(&tx, 30), 30);
        assert_eq!(priority(&tx, 141, 1_000.0), 10.0);
    }

    #[test]
    fn free_threshold_is_one_coin_day_per_250_bytes() {
        assert_eq!(FREE_PRIORITY_THRESHOLD, 57_600_000.0);
        assert!(!candidate(0, FREE_PRIORITY_THRESHOLD, 0).allows_free());
        assert!(candidate(0, FREE_PRIORITY_THRESHOLD + 1.0, 0).allows_free());
    }
}
