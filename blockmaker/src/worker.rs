//! One mining thread.
//!
//! A worker loops until cancelled: wait until the node is ready to mine,
//! build a template, roll its extra nonce, search it, and hand any solved
//! block to the node. Every wait goes through the pool's [`Wakeup`] so a
//! stop or a peer/mempool change is seen without sitting out a full poll
//! interval.
//!
//! [`Wakeup`]: crate::types::Wakeup

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use bitcoin::block::Header;
use tokio_util::sync::CancellationToken;

use crate::backoff::ExponentialBackoff;
use crate::chain::{ChainTip, PayoutProvider, SubmitError};
use crate::config::{BlockLimits, MinerConfig};
use crate::pool::{MinerContext, MinerEvent, Shared};
use crate::search::retarget::DifficultyRetargeter;
use crate::search::{ProofOfWorkSearcher, SearchState, StaleReason, StaleWatch};
use crate::target::DifficultyTarget;
use crate::template::coinbase::CoinbaseComposer;
use crate::template::extranonce::ExtraNonceState;
use crate::template::{BlockTemplate, BuildError, TemplateBuilder};
use crate::tracing::prelude::*;

/// Longest uninterrupted sleep inside [`MinerWorker::pause`].
const CANCEL_SLICE: Duration = Duration::from_millis(100);

pub struct MinerWorker {
    id: usize,
    context: Arc<MinerContext>,
    shared: Arc<Shared>,
    config: Arc<MinerConfig>,
    payout: Arc<dyn PayoutProvider>,
    cancel: CancellationToken,
    composer: CoinbaseComposer,
    limits: BlockLimits,
    extra_nonce: ExtraNonceState,
    backoff: ExponentialBackoff,
}

/// What one pass through the loop did.
#[derive(Debug, PartialEq, Eq)]
enum Attempt {
    Searched(SearchState),

    /// Template had no transactions besides the coinbase.
    SkippedEmpty,
}

impl MinerWorker {
    pub(crate) fn new(
        id: usize,
        context: Arc<MinerContext>,
        shared: Arc<Shared>,
        config: Arc<MinerConfig>,
        payout: Arc<dyn PayoutProvider>,
        cancel: CancellationToken,
    ) -> Self {
        let composer = CoinbaseComposer::new(config.coinbase_flags.as_bytes());
        let limits = BlockLimits::from_config(&config, &context.params);
        let backoff = ExponentialBackoff::new(config.build_retry_initial, config.build_retry_max);
        Self {
            id,
            extra_nonce: ExtraNonceState::new(composer.clone()),
            composer,
            limits,
            backoff,
            context,
            shared,
            config,
            payout,
            cancel,
        }
    }

    /// Mine until cancelled.
    pub fn run(mut self) {
        let shared = Arc::clone(&self.shared);
        let _active = ActiveGuard::enter(&shared.active);
        info!(worker_id = self.id, "Miner worker started");

        while self.wait_for_peers() && self.wait_for_transactions() {
            match self.mine_once() {
                Ok(attempt) => {
                    self.backoff.reset();
                    match attempt {
                        Attempt::Searched(SearchState::Stale(StaleReason::Cancelled)) => break,
                        Attempt::Searched(state) => {
                            debug!(worker_id = self.id, outcome = ?state, "Search ended");
                        }
                        Attempt::SkippedEmpty => {
                            trace!(worker_id = self.id, "Skipping coinbase-only template");
                            self.pause(self.config.mempool_poll_interval);
                        }
                    }
                }
                Err(e) => {
                    let delay = self.backoff.next_delay();
                    warn!(
                        worker_id = self.id,
                        error = %e,
                        retry_ms = delay.as_millis() as u64,
                        "Failed to build block template"
                    );
                    self.pause(delay);
                }
            }
        }

        info!(worker_id = self.id, "Miner worker stopped");
    }

    /// On networks that mine only with peers, block until there is one and
    /// the initial block download is over. Returns false once cancelled.
    fn wait_for_peers(&self) -> bool {
        let network = &self.context.network;
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            let ready = !network.requires_peers()
                || (network.peer_count() > 0 && !network.is_initial_block_download());
            if ready {
                return true;
            }
            self.pause(self.config.peer_poll_interval);
        }
    }

    /// Block until there are transactions to mine. Near the start of a
    /// chain blocks are mined regardless. Returns false once cancelled.
    fn wait_for_transactions(&self) -> bool {
        if !self.config.require_transactions {
            return !self.cancel.is_cancelled();
        }
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            let bootstrapping = self
                .context
                .chain
                .tip()
                .is_none_or(|tip| tip.height < self.config.bootstrap_height);
            if bootstrapping || !self.context.mempool.is_empty() {
                return true;
            }
            self.pause(self.config.mempool_poll_interval);
        }
    }

    fn mine_once(&mut self) -> Result<Attempt, BuildError> {
        let context = Arc::clone(&self.context);
        let mempool_version = context.mempool.transaction_set_version();
        let tip = context.chain.tip();
        let payout = self.payout.payout_script()?;

        let mut builder = TemplateBuilder::new(
            &context.params,
            context.chain.as_ref(),
            context.network.as_ref(),
            context.validator.as_ref(),
            &self.composer,
        )
        .with_min_relay_fee(self.config.min_relay_fee_per_kb);
        if let Some(version) = self.config.block_version {
            builder = builder.with_block_version(version);
        }

        let output = {
            let snapshot = context.mempool.snapshot();
            builder.build(
                payout,
                tip.as_ref(),
                &snapshot,
                context.coins.as_ref(),
                &self.limits,
            )?
        };
        let tip = tip.ok_or(BuildError::NoChainTip)?;

        if !output.evicted.is_empty() {
            debug!(
                worker_id = self.id,
                count = output.evicted.len(),
                "Evicting transactions with missing inputs"
            );
            context.mempool.evict(&output.evicted);
        }
        self.shared.template_built(self.id, output.stats);

        let mut template = output.template;
        self.extra_nonce.increment(&mut template, &tip)?;

        if template.is_empty() && !self.config.allow_empty_blocks {
            return Ok(Attempt::SkippedEmpty);
        }

        debug!(
            worker_id = self.id,
            height = template.height(),
            txs = template.tx_count(),
            size = template.size(),
            extra_nonce = self.extra_nonce.value(),
            "Searching block template"
        );

        let mut watch = StaleWatch::new(
            &self.cancel,
            context.chain.as_ref(),
            context.mempool.as_ref(),
            context.network.as_ref(),
        )
        .with_mempool_refresh(self.config.mempool_refresh_interval);
        watch.watch(tip, mempool_version);

        let searcher = ProofOfWorkSearcher::new(
            context.hasher.as_ref(),
            &self.shared.meter,
            DifficultyRetargeter::new(context.chain.as_ref(), context.network.as_ref()),
        )
        .with_nonce_limit(self.config.nonce_limit);

        let mut header = *template.header();
        let state = searcher.search(&mut header, &watch);
        if state == SearchState::Found {
            self.deliver(template, header, &tip);
        }
        Ok(Attempt::Searched(state))
    }

    /// Hand a solved block to the node, unless the chain moved on while it
    /// was being solved.
    fn deliver(&self, template: BlockTemplate, header: Header, tip: &ChainTip) {
        let hash = header.block_hash();
        let height = template.height();

        let current = self.context.chain.tip().map(|tip| tip.hash);
        if current != Some(tip.hash) {
            warn!(worker_id = self.id, %hash, height, "Generated block is stale");
            return;
        }

        let difficulty = DifficultyTarget::from_compact_lossy(header.bits).difficulty();
        info!(
            worker_id = self.id,
            %hash,
            height,
            nonce = header.nonce,
            difficulty,
            txs = template.tx_count(),
            reward = %template.reward(),
            "Block found"
        );

        match self.context.sink.submit(template.into_block(header)) {
            Ok(()) => {
                self.payout.keep();
                self.shared.emit(MinerEvent::BlockFound {
                    worker_id: self.id,
                    hash,
                    height,
                });
            }
            Err(SubmitError::Stale(_)) => {
                warn!(worker_id = self.id, %hash, "Generated block is stale");
            }
            Err(e) => {
                warn!(worker_id = self.id, %hash, error = %e, "Block rejected");
                self.shared.emit(MinerEvent::BlockRejected {
                    worker_id: self.id,
                    hash,
                    reason: e.to_string(),
                });
            }
        }
    }

    /// Sleep up to `timeout`, until woken, or until cancelled.
    fn pause(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while !self.cancel.is_cancelled() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return;
            }
            // A stop that lands between the cancel check and the wait is
            // still seen within one slice.
            if self.shared.wakeup.wait_for(remaining.min(CANCEL_SLICE)) {
                return;
            }
        }
    }
}

/// Counts a worker as active for as long as it lives.
struct ActiveGuard<'a>(&'a AtomicUsize);

impl<'a> ActiveGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainIndex;
    use crate::consensus::ConsensusParams;
    use crate::mempool::Mempool;
    use crate::testing::{
        CountingPayout, FakeChain, FakeMempool, FakeNetwork, FakeValidator,
        MemoryCoins, RecordingSink, WinningNonce, p2pkh_script, spend, txid,
    };
    use bitcoin::OutPoint;
    use std::collections::HashSet;

    /// Bits only the all-zero hash meets.
    const HARD_BITS: u32 = 0x0300_0001;

    struct Fixture {
        chain: Arc<FakeChain>,
        network: Arc<FakeNetwork>,
        mempool: Arc<FakeMempool>,
        coins: Arc<MemoryCoins>,
        sink: Arc<RecordingSink>,
        payout: Arc<CountingPayout>,
        shared: Arc<Shared>,
        cancel: CancellationToken,
    }

    impl Fixture {
        fn new(height: u32) -> Self {
            let chain = Arc::new(FakeChain::at(height));
            Self {
                sink: Arc::new(RecordingSink::extending(Arc::clone(&chain))),
                chain,
                network: Arc::new(FakeNetwork::default()),
                mempool: Arc::new(FakeMempool::default()),
                coins: Arc::new(MemoryCoins::default()),
                payout: Arc::new(CountingPayout::new(p2pkh_script(5))),
                shared: Arc::new(Shared::new(&MinerConfig::default())),
                cancel: CancellationToken::new(),
            }
        }

        fn worker(&self, config: MinerConfig, winning: Option<u32>) -> MinerWorker {
            self.worker_with(config, winning, HashSet::new())
        }

        fn worker_with(
            &self,
            config: MinerConfig,
            winning: Option<u32>,
            rejected: HashSet<bitcoin::Txid>,
        ) -> MinerWorker {
            let context = MinerContext {
                params: ConsensusParams::default(),
                chain: self.chain.clone(),
                network: self.network.clone(),
                mempool: self.mempool.clone(),
                coins: self.coins.clone(),
                validator: Arc::new(FakeValidator { rejected }),
                sink: self.sink.clone(),
                hasher: Arc::new(WinningNonce(winning)),
            };
            MinerWorker::new(
                0,
                Arc::new(context),
                Arc::clone(&self.shared),
                Arc::new(config),
                self.payout.clone(),
                self.cancel.clone(),
            )
        }
    }

    fn config() -> MinerConfig {
        MinerConfig {
            allow_empty_blocks: true,
            nonce_limit: 4_096,
            ..MinerConfig::default()
        }
    }

    #[test]
    fn solved_template_is_submitted() {
        let fixture = Fixture::new(10);
        let mut events = fixture.shared.events.subscribe();
        let mut worker = fixture.worker(config(), Some(300));

        let attempt = worker.mine_once().unwrap();
        assert_eq!(attempt, Attempt::Searched(SearchState::Found));

        let blocks = fixture.sink.blocks();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].header.nonce, 300);
        assert!(blocks[0].check_merkle_root());
        assert_eq!(fixture.payout.kept.load(Ordering::SeqCst), 1);

        assert!(matches!(
            events.try_recv().unwrap(),
            MinerEvent::TemplateBuilt { worker_id: 0, .. }
        ));
        match events.try_recv().unwrap() {
            MinerEvent::BlockFound { height, hash, .. } => {
                assert_eq!(height, 11);
                assert_eq!(hash, blocks[0].block_hash());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn coinbase_carries_rolled_extra_nonce() {
        let fixture = Fixture::new(10);
        let mut worker = fixture.worker(config(), Some(0));

        worker.mine_once().unwrap();
        assert_eq!(worker.extra_nonce.value(), 1);

        let coinbase = &fixture.sink.blocks()[0].txdata[0];
        let expected = worker.composer.script_sig(11, 1).unwrap();
        assert_eq!(coinbase.input[0].script_sig, expected);
    }

    #[test]
    fn exhausted_search_submits_nothing() {
        let fixture = Fixture::new(10);
        fixture.chain.set_bits(HARD_BITS);
        let mut worker = fixture.worker(config(), None);

        let attempt = worker.mine_once().unwrap();
        assert_eq!(attempt, Attempt::Searched(SearchState::Exhausted));
        assert!(fixture.sink.blocks().is_empty());
        assert_eq!(fixture.payout.kept.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn coinbase_only_template_is_skipped() {
        let fixture = Fixture::new(10);
        let mut worker = fixture.worker(
            MinerConfig {
                allow_empty_blocks: false,
                ..config()
            },
            Some(0),
        );

        assert_eq!(worker.mine_once().unwrap(), Attempt::SkippedEmpty);
        assert!(fixture.sink.blocks().is_empty());
        assert!(fixture.shared.last_stats().is_some());
    }

    #[test]
    fn mempool_transactions_are_mined() {
        let fixture = Fixture::new(10);
        fixture.coins.insert(OutPoint::new(txid(1), 0), 60_000, 5);
        fixture.mempool.add(spend(&[(txid(1), 0)], &[50_000]));
        let mut worker = fixture.worker(
            MinerConfig {
                allow_empty_blocks: false,
                ..config()
            },
            Some(7),
        );

        worker.mine_once().unwrap();
        let block = &fixture.sink.blocks()[0];
        assert_eq!(block.txdata.len(), 2);
        assert_eq!(
            block.txdata[0].output[0].value,
            ConsensusParams::default().subsidy.subsidy_at(11) + bitcoin::Amount::from_sat(10_000)
        );
    }

    #[test]
    fn transactions_with_missing_inputs_are_evicted() {
        let fixture = Fixture::new(10);
        let orphaned = spend(&[(txid(2), 0)], &[1_000]);
        let orphaned_id = orphaned.compute_txid();
        fixture.mempool.add(orphaned);
        let mut worker = fixture.worker(config(), Some(0));

        worker.mine_once().unwrap();
        assert_eq!(fixture.mempool.evicted(), vec![orphaned_id]);
        assert!(fixture.mempool.is_empty());
        assert_eq!(fixture.sink.blocks()[0].txdata.len(), 1);
    }

    #[test]
    fn stale_block_is_not_submitted() {
        let fixture = Fixture::new(10);
        let tip = fixture.chain.tip().unwrap();
        let mut worker = fixture.worker(config(), Some(0));
        worker.mine_once().unwrap();
        let solved = fixture.sink.blocks().remove(0);

        // Chain has since moved past `tip`; delivering a block built on it
        // again must not reach the sink.
        let template = {
            let context = Arc::clone(&worker.context);
            let builder = TemplateBuilder::new(
                &context.params,
                context.chain.as_ref(),
                context.network.as_ref(),
                context.validator.as_ref(),
                &worker.composer,
            );
            let snapshot = context.mempool.snapshot();
            builder
                .build(
                    p2pkh_script(5),
                    Some(&tip),
                    &snapshot,
                    context.coins.as_ref(),
                    &worker.limits,
                )
                .unwrap()
                .template
        };
        worker.deliver(template, solved.header, &tip);

        assert_eq!(fixture.sink.blocks().len(), 1);
        assert_eq!(fixture.payout.kept.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn rejected_block_keeps_no_payout() {
        let fixture = Fixture::new(10);
        fixture
            .sink
            .reject_with(SubmitError::Rejected("bad-cb-amount".into()));
        let mut events = fixture.shared.events.subscribe();
        let mut worker = fixture.worker(config(), Some(0));

        worker.mine_once().unwrap();
        assert_eq!(fixture.payout.kept.load(Ordering::SeqCst), 0);

        let rejected = std::iter::from_fn(|| events.try_recv().ok())
            .find(|event| matches!(event, MinerEvent::BlockRejected { .. }));
        match rejected {
            Some(MinerEvent::BlockRejected { reason, .. }) => {
                assert!(reason.contains("bad-cb-amount"));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn unavailable_payout_fails_the_build() {
        let fixture = Fixture::new(10);
        fixture.payout.unavailable.store(true, Ordering::SeqCst);
        let mut worker = fixture.worker(config(), Some(0));

        assert!(matches!(worker.mine_once(), Err(BuildError::Payout(_))));
        assert!(fixture.shared.last_stats().is_none());
    }

    #[test]
    fn missing_tip_fails_the_build() {
        let fixture = Fixture::new(10);
        let mut worker = fixture.worker(config(), Some(0));
        let context = MinerContext {
            chain: Arc::new(FakeChain::empty()),
            ..(*worker.context).clone()
        };
        worker.context = Arc::new(context);

        assert!(matches!(worker.mine_once(), Err(BuildError::NoChainTip)));
    }

    #[test]
    fn cancelled_worker_exits_without_mining() {
        let fixture = Fixture::new(10);
        fixture.cancel.cancel();
        let worker = fixture.worker(config(), Some(0));

        worker.run();
        assert!(fixture.sink.blocks().is_empty());
        assert_eq!(fixture.shared.active.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn bootstrap_height_bypasses_mempool_gate() {
        let fixture = Fixture::new(10);
        let worker = fixture.worker(MinerConfig::default(), Some(0));
        assert!(worker.wait_for_transactions());
    }

    #[test]
    fn initial_download_blocks_peer_gate_until_cancelled() {
        let fixture = Fixture::new(10);
        fixture.network.requires_peers.store(true, Ordering::SeqCst);
        fixture.network.peers.store(2, Ordering::SeqCst);
        fixture.network.initial_download.store(true, Ordering::SeqCst);
        let worker = fixture.worker(
            MinerConfig {
                peer_poll_interval: Duration::from_millis(5),
                ..config()
            },
            Some(0),
        );

        let cancel = fixture.cancel.clone();
        let wakeup = Arc::clone(&fixture.shared.wakeup);
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            cancel.cancel();
            wakeup.notify();
        });
        assert!(!worker.wait_for_peers());
        canceller.join().unwrap();
    }

    #[test]
    fn initial_download_is_ignored_without_required_peers() {
        let fixture = Fixture::new(0);
        fixture.network.initial_download.store(true, Ordering::SeqCst);
        let worker = fixture.worker(config(), Some(0));

        assert!(worker.wait_for_peers());
    }
}
