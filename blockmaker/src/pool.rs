//! Mining thread pool.
//!
//! The pool owns the worker threads and the state they share: the hash
//! meter, the event channel and the wakeup used by the readiness gates.
//! Starting a pool always stops the previous generation of workers first,
//! joining every thread, so at most one set of workers runs at a time.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use bitcoin::BlockHash;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::chain::{BlockSink, ChainIndex, NetworkStatus, PayoutProvider, TransactionValidator};
use crate::config::MinerConfig;
use crate::consensus::ConsensusParams;
use crate::error::Result;
use crate::mempool::Mempool;
use crate::search::hasher::PowHasher;
use crate::search::meter::HashMeter;
use crate::template::TemplateStats;
use crate::tracing::prelude::*;
use crate::types::{HashRate, Wakeup};
use crate::utxo::CoinsView;
use crate::worker::MinerWorker;

/// Capacity of the event channel. Slow subscribers miss old events.
const EVENT_CAPACITY: usize = 64;

/// Handles to the node components the miners work against.
#[derive(Clone)]
pub struct MinerContext {
    pub params: ConsensusParams,
    pub chain: Arc<dyn ChainIndex>,
    pub network: Arc<dyn NetworkStatus>,
    pub mempool: Arc<dyn Mempool>,
    pub coins: Arc<dyn CoinsView>,
    pub validator: Arc<dyn TransactionValidator>,
    pub sink: Arc<dyn BlockSink>,
    pub hasher: Arc<dyn PowHasher>,
}

/// Notifications for telemetry consumers.
#[derive(Debug, Clone, PartialEq)]
pub enum MinerEvent {
    TemplateBuilt {
        worker_id: usize,
        stats: TemplateStats,
    },
    BlockFound {
        worker_id: usize,
        hash: BlockHash,
        height: u32,
    },
    BlockRejected {
        worker_id: usize,
        hash: BlockHash,
        reason: String,
    },
}

/// State shared by every worker of a pool.
pub(crate) struct Shared {
    pub meter: HashMeter,
    pub wakeup: Arc<Wakeup>,
    pub events: broadcast::Sender<MinerEvent>,
    pub active: AtomicUsize,
    last_stats: Mutex<Option<TemplateStats>>,
}

impl Shared {
    pub fn new(config: &MinerConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            meter: HashMeter::new(config.hash_meter_window, config.hash_log_interval),
            wakeup: Arc::new(Wakeup::new()),
            events,
            active: AtomicUsize::new(0),
            last_stats: Mutex::new(None),
        }
    }

    pub fn template_built(&self, worker_id: usize, stats: TemplateStats) {
        *self.last_stats.lock() = Some(stats);
        self.emit(MinerEvent::TemplateBuilt { worker_id, stats });
    }

    pub fn last_stats(&self) -> Option<TemplateStats> {
        *self.last_stats.lock()
    }

    pub fn emit(&self, event: MinerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

struct Running {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// Starts, stops and resizes the set of mining threads.
pub struct MinerPool {
    context: Arc<MinerContext>,
    config: Arc<MinerConfig>,
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,

    /// Held for the whole of a start or stop, so one finishes before the
    /// next begins.
    lifecycle: Mutex<()>,
}

impl MinerPool {
    pub fn new(context: MinerContext, config: MinerConfig) -> Self {
        let shared = Arc::new(Shared::new(&config));
        Self {
            context: Arc::new(context),
            config: Arc::new(config),
            shared,
            running: Mutex::new(None),
            lifecycle: Mutex::new(()),
        }
    }

    /// Replace the running workers with `workers` new ones paying to
    /// `payout`. Zero workers leaves the pool stopped.
    ///
    /// Configuration errors are reported here, before any thread starts.
    pub fn start(&self, workers: usize, payout: Arc<dyn PayoutProvider>) -> Result<()> {
        let _lifecycle = self.lifecycle.lock();
        self.stop_running();
        self.config.validate(&self.context.params)?;
        if workers == 0 {
            return Ok(());
        }

        let cancel = CancellationToken::new();
        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers {
            let worker = MinerWorker::new(
                id,
                Arc::clone(&self.context),
                Arc::clone(&self.shared),
                Arc::clone(&self.config),
                Arc::clone(&payout),
                cancel.clone(),
            );
            let spawned = thread::Builder::new()
                .name(format!("miner-{id}"))
                .spawn(move || worker.run());

            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    error!(worker_id = id, error = %e, "Failed to spawn miner thread");
                    cancel.cancel();
                    self.shared.wakeup.notify();
                    join_all(handles);
                    return Err(e.into());
                }
            }
        }

        info!(workers, "Mining started");
        *self.running.lock() = Some(Running { cancel, handles });
        Ok(())
    }

    /// Start as many workers as the configuration asks for, or none when
    /// generation is disabled.
    pub fn start_configured(&self, payout: Arc<dyn PayoutProvider>) -> Result<()> {
        let workers = if self.config.generate {
            self.config.worker_count()
        } else {
            0
        };
        self.start(workers, payout)
    }

    /// Cancel all workers and wait for their threads to exit.
    pub fn stop(&self) {
        let _lifecycle = self.lifecycle.lock();
        self.stop_running();
    }

    fn stop_running(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };

        running.cancel.cancel();
        self.shared.wakeup.notify();
        let workers = running.handles.len();
        join_all(running.handles);
        self.shared.meter.reset();
        info!(workers, "Mining stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Hash rate over the last completed meter window, all workers combined.
    pub fn current_hash_rate(&self) -> HashRate {
        self.shared.meter.rate()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MinerEvent> {
        self.shared.events.subscribe()
    }

    /// Notify this when peers or pending transactions change so workers
    /// waiting on them re-check without waiting out their poll interval.
    pub fn notifier(&self) -> Arc<Wakeup> {
        Arc::clone(&self.shared.wakeup)
    }

    /// Threads started by the last `start`.
    pub fn worker_count(&self) -> usize {
        self.running
            .lock()
            .as_ref()
            .map_or(0, |running| running.handles.len())
    }

    /// Threads currently inside their mining loop.
    pub fn active_workers(&self) -> usize {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Statistics of the most recently built template.
    pub fn last_template_stats(&self) -> Option<TemplateStats> {
        self.shared.last_stats()
    }
}

impl Drop for MinerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        let name = handle.thread().name().map(str::to_owned);
        if handle.join().is_err() {
            error!(thread = ?name, "Miner thread panicked");
        }
    }
}
