use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::queue::WorkQueue;
use crate::reconciler::Reconciler;
use crate::store::{ResourceStore, StoreError};

/// Counters and flags read by the HTTP probes.
#[derive(Debug, Default)]
pub struct ControllerHealth {
    synced: AtomicBool,
    leader: AtomicBool,
    reconcile_success: AtomicU64,
    reconcile_failure: AtomicU64,
}

impl ControllerHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_synced(&self, synced: bool) {
        self.synced.store(synced, Ordering::SeqCst);
    }

    pub fn set_leader(&self, leader: bool) {
        self.leader.store(leader, Ordering::SeqCst);
    }

    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    /// Ready once the initial listing is queued and we hold leadership.
    pub fn is_ready(&self) -> bool {
        self.is_synced() && self.is_leader()
    }

    pub fn record_success(&self) {
        self.reconcile_success.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.reconcile_failure.fetch_add(1, Ordering::Relaxed);
    }

    pub fn successes(&self) -> u64 {
        self.reconcile_success.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.reconcile_failure.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub workers: usize,
    pub resync_interval: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            workers: 2,
            resync_interval: Duration::from_secs(300),
        }
    }
}

pub struct Controller {
    reconciler: Arc<Reconciler>,
    store: Arc<dyn ResourceStore>,
    queue: Arc<WorkQueue>,
    health: Arc<ControllerHealth>,
    settings: ControllerSettings,
}

impl Controller {
    pub fn new(
        reconciler: Arc<Reconciler>,
        store: Arc<dyn ResourceStore>,
        queue: Arc<WorkQueue>,
        health: Arc<ControllerHealth>,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            reconciler,
            store,
            queue,
            health,
            settings,
        }
    }

    /// Runs until `shutdown` is cancelled. In-flight reconciliations are
    /// dropped on cancellation; their keys are picked up again on next start.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), StoreError> {
        // Subscribe before listing so nothing written in between is missed.
        let watch = self.store.watch().await?;
        let queued = enqueue_all(self.store.as_ref(), &self.queue).await?;
        self.health.set_synced(true);
        info!(records = queued, workers = self.settings.workers, "controller started");

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        // Store watch -> queue.
        {
            let queue = self.queue.clone();
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                let mut watch = watch;
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        next = watch.next() => match next {
                            Some(key) => queue.add(key).await,
                            None => {
                                warn!("store watch ended; relying on periodic resync");
                                break;
                            }
                        },
                    }
                }
            }));
        }

        // Periodic resync.
        {
            let queue = self.queue.clone();
            let store = self.store.clone();
            let shutdown = shutdown.clone();
            let period = self.settings.resync_interval;
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = ticker.tick() => {
                            match enqueue_all(store.as_ref(), &queue).await {
                                Ok(n) => debug!(records = n, "resync"),
                                Err(e) => warn!(error = %e, "resync listing failed"),
                            }
                        }
                    }
                }
            }));
        }

        for worker_id in 0..self.settings.workers.max(1) {
            tasks.push(tokio::spawn(worker_loop(
                worker_id,
                self.reconciler.clone(),
                self.queue.clone(),
                self.health.clone(),
                shutdown.clone(),
            )));
        }

        shutdown.cancelled().await;
        info!("controller shutting down");
        self.queue.shutdown().await;
        self.health.set_synced(false);
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "controller task panicked");
            }
        }
        Ok(())
    }
}

/// Queues every stored record; returns how many.
pub async fn enqueue_all(store: &dyn ResourceStore, queue: &WorkQueue) -> Result<usize, StoreError> {
    let records = store.list().await?;
    let n = records.len();
    for record in records {
        queue.add(record.key()).await;
    }
    Ok(n)
}

async fn worker_loop(
    worker_id: usize,
    reconciler: Arc<Reconciler>,
    queue: Arc<WorkQueue>,
    health: Arc<ControllerHealth>,
    shutdown: CancellationToken,
) {
    debug!(worker_id, "worker started");
    loop {
        let key = tokio::select! {
            _ = shutdown.cancelled() => break,
            key = queue.get() => match key {
                Some(key) => key,
                None => break,
            },
        };

        let result = tokio::select! {
            _ = shutdown.cancelled() => {
                debug!(worker_id, key = %key, "reconciliation cancelled");
                queue.done(&key).await;
                break;
            }
            result = reconciler.reconcile(&key) => result,
        };

        match result {
            Ok(outcome) => {
                health.record_success();
                queue.forget(&key).await;
                debug!(worker_id, key = %key, outcome = outcome.as_str(), "reconciled");
            }
            Err(e) => {
                health.record_failure();
                let delay = queue.add_rate_limited(key.clone()).await;
                warn!(worker_id, key = %key, error = %e, retry_in = ?delay, "reconciliation failed");
            }
        }
        queue.done(&key).await;
    }
    debug!(worker_id, "worker stopped");
}
