//! Background drain of the outbox.
//!
//! A cycle peeks the due ops, replays each one and either drops it (accepted),
//! reschedules it with exponential backoff, or moves it to the dead-letter
//! list once its retry budget is spent. Cycles run on a fixed tick, on every
//! connectivity change and whenever the host app comes to the foreground;
//! at most one runs at a time per worker.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use inkwell_common::{KvStore, WorkerSettings};
use n0_future::task::{self, JoinHandle};
use n0_future::time::{self, Duration};
use tokio::sync::{Notify, broadcast, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::SyncError;
use crate::models::{OpKind, OutboxOp};
use crate::transport::{NotesApi, NotesClient};

pub const MAX_ATTEMPTS: u32 = 8;
pub const BASE_DELAY_MS: i64 = 1_000;
pub const MAX_DELAY_MS: i64 = 60_000;

/// Worker tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    /// Time between scheduled cycles.
    pub interval: Duration,
    /// Maximum ops handled per cycle.
    pub batch_limit: usize,
    /// An op whose attempt count exceeds this is dead-lettered.
    pub max_attempts: u32,
    pub base_delay_ms: i64,
    pub max_delay_ms: i64,
    /// Offer the whole batch to `/sync-plan` before replaying op by op.
    pub batch_replay: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            batch_limit: 50,
            max_attempts: MAX_ATTEMPTS,
            base_delay_ms: BASE_DELAY_MS,
            max_delay_ms: MAX_DELAY_MS,
            batch_replay: false,
        }
    }
}

impl From<&WorkerSettings> for WorkerConfig {
    fn from(settings: &WorkerSettings) -> Self {
        Self {
            interval: Duration::from_secs(settings.tick_secs),
            batch_limit: settings.batch_limit,
            max_attempts: settings.max_attempts,
            batch_replay: settings.batch_replay,
            ..Self::default()
        }
    }
}

impl WorkerConfig {
    /// Delay before retrying an op that has failed `attempt` times:
    /// `min(max_delay, base_delay * 2^(attempt - 1))`.
    pub fn backoff_ms(&self, attempt: u32) -> i64 {
        let exp = attempt.saturating_sub(1).min(32);
        self.base_delay_ms
            .saturating_mul(1i64 << exp)
            .min(self.max_delay_ms)
    }
}

/// [`WorkerConfig::backoff_ms`] with the default delays.
pub fn backoff_ms(attempt: u32) -> i64 {
    WorkerConfig::default().backoff_ms(attempt)
}

/// Per-op notifications from the worker.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Delivered {
        op_id: Uuid,
    },
    Retrying {
        op_id: Uuid,
        attempt: u32,
        next_at: i64,
    },
    /// The op exhausted its retry budget and was moved to the dead-letter list.
    DeadLettered {
        op_id: Uuid,
        kind: OpKind,
        attempt: u32,
    },
    /// The cycle stopped early on a local fault (store or serialization).
    CycleFailed {
        message: String,
    },
}

/// Tally of one completed cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub delivered: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    pub dropped_unknown: usize,
}

impl CycleReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Another cycle was already running.
    AlreadySyncing,
    Offline,
    Completed(CycleReport),
    /// The cycle hit a local fault; progress up to that point is kept.
    Failed {
        report: CycleReport,
        message: String,
    },
}

/// Clears the syncing flag however the cycle ends.
struct SyncingGuard<'a>(&'a AtomicBool);

impl Drop for SyncingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SyncWorker<A, S> {
    client: Arc<NotesClient<A, S>>,
    config: WorkerConfig,
    syncing: AtomicBool,
    events: broadcast::Sender<SyncEvent>,
}

impl<A: NotesApi, S: KvStore> SyncWorker<A, S> {
    pub fn new(client: Arc<NotesClient<A, S>>, config: WorkerConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            client,
            config,
            syncing: AtomicBool::new(false),
            events,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Run one cycle unless one is already running or the network is down.
    /// Never returns an error; failures are reported in the outcome.
    pub async fn try_sync(&self) -> CycleOutcome {
        if self
            .syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("sync cycle already running");
            return CycleOutcome::AlreadySyncing;
        }
        let _guard = SyncingGuard(&self.syncing);

        if !self.client.network().is_online() {
            debug!("skipping sync cycle: offline");
            return CycleOutcome::Offline;
        }

        let mut report = CycleReport::default();
        match self.run_cycle(&mut report).await {
            Ok(()) => {
                if !report.is_empty() {
                    info!(
                        delivered = report.delivered,
                        retried = report.retried,
                        dead_lettered = report.dead_lettered,
                        dropped_unknown = report.dropped_unknown,
                        "sync cycle complete"
                    );
                }
                CycleOutcome::Completed(report)
            }
            Err(e) => {
                error!(error = %e, "sync cycle failed");
                metrics::counter!("inkwell_sync_cycle_failures_total").increment(1);
                let message = e.to_string();
                self.emit(SyncEvent::CycleFailed {
                    message: message.clone(),
                });
                CycleOutcome::Failed { report, message }
            }
        }
    }

    async fn run_cycle(&self, report: &mut CycleReport) -> Result<(), SyncError> {
        let outbox = self.client.outbox();
        let now = self.client.clock().now_ms();
        let batch = outbox.peek_due(self.config.batch_limit, now).await?;
        if batch.is_empty() {
            return Ok(());
        }
        debug!(due = batch.len(), "draining outbox");

        let (unknown, mut pending): (Vec<_>, Vec<_>) =
            batch.into_iter().partition(|op| op.kind == OpKind::Unknown);
        if !unknown.is_empty() {
            for op in &unknown {
                warn!(op_id = %op.op_id, "dropping outbox op of unknown type");
            }
            let ids: Vec<Uuid> = unknown.iter().map(|op| op.op_id).collect();
            outbox.drop_ops(&ids).await?;
            report.dropped_unknown += ids.len();
        }

        if self.config.batch_replay && !pending.is_empty() {
            match self.client.replay_batch(&pending).await {
                Ok(applied) => {
                    let accepted: Vec<Uuid> = pending
                        .iter()
                        .map(|op| op.op_id)
                        .filter(|id| applied.contains(id))
                        .collect();
                    outbox.drop_ops(&accepted).await?;
                    for op_id in &accepted {
                        self.delivered(*op_id, report);
                    }
                    pending.retain(|op| !accepted.contains(&op.op_id));
                }
                Err(e) => {
                    warn!(error = %e, ops = pending.len(), "batched replay failed, replaying op by op");
                }
            }
        }

        for op in pending {
            match self.client.replay(&op).await {
                Ok(_) => {
                    outbox.drop_ops(&[op.op_id]).await?;
                    self.delivered(op.op_id, report);
                }
                Err(e) => self.record_failure(op, &e, report).await?,
            }
        }
        Ok(())
    }

    async fn record_failure(
        &self,
        mut op: OutboxOp,
        cause: &SyncError,
        report: &mut CycleReport,
    ) -> Result<(), SyncError> {
        let outbox = self.client.outbox();
        op.attempt += 1;

        if op.attempt > self.config.max_attempts {
            warn!(
                op_id = %op.op_id,
                kind = ?op.kind,
                attempt = op.attempt,
                error = %cause,
                "retry budget exhausted, dead-lettering op"
            );
            outbox.dead_letter(&op).await?;
            report.dead_lettered += 1;
            metrics::counter!("inkwell_sync_dead_lettered_total").increment(1);
            self.emit(SyncEvent::DeadLettered {
                op_id: op.op_id,
                kind: op.kind,
                attempt: op.attempt,
            });
            return Ok(());
        }

        op.next_at = self.client.clock().now_ms() + self.config.backoff_ms(op.attempt);
        debug!(
            op_id = %op.op_id,
            attempt = op.attempt,
            next_at = op.next_at,
            error = %cause,
            "replay failed, backing off"
        );
        let (op_id, attempt, next_at) = (op.op_id, op.attempt, op.next_at);
        outbox.reschedule(&[op]).await?;
        report.retried += 1;
        metrics::counter!("inkwell_sync_retries_total").increment(1);
        self.emit(SyncEvent::Retrying {
            op_id,
            attempt,
            next_at,
        });
        Ok(())
    }

    fn delivered(&self, op_id: Uuid, report: &mut CycleReport) {
        report.delivered += 1;
        metrics::counter!("inkwell_sync_delivered_total").increment(1);
        self.emit(SyncEvent::Delivered { op_id });
    }

    fn emit(&self, event: SyncEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

impl<A, S> SyncWorker<A, S>
where
    A: NotesApi + 'static,
    S: KvStore + 'static,
{
    /// Run the scheduler loop in the background.
    ///
    /// The loop runs a cycle immediately, then on every tick, every
    /// connectivity flip and every [`WorkerHandle::trigger`].
    pub fn spawn(self: Arc<Self>) -> WorkerHandle {
        let wake = Arc::new(Notify::new());
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let mut network = self.client.network().subscribe();
        let worker_wake = wake.clone();

        let task = task::spawn(async move {
            info!(
                interval_secs = self.config.interval.as_secs(),
                batch_limit = self.config.batch_limit,
                max_attempts = self.config.max_attempts,
                "starting sync worker"
            );
            let mut ticker = time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut watching_network = true;

            loop {
                tokio::select! {
                    biased;

                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {}
                    _ = worker_wake.notified() => {
                        debug!("sync triggered");
                    }
                    changed = network.changed(), if watching_network => {
                        match changed {
                            Ok(()) => {
                                let online = *network.borrow_and_update();
                                debug!(online, "connectivity changed");
                            }
                            Err(_) => watching_network = false,
                        }
                    }
                }
                self.try_sync().await;
            }
            info!("sync worker stopped");
        });

        WorkerHandle {
            wake,
            shutdown: Some(shutdown_tx),
            task,
        }
    }
}

/// Control handle for a spawned [`SyncWorker`].
pub struct WorkerHandle {
    wake: Arc<Notify>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Request a cycle as soon as possible.
    pub fn trigger(&self) {
        self.wake.notify_one();
    }

    /// The host app came to the foreground.
    pub fn foreground(&self) {
        debug!("app foregrounded");
        self.trigger();
    }

    /// Stop the loop. A cycle already in flight runs to completion first.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.task).await {
            warn!(error = %e, "sync worker task ended abnormally");
        }
    }
}
