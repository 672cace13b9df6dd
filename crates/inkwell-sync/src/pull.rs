//! Pulling the remote note set into the local vault.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use inkwell_common::KvStore;
use n0_future::task::{self, JoinHandle};
use n0_future::time::{self, Duration};
use smol_str::SmolStr;
use tokio::sync::{Notify, oneshot};
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::merge::{MergeOutcome, merge_with};
use crate::models::SealedNote;
use crate::transport::{DEFAULT_DOWNLOAD_LIMIT, NotesApi, NotesClient};
use crate::vault::{NoteVault, PlainCodec, VaultCodec};

pub const WATERMARK_KEY: &str = "notes.sync.watermark";

pub const PULL_INTERVAL: Duration = Duration::from_secs(30);

/// Upper bound on pages fetched in one pull.
const MAX_PAGES: usize = 10_000;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PullReport {
    /// Remote records received.
    pub fetched: usize,
    pub inserted: Vec<SmolStr>,
    pub updated: Vec<SmolStr>,
    pub removed: Vec<SmolStr>,
    /// Records that could not be decrypted. While any exist the watermark
    /// is not advanced, so they are fetched again next time.
    pub skipped: Vec<SmolStr>,
    /// Notes in the vault after the merge.
    pub total: usize,
    pub watermark: i64,
}

impl PullReport {
    fn from_merge(outcome: MergeOutcome, fetched: usize, watermark: i64) -> Self {
        Self {
            fetched,
            total: outcome.notes.len(),
            inserted: outcome.inserted,
            updated: outcome.updated,
            removed: outcome.removed,
            skipped: outcome.skipped,
            watermark,
        }
    }

    pub fn changed(&self) -> bool {
        !(self.inserted.is_empty() && self.updated.is_empty() && self.removed.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PullOutcome {
    /// The note list is paused; nothing was fetched.
    Paused,
    Pulled(PullReport),
}

pub struct PullSync<A, S, C = PlainCodec> {
    client: Arc<NotesClient<A, S>>,
    vault: Arc<NoteVault<S, C>>,
    state: S,
    limit: u32,
    paused: AtomicBool,
    hidden: Mutex<BTreeSet<SmolStr>>,
}

impl<A: NotesApi, S: KvStore, C: VaultCodec> PullSync<A, S, C> {
    /// `state` holds the pull watermark.
    pub fn new(client: Arc<NotesClient<A, S>>, vault: Arc<NoteVault<S, C>>, state: S) -> Self {
        Self {
            client,
            vault,
            state,
            limit: DEFAULT_DOWNLOAD_LIMIT,
            paused: AtomicBool::new(false),
            hidden: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit.max(1);
        self
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Exclude `id` from subsequent merges, e.g. right after deleting it
    /// locally and before the server has seen the delete.
    pub fn hide(&self, id: impl Into<SmolStr>) {
        if let Ok(mut hidden) = self.hidden.lock() {
            hidden.insert(id.into());
        }
    }

    pub fn clear_hidden(&self) {
        if let Ok(mut hidden) = self.hidden.lock() {
            hidden.clear();
        }
    }

    pub fn hidden(&self) -> BTreeSet<SmolStr> {
        self.hidden
            .lock()
            .map(|hidden| hidden.clone())
            .unwrap_or_default()
    }

    /// Last persisted watermark, 0 if none.
    pub async fn watermark(&self) -> Result<i64, SyncError> {
        let Some(raw) = self.state.get_item(WATERMARK_KEY).await? else {
            return Ok(0);
        };
        Ok(raw.trim().parse().unwrap_or_else(|_| {
            warn!(raw = %raw, "ignoring unreadable pull watermark");
            0
        }))
    }

    /// Pull changes since the last watermark.
    pub async fn pull(&self) -> Result<PullOutcome, SyncError> {
        if self.is_paused() {
            debug!("pull skipped: paused");
            return Ok(PullOutcome::Paused);
        }
        let since = self.watermark().await?;
        self.run(since).await.map(PullOutcome::Pulled)
    }

    /// Pull everything, ignoring the stored watermark.
    pub async fn full_resync(&self) -> Result<PullOutcome, SyncError> {
        if self.is_paused() {
            return Ok(PullOutcome::Paused);
        }
        self.run(0).await.map(PullOutcome::Pulled)
    }

    async fn run(&self, since: i64) -> Result<PullReport, SyncError> {
        let (remote, watermark) = self.fetch(since).await?;
        let fetched = remote.len();

        if fetched > 0 && !self.client.envelope().is_unlocked() {
            if let Err(e) = self.client.ensure_unlocked().await {
                warn!(error = %e, "master key unavailable, remote notes will be skipped");
            }
        }

        let hidden = self.hidden();
        let envelope = self.client.envelope();
        let outcome = self
            .vault
            .update(|notes| {
                let outcome = merge_with(
                    std::mem::take(notes),
                    remote,
                    |id| hidden.contains(id),
                    envelope,
                );
                *notes = outcome.notes.clone();
                outcome
            })
            .await?;

        if outcome.skipped.is_empty() && watermark != since {
            self.state
                .set_item(WATERMARK_KEY, watermark.to_string())
                .await?;
        }

        let report = PullReport::from_merge(outcome, fetched, watermark);
        if report.changed() || !report.skipped.is_empty() {
            info!(
                fetched,
                inserted = report.inserted.len(),
                updated = report.updated.len(),
                removed = report.removed.len(),
                skipped = report.skipped.len(),
                watermark,
                "pull merged remote notes"
            );
        } else {
            debug!(fetched, watermark, "pull found nothing new");
        }
        Ok(report)
    }

    async fn fetch(&self, since: i64) -> Result<(Vec<SealedNote>, i64), SyncError> {
        let mut notes = Vec::new();
        let mut cursor = since;
        for _ in 0..MAX_PAGES {
            let page = self.client.download(cursor, self.limit).await?;
            let has_more = page.has_more();
            let next = page.watermark.unwrap_or(cursor);
            notes.extend(page.notes);
            if !has_more {
                return Ok((notes, next));
            }
            if next == cursor {
                warn!(cursor, "server reported more pages without advancing the watermark");
                return Ok((notes, next));
            }
            cursor = next;
        }
        warn!(cursor, "page limit reached, continuing next pull");
        Ok((notes, cursor))
    }
}

impl<A, S, C> PullSync<A, S, C>
where
    A: NotesApi + 'static,
    S: KvStore + 'static,
    C: VaultCodec + 'static,
{
    /// Pull immediately and then every `interval` until shut down.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> PullHandle {
        let wake = Arc::new(Notify::new());
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let task_wake = wake.clone();

        let task = task::spawn(async move {
            info!(interval_secs = interval.as_secs(), "starting background pull");
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;

                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {}
                    _ = task_wake.notified() => {}
                }
                if let Err(e) = self.pull().await {
                    warn!(error = %e, "background pull failed");
                }
            }
            info!("background pull stopped");
        });

        PullHandle {
            wake,
            stop: Some(stop_tx),
            task,
        }
    }
}

pub struct PullHandle {
    wake: Arc<Notify>,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl PullHandle {
    /// Pull now (pull-to-refresh).
    pub fn refresh(&self) {
        self.wake.notify_one();
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.stop.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.task).await {
            warn!(error = %e, "pull task ended abnormally");
        }
    }
}
