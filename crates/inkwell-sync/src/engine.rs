//! Wiring of the sync components around one local store.

use std::sync::Arc;

use inkwell_common::{Config, KvStore};
use n0_future::time::Duration;
use smol_str::SmolStr;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::cipher::CipherEnvelope;
use crate::clock::Clock;
use crate::error::SyncError;
use crate::live::{LIVE_POLL_INTERVAL, LiveEvent, LiveHandle, LivePoller, LiveSession};
use crate::models::Note;
use crate::network::NetworkStatus;
use crate::outbox::OutboxStore;
use crate::pull::{PULL_INTERVAL, PullHandle, PullOutcome, PullSync};
use crate::transport::{DEFAULT_DOWNLOAD_LIMIT, NotesApi, NotesClient, WriteOutcome};
use crate::vault::{NoteVault, PlainCodec, VaultCodec};
use crate::worker::{CycleOutcome, SyncWorker, WorkerConfig, WorkerHandle};

/// Intervals and limits for a [`SyncEngine`].
#[derive(Debug, Clone, PartialEq)]
pub struct EngineOptions {
    pub worker: WorkerConfig,
    pub live_interval: Duration,
    pub pull_interval: Duration,
    pub download_limit: u32,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            worker: WorkerConfig::default(),
            live_interval: LIVE_POLL_INTERVAL,
            pull_interval: PULL_INTERVAL,
            download_limit: DEFAULT_DOWNLOAD_LIMIT,
        }
    }
}

impl From<&Config> for EngineOptions {
    fn from(config: &Config) -> Self {
        Self {
            worker: WorkerConfig::from(&config.worker),
            live_interval: Duration::from_secs(config.live_poll_secs),
            pull_interval: Duration::from_secs(config.pull_interval_secs),
            download_limit: config.download_limit,
        }
    }
}

/// Background tasks started by [`SyncEngine::start`].
pub struct EngineHandles {
    pub worker: WorkerHandle,
    pub pull: PullHandle,
}

impl EngineHandles {
    /// The host app came to the foreground: drain the outbox and refresh.
    pub fn foreground(&self) {
        self.worker.foreground();
        self.pull.refresh();
    }

    pub async fn shutdown(self) {
        self.worker.shutdown().await;
        self.pull.shutdown().await;
    }
}

/// Local-first note operations backed by the sync components.
///
/// Every write lands in the local vault first and is then delivered or
/// queued; reads come from the vault.
pub struct SyncEngine<A, S, C = PlainCodec> {
    client: Arc<NotesClient<A, S>>,
    vault: Arc<NoteVault<S, C>>,
    worker: Arc<SyncWorker<A, S>>,
    pull: Arc<PullSync<A, S, C>>,
    options: EngineOptions,
}

impl<A: NotesApi, S: KvStore + Clone> SyncEngine<A, S> {
    pub fn new(
        api: A,
        store: S,
        envelope: Arc<dyn CipherEnvelope>,
        network: NetworkStatus,
        clock: Arc<dyn Clock>,
        options: EngineOptions,
    ) -> Self {
        Self::with_codec(api, store, PlainCodec, envelope, network, clock, options)
    }
}

impl<A: NotesApi, S: KvStore + Clone, C: VaultCodec> SyncEngine<A, S, C> {
    /// Build an engine whose outbox, tokens, watermark and vault all live in
    /// `store`, with `codec` wrapping the vault at rest.
    pub fn with_codec(
        api: A,
        store: S,
        codec: C,
        envelope: Arc<dyn CipherEnvelope>,
        network: NetworkStatus,
        clock: Arc<dyn Clock>,
        options: EngineOptions,
    ) -> Self {
        let outbox = Arc::new(OutboxStore::new(store.clone()));
        let client = Arc::new(NotesClient::new(
            api,
            store.clone(),
            outbox,
            envelope,
            network,
            clock,
        ));
        let vault = Arc::new(NoteVault::with_codec(store.clone(), codec));
        let worker = Arc::new(SyncWorker::new(client.clone(), options.worker.clone()));
        let pull = Arc::new(
            PullSync::new(client.clone(), vault.clone(), store).with_limit(options.download_limit),
        );
        Self {
            client,
            vault,
            worker,
            pull,
            options,
        }
    }

    pub fn client(&self) -> &Arc<NotesClient<A, S>> {
        &self.client
    }

    pub fn vault(&self) -> &Arc<NoteVault<S, C>> {
        &self.vault
    }

    pub fn worker(&self) -> &Arc<SyncWorker<A, S>> {
        &self.worker
    }

    pub fn pull_sync(&self) -> &Arc<PullSync<A, S, C>> {
        &self.pull
    }

    pub fn outbox(&self) -> &Arc<OutboxStore<S>> {
        self.client.outbox()
    }

    pub async fn notes(&self) -> Result<Vec<Note>, SyncError> {
        Ok(self.vault.load().await?)
    }

    /// Create and save a new note.
    pub async fn create_note(
        &self,
        title: impl Into<String>,
        text: impl Into<String>,
    ) -> Result<(Note, WriteOutcome), SyncError> {
        let note = Note::new(
            Note::generate_id(),
            title,
            text,
            self.client.clock().now_ms(),
        );
        let outcome = self.store(&note).await?;
        Ok((note, outcome))
    }

    /// Stamp `note` as edited now, persist it locally and upload it.
    /// Returns the stamped note.
    pub async fn save_note(&self, mut note: Note) -> Result<(Note, WriteOutcome), SyncError> {
        note.touch(self.client.clock().now_ms());
        let outcome = self.store(&note).await?;
        Ok((note, outcome))
    }

    /// Apply an edit to the open note and save it. The buffer is stamped by
    /// the live session, so the saved note and the buffer agree.
    pub async fn save_open_note(
        &self,
        live: &LiveHandle,
        title: Option<String>,
        text: Option<String>,
    ) -> Result<(Note, WriteOutcome), SyncError> {
        let note = live.edit(title, text);
        let outcome = self.store(&note).await?;
        Ok((note, outcome))
    }

    /// Delete notes locally, keep them out of later merges, and send the
    /// delete to the server.
    pub async fn delete_notes(&self, ids: &[SmolStr]) -> Result<WriteOutcome, SyncError> {
        let removed = self.vault.remove(ids).await?;
        for id in ids {
            self.pull.hide(id.clone());
        }
        debug!(requested = ids.len(), removed, "deleted notes locally");
        self.client.delete_notes(ids).await
    }

    pub async fn pull(&self) -> Result<PullOutcome, SyncError> {
        self.pull.pull().await
    }

    pub async fn full_resync(&self) -> Result<PullOutcome, SyncError> {
        self.pull.full_resync().await
    }

    /// Upload every note in the vault. Run after credentials are stored so
    /// notes saved while the envelope was locked reach the server. `None` if
    /// the vault is empty.
    pub async fn upload_all(&self) -> Result<Option<WriteOutcome>, SyncError> {
        let notes = self.vault.load().await?;
        if notes.is_empty() {
            return Ok(None);
        }
        info!(count = notes.len(), "uploading all local notes");
        self.client.upload(0, &notes, None).await.map(Some)
    }

    /// Run one outbox drain now.
    pub async fn sync_now(&self) -> CycleOutcome {
        self.worker.try_sync().await
    }

    async fn store(&self, note: &Note) -> Result<WriteOutcome, SyncError> {
        self.vault.upsert(note.clone()).await?;
        self.client
            .upload(0, std::slice::from_ref(note), None)
            .await
    }
}

impl<A, S, C> SyncEngine<A, S, C>
where
    A: NotesApi + 'static,
    S: KvStore + Clone + 'static,
    C: VaultCodec + 'static,
{
    /// Start the outbox worker and the background pull.
    pub fn start(&self) -> EngineHandles {
        EngineHandles {
            worker: self.worker.clone().spawn(),
            pull: self.pull.clone().spawn(self.options.pull_interval),
        }
    }

    /// Open a note for editing and start mirroring its remote copy.
    pub async fn open_note(
        &self,
        id: &str,
    ) -> Result<(LiveHandle, mpsc::Receiver<LiveEvent>), SyncError> {
        let note = self
            .vault
            .get(id)
            .await?
            .ok_or_else(|| SyncError::NotFound { id: id.to_string() })?;
        let poller = LivePoller::new(self.client.clone());
        Ok(poller.spawn(LiveSession::new(note), self.options.live_interval))
    }
}
