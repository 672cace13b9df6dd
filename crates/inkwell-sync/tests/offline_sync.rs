//! End-to-end behaviour of the sync engine against an in-memory notes server.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use inkwell_common::{KvStore, MemoryStore};
use inkwell_sync::live::AbandonReason;
use inkwell_sync::models::SealedText;
use inkwell_sync::outbox::OUTBOX_KEY;
use inkwell_sync::pull::WATERMARK_KEY;
use inkwell_sync::transport::{Endpoint, MASTER_KEY_KEY};
use inkwell_sync::worker::backoff_ms;
use inkwell_sync::{
    CipherError, Clock, CycleOutcome, CycleReport, EngineOptions, LiveEvent, ManualClock, MasterKeyEnvelope,
    NetworkStatus, NotesApi, OpKind, PullOutcome, QueueReason, SealedNote, SyncEngine, SyncError,
    SyncEvent, SyncPayload, WorkerConfig, WriteOutcome,
};
use base64::Engine as _;
use serde_json::{Value, json};
use smol_str::SmolStr;
use tokio::sync::Notify;
use uuid::Uuid;

const KEY: [u8; 32] = [42; 32];

#[derive(Default)]
struct ServerState {
    /// id -> (change sequence, note)
    notes: BTreeMap<SmolStr, (i64, SealedNote)>,
    applied: HashSet<Uuid>,
    seq: i64,
    failing: bool,
    requests: Vec<Endpoint>,
}

impl ServerState {
    fn apply(&mut self, payload: SyncPayload) -> bool {
        if !self.applied.insert(payload.op_id) {
            return false;
        }
        for note in payload.notes {
            self.put(note);
        }
        for id in payload.deleted_ids.unwrap_or_default() {
            let ms = self
                .notes
                .get(&id)
                .map(|(_, note)| note.modified_ms() + 1)
                .unwrap_or(1);
            let tombstone: SealedNote = serde_json::from_value(json!({
                "id": id,
                "text": "",
                "deleted": true,
                "last_modified": ms,
            }))
            .unwrap();
            self.put(tombstone);
        }
        true
    }

    fn put(&mut self, note: SealedNote) {
        if let Some((_, existing)) = self.notes.get(&note.id) {
            if existing.modified_ms() > note.modified_ms() {
                return;
            }
        }
        self.seq += 1;
        self.notes.insert(note.id.clone(), (self.seq, note));
    }

    fn download(&self, since: i64, limit: usize) -> Value {
        let mut changed: Vec<_> = self
            .notes
            .values()
            .filter(|(seq, _)| *seq > since)
            .collect();
        changed.sort_by_key(|(seq, _)| *seq);
        let has_more = changed.len() > limit;
        let page: Vec<_> = changed.into_iter().take(limit).collect();
        let watermark = page.last().map(|(seq, _)| *seq).unwrap_or(since);
        let notes: Vec<_> = page.into_iter().map(|(_, note)| note.clone()).collect();
        json!({ "notes": notes, "has_more": has_more, "watermark": watermark })
    }
}

/// In-memory notes API with op_id deduplication and last-write-wins storage.
#[derive(Default)]
struct FakeServer {
    state: Mutex<ServerState>,
    arrived: AtomicUsize,
    gate: Option<Arc<Notify>>,
}

impl FakeServer {
    fn gated(gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    fn set_failing(&self, failing: bool) {
        self.state.lock().unwrap().failing = failing;
    }

    fn applied_ops(&self) -> usize {
        self.state.lock().unwrap().applied.len()
    }

    fn note(&self, id: &str) -> Option<SealedNote> {
        self.state
            .lock()
            .unwrap()
            .notes
            .get(id)
            .map(|(_, note)| note.clone())
    }

    fn note_count(&self) -> usize {
        self.state.lock().unwrap().notes.len()
    }

    fn requests(&self, endpoint: Endpoint) -> usize {
        self.state
            .lock()
            .unwrap()
            .requests
            .iter()
            .filter(|e| **e == endpoint)
            .count()
    }
}

impl NotesApi for FakeServer {
    async fn post(&self, endpoint: Endpoint, body: Value, _bearer: &str) -> Result<Value, SyncError> {
        self.arrived.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }

        let mut state = self.state.lock().unwrap();
        state.requests.push(endpoint);
        if state.failing {
            return Err(SyncError::Transport {
                endpoint: endpoint.path(),
                message: "connection refused".into(),
            });
        }

        match endpoint {
            Endpoint::Upload => {
                let payload: SyncPayload = serde_json::from_value(body).unwrap();
                let fresh = state.apply(payload);
                Ok(json!({ "ok": true, "duplicate": !fresh }))
            }
            Endpoint::SyncPlan => {
                if let Some(ops) = body.get("ops").and_then(Value::as_array) {
                    let mut applied = Vec::new();
                    for op in ops {
                        let payload: SyncPayload =
                            serde_json::from_value(op["payload"].clone()).unwrap();
                        applied.push(payload.op_id.to_string());
                        state.apply(payload);
                    }
                    Ok(json!({ "applied": applied }))
                } else {
                    let payload: SyncPayload = serde_json::from_value(body).unwrap();
                    state.apply(payload);
                    Ok(json!({}))
                }
            }
            Endpoint::Download => {
                let since = body["since"].as_i64().unwrap_or(0);
                let limit = body["limit"].as_u64().unwrap_or(1000) as usize;
                Ok(state.download(since, limit))
            }
            Endpoint::Find => {
                let id = body["id"].as_str().unwrap_or_default();
                match state.notes.get(id) {
                    Some((_, note)) => Ok(serde_json::to_value(note).unwrap()),
                    None => Err(SyncError::Status {
                        endpoint: endpoint.path(),
                        status: 404,
                    }),
                }
            }
        }
    }
}

type Engine = SyncEngine<Arc<FakeServer>, Arc<MemoryStore>>;

struct Device {
    engine: Engine,
    network: NetworkStatus,
    store: Arc<MemoryStore>,
}

fn device_with(
    server: &Arc<FakeServer>,
    clock: &ManualClock,
    online: bool,
    options: EngineOptions,
) -> Device {
    let network = NetworkStatus::new(online);
    let store = Arc::new(MemoryStore::new());
    let clock: Arc<dyn Clock> = Arc::new(clock.clone());
    let engine = SyncEngine::new(
        server.clone(),
        store.clone(),
        Arc::new(MasterKeyEnvelope::with_key(&KEY).unwrap()),
        network.clone(),
        clock,
        options,
    );
    Device {
        engine,
        network,
        store,
    }
}

fn device(server: &Arc<FakeServer>, clock: &ManualClock, online: bool) -> Device {
    device_with(server, clock, online, EngineOptions::default())
}

fn completed(outcome: CycleOutcome) -> CycleReport {
    match outcome {
        CycleOutcome::Completed(report) => report,
        other => panic!("expected a completed cycle, got {other:?}"),
    }
}

#[tokio::test]
async fn replaying_an_op_is_idempotent() {
    let server = Arc::new(FakeServer::default());
    let clock = ManualClock::new(1_000);
    let dev = device(&server, &clock, false);

    let (note, outcome) = dev.engine.create_note("t", "body").await.unwrap();
    assert!(outcome.is_queued());
    let op = dev.engine.outbox().get_all().await.unwrap().remove(0);

    dev.network.set_online(true);
    let client = dev.engine.client();
    client.replay(&op).await.unwrap();
    client.replay(&op).await.unwrap();
    client
        .upload(0, std::slice::from_ref(&note), Some(op.op_id))
        .await
        .unwrap();

    assert_eq!(server.requests(Endpoint::Upload), 3);
    assert_eq!(server.applied_ops(), 1);
    assert_eq!(server.note_count(), 1);
}

#[tokio::test]
async fn offline_edits_are_never_lost() {
    let server = Arc::new(FakeServer::default());
    let clock = ManualClock::new(1_000);
    let dev = device(&server, &clock, false);

    let mut ids = Vec::new();
    for i in 0..5 {
        let (note, outcome) = dev
            .engine
            .create_note(format!("title {i}"), format!("secret body {i}"))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            WriteOutcome::Queued {
                reason: QueueReason::Offline,
                ..
            }
        ));
        ids.push(note.id);
        clock.advance(10);
    }
    assert_eq!(dev.engine.outbox().len().await.unwrap(), 5);
    assert_eq!(dev.engine.notes().await.unwrap().len(), 5);
    assert_eq!(dev.engine.sync_now().await, CycleOutcome::Offline);

    dev.network.set_online(true);
    let report = completed(dev.engine.sync_now().await);
    assert_eq!(report.delivered, 5);
    assert!(dev.engine.outbox().get_all().await.unwrap().is_empty());

    for id in &ids {
        let stored = server.note(id).expect("note reached the server");
        assert!(!stored.text.as_str().contains("secret"));
    }
}

#[tokio::test]
async fn failures_back_off_exponentially() {
    let server = Arc::new(FakeServer::default());
    let clock = ManualClock::new(10_000);
    let dev = device(&server, &clock, false);
    dev.engine.create_note("t", "x").await.unwrap();

    dev.network.set_online(true);
    server.set_failing(true);

    let mut failed_at = 10_000;
    for (attempt, delay) in [(1, 1_000), (2, 2_000), (3, 4_000)] {
        let report = completed(dev.engine.sync_now().await);
        assert_eq!(report.retried, 1);

        let op = dev.engine.outbox().get_all().await.unwrap().remove(0);
        assert_eq!(op.attempt, attempt);
        assert_eq!(op.next_at, failed_at + delay);

        // not due yet
        clock.set(op.next_at - 1);
        assert!(completed(dev.engine.sync_now().await).is_empty());

        clock.set(op.next_at);
        failed_at = op.next_at;
    }

    server.set_failing(false);
    let report = completed(dev.engine.sync_now().await);
    assert_eq!(report.delivered, 1);
    assert!(dev.engine.outbox().get_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn exhausted_ops_are_dead_lettered() {
    let server = Arc::new(FakeServer::default());
    let clock = ManualClock::new(0);
    let dev = device(&server, &clock, false);
    dev.engine.create_note("t", "x").await.unwrap();
    let mut events = dev.engine.worker().subscribe();

    dev.network.set_online(true);
    server.set_failing(true);

    for attempt in 1..=8u32 {
        completed(dev.engine.sync_now().await);
        let op = dev.engine.outbox().get_all().await.unwrap().remove(0);
        assert_eq!(op.attempt, attempt);
        assert!(op.next_at - clock.now_ms() <= 60_000);
        assert_eq!(op.next_at - clock.now_ms(), backoff_ms(attempt));
        clock.set(op.next_at);
    }

    let report = completed(dev.engine.sync_now().await);
    assert_eq!(report.dead_lettered, 1);
    assert!(dev.engine.outbox().get_all().await.unwrap().is_empty());

    let dead = dev.engine.outbox().dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempt, 9);

    let mut saw_dead_letter = false;
    while let Ok(event) = events.try_recv() {
        if let SyncEvent::DeadLettered { op_id, attempt, .. } = event {
            assert_eq!(op_id, dead[0].op_id);
            assert_eq!(attempt, 9);
            saw_dead_letter = true;
        }
    }
    assert!(saw_dead_letter);
}

#[tokio::test]
async fn only_one_cycle_runs_at_a_time() {
    let gate = Arc::new(Notify::new());
    let server = Arc::new(FakeServer::gated(gate.clone()));
    let clock = ManualClock::new(0);
    let dev = device(&server, &clock, false);
    dev.engine.create_note("t", "x").await.unwrap();
    dev.network.set_online(true);

    let worker = dev.engine.worker().clone();
    let first = tokio::spawn(async move { worker.try_sync().await });
    while server.arrived.load(Ordering::SeqCst) == 0 {
        tokio::task::yield_now().await;
    }

    assert!(dev.engine.worker().is_syncing());
    assert_eq!(dev.engine.sync_now().await, CycleOutcome::AlreadySyncing);

    gate.notify_one();
    assert_eq!(completed(first.await.unwrap()).delivered, 1);
    assert!(!dev.engine.worker().is_syncing());
}

#[tokio::test]
async fn batched_replay_uses_one_request() {
    let server = Arc::new(FakeServer::default());
    let clock = ManualClock::new(0);
    let options = EngineOptions {
        worker: WorkerConfig {
            batch_replay: true,
            ..WorkerConfig::default()
        },
        ..EngineOptions::default()
    };
    let dev = device_with(&server, &clock, false, options);
    for i in 0..3 {
        dev.engine.create_note("t", format!("{i}")).await.unwrap();
    }
    dev.engine.delete_notes(&["gone".into()]).await.unwrap();

    dev.network.set_online(true);
    let report = completed(dev.engine.sync_now().await);
    assert_eq!(report.delivered, 4);
    assert_eq!(server.requests(Endpoint::SyncPlan), 1);
    assert_eq!(server.requests(Endpoint::Upload), 0);
    assert_eq!(server.applied_ops(), 4);
}

#[tokio::test]
async fn unknown_op_types_are_dropped() {
    let server = Arc::new(FakeServer::default());
    let clock = ManualClock::new(0);
    let dev = device(&server, &clock, true);

    let op_id = Uuid::new_v4();
    dev.store
        .set_item(
            OUTBOX_KEY,
            json!([{
                "opId": op_id,
                "type": "rename",
                "payload": { "op_id": op_id },
                "attempt": 0,
                "nextAt": 0
            }])
            .to_string(),
        )
        .await
        .unwrap();
    let queued = dev.engine.outbox().get_all().await.unwrap();
    assert_eq!(queued[0].kind, OpKind::Unknown);

    let report = completed(dev.engine.sync_now().await);
    assert_eq!(report.dropped_unknown, 1);
    assert!(dev.engine.outbox().get_all().await.unwrap().is_empty());
    assert_eq!(server.requests(Endpoint::Upload), 0);
}

#[tokio::test]
async fn two_devices_converge_through_pull() {
    let server = Arc::new(FakeServer::default());
    let clock = ManualClock::new(1_000);
    let a = device(&server, &clock, true);
    let b = device(&server, &clock, true);

    let (note, outcome) = a.engine.create_note("Groceries", "milk").await.unwrap();
    assert!(!outcome.is_queued());

    let PullOutcome::Pulled(report) = b.engine.pull().await.unwrap() else {
        panic!("pull should run");
    };
    assert_eq!(report.inserted, vec![note.id.clone()]);
    let on_b = b.engine.vault().get(&note.id).await.unwrap().unwrap();
    assert_eq!(on_b.text, "milk");
    assert_eq!(on_b.title_str(), "Groceries");

    let watermark: i64 = b
        .store
        .get_item(WATERMARK_KEY)
        .await
        .unwrap()
        .unwrap()
        .parse()
        .unwrap();
    assert_eq!(watermark, report.watermark);

    clock.advance(1_000);
    let mut edited = on_b.clone();
    edited.text = "milk, eggs".into();
    b.engine.save_note(edited).await.unwrap();

    a.engine.pull().await.unwrap();
    let on_a = a.engine.vault().get(&note.id).await.unwrap().unwrap();
    assert_eq!(on_a.text, "milk, eggs");
    assert_eq!(on_a.last_modified, Some(2_000));

    clock.advance(1_000);
    a.engine.delete_notes(&[note.id.clone()]).await.unwrap();
    let PullOutcome::Pulled(report) = b.engine.pull().await.unwrap() else {
        panic!("pull should run");
    };
    assert_eq!(report.removed, vec![note.id.clone()]);
    assert!(b.engine.notes().await.unwrap().is_empty());

    b.engine.pull_sync().pause();
    assert_eq!(b.engine.pull().await.unwrap(), PullOutcome::Paused);
}

#[tokio::test]
async fn locally_deleted_note_is_not_resurrected_by_pull() {
    let server = Arc::new(FakeServer::default());
    let clock = ManualClock::new(1_000);
    let dev = device(&server, &clock, true);

    let (note, _) = dev.engine.create_note("t", "x").await.unwrap();
    dev.network.set_online(false);
    let outcome = dev.engine.delete_notes(&[note.id.clone()]).await.unwrap();
    assert!(outcome.is_queued());

    // back online, pull runs before the worker has drained the delete
    dev.network.set_online(true);
    dev.engine.full_resync().await.unwrap();
    assert!(dev.engine.notes().await.unwrap().is_empty());

    completed(dev.engine.sync_now().await);
    assert!(server.note(&note.id).unwrap().is_deleted());
}

#[tokio::test]
async fn live_poller_mirrors_remote_changes() {
    let server = Arc::new(FakeServer::default());
    let clock = ManualClock::new(1_000);
    let a = device(&server, &clock, true);
    let b = device(&server, &clock, true);

    let (note, _) = a.engine.create_note("t", "v1").await.unwrap();
    b.engine.pull().await.unwrap();

    let (live, mut events) = b.engine.open_note(&note.id).await.unwrap();

    clock.advance(1_000);
    let mut edited = note.clone();
    edited.text = "v2".into();
    a.engine.save_note(edited).await.unwrap();

    live.poke();
    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("live event")
        .expect("poller running");
    let LiveEvent::Updated(updated) = event else {
        panic!("expected an update, got {event:?}");
    };
    assert_eq!(updated.text, "v2");
    assert_eq!(live.note().text, "v2");

    clock.advance(1_000);
    a.engine.delete_notes(&[note.id.clone()]).await.unwrap();

    live.poke();
    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("live event")
        .expect("poller running");
    assert_eq!(event, LiveEvent::Abandon(AbandonReason::Deleted));

    // the poller ends after an abandon
    let closed = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("channel closes");
    assert!(closed.is_none());
    live.stop().await;
}

#[tokio::test]
async fn typing_holds_back_live_updates() {
    let server = Arc::new(FakeServer::default());
    let clock = ManualClock::new(1_000);
    let a = device(&server, &clock, true);
    let b = device(&server, &clock, true);

    let (note, _) = a.engine.create_note("t", "v1").await.unwrap();
    b.engine.pull().await.unwrap();
    let (live, _events) = b.engine.open_note(&note.id).await.unwrap();

    clock.advance(500);
    let (saved, _) = b
        .engine
        .save_open_note(&live, None, Some("typing...".into()))
        .await
        .unwrap();
    assert_eq!(live.note(), saved);
    assert!(live.state().is_typing(clock.now_ms()));

    live.pause();
    assert!(live.state().is_paused());
    live.resume();
    assert!(!live.state().is_paused());

    let stopped = live.stop().await;
    assert_eq!(stopped.text, "typing...");
    let stored = server.note(&note.id).unwrap();
    assert_eq!(stored.last_modified, Some(1_500));
    assert_eq!(saved.last_modified, Some(1_500));
    assert_ne!(stored.text, SealedText("typing...".into()));
}

#[tokio::test]
async fn notes_saved_before_login_are_uploaded() {
    let server = Arc::new(FakeServer::default());
    let clock = ManualClock::new(1_000);
    let store = Arc::new(MemoryStore::new());
    let engine: Engine = SyncEngine::new(
        server.clone(),
        store.clone(),
        Arc::new(MasterKeyEnvelope::new()),
        NetworkStatus::online(),
        Arc::new(clock.clone()),
        EngineOptions::default(),
    );

    // no key yet: the note stays local and nothing is queued
    let err = engine.create_note("draft", "before login").await.unwrap_err();
    assert!(matches!(err, SyncError::Cipher(CipherError::Locked)));
    let notes = engine.notes().await.unwrap();
    assert_eq!(notes.len(), 1);
    assert!(engine.outbox().get_all().await.unwrap().is_empty());
    assert_eq!(server.requests(Endpoint::Upload), 0);

    store
        .set_item(
            MASTER_KEY_KEY,
            base64::engine::general_purpose::STANDARD.encode(KEY),
        )
        .await
        .unwrap();
    let outcome = engine.upload_all().await.unwrap();
    assert!(matches!(outcome, Some(WriteOutcome::Delivered(_))));
    assert!(server.note(&notes[0].id).is_some());
    assert_eq!(server.requests(Endpoint::Upload), 1);

    let empty: Engine = SyncEngine::new(
        server.clone(),
        Arc::new(MemoryStore::new()),
        Arc::new(MasterKeyEnvelope::with_key(&KEY).unwrap()),
        NetworkStatus::online(),
        Arc::new(clock),
        EngineOptions::default(),
    );
    assert!(empty.upload_all().await.unwrap().is_none());
    assert_eq!(server.requests(Endpoint::Upload), 1);
}
