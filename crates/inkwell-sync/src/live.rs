//! Live reconciliation of the note that is open in the editor.
//!
//! While a note is open its remote copy is fetched periodically and mirrored
//! into the edit buffer with single-note last-write-wins. A remote tombstone or
//! a change of the note's `protected` flag ends the session: the caller must
//! close the editor and go back to the list.

use std::sync::{Arc, Mutex, MutexGuard};

use inkwell_common::KvStore;
use n0_future::task::{self, JoinHandle};
use n0_future::time::{self, Duration};
use tokio::sync::{Notify, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::cipher::open_note;
use crate::clock::Clock;
use crate::error::SyncError;
use crate::models::{Note, SealedNote, same_content};
use crate::transport::{NotesApi, NotesClient};

pub const LIVE_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Quiet period after the last keystroke before live updates resume.
pub const TYPING_QUIET_MS: i64 = 10_000;

/// Sync state of one editing session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EditorSyncState {
    #[default]
    Idle,
    /// The user typed recently; live updates wait until `quiet_until`.
    Editing { quiet_until: i64 },
    /// Live updates suspended until resumed (e.g. a modal is open).
    Paused,
}

impl EditorSyncState {
    /// Record a keystroke at `now_ms`. Has no effect while paused.
    pub fn keystroke(&mut self, now_ms: i64) {
        if *self != EditorSyncState::Paused {
            *self = EditorSyncState::Editing {
                quiet_until: now_ms + TYPING_QUIET_MS,
            };
        }
    }

    /// Drop back to idle once the quiet period has elapsed.
    pub fn settle(&mut self, now_ms: i64) {
        if let EditorSyncState::Editing { quiet_until } = *self {
            if now_ms >= quiet_until {
                *self = EditorSyncState::Idle;
            }
        }
    }

    pub fn is_typing(&self, now_ms: i64) -> bool {
        matches!(*self, EditorSyncState::Editing { quiet_until } if now_ms < quiet_until)
    }

    pub fn is_paused(&self) -> bool {
        *self == EditorSyncState::Paused
    }

    pub fn pause(&mut self) {
        *self = EditorSyncState::Paused;
    }

    pub fn resume(&mut self) {
        if self.is_paused() {
            *self = EditorSyncState::Idle;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Paused,
    Hidden,
    Offline,
    Typing,
    /// The note is behind its passphrase lock.
    Locked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbandonReason {
    Deleted,
    ProtectionChanged,
}

/// Result of one live check.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveCheck {
    Skipped(SkipReason),
    /// Same timestamp, or a newer remote copy whose content only differs
    /// in whitespace.
    Unchanged,
    LocalNewer,
    /// The buffer now holds the remote version.
    Updated(Note),
    /// The edit session must end.
    Abandon(AbandonReason),
}

/// Edit buffer and view state of the open note.
#[derive(Debug, Clone)]
pub struct LiveSession {
    note: Note,
    state: EditorSyncState,
    visible: bool,
    locked: bool,
}

impl LiveSession {
    /// A session on `note`. Protected notes start locked.
    pub fn new(note: Note) -> Self {
        let locked = note.is_protected();
        Self {
            note,
            state: EditorSyncState::Idle,
            visible: true,
            locked,
        }
    }

    pub fn note(&self) -> &Note {
        &self.note
    }

    pub fn state(&self) -> EditorSyncState {
        self.state
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
    }

    pub fn set_locked(&mut self, locked: bool) {
        self.locked = locked;
    }

    pub fn pause(&mut self) {
        self.state.pause();
    }

    pub fn resume(&mut self) {
        self.state.resume();
    }

    /// Apply a local edit and return the updated note, ready to save.
    pub fn edit(&mut self, now_ms: i64, title: Option<String>, text: Option<String>) -> Note {
        if let Some(title) = title {
            self.note.title = Some(title);
        }
        if let Some(text) = text {
            self.note.text = text;
        }
        self.note.touch(now_ms);
        self.state.keystroke(now_ms);
        self.note.clone()
    }

    /// Why a check at `now_ms` should not run, if it shouldn't.
    pub fn gate(&mut self, now_ms: i64, online: bool) -> Option<SkipReason> {
        self.state.settle(now_ms);
        if self.state.is_paused() {
            Some(SkipReason::Paused)
        } else if !self.visible {
            Some(SkipReason::Hidden)
        } else if !online {
            Some(SkipReason::Offline)
        } else if self.locked {
            Some(SkipReason::Locked)
        } else if self.state.is_typing(now_ms) {
            Some(SkipReason::Typing)
        } else {
            None
        }
    }

    /// Reconcile the buffer with the remote copy. `open` decrypts the remote
    /// record and is only called when the remote side is newer.
    pub fn reconcile<E>(
        &mut self,
        remote: SealedNote,
        open: impl FnOnce(SealedNote) -> Result<Note, E>,
    ) -> Result<LiveCheck, E> {
        if remote.is_deleted() {
            return Ok(LiveCheck::Abandon(AbandonReason::Deleted));
        }
        if remote.is_protected() != self.note.is_protected() {
            return Ok(LiveCheck::Abandon(AbandonReason::ProtectionChanged));
        }

        let (remote_ms, local_ms) = (remote.modified_ms(), self.note.modified_ms());
        if remote_ms == local_ms {
            return Ok(LiveCheck::Unchanged);
        }
        if local_ms > remote_ms {
            return Ok(LiveCheck::LocalNewer);
        }

        let opened = open(remote)?;
        let visible_change = !same_content(&self.note, &opened);
        self.note.overlay(opened);
        if visible_change {
            Ok(LiveCheck::Updated(self.note.clone()))
        } else {
            // whitespace-only difference; take the newer stamp quietly
            Ok(LiveCheck::Unchanged)
        }
    }
}

/// Runs live checks for one note.
pub struct LivePoller<A, S> {
    client: Arc<NotesClient<A, S>>,
}

impl<A: NotesApi, S: KvStore> LivePoller<A, S> {
    pub fn new(client: Arc<NotesClient<A, S>>) -> Self {
        Self { client }
    }

    /// One live check of `session`'s note.
    ///
    /// Errors from `find` and from decryption are returned; the next check
    /// simply tries again.
    pub async fn poll_once(&self, session: &mut LiveSession) -> Result<LiveCheck, SyncError> {
        let now = self.client.clock().now_ms();
        if let Some(reason) = session.gate(now, self.client.network().is_online()) {
            return Ok(LiveCheck::Skipped(reason));
        }
        let remote = self.client.find(&session.note.id).await?;
        self.apply(session, remote).await
    }

    /// [`poll_once`](Self::poll_once) on a session shared with the editor.
    /// The lock is not held while the request is in flight.
    pub async fn poll_shared(&self, session: &Mutex<LiveSession>) -> Result<LiveCheck, SyncError> {
        let now = self.client.clock().now_ms();
        let online = self.client.network().is_online();
        let id = {
            let mut session = lock(session);
            if let Some(reason) = session.gate(now, online) {
                return Ok(LiveCheck::Skipped(reason));
            }
            session.note.id.clone()
        };

        let remote = self.client.find(&id).await?;
        // the key may need importing; do it before taking the lock
        let needs_key = !self.client.envelope().is_unlocked();
        if needs_key {
            self.client.ensure_unlocked().await?;
        }

        let mut session = lock(session);
        if session.note.id != id {
            return Ok(LiveCheck::Unchanged);
        }
        session.reconcile(remote, |sealed| {
            open_note(self.client.envelope(), sealed).map_err(SyncError::from)
        })
    }

    async fn apply(&self, session: &mut LiveSession, remote: SealedNote) -> Result<LiveCheck, SyncError> {
        if remote.modified_ms() > session.note.modified_ms() && !self.client.envelope().is_unlocked() {
            self.client.ensure_unlocked().await?;
        }
        session.reconcile(remote, |sealed| {
            open_note(self.client.envelope(), sealed).map_err(SyncError::from)
        })
    }
}

fn lock(session: &Mutex<LiveSession>) -> MutexGuard<'_, LiveSession> {
    session.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// What a spawned poller reports to the editor.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveEvent {
    /// The remote copy won; the buffer was replaced.
    Updated(Note),
    /// Close the editor. The poller has stopped.
    Abandon(AbandonReason),
    /// A check failed; polling continues.
    Error(String),
}

impl<A, S> LivePoller<A, S>
where
    A: NotesApi + 'static,
    S: KvStore + 'static,
{
    /// Start polling `session` every `interval`.
    ///
    /// Checks also run on every offline -> online flip and on
    /// [`LiveHandle::poke`]. The loop ends on [`LiveHandle::stop`], when the
    /// event receiver is dropped, or after an abandon.
    pub fn spawn(
        self,
        session: LiveSession,
        interval: Duration,
    ) -> (LiveHandle, mpsc::Receiver<LiveEvent>) {
        let session = Arc::new(Mutex::new(session));
        let poke = Arc::new(Notify::new());
        let (events_tx, events_rx) = mpsc::channel(16);
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let mut network = self.client.network().subscribe();
        let clock = self.client.clock().clone();

        let task_session = session.clone();
        let task_poke = poke.clone();
        let task = task::spawn(async move {
            let note_id = lock(&task_session).note.id.clone();
            info!(%note_id, interval_secs = interval.as_secs(), "live polling started");

            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // interval fires immediately; the note was just loaded
            ticker.tick().await;
            let mut watching_network = true;

            loop {
                tokio::select! {
                    biased;

                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {}
                    _ = task_poke.notified() => {}
                    changed = network.changed(), if watching_network => {
                        match changed {
                            Ok(()) => {
                                if !*network.borrow_and_update() {
                                    continue;
                                }
                            }
                            Err(_) => {
                                watching_network = false;
                                continue;
                            }
                        }
                    }
                }

                let event = match self.poll_shared(&task_session).await {
                    Ok(LiveCheck::Updated(note)) => LiveEvent::Updated(note),
                    Ok(LiveCheck::Abandon(reason)) => LiveEvent::Abandon(reason),
                    Ok(check) => {
                        debug!(%note_id, ?check, "live check");
                        continue;
                    }
                    Err(e) => {
                        warn!(%note_id, error = %e, "live check failed");
                        LiveEvent::Error(e.to_string())
                    }
                };

                let abandon = matches!(event, LiveEvent::Abandon(_));
                if events_tx.send(event).await.is_err() || abandon {
                    break;
                }
            }
            info!(%note_id, "live polling stopped");
        });

        let handle = LiveHandle {
            session,
            poke,
            clock,
            stop: Some(stop_tx),
            task,
        };
        (handle, events_rx)
    }
}

/// Control handle for a spawned [`LivePoller`].
pub struct LiveHandle {
    session: Arc<Mutex<LiveSession>>,
    poke: Arc<Notify>,
    clock: Arc<dyn Clock>,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl LiveHandle {
    /// Check now (window focus, app resume).
    pub fn poke(&self) {
        self.poke.notify_one();
    }

    pub fn pause(&self) {
        lock(&self.session).pause();
    }

    /// Resume live updates and check immediately.
    pub fn resume(&self) {
        lock(&self.session).resume();
        self.poke();
    }

    pub fn set_visible(&self, visible: bool) {
        lock(&self.session).set_visible(visible);
    }

    pub fn set_locked(&self, locked: bool) {
        lock(&self.session).set_locked(locked);
    }

    /// Apply a local edit to the buffer; returns the note to save.
    pub fn edit(&self, title: Option<String>, text: Option<String>) -> Note {
        let now = self.clock.now_ms();
        lock(&self.session).edit(now, title, text)
    }

    pub fn note(&self) -> Note {
        lock(&self.session).note().clone()
    }

    pub fn state(&self) -> EditorSyncState {
        lock(&self.session).state()
    }

    /// Stop polling. Returns the final buffer.
    pub async fn stop(mut self) -> Note {
        if let Some(tx) = self.stop.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.task).await {
            warn!(error = %e, "live poller task ended abnormally");
        }
        lock(&self.session).note().clone()
    }
}
