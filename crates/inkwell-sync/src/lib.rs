//! Offline-first synchronization of end-to-end encrypted notes.
//!
//! Local edits are written to the [`vault`] and handed to the
//! [`NotesClient`](transport::NotesClient), which seals the note fields with
//! the [`CipherEnvelope`](cipher::CipherEnvelope) and either delivers them or
//! parks them in the [`outbox`]. The [`worker`] drains the outbox with
//! exponential backoff, [`pull`] merges the remote set back into the vault
//! with last-write-wins, and [`live`] mirrors the remote copy of the note
//! currently being edited. [`SyncEngine`] wires all of it together.

pub mod cipher;
pub mod clock;
pub mod engine;
pub mod error;
pub mod live;
pub mod merge;
pub mod models;
pub mod network;
pub mod outbox;
pub mod pull;
pub mod transport;
pub mod vault;
pub mod worker;

pub use cipher::{CipherBlob, CipherEnvelope, MasterKeyEnvelope};
pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{EngineHandles, EngineOptions, SyncEngine};
pub use error::{CipherError, SyncError};
pub use live::{EditorSyncState, LiveCheck, LiveEvent, LiveHandle, LivePoller, LiveSession};
pub use merge::{MergeOutcome, merge};
pub use models::{Note, OpKind, OutboxOp, SealedNote, SyncPayload};
pub use network::NetworkStatus;
pub use outbox::OutboxStore;
pub use pull::{PullOutcome, PullReport, PullSync};
pub use transport::{HttpNotesApi, NotesApi, NotesClient, QueueReason, WriteOutcome};
pub use vault::{NoteVault, PlainCodec, VaultCodec};
pub use worker::{CycleOutcome, CycleReport, SyncEvent, SyncWorker, WorkerConfig, WorkerHandle};
