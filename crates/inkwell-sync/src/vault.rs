//! The decrypted note set, persisted locally.

use inkwell_common::{KvStore, StoreError};
use tokio::sync::Mutex;

use crate::models::Note;

pub const VAULT_KEY: &str = "notes";

/// At-rest wrapping of the serialized note set.
///
/// Passphrase protection of the whole vault lives outside the sync engine;
/// it plugs in here.
pub trait VaultCodec: Send + Sync {
    fn wrap(&self, plain: String) -> Result<String, StoreError>;
    fn unwrap(&self, stored: String) -> Result<String, StoreError>;
}

/// Stores the JSON as is.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainCodec;

impl VaultCodec for PlainCodec {
    fn wrap(&self, plain: String) -> Result<String, StoreError> {
        Ok(plain)
    }

    fn unwrap(&self, stored: String) -> Result<String, StoreError> {
        Ok(stored)
    }
}

/// Read-modify-write calls are serialized within the process.
pub struct NoteVault<S, C = PlainCodec> {
    store: S,
    codec: C,
    lock: Mutex<()>,
}

impl<S: KvStore> NoteVault<S> {
    pub fn new(store: S) -> Self {
        Self::with_codec(store, PlainCodec)
    }
}

impl<S: KvStore, C: VaultCodec> NoteVault<S, C> {
    pub fn with_codec(store: S, codec: C) -> Self {
        Self {
            store,
            codec,
            lock: Mutex::new(()),
        }
    }

    /// All notes, or an empty set if nothing has been saved yet.
    pub async fn load(&self) -> Result<Vec<Note>, StoreError> {
        let _guard = self.lock.lock().await;
        self.read().await
    }

    pub async fn save(&self, notes: &[Note]) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        self.write(notes).await
    }

    /// Run `f` on the current set and persist the result if it changed.
    pub async fn update<R>(&self, f: impl FnOnce(&mut Vec<Note>) -> R) -> Result<R, StoreError> {
        let _guard = self.lock.lock().await;
        let mut notes = self.read().await?;
        let before = notes.clone();
        let out = f(&mut notes);
        if notes != before {
            self.write(&notes).await?;
        }
        Ok(out)
    }

    /// Insert `note` or replace the note with the same id, keeping order.
    pub async fn upsert(&self, note: Note) -> Result<(), StoreError> {
        self.update(|notes| match notes.iter_mut().find(|n| n.id == note.id) {
            Some(existing) => *existing = note,
            None => notes.push(note),
        })
        .await
    }

    /// Remove notes by id. Returns how many were removed.
    pub async fn remove(&self, ids: &[impl AsRef<str> + Sync]) -> Result<usize, StoreError> {
        self.update(|notes| {
            let before = notes.len();
            notes.retain(|n| !ids.iter().any(|id| id.as_ref() == n.id.as_str()));
            before - notes.len()
        })
        .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<Note>, StoreError> {
        Ok(self.load().await?.into_iter().find(|n| n.id == id))
    }

    async fn read(&self) -> Result<Vec<Note>, StoreError> {
        let Some(stored) = self.store.get_item(VAULT_KEY).await? else {
            return Ok(Vec::new());
        };
        let raw = self.codec.unwrap(stored)?;
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&raw).map_err(|e| StoreError::corrupt(VAULT_KEY, e))
    }

    async fn write(&self, notes: &[Note]) -> Result<(), StoreError> {
        let raw = serde_json::to_string(notes).map_err(|e| StoreError::encode(VAULT_KEY, e))?;
        self.store.set_item(VAULT_KEY, self.codec.wrap(raw)?).await
    }
}
