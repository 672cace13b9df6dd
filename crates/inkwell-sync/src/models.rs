//! Data models for synced notes and outbox operations.
//!
//! A [`NoteRecord`] is generic over the representation of its `title` and
//! `text` fields: [`Note`] holds plaintext and only ever lives in memory or in
//! the local vault, [`SealedNote`] holds wire-packed cipher blobs and is what
//! goes over the network and into the outbox.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use uuid::Uuid;

/// A note record, generic over its field representation.
///
/// Every field except `id` and `text` is optional so that "absent" stays
/// distinguishable from `false`/`0` through a shallow merge. Unknown fields are
/// kept in `extra` and survive a round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteRecord<T> {
    /// Client-generated id, stable for the note's lifetime.
    pub id: SmolStr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<T>,
    pub text: T,
    /// Per-note passphrase lock, independent of transport encryption.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protected: Option<bool>,
    /// Client timestamp in epoch ms. Absent compares as 0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_wipe: Option<bool>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// A note with plaintext title and text.
pub type Note = NoteRecord<String>;

/// A note whose title and text are wire-packed cipher blobs.
pub type SealedNote = NoteRecord<SealedText>;

/// A wire-packed [`CipherBlob`](crate::cipher::CipherBlob) string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SealedText(pub String);

impl SealedText {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<T> NoteRecord<T> {
    /// Timestamp used for last-write-wins comparisons.
    pub fn modified_ms(&self) -> i64 {
        self.last_modified.unwrap_or(0)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.unwrap_or(false)
    }

    pub fn is_protected(&self) -> bool {
        self.protected.unwrap_or(false)
    }

    /// Convert the field representation, keeping all metadata.
    pub fn try_map_fields<U, E>(
        self,
        mut f: impl FnMut(T, FieldKind) -> Result<U, E>,
    ) -> Result<NoteRecord<U>, E> {
        let title = match self.title {
            Some(title) => Some(f(title, FieldKind::Title)?),
            None => None,
        };
        let text = f(self.text, FieldKind::Text)?;
        Ok(NoteRecord {
            id: self.id,
            title,
            text,
            protected: self.protected,
            last_modified: self.last_modified,
            deleted: self.deleted,
            deleted_at: self.deleted_at,
            auto_wipe: self.auto_wipe,
            extra: self.extra,
        })
    }

    /// Shallow merge: every field present on `newer` replaces the field on
    /// `self`; fields `newer` lacks keep their current value.
    pub fn overlay(&mut self, newer: NoteRecord<T>) {
        self.id = newer.id;
        if newer.title.is_some() {
            self.title = newer.title;
        }
        self.text = newer.text;
        if newer.protected.is_some() {
            self.protected = newer.protected;
        }
        if newer.last_modified.is_some() {
            self.last_modified = newer.last_modified;
        }
        if newer.deleted.is_some() {
            self.deleted = newer.deleted;
        }
        if newer.deleted_at.is_some() {
            self.deleted_at = newer.deleted_at;
        }
        if newer.auto_wipe.is_some() {
            self.auto_wipe = newer.auto_wipe;
        }
        self.extra.extend(newer.extra);
    }
}

impl Note {
    /// Create a fresh note stamped at `now_ms`.
    pub fn new(
        id: impl Into<SmolStr>,
        title: impl Into<String>,
        text: impl Into<String>,
        now_ms: i64,
    ) -> Self {
        Self {
            id: id.into(),
            title: Some(title.into()),
            text: text.into(),
            protected: None,
            last_modified: Some(now_ms),
            deleted: None,
            deleted_at: None,
            auto_wipe: None,
            extra: BTreeMap::new(),
        }
    }

    /// Generate a new client-side note id.
    pub fn generate_id() -> SmolStr {
        SmolStr::new(Uuid::new_v4().simple().to_string())
    }

    pub fn title_str(&self) -> &str {
        self.title.as_deref().unwrap_or("")
    }

    /// Stamp a local edit. The timestamp never goes backwards for this note,
    /// even if the wall clock does.
    pub fn touch(&mut self, now_ms: i64) {
        let next = match self.last_modified {
            Some(prev) if now_ms <= prev => prev + 1,
            _ => now_ms,
        };
        self.last_modified = Some(next);
    }

    /// Turn this note into a tombstone.
    pub fn mark_deleted(&mut self, now_ms: i64) {
        self.touch(now_ms);
        self.deleted = Some(true);
        self.deleted_at = self.last_modified;
    }
}

/// Which encrypted field of a note a value belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Title,
    Text,
}

impl FieldKind {
    /// Additional authenticated data binding a field's ciphertext to its note.
    ///
    /// Text is bound to `<id>`, title to `<id>#title`, so the two can't be
    /// swapped or moved to another note.
    pub fn aad(self, note_id: &str) -> Vec<u8> {
        match self {
            FieldKind::Text => note_id.as_bytes().to_vec(),
            FieldKind::Title => format!("{note_id}#title").into_bytes(),
        }
    }
}

/// Whitespace normalization used for content comparison.
pub fn normalize(s: &str) -> String {
    let unified = s.replace("\r\n", "\n");
    let mut out = String::with_capacity(unified.len());
    let mut pending_ws = String::new();
    for c in unified.chars() {
        if c == '\n' {
            // whitespace (blank lines included) before a newline collapses into it
            pending_ws.clear();
            if !out.ends_with('\n') {
                out.push('\n');
            }
        } else if c.is_whitespace() {
            pending_ws.push(c);
        } else {
            out.push_str(&pending_ws);
            pending_ws.clear();
            out.push(c);
        }
    }
    out.push_str(&pending_ws);
    out.trim().to_string()
}

/// Whether two notes carry the same user-visible content.
pub fn same_content(a: &Note, b: &Note) -> bool {
    normalize(a.title_str()) == normalize(b.title_str())
        && normalize(&a.text) == normalize(&b.text)
        && a.is_deleted() == b.is_deleted()
}

/// Outbox operation type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Upload,
    Delete,
    /// Written by a build that knows more op types than this one.
    #[serde(other)]
    Unknown,
}

/// Request body for `/upload` and delete-only `/sync-plan`, stored verbatim
/// in the outbox so that replay sends exactly what was first attempted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncPayload {
    pub op_id: Uuid,
    #[serde(default)]
    pub since: i64,
    #[serde(default)]
    pub notes: Vec<SealedNote>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_ids: Option<Vec<SmolStr>>,
}

impl SyncPayload {
    pub fn upload(op_id: Uuid, since: i64, notes: Vec<SealedNote>) -> Self {
        Self {
            op_id,
            since,
            notes,
            deleted_ids: None,
        }
    }

    pub fn delete(op_id: Uuid, ids: Vec<SmolStr>) -> Self {
        Self {
            op_id,
            since: 0,
            notes: Vec::new(),
            deleted_ids: Some(ids),
        }
    }
}

/// A pending write that could not be delivered synchronously.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxOp {
    /// Mirrors `payload.op_id`; the server's idempotency key.
    pub op_id: Uuid,
    #[serde(rename = "type")]
    pub kind: OpKind,
    pub payload: SyncPayload,
    #[serde(default)]
    pub attempt: u32,
    /// Eligible for replay once `now >= next_at`.
    #[serde(default)]
    pub next_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
}

impl OutboxOp {
    /// A fresh op, due immediately.
    pub fn new(kind: OpKind, payload: SyncPayload, now_ms: i64) -> Self {
        Self {
            op_id: payload.op_id,
            kind,
            payload,
            attempt: 0,
            next_at: now_ms,
            created_at: Some(now_ms),
        }
    }

    pub fn is_due(&self, now_ms: i64) -> bool {
        self.next_at <= now_ms
    }
}

/// One page of `/download`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DownloadPage {
    #[serde(default)]
    pub notes: Vec<SealedNote>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_more: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watermark: Option<i64>,
}

impl DownloadPage {
    /// The page returned while offline: nothing new, cursor unchanged.
    pub fn empty(since: i64) -> Self {
        Self {
            notes: Vec::new(),
            has_more: Some(false),
            watermark: Some(since),
        }
    }

    pub fn has_more(&self) -> bool {
        self.has_more.unwrap_or(false)
    }
}
