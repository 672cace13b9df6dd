//! Durable FIFO of writes that have not been acknowledged by the server.
//!
//! The whole queue is stored as one JSON array under [`OUTBOX_KEY`]. Every
//! mutation is a read-modify-write of that array, serialized by an in-process
//! mutex; a single writer process is assumed.

use inkwell_common::{KvStore, StoreError};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::OutboxOp;

pub const OUTBOX_KEY: &str = "notes.sync.outbox.v1";
pub const DEAD_LETTER_KEY: &str = "notes.sync.deadletter.v1";

/// Ops returned by [`OutboxStore::peek_due`] when no limit is given.
pub const DEFAULT_PEEK_LIMIT: usize = 50;

pub struct OutboxStore<S> {
    store: S,
    lock: Mutex<()>,
}

impl<S: KvStore> OutboxStore<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            lock: Mutex::new(()),
        }
    }

    /// Append an op. No deduplication.
    pub async fn enqueue(&self, op: OutboxOp) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut ops = self.load(OUTBOX_KEY).await?;
        tracing::debug!(op_id = %op.op_id, kind = ?op.kind, queued = ops.len() + 1, "enqueued outbox op");
        ops.push(op);
        self.save(OUTBOX_KEY, &ops).await
    }

    /// Up to `limit` ops whose `next_at` has passed, in queue order.
    pub async fn peek_due(&self, limit: usize, now_ms: i64) -> Result<Vec<OutboxOp>, StoreError> {
        let _guard = self.lock.lock().await;
        let ops = self.load(OUTBOX_KEY).await?;
        Ok(ops
            .into_iter()
            .filter(|op| op.is_due(now_ms))
            .take(limit)
            .collect())
    }

    /// Remove ops by id. Unknown ids are ignored.
    pub async fn drop_ops(&self, op_ids: &[Uuid]) -> Result<(), StoreError> {
        if op_ids.is_empty() {
            return Ok(());
        }
        let _guard = self.lock.lock().await;
        let mut ops = self.load(OUTBOX_KEY).await?;
        ops.retain(|op| !op_ids.contains(&op.op_id));
        self.save(OUTBOX_KEY, &ops).await
    }

    /// Overwrite the whole queue.
    pub async fn replace(&self, ops: &[OutboxOp]) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        self.save(OUTBOX_KEY, ops).await
    }

    /// Write back updated copies of queued ops, matched by id, keeping
    /// queue order and anything enqueued since they were peeked.
    pub async fn reschedule(&self, updated: &[OutboxOp]) -> Result<(), StoreError> {
        if updated.is_empty() {
            return Ok(());
        }
        let _guard = self.lock.lock().await;
        let mut ops = self.load(OUTBOX_KEY).await?;
        for op in ops.iter_mut() {
            if let Some(next) = updated.iter().find(|u| u.op_id == op.op_id) {
                *op = next.clone();
            }
        }
        self.save(OUTBOX_KEY, &ops).await
    }

    pub async fn get_all(&self) -> Result<Vec<OutboxOp>, StoreError> {
        let _guard = self.lock.lock().await;
        self.load(OUTBOX_KEY).await
    }

    pub async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.get_all().await?.len())
    }

    pub async fn clear(&self) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        self.save(OUTBOX_KEY, &[]).await
    }

    /// Move an op out of the queue into the dead-letter list.
    ///
    /// The dead-letter list is written first, so a crash in between leaves
    /// the op in both places rather than in neither.
    pub async fn dead_letter(&self, op: &OutboxOp) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut dead = self.load(DEAD_LETTER_KEY).await?;
        if !dead.iter().any(|d| d.op_id == op.op_id) {
            dead.push(op.clone());
            self.save(DEAD_LETTER_KEY, &dead).await?;
        }

        let mut ops = self.load(OUTBOX_KEY).await?;
        ops.retain(|queued| queued.op_id != op.op_id);
        self.save(OUTBOX_KEY, &ops).await
    }

    pub async fn dead_letters(&self) -> Result<Vec<OutboxOp>, StoreError> {
        let _guard = self.lock.lock().await;
        self.load(DEAD_LETTER_KEY).await
    }

    pub async fn clear_dead_letters(&self) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        self.store.remove_item(DEAD_LETTER_KEY).await
    }

    /// Put every dead-lettered op back on the queue with a fresh retry budget.
    /// Returns how many were requeued.
    pub async fn requeue_dead_letters(&self, now_ms: i64) -> Result<usize, StoreError> {
        let _guard = self.lock.lock().await;
        let dead = self.load(DEAD_LETTER_KEY).await?;
        if dead.is_empty() {
            return Ok(0);
        }
        let mut ops = self.load(OUTBOX_KEY).await?;
        let count = dead.len();
        for mut op in dead {
            if ops.iter().any(|queued| queued.op_id == op.op_id) {
                continue;
            }
            op.attempt = 0;
            op.next_at = now_ms;
            ops.push(op);
        }
        self.save(OUTBOX_KEY, &ops).await?;
        self.store.remove_item(DEAD_LETTER_KEY).await?;
        Ok(count)
    }

    async fn load(&self, key: &str) -> Result<Vec<OutboxOp>, StoreError> {
        let Some(raw) = self.store.get_item(key).await? else {
            return Ok(Vec::new());
        };
        let entries = match serde_json::from_str(&raw) {
            Ok(serde_json::Value::Array(entries)) => entries,
            Ok(_) => {
                tracing::warn!(key, "outbox value is not an array, starting empty");
                return Ok(Vec::new());
            }
            Err(e) => {
                tracing::warn!(key, error = %e, "outbox value is not JSON, starting empty");
                return Ok(Vec::new());
            }
        };
        // one unreadable entry must not take the rest of the queue with it
        let ops: Vec<OutboxOp> = entries
            .into_iter()
            .enumerate()
            .filter_map(|(index, entry)| match serde_json::from_value(entry) {
                Ok(op) => Some(op),
                Err(e) => {
                    tracing::warn!(key, index, error = %e, "skipping unreadable outbox entry");
                    None
                }
            })
            .collect();
        Ok(ops)
    }

    async fn save(&self, key: &str, ops: &[OutboxOp]) -> Result<(), StoreError> {
        let raw = serde_json::to_string(ops).map_err(|e| StoreError::encode(key, e.to_string()))?;
        self.store.set_item(key, raw).await
    }
}
