//! Notes API client.
//!
//! [`NotesApi`] is the raw JSON-over-HTTP seam; [`NotesClient`] layers auth,
//! field encryption and the queue-on-failure contract on top of it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use inkwell_common::{Config, ConfigError, KvStore};
use reqwest::Url;
use serde::Serialize;
use serde_json::{Value, json};
use smol_str::SmolStr;
use uuid::Uuid;

use crate::cipher::{CipherEnvelope, open_note, seal_note};
use crate::clock::Clock;
use crate::error::{CipherError, SyncError};
use crate::models::{DownloadPage, Note, OpKind, OutboxOp, SealedNote, SyncPayload};
use crate::network::NetworkStatus;
use crate::outbox::OutboxStore;

/// Token store key for the bearer token.
pub const TOKEN_KEY: &str = "auth.token";
/// Token store key for base64 master key material.
pub const MASTER_KEY_KEY: &str = "auth.master_key";

/// Default page size for `/download`.
pub const DEFAULT_DOWNLOAD_LIMIT: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Upload,
    Download,
    Find,
    SyncPlan,
}

impl Endpoint {
    pub fn path(self) -> &'static str {
        match self {
            Endpoint::Upload => "upload",
            Endpoint::Download => "download",
            Endpoint::Find => "find",
            Endpoint::SyncPlan => "sync-plan",
        }
    }
}

/// Remote notes API.
///
/// Implementations POST `body` as JSON with `Authorization: Bearer <bearer>`
/// and return the parsed response. An empty 2xx body is `Value::Null`.
pub trait NotesApi: Send + Sync {
    fn post(
        &self,
        endpoint: Endpoint,
        body: Value,
        bearer: &str,
    ) -> impl Future<Output = Result<Value, SyncError>> + Send;
}

impl<A: NotesApi> NotesApi for Arc<A> {
    fn post(
        &self,
        endpoint: Endpoint,
        body: Value,
        bearer: &str,
    ) -> impl Future<Output = Result<Value, SyncError>> + Send {
        (**self).post(endpoint, body, bearer)
    }
}

/// [`NotesApi`] over HTTPS.
#[derive(Debug, Clone)]
pub struct HttpNotesApi {
    client: reqwest::Client,
    base: Url,
}

impl HttpNotesApi {
    /// `base` must end in `/`; endpoint paths are joined onto it.
    pub fn new(base: Url) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ConfigError::Invalid {
                field: "endpoint",
                message: e.to_string(),
            })?;
        Ok(Self { client, base })
    }

    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Self::new(config.endpoint_url()?)
    }
}

impl NotesApi for HttpNotesApi {
    async fn post(&self, endpoint: Endpoint, body: Value, bearer: &str) -> Result<Value, SyncError> {
        let name = endpoint.path();
        let transport = |e: &dyn std::fmt::Display| SyncError::Transport {
            endpoint: name,
            message: e.to_string(),
        };

        let url = self.base.join(name).map_err(|e| transport(&e))?;
        let response = self
            .client
            .post(url)
            .bearer_auth(bearer)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport(&e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::Status {
                endpoint: name,
                status: status.as_u16(),
            });
        }

        let bytes = response.bytes().await.map_err(|e| transport(&e))?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes).map_err(|e| SyncError::Response {
            endpoint: name,
            message: e.to_string(),
        })
    }
}

/// Why a write was queued instead of delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueReason {
    Offline,
    NetworkError,
}

/// Result of a write through [`NotesClient`].
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    /// The server accepted the write; its response body, uninterpreted.
    Delivered(Value),
    /// The write is in the outbox under `op_id`.
    Queued { op_id: Uuid, reason: QueueReason },
}

impl WriteOutcome {
    pub fn is_queued(&self) -> bool {
        matches!(self, WriteOutcome::Queued { .. })
    }
}

#[derive(Serialize)]
struct BatchOp<'a> {
    #[serde(rename = "opId")]
    op_id: Uuid,
    #[serde(rename = "type")]
    kind: OpKind,
    payload: &'a SyncPayload,
}

/// Encrypting, queueing client for the notes API.
pub struct NotesClient<A, S> {
    api: A,
    tokens: S,
    outbox: Arc<OutboxStore<S>>,
    envelope: Arc<dyn CipherEnvelope>,
    network: NetworkStatus,
    clock: Arc<dyn Clock>,
}

impl<A: NotesApi, S: KvStore> NotesClient<A, S> {
    pub fn new(
        api: A,
        tokens: S,
        outbox: Arc<OutboxStore<S>>,
        envelope: Arc<dyn CipherEnvelope>,
        network: NetworkStatus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            api,
            tokens,
            outbox,
            envelope,
            network,
            clock,
        }
    }

    pub fn outbox(&self) -> &Arc<OutboxStore<S>> {
        &self.outbox
    }

    pub fn network(&self) -> &NetworkStatus {
        &self.network
    }

    pub fn envelope(&self) -> &dyn CipherEnvelope {
        self.envelope.as_ref()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Encrypt and upload `notes`.
    ///
    /// Offline or failed deliveries are queued under `op_id` (fresh if not
    /// given) and reported as [`WriteOutcome::Queued`]. Fails only when the
    /// notes can't be sealed or the queue can't be written.
    pub async fn upload(
        &self,
        since_ms: i64,
        notes: &[Note],
        op_id: Option<Uuid>,
    ) -> Result<WriteOutcome, SyncError> {
        self.ensure_unlocked().await?;
        let sealed = notes
            .iter()
            .cloned()
            .map(|note| seal_note(self.envelope.as_ref(), note))
            .collect::<Result<Vec<_>, _>>()?;

        let payload = SyncPayload::upload(op_id.unwrap_or_else(Uuid::new_v4), since_ms, sealed);
        self.deliver(OpKind::Upload, payload).await
    }

    /// Send a delete-only op for `ids`, with the same queue-on-failure
    /// contract as [`upload`](Self::upload).
    pub async fn delete_notes(&self, ids: &[SmolStr]) -> Result<WriteOutcome, SyncError> {
        let payload = SyncPayload::delete(Uuid::new_v4(), ids.to_vec());
        self.deliver(OpKind::Delete, payload).await
    }

    /// One page of notes changed after `since_ms`, still sealed.
    ///
    /// Offline yields an empty page with the watermark left at `since_ms`.
    pub async fn download(&self, since_ms: i64, limit: u32) -> Result<DownloadPage, SyncError> {
        if !self.network.is_online() {
            tracing::debug!(since_ms, "offline, skipping download");
            return Ok(DownloadPage::empty(since_ms));
        }
        let body = json!({ "since": since_ms.max(0), "limit": limit });
        let value = self.send(Endpoint::Download, body).await?;
        serde_json::from_value(value).map_err(|e| SyncError::Response {
            endpoint: Endpoint::Download.path(),
            message: e.to_string(),
        })
    }

    /// Fetch one note by id, still sealed.
    pub async fn find(&self, id: &str) -> Result<SealedNote, SyncError> {
        if !self.network.is_online() {
            return Err(SyncError::Offline);
        }
        let value = self.send(Endpoint::Find, json!({ "id": id })).await?;
        serde_json::from_value(value).map_err(|e| SyncError::Response {
            endpoint: Endpoint::Find.path(),
            message: e.to_string(),
        })
    }

    /// Fetch and decrypt one note.
    pub async fn find_open(&self, id: &str) -> Result<Note, SyncError> {
        let sealed = self.find(id).await?;
        self.ensure_unlocked().await?;
        Ok(open_note(self.envelope.as_ref(), sealed)?)
    }

    /// Re-send a queued op exactly as stored.
    pub async fn replay(&self, op: &OutboxOp) -> Result<Value, SyncError> {
        let endpoint = match op.kind {
            OpKind::Upload => Endpoint::Upload,
            OpKind::Delete => Endpoint::SyncPlan,
            OpKind::Unknown => {
                return Err(SyncError::Serialization(format!(
                    "op {} has an unknown type",
                    op.op_id
                )));
            }
        };
        let body = serde_json::to_value(&op.payload)?;
        self.send(endpoint, body).await
    }

    /// Send several ops in one `/sync-plan` call. Returns the ids the server
    /// applied; a response without an `applied` list means all of them.
    pub async fn replay_batch(&self, ops: &[OutboxOp]) -> Result<Vec<Uuid>, SyncError> {
        let batch: Vec<BatchOp<'_>> = ops
            .iter()
            .map(|op| BatchOp {
                op_id: op.op_id,
                kind: op.kind,
                payload: &op.payload,
            })
            .collect();
        let response = self
            .send(Endpoint::SyncPlan, json!({ "ops": batch }))
            .await?;

        match response.get("applied").and_then(Value::as_array) {
            Some(applied) => Ok(applied
                .iter()
                .filter_map(Value::as_str)
                .filter_map(|id| Uuid::parse_str(id).ok())
                .collect()),
            None => Ok(ops.iter().map(|op| op.op_id).collect()),
        }
    }

    /// Make sure the envelope holds a key, importing it from the token store
    /// if needed.
    pub async fn ensure_unlocked(&self) -> Result<(), SyncError> {
        if self.envelope.is_unlocked() {
            return Ok(());
        }
        if let Some(material) = self.tokens.get_item(MASTER_KEY_KEY).await? {
            self.envelope.import_key(&material)?;
        }
        if self.envelope.is_unlocked() {
            Ok(())
        } else {
            Err(CipherError::Locked.into())
        }
    }

    async fn deliver(&self, kind: OpKind, payload: SyncPayload) -> Result<WriteOutcome, SyncError> {
        let op_id = payload.op_id;
        if !self.network.is_online() {
            return self.queue(kind, payload, QueueReason::Offline).await;
        }

        let endpoint = match kind {
            OpKind::Delete => Endpoint::SyncPlan,
            _ => Endpoint::Upload,
        };
        let body = serde_json::to_value(&payload)?;
        match self.send(endpoint, body).await {
            Ok(response) => {
                tracing::debug!(%op_id, endpoint = endpoint.path(), "delivered");
                Ok(WriteOutcome::Delivered(response))
            }
            Err(e) if e.is_transient() => {
                tracing::warn!(%op_id, endpoint = endpoint.path(), error = %e, "delivery failed, queueing");
                self.queue(kind, payload, QueueReason::NetworkError).await
            }
            Err(e) => Err(e),
        }
    }

    async fn queue(
        &self,
        kind: OpKind,
        payload: SyncPayload,
        reason: QueueReason,
    ) -> Result<WriteOutcome, SyncError> {
        let op = OutboxOp::new(kind, payload, self.clock.now_ms());
        let op_id = op.op_id;
        self.outbox.enqueue(op).await?;
        Ok(WriteOutcome::Queued { op_id, reason })
    }

    async fn send(&self, endpoint: Endpoint, body: Value) -> Result<Value, SyncError> {
        let bearer = self.tokens.get_item(TOKEN_KEY).await?.unwrap_or_default();
        self.api.post(endpoint, body, &bearer).await
    }
}
