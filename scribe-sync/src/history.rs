//! Durable checkpoint history.
//!
//! The history store is external; this module defines its contract, the
//! checkpoint record format, and [`MemoryHistory`], an in-process store used
//! by tests and the demo.
//!
//! ```text
//! ┌──────────────┐  append(doc, checkpoint)   ┌──────────────┐
//! │ Checkpoint   │ ─────────────────────────► │ HistoryStore │
//! │ Scheduler    │                            │              │
//! └──────────────┘                            │  doc ─► [c0, │
//! ┌──────────────┐  query_latest(doc, 1, ↓)   │        c1,   │
//! │ Snapshot     │ ◄───────────────────────── │        c2]   │
//! │ Loader       │                            └──────────────┘
//! └──────────────┘
//! ```
//!
//! Checkpoint payloads are the document delta as JSON, optionally LZ4
//! compressed (size-prepended block format).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::{watch, RwLock};

use crate::delta::Delta;
use crate::protocol::{now_millis, DocumentId, OperationId};

/// How a checkpoint payload is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CheckpointEncoding {
    /// Plain JSON delta.
    #[default]
    Json,
    /// LZ4-compressed JSON delta.
    Lz4Json,
}

/// Ordering of a history query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// A full snapshot of document content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub document_id: DocumentId,
    /// Revision of the writing session at capture time.
    pub revision: u64,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
    pub encoding: CheckpointEncoding,
    pub payload: Vec<u8>,
    /// Ids of the most recent operations included in the payload.
    #[serde(default)]
    pub operations: Vec<OperationId>,
}

impl Checkpoint {
    /// Serialize `content` into a new checkpoint.
    pub fn capture(
        document_id: DocumentId,
        revision: u64,
        content: &Delta,
        encoding: CheckpointEncoding,
    ) -> Result<Self, HistoryError> {
        let json = serde_json::to_vec(content)
            .map_err(|e| HistoryError::SerializationError(e.to_string()))?;
        let payload = match encoding {
            CheckpointEncoding::Json => json,
            CheckpointEncoding::Lz4Json => lz4_flex::compress_prepend_size(&json),
        };
        Ok(Self {
            document_id,
            revision,
            created_at: now_millis(),
            encoding,
            payload,
            operations: Vec::new(),
        })
    }

    /// Record which operations the captured content already includes.
    pub fn with_operations(mut self, operations: Vec<OperationId>) -> Self {
        self.operations = operations;
        self
    }

    /// Decode the stored content back into a document delta.
    pub fn content(&self) -> Result<Delta, HistoryError> {
        let json = match self.encoding {
            CheckpointEncoding::Json => std::borrow::Cow::Borrowed(self.payload.as_slice()),
            CheckpointEncoding::Lz4Json => std::borrow::Cow::Owned(
                lz4_flex::decompress_size_prepended(&self.payload)
                    .map_err(|e| HistoryError::CompressionError(e.to_string()))?,
            ),
        };
        let content: Delta = serde_json::from_slice(&json)
            .map_err(|e| HistoryError::DeserializationError(e.to_string()))?;
        if !content.is_document() {
            return Err(HistoryError::DeserializationError(
                "checkpoint content is not a document".into(),
            ));
        }
        content
            .validate()
            .map_err(|e| HistoryError::DeserializationError(e.to_string()))?;
        Ok(content)
    }

    /// Payload size in bytes.
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

/// History store errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryError {
    /// The store could not be reached or refused the call.
    Unavailable(String),
    SerializationError(String),
    DeserializationError(String),
    CompressionError(String),
}

impl fmt::Display for HistoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HistoryError::Unavailable(e) => write!(f, "History store unavailable: {e}"),
            HistoryError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            HistoryError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            HistoryError::CompressionError(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for HistoryError {}

/// Durable append/query of document checkpoints.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn query_latest(
        &self,
        document_id: &DocumentId,
        limit: usize,
        order: SortOrder,
    ) -> Result<Vec<Checkpoint>, HistoryError>;

    async fn append(
        &self,
        document_id: &DocumentId,
        checkpoint: Checkpoint,
    ) -> Result<(), HistoryError>;
}

/// In-memory history store.
///
/// Checkpoints are filed under each document's history channel name.
/// Appends are atomic under the write lock, so readers never observe a
/// partially written checkpoint. Fault injection hooks let tests simulate
/// an unreliable store.
pub struct MemoryHistory {
    channels: RwLock<HashMap<String, Vec<Checkpoint>>>,
    failing_appends: AtomicU32,
    failing_queries: AtomicU32,
    query_gate: watch::Sender<bool>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        let (query_gate, _) = watch::channel(true);
        Self {
            channels: RwLock::new(HashMap::new()),
            failing_appends: AtomicU32::new(0),
            failing_queries: AtomicU32::new(0),
            query_gate,
        }
    }

    /// Make the next `count` appends fail with `Unavailable`.
    pub fn fail_next_appends(&self, count: u32) {
        self.failing_appends.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` queries fail with `Unavailable`.
    pub fn fail_next_queries(&self, count: u32) {
        self.failing_queries.store(count, Ordering::SeqCst);
    }

    /// Hold every query until [`resume_queries`](Self::resume_queries).
    pub fn pause_queries(&self) {
        self.query_gate.send_replace(false);
    }

    pub fn resume_queries(&self) {
        self.query_gate.send_replace(true);
    }

    /// Number of checkpoints stored for a document.
    pub async fn checkpoint_count(&self, document_id: &DocumentId) -> usize {
        self.channels
            .read()
            .await
            .get(&document_id.history_channel())
            .map_or(0, Vec::len)
    }

    /// Most recent checkpoint for a document, if any.
    pub async fn latest(&self, document_id: &DocumentId) -> Option<Checkpoint> {
        self.channels
            .read()
            .await
            .get(&document_id.history_channel())
            .and_then(|history| history.last().cloned())
    }

    /// Seed a checkpoint directly, bypassing fault injection.
    pub async fn insert(&self, checkpoint: Checkpoint) {
        self.channels
            .write()
            .await
            .entry(checkpoint.document_id.history_channel())
            .or_default()
            .push(checkpoint);
    }

    fn take_fault(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for MemoryHistory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistory {
    async fn query_latest(
        &self,
        document_id: &DocumentId,
        limit: usize,
        order: SortOrder,
    ) -> Result<Vec<Checkpoint>, HistoryError> {
        let mut gate = self.query_gate.subscribe();
        if gate.wait_for(|open| *open).await.is_err() {
            return Err(HistoryError::Unavailable("store closed".into()));
        }
        if Self::take_fault(&self.failing_queries) {
            return Err(HistoryError::Unavailable("injected query fault".into()));
        }

        let channels = self.channels.read().await;
        let Some(history) = channels.get(&document_id.history_channel()) else {
            return Ok(Vec::new());
        };
        let result = match order {
            SortOrder::Descending => history.iter().rev().take(limit).cloned().collect(),
            SortOrder::Ascending => history.iter().take(limit).cloned().collect(),
        };
        Ok(result)
    }

    async fn append(
        &self,
        document_id: &DocumentId,
        checkpoint: Checkpoint,
    ) -> Result<(), HistoryError> {
        if Self::take_fault(&self.failing_appends) {
            return Err(HistoryError::Unavailable("injected append fault".into()));
        }
        self.channels
            .write()
            .await
            .entry(document_id.history_channel())
            .or_default()
            .push(checkpoint);
        Ok(())
    }
}
