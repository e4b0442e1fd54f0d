//! Initial document state from the latest durable checkpoint.

use std::sync::Arc;

use crate::delta::Delta;
use crate::history::{HistoryError, HistoryStore, SortOrder};
use crate::protocol::{DocumentId, OperationId};

/// Result of a snapshot load.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedSnapshot {
    pub content: Delta,
    /// `false` for a document that has never been checkpointed.
    pub found: bool,
    /// Revision recorded by the writer of the checkpoint.
    pub revision: u64,
    /// Creation time of the checkpoint (ms since epoch).
    pub checkpoint_at: Option<u64>,
    /// Operations already reflected in `content`.
    pub operations: Vec<OperationId>,
}

impl LoadedSnapshot {
    /// The state of a brand-new document.
    pub fn empty() -> Self {
        Self {
            content: Delta::new(),
            found: false,
            revision: 0,
            checkpoint_at: None,
            operations: Vec::new(),
        }
    }
}

/// Fetches the newest checkpoint of a document.
#[derive(Clone)]
pub struct SnapshotLoader {
    history: Arc<dyn HistoryStore>,
}

impl SnapshotLoader {
    pub fn new(history: Arc<dyn HistoryStore>) -> Self {
        Self { history }
    }

    /// Load the most recent checkpoint, or an empty document if none exists.
    pub async fn load_latest(&self, document_id: &DocumentId) -> Result<LoadedSnapshot, HistoryError> {
        let mut latest = self
            .history
            .query_latest(document_id, 1, SortOrder::Descending)
            .await?;

        let Some(checkpoint) = latest.pop() else {
            log::debug!("No checkpoint for {document_id}, starting empty");
            return Ok(LoadedSnapshot::empty());
        };

        let content = checkpoint.content()?;
        log::debug!(
            "Loaded checkpoint for {document_id}: {} bytes, revision {}",
            checkpoint.size(),
            checkpoint.revision
        );
        Ok(LoadedSnapshot {
            content,
            found: true,
            revision: checkpoint.revision,
            checkpoint_at: Some(checkpoint.created_at),
            operations: checkpoint.operations,
        })
    }
}
