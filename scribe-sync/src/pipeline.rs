//! Per-document operation pipeline.
//!
//! ```text
//!               begin_loading()             complete_loading(snapshot)
//! Uninitialized ───────────────► Loading ─────────────────────────────► Ready
//!                                   ▲   remote ops buffered,               │
//!                                   │   replayed in arrival order          │
//!                                   └──────── begin_loading() ─────────────┘
//!                                             (snapshot reload)
//! ```
//!
//! Remote operations go through, in order: echo suppression by origin,
//! buffering while loading, de-duplication by operation id, rebasing over
//! the unpublished outbox, then application. Local edits are applied
//! optimistically and tagged for publishing.
//!
//! The ids of operations reflected in the content travel with every
//! checkpoint. A snapshot seeds the de-duplication window with them, so an
//! operation buffered during the load that the snapshot already contains
//! is recognised as a duplicate instead of being applied twice.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

use crate::delta::{Delta, DeltaError};
use crate::protocol::{DocumentId, EditOperation, OperationId, OriginId};
use crate::snapshot::LoadedSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Uninitialized,
    Loading,
    Ready,
}

/// Read-only view published for the checkpoint writer.
#[derive(Debug, Clone)]
pub struct DocumentView {
    pub revision: u64,
    /// Revision the content had when it was loaded; nothing newer to persist
    /// while `revision == loaded_revision`.
    pub loaded_revision: u64,
    pub ready: bool,
    pub content: Arc<Delta>,
    /// Most recent operation ids included in `content`, oldest first.
    pub operations: Arc<Vec<OperationId>>,
}

impl DocumentView {
    fn empty() -> Self {
        Self {
            revision: 0,
            loaded_revision: 0,
            ready: false,
            content: Arc::new(Delta::new()),
            operations: Arc::new(Vec::new()),
        }
    }
}

/// A validated local edit that has not been committed yet.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalEdit {
    pub operation: EditOperation,
    content: Delta,
}

/// What happened to a remote operation.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteOutcome {
    /// Applied; carries the delta as applied to local content.
    Applied(Delta),
    /// Held until the snapshot is in place.
    Buffered,
    /// Produced by this session.
    EchoSuppressed,
    /// Operation id already applied.
    Duplicate,
    /// Structurally invalid against current content.
    Rejected(DeltaError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineError {
    NotReady(PipelineState),
    InvalidEdit(DeltaError),
    OutboxFull { capacity: usize },
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotReady(state) => write!(f, "Document not ready ({state:?})"),
            Self::InvalidEdit(e) => write!(f, "Invalid edit: {e}"),
            Self::OutboxFull { capacity } => write!(f, "Outbox full ({capacity} edits)"),
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<DeltaError> for PipelineError {
    fn from(e: DeltaError) -> Self {
        PipelineError::InvalidEdit(e)
    }
}

/// Local edits waiting for the transport.
///
/// Bounded FIFO; flushed in order after reconnection.
pub struct Outbox {
    queue: VecDeque<EditOperation>,
    max_size: usize,
}

impl Outbox {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue an edit. Returns `false` when full.
    pub fn enqueue(&mut self, op: EditOperation) -> bool {
        if self.is_full() {
            return false;
        }
        self.queue.push_back(op);
        true
    }

    /// Take every queued edit, oldest first.
    pub fn drain(&mut self) -> Vec<EditOperation> {
        self.queue.drain(..).collect()
    }

    /// Put edits back at the head, keeping their order.
    pub fn restore(&mut self, ops: Vec<EditOperation>) {
        for op in ops.into_iter().rev() {
            self.queue.push_front(op);
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.queue.len() >= self.max_size
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    fn iter(&self) -> impl Iterator<Item = &EditOperation> {
        self.queue.iter()
    }

    fn iter_mut(&mut self) -> impl Iterator<Item = &mut EditOperation> {
        self.queue.iter_mut()
    }
}

/// Bounded memory of applied operation ids.
struct SeenWindow {
    ids: HashSet<OperationId>,
    order: VecDeque<OperationId>,
    limit: usize,
}

impl SeenWindow {
    fn new(limit: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            limit: limit.max(1),
        }
    }

    fn seeded(limit: usize, ids: &[OperationId]) -> Self {
        let mut window = Self::new(limit);
        for id in ids {
            window.insert(*id);
        }
        window
    }

    fn limit(&self) -> usize {
        self.limit
    }

    fn snapshot(&self) -> Vec<OperationId> {
        self.order.iter().copied().collect()
    }

    fn contains(&self, id: &OperationId) -> bool {
        self.ids.contains(id)
    }

    fn insert(&mut self, id: OperationId) {
        if !self.ids.insert(id) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > self.limit {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
    }
}

pub struct DocumentPipeline {
    document_id: DocumentId,
    origin_id: OriginId,
    state: PipelineState,
    content: Delta,
    revision: u64,
    pending: VecDeque<EditOperation>,
    seen: SeenWindow,
    outbox: Outbox,
    view: watch::Sender<DocumentView>,
}

impl DocumentPipeline {
    pub fn new(
        document_id: DocumentId,
        origin_id: OriginId,
        dedup_window: usize,
        outbox_capacity: usize,
    ) -> Self {
        let (view, _) = watch::channel(DocumentView::empty());
        Self {
            document_id,
            origin_id,
            state: PipelineState::Uninitialized,
            content: Delta::new(),
            revision: 0,
            pending: VecDeque::new(),
            seen: SeenWindow::new(dedup_window),
            outbox: Outbox::new(outbox_capacity),
            view,
        }
    }

    pub fn document_id(&self) -> &DocumentId {
        &self.document_id
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn content(&self) -> &Delta {
        &self.content
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Remote operations waiting for the snapshot.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn subscribe_view(&self) -> watch::Receiver<DocumentView> {
        self.view.subscribe()
    }

    /// Enter `Loading`. Drops the outbox and anything buffered by an earlier load.
    pub fn begin_loading(&mut self) {
        if !self.outbox.is_empty() {
            log::warn!(
                "Discarding {} unpublished edits for {}",
                self.outbox.len(),
                self.document_id
            );
        }
        self.outbox.clear();
        self.pending.clear();
        self.state = PipelineState::Loading;
        self.publish_view(self.revision);
    }

    /// Install snapshot content, enter `Ready` and replay buffered operations.
    ///
    /// The de-duplication window is replaced by the operations the snapshot
    /// already contains.
    pub fn complete_loading(&mut self, snapshot: LoadedSnapshot) -> Vec<RemoteOutcome> {
        self.seen = SeenWindow::seeded(self.seen.limit(), &snapshot.operations);
        self.content = snapshot.content;
        self.revision = self.revision.max(snapshot.revision);
        let loaded_revision = self.revision;
        self.state = PipelineState::Ready;
        self.publish_view(loaded_revision);

        let buffered: Vec<EditOperation> = self.pending.drain(..).collect();
        if !buffered.is_empty() {
            log::debug!(
                "Replaying {} buffered operations for {}",
                buffered.len(),
                self.document_id
            );
        }
        buffered
            .into_iter()
            .map(|op| self.on_remote_operation(op))
            .collect()
    }

    /// Apply a local edit and tag it for publishing.
    pub fn submit_local_edit(&mut self, delta: Delta) -> Result<EditOperation, PipelineError> {
        let edit = self.prepare_local_edit(delta)?;
        Ok(self.commit_local_edit(edit))
    }

    /// Validate a local edit against the current content without applying it.
    pub fn prepare_local_edit(&self, delta: Delta) -> Result<LocalEdit, PipelineError> {
        if self.state != PipelineState::Ready {
            return Err(PipelineError::NotReady(self.state));
        }
        let content = delta.apply_to(&self.content)?;
        Ok(LocalEdit {
            operation: EditOperation::new(self.origin_id, self.revision + 1, delta),
            content,
        })
    }

    /// Apply an edit from [`prepare_local_edit`](Self::prepare_local_edit).
    ///
    /// Must follow the prepare call with no other mutation in between.
    pub fn commit_local_edit(&mut self, edit: LocalEdit) -> EditOperation {
        self.content = edit.content;
        self.revision = edit.operation.revision;
        self.seen.insert(edit.operation.operation_id);
        self.refresh_view();
        edit.operation
    }

    pub fn on_remote_operation(&mut self, op: EditOperation) -> RemoteOutcome {
        if op.origin_id == self.origin_id {
            return RemoteOutcome::EchoSuppressed;
        }
        if self.state != PipelineState::Ready {
            self.pending.push_back(op);
            return RemoteOutcome::Buffered;
        }
        if self.seen.contains(&op.operation_id) {
            log::debug!("Dropping duplicate operation {}", op.operation_id);
            return RemoteOutcome::Duplicate;
        }

        // Rebase over unpublished local edits: the remote edit reached the
        // transport first, so its inserts win ties.
        let mut remote = op.delta;
        let mut rebased_local = Vec::with_capacity(self.outbox.len());
        for local in self.outbox.iter() {
            rebased_local.push(remote.transform(&local.delta, true));
            remote = local.delta.transform(&remote, false);
        }

        match remote.apply_to(&self.content) {
            Ok(content) => {
                self.content = content;
                for (queued, delta) in self.outbox.iter_mut().zip(rebased_local) {
                    queued.delta = delta;
                }
                self.seen.insert(op.operation_id);
                self.revision += 1;
                self.refresh_view();
                RemoteOutcome::Applied(remote)
            }
            Err(e) => {
                log::error!(
                    "Rejected operation {} from {} on {}: {e}",
                    op.operation_id,
                    op.origin_id,
                    self.document_id
                );
                RemoteOutcome::Rejected(e)
            }
        }
    }

    /// Hold a local edit that could not be published.
    pub fn defer(&mut self, op: EditOperation) -> Result<(), PipelineError> {
        if self.outbox.enqueue(op) {
            Ok(())
        } else {
            Err(PipelineError::OutboxFull {
                capacity: self.outbox.capacity(),
            })
        }
    }

    pub fn outbox_len(&self) -> usize {
        self.outbox.len()
    }

    pub fn outbox_is_full(&self) -> bool {
        self.outbox.is_full()
    }

    pub fn outbox_capacity(&self) -> usize {
        self.outbox.capacity()
    }

    /// Take the outbox for flushing.
    pub fn drain_outbox(&mut self) -> Vec<EditOperation> {
        self.outbox.drain()
    }

    /// Return unflushed edits to the head of the outbox.
    pub fn restore_outbox(&mut self, ops: Vec<EditOperation>) {
        self.outbox.restore(ops);
    }

    fn refresh_view(&self) {
        let loaded_revision = self.view.borrow().loaded_revision;
        self.publish_view(loaded_revision);
    }

    fn publish_view(&self, loaded_revision: u64) {
        self.view.send_replace(DocumentView {
            revision: self.revision,
            loaded_revision,
            ready: self.state == PipelineState::Ready,
            content: Arc::new(self.content.clone()),
            operations: Arc::new(self.seen.snapshot()),
        });
    }
}
