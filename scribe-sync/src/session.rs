//! One client's view of the collaboration system.
//!
//! A [`Session`] owns everything for a single participant: its origin id,
//! the injected transport and history handles, one slot per open document
//! (pipeline, checkpoint scheduler, channel subscription), the presence
//! tracker and the reconnection coordinator.
//!
//! ```text
//!  Transport ──InboundEvent──┐
//!                            ├──► Session::next_update() ──► SessionUpdate
//!  snapshot loads ──Signal───┘          │
//!                                       ├── DocumentPipeline (per document)
//!                                       ├── PresenceTracker
//!                                       └── ReconnectCoordinator
//! ```
//!
//! All mutation happens on the caller's task through `&mut self`; transport
//! handlers and background loads only push into channels the session drains.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::checkpoint::{CheckpointScheduler, CheckpointStatus};
use crate::config::{RecoveryPolicy, SessionConfig};
use crate::delta::Delta;
use crate::history::{HistoryError, HistoryStore};
use crate::pipeline::{DocumentPipeline, PipelineError, PipelineState, RemoteOutcome};
use crate::presence::{PresenceError, PresenceTracker};
use crate::protocol::{
    DocumentId, EditOperation, OriginId, ParticipantId, PresenceEntry, PresenceState,
    ProtocolError,
};
use crate::reconnect::{ConnectionStatus, ReconnectCoordinator, RecoveryPlan};
use crate::snapshot::{LoadedSnapshot, SnapshotLoader};
use crate::transport::{
    wait_until_connected, EventSink, InboundEvent, LifecycleEvent, SubscriptionId, Transport,
    TransportError,
};

/// Something the application should react to.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    /// Snapshot installed; `replayed` buffered operations were processed.
    DocumentReady {
        document_id: DocumentId,
        found: bool,
        replayed: usize,
    },
    /// A remote edit was applied; `delta` is what changed locally.
    RemoteEdit {
        document_id: DocumentId,
        delta: Delta,
    },
    SnapshotLoadFailed {
        document_id: DocumentId,
        error: HistoryError,
        retry_in: Duration,
    },
    PresenceChanged {
        channel: String,
    },
    StatusChanged(ConnectionStatus),
    /// A recovery plan finished executing.
    Recovered {
        documents: usize,
        presence_channels: usize,
        flushed: usize,
        reloaded: usize,
    },
}

#[derive(Debug, Clone)]
pub enum SessionError {
    Transport(TransportError),
    Pipeline(PipelineError),
    Presence(PresenceError),
    Protocol(ProtocolError),
    UnknownDocument(DocumentId),
    AlreadyOpen(DocumentId),
    /// Reconnection failed for good.
    Offline,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "Transport error: {e}"),
            Self::Pipeline(e) => write!(f, "Pipeline error: {e}"),
            Self::Presence(e) => write!(f, "Presence error: {e}"),
            Self::Protocol(e) => write!(f, "Protocol error: {e}"),
            Self::UnknownDocument(id) => write!(f, "Document {id} is not open"),
            Self::AlreadyOpen(id) => write!(f, "Document {id} is already open"),
            Self::Offline => write!(f, "Session is offline"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<TransportError> for SessionError {
    fn from(e: TransportError) -> Self {
        SessionError::Transport(e)
    }
}

impl From<PipelineError> for SessionError {
    fn from(e: PipelineError) -> Self {
        SessionError::Pipeline(e)
    }
}

impl From<PresenceError> for SessionError {
    fn from(e: PresenceError) -> Self {
        SessionError::Presence(e)
    }
}

impl From<ProtocolError> for SessionError {
    fn from(e: ProtocolError) -> Self {
        SessionError::Protocol(e)
    }
}

/// Results from background work.
enum Signal {
    SnapshotLoaded {
        document_id: DocumentId,
        generation: u64,
        result: Result<LoadedSnapshot, HistoryError>,
    },
}

struct DocumentSlot {
    pipeline: DocumentPipeline,
    scheduler: CheckpointScheduler,
    subscription: Option<SubscriptionId>,
    /// Identifies the current load; results of older loads are ignored.
    generation: u64,
    loader: Option<JoinHandle<()>>,
}

impl Drop for DocumentSlot {
    fn drop(&mut self) {
        if let Some(loader) = self.loader.take() {
            loader.abort();
        }
    }
}

fn spawn_snapshot_load(
    loader: SnapshotLoader,
    signals: mpsc::UnboundedSender<Signal>,
    document_id: DocumentId,
    generation: u64,
    delay: Option<Duration>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let result = loader.load_latest(&document_id).await;
        let _ = signals.send(Signal::SnapshotLoaded {
            document_id,
            generation,
            result,
        });
    })
}

pub struct Session {
    origin_id: OriginId,
    transport: Arc<dyn Transport>,
    history: Arc<dyn HistoryStore>,
    loader: SnapshotLoader,
    config: SessionConfig,
    documents: HashMap<DocumentId, DocumentSlot>,
    edit_channels: HashMap<String, DocumentId>,
    presence: PresenceTracker,
    coordinator: ReconnectCoordinator,
    events_tx: EventSink,
    events_rx: mpsc::UnboundedReceiver<InboundEvent>,
    signals_tx: mpsc::UnboundedSender<Signal>,
    signals_rx: mpsc::UnboundedReceiver<Signal>,
    lifecycle: Option<SubscriptionId>,
    backlog: VecDeque<SessionUpdate>,
    next_generation: u64,
}

impl Session {
    /// Wait for the transport's connected signal and start a session.
    pub async fn connect(
        transport: Arc<dyn Transport>,
        history: Arc<dyn HistoryStore>,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        let mut link = transport.link_state();
        wait_until_connected(&mut link, config.connect_timeout).await?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let lifecycle = transport.subscribe_lifecycle(events_tx.clone()).await;
        let origin_id = OriginId::new();

        match transport.connection_id().await {
            Some(connection) => log::info!("Session {origin_id} connected as {connection}"),
            None => log::info!("Session {origin_id} connected"),
        }

        Ok(Self {
            origin_id,
            presence: PresenceTracker::new(transport.clone(), events_tx.clone()),
            loader: SnapshotLoader::new(history.clone()),
            coordinator: ReconnectCoordinator::new(config.recovery_policy),
            transport,
            history,
            config,
            documents: HashMap::new(),
            edit_channels: HashMap::new(),
            events_tx,
            events_rx,
            signals_tx,
            signals_rx,
            lifecycle: Some(lifecycle),
            backlog: VecDeque::new(),
            next_generation: 0,
        })
    }

    pub fn origin_id(&self) -> OriginId {
        self.origin_id
    }

    pub fn status(&self) -> ConnectionStatus {
        self.coordinator.status()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Participant id of the current transport connection.
    pub async fn connection_id(&self) -> Option<ParticipantId> {
        self.transport.connection_id().await
    }

    // ───────────────────────────────────────────────────────────────
    // Documents
    // ───────────────────────────────────────────────────────────────

    /// Subscribe to a document's edits and start loading its snapshot.
    ///
    /// While disconnected the subscription is deferred to recovery.
    pub async fn open_document(&mut self, document_id: DocumentId) -> Result<(), SessionError> {
        if self.documents.contains_key(&document_id) {
            return Err(SessionError::AlreadyOpen(document_id));
        }
        if self.coordinator.status() == ConnectionStatus::Failed {
            return Err(SessionError::Offline);
        }

        let mut pipeline = DocumentPipeline::new(
            document_id.clone(),
            self.origin_id,
            self.config.dedup_window,
            self.config.outbox_capacity,
        );
        pipeline.begin_loading();

        let channel = document_id.edit_channel();
        let subscription = if self.coordinator.is_connected() {
            match self.transport.subscribe(&channel, self.events_tx.clone()).await {
                Ok(id) => Some(id),
                Err(TransportError::NotConnected) => {
                    log::warn!("Subscription to {channel} deferred until reconnection");
                    None
                }
                Err(e) => return Err(e.into()),
            }
        } else {
            log::warn!("Subscription to {channel} deferred until reconnection");
            None
        };

        let scheduler = CheckpointScheduler::spawn(
            document_id.clone(),
            pipeline.subscribe_view(),
            self.history.clone(),
            self.config.checkpoint_interval,
            self.config.checkpoint_encoding,
        );
        let generation = self.bump_generation();
        let loader = spawn_snapshot_load(
            self.loader.clone(),
            self.signals_tx.clone(),
            document_id.clone(),
            generation,
            None,
        );

        log::info!("Opened {document_id}");
        self.edit_channels.insert(channel, document_id.clone());
        self.coordinator.track_document(document_id.clone());
        self.documents.insert(
            document_id,
            DocumentSlot {
                pipeline,
                scheduler,
                subscription,
                generation,
                loader: Some(loader),
            },
        );
        Ok(())
    }

    /// Process events until the document's snapshot is in place.
    pub async fn wait_ready(&mut self, document_id: &DocumentId) -> Result<(), SessionError> {
        loop {
            match self.document_state(document_id) {
                None => return Err(SessionError::UnknownDocument(document_id.clone())),
                Some(PipelineState::Ready) => return Ok(()),
                Some(_) => {}
            }
            self.step().await;
        }
    }

    /// Apply a local edit and publish it.
    ///
    /// The edit is validated and encoded before local content changes. Once
    /// applied it is never lost: if the transport is down or refuses the
    /// publish, the edit is held in the outbox and retried by the next
    /// submit or by recovery. Returns the tagged operation.
    pub async fn submit_local_edit(
        &mut self,
        document_id: &DocumentId,
        delta: Delta,
    ) -> Result<EditOperation, SessionError> {
        let status = self.coordinator.status();
        if status == ConnectionStatus::Failed {
            return Err(SessionError::Offline);
        }
        if !self.documents.contains_key(document_id) {
            return Err(SessionError::UnknownDocument(document_id.clone()));
        }
        if status == ConnectionStatus::Connected && self.outbox_len(document_id).unwrap_or(0) > 0 {
            self.flush_outbox(document_id).await;
        }
        let slot = self
            .documents
            .get_mut(document_id)
            .ok_or_else(|| SessionError::UnknownDocument(document_id.clone()))?;

        // Keep edits in order behind anything still queued.
        let direct = status == ConnectionStatus::Connected && slot.pipeline.outbox_len() == 0;
        if !direct && slot.pipeline.outbox_is_full() {
            return Err(PipelineError::OutboxFull {
                capacity: slot.pipeline.outbox_capacity(),
            }
            .into());
        }

        let edit = slot.pipeline.prepare_local_edit(delta)?;
        let payload = edit.operation.encode()?;
        let op = slot.pipeline.commit_local_edit(edit);
        if direct {
            match self
                .transport
                .publish(&document_id.edit_channel(), payload)
                .await
            {
                Ok(()) => return Ok(op),
                Err(TransportError::Rejected(reason)) => {
                    log::error!(
                        "Edit {} rejected by transport ({reason}); queueing for retry",
                        op.operation_id
                    );
                }
                Err(e) => {
                    log::warn!("Publish failed ({e}); queueing edit {}", op.operation_id);
                }
            }
        }

        if let Err(e) = slot.pipeline.defer(op.clone()) {
            log::error!("Edit {} applied locally but not queued: {e}", op.operation_id);
            return Err(e.into());
        }
        log::debug!(
            "Queued edit {} for {document_id} ({} waiting)",
            op.operation_id,
            slot.pipeline.outbox_len()
        );
        Ok(op)
    }

    /// Stop checkpointing, unsubscribe and drop the document.
    pub async fn close_document(&mut self, document_id: &DocumentId) -> Result<(), SessionError> {
        let slot = self
            .documents
            .remove(document_id)
            .ok_or_else(|| SessionError::UnknownDocument(document_id.clone()))?;
        let channel = document_id.edit_channel();
        self.edit_channels.remove(&channel);
        self.coordinator.untrack_document(document_id);

        if slot.pipeline.outbox_len() > 0 {
            log::warn!(
                "Closing {document_id} with {} unpublished edits",
                slot.pipeline.outbox_len()
            );
        }
        if let Some(id) = slot.subscription {
            if let Err(e) = self.transport.unsubscribe(&channel, id).await {
                log::warn!("Failed to unsubscribe {channel}: {e}");
            }
        }
        drop(slot);
        log::info!("Closed {document_id}");
        Ok(())
    }

    pub fn content(&self, document_id: &DocumentId) -> Option<&Delta> {
        self.documents
            .get(document_id)
            .map(|slot| slot.pipeline.content())
    }

    pub fn document_state(&self, document_id: &DocumentId) -> Option<PipelineState> {
        self.documents
            .get(document_id)
            .map(|slot| slot.pipeline.state())
    }

    pub fn revision(&self, document_id: &DocumentId) -> Option<u64> {
        self.documents
            .get(document_id)
            .map(|slot| slot.pipeline.revision())
    }

    pub fn checkpoint_status(&self, document_id: &DocumentId) -> Option<CheckpointStatus> {
        self.documents
            .get(document_id)
            .map(|slot| slot.scheduler.status())
    }

    /// Local edits waiting for the transport.
    pub fn outbox_len(&self, document_id: &DocumentId) -> Option<usize> {
        self.documents
            .get(document_id)
            .map(|slot| slot.pipeline.outbox_len())
    }

    pub fn open_documents(&self) -> Vec<DocumentId> {
        self.documents.keys().cloned().collect()
    }

    // ───────────────────────────────────────────────────────────────
    // Presence
    // ───────────────────────────────────────────────────────────────

    pub async fn enter_presence(
        &mut self,
        channel: &str,
        state: PresenceState,
    ) -> Result<(), SessionError> {
        if self.coordinator.status() == ConnectionStatus::Failed {
            return Err(SessionError::Offline);
        }
        let result = self.presence.enter(channel, state).await;
        // A failed enter is retried by the next resync.
        if self.presence.is_entered(channel) {
            self.coordinator.track_presence(channel);
        }
        result.map_err(Into::into)
    }

    pub async fn update_presence(
        &mut self,
        channel: &str,
        partial_state: PresenceState,
    ) -> Result<(), SessionError> {
        self.presence.update(channel, partial_state).await?;
        Ok(())
    }

    pub async fn leave_presence(&mut self, channel: &str) -> Result<(), SessionError> {
        self.coordinator.untrack_presence(channel);
        self.presence.leave(channel).await?;
        Ok(())
    }

    pub fn presence_members(&self, channel: &str) -> Vec<PresenceEntry> {
        self.presence.members(channel)
    }

    // ───────────────────────────────────────────────────────────────
    // Event stream
    // ───────────────────────────────────────────────────────────────

    /// Wait for the next update, processing events as needed.
    pub async fn next_update(&mut self) -> SessionUpdate {
        loop {
            if let Some(update) = self.backlog.pop_front() {
                return update;
            }
            self.step().await;
        }
    }

    /// Process every event that is already queued, without waiting.
    pub async fn drain(&mut self) -> Vec<SessionUpdate> {
        let mut updates: Vec<SessionUpdate> = self.backlog.drain(..).collect();
        loop {
            if let Ok(event) = self.events_rx.try_recv() {
                updates.extend(self.handle_event(event).await);
                continue;
            }
            if let Ok(signal) = self.signals_rx.try_recv() {
                updates.extend(self.handle_signal(signal).await);
                continue;
            }
            break;
        }
        updates
    }

    /// Process one transport event.
    pub async fn handle_event(&mut self, event: InboundEvent) -> Vec<SessionUpdate> {
        match event {
            InboundEvent::Message { channel, payload } => {
                self.on_message(&channel, &payload).into_iter().collect()
            }
            InboundEvent::Presence { channel, change } => {
                if self.presence.apply(&channel, change) {
                    vec![SessionUpdate::PresenceChanged { channel }]
                } else {
                    Vec::new()
                }
            }
            InboundEvent::Lifecycle(event) => self.on_lifecycle(event).await,
        }
    }

    /// Close every document, leave every presence channel and stop
    /// listening to the transport.
    pub async fn shutdown(mut self) {
        for document_id in self.open_documents() {
            if let Err(e) = self.close_document(&document_id).await {
                log::warn!("Failed to close {document_id}: {e}");
            }
        }
        for channel in self.presence.channels() {
            if let Err(e) = self.leave_presence(&channel).await {
                log::debug!("Leaving presence {channel} during shutdown: {e}");
            }
        }
        if let Some(id) = self.lifecycle.take() {
            self.transport.unsubscribe_lifecycle(id).await;
        }
        log::info!("Session {} shut down", self.origin_id);
    }

    /// Wait for one event or signal and queue what it produced.
    ///
    /// The session holds a sender for both channels, so neither closes
    /// while it is alive.
    async fn step(&mut self) {
        let updates = tokio::select! {
            event = self.events_rx.recv() => match event {
                Some(event) => self.handle_event(event).await,
                None => Vec::new(),
            },
            signal = self.signals_rx.recv() => match signal {
                Some(signal) => self.handle_signal(signal).await,
                None => Vec::new(),
            },
        };
        self.backlog.extend(updates);
    }

    fn bump_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn on_message(&mut self, channel: &str, payload: &[u8]) -> Option<SessionUpdate> {
        let document_id = self.edit_channels.get(channel)?;
        let slot = self.documents.get_mut(document_id)?;
        let op = match EditOperation::decode(payload) {
            Ok(op) => op,
            Err(e) => {
                log::error!("Dropping malformed operation on {channel}: {e}");
                return None;
            }
        };
        match slot.pipeline.on_remote_operation(op) {
            RemoteOutcome::Applied(delta) => Some(SessionUpdate::RemoteEdit {
                document_id: document_id.clone(),
                delta,
            }),
            RemoteOutcome::Buffered
            | RemoteOutcome::EchoSuppressed
            | RemoteOutcome::Duplicate
            | RemoteOutcome::Rejected(_) => None,
        }
    }

    async fn handle_signal(&mut self, signal: Signal) -> Vec<SessionUpdate> {
        match signal {
            Signal::SnapshotLoaded {
                document_id,
                generation,
                result,
            } => {
                let Some(slot) = self.documents.get_mut(&document_id) else {
                    return Vec::new();
                };
                if slot.generation != generation {
                    log::debug!("Ignoring stale snapshot load for {document_id}");
                    return Vec::new();
                }
                slot.loader = None;

                match result {
                    Ok(snapshot) => {
                        let found = snapshot.found;
                        let outcomes = slot.pipeline.complete_loading(snapshot);
                        log::info!(
                            "{document_id} ready at revision {} ({} buffered operations)",
                            slot.pipeline.revision(),
                            outcomes.len()
                        );
                        let mut updates = vec![SessionUpdate::DocumentReady {
                            document_id: document_id.clone(),
                            found,
                            replayed: outcomes.len(),
                        }];
                        updates.extend(outcomes.into_iter().filter_map(|outcome| match outcome {
                            RemoteOutcome::Applied(delta) => Some(SessionUpdate::RemoteEdit {
                                document_id: document_id.clone(),
                                delta,
                            }),
                            _ => None,
                        }));
                        updates
                    }
                    Err(error) => {
                        let retry_in = self.config.snapshot_retry_delay;
                        log::warn!(
                            "Snapshot load for {document_id} failed: {error}; retrying in {retry_in:?}"
                        );
                        slot.loader = Some(spawn_snapshot_load(
                            self.loader.clone(),
                            self.signals_tx.clone(),
                            document_id.clone(),
                            generation,
                            Some(retry_in),
                        ));
                        vec![SessionUpdate::SnapshotLoadFailed {
                            document_id,
                            error,
                            retry_in,
                        }]
                    }
                }
            }
        }
    }

    async fn on_lifecycle(&mut self, event: LifecycleEvent) -> Vec<SessionUpdate> {
        let before = self.coordinator.status();
        let plan = self.coordinator.on_event(event);
        let after = self.coordinator.status();

        let mut updates = Vec::new();
        if after != before {
            updates.push(SessionUpdate::StatusChanged(after));
        }
        if let Some(plan) = plan {
            updates.extend(self.recover(plan).await);
        }
        updates
    }

    /// Execute a recovery plan. Failures are isolated per channel.
    async fn recover(&mut self, plan: RecoveryPlan) -> Vec<SessionUpdate> {
        let mut updates = Vec::new();

        for document_id in &plan.documents {
            let Some(slot) = self.documents.get_mut(document_id) else {
                continue;
            };
            let channel = document_id.edit_channel();
            if let Some(stale) = slot.subscription.take() {
                if let Err(e) = self.transport.unsubscribe(&channel, stale).await {
                    log::debug!("Dropping stale subscription to {channel}: {e}");
                }
            }
            match self.transport.subscribe(&channel, self.events_tx.clone()).await {
                Ok(id) => slot.subscription = Some(id),
                Err(e) => log::warn!("Failed to re-subscribe {channel}: {e}"),
            }
        }

        let mut presence_channels = 0;
        for channel in &plan.presence_channels {
            match self.presence.resync(channel).await {
                Ok(()) => {
                    presence_channels += 1;
                    updates.push(SessionUpdate::PresenceChanged {
                        channel: channel.clone(),
                    });
                }
                Err(e) => log::warn!("Presence resync of {channel} failed: {e}"),
            }
        }

        let mut flushed = 0;
        let mut reloaded = 0;
        for document_id in &plan.documents {
            match plan.policy {
                RecoveryPolicy::TrustRedelivery => flushed += self.flush_outbox(document_id).await,
                RecoveryPolicy::ReloadSnapshots => {
                    if self.reload(document_id) {
                        reloaded += 1;
                    }
                }
            }
        }

        log::info!(
            "Recovery done: {} documents, {presence_channels} presence channels, {flushed} edits flushed, {reloaded} reloads",
            plan.documents.len()
        );
        updates.push(SessionUpdate::Recovered {
            documents: plan.documents.len(),
            presence_channels,
            flushed,
            reloaded,
        });
        updates
    }

    /// Publish queued edits in order. Stops at the first failure and keeps
    /// the rest queued.
    async fn flush_outbox(&mut self, document_id: &DocumentId) -> usize {
        let Some(slot) = self.documents.get_mut(document_id) else {
            return 0;
        };
        let queued = slot.pipeline.drain_outbox();
        if queued.is_empty() {
            return 0;
        }

        let channel = document_id.edit_channel();
        let mut sent = 0;
        let mut queue = queued.into_iter();
        while let Some(op) = queue.next() {
            let payload = match op.encode() {
                Ok(payload) => payload,
                Err(e) => {
                    log::error!("Dropping unencodable edit {}: {e}", op.operation_id);
                    continue;
                }
            };
            if let Err(e) = self.transport.publish(&channel, payload).await {
                log::warn!("Outbox flush for {document_id} interrupted: {e}");
                let mut rest = vec![op];
                rest.extend(queue.by_ref());
                slot.pipeline.restore_outbox(rest);
                break;
            }
            sent += 1;
        }
        log::info!("Flushed {sent} queued edits for {document_id}");
        sent
    }

    /// Drop local state and load the document again.
    fn reload(&mut self, document_id: &DocumentId) -> bool {
        let generation = self.bump_generation();
        let Some(slot) = self.documents.get_mut(document_id) else {
            return false;
        };
        slot.pipeline.begin_loading();
        slot.generation = generation;
        if let Some(previous) = slot.loader.take() {
            previous.abort();
        }
        slot.loader = Some(spawn_snapshot_load(
            self.loader.clone(),
            self.signals_tx.clone(),
            document_id.clone(),
            generation,
            None,
        ));
        log::info!("Reloading {document_id} from its latest checkpoint");
        true
    }
}
