//! # scribe-sync: real-time document sync and presence core
//!
//! Keeps a collaborative rich-text document consistent across participants
//! connected through a pub/sub transport, and tracks who else is there.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  snapshot   ┌───────────────────┐  view   ┌──────────────┐
//! │ Snapshot     │ ──────────► │ DocumentPipeline  │ ──────► │ Checkpoint   │
//! │ Loader       │             │ (per document)    │         │ Scheduler    │
//! └──────┬───────┘             └───┬───────────▲───┘         └──────┬───────┘
//!        │ query_latest            │ publish   │ remote ops         │ append
//!        ▼                         ▼           │                    ▼
//! ┌──────────────┐             ┌───────────────┴───┐         ┌──────────────┐
//! │ HistoryStore │ ◄────────── │ Transport         │         │ HistoryStore │
//! └──────────────┘             └───┬───────────┬───┘         └──────────────┘
//!                                  │ presence  │ lifecycle
//!                                  ▼           ▼
//!                       ┌─────────────────┐ ┌──────────────────────┐
//!                       │ PresenceTracker │ │ ReconnectCoordinator │
//!                       └─────────────────┘ └──────────────────────┘
//! ```
//!
//! [`Session`] wires these together for one client.
//!
//! ## Modules
//!
//! - [`delta`]: retain/insert/delete deltas with apply and transform
//! - [`protocol`]: ids, edit operations, presence entries, channel names
//! - [`transport`]: pub/sub transport contract
//! - [`loopback`]: in-process transport for tests and demos
//! - [`history`]: checkpoint store contract and in-memory store
//! - [`snapshot`]: latest-checkpoint loader
//! - [`pipeline`]: per-document operation pipeline
//! - [`checkpoint`]: periodic checkpoint writer
//! - [`presence`]: presence tracker
//! - [`reconnect`]: connection status machine and recovery plans
//! - [`session`]: per-client session and event stream
//!
//! ## Guarantees
//!
//! | Property | Mechanism |
//! |----------|-----------|
//! | Own edits never applied twice | origin id echo suppression |
//! | At-least-once delivery tolerated | operation id de-duplication window |
//! | No edit applied before the snapshot | `Loading` buffer, replayed in order |
//! | Buffered edits already in the snapshot skipped | checkpoints carry operation ids |
//! | Refused publishes not lost | edit queued in the outbox and retried |
//! | Checkpoint failures never block editing | writer task reads a watch view |
//! | No ghost participants after a gap | full presence resync |

pub mod checkpoint;
pub mod config;
pub mod delta;
pub mod history;
pub mod loopback;
pub mod pipeline;
pub mod presence;
pub mod protocol;
pub mod reconnect;
pub mod session;
pub mod snapshot;
pub mod transport;

// Re-exports for convenience
pub use checkpoint::{CheckpointScheduler, CheckpointStatus};
pub use config::{RecoveryPolicy, SessionConfig};
pub use delta::{Attributes, Delta, DeltaError, Insert, Op};
pub use history::{
    Checkpoint, CheckpointEncoding, HistoryError, HistoryStore, MemoryHistory, SortOrder,
};
pub use loopback::{LoopbackConfig, LoopbackHub, LoopbackTransport};
pub use pipeline::{
    DocumentPipeline, DocumentView, LocalEdit, Outbox, PipelineError, PipelineState,
    RemoteOutcome,
};
pub use presence::{PresenceError, PresenceTracker};
pub use protocol::{
    DocumentId, EditOperation, OperationId, OriginId, ParticipantId, PresenceEntry,
    PresenceState, ProtocolError,
};
pub use reconnect::{ConnectionStatus, ReconnectCoordinator, RecoveryPlan};
pub use session::{Session, SessionError, SessionUpdate};
pub use snapshot::{LoadedSnapshot, SnapshotLoader};
pub use transport::{
    wait_until_connected, EventSink, InboundEvent, LifecycleEvent, LinkState, PresenceChange,
    SubscriptionId, Transport, TransportError,
};
