//! Contract of the pub/sub transport the sync core runs on.
//!
//! The transport is an external collaborator: it delivers channel messages
//! in order (at-least-once), stores presence sets, and reports connection
//! lifecycle changes. Handlers are plain event sinks; every subscription
//! returns a [`SubscriptionId`] that must be handed back to unsubscribe.
//!
//! ```text
//!   Transport ──InboundEvent──► EventSink (mpsc) ──► Session event loop
//!       ▲                                                │
//!       └──────── publish / presence calls ◄─────────────┘
//! ```

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use crate::protocol::{ParticipantId, PresenceEntry, PresenceState};

/// Handle returned by every subscribe call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

/// Sink the transport pushes events into.
pub type EventSink = mpsc::UnboundedSender<InboundEvent>;

/// Everything the transport can deliver to a session.
#[derive(Debug, Clone)]
pub enum InboundEvent {
    /// A message published on a subscribed channel.
    Message { channel: String, payload: Vec<u8> },
    /// A change in a presence set the session listens to.
    Presence {
        channel: String,
        change: PresenceChange,
    },
    /// Connection lifecycle notification.
    Lifecycle(LifecycleEvent),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PresenceChange {
    Join(PresenceEntry),
    Update(PresenceEntry),
    Leave(ParticipantId),
}

/// Connection lifecycle events.
///
/// `Reconnected` fires exactly once per successful re-establishment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Disconnected,
    Reconnecting { attempt: u32 },
    Reconnected,
    /// Retry budget exhausted; the transport will not come back.
    ReconnectFailed,
}

/// Link state exposed through a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

/// Transport errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The link is down; the call may succeed after reconnection.
    NotConnected,
    /// The link has permanently failed.
    Unavailable,
    /// Timed out waiting for the link.
    Timeout,
    /// The transport refused the request.
    Rejected(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected => write!(f, "Transport not connected"),
            Self::Unavailable => write!(f, "Transport unavailable"),
            Self::Timeout => write!(f, "Timed out waiting for transport"),
            Self::Rejected(reason) => write!(f, "Transport rejected request: {reason}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Channel-based pub/sub with presence sets.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Watch the link state; used as the explicit readiness signal.
    fn link_state(&self) -> watch::Receiver<LinkState>;

    /// Participant id of the current connection, if connected.
    async fn connection_id(&self) -> Option<ParticipantId>;

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    async fn subscribe(&self, channel: &str, sink: EventSink)
        -> Result<SubscriptionId, TransportError>;

    async fn unsubscribe(&self, channel: &str, id: SubscriptionId) -> Result<(), TransportError>;

    async fn enter_presence(
        &self,
        channel: &str,
        state: PresenceState,
    ) -> Result<(), TransportError>;

    async fn update_presence(
        &self,
        channel: &str,
        state: PresenceState,
    ) -> Result<(), TransportError>;

    async fn leave_presence(&self, channel: &str) -> Result<(), TransportError>;

    /// Authoritative member list of a presence set.
    async fn presence_members(&self, channel: &str) -> Result<Vec<PresenceEntry>, TransportError>;

    /// Receive join, update and leave events of a presence set.
    async fn subscribe_presence(
        &self,
        channel: &str,
        sink: EventSink,
    ) -> Result<SubscriptionId, TransportError>;

    async fn unsubscribe_presence(
        &self,
        channel: &str,
        id: SubscriptionId,
    ) -> Result<(), TransportError>;

    async fn subscribe_lifecycle(&self, sink: EventSink) -> SubscriptionId;

    async fn unsubscribe_lifecycle(&self, id: SubscriptionId);
}

/// Wait until the link reports `Connected`.
///
/// Fails fast on `Failed` and gives up after `timeout`.
pub async fn wait_until_connected(
    link: &mut watch::Receiver<LinkState>,
    timeout: Duration,
) -> Result<(), TransportError> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match *link.borrow_and_update() {
            LinkState::Connected => return Ok(()),
            LinkState::Failed => return Err(TransportError::Unavailable),
            LinkState::Connecting | LinkState::Disconnected => {}
        }
        match tokio::time::timeout_at(deadline, link.changed()).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return Err(TransportError::Unavailable),
            Err(_) => return Err(TransportError::Timeout),
        }
    }
}
