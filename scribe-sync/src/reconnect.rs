//! Connection status machine and recovery planning.
//!
//! ```text
//!   Connected ──Disconnected──► Disconnected ──Reconnecting{n}──► Reconnecting{n}
//!       ▲                            │                                 │
//!       └────────── Reconnected ─────┴─────────────────────────────────┘
//!                   (emits a RecoveryPlan)
//!
//!   any ──ReconnectFailed──► Failed   (terminal)
//! ```
//!
//! The coordinator does no I/O. It remembers which documents and presence
//! channels the session holds and, on re-establishment, hands back a plan the
//! session executes in order: re-subscribe documents, resync presence, then
//! apply the recovery policy.

use std::collections::BTreeSet;
use std::fmt;

use crate::config::RecoveryPolicy;
use crate::protocol::DocumentId;
use crate::transport::LifecycleEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Reconnecting { attempt: u32 },
    /// Reconnection budget exhausted.
    Failed,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected => write!(f, "connected"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Reconnecting { attempt } => write!(f, "reconnecting (attempt {attempt})"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Work to do after the connection is re-established.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryPlan {
    /// Documents whose edit channel must be re-subscribed.
    pub documents: Vec<DocumentId>,
    /// Presence channels that need a full resync.
    pub presence_channels: Vec<String>,
    pub policy: RecoveryPolicy,
    /// Attempts reported before the link came back (0 if none).
    pub attempts: u32,
}

pub struct ReconnectCoordinator {
    status: ConnectionStatus,
    policy: RecoveryPolicy,
    documents: BTreeSet<DocumentId>,
    presence_channels: BTreeSet<String>,
    last_attempt: u32,
    outages: u64,
}

impl ReconnectCoordinator {
    /// Start in `Connected`; the session only builds one after the link is up.
    pub fn new(policy: RecoveryPolicy) -> Self {
        Self {
            status: ConnectionStatus::Connected,
            policy,
            documents: BTreeSet::new(),
            presence_channels: BTreeSet::new(),
            last_attempt: 0,
            outages: 0,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }

    /// Number of outages observed so far.
    pub fn outages(&self) -> u64 {
        self.outages
    }

    pub fn policy(&self) -> RecoveryPolicy {
        self.policy
    }

    pub fn track_document(&mut self, document_id: DocumentId) {
        self.documents.insert(document_id);
    }

    pub fn untrack_document(&mut self, document_id: &DocumentId) {
        self.documents.remove(document_id);
    }

    pub fn track_presence(&mut self, channel: impl Into<String>) {
        self.presence_channels.insert(channel.into());
    }

    pub fn untrack_presence(&mut self, channel: &str) {
        self.presence_channels.remove(channel);
    }

    /// Advance the state machine. Returns a plan when the link came back.
    pub fn on_event(&mut self, event: LifecycleEvent) -> Option<RecoveryPlan> {
        if self.status == ConnectionStatus::Failed {
            log::warn!("Ignoring {event:?}: connection already failed");
            return None;
        }

        match event {
            LifecycleEvent::Disconnected => {
                if self.status == ConnectionStatus::Connected {
                    self.outages += 1;
                    self.last_attempt = 0;
                }
                self.status = ConnectionStatus::Disconnected;
                log::warn!("Connection lost");
                None
            }
            LifecycleEvent::Reconnecting { attempt } => {
                if self.status == ConnectionStatus::Connected {
                    // Missed the disconnect notification.
                    self.outages += 1;
                }
                self.status = ConnectionStatus::Reconnecting { attempt };
                self.last_attempt = attempt;
                log::info!("Reconnecting (attempt {attempt})");
                None
            }
            LifecycleEvent::Reconnected => {
                if self.status == ConnectionStatus::Connected {
                    log::debug!("Duplicate reconnected event ignored");
                    return None;
                }
                self.status = ConnectionStatus::Connected;
                let plan = RecoveryPlan {
                    documents: self.documents.iter().cloned().collect(),
                    presence_channels: self.presence_channels.iter().cloned().collect(),
                    policy: self.policy,
                    attempts: self.last_attempt,
                };
                log::info!(
                    "Reconnected: recovering {} documents, {} presence channels",
                    plan.documents.len(),
                    plan.presence_channels.len()
                );
                Some(plan)
            }
            LifecycleEvent::ReconnectFailed => {
                self.status = ConnectionStatus::Failed;
                log::error!("Reconnection failed; session is offline");
                None
            }
        }
    }
}
