//! Session configuration.

use std::time::Duration;

use crate::history::CheckpointEncoding;

/// What to do with document state after the transport comes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryPolicy {
    /// The transport redelivers messages missed during the outage; only
    /// flush the outbox.
    #[default]
    TrustRedelivery,
    /// Discard buffered local state and reload every open document from
    /// its latest checkpoint.
    ReloadSnapshots,
}

/// Tunables for a [`Session`](crate::session::Session).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Period of the checkpoint writer.
    pub checkpoint_interval: Duration,
    /// Upper bound on the wait for the transport's connected signal.
    pub connect_timeout: Duration,
    /// Delay before retrying a failed snapshot load.
    pub snapshot_retry_delay: Duration,
    /// Number of recently applied operation ids remembered for de-duplication.
    pub dedup_window: usize,
    /// Maximum local edits held while the transport is down.
    pub outbox_capacity: usize,
    pub recovery_policy: RecoveryPolicy,
    pub checkpoint_encoding: CheckpointEncoding,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: Duration::from_millis(2000),
            connect_timeout: Duration::from_secs(20),
            snapshot_retry_delay: Duration::from_secs(1),
            dedup_window: 4096,
            outbox_capacity: 10_000,
            recovery_policy: RecoveryPolicy::default(),
            checkpoint_encoding: CheckpointEncoding::default(),
        }
    }
}

impl SessionConfig {
    /// Short timers for tests and demos.
    pub fn for_testing() -> Self {
        Self {
            checkpoint_interval: Duration::from_millis(50),
            connect_timeout: Duration::from_secs(2),
            snapshot_retry_delay: Duration::from_millis(20),
            ..Self::default()
        }
    }

    pub fn with_recovery_policy(mut self, policy: RecoveryPolicy) -> Self {
        self.recovery_policy = policy;
        self
    }
}
