//! Presence tracking: who else is in the document and where their cursor is.
//!
//! ## Architecture
//!
//! ```text
//! Local cursor move
//!       │
//!       ▼
//! PresenceTracker::update()   (shallow merge into local state)
//!       │
//!       ▼   Transport::update_presence
//! server presence set ──join / update / leave──► PresenceTracker::apply()
//!                                                      │
//!                                                      ▼
//!                                       participant → PresenceEntry map
//! ```
//!
//! The local map is only a view of the server set. Any gap (reconnect,
//! re-enter) discards it and refetches the member list, so departed
//! participants never linger as ghosts.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::protocol::{ParticipantId, PresenceEntry, PresenceState};
use crate::transport::{EventSink, PresenceChange, SubscriptionId, Transport, TransportError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceError {
    /// `update` on a channel that was never entered.
    NotEntered(String),
    Transport(TransportError),
}

impl fmt::Display for PresenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotEntered(channel) => write!(f, "Presence channel {channel} not entered"),
            Self::Transport(e) => write!(f, "Presence transport error: {e}"),
        }
    }
}

impl std::error::Error for PresenceError {}

impl From<TransportError> for PresenceError {
    fn from(e: TransportError) -> Self {
        PresenceError::Transport(e)
    }
}

struct ChannelPresence {
    members: BTreeMap<ParticipantId, PresenceEntry>,
    local_state: PresenceState,
    subscription: Option<SubscriptionId>,
}

/// Per-channel presence maps for one session.
pub struct PresenceTracker {
    transport: Arc<dyn Transport>,
    sink: EventSink,
    channels: HashMap<String, ChannelPresence>,
}

impl PresenceTracker {
    /// Presence events are delivered into `sink`.
    pub fn new(transport: Arc<dyn Transport>, sink: EventSink) -> Self {
        Self {
            transport,
            sink,
            channels: HashMap::new(),
        }
    }

    /// Join a presence channel with an initial state.
    ///
    /// Calling it again re-runs the full resync and re-registers.
    pub async fn enter(
        &mut self,
        channel: &str,
        initial_state: PresenceState,
    ) -> Result<(), PresenceError> {
        let previous = self.channels.insert(
            channel.to_string(),
            ChannelPresence {
                members: BTreeMap::new(),
                local_state: initial_state,
                subscription: None,
            },
        );
        if let Some(id) = previous.and_then(|p| p.subscription) {
            self.release(channel, id).await;
        }
        self.synchronize(channel).await
    }

    /// Shallow-merge `partial_state` into the local state and publish it.
    pub async fn update(
        &mut self,
        channel: &str,
        partial_state: PresenceState,
    ) -> Result<(), PresenceError> {
        let presence = self
            .channels
            .get_mut(channel)
            .ok_or_else(|| PresenceError::NotEntered(channel.to_string()))?;
        for (key, value) in partial_state {
            presence.local_state.insert(key, value);
        }
        let merged = presence.local_state.clone();
        self.transport.update_presence(channel, merged).await?;
        Ok(())
    }

    /// Deregister, stop listening and forget the channel.
    pub async fn leave(&mut self, channel: &str) -> Result<(), PresenceError> {
        let presence = self
            .channels
            .remove(channel)
            .ok_or_else(|| PresenceError::NotEntered(channel.to_string()))?;
        if let Some(id) = presence.subscription {
            self.release(channel, id).await;
        }
        self.transport.leave_presence(channel).await?;
        Ok(())
    }

    /// Rebuild the channel's map from the server after a gap.
    pub async fn resync(&mut self, channel: &str) -> Result<(), PresenceError> {
        let old = match self.channels.get_mut(channel) {
            Some(presence) => {
                presence.members.clear();
                presence.subscription.take()
            }
            None => return Err(PresenceError::NotEntered(channel.to_string())),
        };
        if let Some(id) = old {
            self.release(channel, id).await;
        }
        self.synchronize(channel).await
    }

    /// Apply a presence event. Returns `true` if the map changed.
    pub fn apply(&mut self, channel: &str, change: PresenceChange) -> bool {
        match change {
            PresenceChange::Join(entry) => self.on_join(channel, entry),
            PresenceChange::Update(entry) => self.on_update(channel, entry),
            PresenceChange::Leave(participant) => self.on_leave(channel, &participant),
        }
    }

    /// Upsert; a repeated join is harmless.
    pub fn on_join(&mut self, channel: &str, entry: PresenceEntry) -> bool {
        self.upsert(channel, entry)
    }

    /// Replace; an unknown participant is treated as a join.
    pub fn on_update(&mut self, channel: &str, entry: PresenceEntry) -> bool {
        self.upsert(channel, entry)
    }

    pub fn on_leave(&mut self, channel: &str, participant: &ParticipantId) -> bool {
        self.channels
            .get_mut(channel)
            .is_some_and(|presence| presence.members.remove(participant).is_some())
    }

    /// Current members of a channel, ordered by participant id.
    pub fn members(&self, channel: &str) -> Vec<PresenceEntry> {
        self.channels
            .get(channel)
            .map(|presence| presence.members.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn member(&self, channel: &str, participant: &ParticipantId) -> Option<&PresenceEntry> {
        self.channels.get(channel)?.members.get(participant)
    }

    /// State this session last published on a channel.
    pub fn local_state(&self, channel: &str) -> Option<&PresenceState> {
        self.channels.get(channel).map(|presence| &presence.local_state)
    }

    pub fn is_entered(&self, channel: &str) -> bool {
        self.channels.contains_key(channel)
    }

    pub fn channels(&self) -> Vec<String> {
        self.channels.keys().cloned().collect()
    }

    fn upsert(&mut self, channel: &str, entry: PresenceEntry) -> bool {
        let Some(presence) = self.channels.get_mut(channel) else {
            return false;
        };
        if presence.members.get(&entry.participant_id) == Some(&entry) {
            return false;
        }
        presence.members.insert(entry.participant_id.clone(), entry);
        true
    }

    /// Subscribe, fetch members, replace the map, then register ourselves.
    ///
    /// Subscribing first means no event between fetch and registration is lost.
    async fn synchronize(&mut self, channel: &str) -> Result<(), PresenceError> {
        let subscription = self
            .transport
            .subscribe_presence(channel, self.sink.clone())
            .await?;
        let members = match self.transport.presence_members(channel).await {
            Ok(members) => members,
            Err(e) => {
                self.release(channel, subscription).await;
                return Err(e.into());
            }
        };

        let Some(presence) = self.channels.get_mut(channel) else {
            self.release(channel, subscription).await;
            return Ok(());
        };
        presence.subscription = Some(subscription);
        presence.members = members
            .into_iter()
            .map(|entry| (entry.participant_id.clone(), entry))
            .collect();
        let state = presence.local_state.clone();
        log::debug!(
            "Presence {channel} synchronized with {} members",
            presence.members.len()
        );

        self.transport.enter_presence(channel, state).await?;
        Ok(())
    }

    async fn release(&self, channel: &str, id: SubscriptionId) {
        if let Err(e) = self.transport.unsubscribe_presence(channel, id).await {
            log::warn!("Failed to unsubscribe presence {channel}: {e}");
        }
    }
}
