//! In-process transport hub for tests and local demos.
//!
//! Every [`LoopbackTransport`] attached to the same [`LoopbackHub`] sees the
//! same channels and presence sets:
//!
//! ```text
//! LoopbackTransport A ──┐                 ┌──► sink A
//!                       ├── LoopbackHub ──┤
//! LoopbackTransport B ──┘  (channels,     └──► sink B
//!                           presence sets)
//! ```
//!
//! Delivery is ordered per channel and includes the publisher; filtering
//! echoes is the caller's job. An outage drops the connection's presence
//! and live subscriptions. Messages published to its channels in the
//! meantime are held and replayed, in order, just before `Reconnected`,
//! the way a broker resumes a session within its recovery window.
//! [`LoopbackConfig::redeliver_after_outage`] turns the replay off.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};

use crate::protocol::{now_millis, ParticipantId, PresenceEntry, PresenceState};
use crate::transport::{
    EventSink, InboundEvent, LifecycleEvent, LinkState, PresenceChange, SubscriptionId,
    Transport, TransportError,
};

/// Loopback behaviour switches.
#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    /// Deliver every channel message twice (at-least-once simulation).
    pub duplicate_delivery: bool,
    /// New transports start in `Connected` instead of `Connecting`.
    pub start_connected: bool,
    /// Replay messages missed during an outage on reconnection.
    pub redeliver_after_outage: bool,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            duplicate_delivery: false,
            start_connected: true,
            redeliver_after_outage: true,
        }
    }
}

impl LoopbackConfig {
    pub fn with_duplicates() -> Self {
        Self {
            duplicate_delivery: true,
            ..Self::default()
        }
    }
}

#[derive(Clone)]
struct Subscriber {
    id: SubscriptionId,
    connection: u64,
    sink: EventSink,
}

#[derive(Default)]
struct PresenceSet {
    members: BTreeMap<ParticipantId, PresenceEntry>,
    watchers: Vec<Subscriber>,
}

/// Subscriptions of a dropped connection and what they missed.
#[derive(Default)]
struct Parked {
    subscribers: Vec<(String, Subscriber)>,
    missed: Vec<(SubscriptionId, String, Vec<u8>)>,
}

impl Parked {
    fn record(&mut self, channel: &str, payload: &[u8]) {
        for (subscribed, subscriber) in &self.subscribers {
            if subscribed == channel {
                self.missed
                    .push((subscriber.id, channel.to_string(), payload.to_vec()));
            }
        }
    }

    /// Deliver missed messages in publish order. Returns how many arrived.
    fn replay(self) -> usize {
        let mut delivered = 0;
        for (id, channel, payload) in self.missed {
            let Some((_, subscriber)) = self.subscribers.iter().find(|(_, s)| s.id == id) else {
                continue;
            };
            if subscriber
                .sink
                .send(InboundEvent::Message { channel, payload })
                .is_ok()
            {
                delivered += 1;
            }
        }
        delivered
    }
}

#[derive(Default)]
struct HubState {
    channels: HashMap<String, Vec<Subscriber>>,
    presence: HashMap<String, PresenceSet>,
    parked: HashMap<u64, Parked>,
}

impl HubState {
    /// Send to every watcher of a presence set, pruning closed sinks.
    fn notify_presence(&mut self, channel: &str, change: PresenceChange) {
        if let Some(set) = self.presence.get_mut(channel) {
            set.watchers.retain(|w| {
                w.sink
                    .send(InboundEvent::Presence {
                        channel: channel.to_string(),
                        change: change.clone(),
                    })
                    .is_ok()
            });
        }
    }

    /// Remove everything a connection held and tell the remaining watchers.
    ///
    /// With `park` set, its channel subscriptions are kept aside to collect
    /// messages until the connection comes back.
    fn forget_connection(
        &mut self,
        connection: u64,
        participant: Option<&ParticipantId>,
        park: bool,
    ) {
        let mut parked = Vec::new();
        for (channel, subscribers) in self.channels.iter_mut() {
            subscribers.retain(|s| {
                if s.connection != connection {
                    return true;
                }
                if park {
                    parked.push((channel.clone(), s.clone()));
                }
                false
            });
        }
        self.channels.retain(|_, subscribers| !subscribers.is_empty());
        if !parked.is_empty() {
            self.parked.insert(
                connection,
                Parked {
                    subscribers: parked,
                    missed: Vec::new(),
                },
            );
        }

        let channels: Vec<String> = self.presence.keys().cloned().collect();
        for channel in channels {
            let mut left = false;
            if let Some(set) = self.presence.get_mut(&channel) {
                set.watchers.retain(|w| w.connection != connection);
                if let Some(participant) = participant {
                    left = set.members.remove(participant).is_some();
                }
            }
            if let (true, Some(participant)) = (left, participant) {
                self.notify_presence(&channel, PresenceChange::Leave(participant.clone()));
            }
        }
    }
}

/// Shared broker for loopback transports.
#[derive(Clone)]
pub struct LoopbackHub {
    state: Arc<RwLock<HubState>>,
    config: LoopbackConfig,
    next_id: Arc<AtomicU64>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::with_config(LoopbackConfig::default())
    }

    pub fn with_config(config: LoopbackConfig) -> Self {
        Self {
            state: Arc::new(RwLock::new(HubState::default())),
            config,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Attach a new client connection to the hub.
    pub fn connect(&self) -> Arc<LoopbackTransport> {
        let connection = self.allocate_id();
        let initial = if self.config.start_connected {
            LinkState::Connected
        } else {
            LinkState::Connecting
        };
        let (link, _) = watch::channel(initial);
        let participant = self
            .config
            .start_connected
            .then(|| participant_for(connection, 0));
        log::debug!("Loopback connection {connection} attached ({initial:?})");

        Arc::new(LoopbackTransport {
            hub: self.clone(),
            connection,
            generation: AtomicU64::new(0),
            participant: RwLock::new(participant),
            link,
            lifecycle: RwLock::new(Vec::new()),
        })
    }

    /// Number of live message subscribers on a channel.
    pub async fn subscriber_count(&self, channel: &str) -> usize {
        self.state
            .read()
            .await
            .channels
            .get(channel)
            .map_or(0, Vec::len)
    }

    /// Server-side view of a presence set.
    pub async fn presence_members(&self, channel: &str) -> Vec<PresenceEntry> {
        self.state
            .read()
            .await
            .presence
            .get(channel)
            .map(|set| set.members.values().cloned().collect())
            .unwrap_or_default()
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for LoopbackHub {
    fn default() -> Self {
        Self::new()
    }
}

fn participant_for(connection: u64, generation: u64) -> ParticipantId {
    ParticipantId::new(format!("conn-{connection}.{generation}"))
}

/// One client connection to a [`LoopbackHub`].
///
/// The outage controls ([`disconnect`](Self::disconnect),
/// [`begin_reconnect`](Self::begin_reconnect),
/// [`reconnect`](Self::reconnect), [`fail`](Self::fail)) emulate what a
/// real transport reports through its lifecycle stream.
pub struct LoopbackTransport {
    hub: LoopbackHub,
    connection: u64,
    generation: AtomicU64,
    participant: RwLock<Option<ParticipantId>>,
    link: watch::Sender<LinkState>,
    lifecycle: RwLock<Vec<(SubscriptionId, EventSink)>>,
}

impl LoopbackTransport {
    /// Finish the initial handshake of a transport created in `Connecting`.
    pub async fn open(&self) {
        if self.current_link() != LinkState::Connecting {
            return;
        }
        let generation = self.generation.load(Ordering::Relaxed);
        *self.participant.write().await = Some(participant_for(self.connection, generation));
        self.link.send_replace(LinkState::Connected);
    }

    /// Drop the connection. The hub forgets its subscriptions and presence.
    pub async fn disconnect(&self) {
        if self.current_link() != LinkState::Connected {
            return;
        }
        let participant = self.participant.write().await.take();
        self.hub.state.write().await.forget_connection(
            self.connection,
            participant.as_ref(),
            self.hub.config.redeliver_after_outage,
        );
        self.link.send_replace(LinkState::Disconnected);
        log::debug!("Loopback connection {} dropped", self.connection);
        self.emit(LifecycleEvent::Disconnected).await;
    }

    /// Report a reconnection attempt.
    pub async fn begin_reconnect(&self, attempt: u32) {
        if self.current_link() == LinkState::Disconnected {
            self.emit(LifecycleEvent::Reconnecting { attempt }).await;
        }
    }

    /// Re-establish the connection under a fresh participant id.
    pub async fn reconnect(&self) {
        if self.current_link() != LinkState::Disconnected {
            return;
        }
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        *self.participant.write().await = Some(participant_for(self.connection, generation));
        self.link.send_replace(LinkState::Connected);
        let parked = self.hub.state.write().await.parked.remove(&self.connection);
        let replayed = parked.map_or(0, Parked::replay);
        log::debug!(
            "Loopback connection {} re-established (generation {generation}, {replayed} missed messages replayed)",
            self.connection
        );
        self.emit(LifecycleEvent::Reconnected).await;
    }

    /// Give up reconnecting.
    pub async fn fail(&self) {
        if self.current_link() == LinkState::Connected {
            self.disconnect().await;
        }
        self.hub.state.write().await.parked.remove(&self.connection);
        self.link.send_replace(LinkState::Failed);
        self.emit(LifecycleEvent::ReconnectFailed).await;
    }

    fn current_link(&self) -> LinkState {
        *self.link.borrow()
    }

    /// Publish and subscribe need a live link.
    fn require_connected(&self) -> Result<(), TransportError> {
        match self.current_link() {
            LinkState::Connected => Ok(()),
            LinkState::Failed => Err(TransportError::Unavailable),
            LinkState::Connecting | LinkState::Disconnected => Err(TransportError::NotConnected),
        }
    }

    async fn current_participant(&self) -> Result<ParticipantId, TransportError> {
        self.require_connected()?;
        self.participant
            .read()
            .await
            .clone()
            .ok_or(TransportError::NotConnected)
    }

    async fn emit(&self, event: LifecycleEvent) {
        self.lifecycle
            .write()
            .await
            .retain(|(_, sink)| sink.send(InboundEvent::Lifecycle(event)).is_ok());
    }

    fn subscriber(&self, sink: EventSink) -> Subscriber {
        Subscriber {
            id: SubscriptionId(self.hub.allocate_id()),
            connection: self.connection,
            sink,
        }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn link_state(&self) -> watch::Receiver<LinkState> {
        self.link.subscribe()
    }

    async fn connection_id(&self) -> Option<ParticipantId> {
        self.participant.read().await.clone()
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.require_connected()?;
        let copies = if self.hub.config.duplicate_delivery { 2 } else { 1 };

        let mut state = self.hub.state.write().await;
        if let Some(subscribers) = state.channels.get_mut(channel) {
            subscribers.retain(|s| {
                (0..copies).all(|_| {
                    s.sink
                        .send(InboundEvent::Message {
                            channel: channel.to_string(),
                            payload: payload.clone(),
                        })
                        .is_ok()
                })
            });
        }
        for parked in state.parked.values_mut() {
            parked.record(channel, &payload);
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: &str,
        sink: EventSink,
    ) -> Result<SubscriptionId, TransportError> {
        self.require_connected()?;
        let subscriber = self.subscriber(sink);
        let id = subscriber.id;
        self.hub
            .state
            .write()
            .await
            .channels
            .entry(channel.to_string())
            .or_default()
            .push(subscriber);
        Ok(id)
    }

    async fn unsubscribe(&self, channel: &str, id: SubscriptionId) -> Result<(), TransportError> {
        let mut state = self.hub.state.write().await;
        if let Some(subscribers) = state.channels.get_mut(channel) {
            subscribers.retain(|s| s.id != id);
            if subscribers.is_empty() {
                state.channels.remove(channel);
            }
        }
        if let Some(parked) = state.parked.get_mut(&self.connection) {
            parked.subscribers.retain(|(_, s)| s.id != id);
            parked.missed.retain(|(missed_by, _, _)| *missed_by != id);
        }
        Ok(())
    }

    async fn enter_presence(
        &self,
        channel: &str,
        state: PresenceState,
    ) -> Result<(), TransportError> {
        let participant = self.current_participant().await?;
        let entry = PresenceEntry::new(participant.clone(), state);

        let mut hub = self.hub.state.write().await;
        let set = hub.presence.entry(channel.to_string()).or_default();
        let change = match set.members.insert(participant, entry.clone()) {
            Some(_) => PresenceChange::Update(entry),
            None => PresenceChange::Join(entry),
        };
        hub.notify_presence(channel, change);
        Ok(())
    }

    async fn update_presence(
        &self,
        channel: &str,
        state: PresenceState,
    ) -> Result<(), TransportError> {
        let participant = self.current_participant().await?;

        let mut hub = self.hub.state.write().await;
        let set = hub.presence.entry(channel.to_string()).or_default();
        let change = match set.members.get_mut(&participant) {
            Some(entry) => {
                entry.state = state;
                entry.updated_at = now_millis();
                PresenceChange::Update(entry.clone())
            }
            None => {
                // Updating without entering implicitly enters.
                let entry = PresenceEntry::new(participant.clone(), state);
                set.members.insert(participant, entry.clone());
                PresenceChange::Join(entry)
            }
        };
        hub.notify_presence(channel, change);
        Ok(())
    }

    async fn leave_presence(&self, channel: &str) -> Result<(), TransportError> {
        let participant = self.current_participant().await?;

        let mut hub = self.hub.state.write().await;
        let removed = hub
            .presence
            .get_mut(channel)
            .and_then(|set| set.members.remove(&participant))
            .is_some();
        if removed {
            hub.notify_presence(channel, PresenceChange::Leave(participant));
        }
        Ok(())
    }

    async fn presence_members(&self, channel: &str) -> Result<Vec<PresenceEntry>, TransportError> {
        self.require_connected()?;
        Ok(self.hub.presence_members(channel).await)
    }

    async fn subscribe_presence(
        &self,
        channel: &str,
        sink: EventSink,
    ) -> Result<SubscriptionId, TransportError> {
        self.require_connected()?;
        let subscriber = self.subscriber(sink);
        let id = subscriber.id;
        self.hub
            .state
            .write()
            .await
            .presence
            .entry(channel.to_string())
            .or_default()
            .watchers
            .push(subscriber);
        Ok(id)
    }

    async fn unsubscribe_presence(
        &self,
        channel: &str,
        id: SubscriptionId,
    ) -> Result<(), TransportError> {
        if let Some(set) = self.hub.state.write().await.presence.get_mut(channel) {
            set.watchers.retain(|w| w.id != id);
        }
        Ok(())
    }

    async fn subscribe_lifecycle(&self, sink: EventSink) -> SubscriptionId {
        let id = SubscriptionId(self.hub.allocate_id());
        self.lifecycle.write().await.push((id, sink));
        id
    }

    async fn unsubscribe_lifecycle(&self, id: SubscriptionId) {
        self.lifecycle.write().await.retain(|(sid, _)| *sid != id);
    }
}
