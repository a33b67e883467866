use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument, Span};

use super::connection::{Connection, ConnectionHandle, ConnectionId, ConnectionInfo, Enqueue};
use super::message::{Message, MessageType};
use super::replay::ReplayBuffer;
use super::{HubConfig, StalePolicy};
use crate::error::{Error, Result};

/// Operations serialized through the control loop.
enum Command {
    Register(Connection),
    Unregister(ConnectionId),
    Subscribe(ConnectionId, String),
    Unsubscribe(ConnectionId, String),
    Broadcast(Arc<Message>),
    SendTo(ConnectionId, Arc<Message>),
    Touch(ConnectionId),
    Stats(oneshot::Sender<HubStats>),
    Subscribers(String, oneshot::Sender<Vec<ConnectionId>>),
    Connections(oneshot::Sender<Vec<ConnectionInfo>>),
}

/// Counters and sizes reported by the control loop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    /// Registered connections
    pub connections: usize,
    /// Channels with at least one subscriber
    pub channels: usize,
    /// Connections currently flagged stale
    pub stale_connections: usize,
    /// Messages held for replay
    pub replay_len: usize,
    /// Broadcasts processed
    pub broadcasts: u64,
    /// Per-connection enqueues that succeeded
    pub delivered: u64,
    /// Per-connection enqueues dropped on a full queue
    pub dropped: u64,
}

/// The live fan-out actor.
///
/// Owns the registry, the channel index and the replay buffer. Nothing else
/// mutates them: every operation arrives as a [`Command`] on one bounded queue
/// and is applied in arrival order.
pub struct Hub {
    config: HubConfig,
    rx: mpsc::Receiver<Command>,
    registry: HashMap<ConnectionId, Connection>,
    channels: HashMap<String, HashSet<ConnectionId>>,
    replay: ReplayBuffer,
    stats: HubStats,
    span: Span,
}

impl Hub {
    /// Build the actor and a handle for producers.
    pub fn new(config: HubConfig) -> (Self, HubHandle) {
        let (tx, rx) = mpsc::channel(config.command_buffer.max(1));
        let handle = HubHandle {
            tx,
            send_buffer: config.send_buffer.max(1),
        };
        let hub = Self {
            replay: ReplayBuffer::new(config.replay_capacity),
            config,
            rx,
            registry: HashMap::new(),
            channels: HashMap::new(),
            stats: HubStats::default(),
            span: info_span!("hub"),
        };
        (hub, handle)
    }

    /// Run the control loop inside the given span instead of the default one.
    #[must_use]
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Build the actor and spawn its loop on the current runtime.
    pub fn spawn(config: HubConfig, shutdown: CancellationToken) -> (HubHandle, JoinHandle<()>) {
        let (hub, handle) = Self::new(config);
        let task = tokio::spawn(hub.run(shutdown));
        (handle, task)
    }

    /// Process operations until `shutdown` fires or every handle is dropped.
    ///
    /// On exit every outbound queue is closed and the registry and channel
    /// index are cleared.
    pub async fn run(self, shutdown: CancellationToken) {
        let span = self.span.clone();
        self.run_loop(shutdown).instrument(span).await;
    }

    async fn run_loop(mut self, shutdown: CancellationToken) {
        let period = self.config.heartbeat_interval();
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            send_buffer = self.config.send_buffer,
            replay_capacity = self.config.replay_capacity,
            stale_policy = ?self.config.stale_policy,
            "Hub control loop started"
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    debug!("Hub received shutdown signal");
                    break;
                }
                command = self.rx.recv() => match command {
                    Some(command) => self.apply(command),
                    None => {
                        debug!("All hub handles dropped");
                        break;
                    }
                },
                _ = heartbeat.tick() => self.sweep_stale(),
            }
        }

        self.rx.close();
        self.close_all();
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::Register(conn) => self.register(conn),
            Command::Unregister(id) => self.unregister(id),
            Command::Subscribe(id, channel) => self.subscribe(id, channel),
            Command::Unsubscribe(id, channel) => self.unsubscribe(id, &channel),
            Command::Broadcast(message) => self.broadcast(message),
            Command::SendTo(id, message) => self.send_to(id, message),
            Command::Touch(id) => {
                if let Some(conn) = self.registry.get_mut(&id) {
                    conn.touch();
                }
            }
            Command::Stats(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::Subscribers(channel, reply) => {
                let mut ids: Vec<ConnectionId> = self
                    .channels
                    .get(&channel)
                    .map(|set| set.iter().copied().collect())
                    .unwrap_or_default();
                ids.sort();
                let _ = reply.send(ids);
            }
            Command::Connections(reply) => {
                let _ = reply.send(self.registry.values().map(Connection::info).collect());
            }
        }
    }

    fn register(&mut self, conn: Connection) {
        let id = conn.id;
        if self.registry.contains_key(&id) {
            warn!(conn_id = %id, "Duplicate registration ignored");
            return;
        }

        let ack = Arc::new(Message::connect_ack(&id.to_string(), &conn.user_id));
        if conn.enqueue(ack) != Enqueue::Queued {
            warn!(conn_id = %id, "Could not enqueue connect acknowledgment");
        }

        let mut replayed = 0usize;
        for message in self.replay.iter() {
            match conn.enqueue(Arc::clone(message)) {
                Enqueue::Queued => replayed += 1,
                Enqueue::Dropped => {
                    warn!(conn_id = %id, "Outbound queue full during replay, skipping rest");
                    break;
                }
                Enqueue::Closed => break,
            }
        }

        info!(
            conn_id = %id,
            user = %conn.user_id,
            replayed,
            total = self.registry.len() + 1,
            "Connection registered"
        );
        self.registry.insert(id, conn);
    }

    fn unregister(&mut self, id: ConnectionId) {
        let Some(conn) = self.registry.remove(&id) else {
            debug!(conn_id = %id, "Unregister for unknown connection");
            return;
        };

        for channel in &conn.channels {
            self.leave(id, channel);
        }

        info!(
            conn_id = %id,
            user = %conn.user_id,
            remaining = self.registry.len(),
            "Connection unregistered"
        );
        // dropping `conn` drops the only sender and closes the queue
    }

    fn subscribe(&mut self, id: ConnectionId, channel: String) {
        let Some(conn) = self.registry.get_mut(&id) else {
            debug!(conn_id = %id, channel = %channel, "Subscribe from unknown connection");
            return;
        };
        conn.channels.insert(channel.clone());
        self.channels.entry(channel.clone()).or_default().insert(id);
        debug!(conn_id = %id, channel = %channel, "Subscribed");
    }

    fn unsubscribe(&mut self, id: ConnectionId, channel: &str) {
        let Some(conn) = self.registry.get_mut(&id) else {
            debug!(conn_id = %id, channel = %channel, "Unsubscribe from unknown connection");
            return;
        };
        if conn.channels.remove(channel) {
            self.leave(id, channel);
            debug!(conn_id = %id, channel = %channel, "Unsubscribed");
        }
    }

    /// Remove `id` from a channel's subscriber set, dropping empty channels.
    fn leave(&mut self, id: ConnectionId, channel: &str) {
        if let Some(subscribers) = self.channels.get_mut(channel) {
            subscribers.remove(&id);
            if subscribers.is_empty() {
                self.channels.remove(channel);
                debug!(channel = %channel, "Channel removed");
            }
        }
    }

    fn broadcast(&mut self, message: Arc<Message>) {
        self.stats.broadcasts += 1;
        self.replay.push(Arc::clone(&message));

        let (delivered, dropped) = match message.channel.as_deref() {
            Some(channel) => match self.channels.get(channel) {
                Some(subscribers) => {
                    fan_out(&self.registry, subscribers.iter().copied(), &message)
                }
                None => {
                    debug!(channel = %channel, msg_type = %message.kind, "No subscribers for channel");
                    (0, 0)
                }
            },
            None => fan_out(&self.registry, self.registry.keys().copied(), &message),
        };

        self.stats.delivered += delivered;
        self.stats.dropped += dropped;
    }

    fn send_to(&mut self, id: ConnectionId, message: Arc<Message>) {
        let Some(conn) = self.registry.get(&id) else {
            debug!(conn_id = %id, "Direct send to unknown connection");
            return;
        };
        match conn.enqueue(message) {
            Enqueue::Queued => self.stats.delivered += 1,
            Enqueue::Dropped => {
                warn!(conn_id = %id, "Outbound queue full, dropping direct message");
                self.stats.dropped += 1;
            }
            Enqueue::Closed => {}
        }
    }

    fn sweep_stale(&mut self) {
        let threshold = self.config.stale_after();
        let stale: Vec<ConnectionId> = self
            .registry
            .values()
            .filter(|conn| conn.last_seen.elapsed() > threshold)
            .map(|conn| conn.id)
            .collect();

        if stale.is_empty() {
            return;
        }

        match self.config.stale_policy {
            StalePolicy::Flag => {
                for id in stale {
                    if let Some(conn) = self.registry.get_mut(&id) {
                        if !conn.stale {
                            conn.stale = true;
                            warn!(
                                conn_id = %id,
                                user = %conn.user_id,
                                idle_secs = conn.last_seen.elapsed().as_secs(),
                                "Connection is stale"
                            );
                        }
                    }
                }
            }
            StalePolicy::Evict => {
                for id in stale {
                    warn!(conn_id = %id, "Evicting stale connection");
                    self.unregister(id);
                }
            }
        }
    }

    fn snapshot(&self) -> HubStats {
        HubStats {
            connections: self.registry.len(),
            channels: self.channels.len(),
            stale_connections: self.registry.values().filter(|c| c.stale).count(),
            replay_len: self.replay.len(),
            ..self.stats.clone()
        }
    }

    fn close_all(&mut self) {
        let count = self.registry.len();
        for conn in self.registry.values() {
            let bye = Arc::new(Message::new(MessageType::Disconnect, serde_json::Value::Null));
            let _ = conn.enqueue(bye);
        }
        self.registry.clear();
        self.channels.clear();
        self.replay.clear();
        info!(closed = count, "Hub stopped, all connections closed");
    }
}

/// Enqueue `message` for each target. Returns `(delivered, dropped)`.
fn fan_out(
    registry: &HashMap<ConnectionId, Connection>,
    targets: impl Iterator<Item = ConnectionId>,
    message: &Arc<Message>,
) -> (u64, u64) {
    let mut delivered = 0;
    let mut dropped = 0;
    for id in targets {
        let Some(conn) = registry.get(&id) else {
            continue;
        };
        match conn.enqueue(Arc::clone(message)) {
            Enqueue::Queued => delivered += 1,
            Enqueue::Dropped => {
                dropped += 1;
                warn!(
                    conn_id = %id,
                    msg_type = %message.kind,
                    channel = message.channel.as_deref().unwrap_or("*"),
                    "Outbound queue full, dropping message"
                );
            }
            Enqueue::Closed => {
                debug!(conn_id = %id, "Outbound queue closed, skipping");
            }
        }
    }
    (delivered, dropped)
}

/// Cloneable producer side of the hub.
///
/// Every method enqueues one operation; it fails with [`Error::HubClosed`]
/// once the control loop has stopped.
#[derive(Debug, Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<Command>,
    send_buffer: usize,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Command::Register(_) => "Register",
            Command::Unregister(_) => "Unregister",
            Command::Subscribe(..) => "Subscribe",
            Command::Unsubscribe(..) => "Unsubscribe",
            Command::Broadcast(_) => "Broadcast",
            Command::SendTo(..) => "SendTo",
            Command::Touch(_) => "Touch",
            Command::Stats(_) => "Stats",
            Command::Subscribers(..) => "Subscribers",
            Command::Connections(_) => "Connections",
        };
        f.write_str(name)
    }
}

impl HubHandle {
    async fn send(&self, command: Command) -> Result<()> {
        self.tx.send(command).await.map_err(|_| Error::HubClosed)
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(build(reply_tx)).await?;
        reply_rx.await.map_err(|_| Error::HubClosed)
    }

    /// Register a new connection and return its outbound queue.
    ///
    /// The queue receives a connect acknowledgment followed by the replay
    /// buffer contents.
    pub async fn register(
        &self,
        user_id: impl Into<String>,
        metadata: HashMap<String, String>,
    ) -> Result<ConnectionHandle> {
        let id = ConnectionId::new();
        let user_id = user_id.into();
        let (sender, receiver) = mpsc::channel(self.send_buffer);
        let conn = Connection::new(id, user_id.clone(), metadata, sender);
        self.send(Command::Register(conn)).await?;
        Ok(ConnectionHandle {
            id,
            user_id,
            receiver,
        })
    }

    /// Remove a connection, close its queue and purge its channel memberships.
    pub async fn unregister(&self, id: ConnectionId) -> Result<()> {
        self.send(Command::Unregister(id)).await
    }

    /// Join a channel.
    pub async fn subscribe(&self, id: ConnectionId, channel: impl Into<String>) -> Result<()> {
        self.send(Command::Subscribe(id, channel.into())).await
    }

    /// Leave a channel.
    pub async fn unsubscribe(&self, id: ConnectionId, channel: impl Into<String>) -> Result<()> {
        self.send(Command::Unsubscribe(id, channel.into())).await
    }

    /// Fan a message out to its channel, or to everyone when it has none.
    pub async fn broadcast(&self, message: Message) -> Result<()> {
        self.send(Command::Broadcast(Arc::new(message))).await
    }

    /// Build and broadcast a channel-scoped message.
    pub async fn broadcast_to_channel(
        &self,
        channel: impl Into<String>,
        kind: impl Into<MessageType>,
        data: serde_json::Value,
    ) -> Result<()> {
        self.broadcast(Message::new(kind, data).with_channel(channel))
            .await
    }

    /// Enqueue a message for a single connection.
    pub async fn send_to(&self, id: ConnectionId, message: Message) -> Result<()> {
        self.send(Command::SendTo(id, Arc::new(message))).await
    }

    /// Record a liveness signal for a connection.
    pub async fn touch(&self, id: ConnectionId) -> Result<()> {
        self.send(Command::Touch(id)).await
    }

    /// Current counters. Also acts as a barrier: every operation sent
    /// earlier through this handle has been applied when it returns.
    pub async fn stats(&self) -> Result<HubStats> {
        self.request(Command::Stats).await
    }

    /// Subscribers of a channel, sorted.
    pub async fn subscribers(&self, channel: impl Into<String>) -> Result<Vec<ConnectionId>> {
        let channel = channel.into();
        self.request(|reply| Command::Subscribers(channel, reply))
            .await
    }

    /// Snapshot of every registered connection.
    pub async fn connections(&self) -> Result<Vec<ConnectionInfo>> {
        self.request(Command::Connections).await
    }

    /// Whether the control loop has stopped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
