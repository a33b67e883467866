use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use super::message::Message;

/// Opaque identity of one live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generate a fresh id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Outcome of a non-blocking enqueue onto a connection's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Enqueue {
    Queued,
    /// Queue full, message dropped for this connection
    Dropped,
    /// Writer is gone; the reader will unregister shortly
    Closed,
}

/// Hub-owned registry entry.
///
/// The hub holds the only sender of the outbound queue, so removing the entry
/// from the registry closes the queue and ends the writer.
#[derive(Debug)]
pub(crate) struct Connection {
    pub(crate) id: ConnectionId,
    pub(crate) user_id: String,
    pub(crate) sender: mpsc::Sender<Arc<Message>>,
    pub(crate) channels: HashSet<String>,
    pub(crate) last_seen: Instant,
    pub(crate) connected_at: DateTime<Utc>,
    pub(crate) metadata: HashMap<String, String>,
    pub(crate) stale: bool,
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        user_id: String,
        metadata: HashMap<String, String>,
        sender: mpsc::Sender<Arc<Message>>,
    ) -> Self {
        Self {
            id,
            user_id,
            sender,
            channels: HashSet::new(),
            last_seen: Instant::now(),
            connected_at: Utc::now(),
            metadata,
            stale: false,
        }
    }

    pub(crate) fn enqueue(&self, message: Arc<Message>) -> Enqueue {
        match self.sender.try_send(message) {
            Ok(()) => Enqueue::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => Enqueue::Dropped,
            Err(mpsc::error::TrySendError::Closed(_)) => Enqueue::Closed,
        }
    }

    pub(crate) fn touch(&mut self) {
        self.last_seen = Instant::now();
        self.stale = false;
    }

    pub(crate) fn info(&self) -> ConnectionInfo {
        let mut channels: Vec<String> = self.channels.iter().cloned().collect();
        channels.sort();
        ConnectionInfo {
            id: self.id,
            user_id: self.user_id.clone(),
            channels,
            connected_at: self.connected_at,
            idle_secs: self.last_seen.elapsed().as_secs(),
            stale: self.stale,
            metadata: self.metadata.clone(),
        }
    }
}

/// Read-only snapshot of a registered connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    /// Connection identity
    pub id: ConnectionId,
    /// Caller identity
    pub user_id: String,
    /// Joined channels, sorted
    pub channels: Vec<String>,
    /// Registration time
    pub connected_at: DateTime<Utc>,
    /// Seconds since the last liveness signal
    pub idle_secs: u64,
    /// Flagged by the heartbeat sweep
    pub stale: bool,
    /// Arbitrary metadata supplied at registration
    pub metadata: HashMap<String, String>,
}

/// Transport side of a registered connection.
///
/// The writer task drains `receiver`; it yields `None` once the hub has
/// unregistered the connection or shut down.
#[derive(Debug)]
pub struct ConnectionHandle {
    /// Connection identity
    pub id: ConnectionId,
    /// Caller identity
    pub user_id: String,
    /// Outbound queue, single consumer
    pub receiver: mpsc::Receiver<Arc<Message>>,
}
