//! Hub - in-process fan-out of live updates to connected clients.
//!
//! A single actor owns the connection registry, the channel index and the
//! replay buffer. Producers talk to it through a cloneable [`HubHandle`];
//! each connection gets a bounded outbound queue that the hub fills with
//! non-blocking enqueues. A full queue drops the message for that connection
//! only, so a slow client never stalls fan-out to the others.

/// Control loop and producer handle.
pub mod actor;
/// Registry entries and connection identity.
pub mod connection;
/// Reader-side frame routing.
pub mod inbound;
/// Live message schema.
pub mod message;
/// Bounded broadcast history.
pub mod replay;

pub use actor::{Hub, HubHandle, HubStats};
pub use connection::{ConnectionHandle, ConnectionId, ConnectionInfo};
pub use inbound::{route_frame, IgnoreInbound, InboundContext, InboundHandler, Routed};
pub use message::{Message, MessageType};
pub use replay::ReplayBuffer;

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What the heartbeat sweep does with a connection that has gone quiet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StalePolicy {
    /// Mark it stale and log once; the transport's ping timeout closes it
    #[default]
    Flag,
    /// Unregister it immediately
    Evict,
}

/// Hub configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Outbound queue capacity per connection
    #[serde(default = "default_send_buffer")]
    pub send_buffer: usize,
    /// Broadcasts kept for replay to new connections (0 disables replay)
    #[serde(default = "default_replay_capacity")]
    pub replay_capacity: usize,
    /// Capacity of the hub's operation queue
    #[serde(default = "default_command_buffer")]
    pub command_buffer: usize,
    /// Seconds between heartbeat sweeps
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Seconds without a liveness signal before a connection is stale
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    /// Action taken on stale connections
    #[serde(default)]
    pub stale_policy: StalePolicy,
}

fn default_send_buffer() -> usize {
    256
}

fn default_replay_capacity() -> usize {
    100
}

fn default_command_buffer() -> usize {
    1024
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_stale_after_secs() -> u64 {
    60
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            send_buffer: default_send_buffer(),
            replay_capacity: default_replay_capacity(),
            command_buffer: default_command_buffer(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            stale_after_secs: default_stale_after_secs(),
            stale_policy: StalePolicy::default(),
        }
    }
}

impl HubConfig {
    /// Heartbeat sweep period (at least one second).
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    /// Staleness threshold.
    #[must_use]
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}
