//! Event Bus - durable, subject-routed publish/subscribe across services.
//!
//! The bus is a client of a [`Broker`]. Publishes to a subject captured by a
//! stream return only after the broker stored them. Durable subscriptions
//! bind a named consumer cursor to a stream: handler success acks, handler
//! failure naks, and the broker redelivers with backoff until the consumer's
//! max-deliver is exhausted.

/// Broker trait
pub mod broker;
/// Event bus client
pub mod bus;
/// In-process broker
pub mod memory;
/// Redis Streams broker
pub mod redis_broker;
/// Subject naming and matching
pub mod subject;
/// Event and broker types
pub mod types;

pub use broker::Broker;
pub use bus::{EventBus, EventHandler, SubscriptionId, SubscriptionKind};
pub use memory::MemoryBroker;
pub use redis_broker::RedisBroker;
pub use subject::{subject_matches, token, Domain, SUBJECT_PREFIX};
pub use types::{
    BrokerMessage, ConsumerConfig, Delivery, DeliveryInfo, DiscardPolicy, Event, PublishAck,
    ReceivedMessage, StreamConfig, StreamInfo,
};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::utils::RetryConfig;

/// Broker backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerKind {
    /// In-process broker (single node)
    #[default]
    Memory,
    /// Redis Streams
    Redis,
}

/// Event bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBusConfig {
    /// Broker backend
    #[serde(default)]
    pub broker: BrokerKind,
    /// Broker URL (credentials included)
    #[serde(default = "default_url")]
    pub url: String,
    /// First reconnect delay
    #[serde(default = "default_reconnect_min_delay_ms")]
    pub reconnect_min_delay_ms: u64,
    /// Reconnect delay ceiling
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
    /// Reconnect attempts per outage (0 retries forever)
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Stream retention window
    #[serde(default = "default_stream_max_age_secs")]
    pub stream_max_age_secs: u64,
    /// Stream message limit (0 is unlimited)
    #[serde(default = "default_stream_max_messages")]
    pub stream_max_messages: u64,
    /// Dedup window for publishes carrying a message id
    #[serde(default = "default_duplicate_window_secs")]
    pub duplicate_window_secs: u64,
    /// Time a handler has before its delivery is redelivered
    #[serde(default = "default_ack_wait_secs")]
    pub ack_wait_secs: u64,
    /// Delivery attempts per message
    #[serde(default = "default_max_deliver")]
    pub max_deliver: u32,
    /// Redelivery delays after a nak, by attempt
    #[serde(default = "default_nak_backoff_ms")]
    pub nak_backoff_ms: Vec<u64>,
    /// Deliveries pulled per fetch
    #[serde(default = "default_fetch_batch")]
    pub fetch_batch: usize,
    /// Longest a fetch waits for the first delivery
    #[serde(default = "default_fetch_wait_ms")]
    pub fetch_wait_ms: u64,
    /// Buffer of each plain subscription
    #[serde(default = "default_subscription_buffer")]
    pub subscription_buffer: usize,
    /// Time in-flight handlers get to finish on drain
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

fn default_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_reconnect_min_delay_ms() -> u64 {
    250
}

fn default_reconnect_max_delay_ms() -> u64 {
    30_000
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_stream_max_age_secs() -> u64 {
    7 * 24 * 60 * 60
}

fn default_stream_max_messages() -> u64 {
    1_000_000
}

fn default_duplicate_window_secs() -> u64 {
    120
}

fn default_ack_wait_secs() -> u64 {
    30
}

fn default_max_deliver() -> u32 {
    5
}

fn default_nak_backoff_ms() -> Vec<u64> {
    vec![1_000, 5_000, 15_000, 30_000]
}

fn default_fetch_batch() -> usize {
    10
}

fn default_fetch_wait_ms() -> u64 {
    1_000
}

fn default_subscription_buffer() -> usize {
    1024
}

fn default_drain_timeout_secs() -> u64 {
    10
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            broker: BrokerKind::default(),
            url: default_url(),
            reconnect_min_delay_ms: default_reconnect_min_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            stream_max_age_secs: default_stream_max_age_secs(),
            stream_max_messages: default_stream_max_messages(),
            duplicate_window_secs: default_duplicate_window_secs(),
            ack_wait_secs: default_ack_wait_secs(),
            max_deliver: default_max_deliver(),
            nak_backoff_ms: default_nak_backoff_ms(),
            fetch_batch: default_fetch_batch(),
            fetch_wait_ms: default_fetch_wait_ms(),
            subscription_buffer: default_subscription_buffer(),
            drain_timeout_secs: default_drain_timeout_secs(),
        }
    }
}

impl EventBusConfig {
    /// Stream retention window.
    #[must_use]
    pub fn stream_max_age(&self) -> Duration {
        Duration::from_secs(self.stream_max_age_secs)
    }

    /// Dedup window.
    #[must_use]
    pub fn duplicate_window(&self) -> Duration {
        Duration::from_secs(self.duplicate_window_secs)
    }

    /// Ack wait (at least one second).
    #[must_use]
    pub fn ack_wait(&self) -> Duration {
        Duration::from_secs(self.ack_wait_secs.max(1))
    }

    /// Nak redelivery schedule.
    #[must_use]
    pub fn nak_backoff(&self) -> Vec<Duration> {
        self.nak_backoff_ms
            .iter()
            .copied()
            .map(Duration::from_millis)
            .collect()
    }

    /// Fetch wait.
    #[must_use]
    pub fn fetch_wait(&self) -> Duration {
        Duration::from_millis(self.fetch_wait_ms.max(1))
    }

    /// Drain timeout.
    #[must_use]
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    /// Reconnect and resubscribe backoff.
    #[must_use]
    pub fn reconnect_backoff(&self) -> RetryConfig {
        RetryConfig::new()
            .with_max_attempts(self.max_reconnect_attempts)
            .with_initial_delay(Duration::from_millis(self.reconnect_min_delay_ms))
            .with_max_delay(Duration::from_millis(
                self.reconnect_max_delay_ms.max(self.reconnect_min_delay_ms),
            ))
    }
}

/// Build the configured broker.
pub async fn connect_broker(config: &EventBusConfig) -> Result<Arc<dyn Broker>> {
    match config.broker {
        BrokerKind::Memory => Ok(Arc::new(MemoryBroker::new(config.subscription_buffer))),
        BrokerKind::Redis => Ok(Arc::new(RedisBroker::connect(config).await?)),
    }
}

#[cfg(test)]
mod tests;
