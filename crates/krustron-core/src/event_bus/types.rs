use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use super::subject::Domain;
use super::EventBusConfig;
use crate::error::Result;

/// Unit of durable publication. Immutable once published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event identity, also the dedup key
    pub id: String,
    /// Event type, e.g. `status-changed`
    #[serde(rename = "type")]
    pub event_type: String,
    /// Producing domain or service
    pub source: String,
    /// Fully qualified subject
    pub subject: String,
    /// Opaque payload
    #[serde(default)]
    pub data: serde_json::Value,
    /// Free-form metadata
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    /// Creation time
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// New event for `entity` in `domain` with a fresh id and timestamp.
    pub fn new(
        domain: Domain,
        entity: &str,
        event_type: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        let event_type = event_type.into();
        Self {
            id: Uuid::new_v4().to_string(),
            subject: domain.subject(entity, &event_type),
            event_type,
            source: domain.as_str().to_string(),
            data,
            metadata: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// Override the source.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Reuse an existing identity (e.g. a producer retrying the same event).
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Attach a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// What happens when a stream hits its message limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardPolicy {
    /// Drop the oldest message
    #[default]
    Old,
    /// Reject the new publish
    New,
}

/// Durable stream definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Stream name
    pub name: String,
    /// Subject patterns captured by the stream
    pub subjects: Vec<String>,
    /// Messages older than this are removed (zero keeps forever)
    pub max_age: Duration,
    /// Message count limit (zero is unlimited)
    pub max_messages: u64,
    /// Limit behaviour
    pub discard: DiscardPolicy,
    /// Publishes repeating a message id inside this window are merged
    pub duplicate_window: Duration,
}

impl StreamConfig {
    /// Stream for a domain, bound to `krustron.<domain>.>`.
    pub fn for_domain(domain: Domain, config: &EventBusConfig) -> Self {
        Self {
            name: domain.stream_name(),
            subjects: vec![domain.subject_filter()],
            max_age: config.stream_max_age(),
            max_messages: config.stream_max_messages,
            discard: DiscardPolicy::Old,
            duplicate_window: config.duplicate_window(),
        }
    }
}

/// Durable consumer definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// Durable name; the cursor survives client restarts
    pub durable_name: String,
    /// Only deliver subjects matching this pattern
    pub filter_subject: String,
    /// Unacknowledged deliveries are redelivered after this long
    pub ack_wait: Duration,
    /// Delivery attempts before a message is given up on
    pub max_deliver: u32,
    /// Nak redelivery delays by attempt; the last entry repeats
    pub backoff: Vec<Duration>,
}

impl ConsumerConfig {
    /// Consumer using the bus-wide ack and redelivery settings.
    pub fn new(durable: &str, filter_subject: &str, config: &EventBusConfig) -> Self {
        Self {
            durable_name: durable.to_string(),
            filter_subject: filter_subject.to_string(),
            ack_wait: config.ack_wait(),
            max_deliver: config.max_deliver,
            backoff: config.nak_backoff(),
        }
    }

    /// Redelivery delay after the given (1-based) attempt was nak'd.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let index = (attempt.max(1) - 1) as usize;
        self.backoff
            .get(index)
            .or_else(|| self.backoff.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }
}

/// Broker acknowledgment of a publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishAck {
    /// Stream that stored the message; `None` for plain subjects
    pub stream: Option<String>,
    /// Position of the stored message in the stream
    pub id: Option<String>,
    /// Message id was seen inside the dedup window; nothing new was stored
    pub duplicate: bool,
}

impl PublishAck {
    /// Ack for a subject that no stream captures.
    pub fn unstored() -> Self {
        Self {
            stream: None,
            id: None,
            duplicate: false,
        }
    }
}

/// Stream size report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamInfo {
    /// Stream name
    pub name: String,
    /// Captured subject patterns
    pub subjects: Vec<String>,
    /// Messages currently retained
    pub messages: u64,
}

/// Message delivered on a plain or queue subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    /// Concrete subject
    pub subject: String,
    /// Raw payload
    pub payload: Vec<u8>,
}

/// Message delivered to a durable consumer; must be acked or nak'd.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Stream name
    pub stream: String,
    /// Durable consumer name
    pub consumer: String,
    /// Broker-specific message position
    pub id: String,
    /// Concrete subject
    pub subject: String,
    /// Raw payload
    pub payload: Vec<u8>,
    /// 1-based delivery attempt
    pub attempt: u32,
}

/// Durable delivery metadata visible to handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryInfo {
    /// Stream name
    pub stream: String,
    /// Durable consumer name
    pub consumer: String,
    /// 1-based delivery attempt
    pub attempt: u32,
}

/// Message handed to an event handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    /// Concrete subject
    pub subject: String,
    /// Raw payload
    pub payload: Vec<u8>,
    /// Present for durable subscriptions
    pub delivery: Option<DeliveryInfo>,
}

impl ReceivedMessage {
    /// Decode the payload as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Decode the payload as an [`Event`].
    pub fn event(&self) -> Result<Event> {
        self.json()
    }

    /// Delivery attempt, 1 for plain subscriptions.
    pub fn attempt(&self) -> u32 {
        self.delivery.as_ref().map_or(1, |d| d.attempt)
    }
}

impl From<BrokerMessage> for ReceivedMessage {
    fn from(message: BrokerMessage) -> Self {
        Self {
            subject: message.subject,
            payload: message.payload,
            delivery: None,
        }
    }
}

impl From<&Delivery> for ReceivedMessage {
    fn from(delivery: &Delivery) -> Self {
        Self {
            subject: delivery.subject.clone(),
            payload: delivery.payload.clone(),
            delivery: Some(DeliveryInfo {
                stream: delivery.stream.clone(),
                consumer: delivery.consumer.clone(),
                attempt: delivery.attempt,
            }),
        }
    }
}
