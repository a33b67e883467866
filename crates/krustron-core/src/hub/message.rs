use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::Result;

/// Frame type tag carried in the `type` field of every live message.
///
/// Unknown tags are kept verbatim in [`MessageType::Custom`] so they can be
/// handed to the application hook instead of being rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    /// Connection acknowledged by the hub
    Connect,
    /// Connection is going away
    Disconnect,
    /// Client keepalive
    Ping,
    /// Reply to a client keepalive
    Pong,
    /// Error notification
    Error,
    /// Client joins a channel
    Subscribe,
    /// Client leaves a channel
    Unsubscribe,
    /// `cluster.status`
    ClusterStatus,
    /// `cluster.health`
    ClusterHealth,
    /// `cluster.metrics`
    ClusterMetrics,
    /// `application.status`
    ApplicationStatus,
    /// `application.sync`
    ApplicationSync,
    /// `pipeline.status`
    PipelineStatus,
    /// `pipeline.log`
    PipelineLog,
    /// `pod.status`
    PodStatus,
    /// `pod.logs`
    PodLogs,
    /// `alert`
    Alert,
    /// `cost.update`
    CostUpdate,
    /// Any other tag
    Custom(String),
}

impl MessageType {
    /// Wire representation of the tag.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Error => "error",
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::ClusterStatus => "cluster.status",
            Self::ClusterHealth => "cluster.health",
            Self::ClusterMetrics => "cluster.metrics",
            Self::ApplicationStatus => "application.status",
            Self::ApplicationSync => "application.sync",
            Self::PipelineStatus => "pipeline.status",
            Self::PipelineLog => "pipeline.log",
            Self::PodStatus => "pod.status",
            Self::PodLogs => "pod.logs",
            Self::Alert => "alert",
            Self::CostUpdate => "cost.update",
            Self::Custom(tag) => tag,
        }
    }

    /// Client-initiated control frames the reader handles itself.
    #[must_use]
    pub fn is_control(&self) -> bool {
        matches!(self, Self::Ping | Self::Subscribe | Self::Unsubscribe)
    }
}

impl From<&str> for MessageType {
    fn from(tag: &str) -> Self {
        match tag {
            "connect" => Self::Connect,
            "disconnect" => Self::Disconnect,
            "ping" => Self::Ping,
            "pong" => Self::Pong,
            "error" => Self::Error,
            "subscribe" => Self::Subscribe,
            "unsubscribe" => Self::Unsubscribe,
            "cluster.status" => Self::ClusterStatus,
            "cluster.health" => Self::ClusterHealth,
            "cluster.metrics" => Self::ClusterMetrics,
            "application.status" => Self::ApplicationStatus,
            "application.sync" => Self::ApplicationSync,
            "pipeline.status" => Self::PipelineStatus,
            "pipeline.log" => Self::PipelineLog,
            "pod.status" => Self::PodStatus,
            "pod.logs" => Self::PodLogs,
            "alert" => Self::Alert,
            "cost.update" => Self::CostUpdate,
            other => Self::Custom(other.to_string()),
        }
    }
}

impl From<String> for MessageType {
    fn from(tag: String) -> Self {
        Self::from(tag.as_str())
    }
}

impl From<MessageType> for String {
    fn from(kind: MessageType) -> Self {
        match kind {
            MessageType::Custom(tag) => tag,
            other => other.as_str().to_string(),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A live frame: `{id, type, channel?, data?, timestamp, metadata?}`.
///
/// Immutable once handed to the hub; fan-out shares it behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Message identity (generated when absent on inbound frames)
    #[serde(default = "new_message_id")]
    pub id: String,
    /// Frame type tag
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Target channel; `None` means every connection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// Opaque payload
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
    /// Creation time
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// Free-form string metadata
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

fn new_message_id() -> String {
    Uuid::new_v4().to_string()
}

impl Message {
    /// New message with a fresh id and the current timestamp.
    pub fn new(kind: impl Into<MessageType>, data: serde_json::Value) -> Self {
        Self {
            id: new_message_id(),
            kind: kind.into(),
            channel: None,
            data,
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    /// Scope the message to one channel.
    #[must_use]
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    /// Attach a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Connect acknowledgment sent on registration.
    pub fn connect_ack(client_id: &str, user_id: &str) -> Self {
        Self::new(
            MessageType::Connect,
            serde_json::json!({ "client_id": client_id, "user_id": user_id }),
        )
    }

    /// Reply to a client ping.
    pub fn pong() -> Self {
        Self::new(MessageType::Pong, serde_json::Value::Null)
    }

    /// Error frame addressed to one client.
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(
            MessageType::Error,
            serde_json::json!({ "message": message.into() }),
        )
    }

    /// Channel named by a `subscribe`/`unsubscribe` frame.
    ///
    /// Clients send `{"type":"subscribe","data":{"channel":"..."}}`; a top-level
    /// `channel` is accepted as a fallback.
    pub fn control_channel(&self) -> Option<&str> {
        self.data
            .get("channel")
            .and_then(|v| v.as_str())
            .or(self.channel.as_deref())
            .filter(|c| !c.is_empty())
    }

    /// Parse a text frame.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Encode as a text frame.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
