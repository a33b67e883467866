//! Broker abstraction behind the event bus.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

use super::types::{
    BrokerMessage, ConsumerConfig, Delivery, PublishAck, StreamConfig, StreamInfo,
};
use crate::error::Result;

/// Subject-routed message broker with durable streams.
///
/// Implementations must store a publish durably before returning `Ok` when a
/// stream captures the subject, and must fail fast with
/// [`Error::Disconnected`](crate::Error::Disconnected) while the connection
/// is down.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    /// Whether the broker connection is currently up.
    fn is_connected(&self) -> bool;

    /// Create the stream if absent. Returns `true` when it was created.
    async fn ensure_stream(&self, config: &StreamConfig) -> Result<bool>;

    /// Name of the stream capturing a concrete subject.
    async fn stream_for_subject(&self, subject: &str) -> Result<Option<String>>;

    /// Size report for a stream.
    async fn stream_info(&self, stream: &str) -> Result<StreamInfo>;

    /// Publish a payload. `msg_id` is the dedup key inside the stream's window.
    async fn publish(
        &self,
        subject: &str,
        payload: Vec<u8>,
        msg_id: Option<&str>,
    ) -> Result<PublishAck>;

    /// Plain (`queue_group = None`) or load-balanced subscription.
    ///
    /// The receiver closes when the broker drops the subscription, e.g. on
    /// disconnect or [`Broker::close`].
    async fn subscribe(
        &self,
        pattern: &str,
        queue_group: Option<&str>,
    ) -> Result<mpsc::Receiver<BrokerMessage>>;

    /// Create the durable consumer if absent. Returns `true` when it was created.
    async fn ensure_consumer(&self, stream: &str, config: &ConsumerConfig) -> Result<bool>;

    /// Pull up to `batch` deliveries, waiting at most `wait` for the first one.
    ///
    /// Redeliveries (nak'd or past their ack wait) come before new messages.
    async fn fetch(
        &self,
        stream: &str,
        durable: &str,
        batch: usize,
        wait: Duration,
    ) -> Result<Vec<Delivery>>;

    /// Acknowledge a delivery; it will not be redelivered.
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Request redelivery after `delay`.
    async fn nak(&self, delivery: &Delivery, delay: Duration) -> Result<()>;

    /// Return a delivery the handler never saw.
    ///
    /// The attempt it consumed is given back, so a release never exhausts
    /// `max_deliver`, and the message is redelivered on the next fetch.
    async fn release(&self, delivery: &Delivery) -> Result<()>;

    /// Drop this client's plain subscriptions and release connections.
    async fn close(&self) -> Result<()>;
}
