use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use serde::Serialize;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use super::broker::Broker;
use super::subject::{validate_pattern, validate_subject, Domain};
use super::types::{BrokerMessage, ConsumerConfig, Delivery, Event, PublishAck, ReceivedMessage, StreamConfig};
use super::EventBusConfig;
use crate::error::{Error, Result};
use crate::utils::RetryConfig;

/// Handler invoked once per delivered message.
///
/// For durable subscriptions `Ok` acks the delivery and `Err` naks it.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// Process one message.
    async fn handle(&self, message: ReceivedMessage) -> Result<()>;
}

#[async_trait]
impl<F, Fut> EventHandler for F
where
    F: Fn(ReceivedMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, message: ReceivedMessage) -> Result<()> {
        (self)(message).await
    }
}

/// Subscription identity, unique per bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// How a subscription receives messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionKind {
    /// Every subscriber gets every message
    Plain,
    /// One member of the group gets each message
    Queue(String),
    /// Named cursor over a stream with ack/nak
    Durable {
        /// Stream name
        stream: String,
        /// Durable consumer name
        durable: String,
    },
}

struct SubscriptionEntry {
    pattern: String,
    kind: SubscriptionKind,
    cancel: CancellationToken,
}

type Subscriptions = Arc<DashMap<SubscriptionId, SubscriptionEntry>>;

/// Durable publish/subscribe client.
pub struct EventBus {
    broker: Arc<dyn Broker>,
    config: EventBusConfig,
    subscriptions: Subscriptions,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    draining: AtomicBool,
    next_id: AtomicU64,
    span: Span,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("broker", &self.broker.name())
            .field("subscriptions", &self.subscriptions.len())
            .field("draining", &self.is_draining())
            .finish()
    }
}

impl EventBus {
    /// Create a bus on top of a connected broker.
    pub fn new(broker: Arc<dyn Broker>, config: EventBusConfig) -> Self {
        let span = info_span!("event_bus", broker = broker.name());
        Self {
            broker,
            config,
            subscriptions: Arc::new(DashMap::new()),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            draining: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            span,
        }
    }

    /// Use `span` as the parent of every subscription loop.
    #[must_use]
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Underlying broker.
    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Bus configuration.
    pub fn config(&self) -> &EventBusConfig {
        &self.config
    }

    /// Whether the broker connection is up.
    pub fn is_connected(&self) -> bool {
        self.broker.is_connected()
    }

    /// Whether [`EventBus::drain`] has started.
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Active subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Kind of an active subscription.
    pub fn subscription_kind(&self, id: SubscriptionId) -> Option<SubscriptionKind> {
        self.subscriptions.get(&id).map(|entry| entry.kind.clone())
    }

    fn accepting(&self) -> Result<()> {
        if self.is_draining() {
            Err(Error::Draining)
        } else {
            Ok(())
        }
    }

    /// Ensure a stream exists for every domain. Returns how many were created.
    pub async fn provision_streams(&self) -> Result<usize> {
        let mut created = 0;
        for domain in Domain::ALL {
            let stream = StreamConfig::for_domain(domain, &self.config);
            if self.broker.ensure_stream(&stream).await? {
                created += 1;
            } else {
                debug!(stream = %stream.name, "Stream already exists");
            }
        }
        info!(created, total = Domain::ALL.len(), "Streams provisioned");
        Ok(created)
    }

    /// Serialize `payload` as JSON and publish it.
    ///
    /// Returns once the broker acknowledged; for stream subjects that means
    /// the message is stored.
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        subject: &str,
        payload: &T,
    ) -> Result<PublishAck> {
        self.publish_raw(subject, serde_json::to_vec(payload)?, None)
            .await
    }

    /// Publish an event using its id as the dedup key.
    pub async fn publish_event(&self, event: &Event) -> Result<PublishAck> {
        self.publish_raw(&event.subject, serde_json::to_vec(event)?, Some(&event.id))
            .await
    }

    async fn publish_raw(
        &self,
        subject: &str,
        payload: Vec<u8>,
        msg_id: Option<&str>,
    ) -> Result<PublishAck> {
        self.accepting()?;
        validate_subject(subject)?;
        let ack = self.broker.publish(subject, payload, msg_id).await?;
        if ack.duplicate {
            debug!(subject = %subject, msg_id = ?msg_id, "Duplicate publish merged by broker");
        } else {
            debug!(subject = %subject, stream = ?ack.stream, id = ?ack.id, "Published");
        }
        Ok(ack)
    }

    /// Deliver every message matching `pattern` to `handler`.
    pub async fn subscribe<H: EventHandler>(
        &self,
        pattern: &str,
        handler: H,
    ) -> Result<SubscriptionId> {
        self.subscribe_plain(pattern, None, Arc::new(handler)).await
    }

    /// Balance messages matching `pattern` across the members of `group`.
    pub async fn queue_subscribe<H: EventHandler>(
        &self,
        pattern: &str,
        group: &str,
        handler: H,
    ) -> Result<SubscriptionId> {
        if group.is_empty() {
            return Err(Error::Broker("queue group name is empty".to_string()));
        }
        self.subscribe_plain(pattern, Some(group.to_string()), Arc::new(handler))
            .await
    }

    async fn subscribe_plain(
        &self,
        pattern: &str,
        group: Option<String>,
        handler: Arc<dyn EventHandler>,
    ) -> Result<SubscriptionId> {
        self.accepting()?;
        validate_pattern(pattern)?;
        let rx = self.broker.subscribe(pattern, group.as_deref()).await?;

        let kind = match &group {
            Some(group) => SubscriptionKind::Queue(group.clone()),
            None => SubscriptionKind::Plain,
        };
        let (id, cancel) = self.register(pattern, kind);
        let span = info_span!(parent: &self.span, "subscription", %id, pattern = %pattern, group = ?group);

        let worker = PlainWorker {
            id,
            broker: self.broker.clone(),
            pattern: pattern.to_string(),
            group,
            handler,
            cancel,
            backoff: self.config.reconnect_backoff(),
            subscriptions: self.subscriptions.clone(),
        };
        self.tracker.spawn(worker.run(rx).instrument(span));
        info!(%id, pattern = %pattern, "Subscribed");
        Ok(id)
    }

    /// Bind a durable consumer to the stream capturing `filter` and feed its
    /// deliveries to `handler`.
    ///
    /// The consumer cursor is keyed by `durable`; a later subscription with the
    /// same name, in this process or another, resumes where it left off.
    pub async fn subscribe_durable<H: EventHandler>(
        &self,
        durable: &str,
        filter: &str,
        handler: H,
    ) -> Result<SubscriptionId> {
        self.accepting()?;
        validate_pattern(filter)?;
        if durable.is_empty() || durable.contains(['.', '*', '>']) {
            return Err(Error::Broker(format!("invalid durable name: {durable:?}")));
        }
        let stream = Domain::from_subject(filter)
            .map(|d| d.stream_name())
            .ok_or_else(|| Error::StreamNotFound(filter.to_string()))?;

        let consumer = ConsumerConfig::new(durable, filter, &self.config);
        if self.broker.ensure_consumer(&stream, &consumer).await? {
            debug!(stream = %stream, durable = %durable, "Durable consumer created");
        }

        let kind = SubscriptionKind::Durable {
            stream: stream.clone(),
            durable: durable.to_string(),
        };
        let (id, cancel) = self.register(filter, kind);
        let span = info_span!(parent: &self.span, "durable", %id, stream = %stream, durable = %durable);

        let worker = DurableWorker {
            id,
            broker: self.broker.clone(),
            stream,
            consumer,
            handler: Arc::new(handler),
            cancel,
            batch: self.config.fetch_batch,
            wait: self.config.fetch_wait(),
            backoff: self.config.reconnect_backoff(),
            subscriptions: self.subscriptions.clone(),
        };
        self.tracker.spawn(worker.run().instrument(span));
        info!(%id, durable = %durable, filter = %filter, "Durable subscription started");
        Ok(id)
    }

    fn register(&self, pattern: &str, kind: SubscriptionKind) -> (SubscriptionId, CancellationToken) {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let cancel = self.shutdown.child_token();
        self.subscriptions.insert(
            id,
            SubscriptionEntry {
                pattern: pattern.to_string(),
                kind,
                cancel: cancel.clone(),
            },
        );
        (id, cancel)
    }

    /// Stop a subscription. An in-flight handler call finishes first.
    ///
    /// Returns `false` if the id is unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        match self.subscriptions.remove(&id) {
            Some((_, entry)) => {
                entry.cancel.cancel();
                info!(%id, pattern = %entry.pattern, "Unsubscribed");
                true
            }
            None => false,
        }
    }

    /// Stop accepting work, let in-flight handlers finish within `timeout`,
    /// then close the broker client.
    ///
    /// Returns [`Error::Timeout`] if handlers were still running at the deadline.
    pub async fn drain(&self, timeout: Duration) -> Result<()> {
        if self.draining.swap(true, Ordering::SeqCst) {
            debug!("Drain already in progress");
        }
        info!(subscriptions = self.subscriptions.len(), "Draining event bus");

        self.shutdown.cancel();
        self.subscriptions.clear();
        self.tracker.close();

        let finished = tokio::time::timeout(timeout, self.tracker.wait()).await.is_ok();
        if !finished {
            warn!(timeout_ms = timeout.as_millis() as u64, "Handlers still running at drain deadline");
        }

        if let Err(e) = self.broker.close().await {
            warn!(error = %e, "Broker close failed");
        }
        info!("Event bus drained");

        if finished {
            Ok(())
        } else {
            Err(Error::Timeout("event bus drain".to_string()))
        }
    }
}

async fn invoke(handler: &dyn EventHandler, message: ReceivedMessage) -> Result<()> {
    match AssertUnwindSafe(handler.handle(message)).catch_unwind().await {
        Ok(result) => result,
        Err(_) => Err(Error::Handler("handler panicked".to_string())),
    }
}

/// Sleep for `delay` unless cancelled first. Returns `false` when cancelled.
async fn pause(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

struct PlainWorker {
    id: SubscriptionId,
    broker: Arc<dyn Broker>,
    pattern: String,
    group: Option<String>,
    handler: Arc<dyn EventHandler>,
    cancel: CancellationToken,
    backoff: RetryConfig,
    subscriptions: Subscriptions,
}

impl PlainWorker {
    async fn run(self, mut rx: mpsc::Receiver<BrokerMessage>) {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                next = rx.recv() => next,
            };
            match next {
                Some(message) => {
                    let subject = message.subject.clone();
                    if let Err(e) = invoke(self.handler.as_ref(), message.into()).await {
                        warn!(subject = %subject, error = %e, "Handler failed");
                    }
                }
                None => match self.resubscribe().await {
                    Some(new_rx) => rx = new_rx,
                    None => break,
                },
            }
        }
        self.subscriptions.remove(&self.id);
        debug!("Subscription loop stopped");
    }

    async fn resubscribe(&self) -> Option<mpsc::Receiver<BrokerMessage>> {
        warn!("Subscription dropped by broker, resubscribing");
        let mut attempt = 0;
        loop {
            attempt += 1;
            if !pause(&self.cancel, self.backoff.delay_for(attempt)).await {
                return None;
            }
            match self
                .broker
                .subscribe(&self.pattern, self.group.as_deref())
                .await
            {
                Ok(rx) => {
                    info!(attempt, "Resubscribed");
                    return Some(rx);
                }
                Err(e) if self.backoff.allows(attempt) => {
                    debug!(attempt, error = %e, "Resubscribe failed");
                }
                Err(e) => {
                    error!(attempt, error = %e, "Giving up on subscription");
                    return None;
                }
            }
        }
    }
}

struct DurableWorker {
    id: SubscriptionId,
    broker: Arc<dyn Broker>,
    stream: String,
    consumer: ConsumerConfig,
    handler: Arc<dyn EventHandler>,
    cancel: CancellationToken,
    batch: usize,
    wait: Duration,
    backoff: RetryConfig,
    subscriptions: Subscriptions,
}

impl DurableWorker {
    async fn run(self) {
        let durable = self.consumer.durable_name.as_str();
        let mut failures = 0;
        while !self.cancel.is_cancelled() {
            // Not raced against cancellation: whatever a fetch claims is
            // either processed or released below.
            let fetched = self
                .broker
                .fetch(&self.stream, durable, self.batch, self.wait)
                .await;
            match fetched {
                Ok(deliveries) => {
                    if failures > 0 {
                        info!(failures, "Durable fetch recovered");
                        failures = 0;
                    }
                    for delivery in deliveries {
                        if self.cancel.is_cancelled() {
                            self.release(&delivery).await;
                        } else {
                            self.process(delivery).await;
                        }
                    }
                }
                Err(e) => {
                    failures += 1;
                    warn!(failures, error = %e, "Durable fetch failed");
                    if matches!(e, Error::ConsumerNotFound { .. } | Error::StreamNotFound(_)) {
                        self.recreate().await;
                    }
                    if !pause(&self.cancel, self.backoff.delay_for(failures)).await {
                        break;
                    }
                }
            }
        }
        self.subscriptions.remove(&self.id);
        debug!("Durable loop stopped");
    }

    async fn process(&self, delivery: Delivery) {
        let attempt = delivery.attempt;
        let outcome = tokio::time::timeout(
            self.consumer.ack_wait,
            invoke(self.handler.as_ref(), ReceivedMessage::from(&delivery)),
        )
        .await
        .unwrap_or_else(|_| Err(Error::Timeout(format!("handler exceeded {:?}", self.consumer.ack_wait))));

        match outcome {
            Ok(()) => {
                if let Err(e) = self.broker.ack(&delivery).await {
                    warn!(subject = %delivery.subject, id = %delivery.id, error = %e, "Ack failed");
                }
            }
            Err(cause) => {
                let terminal = self.consumer.max_deliver > 0 && attempt >= self.consumer.max_deliver;
                if terminal {
                    error!(
                        subject = %delivery.subject,
                        id = %delivery.id,
                        attempt,
                        error = %cause,
                        "Handler failed on final delivery attempt"
                    );
                } else {
                    warn!(
                        subject = %delivery.subject,
                        id = %delivery.id,
                        attempt,
                        max_deliver = self.consumer.max_deliver,
                        error = %cause,
                        "Handler failed, requesting redelivery"
                    );
                }
                let delay = self.consumer.backoff_for(attempt);
                if let Err(e) = self.broker.nak(&delivery, delay).await {
                    warn!(id = %delivery.id, error = %e, "Nak failed; redelivery falls back to ack wait");
                }
            }
        }
    }

    /// Hand a fetched but unprocessed delivery back without spending its attempt.
    async fn release(&self, delivery: &Delivery) {
        match self.broker.release(delivery).await {
            Ok(()) => debug!(id = %delivery.id, attempt = delivery.attempt, "Delivery released"),
            Err(e) => warn!(id = %delivery.id, error = %e, "Release failed"),
        }
    }

    async fn recreate(&self) {
        match self.broker.ensure_consumer(&self.stream, &self.consumer).await {
            Ok(true) => info!("Durable consumer recreated"),
            Ok(false) => {}
            Err(e) => debug!(error = %e, "Durable consumer not recreated"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_id_display() {
        assert_eq!(SubscriptionId(7).to_string(), "sub-7");
    }

    #[tokio::test]
    async fn test_closure_handler() {
        let handler = |message: ReceivedMessage| async move {
            if message.subject.ends_with("bad") {
                Err(Error::handler("rejected"))
            } else {
                Ok(())
            }
        };
        let ok = ReceivedMessage {
            subject: "krustron.audit.u1.good".to_string(),
            payload: Vec::new(),
            delivery: None,
        };
        let bad = ReceivedMessage {
            subject: "krustron.audit.u1.bad".to_string(),
            ..ok.clone()
        };
        assert!(invoke(&handler, ok).await.is_ok());
        assert!(matches!(invoke(&handler, bad).await, Err(Error::Handler(_))));
    }

    #[tokio::test]
    async fn test_panicking_handler_becomes_error() {
        let handler = |_message: ReceivedMessage| async move {
            if true {
                panic!("boom");
            }
            Ok::<(), Error>(())
        };
        let message = ReceivedMessage {
            subject: "krustron.alert.a1.raised".to_string(),
            payload: Vec::new(),
            delivery: None,
        };
        assert!(matches!(invoke(&handler, message).await, Err(Error::Handler(_))));
    }
}
