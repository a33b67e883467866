//! In-process broker.
//!
//! Behaves like a JetStream server living inside the process: streams with
//! retention and a dedup window, durable pull consumers with ack/nak and
//! ack-wait redelivery, plain subscriptions and queue groups. It backs
//! single-process deployments and is the test double for the event bus.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::broker::Broker;
use super::subject::{subject_matches, validate_pattern, validate_subject};
use super::types::{
    BrokerMessage, ConsumerConfig, Delivery, DiscardPolicy, PublishAck, StreamConfig, StreamInfo,
};
use crate::error::{Error, Result};

const DEFAULT_SUBSCRIPTION_BUFFER: usize = 1024;

struct Stored {
    seq: u64,
    subject: String,
    payload: Vec<u8>,
    stored_at: Instant,
}

struct Pending {
    attempt: u32,
    due_at: Instant,
}

struct ConsumerState {
    config: ConsumerConfig,
    next_seq: u64,
    pending: BTreeMap<u64, Pending>,
}

impl ConsumerState {
    fn is_terminal(&self, attempt: u32) -> bool {
        self.config.max_deliver > 0 && attempt >= self.config.max_deliver
    }
}

struct StreamState {
    config: StreamConfig,
    last_seq: u64,
    messages: VecDeque<Stored>,
    dedup: HashMap<String, (u64, Instant)>,
    consumers: HashMap<String, ConsumerState>,
}

impl StreamState {
    fn new(config: StreamConfig) -> Self {
        Self {
            config,
            last_seq: 0,
            messages: VecDeque::new(),
            dedup: HashMap::new(),
            consumers: HashMap::new(),
        }
    }

    fn captures(&self, subject: &str) -> bool {
        self.config
            .subjects
            .iter()
            .any(|pattern| subject_matches(pattern, subject))
    }

    fn expire(&mut self, now: Instant) {
        let max_age = self.config.max_age;
        if !max_age.is_zero() {
            while self
                .messages
                .front()
                .is_some_and(|m| now.duration_since(m.stored_at) > max_age)
            {
                self.messages.pop_front();
            }
        }
        let window = self.config.duplicate_window;
        self.dedup
            .retain(|_, (_, seen_at)| now.duration_since(*seen_at) <= window);
    }
}

struct Subscription {
    id: u64,
    pattern: String,
    group: Option<String>,
    tx: mpsc::Sender<BrokerMessage>,
}

#[derive(Default)]
struct State {
    streams: BTreeMap<String, StreamState>,
    subscriptions: Vec<Subscription>,
    round_robin: HashMap<String, usize>,
}

struct Inner {
    state: Mutex<State>,
    notify: Notify,
    connected: AtomicBool,
    next_sub_id: AtomicU64,
    subscription_buffer: usize,
}

/// In-process broker. Clones share the same streams and consumers.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIPTION_BUFFER)
    }
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl MemoryBroker {
    /// Create a broker whose plain subscriptions buffer up to
    /// `subscription_buffer` messages each.
    pub fn new(subscription_buffer: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                notify: Notify::new(),
                connected: AtomicBool::new(true),
                next_sub_id: AtomicU64::new(1),
                subscription_buffer: subscription_buffer.max(1),
            }),
        }
    }

    /// Simulate a connection outage or recovery.
    ///
    /// Going down drops every plain subscription, like a server restart would.
    pub fn set_connected(&self, connected: bool) {
        let was = self.inner.connected.swap(connected, Ordering::SeqCst);
        if was && !connected {
            warn!(broker = "memory", "Broker connection lost");
            self.lock().subscriptions.clear();
        } else if !was && connected {
            info!(broker = "memory", "Broker connection restored");
        }
        self.inner.notify.notify_waiters();
    }

    /// Number of plain subscriptions currently attached.
    pub fn subscription_count(&self) -> usize {
        self.lock().subscriptions.len()
    }

    /// Unacknowledged deliveries held for a durable consumer.
    pub fn pending_count(&self, stream: &str, durable: &str) -> usize {
        self.lock()
            .streams
            .get(stream)
            .and_then(|s| s.consumers.get(durable))
            .map_or(0, |c| c.pending.len())
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(Error::Disconnected)
        }
    }

    fn fan_out(state: &mut State, subject: &str, payload: &[u8]) {
        state.subscriptions.retain(|s| !s.tx.is_closed());

        let mut groups: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for (index, sub) in state.subscriptions.iter().enumerate() {
            if !subject_matches(&sub.pattern, subject) {
                continue;
            }
            match &sub.group {
                None => Self::offer(sub, subject, payload),
                Some(group) => groups.entry(group.as_str()).or_default().push(index),
            }
        }

        for (group, members) in groups {
            let counter = state.round_robin.entry(group.to_string()).or_insert(0);
            let sub = &state.subscriptions[members[*counter % members.len()]];
            *counter = counter.wrapping_add(1);
            Self::offer(sub, subject, payload);
        }
    }

    fn offer(sub: &Subscription, subject: &str, payload: &[u8]) {
        let message = BrokerMessage {
            subject: subject.to_string(),
            payload: payload.to_vec(),
        };
        if sub.tx.try_send(message).is_err() {
            warn!(
                broker = "memory",
                subscription = sub.id,
                subject = %subject,
                "Subscriber buffer full, dropping message"
            );
        }
    }

    /// Collect ready deliveries, or the instant the next redelivery falls due.
    fn collect(
        &self,
        stream_name: &str,
        durable: &str,
        batch: usize,
    ) -> Result<(Vec<Delivery>, Option<Instant>)> {
        let now = Instant::now();
        let mut state = self.lock();
        let stream = state
            .streams
            .get_mut(stream_name)
            .ok_or_else(|| Error::StreamNotFound(stream_name.to_string()))?;
        stream.expire(now);

        let StreamState {
            messages,
            consumers,
            ..
        } = stream;
        let consumer = consumers
            .get_mut(durable)
            .ok_or_else(|| Error::ConsumerNotFound {
                stream: stream_name.to_string(),
                durable: durable.to_string(),
            })?;

        let lookup = |seq: u64| {
            let index = messages.partition_point(|m| m.seq < seq);
            messages.get(index).filter(|m| m.seq == seq)
        };

        let mut deliveries = Vec::new();
        let mut terminal = Vec::new();
        let mut next_due: Option<Instant> = None;

        let ack_wait = consumer.config.ack_wait;
        let max_deliver = consumer.config.max_deliver;
        for (seq, pending) in consumer.pending.iter_mut() {
            if pending.due_at > now {
                next_due = Some(next_due.map_or(pending.due_at, |d| d.min(pending.due_at)));
                continue;
            }
            let Some(stored) = lookup(*seq) else {
                terminal.push((*seq, false));
                continue;
            };
            if max_deliver > 0 && pending.attempt >= max_deliver {
                terminal.push((*seq, true));
                continue;
            }
            if deliveries.len() >= batch {
                continue;
            }
            pending.attempt += 1;
            pending.due_at = now + ack_wait;
            deliveries.push(Delivery {
                stream: stream_name.to_string(),
                consumer: durable.to_string(),
                id: seq.to_string(),
                subject: stored.subject.clone(),
                payload: stored.payload.clone(),
                attempt: pending.attempt,
            });
        }

        for (seq, exhausted) in terminal {
            if let Some(pending) = consumer.pending.remove(&seq) {
                if exhausted {
                    error!(
                        stream = %stream_name,
                        consumer = %durable,
                        seq,
                        attempts = pending.attempt,
                        "Delivery exhausted max attempts, giving up"
                    );
                } else {
                    debug!(stream = %stream_name, consumer = %durable, seq, "Pending message aged out of stream");
                }
            }
        }

        let start = messages.partition_point(|m| m.seq < consumer.next_seq);
        for stored in messages.iter().skip(start) {
            if deliveries.len() >= batch {
                break;
            }
            consumer.next_seq = stored.seq + 1;
            if !subject_matches(&consumer.config.filter_subject, &stored.subject) {
                continue;
            }
            consumer.pending.insert(
                stored.seq,
                Pending {
                    attempt: 1,
                    due_at: now + ack_wait,
                },
            );
            next_due = Some(next_due.map_or(now + ack_wait, |d| d.min(now + ack_wait)));
            deliveries.push(Delivery {
                stream: stream_name.to_string(),
                consumer: durable.to_string(),
                id: stored.seq.to_string(),
                subject: stored.subject.clone(),
                payload: stored.payload.clone(),
                attempt: 1,
            });
        }

        Ok((deliveries, next_due))
    }

    fn with_consumer<T>(
        &self,
        delivery: &Delivery,
        f: impl FnOnce(&mut ConsumerState, u64) -> T,
    ) -> Result<T> {
        let seq: u64 = delivery
            .id
            .parse()
            .map_err(|_| Error::Broker(format!("invalid delivery id: {}", delivery.id)))?;
        let mut state = self.lock();
        let consumer = state
            .streams
            .get_mut(&delivery.stream)
            .ok_or_else(|| Error::StreamNotFound(delivery.stream.clone()))?
            .consumers
            .get_mut(&delivery.consumer)
            .ok_or_else(|| Error::ConsumerNotFound {
                stream: delivery.stream.clone(),
                durable: delivery.consumer.clone(),
            })?;
        Ok(f(consumer, seq))
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn name(&self) -> &str {
        "memory"
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    async fn ensure_stream(&self, config: &StreamConfig) -> Result<bool> {
        self.ensure_connected()?;
        if config.name.is_empty() {
            return Err(Error::Broker("stream name is empty".to_string()));
        }
        for pattern in &config.subjects {
            validate_pattern(pattern)?;
        }

        let mut state = self.lock();
        if state.streams.contains_key(&config.name) {
            return Ok(false);
        }
        state
            .streams
            .insert(config.name.clone(), StreamState::new(config.clone()));
        info!(stream = %config.name, subjects = ?config.subjects, "Stream created");
        Ok(true)
    }

    async fn stream_for_subject(&self, subject: &str) -> Result<Option<String>> {
        let state = self.lock();
        Ok(state
            .streams
            .values()
            .find(|s| s.captures(subject))
            .map(|s| s.config.name.clone()))
    }

    async fn stream_info(&self, stream: &str) -> Result<StreamInfo> {
        let now = Instant::now();
        let mut state = self.lock();
        let s = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| Error::StreamNotFound(stream.to_string()))?;
        s.expire(now);
        Ok(StreamInfo {
            name: s.config.name.clone(),
            subjects: s.config.subjects.clone(),
            messages: s.messages.len() as u64,
        })
    }

    async fn publish(
        &self,
        subject: &str,
        payload: Vec<u8>,
        msg_id: Option<&str>,
    ) -> Result<PublishAck> {
        self.ensure_connected()?;
        validate_subject(subject)?;

        let now = Instant::now();
        let mut state = self.lock();
        let mut ack = PublishAck::unstored();

        if let Some(stream) = state.streams.values_mut().find(|s| s.captures(subject)) {
            stream.expire(now);
            ack.stream = Some(stream.config.name.clone());

            if let Some((seq, _)) = msg_id.and_then(|id| stream.dedup.get(id)) {
                debug!(stream = %stream.config.name, subject = %subject, seq, "Duplicate publish merged");
                ack.id = Some(seq.to_string());
                ack.duplicate = true;
                return Ok(ack);
            }

            let limit = stream.config.max_messages;
            if limit > 0 && stream.messages.len() as u64 >= limit {
                match stream.config.discard {
                    DiscardPolicy::Old => {
                        stream.messages.pop_front();
                    }
                    DiscardPolicy::New => {
                        return Err(Error::Broker(format!(
                            "stream {} is full",
                            stream.config.name
                        )));
                    }
                }
            }

            stream.last_seq += 1;
            let seq = stream.last_seq;
            stream.messages.push_back(Stored {
                seq,
                subject: subject.to_string(),
                payload: payload.clone(),
                stored_at: now,
            });
            if let Some(id) = msg_id {
                stream.dedup.insert(id.to_string(), (seq, now));
            }
            ack.id = Some(seq.to_string());
        }

        Self::fan_out(&mut state, subject, &payload);
        drop(state);

        if ack.stream.is_some() {
            self.inner.notify.notify_waiters();
        }
        Ok(ack)
    }

    async fn subscribe(
        &self,
        pattern: &str,
        queue_group: Option<&str>,
    ) -> Result<mpsc::Receiver<BrokerMessage>> {
        self.ensure_connected()?;
        validate_pattern(pattern)?;

        let (tx, rx) = mpsc::channel(self.inner.subscription_buffer);
        let id = self.inner.next_sub_id.fetch_add(1, Ordering::Relaxed);
        self.lock().subscriptions.push(Subscription {
            id,
            pattern: pattern.to_string(),
            group: queue_group.map(str::to_string),
            tx,
        });
        debug!(broker = "memory", subscription = id, pattern = %pattern, group = ?queue_group, "Subscribed");
        Ok(rx)
    }

    async fn ensure_consumer(&self, stream: &str, config: &ConsumerConfig) -> Result<bool> {
        self.ensure_connected()?;
        validate_pattern(&config.filter_subject)?;

        let mut state = self.lock();
        let s = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| Error::StreamNotFound(stream.to_string()))?;
        if let Some(existing) = s.consumers.get_mut(&config.durable_name) {
            // Filter and redelivery settings follow the latest binding; the cursor is kept.
            if existing.config.filter_subject != config.filter_subject {
                info!(
                    stream = %stream,
                    consumer = %config.durable_name,
                    from = %existing.config.filter_subject,
                    to = %config.filter_subject,
                    "Durable consumer filter changed"
                );
                existing.config.filter_subject = config.filter_subject.clone();
            }
            existing.config.ack_wait = config.ack_wait;
            existing.config.max_deliver = config.max_deliver;
            existing.config.backoff = config.backoff.clone();
            return Ok(false);
        }
        let first = s.messages.front().map_or(s.last_seq + 1, |m| m.seq);
        s.consumers.insert(
            config.durable_name.clone(),
            ConsumerState {
                config: config.clone(),
                next_seq: first,
                pending: BTreeMap::new(),
            },
        );
        info!(stream = %stream, consumer = %config.durable_name, filter = %config.filter_subject, "Durable consumer created");
        Ok(true)
    }

    async fn fetch(
        &self,
        stream: &str,
        durable: &str,
        batch: usize,
        wait: Duration,
    ) -> Result<Vec<Delivery>> {
        let deadline = Instant::now() + wait;
        let batch = batch.max(1);
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.ensure_connected()?;
            let (deliveries, next_due) = self.collect(stream, durable, batch)?;
            if !deliveries.is_empty() {
                return Ok(deliveries);
            }
            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }

            let wake = next_due.map_or(deadline, |due| due.min(deadline));
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.ensure_connected()?;
        self.with_consumer(delivery, |consumer, seq| {
            consumer.pending.remove(&seq);
        })
    }

    async fn nak(&self, delivery: &Delivery, delay: Duration) -> Result<()> {
        self.ensure_connected()?;
        self.with_consumer(delivery, |consumer, seq| {
            let terminal = consumer.is_terminal(delivery.attempt);
            let Some(pending) = consumer.pending.get_mut(&seq) else {
                return;
            };
            if pending.attempt != delivery.attempt {
                // Already redelivered after an ack-wait expiry.
                return;
            }
            if terminal {
                consumer.pending.remove(&seq);
                error!(
                    stream = %delivery.stream,
                    consumer = %delivery.consumer,
                    subject = %delivery.subject,
                    seq,
                    attempts = delivery.attempt,
                    "Delivery exhausted max attempts, giving up"
                );
            } else {
                pending.due_at = Instant::now() + delay;
            }
        })?;
        self.inner.notify.notify_waiters();
        Ok(())
    }

    async fn release(&self, delivery: &Delivery) -> Result<()> {
        self.ensure_connected()?;
        self.with_consumer(delivery, |consumer, seq| {
            if let Some(pending) = consumer.pending.get_mut(&seq) {
                if pending.attempt == delivery.attempt {
                    pending.attempt -= 1;
                    pending.due_at = Instant::now();
                }
            }
        })?;
        self.inner.notify.notify_waiters();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let dropped = {
            let mut state = self.lock();
            let count = state.subscriptions.len();
            state.subscriptions.clear();
            count
        };
        self.inner.notify.notify_waiters();
        debug!(broker = "memory", subscriptions = dropped, "Broker client closed");
        Ok(())
    }
}
