//! Redis Streams broker.
//!
//! Durable streams map onto Redis streams (`krustron:stream:<NAME>`), durable
//! consumers onto consumer groups, and plain subjects onto pub/sub channels.
//! Stream definitions live in the `krustron:streams` hash so every process
//! sees the same subject bindings. Publish dedup uses a `SET NX PX` marker per
//! message id that expires with the stream's dedup window.
//!
//! Redelivery follows the consumer group's pending list: entries idle longer
//! than the ack wait are claimed again, and a nak rewinds an entry's idle
//! time so it becomes claimable after the requested delay.
//!
//! Queue groups read through consumer groups on every stream their pattern
//! overlaps. Subjects outside all streams are also appended to a capped
//! transient stream so groups can balance those too.

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadReply};
use redis::FromRedisValue;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::broker::Broker;
use super::subject::{patterns_overlap, subject_matches, validate_pattern, validate_subject};
use super::types::{
    BrokerMessage, ConsumerConfig, Delivery, DiscardPolicy, PublishAck, StreamConfig, StreamInfo,
};
use super::EventBusConfig;
use crate::error::{Error, Result};
use crate::utils::{retry_with_backoff, RetryConfig};

const KEY_PREFIX: &str = "krustron";
const STREAMS_KEY: &str = "krustron:streams";
const POLL_INTERVAL: Duration = Duration::from_millis(100);
const QUEUE_BATCH: usize = 32;
/// Capped feed of subjects no stream captures, read only by queue groups.
const TRANSIENT_KEY: &str = "krustron:transient";
const TRANSIENT_MAX_LEN: u64 = 10_000;

pub(crate) fn stream_key(stream: &str) -> String {
    format!("{KEY_PREFIX}:stream:{stream}")
}

pub(crate) fn dedup_key(stream: &str, msg_id: &str) -> String {
    format!("{KEY_PREFIX}:dedup:{stream}:{msg_id}")
}

/// Redis glob covering a subject pattern. Matches are re-checked exactly.
pub(crate) fn glob_for(pattern: &str) -> String {
    pattern
        .split('.')
        .map(|tok| match tok {
            "*" | ">" => "*".to_string(),
            literal => literal
                .chars()
                .flat_map(|c| match c {
                    '?' | '[' | ']' | '\\' | '*' => vec!['\\', c],
                    c => vec![c],
                })
                .collect(),
        })
        .collect::<Vec<_>>()
        .join(".")
}

/// Idle time to stamp on a nak'd entry so it is reclaimed after `delay`.
pub(crate) fn nak_idle_ms(ack_wait: Duration, delay: Duration) -> u64 {
    ack_wait.saturating_sub(delay).as_millis() as u64
}

/// Delivery counter to restore on a released entry: the attempt is not spent.
pub(crate) fn released_retry_count(attempt: u32) -> u32 {
    attempt.saturating_sub(1)
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

struct Inner {
    client: redis::Client,
    conn: RwLock<Option<MultiplexedConnection>>,
    connected: AtomicBool,
    reconnect: Notify,
    backoff: RetryConfig,
    streams: RwLock<BTreeMap<String, StreamConfig>>,
    consumers: RwLock<HashMap<(String, String), ConsumerConfig>>,
    consumer_name: String,
    subscription_buffer: usize,
    next_sub_id: AtomicU64,
    cancel: CancellationToken,
}

/// Broker backed by Redis Streams and pub/sub.
#[derive(Clone)]
pub struct RedisBroker {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBroker")
            .field("consumer", &self.inner.consumer_name)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl RedisBroker {
    /// Connect with bounded backoff and start connection supervision.
    ///
    /// # Errors
    ///
    /// Returns error if the URL is invalid or no connection could be made
    /// within the reconnect budget.
    pub async fn connect(config: &EventBusConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str())?;
        let backoff = config.reconnect_backoff();

        let conn = retry_with_backoff(
            &backoff,
            || client.get_multiplexed_async_connection(),
            |e: &redis::RedisError| e.is_io_error() || e.is_timeout(),
        )
        .await
        .map_err(|e| Error::Redis(e.last_error))?;

        let consumer_name = format!("krustron-{}", &Uuid::new_v4().simple().to_string()[..8]);
        let broker = Self {
            inner: Arc::new(Inner {
                client,
                conn: RwLock::new(Some(conn)),
                connected: AtomicBool::new(true),
                reconnect: Notify::new(),
                backoff,
                streams: RwLock::new(BTreeMap::new()),
                consumers: RwLock::new(HashMap::new()),
                consumer_name,
                subscription_buffer: config.subscription_buffer.max(1),
                next_sub_id: AtomicU64::new(1),
                cancel: CancellationToken::new(),
            }),
        };
        tokio::spawn(broker.clone().supervise());
        info!(consumer = %broker.inner.consumer_name, "Connected to Redis broker");
        Ok(broker)
    }

    /// Reconnect whenever an operation reports the connection lost.
    async fn supervise(self) {
        let inner = &self.inner;
        loop {
            tokio::select! {
                _ = inner.cancel.cancelled() => break,
                _ = inner.reconnect.notified() => {}
            }
            if inner.connected.load(Ordering::SeqCst) {
                continue;
            }

            let attempt = retry_with_backoff(
                &inner.backoff,
                || inner.client.get_multiplexed_async_connection(),
                |_| true,
            );
            let result = tokio::select! {
                _ = inner.cancel.cancelled() => break,
                result = attempt => result,
            };
            match result {
                Ok(conn) => {
                    *write_lock(&inner.conn) = Some(conn);
                    inner.connected.store(true, Ordering::SeqCst);
                    info!("Redis broker reconnected");
                }
                Err(e) => {
                    error!(
                        attempts = e.attempts,
                        error = %e.last_error,
                        "Redis reconnect gave up; operations fail until the next attempt"
                    );
                }
            }
        }
        debug!("Redis supervisor stopped");
    }

    fn connection(&self) -> Result<MultiplexedConnection> {
        if !self.is_connected() {
            self.inner.reconnect.notify_one();
            return Err(Error::Disconnected);
        }
        read_lock(&self.inner.conn)
            .clone()
            .ok_or(Error::Disconnected)
    }

    fn fail(&self, e: redis::RedisError) -> Error {
        if e.is_io_error() || e.is_connection_dropped() {
            if self.inner.connected.swap(false, Ordering::SeqCst) {
                warn!(error = %e, "Redis connection lost");
            }
            self.inner.reconnect.notify_one();
        }
        Error::Redis(e)
    }

    async fn query<T: FromRedisValue>(&self, cmd: &redis::Cmd) -> Result<T> {
        let mut conn = self.connection()?;
        cmd.query_async(&mut conn).await.map_err(|e| self.fail(e))
    }

    async fn load_streams(&self) -> Result<()> {
        let raw: HashMap<String, String> = self.query(redis::cmd("HGETALL").arg(STREAMS_KEY)).await?;
        let mut streams = BTreeMap::new();
        for (name, json) in raw {
            match serde_json::from_str::<StreamConfig>(&json) {
                Ok(config) => {
                    streams.insert(name, config);
                }
                Err(e) => warn!(stream = %name, error = %e, "Skipping unreadable stream definition"),
            }
        }
        *write_lock(&self.inner.streams) = streams;
        Ok(())
    }

    fn cached_stream_for(&self, matches: impl Fn(&str) -> bool) -> Option<String> {
        read_lock(&self.inner.streams)
            .values()
            .find(|s| s.subjects.iter().any(|p| matches(p)))
            .map(|s| s.name.clone())
    }

    async fn stream_config(&self, name: &str) -> Result<StreamConfig> {
        if let Some(config) = read_lock(&self.inner.streams).get(name).cloned() {
            return Ok(config);
        }
        self.load_streams().await?;
        read_lock(&self.inner.streams)
            .get(name)
            .cloned()
            .ok_or_else(|| Error::StreamNotFound(name.to_string()))
    }

    fn consumer_config(&self, stream: &str, durable: &str) -> Result<ConsumerConfig> {
        read_lock(&self.inner.consumers)
            .get(&(stream.to_string(), durable.to_string()))
            .cloned()
            .ok_or_else(|| Error::ConsumerNotFound {
                stream: stream.to_string(),
                durable: durable.to_string(),
            })
    }

    async fn create_group(&self, key: &str, group: &str, start: &str) -> Result<bool> {
        let created = self
            .query::<()>(
                redis::cmd("XGROUP")
                    .arg("CREATE")
                    .arg(key)
                    .arg(group)
                    .arg(start)
                    .arg("MKSTREAM"),
            )
            .await;
        match created {
            Ok(()) => Ok(true),
            Err(Error::Redis(e)) if e.code() == Some("BUSYGROUP") => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn xack(&self, key: &str, group: &str, id: &str) -> Result<()> {
        self.query::<i64>(redis::cmd("XACK").arg(key).arg(group).arg(id))
            .await
            .map(|_| ())
    }

    /// Turn a stream entry into a delivery, acking entries the consumer
    /// should never see.
    async fn to_delivery(
        &self,
        stream: &str,
        consumer: &ConsumerConfig,
        entry: &StreamId,
        attempt: u32,
    ) -> Result<Option<Delivery>> {
        let key = stream_key(stream);
        let group = consumer.durable_name.as_str();
        let (Some(subject), Some(payload)) = (
            entry.get::<String>("subject"),
            entry.get::<Vec<u8>>("payload"),
        ) else {
            warn!(stream = %stream, id = %entry.id, "Dropping malformed stream entry");
            self.xack(&key, group, &entry.id).await?;
            return Ok(None);
        };
        if !subject_matches(&consumer.filter_subject, &subject) {
            self.xack(&key, group, &entry.id).await?;
            return Ok(None);
        }
        Ok(Some(Delivery {
            stream: stream.to_string(),
            consumer: consumer.durable_name.clone(),
            id: entry.id.clone(),
            subject,
            payload,
            attempt,
        }))
    }

    /// Claim entries whose ack wait expired (or whose nak delay elapsed).
    async fn reclaim(
        &self,
        stream: &str,
        consumer: &ConsumerConfig,
        batch: usize,
    ) -> Result<Vec<Delivery>> {
        let key = stream_key(stream);
        let group = consumer.durable_name.as_str();
        let idle_ms = consumer.ack_wait.as_millis() as u64;

        let pending: StreamPendingCountReply = self
            .query(
                redis::cmd("XPENDING")
                    .arg(&key)
                    .arg(group)
                    .arg("IDLE")
                    .arg(idle_ms)
                    .arg("-")
                    .arg("+")
                    .arg(batch),
            )
            .await?;

        let mut attempts = HashMap::new();
        for entry in pending.ids {
            let delivered = entry.times_delivered as u32;
            if consumer.max_deliver > 0 && delivered >= consumer.max_deliver {
                self.xack(&key, group, &entry.id).await?;
                error!(
                    stream = %stream,
                    consumer = %group,
                    id = %entry.id,
                    attempts = delivered,
                    "Delivery exhausted max attempts, giving up"
                );
                continue;
            }
            attempts.insert(entry.id, delivered + 1);
        }
        if attempts.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<&String> = attempts.keys().collect();
        let claimed: StreamClaimReply = self
            .query(
                redis::cmd("XCLAIM")
                    .arg(&key)
                    .arg(group)
                    .arg(&self.inner.consumer_name)
                    .arg(idle_ms)
                    .arg(&ids),
            )
            .await?;

        let mut deliveries = Vec::with_capacity(claimed.ids.len());
        for entry in &claimed.ids {
            let attempt = attempts.get(&entry.id).copied().unwrap_or(1);
            if let Some(delivery) = self.to_delivery(stream, consumer, entry, attempt).await? {
                deliveries.push(delivery);
            }
        }
        deliveries.sort_by(|a, b| entry_order(&a.id).cmp(&entry_order(&b.id)));
        Ok(deliveries)
    }

    async fn read_new(
        &self,
        stream: &str,
        consumer: &ConsumerConfig,
        count: usize,
    ) -> Result<Vec<Delivery>> {
        let reply: Option<StreamReadReply> = self
            .query(
                redis::cmd("XREADGROUP")
                    .arg("GROUP")
                    .arg(&consumer.durable_name)
                    .arg(&self.inner.consumer_name)
                    .arg("COUNT")
                    .arg(count)
                    .arg("STREAMS")
                    .arg(stream_key(stream))
                    .arg(">"),
            )
            .await?;

        let mut deliveries = Vec::new();
        for key in reply.map(|r| r.keys).unwrap_or_default() {
            for entry in &key.ids {
                if let Some(delivery) = self.to_delivery(stream, consumer, entry, 1).await? {
                    deliveries.push(delivery);
                }
            }
        }
        Ok(deliveries)
    }

    async fn subscribe_pubsub(&self, pattern: &str) -> Result<mpsc::Receiver<BrokerMessage>> {
        let mut pubsub = self
            .inner
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| self.fail(e))?;
        pubsub
            .psubscribe(glob_for(pattern))
            .await
            .map_err(|e| self.fail(e))?;

        let (tx, rx) = mpsc::channel(self.inner.subscription_buffer);
        let cancel = self.inner.cancel.child_token();
        let pattern = pattern.to_string();
        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tx.closed() => break,
                    next = messages.next() => next,
                };
                let Some(msg) = next else {
                    warn!(pattern = %pattern, "Redis pub/sub connection closed");
                    break;
                };
                let subject = msg.get_channel_name().to_string();
                if !subject_matches(&pattern, &subject) {
                    continue;
                }
                let message = BrokerMessage {
                    subject,
                    payload: msg.get_payload_bytes().to_vec(),
                };
                if tx.try_send(message).is_err() {
                    warn!(pattern = %pattern, "Subscriber buffer full, dropping message");
                }
            }
        });
        Ok(rx)
    }

    /// Stream keys a queue group over `pattern` reads: every stream whose
    /// subjects overlap the pattern, then the transient feed.
    async fn queue_keys(&self, pattern: &str) -> Result<Vec<String>> {
        self.load_streams().await?;
        let mut keys: Vec<String> = read_lock(&self.inner.streams)
            .values()
            .filter(|s| s.subjects.iter().any(|p| patterns_overlap(p, pattern)))
            .map(|s| stream_key(&s.name))
            .collect();
        keys.push(TRANSIENT_KEY.to_string());
        Ok(keys)
    }

    /// Queue groups ride on one consumer group per source stream, so Redis
    /// assigns each entry to exactly one member.
    async fn subscribe_queue(
        &self,
        pattern: &str,
        group: &str,
    ) -> Result<mpsc::Receiver<BrokerMessage>> {
        let keys = self.queue_keys(pattern).await?;
        let group = format!("queue.{group}");
        for key in &keys {
            self.create_group(key, &group, "$").await?;
        }

        let member = format!(
            "{}-{}",
            self.inner.consumer_name,
            self.inner.next_sub_id.fetch_add(1, Ordering::Relaxed)
        );
        let (tx, rx) = mpsc::channel(self.inner.subscription_buffer);
        let cancel = self.inner.cancel.child_token();
        let pattern = pattern.to_string();
        let broker = self.clone();

        tokio::spawn(async move {
            loop {
                if cancel.is_cancelled() || tx.is_closed() {
                    break;
                }
                let mut read = redis::cmd("XREADGROUP");
                read.arg("GROUP")
                    .arg(&group)
                    .arg(&member)
                    .arg("COUNT")
                    .arg(QUEUE_BATCH)
                    .arg("STREAMS")
                    .arg(&keys);
                for _ in &keys {
                    read.arg(">");
                }
                let reply: Result<Option<StreamReadReply>> = broker.query(&read).await;
                let entries: Vec<(String, StreamId)> = match reply {
                    Ok(reply) => reply
                        .map(|r| {
                            r.keys
                                .into_iter()
                                .flat_map(|k| {
                                    let key = k.key;
                                    k.ids.into_iter().map(move |id| (key.clone(), id))
                                })
                                .collect()
                        })
                        .unwrap_or_default(),
                    Err(e) => {
                        warn!(group = %group, error = %e, "Queue read failed");
                        break;
                    }
                };

                if entries.is_empty() {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(POLL_INTERVAL) => continue,
                    }
                }
                for (key, entry) in entries {
                    if let Err(e) = broker.xack(&key, &group, &entry.id).await {
                        debug!(id = %entry.id, error = %e, "Queue ack failed");
                    }
                    let (Some(subject), Some(payload)) = (
                        entry.get::<String>("subject"),
                        entry.get::<Vec<u8>>("payload"),
                    ) else {
                        continue;
                    };
                    if !subject_matches(&pattern, &subject) {
                        continue;
                    }
                    if tx.send(BrokerMessage { subject, payload }).await.is_err() {
                        break;
                    }
                }
            }
            debug!(group = %group, member = %member, "Queue subscription stopped");
        });
        Ok(rx)
    }
}

/// Sort key of a Redis stream entry id (`<ms>-<seq>`).
fn entry_order(id: &str) -> (u64, u64) {
    let (ms, seq) = id.split_once('-').unwrap_or((id, "0"));
    (ms.parse().unwrap_or(0), seq.parse().unwrap_or(0))
}

#[async_trait]
impl Broker for RedisBroker {
    fn name(&self) -> &str {
        "redis"
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    async fn ensure_stream(&self, config: &StreamConfig) -> Result<bool> {
        if config.name.is_empty() {
            return Err(Error::Broker("stream name is empty".to_string()));
        }
        for pattern in &config.subjects {
            validate_pattern(pattern)?;
        }

        let json = serde_json::to_string(config)?;
        let created: i64 = self
            .query(
                redis::cmd("HSETNX")
                    .arg(STREAMS_KEY)
                    .arg(&config.name)
                    .arg(&json),
            )
            .await?;

        if created == 1 {
            write_lock(&self.inner.streams).insert(config.name.clone(), config.clone());
            info!(stream = %config.name, subjects = ?config.subjects, "Stream created");
            Ok(true)
        } else {
            self.load_streams().await?;
            Ok(false)
        }
    }

    async fn stream_for_subject(&self, subject: &str) -> Result<Option<String>> {
        let find = |p: &str| subject_matches(p, subject);
        if let Some(name) = self.cached_stream_for(find) {
            return Ok(Some(name));
        }
        self.load_streams().await?;
        Ok(self.cached_stream_for(find))
    }

    async fn stream_info(&self, stream: &str) -> Result<StreamInfo> {
        let config = self.stream_config(stream).await?;
        let messages: u64 = self
            .query(redis::cmd("XLEN").arg(stream_key(stream)))
            .await?;
        Ok(StreamInfo {
            name: config.name,
            subjects: config.subjects,
            messages,
        })
    }

    async fn publish(
        &self,
        subject: &str,
        payload: Vec<u8>,
        msg_id: Option<&str>,
    ) -> Result<PublishAck> {
        validate_subject(subject)?;
        self.connection()?;

        let mut ack = PublishAck::unstored();
        if let Some(name) = self.stream_for_subject(subject).await? {
            let config = self.stream_config(&name).await?;
            let key = stream_key(&name);
            let marker = msg_id.map(|id| dedup_key(&name, id));

            if let Some(marker) = &marker {
                let window_ms = (config.duplicate_window.as_millis() as u64).max(1);
                let fresh: Option<String> = self
                    .query(
                        redis::cmd("SET")
                            .arg(marker)
                            .arg("")
                            .arg("NX")
                            .arg("PX")
                            .arg(window_ms),
                    )
                    .await?;
                if fresh.is_none() {
                    let existing: Option<String> =
                        self.query(redis::cmd("GET").arg(marker)).await?;
                    debug!(stream = %name, subject = %subject, "Duplicate publish merged");
                    return Ok(PublishAck {
                        stream: Some(name),
                        id: existing.filter(|id| !id.is_empty()),
                        duplicate: true,
                    });
                }
            }

            if config.discard == DiscardPolicy::New && config.max_messages > 0 {
                let len: u64 = self.query(redis::cmd("XLEN").arg(&key)).await?;
                if len >= config.max_messages {
                    return Err(Error::Broker(format!("stream {name} is full")));
                }
            }

            let mut xadd = redis::cmd("XADD");
            xadd.arg(&key);
            if config.discard == DiscardPolicy::Old && config.max_messages > 0 {
                xadd.arg("MAXLEN").arg("~").arg(config.max_messages);
            }
            xadd.arg("*")
                .arg("subject")
                .arg(subject)
                .arg("payload")
                .arg(payload.as_slice());
            if let Some(id) = msg_id {
                xadd.arg("msg_id").arg(id);
            }

            let entry: String = match self.query(&xadd).await {
                Ok(entry) => entry,
                Err(e) => {
                    if let Some(marker) = &marker {
                        // Let a retry of this publish through.
                        let _ = self.query::<i64>(redis::cmd("DEL").arg(marker)).await;
                    }
                    return Err(e);
                }
            };

            if let Some(marker) = &marker {
                if let Err(e) = self
                    .query::<Option<String>>(
                        redis::cmd("SET").arg(marker).arg(&entry).arg("XX").arg("KEEPTTL"),
                    )
                    .await
                {
                    debug!(error = %e, "Dedup marker not updated");
                }
            }

            if !config.max_age.is_zero() {
                let cutoff = chrono::Utc::now().timestamp_millis() as u64;
                let min_id = cutoff.saturating_sub(config.max_age.as_millis() as u64);
                if let Err(e) = self
                    .query::<i64>(
                        redis::cmd("XTRIM")
                            .arg(&key)
                            .arg("MINID")
                            .arg("~")
                            .arg(format!("{min_id}-0")),
                    )
                    .await
                {
                    debug!(stream = %name, error = %e, "Age trim failed");
                }
            }

            ack.stream = Some(name);
            ack.id = Some(entry);
        } else {
            self.query::<String>(
                redis::cmd("XADD")
                    .arg(TRANSIENT_KEY)
                    .arg("MAXLEN")
                    .arg("~")
                    .arg(TRANSIENT_MAX_LEN)
                    .arg("*")
                    .arg("subject")
                    .arg(subject)
                    .arg("payload")
                    .arg(payload.as_slice()),
            )
            .await?;
        }

        let _receivers: i64 = self
            .query(redis::cmd("PUBLISH").arg(subject).arg(payload.as_slice()))
            .await?;
        Ok(ack)
    }

    async fn subscribe(
        &self,
        pattern: &str,
        queue_group: Option<&str>,
    ) -> Result<mpsc::Receiver<BrokerMessage>> {
        validate_pattern(pattern)?;
        self.connection()?;
        match queue_group {
            Some(group) => self.subscribe_queue(pattern, group).await,
            None => self.subscribe_pubsub(pattern).await,
        }
    }

    async fn ensure_consumer(&self, stream: &str, config: &ConsumerConfig) -> Result<bool> {
        validate_pattern(&config.filter_subject)?;
        self.stream_config(stream).await?;

        let created = self
            .create_group(&stream_key(stream), &config.durable_name, "0")
            .await?;
        let previous = write_lock(&self.inner.consumers).insert(
            (stream.to_string(), config.durable_name.clone()),
            config.clone(),
        );
        if let Some(previous) = previous.filter(|p| p.filter_subject != config.filter_subject) {
            info!(
                stream = %stream,
                consumer = %config.durable_name,
                from = %previous.filter_subject,
                to = %config.filter_subject,
                "Durable consumer filter changed"
            );
        }
        if created {
            info!(stream = %stream, consumer = %config.durable_name, filter = %config.filter_subject, "Durable consumer created");
        }
        Ok(created)
    }

    async fn fetch(
        &self,
        stream: &str,
        durable: &str,
        batch: usize,
        wait: Duration,
    ) -> Result<Vec<Delivery>> {
        let consumer = self.consumer_config(stream, durable)?;
        let batch = batch.max(1);
        let deadline = Instant::now() + wait;
        loop {
            let mut deliveries = self.reclaim(stream, &consumer, batch).await?;
            if deliveries.len() < batch {
                let fresh = self
                    .read_new(stream, &consumer, batch - deliveries.len())
                    .await?;
                deliveries.extend(fresh);
            }
            let now = Instant::now();
            if !deliveries.is_empty() || now >= deadline {
                return Ok(deliveries);
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.xack(&stream_key(&delivery.stream), &delivery.consumer, &delivery.id)
            .await
    }

    async fn nak(&self, delivery: &Delivery, delay: Duration) -> Result<()> {
        let consumer = self.consumer_config(&delivery.stream, &delivery.consumer)?;
        let key = stream_key(&delivery.stream);

        if consumer.max_deliver > 0 && delivery.attempt >= consumer.max_deliver {
            self.xack(&key, &delivery.consumer, &delivery.id).await?;
            error!(
                stream = %delivery.stream,
                consumer = %delivery.consumer,
                subject = %delivery.subject,
                id = %delivery.id,
                attempts = delivery.attempt,
                "Delivery exhausted max attempts, giving up"
            );
            return Ok(());
        }

        let _claimed: Vec<String> = self
            .query(
                redis::cmd("XCLAIM")
                    .arg(&key)
                    .arg(&delivery.consumer)
                    .arg(&self.inner.consumer_name)
                    .arg(0)
                    .arg(&delivery.id)
                    .arg("IDLE")
                    .arg(nak_idle_ms(consumer.ack_wait, delay))
                    .arg("JUSTID"),
            )
            .await?;
        Ok(())
    }

    async fn release(&self, delivery: &Delivery) -> Result<()> {
        let consumer = self.consumer_config(&delivery.stream, &delivery.consumer)?;
        let _claimed: Vec<String> = self
            .query(
                redis::cmd("XCLAIM")
                    .arg(stream_key(&delivery.stream))
                    .arg(&delivery.consumer)
                    .arg(&self.inner.consumer_name)
                    .arg(0)
                    .arg(&delivery.id)
                    .arg("IDLE")
                    .arg(nak_idle_ms(consumer.ack_wait, Duration::ZERO))
                    .arg("RETRYCOUNT")
                    .arg(released_retry_count(delivery.attempt))
                    .arg("JUSTID"),
            )
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.inner.cancel.cancel();
        self.inner.connected.store(false, Ordering::SeqCst);
        write_lock(&self.inner.conn).take();
        info!("Redis broker closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests;
