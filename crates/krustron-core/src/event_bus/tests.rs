use super::*;
use serde::Deserialize;
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::mpsc;

use crate::error::Error;

fn test_config() -> EventBusConfig {
    EventBusConfig {
        ack_wait_secs: 5,
        max_deliver: 3,
        nak_backoff_ms: vec![100, 200],
        fetch_wait_ms: 200,
        reconnect_min_delay_ms: 10,
        reconnect_max_delay_ms: 100,
        ..EventBusConfig::default()
    }
}

async fn provisioned(broker: &MemoryBroker, config: EventBusConfig) -> EventBus {
    let bus = EventBus::new(Arc::new(broker.clone()), config);
    bus.provision_streams().await.unwrap();
    bus
}

/// Handler forwarding every message into a channel.
fn forward() -> (
    impl EventHandler,
    mpsc::UnboundedReceiver<ReceivedMessage>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = move |message: ReceivedMessage| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(message);
            Ok::<(), Error>(())
        }
    };
    (handler, rx)
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<ReceivedMessage>) -> Option<ReceivedMessage> {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .ok()
        .flatten()
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct StatusChanged {
    status: String,
    nodes: u32,
}

#[tokio::test(start_paused = true)]
async fn test_publish_subscribe_round_trip() {
    let broker = MemoryBroker::default();
    let bus = provisioned(&broker, test_config()).await;
    let (handler, mut rx) = forward();
    bus.subscribe("krustron.cluster.*.status-changed", handler)
        .await
        .unwrap();

    let payload = StatusChanged {
        status: "healthy".into(),
        nodes: 3,
    };
    let ack = bus
        .publish("krustron.cluster.c1.status-changed", &payload)
        .await
        .unwrap();
    assert_eq!(ack.stream.as_deref(), Some("KRUSTRON_CLUSTER"));
    assert!(!ack.duplicate);

    let message = recv(&mut rx).await.unwrap();
    assert_eq!(message.subject, "krustron.cluster.c1.status-changed");
    assert_eq!(message.json::<StatusChanged>().unwrap(), payload);
    assert_eq!(message.attempt(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_plain_subject_without_stream() {
    let broker = MemoryBroker::default();
    let bus = provisioned(&broker, test_config()).await;
    let (handler, mut rx) = forward();
    bus.subscribe("ops.>", handler).await.unwrap();

    let ack = bus.publish("ops.cache.flushed", &json!({})).await.unwrap();
    assert_eq!(ack, PublishAck::unstored());
    assert_eq!(recv(&mut rx).await.unwrap().subject, "ops.cache.flushed");
}

#[tokio::test(start_paused = true)]
async fn test_queue_group_balances_and_plain_sees_all() {
    let broker = MemoryBroker::default();
    let bus = provisioned(&broker, test_config()).await;

    let first = Arc::new(AtomicU32::new(0));
    let second = Arc::new(AtomicU32::new(0));
    for counter in [first.clone(), second.clone()] {
        bus.queue_subscribe("krustron.pipeline.>", "workers", move |_m: ReceivedMessage| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), Error>(())
            }
        })
        .await
        .unwrap();
    }
    let (handler, mut all) = forward();
    bus.subscribe("krustron.pipeline.>", handler).await.unwrap();

    for i in 0..10 {
        bus.publish(&format!("krustron.pipeline.p{i}.started"), &json!({ "n": i }))
            .await
            .unwrap();
    }

    for _ in 0..10 {
        assert!(recv(&mut all).await.is_some());
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(first.load(Ordering::SeqCst), 5);
    assert_eq!(second.load(Ordering::SeqCst), 5);
}

#[tokio::test(start_paused = true)]
async fn test_durable_delivery_survives_restart_without_redelivery() {
    let broker = MemoryBroker::default();
    let config = test_config();

    let bus = provisioned(&broker, config.clone()).await;
    let (handler, mut rx) = forward();
    bus.subscribe_durable("inventory", "krustron.cluster.>", handler)
        .await
        .unwrap();
    bus.publish(
        "krustron.cluster.c1.status-changed",
        &json!({ "status": "healthy" }),
    )
    .await
    .unwrap();

    let message = recv(&mut rx).await.unwrap();
    assert_eq!(message.subject, "krustron.cluster.c1.status-changed");
    assert_eq!(message.json::<serde_json::Value>().unwrap(), json!({ "status": "healthy" }));
    let info = message.delivery.clone().unwrap();
    assert_eq!(info.stream, "KRUSTRON_CLUSTER");
    assert_eq!(info.consumer, "inventory");
    assert_eq!(info.attempt, 1);

    // Nothing else arrives, not even after the ack wait.
    tokio::time::sleep(Duration::from_secs(12)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(broker.pending_count("KRUSTRON_CLUSTER", "inventory"), 0);
    bus.drain(Duration::from_secs(1)).await.unwrap();

    // Same durable name in a fresh process resumes after the acked message.
    let restarted = provisioned(&broker, config).await;
    let (handler, mut rx) = forward();
    restarted
        .subscribe_durable("inventory", "krustron.cluster.>", handler)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(12)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_durable_consumer_starts_from_stream_history() {
    let broker = MemoryBroker::default();
    let bus = provisioned(&broker, test_config()).await;
    bus.publish("krustron.audit.u1.login", &json!({ "n": 1 }))
        .await
        .unwrap();
    bus.publish("krustron.audit.u2.login", &json!({ "n": 2 }))
        .await
        .unwrap();

    let (handler, mut rx) = forward();
    bus.subscribe_durable("auditor", "krustron.audit.>", handler)
        .await
        .unwrap();

    let first = recv(&mut rx).await.unwrap();
    let second = recv(&mut rx).await.unwrap();
    assert_eq!(first.subject, "krustron.audit.u1.login");
    assert_eq!(second.subject, "krustron.audit.u2.login");
}

#[tokio::test(start_paused = true)]
async fn test_nak_redelivers_until_max_deliver() {
    let broker = MemoryBroker::default();
    let bus = provisioned(&broker, test_config()).await;

    let deliveries = Arc::new(AtomicU32::new(0));
    let counter = deliveries.clone();
    bus.subscribe_durable("flaky", "krustron.alert.>", move |m: ReceivedMessage| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<(), Error>(Error::handler(format!("attempt {} rejected", m.attempt())))
        }
    })
    .await
    .unwrap();

    bus.publish("krustron.alert.a1.raised", &json!({ "severity": "critical" }))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(deliveries.load(Ordering::SeqCst), 3);
    assert_eq!(broker.pending_count("KRUSTRON_ALERT", "flaky"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_handler_failure_then_success_is_acked() {
    let broker = MemoryBroker::default();
    let bus = provisioned(&broker, test_config()).await;

    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    bus.subscribe_durable("retrying", "krustron.deployment.>", move |m: ReceivedMessage| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            if m.attempt() < 2 {
                Err(Error::handler("database unavailable"))
            } else {
                Ok::<(), Error>(())
            }
        }
    })
    .await
    .unwrap();

    bus.publish("krustron.deployment.d1.completed", &json!({}))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(broker.pending_count("KRUSTRON_DEPLOYMENT", "retrying"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_ack_wait_expiry_redelivers() {
    let broker = MemoryBroker::default();
    let bus = provisioned(&broker, test_config()).await;

    let deliveries = Arc::new(AtomicU32::new(0));
    let counter = deliveries.clone();
    bus.subscribe_durable("slow", "krustron.deployment.>", move |m: ReceivedMessage| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            if m.attempt() == 1 {
                // Hangs past the ack wait.
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Ok::<(), Error>(())
        }
    })
    .await
    .unwrap();

    bus.publish("krustron.deployment.d7.started", &json!({ "replicas": 3 }))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(deliveries.load(Ordering::SeqCst), 2);
    assert_eq!(broker.pending_count("KRUSTRON_DEPLOYMENT", "slow"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unacked_delivery_returns_after_ack_wait() {
    let broker = MemoryBroker::default();
    let config = test_config();
    provisioned(&broker, config.clone()).await;
    let consumer = ConsumerConfig::new("audit-log", "krustron.audit.>", &config);
    broker.ensure_consumer("KRUSTRON_AUDIT", &consumer).await.unwrap();
    broker
        .publish("krustron.audit.u1.login", b"{}".to_vec(), None)
        .await
        .unwrap();

    let first = broker
        .fetch("KRUSTRON_AUDIT", "audit-log", 10, Duration::from_millis(100))
        .await
        .unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].attempt, 1);

    let early = broker
        .fetch("KRUSTRON_AUDIT", "audit-log", 10, Duration::from_secs(1))
        .await
        .unwrap();
    assert!(early.is_empty());

    let redelivered = broker
        .fetch("KRUSTRON_AUDIT", "audit-log", 10, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(redelivered.len(), 1);
    assert_eq!(redelivered[0].id, first[0].id);
    assert_eq!(redelivered[0].attempt, 2);
}

#[tokio::test(start_paused = true)]
async fn test_release_does_not_spend_final_attempt() {
    let broker = MemoryBroker::default();
    let config = EventBusConfig {
        max_deliver: 1,
        ..test_config()
    };
    provisioned(&broker, config.clone()).await;
    let consumer = ConsumerConfig::new("once", "krustron.audit.>", &config);
    broker.ensure_consumer("KRUSTRON_AUDIT", &consumer).await.unwrap();
    broker
        .publish("krustron.audit.u1.login", b"{}".to_vec(), None)
        .await
        .unwrap();

    let fetched = broker
        .fetch("KRUSTRON_AUDIT", "once", 10, Duration::from_millis(100))
        .await
        .unwrap();
    broker.release(&fetched[0]).await.unwrap();
    assert_eq!(broker.pending_count("KRUSTRON_AUDIT", "once"), 1);

    let again = broker
        .fetch("KRUSTRON_AUDIT", "once", 10, Duration::from_millis(100))
        .await
        .unwrap();
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].id, fetched[0].id);
    assert_eq!(again[0].attempt, 1);
}

#[tokio::test(start_paused = true)]
async fn test_drain_keeps_unprocessed_deliveries() {
    let broker = MemoryBroker::default();
    let config = EventBusConfig {
        max_deliver: 1,
        fetch_batch: 10,
        ..test_config()
    };
    let bus = provisioned(&broker, config.clone()).await;
    bus.publish("krustron.audit.u1.login", &json!({ "n": 1 }))
        .await
        .unwrap();
    bus.publish("krustron.audit.u2.login", &json!({ "n": 2 }))
        .await
        .unwrap();

    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    bus.subscribe_durable("auditor", "krustron.audit.>", move |m: ReceivedMessage| {
        let started_tx = started_tx.clone();
        async move {
            let _ = started_tx.send(m.subject.clone());
            tokio::time::sleep(Duration::from_secs(2)).await;
            Ok::<(), Error>(())
        }
    })
    .await
    .unwrap();

    assert_eq!(started_rx.recv().await.unwrap(), "krustron.audit.u1.login");
    bus.drain(Duration::from_secs(10)).await.unwrap();
    assert!(started_rx.try_recv().is_err());
    assert_eq!(broker.pending_count("KRUSTRON_AUDIT", "auditor"), 1);

    let restarted = provisioned(&broker, config).await;
    let (handler, mut rx) = forward();
    restarted
        .subscribe_durable("auditor", "krustron.audit.>", handler)
        .await
        .unwrap();
    let message = recv(&mut rx).await.unwrap();
    assert_eq!(message.subject, "krustron.audit.u2.login");
    assert_eq!(message.attempt(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_rebinding_durable_updates_filter() {
    let broker = MemoryBroker::default();
    let config = test_config();
    provisioned(&broker, config.clone()).await;

    let narrow = ConsumerConfig::new("watcher", "krustron.cluster.c1.>", &config);
    assert!(broker.ensure_consumer("KRUSTRON_CLUSTER", &narrow).await.unwrap());
    let wide = ConsumerConfig::new("watcher", "krustron.cluster.>", &config);
    assert!(!broker.ensure_consumer("KRUSTRON_CLUSTER", &wide).await.unwrap());

    broker
        .publish("krustron.cluster.c2.created", b"{}".to_vec(), None)
        .await
        .unwrap();
    let fetched = broker
        .fetch("KRUSTRON_CLUSTER", "watcher", 10, Duration::from_millis(100))
        .await
        .unwrap();
    assert_eq!(fetched.len(), 1);
    assert_eq!(fetched[0].subject, "krustron.cluster.c2.created");
}

#[tokio::test(start_paused = true)]
async fn test_queue_group_spans_streams_and_plain_subjects() {
    let broker = MemoryBroker::default();
    let bus = provisioned(&broker, test_config()).await;

    let handled = Arc::new(AtomicU32::new(0));
    for _ in 0..2 {
        let counter = handled.clone();
        bus.queue_subscribe("krustron.>", "indexers", move |_m: ReceivedMessage| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), Error>(())
            }
        })
        .await
        .unwrap();
    }
    let (handler, mut plain) = forward();
    bus.queue_subscribe("ops.>", "janitors", handler).await.unwrap();

    bus.publish("krustron.cluster.c1.created", &json!({})).await.unwrap();
    bus.publish("krustron.pipeline.p1.started", &json!({})).await.unwrap();
    bus.publish("ops.cache.flushed", &json!({})).await.unwrap();

    assert_eq!(recv(&mut plain).await.unwrap().subject, "ops.cache.flushed");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handled.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_publish_event_dedup_window() {
    let broker = MemoryBroker::default();
    let bus = provisioned(&broker, test_config()).await;

    let event = Event::new(
        Domain::Security,
        "nginx:1.25",
        "scan-alert",
        json!({ "critical": 2 }),
    );
    let first = bus.publish_event(&event).await.unwrap();
    let retry = bus.publish_event(&event).await.unwrap();
    assert!(!first.duplicate);
    assert!(retry.duplicate);
    assert_eq!(retry.id, first.id);

    // A producer rebuilding the event after a crash keeps its identity.
    let rebuilt = Event::new(
        Domain::Security,
        "nginx:1.25",
        "scan-alert",
        json!({ "critical": 2 }),
    )
    .with_id(event.id.clone());
    assert!(bus.publish_event(&rebuilt).await.unwrap().duplicate);
    let info = broker.stream_info("KRUSTRON_SECURITY").await.unwrap();
    assert_eq!(info.messages, 1);

    // Outside the window the same id is stored again.
    tokio::time::advance(Duration::from_secs(121)).await;
    let late = bus.publish_event(&event).await.unwrap();
    assert!(!late.duplicate);
    assert_eq!(broker.stream_info("KRUSTRON_SECURITY").await.unwrap().messages, 2);
}

#[tokio::test(start_paused = true)]
async fn test_stream_retention_limits() {
    let broker = MemoryBroker::default();
    let config = EventBusConfig {
        stream_max_messages: 3,
        stream_max_age_secs: 60,
        ..test_config()
    };
    let bus = provisioned(&broker, config).await;

    for i in 0..5 {
        bus.publish(&format!("krustron.application.app{i}.synced"), &json!({}))
            .await
            .unwrap();
    }
    assert_eq!(broker.stream_info("KRUSTRON_APPLICATION").await.unwrap().messages, 3);

    tokio::time::advance(Duration::from_secs(61)).await;
    assert_eq!(broker.stream_info("KRUSTRON_APPLICATION").await.unwrap().messages, 0);
}

#[tokio::test(start_paused = true)]
async fn test_provisioning_is_idempotent() {
    let broker = MemoryBroker::default();
    let bus = EventBus::new(Arc::new(broker.clone()), test_config());

    assert_eq!(bus.provision_streams().await.unwrap(), 7);
    assert_eq!(bus.provision_streams().await.unwrap(), 0);

    let stream = broker
        .stream_for_subject("krustron.pipeline.p1.stage-completed")
        .await
        .unwrap();
    assert_eq!(stream.as_deref(), Some("KRUSTRON_PIPELINE"));
}

#[tokio::test(start_paused = true)]
async fn test_publish_while_disconnected_fails_fast() {
    let broker = MemoryBroker::default();
    let bus = provisioned(&broker, test_config()).await;

    broker.set_connected(false);
    let err = bus
        .publish("krustron.cluster.c1.deleted", &json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Disconnected));
    assert!(err.is_transient());
    assert!(!bus.is_connected());

    broker.set_connected(true);
    assert!(bus.publish("krustron.cluster.c1.deleted", &json!({})).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_subscription_resumes_after_reconnect() {
    let broker = MemoryBroker::default();
    let bus = provisioned(&broker, test_config()).await;
    let (handler, mut rx) = forward();
    bus.subscribe("krustron.cluster.>", handler).await.unwrap();
    assert_eq!(broker.subscription_count(), 1);

    broker.set_connected(false);
    assert_eq!(broker.subscription_count(), 0);
    broker.set_connected(true);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(broker.subscription_count(), 1);

    bus.publish("krustron.cluster.c2.created", &json!({}))
        .await
        .unwrap();
    assert_eq!(recv(&mut rx).await.unwrap().subject, "krustron.cluster.c2.created");
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribe_stops_delivery() {
    let broker = MemoryBroker::default();
    let bus = provisioned(&broker, test_config()).await;
    let (handler, mut rx) = forward();
    let id = bus.subscribe("krustron.cluster.>", handler).await.unwrap();
    assert_eq!(bus.subscription_kind(id), Some(SubscriptionKind::Plain));

    assert!(bus.unsubscribe(id));
    assert!(!bus.unsubscribe(id));
    assert_eq!(bus.subscription_count(), 0);

    bus.publish("krustron.cluster.c1.created", &json!({}))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_drain_waits_for_in_flight_handler() {
    let broker = MemoryBroker::default();
    let bus = provisioned(&broker, test_config()).await;

    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let finished = Arc::new(AtomicU32::new(0));
    let done = finished.clone();
    bus.subscribe("krustron.pipeline.>", move |_m: ReceivedMessage| {
        let started_tx = started_tx.clone();
        let done = done.clone();
        async move {
            let _ = started_tx.send(());
            tokio::time::sleep(Duration::from_secs(3)).await;
            done.fetch_add(1, Ordering::SeqCst);
            Ok::<(), Error>(())
        }
    })
    .await
    .unwrap();

    bus.publish("krustron.pipeline.p1.started", &json!({}))
        .await
        .unwrap();
    started_rx.recv().await.unwrap();

    bus.drain(Duration::from_secs(10)).await.unwrap();
    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert!(bus.is_draining());
    assert!(matches!(
        bus.publish("krustron.pipeline.p1.started", &json!({})).await,
        Err(Error::Draining)
    ));
    assert!(matches!(
        bus.subscribe("krustron.>", forward().0).await,
        Err(Error::Draining)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_drain_times_out_on_stuck_handler() {
    let broker = MemoryBroker::default();
    let bus = provisioned(&broker, test_config()).await;

    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    bus.subscribe("krustron.alert.>", move |_m: ReceivedMessage| {
        let started_tx = started_tx.clone();
        async move {
            let _ = started_tx.send(());
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok::<(), Error>(())
        }
    })
    .await
    .unwrap();

    bus.publish("krustron.alert.a1.raised", &json!({}))
        .await
        .unwrap();
    started_rx.recv().await.unwrap();

    let result = bus.drain(Duration::from_secs(1)).await;
    assert!(matches!(result, Err(Error::Timeout(_))));
}

#[tokio::test]
async fn test_durable_requires_known_domain() {
    let broker = MemoryBroker::default();
    let bus = provisioned(&broker, test_config()).await;

    let err = bus
        .subscribe_durable("svc", "krustron.*.c1.created", forward().0)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::StreamNotFound(_)));

    let err = bus
        .subscribe_durable("bad.name", "krustron.cluster.>", forward().0)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Broker(_)));
}

#[tokio::test]
async fn test_invalid_subjects_rejected() {
    let broker = MemoryBroker::default();
    let bus = provisioned(&broker, test_config()).await;

    assert!(matches!(
        bus.publish("krustron.cluster.*", &json!({})).await,
        Err(Error::InvalidSubject(_))
    ));
    assert!(matches!(
        bus.subscribe("krustron..>", forward().0).await,
        Err(Error::InvalidSubject(_))
    ));
}

#[test]
fn test_config_defaults_and_overrides() {
    let config = EventBusConfig::default();
    assert_eq!(config.broker, BrokerKind::Memory);
    assert_eq!(config.stream_max_age(), Duration::from_secs(604_800));
    assert_eq!(config.duplicate_window(), Duration::from_secs(120));
    assert_eq!(config.max_deliver, 5);

    let parsed: EventBusConfig =
        serde_json::from_value(json!({ "broker": "redis", "ack_wait_secs": 0, "nak_backoff_ms": [50] }))
            .unwrap();
    assert_eq!(parsed.broker, BrokerKind::Redis);
    assert_eq!(parsed.ack_wait(), Duration::from_secs(1));
    let consumer = ConsumerConfig::new("svc", "krustron.cluster.>", &parsed);
    assert_eq!(consumer.backoff_for(1), Duration::from_millis(50));
    assert_eq!(consumer.backoff_for(9), Duration::from_millis(50));
}

#[test]
fn test_event_construction() {
    let event = Event::new(
        Domain::Cluster,
        "prod.eu",
        "status-changed",
        json!({ "status": "healthy" }),
    )
    .with_source("cluster-service")
    .with_metadata("region", "eu-west-1");

    assert_eq!(event.subject, "krustron.cluster.prod_eu.status-changed");
    assert_eq!(event.source, "cluster-service");
    let wire = serde_json::to_value(&event).unwrap();
    assert_eq!(wire["type"], "status-changed");
    assert_eq!(wire["metadata"]["region"], "eu-west-1");
}
