use super::*;

#[test]
fn test_key_layout() {
    assert_eq!(stream_key("KRUSTRON_CLUSTER"), "krustron:stream:KRUSTRON_CLUSTER");
    assert_eq!(
        dedup_key("KRUSTRON_AUDIT", "evt-1"),
        "krustron:dedup:KRUSTRON_AUDIT:evt-1"
    );
}

#[test]
fn test_glob_translation() {
    assert_eq!(glob_for("krustron.cluster.>"), "krustron.cluster.*");
    assert_eq!(glob_for("krustron.*.c1.*"), "krustron.*.c1.*");
    assert_eq!(glob_for("krustron.pod.web[1]"), "krustron.pod.web\\[1\\]");
}

#[test]
fn test_released_entry_keeps_its_attempt() {
    assert_eq!(released_retry_count(1), 0);
    assert_eq!(released_retry_count(3), 2);
    assert_eq!(released_retry_count(0), 0);
}

#[test]
fn test_nak_idle_rewinds_by_delay() {
    let ack_wait = Duration::from_secs(30);
    assert_eq!(nak_idle_ms(ack_wait, Duration::from_secs(5)), 25_000);
    assert_eq!(nak_idle_ms(ack_wait, Duration::ZERO), 30_000);
    assert_eq!(nak_idle_ms(ack_wait, Duration::from_secs(60)), 0);
}

#[test]
fn test_entry_order() {
    assert!(entry_order("1700000000000-2") > entry_order("1700000000000-1"));
    assert!(entry_order("1700000000001-0") > entry_order("1700000000000-9"));
}

// Integration tests (require running Redis)
// Run with: cargo test --features redis-tests
#[cfg(feature = "redis-tests")]
mod integration {
    use super::*;
    use crate::event_bus::subject::Domain;

    fn config() -> EventBusConfig {
        EventBusConfig {
            broker: crate::event_bus::BrokerKind::Redis,
            url: std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into()),
            ack_wait_secs: 1,
            max_deliver: 2,
            nak_backoff_ms: vec![0],
            ..EventBusConfig::default()
        }
    }

    fn unique_stream(config: &EventBusConfig) -> StreamConfig {
        let mut stream = StreamConfig::for_domain(Domain::Cluster, config);
        stream.name = format!("KRUSTRON_TEST_{}", Uuid::new_v4().simple());
        stream.subjects = vec![format!("krustron.test{}.>", &stream.name[14..22])];
        stream
    }

    #[tokio::test]
    async fn test_publish_dedup_and_consume() {
        let config = config();
        let broker = RedisBroker::connect(&config).await.unwrap();
        let stream = unique_stream(&config);
        assert!(broker.ensure_stream(&stream).await.unwrap());
        assert!(!broker.ensure_stream(&stream).await.unwrap());

        let subject = stream.subjects[0].replace('>', "c1.created");
        let first = broker.publish(&subject, b"{}".to_vec(), Some("evt-1")).await.unwrap();
        let second = broker.publish(&subject, b"{}".to_vec(), Some("evt-1")).await.unwrap();
        assert!(!first.duplicate);
        assert!(second.duplicate);
        assert_eq!(broker.stream_info(&stream.name).await.unwrap().messages, 1);

        let consumer = ConsumerConfig::new("it", &stream.subjects[0], &config);
        assert!(broker.ensure_consumer(&stream.name, &consumer).await.unwrap());
        let deliveries = broker
            .fetch(&stream.name, "it", 10, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].subject, subject);
        broker.ack(&deliveries[0]).await.unwrap();

        let again = broker
            .fetch(&stream.name, "it", 10, Duration::from_millis(300))
            .await
            .unwrap();
        assert!(again.is_empty());
        broker.close().await.unwrap();
    }
    #[tokio::test]
    async fn test_release_on_final_attempt_redelivers() {
        let config = EventBusConfig {
            max_deliver: 1,
            ..config()
        };
        let broker = RedisBroker::connect(&config).await.unwrap();
        let stream = unique_stream(&config);
        broker.ensure_stream(&stream).await.unwrap();
        let subject = stream.subjects[0].replace('>', "u2.login");
        broker.publish(&subject, b"{}".to_vec(), None).await.unwrap();

        let consumer = ConsumerConfig::new("drainer", &stream.subjects[0], &config);
        broker.ensure_consumer(&stream.name, &consumer).await.unwrap();
        let first = broker
            .fetch(&stream.name, "drainer", 10, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(first.len(), 1);
        broker.release(&first[0]).await.unwrap();

        let again = broker
            .fetch(&stream.name, "drainer", 10, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].id, first[0].id);
        assert_eq!(again[0].attempt, 1);
        broker.ack(&again[0]).await.unwrap();
        broker.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_queue_group_outside_streams() {
        let config = config();
        let broker = RedisBroker::connect(&config).await.unwrap();
        let prefix = format!("ops{}", Uuid::new_v4().simple());
        let pattern = format!("{prefix}.>");

        let mut first = broker.subscribe(&pattern, Some("workers")).await.unwrap();
        let mut second = broker.subscribe(&pattern, Some("workers")).await.unwrap();
        for i in 0..4 {
            let ack = broker
                .publish(&format!("{prefix}.cache{i}.flushed"), b"{}".to_vec(), None)
                .await
                .unwrap();
            assert_eq!(ack, PublishAck::unstored());
        }

        let mut received = 0;
        let deadline = Instant::now() + Duration::from_secs(3);
        while received < 4 && Instant::now() < deadline {
            tokio::select! {
                Some(m) = first.recv() => { assert!(m.subject.starts_with(&prefix)); received += 1; }
                Some(m) = second.recv() => { assert!(m.subject.starts_with(&prefix)); received += 1; }
                _ = tokio::time::sleep(Duration::from_millis(100)) => {}
            }
        }
        assert_eq!(received, 4);
        broker.close().await.unwrap();
    }
}
