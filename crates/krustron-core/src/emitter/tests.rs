use super::*;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::event_bus::{Broker, Domain, EventBusConfig, MemoryBroker, ReceivedMessage};
use crate::hub::{ConnectionHandle, Hub, HubConfig, MessageType};

async fn live_client(hub: &HubHandle, channel: &str) -> ConnectionHandle {
    let mut conn = hub.register("tester", HashMap::new()).await.unwrap();
    hub.subscribe(conn.id, channel).await.unwrap();
    let ack = conn.receiver.recv().await.unwrap();
    assert_eq!(ack.kind, MessageType::Connect);
    conn
}

async fn durable_bus(broker: &MemoryBroker) -> Arc<EventBus> {
    let bus = EventBus::new(Arc::new(broker.clone()), EventBusConfig::default());
    bus.provision_streams().await.unwrap();
    Arc::new(bus)
}

#[test]
fn test_channel_names() {
    assert_eq!(channels::cluster("c1"), "cluster:c1");
    assert_eq!(channels::pipeline("p1"), "pipeline:p1");
    assert_eq!(channels::pod("default", "web-0"), "pod:default/web-0");
    assert_eq!(channels::ALERTS, "alerts");
    assert_eq!(channels::COST, "cost");
}

#[test]
fn test_event_routes() {
    let status = ClusterStatusChanged {
        cluster_id: "c1".into(),
        status: "healthy".into(),
        message: None,
    };
    assert_eq!(
        status.live(),
        Some(("cluster:c1".to_string(), MessageType::ClusterStatus))
    );
    assert_eq!(status.durable(), Some((Domain::Cluster, "c1".to_string())));

    let log = PipelineLogLine {
        pipeline_id: "p1".into(),
        run_id: "r1".into(),
        stage: "build".into(),
        line: "compiling".into(),
    };
    assert!(log.live().is_some());
    assert!(log.durable().is_none());

    let audit = AuditRecorded {
        actor: "alice".into(),
        action: "cluster.delete".into(),
        resource: "c1".into(),
        outcome: "success".into(),
    };
    assert!(audit.live().is_none());
    assert_eq!(audit.durable(), Some((Domain::Audit, "alice".to_string())));
}

#[tokio::test]
async fn test_live_and_durable_routing() {
    let (hub, _task) = Hub::spawn(HubConfig::default(), CancellationToken::new());
    let broker = MemoryBroker::default();
    let bus = durable_bus(&broker).await;

    let (tx, mut durable_rx) = mpsc::unbounded_channel();
    bus.subscribe("krustron.cluster.>", move |m: ReceivedMessage| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(m);
            Ok::<(), crate::Error>(())
        }
    })
    .await
    .unwrap();

    let mut viewer = live_client(&hub, "cluster:c1").await;
    let emitter = EventEmitter::new("cluster-service")
        .with_hub(hub.clone())
        .with_bus(bus.clone());

    emitter
        .cluster_status_changed("c1", "healthy", Some("all nodes ready"))
        .await
        .unwrap();

    let live = viewer.receiver.recv().await.unwrap();
    assert_eq!(live.kind, MessageType::ClusterStatus);
    assert_eq!(live.channel.as_deref(), Some("cluster:c1"));
    assert_eq!(live.data["status"], "healthy");
    assert_eq!(live.metadata.get("source").map(String::as_str), Some("cluster-service"));

    let durable = tokio::time::timeout(Duration::from_secs(5), durable_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(durable.subject, "krustron.cluster.c1.status-changed");
    let event = durable.event().unwrap();
    assert_eq!(event.event_type, "status-changed");
    assert_eq!(event.source, "cluster-service");
    assert_eq!(event.data, json!({ "cluster_id": "c1", "status": "healthy", "message": "all nodes ready" }));
}

#[tokio::test]
async fn test_live_only_event_skips_bus() {
    let (hub, _task) = Hub::spawn(HubConfig::default(), CancellationToken::new());
    let broker = MemoryBroker::default();
    let bus = durable_bus(&broker).await;
    let mut viewer = live_client(&hub, "pod:default/web-0").await;

    let emitter = EventEmitter::new("k8s-watcher")
        .with_hub(hub.clone())
        .with_bus(bus);
    emitter
        .pod_status_changed("default", "web-0", "Running", true)
        .await
        .unwrap();

    let live = viewer.receiver.recv().await.unwrap();
    assert_eq!(live.kind, MessageType::PodStatus);
    assert_eq!(live.data["phase"], "Running");
    assert_eq!(broker.stream_info("KRUSTRON_CLUSTER").await.unwrap().messages, 0);
}

#[tokio::test]
async fn test_durable_only_event_skips_hub() {
    let (hub, _task) = Hub::spawn(HubConfig::default(), CancellationToken::new());
    let broker = MemoryBroker::default();
    let bus = durable_bus(&broker).await;

    let emitter = EventEmitter::new("api")
        .with_hub(hub.clone())
        .with_bus(bus);
    emitter
        .audit("alice", "cluster.delete", "c1", "success")
        .await
        .unwrap();

    assert_eq!(broker.stream_info("KRUSTRON_AUDIT").await.unwrap().messages, 1);
    assert_eq!(hub.stats().await.unwrap().broadcasts, 0);
}

#[tokio::test]
async fn test_durable_failure_is_returned_live_failure_is_not() {
    let shutdown = CancellationToken::new();
    let (hub, task) = Hub::spawn(HubConfig::default(), shutdown.clone());
    let broker = MemoryBroker::default();
    let bus = durable_bus(&broker).await;
    let emitter = EventEmitter::new("alerts")
        .with_hub(hub.clone())
        .with_bus(bus);

    shutdown.cancel();
    task.await.unwrap();
    emitter
        .cost_update(CostUpdate {
            scope: "total".into(),
            currency: "USD".into(),
            hourly: 1.5,
            monthly_projection: 1095.0,
        })
        .await
        .unwrap();

    broker.set_connected(false);
    let err = emitter
        .alert_raised("a1", Severity::Critical, "Node down", "node-3 unreachable", Some("c1"))
        .await
        .unwrap_err();
    assert!(matches!(err, crate::Error::Disconnected));
}

#[tokio::test]
async fn test_emitter_without_targets_is_noop() {
    let emitter = EventEmitter::new("idle");
    emitter
        .security_scan_alert(SecurityScanAlert {
            image: "nginx:1.25".into(),
            scan_id: "s1".into(),
            severity: Severity::Warning,
            critical: 0,
            high: 3,
            summary: "3 high findings".into(),
        })
        .await
        .unwrap();
    assert_eq!(emitter.source(), "idle");
}

#[test]
fn test_severity_wire_format() {
    assert_eq!(serde_json::to_value(Severity::Critical).unwrap(), json!("critical"));
    assert!(Severity::Critical > Severity::Warning);
}
