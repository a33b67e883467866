//! Event Emitter - typed facade over the hub and the event bus.
//!
//! Producers call one method per domain event. Each event decides where it
//! goes: the hub for live views, the bus for other services, or both. The
//! live path is best-effort and never fails a call; durable publish errors
//! are returned so the producer can retry.

/// Domain event payloads
pub mod events;

pub use events::*;

use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::Result;
use crate::event_bus::{Event, EventBus};
use crate::hub::{HubHandle, Message};

/// Live channel naming: `<domain>:<id>`, or a bare topic.
pub mod channels {
    /// Operator alerts
    pub const ALERTS: &str = "alerts";
    /// Cost estimates
    pub const COST: &str = "cost";

    /// `cluster:<id>`
    pub fn cluster(id: &str) -> String {
        format!("cluster:{id}")
    }

    /// `application:<id>`
    pub fn application(id: &str) -> String {
        format!("application:{id}")
    }

    /// `pipeline:<id>`
    pub fn pipeline(id: &str) -> String {
        format!("pipeline:{id}")
    }

    /// `pod:<namespace>/<name>`
    pub fn pod(namespace: &str, name: &str) -> String {
        format!("pod:{namespace}/{name}")
    }
}

/// Routes domain events to the hub and/or the event bus.
#[derive(Clone)]
pub struct EventEmitter {
    hub: Option<HubHandle>,
    bus: Option<Arc<EventBus>>,
    source: String,
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("live", &self.hub.is_some())
            .field("durable", &self.bus.is_some())
            .field("source", &self.source)
            .finish()
    }
}

impl EventEmitter {
    /// Emitter with no targets; events are dropped until one is attached.
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            hub: None,
            bus: None,
            source: source.into(),
        }
    }

    /// Attach the live hub.
    #[must_use]
    pub fn with_hub(mut self, hub: HubHandle) -> Self {
        self.hub = Some(hub);
        self
    }

    /// Attach the durable bus.
    #[must_use]
    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Producer name stamped on events.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Route one event.
    pub async fn emit<E: DomainEvent>(&self, event: &E) -> Result<()> {
        let data = serde_json::to_value(event)?;

        if let Some((channel, kind)) = event.live() {
            match &self.hub {
                Some(hub) => {
                    let message = Message::new(kind, data.clone())
                        .with_channel(channel.as_str())
                        .with_metadata("source", self.source.as_str());
                    if let Err(e) = hub.broadcast(message).await {
                        warn!(channel = %channel, error = %e, "Live update not delivered");
                    }
                }
                None => debug!(channel = %channel, "No hub attached, skipping live update"),
            }
        }

        if let Some((domain, entity)) = event.durable() {
            match &self.bus {
                Some(bus) => {
                    let event = Event::new(domain, &entity, E::EVENT_TYPE, data)
                        .with_source(self.source.as_str());
                    bus.publish_event(&event).await?;
                }
                None => debug!(domain = %domain, entity = %entity, "No event bus attached, skipping durable publish"),
            }
        }
        Ok(())
    }

    /// Cluster status changed (live + durable).
    pub async fn cluster_status_changed(
        &self,
        cluster_id: &str,
        status: &str,
        message: Option<&str>,
    ) -> Result<()> {
        self.emit(&ClusterStatusChanged {
            cluster_id: cluster_id.to_string(),
            status: status.to_string(),
            message: message.map(str::to_string),
        })
        .await
    }

    /// Cluster health probe (live).
    pub async fn cluster_health(
        &self,
        cluster_id: &str,
        nodes_ready: u32,
        nodes_total: u32,
    ) -> Result<()> {
        self.emit(&ClusterHealthReport {
            cluster_id: cluster_id.to_string(),
            healthy: nodes_total > 0 && nodes_ready == nodes_total,
            nodes_ready,
            nodes_total,
        })
        .await
    }

    /// Cluster resource usage (live).
    pub async fn cluster_metrics(&self, sample: ClusterMetricsSample) -> Result<()> {
        self.emit(&sample).await
    }

    /// Application sync/health status changed (live + durable).
    pub async fn application_status_changed(
        &self,
        application_id: &str,
        sync_status: &str,
        health_status: &str,
    ) -> Result<()> {
        self.emit(&ApplicationStatusChanged {
            application_id: application_id.to_string(),
            sync_status: sync_status.to_string(),
            health_status: health_status.to_string(),
        })
        .await
    }

    /// Application sync finished (live + durable).
    pub async fn application_synced(
        &self,
        application_id: &str,
        revision: &str,
        outcome: std::result::Result<(), String>,
    ) -> Result<()> {
        self.emit(&ApplicationSynced {
            application_id: application_id.to_string(),
            revision: revision.to_string(),
            succeeded: outcome.is_ok(),
            message: outcome.err(),
        })
        .await
    }

    /// Pipeline run status changed (live + durable).
    pub async fn pipeline_status_changed(
        &self,
        pipeline_id: &str,
        run_id: &str,
        status: &str,
    ) -> Result<()> {
        self.emit(&PipelineStatusChanged {
            pipeline_id: pipeline_id.to_string(),
            run_id: run_id.to_string(),
            status: status.to_string(),
        })
        .await
    }

    /// Pipeline stage finished (live + durable).
    pub async fn pipeline_stage_completed(&self, stage: PipelineStageCompleted) -> Result<()> {
        self.emit(&stage).await
    }

    /// Pipeline output line (live).
    pub async fn pipeline_log(
        &self,
        pipeline_id: &str,
        run_id: &str,
        stage: &str,
        line: &str,
    ) -> Result<()> {
        self.emit(&PipelineLogLine {
            pipeline_id: pipeline_id.to_string(),
            run_id: run_id.to_string(),
            stage: stage.to_string(),
            line: line.to_string(),
        })
        .await
    }

    /// Pod phase changed (live).
    pub async fn pod_status_changed(
        &self,
        namespace: &str,
        pod: &str,
        phase: &str,
        ready: bool,
    ) -> Result<()> {
        self.emit(&PodStatusChanged {
            namespace: namespace.to_string(),
            pod: pod.to_string(),
            phase: phase.to_string(),
            ready,
        })
        .await
    }

    /// Container log lines (live).
    pub async fn pod_logs(&self, chunk: PodLogChunk) -> Result<()> {
        self.emit(&chunk).await
    }

    /// Release rollout finished (durable).
    pub async fn deployment_completed(&self, deployment: DeploymentCompleted) -> Result<()> {
        self.emit(&deployment).await
    }

    /// Image scan alert (live + durable).
    pub async fn security_scan_alert(&self, alert: SecurityScanAlert) -> Result<()> {
        self.emit(&alert).await
    }

    /// Operator alert (live + durable).
    pub async fn alert_raised(
        &self,
        alert_id: &str,
        severity: Severity,
        title: &str,
        message: &str,
        resource: Option<&str>,
    ) -> Result<()> {
        self.emit(&AlertRaised {
            alert_id: alert_id.to_string(),
            severity,
            title: title.to_string(),
            message: message.to_string(),
            resource: resource.map(str::to_string),
        })
        .await
    }

    /// Audit trail entry (durable).
    pub async fn audit(&self, actor: &str, action: &str, resource: &str, outcome: &str) -> Result<()> {
        self.emit(&AuditRecorded {
            actor: actor.to_string(),
            action: action.to_string(),
            resource: resource.to_string(),
            outcome: outcome.to_string(),
        })
        .await
    }

    /// Cost estimate refresh (live).
    pub async fn cost_update(&self, update: CostUpdate) -> Result<()> {
        self.emit(&update).await
    }
}

#[cfg(test)]
mod tests;
