use serde::{Deserialize, Serialize};

use super::channels;
use crate::event_bus::Domain;
use crate::hub::MessageType;

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational
    Info,
    /// Needs attention
    Warning,
    /// Needs action now
    Critical,
}

/// A domain event the emitter knows how to route.
///
/// `live` names the hub channel for UI refresh; `durable` names the stream
/// domain and entity for cross-service delivery. Either may be absent.
pub trait DomainEvent: Serialize + Send + Sync {
    /// Event type used in durable subjects, e.g. `status-changed`
    const EVENT_TYPE: &'static str;

    /// Hub channel and message type, if the event refreshes live views.
    fn live(&self) -> Option<(String, MessageType)> {
        None
    }

    /// Stream domain and entity, if other services consume the event.
    fn durable(&self) -> Option<(Domain, String)> {
        None
    }
}

/// Cluster lifecycle status changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterStatusChanged {
    /// Cluster id
    pub cluster_id: String,
    /// New status
    pub status: String,
    /// Human-readable detail
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl DomainEvent for ClusterStatusChanged {
    const EVENT_TYPE: &'static str = "status-changed";

    fn live(&self) -> Option<(String, MessageType)> {
        Some((channels::cluster(&self.cluster_id), MessageType::ClusterStatus))
    }

    fn durable(&self) -> Option<(Domain, String)> {
        Some((Domain::Cluster, self.cluster_id.clone()))
    }
}

/// Periodic cluster health probe result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterHealthReport {
    /// Cluster id
    pub cluster_id: String,
    /// Overall verdict
    pub healthy: bool,
    /// Ready nodes
    pub nodes_ready: u32,
    /// All nodes
    pub nodes_total: u32,
}

impl DomainEvent for ClusterHealthReport {
    const EVENT_TYPE: &'static str = "health";

    fn live(&self) -> Option<(String, MessageType)> {
        Some((channels::cluster(&self.cluster_id), MessageType::ClusterHealth))
    }
}

/// Resource usage sample for a cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterMetricsSample {
    /// Cluster id
    pub cluster_id: String,
    /// CPU usage, 0.0..=1.0
    pub cpu_usage: f64,
    /// Memory usage, 0.0..=1.0
    pub memory_usage: f64,
    /// Running pods
    pub pod_count: u32,
}

impl DomainEvent for ClusterMetricsSample {
    const EVENT_TYPE: &'static str = "metrics";

    fn live(&self) -> Option<(String, MessageType)> {
        Some((channels::cluster(&self.cluster_id), MessageType::ClusterMetrics))
    }
}

/// GitOps application sync/health status changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationStatusChanged {
    /// Application id
    pub application_id: String,
    /// Sync status, e.g. `synced`, `out-of-sync`
    pub sync_status: String,
    /// Health status, e.g. `healthy`, `degraded`
    pub health_status: String,
}

impl DomainEvent for ApplicationStatusChanged {
    const EVENT_TYPE: &'static str = "status-changed";

    fn live(&self) -> Option<(String, MessageType)> {
        Some((
            channels::application(&self.application_id),
            MessageType::ApplicationStatus,
        ))
    }

    fn durable(&self) -> Option<(Domain, String)> {
        Some((Domain::Application, self.application_id.clone()))
    }
}

/// A sync operation finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationSynced {
    /// Application id
    pub application_id: String,
    /// Revision applied
    pub revision: String,
    /// Whether the sync succeeded
    pub succeeded: bool,
    /// Failure detail
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl DomainEvent for ApplicationSynced {
    const EVENT_TYPE: &'static str = "synced";

    fn live(&self) -> Option<(String, MessageType)> {
        Some((
            channels::application(&self.application_id),
            MessageType::ApplicationSync,
        ))
    }

    fn durable(&self) -> Option<(Domain, String)> {
        Some((Domain::Application, self.application_id.clone()))
    }
}

/// Pipeline run status changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStatusChanged {
    /// Pipeline id
    pub pipeline_id: String,
    /// Run id
    pub run_id: String,
    /// New status
    pub status: String,
}

impl DomainEvent for PipelineStatusChanged {
    const EVENT_TYPE: &'static str = "status-changed";

    fn live(&self) -> Option<(String, MessageType)> {
        Some((channels::pipeline(&self.pipeline_id), MessageType::PipelineStatus))
    }

    fn durable(&self) -> Option<(Domain, String)> {
        Some((Domain::Pipeline, self.pipeline_id.clone()))
    }
}

/// A pipeline stage finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStageCompleted {
    /// Pipeline id
    pub pipeline_id: String,
    /// Run id
    pub run_id: String,
    /// Stage name
    pub stage: String,
    /// Stage outcome
    pub status: String,
    /// Wall time
    pub duration_ms: u64,
}

impl DomainEvent for PipelineStageCompleted {
    const EVENT_TYPE: &'static str = "stage-completed";

    fn live(&self) -> Option<(String, MessageType)> {
        Some((channels::pipeline(&self.pipeline_id), MessageType::PipelineStatus))
    }

    fn durable(&self) -> Option<(Domain, String)> {
        Some((Domain::Pipeline, self.pipeline_id.clone()))
    }
}

/// One line of pipeline output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineLogLine {
    /// Pipeline id
    pub pipeline_id: String,
    /// Run id
    pub run_id: String,
    /// Stage producing the line
    pub stage: String,
    /// Log text
    pub line: String,
}

impl DomainEvent for PipelineLogLine {
    const EVENT_TYPE: &'static str = "log";

    fn live(&self) -> Option<(String, MessageType)> {
        Some((channels::pipeline(&self.pipeline_id), MessageType::PipelineLog))
    }
}

/// Pod phase or readiness changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodStatusChanged {
    /// Namespace
    pub namespace: String,
    /// Pod name
    pub pod: String,
    /// Pod phase
    pub phase: String,
    /// All containers ready
    pub ready: bool,
}

impl DomainEvent for PodStatusChanged {
    const EVENT_TYPE: &'static str = "status-changed";

    fn live(&self) -> Option<(String, MessageType)> {
        Some((channels::pod(&self.namespace, &self.pod), MessageType::PodStatus))
    }
}

/// A chunk of container logs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodLogChunk {
    /// Namespace
    pub namespace: String,
    /// Pod name
    pub pod: String,
    /// Container name
    pub container: String,
    /// Log lines in order
    pub lines: Vec<String>,
}

impl DomainEvent for PodLogChunk {
    const EVENT_TYPE: &'static str = "logs";

    fn live(&self) -> Option<(String, MessageType)> {
        Some((channels::pod(&self.namespace, &self.pod), MessageType::PodLogs))
    }
}

/// A release rollout finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentCompleted {
    /// Deployment id
    pub deployment_id: String,
    /// Release name
    pub release: String,
    /// Target namespace
    pub namespace: String,
    /// Release revision
    pub revision: u32,
    /// Outcome
    pub status: String,
}

impl DomainEvent for DeploymentCompleted {
    const EVENT_TYPE: &'static str = "completed";

    fn durable(&self) -> Option<(Domain, String)> {
        Some((Domain::Deployment, self.deployment_id.clone()))
    }
}

/// An image scan found vulnerabilities at or above the alert threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityScanAlert {
    /// Scanned image reference
    pub image: String,
    /// Scan id
    pub scan_id: String,
    /// Highest severity found
    pub severity: Severity,
    /// Critical findings
    pub critical: u32,
    /// High findings
    pub high: u32,
    /// Short summary
    pub summary: String,
}

impl DomainEvent for SecurityScanAlert {
    const EVENT_TYPE: &'static str = "scan-alert";

    fn live(&self) -> Option<(String, MessageType)> {
        Some((channels::ALERTS.to_string(), MessageType::Alert))
    }

    fn durable(&self) -> Option<(Domain, String)> {
        Some((Domain::Security, self.image.clone()))
    }
}

/// An operator alert fired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRaised {
    /// Alert id
    pub alert_id: String,
    /// Severity
    pub severity: Severity,
    /// Title
    pub title: String,
    /// Body
    pub message: String,
    /// Resource the alert is about
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
}

impl DomainEvent for AlertRaised {
    const EVENT_TYPE: &'static str = "raised";

    fn live(&self) -> Option<(String, MessageType)> {
        Some((channels::ALERTS.to_string(), MessageType::Alert))
    }

    fn durable(&self) -> Option<(Domain, String)> {
        Some((Domain::Alert, self.alert_id.clone()))
    }
}

/// An auditable action was performed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecorded {
    /// Acting user or service
    pub actor: String,
    /// Action, e.g. `cluster.delete`
    pub action: String,
    /// Target resource
    pub resource: String,
    /// `success` or `denied`
    pub outcome: String,
}

impl DomainEvent for AuditRecorded {
    const EVENT_TYPE: &'static str = "recorded";

    fn durable(&self) -> Option<(Domain, String)> {
        Some((Domain::Audit, self.actor.clone()))
    }
}

/// Cost estimate refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostUpdate {
    /// Scope the estimate covers, e.g. a cluster id or `total`
    pub scope: String,
    /// ISO currency code
    pub currency: String,
    /// Current hourly spend
    pub hourly: f64,
    /// Projected month total
    pub monthly_projection: f64,
}

impl DomainEvent for CostUpdate {
    const EVENT_TYPE: &'static str = "update";

    fn live(&self) -> Option<(String, MessageType)> {
        Some((channels::COST.to_string(), MessageType::CostUpdate))
    }
}
