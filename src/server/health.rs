//! Health endpoint

use axum::{extract::State, http::StatusCode, Json};
use krustron_core::HubStats;
use serde::Serialize;

use super::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    /// Absent when the hub has stopped
    pub hub: Option<HubStats>,
    pub event_bus: EventBusHealth,
}

#[derive(Debug, Serialize)]
pub struct EventBusHealth {
    pub broker: String,
    pub connected: bool,
    pub draining: bool,
    pub subscriptions: usize,
}

/// `healthy` when hub and broker are up, `degraded` when the broker is
/// reconnecting, `unhealthy` (503) once the hub has stopped.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let hub = state.hub.stats().await.ok();
    let event_bus = EventBusHealth {
        broker: state.bus.broker().name().to_string(),
        connected: state.bus.is_connected(),
        draining: state.bus.is_draining(),
        subscriptions: state.bus.subscription_count(),
    };

    let (code, status) = match (&hub, event_bus.connected) {
        (None, _) => (StatusCode::SERVICE_UNAVAILABLE, "unhealthy"),
        (Some(_), false) => (StatusCode::OK, "degraded"),
        (Some(_), true) => (StatusCode::OK, "healthy"),
    };

    (
        code,
        Json(HealthResponse {
            status,
            version: env!("CARGO_PKG_VERSION"),
            hub,
            event_bus,
        }),
    )
}
