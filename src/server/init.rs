//! Server initialization and run loop

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use krustron_core::hub::IgnoreInbound;
use krustron_core::{
    connect_broker, wait_for_shutdown_signal, EventBus, EventEmitter, Hub, ShutdownController,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, info_span, warn};

use super::config::AppConfig;
use super::health::health_check;
use super::AppState;
use crate::websocket::websocket_router;

/// Extra time the controller waits beyond the bus drain window.
const SHUTDOWN_SLACK: Duration = Duration::from_secs(5);

/// Connect the broker, provision streams, and start the hub.
///
/// The hub runs as a task tracked by `shutdown`.
pub async fn start(config: &AppConfig, shutdown: &ShutdownController) -> Result<AppState> {
    let broker = connect_broker(&config.event_bus)
        .await
        .context("Failed to connect event bus broker")?;
    let bus = Arc::new(
        EventBus::new(broker, config.event_bus.clone()).with_span(info_span!("event_bus")),
    );
    let created = bus
        .provision_streams()
        .await
        .context("Failed to provision event streams")?;
    info!(created, broker = %bus.broker().name(), "Event bus ready");

    let (hub, handle) = Hub::new(config.realtime.hub.clone());
    shutdown.spawn(hub.with_span(info_span!("hub")).run(shutdown.token()));

    let emitter = EventEmitter::new("krustron")
        .with_hub(handle.clone())
        .with_bus(bus.clone());

    Ok(AppState {
        hub: handle,
        bus,
        emitter,
        realtime: Arc::new(config.realtime.clone()),
        inbound: Arc::new(IgnoreInbound),
        shutdown: shutdown.token(),
    })
}

/// Build the HTTP router: `/health` and `/ws`.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .merge(websocket_router())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the server until Ctrl+C or SIGTERM, then shut down in order:
/// stop accepting, close the hub, drain the event bus.
pub async fn run(config: AppConfig) -> Result<()> {
    let shutdown =
        ShutdownController::with_timeout(config.event_bus.drain_timeout() + SHUTDOWN_SLACK);
    let state = start(&config, &shutdown).await?;
    let bus = state.bus.clone();
    let app = build_router(state);

    let addr: SocketAddr = config
        .server
        .bind_addr()
        .parse()
        .context("Invalid server address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;
    info!("HTTP server listening on http://{}", addr);

    let controller = shutdown.clone();
    let signal = tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        controller.shutdown().await
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.token().cancelled_owned())
        .await
        .context("HTTP server error")?;

    let graceful = signal.await.unwrap_or(false);
    if let Err(e) = bus.drain(bus.config().drain_timeout()).await {
        warn!(error = %e, "Event bus did not drain cleanly");
    }

    info!(graceful, "Krustron shutdown complete");
    Ok(())
}

/// Ensure every domain stream exists, then disconnect.
pub async fn provision(config: &AppConfig) -> Result<usize> {
    let broker = connect_broker(&config.event_bus)
        .await
        .context("Failed to connect event bus broker")?;
    let bus = EventBus::new(broker, config.event_bus.clone());
    let created = bus
        .provision_streams()
        .await
        .context("Failed to provision event streams")?;
    bus.drain(config.event_bus.drain_timeout())
        .await
        .context("Failed to close event bus")?;
    Ok(created)
}
