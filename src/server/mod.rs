//! Server module for Krustron
//!
//! # Module Structure
//!
//! - `config`: Configuration structures for all server components
//! - `loader`: Configuration loading from files and environment
//! - `health`: `/health` endpoint
//! - `init`: Component startup, router, and run loop

pub mod config;
mod health;
mod init;
mod loader;

pub use config::{AppConfig, LogFormat, RealtimeConfig};
pub use init::{build_router, provision, run, start};
pub use loader::{default_config, load_config, DEFAULT_CONFIG};

use krustron_core::{EventBus, EventEmitter, HubHandle, InboundHandler};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Shared handles for HTTP and WebSocket handlers.
#[derive(Clone)]
pub struct AppState {
    pub hub: HubHandle,
    pub bus: Arc<EventBus>,
    /// Producer facade bound to this process's hub and bus
    pub emitter: EventEmitter,
    pub realtime: Arc<RealtimeConfig>,
    /// Hook for non-control client frames
    pub inbound: Arc<dyn InboundHandler>,
    /// Cancelled when the server begins shutting down
    pub shutdown: CancellationToken,
}
