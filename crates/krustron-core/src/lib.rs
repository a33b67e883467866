//! Krustron Core - Real-time Event Distribution
//!
//! This crate provides the event plumbing behind the Krustron control plane:
//! - Hub: live fan-out of updates to connected browser clients
//! - Event Bus: durable, subject-routed publish/subscribe between services
//! - Emitter: typed domain events routed to the hub and/or the bus
//! - Shutdown: coordinated cancellation and draining
//! - Utils: retry with backoff

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod emitter;
pub mod error;
pub mod event_bus;
pub mod hub;
pub mod shutdown;
pub mod utils;

pub use emitter::{DomainEvent, EventEmitter, Severity};
pub use error::{Error, Result};
pub use event_bus::{
    connect_broker, Broker, BrokerKind, Domain, Event, EventBus, EventBusConfig, EventHandler,
    MemoryBroker, ReceivedMessage, RedisBroker, SubscriptionId,
};
pub use hub::{
    ConnectionHandle, ConnectionId, Hub, HubConfig, HubHandle, HubStats, InboundHandler, Message,
    MessageType, StalePolicy,
};
pub use shutdown::{wait_for_shutdown_signal, ShutdownController, ShutdownPhase};
pub use utils::{retry_with_backoff, RetryConfig};
