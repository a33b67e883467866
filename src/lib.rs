//! Krustron server library
//!
//! HTTP/WebSocket transport and process wiring around `krustron-core`.

#![forbid(unsafe_code)]

pub mod server;
pub mod websocket;
