//! Live WebSocket endpoint
//!
//! `GET /ws?user=<id>&channels=a,b` upgrades to a hub connection. Channels
//! listed in the query are joined before the first frame is read; more can be
//! joined with `subscribe` frames.

pub mod connection;

use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    response::IntoResponse,
    routing::get,
    Router,
};
use serde::Deserialize;

use crate::server::AppState;
use connection::handle_socket;

const ANONYMOUS_USER: &str = "anonymous";

/// Upgrade query parameters
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    /// Caller identity
    pub user: Option<String>,
    /// Comma-separated channels to join on connect
    pub channels: Option<String>,
}

impl ConnectParams {
    fn user_id(&self) -> String {
        self.user
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .unwrap_or(ANONYMOUS_USER)
            .to_string()
    }

    fn initial_channels(&self) -> Vec<String> {
        self.channels
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// WebSocket upgrade handler for `/ws`.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let user_id = params.user_id();
    let channels = params.initial_channels();
    ws.max_message_size(state.realtime.max_message_bytes)
        .on_upgrade(move |socket| handle_socket(socket, state, user_id, channels))
}

/// Create the WebSocket router
pub fn websocket_router() -> Router<AppState> {
    Router::new().route("/ws", get(ws_handler))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_params() {
        let params = ConnectParams {
            user: Some("  alice ".into()),
            channels: Some("cluster:c1, ,alerts".into()),
        };
        assert_eq!(params.user_id(), "alice");
        assert_eq!(params.initial_channels(), vec!["cluster:c1", "alerts"]);

        let empty = ConnectParams::default();
        assert_eq!(empty.user_id(), "anonymous");
        assert!(empty.initial_channels().is_empty());
    }
}
