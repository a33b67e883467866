use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, warn, Instrument, Span};

use krustron_core::hub::{route_frame, InboundContext, InboundHandler};
use krustron_core::{HubHandle, Message};

use crate::server::AppState;

/// Missed pings tolerated before the reader gives up on a silent client.
const IDLE_PINGS: u32 = 2;
/// Time the writer gets to flush after unregister.
const WRITER_GRACE: Duration = Duration::from_secs(5);

/// Serve one upgraded socket until either side closes or the server stops.
pub async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    user_id: String,
    channels: Vec<String>,
) {
    let metadata = HashMap::from([("transport".to_string(), "websocket".to_string())]);
    let handle = match state.hub.register(user_id, metadata).await {
        Ok(handle) => handle,
        Err(e) => {
            warn!(error = %e, "Rejecting WebSocket connection");
            return;
        }
    };

    let span = info_span!("connection", conn_id = %handle.id, user = %handle.user_id);
    async move {
        info!("WebSocket connection opened");
        let conn_id = handle.id;
        let hub = state.hub.clone();

        for channel in channels {
            if let Err(e) = hub.subscribe(conn_id, channel.as_str()).await {
                warn!(channel = %channel, error = %e, "Initial subscribe failed");
            }
        }

        let (ws_tx, ws_rx) = socket.split();
        let ping_interval = state.realtime.ping_interval();
        let mut writer = tokio::spawn(
            write_loop(ws_tx, handle.receiver, ping_interval).instrument(Span::current()),
        );

        let ctx = InboundContext {
            conn_id,
            user_id: handle.user_id,
        };
        let reason = tokio::select! {
            reason = read_loop(ws_rx, &hub, &ctx, state.inbound.as_ref(), ping_interval * IDLE_PINGS) => reason,
            _ = &mut writer => "write failed",
            _ = state.shutdown.cancelled() => "server shutdown",
        };

        // Closes the outbound queue; the writer sends a close frame and exits.
        if let Err(e) = hub.unregister(conn_id).await {
            debug!(error = %e, "Unregister after hub stop");
        }
        if !writer.is_finished() && tokio::time::timeout(WRITER_GRACE, &mut writer).await.is_err() {
            writer.abort();
        }
        info!(reason, "WebSocket connection closed");
    }
    .instrument(span)
    .await;
}

/// Read frames until close, transport error, idle timeout, or hub stop.
async fn read_loop(
    mut ws_rx: SplitStream<WebSocket>,
    hub: &HubHandle,
    ctx: &InboundContext,
    inbound: &dyn InboundHandler,
    idle_timeout: Duration,
) -> &'static str {
    loop {
        let frame = match tokio::time::timeout(idle_timeout, ws_rx.next()).await {
            Ok(frame) => frame,
            Err(_) => return "idle timeout",
        };

        match frame {
            Some(Ok(WsMessage::Text(text))) => match route_frame(hub, ctx, &text, inbound).await {
                Ok(routed) => debug!(?routed, "Inbound frame"),
                Err(_) => return "hub closed",
            },
            Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => {
                if hub.touch(ctx.conn_id).await.is_err() {
                    return "hub closed";
                }
            }
            Some(Ok(WsMessage::Binary(_))) => {
                debug!("Ignoring binary frame");
            }
            Some(Ok(WsMessage::Close(_))) | None => return "client closed",
            Some(Err(e)) => {
                debug!(error = %e, "WebSocket read error");
                return "transport error";
            }
        }
    }
}

/// Drain the outbound queue to the socket and ping on a fixed interval.
async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, WsMessage>,
    mut queue: mpsc::Receiver<Arc<Message>>,
    ping_interval: Duration,
) {
    let mut ping = tokio::time::interval_at(
        tokio::time::Instant::now() + ping_interval,
        ping_interval,
    );

    loop {
        tokio::select! {
            message = queue.recv() => {
                let Some(message) = message else {
                    let _ = ws_tx.send(WsMessage::Close(None)).await;
                    return;
                };
                let text = match message.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(msg_type = %message.kind, error = %e, "Dropping unserializable message");
                        continue;
                    }
                };
                if let Err(e) = ws_tx.send(WsMessage::Text(text)).await {
                    debug!(error = %e, "WebSocket write failed");
                    return;
                }
            }
            _ = ping.tick() => {
                if ws_tx.send(WsMessage::Ping(Vec::new())).await.is_err() {
                    return;
                }
            }
        }
    }
}
