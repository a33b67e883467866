//! Inbound frame routing for connection readers.
//!
//! Control frames (`ping`, `subscribe`, `unsubscribe`) become hub operations;
//! everything else goes to an [`InboundHandler`]. Malformed frames are logged
//! and ignored so a bad client message never tears the connection down.

use async_trait::async_trait;
use tracing::{debug, warn};

use super::actor::HubHandle;
use super::connection::ConnectionId;
use super::message::{Message, MessageType};
use crate::error::{Error, Result};

/// Identity of the connection a frame arrived on.
#[derive(Debug, Clone)]
pub struct InboundContext {
    /// Connection identity
    pub conn_id: ConnectionId,
    /// Caller identity
    pub user_id: String,
}

/// Application hook for non-control frames.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    /// Handle one frame. Errors are logged; the connection stays open.
    async fn on_message(&self, ctx: &InboundContext, message: Message) -> Result<()>;
}

/// Default hook: logs and discards application frames.
#[derive(Debug, Default, Clone, Copy)]
pub struct IgnoreInbound;

#[async_trait]
impl InboundHandler for IgnoreInbound {
    async fn on_message(&self, ctx: &InboundContext, message: Message) -> Result<()> {
        debug!(
            conn_id = %ctx.conn_id,
            msg_type = %message.kind,
            "No handler for inbound message"
        );
        Ok(())
    }
}

/// What the reader did with a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    /// Answered a ping
    Pong,
    /// Joined a channel
    Subscribed(String),
    /// Left a channel
    Unsubscribed(String),
    /// Passed to the application hook
    Forwarded(MessageType),
    /// Malformed or incomplete frame, ignored
    Ignored,
}

/// Route one text frame from a connection.
///
/// Only fails with [`Error::HubClosed`], which tells the reader to stop.
pub async fn route_frame(
    hub: &HubHandle,
    ctx: &InboundContext,
    text: &str,
    handler: &dyn InboundHandler,
) -> Result<Routed> {
    hub.touch(ctx.conn_id).await?;

    let message = match Message::from_json(text) {
        Ok(message) => message,
        Err(e) => {
            warn!(conn_id = %ctx.conn_id, error = %e, "Ignoring malformed frame");
            return Ok(Routed::Ignored);
        }
    };

    match message.kind {
        MessageType::Ping => {
            hub.send_to(ctx.conn_id, Message::pong()).await?;
            Ok(Routed::Pong)
        }
        MessageType::Subscribe | MessageType::Unsubscribe => {
            let Some(channel) = message.control_channel().map(str::to_string) else {
                warn!(conn_id = %ctx.conn_id, msg_type = %message.kind, "Control frame without channel");
                hub.send_to(
                    ctx.conn_id,
                    Message::error(format!("{} requires data.channel", message.kind)),
                )
                .await?;
                return Ok(Routed::Ignored);
            };
            if message.kind == MessageType::Subscribe {
                hub.subscribe(ctx.conn_id, channel.clone()).await?;
                Ok(Routed::Subscribed(channel))
            } else {
                hub.unsubscribe(ctx.conn_id, channel.clone()).await?;
                Ok(Routed::Unsubscribed(channel))
            }
        }
        _ => {
            let kind = message.kind.clone();
            if let Err(e) = handler.on_message(ctx, message).await {
                if matches!(e, Error::HubClosed) {
                    return Err(e);
                }
                warn!(conn_id = %ctx.conn_id, msg_type = %kind, error = %e, "Inbound handler failed");
            }
            Ok(Routed::Forwarded(kind))
        }
    }
}
