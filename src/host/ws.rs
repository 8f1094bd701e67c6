//! Bridges one WebSocket connection into a [`Channel`].
//!
//! ```text
//!  socket ──► reader ──► MessageEvent{origin, data} ──► Channel listener
//!  socket ◄── writer ◄── SocketSink::post_message  ◄── Channel replies
//! ```
//!
//! The `Origin` header checked at upgrade time stamps every inbound frame,
//! the same way a browser stamps `MessageEvent.origin`.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::channel::{
    Channel, ChannelOptions, MessageEvent, MessageSink, Origin, RequestHandler, TargetOrigin,
};
use crate::error::ChannelError;

/// Outbound half: queues frames for the writer task.
struct SocketSink {
    peer: Origin,
    frames: mpsc::UnboundedSender<String>,
}

impl MessageSink for SocketSink {
    fn post_message(
        &self,
        data: serde_json::Value,
        target_origin: &TargetOrigin,
    ) -> Result<(), ChannelError> {
        if !target_origin.admits(&self.peer) {
            tracing::debug!(peer = %self.peer, target = %target_origin, "Dropping frame for another origin");
            return Ok(());
        }
        let frame = serde_json::to_string(&data)
            .map_err(|e| ChannelError::InvalidMessage(e.to_string()))?;
        self.frames
            .send(frame)
            .map_err(|_| ChannelError::SendFailed("socket closed".to_string()))
    }
}

/// Serve keychain requests over `socket` until either side closes it.
pub(crate) async fn handle_channel_socket(
    socket: WebSocket,
    peer: Origin,
    handler: Arc<dyn RequestHandler>,
    allow_wildcard_target_origin: bool,
) {
    let (mut sender, mut receiver) = socket.split();
    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<String>();
    let (event_tx, event_rx) = mpsc::unbounded_channel::<MessageEvent>();

    let sink = Arc::new(SocketSink {
        peer: peer.clone(),
        frames: frame_tx,
    });
    let connection = Channel::connect(
        sink,
        event_rx,
        peer.clone(),
        ChannelOptions {
            handler: Some(handler),
            local_origin: None,
            allow_wildcard_target_origin,
        },
    );
    let channel = connection.handle();
    tracing::info!(origin = %peer, "Channel socket connected");

    let writer = tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            if sender.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    while let Some(frame) = receiver.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        let data = match serde_json::from_str::<serde_json::Value>(text.as_str()) {
            Ok(data) => data,
            Err(e) => {
                tracing::debug!(origin = %peer, error = %e, "Ignoring non-JSON frame");
                continue;
            }
        };
        let event = MessageEvent {
            origin: peer.to_string(),
            data,
        };
        if event_tx.send(event).is_err() {
            break;
        }
    }

    channel.destroy();
    drop(connection);
    writer.abort();
    tracing::info!(origin = %peer, "Channel socket closed");
}
