//! In-process emulation of two browsing contexts exchanging `postMessage`.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::channel::{MessageEvent, MessageSink, MessageSource, Origin, TargetOrigin};
use crate::error::ChannelError;

/// One side of a [`window_pair`].
pub struct Window {
    pub origin: Origin,
    /// Posts to the peer window.
    pub sink: Arc<dyn MessageSink>,
    /// Events delivered to this window.
    pub events: MessageSource,
    /// Raw access to this window's event queue, as any third party holding
    /// a reference to the window would have.
    pub inbox: mpsc::UnboundedSender<MessageEvent>,
}

/// Two connected windows. Each delivery is stamped with the sender's origin
/// and dropped when the recipient does not match `targetOrigin`.
pub fn window_pair(a: Origin, b: Origin) -> (Window, Window) {
    let (a_inbox, a_events) = mpsc::unbounded_channel();
    let (b_inbox, b_events) = mpsc::unbounded_channel();

    let a_sink = WindowSink {
        origin: a.clone(),
        peer: b.clone(),
        peer_inbox: b_inbox.clone(),
    };
    let b_sink = WindowSink {
        origin: b.clone(),
        peer: a.clone(),
        peer_inbox: a_inbox.clone(),
    };

    (
        Window {
            origin: a,
            sink: Arc::new(a_sink),
            events: a_events,
            inbox: a_inbox,
        },
        Window {
            origin: b,
            sink: Arc::new(b_sink),
            events: b_events,
            inbox: b_inbox,
        },
    )
}

struct WindowSink {
    origin: Origin,
    peer: Origin,
    peer_inbox: mpsc::UnboundedSender<MessageEvent>,
}

impl MessageSink for WindowSink {
    fn post_message(
        &self,
        data: serde_json::Value,
        target_origin: &TargetOrigin,
    ) -> Result<(), ChannelError> {
        if !target_origin.admits(&self.peer) {
            tracing::debug!(
                target_origin = %target_origin,
                recipient = %self.peer,
                "targetOrigin mismatch, message not delivered"
            );
            return Ok(());
        }
        self.peer_inbox
            .send(MessageEvent {
                origin: self.origin.to_string(),
                data,
            })
            .map_err(|_| ChannelError::SendFailed(format!("window {} is closed", self.peer)))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn delivers_with_sender_origin_and_honours_target() {
        let game = Origin::parse("https://game.example").unwrap();
        let keychain = Origin::parse("https://x.cartridge.gg").unwrap();
        let (game_window, mut keychain_window) = window_pair(game.clone(), keychain.clone());

        let elsewhere = TargetOrigin::Exact(Origin::parse("https://other.example").unwrap());
        game_window.sink.post_message(json!(1), &elsewhere).unwrap();
        game_window
            .sink
            .post_message(json!(2), &TargetOrigin::Exact(keychain))
            .unwrap();

        let event = keychain_window.events.recv().await.unwrap();
        assert_eq!(event.origin, game.as_str());
        assert_eq!(event.data, json!(2));
        assert!(keychain_window.events.try_recv().is_err());
    }
}
