//! Origin-validated, correlated RPC over a `postMessage`-like transport.
//!
//! A [`Channel`] listens to [`MessageEvent`]s from one allowed origin and
//! posts through a [`MessageSink`]. Outbound calls get a fresh correlation
//! id and wait for the matching response. Inbound requests are handed to a
//! [`RequestHandler`] on their own task with a single-use
//! [`ConnectionContext`].

mod context;
pub mod memory;
mod origin;
mod wire;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use uuid::Uuid;

use crate::error::{ChannelError, ResponseCode, WireError};

pub use self::context::ConnectionContext;
pub use self::origin::{Origin, TargetOrigin};
pub use self::wire::{ChannelMessage, Handshake, RequestEnvelope, RequestPayload, ResponseEnvelope};

/// A delivered message: the sender's serialized origin plus its data.
#[derive(Debug, Clone)]
pub struct MessageEvent {
    pub origin: String,
    pub data: serde_json::Value,
}

/// Outbound half of a transport (`window.postMessage`).
pub trait MessageSink: Send + Sync {
    fn post_message(
        &self,
        data: serde_json::Value,
        target_origin: &TargetOrigin,
    ) -> Result<(), ChannelError>;
}

/// Inbound half of a transport.
pub type MessageSource = mpsc::UnboundedReceiver<MessageEvent>;

/// Serves requests arriving over a channel.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: RequestPayload, ctx: ConnectionContext);
}

#[derive(Clone, Default)]
pub struct ChannelOptions {
    /// Receives inbound requests. Without one, requests are rejected.
    pub handler: Option<Arc<dyn RequestHandler>>,
    /// Reported as `payload.origin` on outbound requests.
    pub local_origin: Option<Origin>,
    /// Post with `targetOrigin = "*"` instead of the allowed origin.
    pub allow_wildcard_target_origin: bool,
}

pub struct Channel;

impl Channel {
    /// Start listening on `events` and announce readiness to the peer.
    ///
    /// Must be called inside a tokio runtime.
    pub fn connect(
        sink: Arc<dyn MessageSink>,
        events: MessageSource,
        allowed_origin: Origin,
        options: ChannelOptions,
    ) -> ChannelConnection {
        let (ready_tx, ready_rx) = oneshot::channel();
        let target = if options.allow_wildcard_target_origin {
            tracing::warn!(origin = %allowed_origin, "Channel posts with wildcard targetOrigin");
            TargetOrigin::Any
        } else {
            TargetOrigin::Exact(allowed_origin.clone())
        };

        let shared = Arc::new(Shared {
            sink,
            allowed_origin,
            target,
            local_origin: options.local_origin,
            handler: options.handler,
            alive: AtomicBool::new(true),
            pending: Mutex::new(HashMap::new()),
            ready_tx: Mutex::new(Some(ready_tx)),
            listener: Mutex::new(None),
        });

        let task = tokio::spawn(listen(Arc::clone(&shared), events));
        *lock(&shared.listener) = Some(task.abort_handle());

        if let Err(e) = shared.post(&ChannelMessage::ready()) {
            tracing::debug!(error = %e, "Initial ready announcement not delivered");
        }

        ChannelConnection {
            ready: ready_rx,
            handle: ChannelHandle {
                guard: Arc::new(Guard { shared }),
            },
        }
    }
}

/// A channel that may not have completed its handshake yet.
pub struct ChannelConnection {
    ready: oneshot::Receiver<()>,
    handle: ChannelHandle,
}

impl ChannelConnection {
    pub fn handle(&self) -> ChannelHandle {
        self.handle.clone()
    }

    /// Wait for the peer's `ready` handshake.
    pub async fn ready(self) -> Result<RemoteHandle, ChannelError> {
        let Self { ready, handle } = self;
        ready.await.map_err(|_| ChannelError::Destroyed)?;
        Ok(RemoteHandle {
            guard: handle.guard,
        })
    }

    pub async fn ready_within(self, timeout: Duration) -> Result<RemoteHandle, ChannelError> {
        tokio::time::timeout(timeout, self.ready())
            .await
            .map_err(|_| ChannelError::Timeout(timeout))?
    }
}

/// Lifetime handle of a channel. Dropping the last handle (including every
/// [`RemoteHandle`]) destroys the channel.
#[derive(Clone)]
pub struct ChannelHandle {
    guard: Arc<Guard>,
}

impl ChannelHandle {
    /// Idempotent teardown: stops the listener and fails pending calls.
    pub fn destroy(&self) {
        self.guard.shared.destroy();
    }

    pub fn is_alive(&self) -> bool {
        self.guard.shared.is_alive()
    }

    pub fn allowed_origin(&self) -> &Origin {
        &self.guard.shared.allowed_origin
    }
}

/// Calls methods on the connected peer.
#[derive(Clone)]
pub struct RemoteHandle {
    guard: Arc<Guard>,
}

impl RemoteHandle {
    pub async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, ChannelError> {
        let (_, rx) = self.guard.shared.begin_call(method, params)?;
        settle(rx.await)
    }

    /// Like [`call`](Self::call), giving up after `timeout`. The pending
    /// entry is removed so a late response is dropped.
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, ChannelError> {
        let (id, rx) = self.guard.shared.begin_call(method, params)?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(outcome) => settle(outcome),
            Err(_) => {
                lock(&self.guard.shared.pending).remove(&id);
                Err(ChannelError::Timeout(timeout))
            }
        }
    }

    pub fn handle(&self) -> ChannelHandle {
        ChannelHandle {
            guard: Arc::clone(&self.guard),
        }
    }

    pub fn destroy(&self) {
        self.guard.shared.destroy();
    }
}

fn settle(
    outcome: Result<Result<serde_json::Value, WireError>, oneshot::error::RecvError>,
) -> Result<serde_json::Value, ChannelError> {
    match outcome {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => Err(ChannelError::Remote(error)),
        Err(_) => Err(ChannelError::Destroyed),
    }
}

struct Guard {
    shared: Arc<Shared>,
}

impl Drop for Guard {
    fn drop(&mut self) {
        self.shared.destroy();
    }
}

type PendingCall = oneshot::Sender<Result<serde_json::Value, WireError>>;

struct Shared {
    sink: Arc<dyn MessageSink>,
    allowed_origin: Origin,
    target: TargetOrigin,
    local_origin: Option<Origin>,
    handler: Option<Arc<dyn RequestHandler>>,
    alive: AtomicBool,
    pending: Mutex<HashMap<String, PendingCall>>,
    ready_tx: Mutex<Option<oneshot::Sender<()>>>,
    listener: Mutex<Option<AbortHandle>>,
}

impl Shared {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn post(&self, message: &ChannelMessage) -> Result<(), ChannelError> {
        let data = serde_json::to_value(message)
            .map_err(|e| ChannelError::InvalidMessage(e.to_string()))?;
        self.sink.post_message(data, &self.target)
    }

    fn destroy(&self) {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return;
        }
        // Dropping the senders fails every waiting call with `Destroyed`.
        let abandoned = {
            let mut pending = lock(&self.pending);
            let count = pending.len();
            pending.clear();
            count
        };
        lock(&self.ready_tx).take();
        if let Some(listener) = lock(&self.listener).take() {
            listener.abort();
        }
        tracing::debug!(origin = %self.allowed_origin, abandoned, "Channel destroyed");
    }

    fn begin_call(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<(String, oneshot::Receiver<Result<serde_json::Value, WireError>>), ChannelError>
    {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = lock(&self.pending);
            if !self.is_alive() {
                return Err(ChannelError::Destroyed);
            }
            pending.insert(id.clone(), tx);
        }

        let message = ChannelMessage::Request(RequestEnvelope {
            id: id.clone(),
            payload: RequestPayload {
                method: method.to_string(),
                origin: self.local_origin.as_ref().map(ToString::to_string),
                params,
            },
        });
        if let Err(e) = self.post(&message) {
            lock(&self.pending).remove(&id);
            return Err(e);
        }
        tracing::debug!(%id, method, "Channel call sent");
        Ok((id, rx))
    }

    fn dispatch(self: &Arc<Self>, event: MessageEvent) {
        match Origin::parse(&event.origin) {
            Ok(origin) if origin == self.allowed_origin => {}
            _ => {
                tracing::debug!(
                    origin = %event.origin,
                    expected = %self.allowed_origin,
                    "Dropping message from unexpected origin"
                );
                return;
            }
        }

        let message = match serde_json::from_value::<ChannelMessage>(event.data) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(error = %e, "Dropping unrecognized message");
                return;
            }
        };

        match message {
            ChannelMessage::Handshake { .. } => self.on_ready(),
            ChannelMessage::Request(request) => self.on_request(request),
            ChannelMessage::Response(response) => self.on_response(response),
        }
    }

    fn on_ready(&self) {
        let Some(ready_tx) = lock(&self.ready_tx).take() else {
            return;
        };
        if let Err(e) = self.post(&ChannelMessage::ready()) {
            tracing::debug!(error = %e, "Ready reply not delivered");
        }
        let _ = ready_tx.send(());
        tracing::debug!(origin = %self.allowed_origin, "Channel ready");
    }

    fn on_request(self: &Arc<Self>, request: RequestEnvelope) {
        let RequestEnvelope { id, payload } = request;
        let ctx = ConnectionContext::new(
            id,
            self.allowed_origin.clone(),
            payload.method.clone(),
            self.responder(),
        );

        let Some(handler) = self.handler.clone() else {
            ctx.reject(WireError::new(
                ResponseCode::UnknownMethod,
                format!("No handler for '{}'", payload.method),
            ));
            return;
        };
        tokio::spawn(async move {
            handler.handle(payload, ctx).await;
        });
    }

    fn on_response(&self, response: ResponseEnvelope) {
        let Some(tx) = lock(&self.pending).remove(&response.id) else {
            tracing::debug!(id = %response.id, "Dropping response with no pending call");
            return;
        };
        let _ = tx.send(response.into_result());
    }

    fn responder(self: &Arc<Self>) -> impl FnOnce(ResponseEnvelope) -> bool + Send + 'static {
        let shared = Arc::downgrade(self);
        move |envelope| {
            let Some(shared) = shared.upgrade() else {
                return false;
            };
            if !shared.is_alive() {
                return false;
            }
            match shared.post(&ChannelMessage::Response(envelope)) {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to post response");
                    false
                }
            }
        }
    }
}

async fn listen(shared: Arc<Shared>, mut events: MessageSource) {
    while let Some(event) = events.recv().await {
        if !shared.is_alive() {
            break;
        }
        shared.dispatch(event);
    }
    shared.destroy();
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::time::timeout;

    use super::memory::{Window, window_pair};
    use super::*;

    const STEP: Duration = Duration::from_secs(2);

    fn origins() -> (Origin, Origin) {
        (
            Origin::parse("https://game.example").unwrap(),
            Origin::parse("https://x.cartridge.gg").unwrap(),
        )
    }

    async fn next_message(window: &mut Window) -> ChannelMessage {
        let event = timeout(STEP, window.events.recv())
            .await
            .expect("timed out waiting for message")
            .expect("window closed");
        serde_json::from_value(event.data).unwrap()
    }

    /// Play the peer by hand: wait for its `ready` and answer it.
    async fn answer_handshake(raw: &mut Window, peer: &Origin) {
        loop {
            if let ChannelMessage::Handshake { .. } = next_message(raw).await {
                break;
            }
        }
        raw.sink
            .post_message(
                serde_json::to_value(ChannelMessage::ready()).unwrap(),
                &TargetOrigin::Exact(peer.clone()),
            )
            .unwrap();
    }

    async fn next_request(raw: &mut Window) -> RequestEnvelope {
        loop {
            if let ChannelMessage::Request(request) = next_message(raw).await {
                return request;
            }
        }
    }

    struct Echo;

    #[async_trait]
    impl RequestHandler for Echo {
        async fn handle(&self, request: RequestPayload, ctx: ConnectionContext) {
            ctx.resolve(json!({ "method": request.method, "params": request.params }));
        }
    }

    struct ResolveTwice {
        outcomes: mpsc::UnboundedSender<(bool, bool)>,
    }

    #[async_trait]
    impl RequestHandler for ResolveTwice {
        async fn handle(&self, _request: RequestPayload, ctx: ConnectionContext) {
            let first = ctx.resolve(json!("first"));
            let second = ctx.resolve(json!("second"));
            let _ = self.outcomes.send((first, second));
        }
    }

    #[tokio::test]
    async fn calls_round_trip_between_two_channels() {
        let (game, keychain) = origins();
        let (game_window, keychain_window) = window_pair(game.clone(), keychain.clone());

        let keychain_side = Channel::connect(
            keychain_window.sink,
            keychain_window.events,
            game.clone(),
            ChannelOptions {
                handler: Some(Arc::new(Echo)),
                ..Default::default()
            },
        );
        let game_side = Channel::connect(
            game_window.sink,
            game_window.events,
            keychain,
            ChannelOptions {
                local_origin: Some(game),
                ..Default::default()
            },
        );

        let _keychain_remote = keychain_side.ready_within(STEP).await.unwrap();
        let remote = game_side.ready_within(STEP).await.unwrap();
        let result = remote.call("probe", json!({ "a": 1 })).await.unwrap();
        assert_eq!(result, json!({ "method": "probe", "params": { "a": 1 } }));
    }

    #[tokio::test]
    async fn forged_origin_cannot_resolve_a_call() {
        let (game, keychain) = origins();
        let (game_window, mut keychain_window) = window_pair(game.clone(), keychain.clone());
        let forged_inbox = game_window.inbox.clone();

        let connection = Channel::connect(
            game_window.sink,
            game_window.events,
            keychain.clone(),
            ChannelOptions::default(),
        );
        answer_handshake(&mut keychain_window, &game).await;
        let remote = connection.ready_within(STEP).await.unwrap();

        let mut call = tokio::spawn({
            let remote = remote.clone();
            async move { remote.call("probe", json!(null)).await }
        });
        let request = next_request(&mut keychain_window).await;

        for forger in ["https://evil.example", "https://x.cartridge.gg.evil.com", "null"] {
            forged_inbox
                .send(MessageEvent {
                    origin: forger.to_string(),
                    data: json!({ "id": request.id, "result": "forged" }),
                })
                .unwrap();
        }
        assert!(
            timeout(Duration::from_millis(100), &mut call).await.is_err(),
            "forged response must not settle the call"
        );

        keychain_window
            .sink
            .post_message(
                json!({ "id": request.id, "result": "genuine" }),
                &TargetOrigin::Exact(game),
            )
            .unwrap();
        let result = timeout(STEP, call).await.unwrap().unwrap().unwrap();
        assert_eq!(result, json!("genuine"));
    }

    #[tokio::test]
    async fn second_resolve_posts_nothing() {
        let (game, keychain) = origins();
        let (mut game_window, keychain_window) = window_pair(game.clone(), keychain.clone());
        let (outcomes_tx, mut outcomes) = mpsc::unbounded_channel();

        let _connection = Channel::connect(
            keychain_window.sink,
            keychain_window.events,
            game,
            ChannelOptions {
                handler: Some(Arc::new(ResolveTwice {
                    outcomes: outcomes_tx,
                })),
                ..Default::default()
            },
        );

        let request = ChannelMessage::Request(RequestEnvelope {
            id: "req-1".to_string(),
            payload: RequestPayload {
                method: "probe".to_string(),
                origin: None,
                params: json!(null),
            },
        });
        game_window
            .sink
            .post_message(
                serde_json::to_value(request).unwrap(),
                &TargetOrigin::Exact(keychain),
            )
            .unwrap();

        assert_eq!(timeout(STEP, outcomes.recv()).await.unwrap(), Some((true, false)));

        let mut responses = Vec::new();
        while let Ok(Some(event)) =
            timeout(Duration::from_millis(100), game_window.events.recv()).await
        {
            if let Ok(ChannelMessage::Response(response)) = serde_json::from_value(event.data) {
                responses.push(response);
            }
        }
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].result, Some(json!("first")));
    }

    #[tokio::test]
    async fn destroy_fails_pending_and_later_calls() {
        let (game, keychain) = origins();
        let (game_window, mut keychain_window) = window_pair(game.clone(), keychain.clone());

        let connection = Channel::connect(
            game_window.sink,
            game_window.events,
            keychain,
            ChannelOptions::default(),
        );
        let handle = connection.handle();
        answer_handshake(&mut keychain_window, &game).await;
        let remote = connection.ready_within(STEP).await.unwrap();

        let call = tokio::spawn({
            let remote = remote.clone();
            async move { remote.call("execute", json!([])).await }
        });
        next_request(&mut keychain_window).await;

        handle.destroy();
        handle.destroy();
        assert!(!handle.is_alive());
        assert!(matches!(
            timeout(STEP, call).await.unwrap().unwrap(),
            Err(ChannelError::Destroyed)
        ));
        assert!(matches!(
            remote.call("probe", json!(null)).await,
            Err(ChannelError::Destroyed)
        ));
    }

    /// Hands every request context to the test instead of answering.
    struct Park {
        contexts: mpsc::UnboundedSender<ConnectionContext>,
    }

    #[async_trait]
    impl RequestHandler for Park {
        async fn handle(&self, _request: RequestPayload, ctx: ConnectionContext) {
            let _ = self.contexts.send(ctx);
        }
    }

    #[tokio::test]
    async fn destroy_mid_request_silences_responder() {
        let (game, keychain) = origins();
        let (mut game_window, keychain_window) = window_pair(game.clone(), keychain.clone());
        let (contexts_tx, mut contexts) = mpsc::unbounded_channel();

        let connection = Channel::connect(
            keychain_window.sink,
            keychain_window.events,
            game.clone(),
            ChannelOptions {
                handler: Some(Arc::new(Park {
                    contexts: contexts_tx,
                })),
                ..Default::default()
            },
        );
        answer_handshake(&mut game_window, &keychain).await;
        let remote = connection.ready_within(STEP).await.unwrap();

        let request = ChannelMessage::Request(RequestEnvelope {
            id: "req-1".to_string(),
            payload: RequestPayload {
                method: "execute".to_string(),
                origin: None,
                params: json!([]),
            },
        });
        game_window
            .sink
            .post_message(
                serde_json::to_value(request).unwrap(),
                &TargetOrigin::Exact(keychain),
            )
            .unwrap();
        let ctx = timeout(STEP, contexts.recv()).await.unwrap().unwrap();

        let call = tokio::spawn({
            let remote = remote.clone();
            async move { remote.call("probe", json!(null)).await }
        });
        next_request(&mut game_window).await;

        remote.destroy();
        assert!(matches!(
            timeout(STEP, call).await.unwrap().unwrap(),
            Err(ChannelError::Destroyed)
        ));
        assert!(!ctx.resolve(json!("late")));
        assert!(ctx.is_completed());

        while let Ok(Some(event)) =
            timeout(Duration::from_millis(100), game_window.events.recv()).await
        {
            let message: ChannelMessage = serde_json::from_value(event.data).unwrap();
            assert!(
                !matches!(message, ChannelMessage::Response(_)),
                "destroyed channel posted a response"
            );
        }
    }

    #[tokio::test]
    async fn call_with_timeout_drops_late_response() {
        let (game, keychain) = origins();
        let (game_window, mut keychain_window) = window_pair(game.clone(), keychain.clone());

        let connection = Channel::connect(
            game_window.sink,
            game_window.events,
            keychain,
            ChannelOptions::default(),
        );
        answer_handshake(&mut keychain_window, &game).await;
        let remote = connection.ready_within(STEP).await.unwrap();

        let outcome = remote
            .call_with_timeout("probe", json!(null), Duration::from_millis(50))
            .await;
        assert!(matches!(outcome, Err(ChannelError::Timeout(_))));

        let request = next_request(&mut keychain_window).await;
        keychain_window
            .sink
            .post_message(
                json!({ "id": request.id, "result": "late" }),
                &TargetOrigin::Exact(game),
            )
            .unwrap();
        assert!(remote.handle().is_alive());
    }

    #[tokio::test]
    async fn remote_errors_surface_as_wire_errors() {
        let (game, keychain) = origins();
        let (game_window, mut keychain_window) = window_pair(game.clone(), keychain.clone());

        let connection = Channel::connect(
            game_window.sink,
            game_window.events,
            keychain,
            ChannelOptions::default(),
        );
        answer_handshake(&mut keychain_window, &game).await;
        let remote = connection.ready_within(STEP).await.unwrap();

        let call = tokio::spawn({
            let remote = remote.clone();
            async move { remote.call("execute", json!([])).await }
        });
        let request = next_request(&mut keychain_window).await;
        keychain_window
            .sink
            .post_message(
                json!({
                    "id": request.id,
                    "error": { "code": "MISSING_SCOPES", "message": "missing scopes", "scopes": [] }
                }),
                &TargetOrigin::Exact(game),
            )
            .unwrap();

        match timeout(STEP, call).await.unwrap().unwrap() {
            Err(ChannelError::Remote(error)) => {
                assert_eq!(error.code, ResponseCode::MissingScopes);
                assert_eq!(error.scopes, Some(vec![]));
            }
            other => panic!("expected remote error, got {other:?}"),
        }
    }
}
