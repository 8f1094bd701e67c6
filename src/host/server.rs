//! Axum server exposing the keychain channel over WebSocket.
//!
//! Routes: `/channel` (WebSocket, origin-gated) and `/health`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
};
use serde::Serialize;
use tokio::sync::{RwLock, oneshot};
use tower_http::trace::TraceLayer;

use crate::channel::{Origin, RequestHandler};
use crate::error::ChannelError;

/// Shared state for the host routes.
pub struct HostState {
    pub handler: Arc<dyn RequestHandler>,
    /// Origins allowed to open a channel.
    pub allowed_origins: Vec<Origin>,
    pub allow_wildcard_target_origin: bool,
    /// Shutdown signal sender.
    pub shutdown_tx: RwLock<Option<oneshot::Sender<()>>>,
}

impl HostState {
    pub fn new(
        handler: Arc<dyn RequestHandler>,
        allowed_origins: Vec<Origin>,
        allow_wildcard_target_origin: bool,
    ) -> Self {
        Self {
            handler,
            allowed_origins,
            allow_wildcard_target_origin,
            shutdown_tx: RwLock::new(None),
        }
    }

    /// Stop accepting connections. Open sockets finish on their own.
    pub async fn shutdown(&self) {
        if let Some(tx) = self.shutdown_tx.write().await.take() {
            let _ = tx.send(());
        }
    }

    fn admit(&self, headers: &HeaderMap) -> Result<Origin, (StatusCode, String)> {
        // Browsers always send Origin on upgrades; its absence means a
        // client that is trying to skip the check.
        let raw = headers
            .get("origin")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                (
                    StatusCode::FORBIDDEN,
                    "WebSocket Origin header required".to_string(),
                )
            })?;
        let origin = Origin::parse(raw)
            .map_err(|_| (StatusCode::FORBIDDEN, "Invalid Origin header".to_string()))?;

        if !self.allowed_origins.contains(&origin) {
            tracing::warn!(%origin, "Channel origin not allowed");
            return Err((
                StatusCode::FORBIDDEN,
                "WebSocket origin not allowed".to_string(),
            ));
        }
        Ok(origin)
    }
}

/// Start the keychain host.
///
/// Returns the actual bound `SocketAddr` (useful when binding to port 0).
pub async fn start_server(
    addr: SocketAddr,
    state: Arc<HostState>,
) -> Result<SocketAddr, ChannelError> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ChannelError::StartupFailed(format!("Failed to bind to {addr}: {e}")))?;
    let bound_addr = listener
        .local_addr()
        .map_err(|e| ChannelError::StartupFailed(format!("Failed to get local addr: {e}")))?;

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/channel", get(channel_ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    *state.shutdown_tx.write().await = Some(shutdown_tx);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                tracing::info!("Keychain host shutting down");
            })
            .await
        {
            tracing::error!("Keychain host server error: {}", e);
        }
    });

    tracing::info!(addr = %bound_addr, "Keychain host listening");
    Ok(bound_addr)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    allowed_origins: usize,
}

async fn health_handler(State(state): State<Arc<HostState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        allowed_origins: state.allowed_origins.len(),
    })
}

async fn channel_ws_handler(
    headers: HeaderMap,
    ws: WebSocketUpgrade,
    State(state): State<Arc<HostState>>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let origin = state.admit(&headers)?;
    let handler = Arc::clone(&state.handler);
    let wildcard = state.allow_wildcard_target_origin;
    Ok(ws.on_upgrade(move |socket| {
        super::ws::handle_channel_socket(socket, origin, handler, wildcard)
    }))
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::channel::{ConnectionContext, RequestPayload};

    struct Noop;

    #[async_trait]
    impl RequestHandler for Noop {
        async fn handle(&self, _request: RequestPayload, _ctx: ConnectionContext) {}
    }

    fn state() -> HostState {
        HostState::new(
            Arc::new(Noop),
            vec![Origin::parse("https://game.example").unwrap()],
            false,
        )
    }

    fn headers(origin: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("origin", origin.parse().unwrap());
        headers
    }

    #[test]
    fn admits_only_listed_origins() {
        let state = state();
        assert_eq!(
            state.admit(&headers("https://game.example")).unwrap().as_str(),
            "https://game.example"
        );
        // Default port and trailing path normalize away.
        assert!(state.admit(&headers("https://game.example:443/")).is_ok());

        for bad in [
            "https://game.example.evil.com",
            "http://game.example",
            "https://evil.example",
            "null",
        ] {
            let err = state.admit(&headers(bad)).unwrap_err();
            assert_eq!(err.0, StatusCode::FORBIDDEN, "{bad}");
        }
        assert_eq!(state.admit(&HeaderMap::new()).unwrap_err().0, StatusCode::FORBIDDEN);
    }
}
