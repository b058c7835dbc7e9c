//! Connection handlers for the Courier server.
//!
//! This module owns the HTTP surface and the connection gateway: it upgrades
//! WebSocket requests, runs one writer task per connection and feeds every
//! decoded frame to the routing task.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    http::header,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use courier_core::{
    CloseReason, HandleId, Inbound, IntakeReceiver, IntakeSender, Outbound,
    Router as CourierRouter, SessionId,
};
use courier_protocol::codec;
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The message router.
    pub router: Arc<CourierRouter>,
    /// Producer side of the routing queue.
    pub intake: IntakeSender,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state and the receiving end of its routing queue.
    #[must_use]
    pub fn new(config: Config) -> (Self, IntakeReceiver) {
        let router = Arc::new(CourierRouter::with_config(config.router_config()));
        let (intake, intake_rx) = router.intake();

        (
            Self {
                router,
                intake,
                config,
            },
            intake_rx,
        )
    }
}

/// Spawn the routing task.
pub fn spawn_router(router: Arc<CourierRouter>, intake: IntakeReceiver) -> JoinHandle<()> {
    tokio::spawn(async move { router.run(intake).await })
}

/// Build the HTTP application.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(hello_handler))
        .route("/health", get(health_handler))
        .route("/nickname", get(online_users_handler))
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    serve(listener, config).await
}

/// Serve on an already bound listener.
///
/// # Errors
///
/// Returns an error if serving fails.
pub async fn serve(listener: TcpListener, config: Config) -> Result<()> {
    let (state, intake_rx) = AppState::new(config);
    let state = Arc::new(state);
    spawn_router(Arc::clone(&state.router), intake_rx);

    let addr = listener.local_addr()?;
    info!("Courier server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, state.config.transport.websocket_path
    );

    axum::serve(listener, app(state)).await?;

    Ok(())
}

/// Plain-text liveness probe.
async fn hello_handler() -> &'static str {
    "Hello world!"
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Online users handler.
async fn online_users_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")],
        Json(state.router.online_users()),
    )
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let (sender, mut receiver) = socket.split();
    let (handle, outbound) = state.router.handle();
    let origin = handle.id();
    let mut writer = tokio::spawn(write_outbound(sender, outbound, state.config.write_timeout()));

    let id = match state.router.connect(handle) {
        Ok(id) => id,
        Err(e) => {
            warn!(handle = %origin, error = %e, "Sending registration message to client failed");
            return;
        }
    };

    info!(session = %id, "New client");

    loop {
        tokio::select! {
            // The writer stops once the session is closed or a write fails
            _ = &mut writer => {
                debug!(session = %id, "Writer finished");
                break;
            }

            frame = receiver.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        if !forward(&state, &id, origin, text.as_bytes()).await {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Binary(data))) => {
                        if !forward(&state, &id, origin, &data).await {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => {
                        // Pongs are answered by the WebSocket layer
                    }
                    Some(Ok(WsMessage::Close(_))) => {
                        debug!(session = %id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(session = %id, error = %e, "WebSocket error");
                        metrics::record_transport_error("read");
                        break;
                    }
                    None => {
                        debug!(session = %id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    // No-op if the router already retired the session
    state.router.retire(id.as_str(), CloseReason::TransportClosed);

    debug!(session = %id, "WebSocket disconnected");
}

/// Decode a frame and queue it for routing.
///
/// Returns `false` if the read loop should stop.
async fn forward(state: &AppState, id: &SessionId, origin: HandleId, data: &[u8]) -> bool {
    metrics::record_message(data.len(), "inbound");

    match codec::decode_with_limit(data, state.config.limits.max_message_size) {
        Ok(message) => {
            // Waits here when the routing queue is full
            if state.intake.send(Inbound { message, origin }).await.is_err() {
                error!(session = %id, "Routing task is gone");
                return false;
            }
            true
        }
        Err(e) => {
            state.router.reject_malformed(id.as_str(), &e);
            false
        }
    }
}

/// Drain a session's outbound queue into its socket.
async fn write_outbound(
    mut sender: SplitSink<WebSocket, WsMessage>,
    mut outbound: mpsc::Receiver<Outbound>,
    write_timeout: Duration,
) {
    while let Some(item) = outbound.recv().await {
        let frame = match item {
            Outbound::Deliver(message) => match codec::encode(&message) {
                Ok(text) => {
                    metrics::record_message(text.len(), "outbound");
                    WsMessage::Text(text)
                }
                Err(e) => {
                    warn!(error = %e, "Encoding outbound message failed");
                    continue;
                }
            },
            Outbound::Close => {
                if let Err(e) = sender.send(WsMessage::Close(None)).await {
                    debug!(error = %e, "Sending close frame failed");
                }
                return;
            }
        };

        match tokio::time::timeout(write_timeout, sender.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(error = %e, "Write failed");
                metrics::record_transport_error("write");
                return;
            }
            Err(_) => {
                warn!("Write timed out, dropping connection");
                metrics::record_transport_error("write_timeout");
                return;
            }
        }
    }
}
