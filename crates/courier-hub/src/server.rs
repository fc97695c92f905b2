//! Axum HTTP + WebSocket front end for the [`Hub`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use courier_core::close_code;
use courier_core::security::bearer_token;
use futures::{SinkExt, StreamExt};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::config::HubConfig;
use crate::errors::HubError;
use crate::link::LinkFrame;
use crate::relay::Hub;
use crate::shutdown::{ShutdownCoordinator, DEFAULT_DRAIN_TIMEOUT};

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub metrics: Option<PrometheusHandle>,
    pub shutdown: CancellationToken,
}

/// Credentials and identity passed on the upgrade URL.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    pub token: Option<String>,
    pub id: Option<String>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(caller_ws))
        .route("/ws/endpoint", get(endpoint_ws))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind and serve. Returns once the listener is up.
pub async fn start(
    config: HubConfig,
    metrics: Option<PrometheusHandle>,
) -> Result<ServerHandle, HubError> {
    let addr = config.bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|source| HubError::Bind {
            addr: addr.clone(),
            source,
        })?;
    let local_addr = listener.local_addr()?;

    let hub = Arc::new(Hub::new(config));
    let shutdown = Arc::new(ShutdownCoordinator::new());
    let router = build_router(AppState {
        hub: Arc::clone(&hub),
        metrics,
        shutdown: shutdown.token(),
    });

    let token = shutdown.token();
    shutdown.track(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(token.cancelled_owned())
            .await
        {
            error!(error = %e, "relay hub server failed");
        }
    }));
    shutdown.track(spawn_sweeper(Arc::clone(&hub), shutdown.token()));

    info!(
        %local_addr,
        auth = hub.config().auth_required(),
        "relay hub listening"
    );
    Ok(ServerHandle {
        local_addr,
        hub,
        shutdown,
    })
}

/// Keeps the server's background tasks alive and stops them on request.
pub struct ServerHandle {
    local_addr: SocketAddr,
    hub: Arc<Hub>,
    shutdown: Arc<ShutdownCoordinator>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Close every socket with "going away" and wait for tasks to finish.
    pub async fn shutdown(self) {
        info!("relay hub shutting down");
        self.shutdown.drain(DEFAULT_DRAIN_TIMEOUT).await;
    }
}

/// Drop connections that stopped answering heartbeats.
fn spawn_sweeper(hub: Arc<Hub>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    let period = hub.config().heartbeat_interval;
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let dropped = hub.sweep_stale();
                    if dropped > 0 {
                        info!(dropped, "stale connection sweep");
                    }
                }
                () = cancel.cancelled() => break,
            }
        }
    })
}

fn presented_token<'a>(headers: &'a HeaderMap, params: &'a ConnectParams) -> Option<&'a str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token)
        .or(params.token.as_deref())
}

fn close_message(code: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.to_owned().into(),
    }))
}

/// Finish the upgrade only to close it with the policy-violation code.
async fn reject_unauthorized(mut socket: WebSocket) {
    let _ = socket
        .send(close_message(close_code::POLICY_VIOLATION, "Unauthorized"))
        .await;
}

fn heartbeat(period: Duration) -> tokio::time::Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// GET /ws
async fn caller_ws(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(params): Query<ConnectParams>,
    State(state): State<AppState>,
) -> Response {
    let config = state.hub.config();
    if !config.authorize(presented_token(&headers, &params)) {
        warn!("rejecting caller with bad credentials");
        return ws.on_upgrade(reject_unauthorized).into_response();
    }
    if state.hub.callers().count() >= config.max_connections {
        warn!(max = config.max_connections, "caller limit reached");
        return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
    }
    ws.on_upgrade(move |socket| run_caller(socket, state))
        .into_response()
}

async fn run_caller(socket: WebSocket, state: AppState) {
    let hub = state.hub;
    let (client_id, mut outgoing) = hub.connect_caller();
    let (mut sink, mut stream) = socket.split();
    let mut ticker = heartbeat(hub.config().heartbeat_interval);

    loop {
        tokio::select! {
            queued = outgoing.recv() => {
                // None: the registry dropped us (stale or shut down)
                let Some(text) = queued else {
                    let _ = sink
                        .send(close_message(close_code::GOING_AWAY, "Connection timed out"))
                        .await;
                    break;
                };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => hub.handle_caller_text(&client_id, text.as_str()),
                Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => hub.handle_caller_text(&client_id, text),
                    Err(_) => debug!(client_id = %client_id, "ignoring non-utf8 binary frame"),
                },
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => hub.callers().touch(&client_id),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(client_id = %client_id, error = %e, "caller socket error");
                    break;
                }
            },
            _ = ticker.tick() => {
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            () = state.shutdown.cancelled() => {
                let _ = sink
                    .send(close_message(close_code::GOING_AWAY, "Server shutting down"))
                    .await;
                break;
            }
        }
    }
    hub.disconnect_caller(&client_id);
}

/// GET /ws/endpoint?id=..&token=..
async fn endpoint_ws(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(params): Query<ConnectParams>,
    State(state): State<AppState>,
) -> Response {
    if !state.hub.config().authorize(presented_token(&headers, &params)) {
        warn!(endpoint_id = ?params.id, "rejecting endpoint with bad credentials");
        return ws.on_upgrade(reject_unauthorized).into_response();
    }
    let endpoint_id = params.id.unwrap_or_else(|| "endpoint".to_owned());
    ws.on_upgrade(move |socket| run_endpoint(socket, state, endpoint_id))
        .into_response()
}

async fn run_endpoint(socket: WebSocket, state: AppState, endpoint_id: String) {
    let hub = state.hub;
    let (link_id, mut frames) = hub.attach_link(&endpoint_id);
    let (mut sink, mut stream) = socket.split();
    let mut ticker = heartbeat(hub.config().heartbeat_interval);

    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Some(LinkFrame::Text(text)) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Some(LinkFrame::Close { code, reason }) => {
                    let _ = sink.send(close_message(code, &reason)).await;
                    break;
                }
                None => break,
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => hub.handle_link_text(&link_id, text.as_str()),
                Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => hub.handle_link_text(&link_id, text),
                    Err(_) => debug!(link_id = %link_id, "ignoring non-utf8 binary frame"),
                },
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => hub.touch_link(&link_id),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(link_id = %link_id, error = %e, "endpoint socket error");
                    break;
                }
            },
            _ = ticker.tick() => {
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            () = state.shutdown.cancelled() => {
                let _ = sink
                    .send(close_message(close_code::GOING_AWAY, "Server shutting down"))
                    .await;
                break;
            }
        }
    }
    hub.detach_link(&link_id);
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let health = state.hub.health();
    let status = if health.endpoint_connected {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => crate::metrics::render(handle).into_response(),
        None => (StatusCode::NOT_FOUND, "metrics disabled").into_response(),
    }
}
