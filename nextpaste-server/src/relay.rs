use std::{future::Future, sync::Arc};

use axum::{
    Json, Router,
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use nextpaste_core::{Frame, MessageType, RoomId};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::{
    ServerConfig, ServerError,
    connection::{ConnectionHandle, InboundHandler, PeerInfo, run_connection},
    rooms::{RoomRegistry, RoomStats},
};

/// Rooms are scoped by namespace: a legacy room and a current room with the same
/// id never see each other's traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    /// Superseded JSON protocol, forwarded without inspection.
    Legacy,
    /// Binary frame protocol (V1.1).
    Current,
}

#[derive(Debug)]
struct RelayState {
    legacy: RoomRegistry,
    current: RoomRegistry,
    config: ServerConfig,
}

#[derive(Debug, Clone)]
pub struct AppState {
    inner: Arc<RelayState>,
}

impl AppState {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }

    #[must_use]
    pub fn with_config(config: ServerConfig) -> Self {
        Self {
            inner: Arc::new(RelayState {
                legacy: RoomRegistry::new(),
                current: RoomRegistry::new(),
                config,
            }),
        }
    }

    #[must_use]
    pub fn registry(&self, namespace: Namespace) -> &RoomRegistry {
        match namespace {
            Namespace::Legacy => &self.inner.legacy,
            Namespace::Current => &self.inner.current,
        }
    }

    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Closes every connection in both namespaces.
    pub async fn shutdown(&self) {
        self.inner.legacy.shutdown().await;
        self.inner.current.shutdown().await;
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    legacy: Vec<RoomStats>,
    current: Vec<RoomStats>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws/{room_id}", get(legacy_ws_handler))
        .route("/v11/ws/{room_id}", get(current_ws_handler))
        .route("/health", get(healthz_handler))
        .route("/healthz", get(healthz_handler))
        .route("/stats", get(stats_handler))
        .with_state(state)
}

/// Serves the relay until `shutdown` resolves, then closes every room.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<(), ServerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!(
        "relay listening on {}",
        listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_owned())
    );

    let shutdown_state = state.clone();
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move {
            shutdown.await;
            info!("relay shutting down");
            shutdown_state.shutdown().await;
        })
        .await?;
    Ok(())
}

async fn healthz_handler() -> impl IntoResponse {
    Json(serde_json::json!({"ok": true}))
}

async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(StatsResponse {
        legacy: state.registry(Namespace::Legacy).stats().await,
        current: state.registry(Namespace::Current).stats().await,
    })
}

async fn legacy_ws_handler(
    ws: WebSocketUpgrade,
    Path(room_id): Path<RoomId>,
    State(state): State<AppState>,
) -> Response {
    upgrade(ws, room_id, state, Namespace::Legacy)
}

async fn current_ws_handler(
    ws: WebSocketUpgrade,
    Path(room_id): Path<RoomId>,
    State(state): State<AppState>,
) -> Response {
    upgrade(ws, room_id, state, Namespace::Current)
}

fn upgrade(ws: WebSocketUpgrade, room_id: RoomId, state: AppState, namespace: Namespace) -> Response {
    if room_id.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "room id must not be empty").into_response();
    }

    let max_bytes = state.config().max_message_bytes;
    ws.max_message_size(max_bytes)
        .max_frame_size(max_bytes)
        .on_upgrade(move |socket| handle_socket(state, socket, room_id, namespace))
}

async fn handle_socket(state: AppState, socket: WebSocket, room_id: RoomId, namespace: Namespace) {
    let (conn, outbound_rx) = ConnectionHandle::new(state.config().queue_capacity);
    let timings = state.config().timings();

    state.registry(namespace).join(&room_id, conn.clone()).await;
    info!(conn = %conn.id(), room_id = %room_id, ?namespace, "client joined");

    let handler = RelayHandler {
        state,
        room_id,
        namespace,
    };
    run_connection(socket, conn, outbound_rx, handler, timings).await;
}

struct RelayHandler {
    state: AppState,
    room_id: RoomId,
    namespace: Namespace,
}

impl RelayHandler {
    async fn forward(&self, conn: &ConnectionHandle, message: Message) {
        let report = self
            .state
            .registry(self.namespace)
            .broadcast(&self.room_id, &[message], Some(conn.id()))
            .await;
        debug!(
            conn = %conn.id(),
            room_id = %self.room_id,
            delivered = report.delivered,
            dropped = report.dropped,
            "forwarded message"
        );
    }

    async fn on_current(&self, conn: &ConnectionHandle, message: Message) {
        let Message::Binary(data) = message else {
            debug!(conn = %conn.id(), "ignoring non-binary message on frame namespace");
            return;
        };

        let frame = match Frame::parse_bytes(&data) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(conn = %conn.id(), room_id = %self.room_id, "dropping malformed frame: {}", err);
                return;
            }
        };

        match frame.kind {
            MessageType::Heartbeat => return,
            MessageType::Handshake => match frame.handshake() {
                Ok(info) => {
                    info!(
                        conn = %conn.id(),
                        room_id = %self.room_id,
                        device = %info.name,
                        os = %info.os,
                        ver = info.protocol_minor,
                        "peer handshake"
                    );
                    conn.set_peer(PeerInfo {
                        device_name: Some(info.name),
                        platform: Some(info.os),
                    });
                }
                Err(err) => debug!(conn = %conn.id(), "unreadable handshake payload: {}", err),
            },
            _ => {}
        }

        self.forward(conn, Message::Binary(data)).await;
    }
}

impl InboundHandler for RelayHandler {
    async fn on_message(&mut self, conn: &ConnectionHandle, message: Message) {
        match self.namespace {
            Namespace::Legacy => self.forward(conn, message).await,
            Namespace::Current => self.on_current(conn, message).await,
        }
    }

    async fn on_close(&mut self, conn: &ConnectionHandle) {
        self.state
            .registry(self.namespace)
            .leave(&self.room_id, conn.id())
            .await;
        info!(conn = %conn.id(), room_id = %self.room_id, "client left");
    }
}
