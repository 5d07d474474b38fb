use std::{future::Future, sync::Arc};

use axum::{
    Json, Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use nextpaste_core::{
    ClipboardContent, ClipboardSink, CodecError, DeviceId, FrameCodec, MessageType, Reassembler,
    ReassemblyError,
};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::{
    ServerConfig, ServerError,
    connection::{ConnectionHandle, ConnectionId, ConnectionSummary, InboundHandler, PeerInfo, run_connection},
    rooms::{BroadcastReport, Room},
};

struct DirectState {
    codec: FrameCodec,
    clients: Room,
    sink: Arc<dyn ClipboardSink>,
    config: ServerConfig,
}

/// A desktop peer that accepts clients directly on `/ws`.
///
/// All clients share one implicit room. Content they send lands in the local
/// clipboard sink and is re-sent to the other clients under this server's identity.
#[derive(Clone)]
pub struct DirectServer {
    inner: Arc<DirectState>,
}

impl DirectServer {
    pub fn new(sink: Arc<dyn ClipboardSink>, config: ServerConfig) -> Self {
        Self {
            inner: Arc::new(DirectState {
                codec: FrameCodec::new(),
                clients: Room::new("direct"),
                sink,
                config,
            }),
        }
    }

    #[must_use]
    pub fn device_id(&self) -> DeviceId {
        self.inner.codec.device_id()
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(healthz_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(self.clone())
    }

    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        info!(
            device_id = %self.device_id(),
            "direct server listening on {}",
            listener
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "unknown".to_owned())
        );

        let server = self.clone();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                shutdown.await;
                info!("direct server shutting down");
                server.shutdown().await;
            })
            .await?;
        Ok(())
    }

    /// Pushes a local clipboard change to every connected client.
    pub async fn broadcast_clipboard(
        &self,
        content: &ClipboardContent,
    ) -> Result<BroadcastReport, ServerError> {
        self.send_to_clients(content, None).await
    }

    pub async fn clients(&self) -> Vec<ConnectionSummary> {
        self.inner.clients.stats().await.members
    }

    pub async fn client_count(&self) -> usize {
        self.inner.clients.len().await
    }

    pub async fn shutdown(&self) {
        self.inner.clients.close_all().await;
    }

    async fn send_to_clients(
        &self,
        content: &ClipboardContent,
        exclude: Option<ConnectionId>,
    ) -> Result<BroadcastReport, ServerError> {
        let frames = content.encode(&self.inner.codec, self.inner.config.fragment_payload)?;
        let messages: Vec<Message> = frames.into_iter().map(Message::Binary).collect();
        Ok(self.inner.clients.broadcast(&messages, exclude).await)
    }
}

async fn healthz_handler() -> impl IntoResponse {
    Json(serde_json::json!({"ok": true}))
}

async fn ws_handler(ws: WebSocketUpgrade, State(server): State<DirectServer>) -> impl IntoResponse {
    let max_bytes = server.inner.config.max_message_bytes;
    ws.max_message_size(max_bytes)
        .max_frame_size(max_bytes)
        .on_upgrade(move |socket| handle_socket(server, socket))
}

async fn handle_socket(server: DirectServer, socket: WebSocket) {
    let (conn, outbound_rx) = ConnectionHandle::new(server.inner.config.queue_capacity);
    let timings = server.inner.config.timings();
    server.inner.clients.insert(conn.clone()).await;
    info!(conn = %conn.id(), "client connected");

    let handler = DirectHandler {
        reassembler: Reassembler::with_limit(server.inner.config.max_transfer_bytes),
        server,
    };
    run_connection(socket, conn, outbound_rx, handler, timings).await;
}

struct DirectHandler {
    server: DirectServer,
    reassembler: Reassembler,
}

impl DirectHandler {
    async fn deliver(&self, conn: &ConnectionHandle, content: ClipboardContent) {
        info!(
            from = %conn.label(),
            kind = %content.kind,
            bytes = content.bytes.len(),
            "received clipboard content"
        );
        self.server.inner.sink.write(content.clone());

        match self.server.send_to_clients(&content, Some(conn.id())).await {
            Ok(report) => debug!(
                delivered = report.delivered,
                dropped = report.dropped,
                "rebroadcast clipboard content"
            ),
            Err(err) => warn!("failed to rebroadcast clipboard content: {}", err),
        }
    }
}

impl InboundHandler for DirectHandler {
    async fn on_message(&mut self, conn: &ConnectionHandle, message: Message) {
        let Message::Binary(data) = message else {
            debug!(conn = %conn.id(), "ignoring non-binary message");
            return;
        };

        let frame = match self.server.inner.codec.decode(&data) {
            Ok(frame) => frame,
            Err(CodecError::Loopback) => return,
            Err(err) => {
                warn!(conn = %conn.id(), "dropping malformed frame: {}", err);
                return;
            }
        };

        match frame.kind {
            MessageType::Heartbeat => {}
            MessageType::Handshake => match frame.handshake() {
                Ok(info) => {
                    info!(conn = %conn.id(), device = %info.name, os = %info.os, "peer handshake");
                    conn.set_peer(PeerInfo {
                        device_name: Some(info.name),
                        platform: Some(info.os),
                    });
                }
                Err(err) => debug!(conn = %conn.id(), "unreadable handshake payload: {}", err),
            },
            MessageType::Text => match frame.text() {
                Ok("") => {}
                Ok(text) => {
                    let content = ClipboardContent::text(text);
                    self.deliver(conn, content).await;
                }
                Err(err) => warn!(conn = %conn.id(), "dropping text frame: {}", err),
            },
            MessageType::Image | MessageType::File => match self.reassembler.ingest(&frame) {
                Ok(Some(transfer)) => {
                    let content = ClipboardContent::from(transfer);
                    self.deliver(conn, content).await;
                }
                Ok(None) => {}
                Err(err @ ReassemblyError::Orphan { .. }) => {
                    debug!(conn = %conn.id(), "{}", err);
                }
                Err(err) => warn!(conn = %conn.id(), "dropping transfer: {}", err),
            },
        }
    }

    async fn on_close(&mut self, conn: &ConnectionHandle) {
        self.reassembler.reset();
        self.server.inner.clients.remove(conn.id()).await;
        info!(conn = %conn.id(), peer = %conn.label(), "client disconnected");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use nextpaste_core::ClipboardKind;

    use super::*;

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<ClipboardContent>>);

    impl ClipboardSink for RecordingSink {
        fn write(&self, content: ClipboardContent) {
            self.0.lock().unwrap().push(content);
        }
    }

    #[tokio::test]
    async fn broadcast_clipboard_fragments_for_every_client() {
        let config = ServerConfig {
            fragment_payload: 1024,
            ..ServerConfig::default()
        };
        let server = DirectServer::new(Arc::new(RecordingSink::default()), config);
        let (a, mut rx_a) = ConnectionHandle::new(16);
        let (b, mut rx_b) = ConnectionHandle::new(16);
        server.inner.clients.insert(a).await;
        server.inner.clients.insert(b).await;

        let image = ClipboardContent::image(vec![3_u8; 3000], "image/png");
        let report = server.broadcast_clipboard(&image).await.unwrap();
        assert_eq!(report, BroadcastReport { delivered: 2, dropped: 0 });

        for rx in [&mut rx_a, &mut rx_b] {
            let mut reassembler = Reassembler::new();
            let codec = FrameCodec::new();
            let mut done = None;
            while let Ok(Message::Binary(data)) = rx.try_recv() {
                let frame = codec.decode(&data).unwrap();
                assert_eq!(frame.sender, server.device_id());
                if let Some(transfer) = reassembler.ingest(&frame).unwrap() {
                    done = Some(ClipboardContent::from(transfer));
                }
            }
            let done = done.expect("transfer completes");
            assert_eq!(done.kind, ClipboardKind::Image);
            assert_eq!(done.bytes, image.bytes);
        }
    }

    #[tokio::test]
    async fn empty_text_is_rejected_before_broadcast() {
        let server = DirectServer::new(Arc::new(RecordingSink::default()), ServerConfig::default());
        let err = server
            .broadcast_clipboard(&ClipboardContent::text(""))
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Codec(CodecError::EmptyInput)));
    }

    #[tokio::test]
    async fn inbound_text_reaches_sink_and_other_clients() {
        let sink = Arc::new(RecordingSink::default());
        let server = DirectServer::new(sink.clone(), ServerConfig::default());
        let (sender, mut rx_sender) = ConnectionHandle::new(8);
        let (other, mut rx_other) = ConnectionHandle::new(8);
        server.inner.clients.insert(sender.clone()).await;
        server.inner.clients.insert(other).await;

        let peer = FrameCodec::new();
        let mut handler = DirectHandler {
            server: server.clone(),
            reassembler: Reassembler::new(),
        };
        let frame = peer.encode_text("hello desk").unwrap();
        handler.on_message(&sender, Message::Binary(frame)).await;

        assert_eq!(
            sink.0.lock().unwrap().as_slice(),
            &[ClipboardContent::text("hello desk")]
        );
        assert!(rx_sender.try_recv().is_err());
        let Ok(Message::Binary(data)) = rx_other.try_recv() else {
            panic!("other client should receive the rebroadcast");
        };
        let frame = peer.decode(&data).unwrap();
        assert_eq!(frame.sender, server.device_id());
        assert_eq!(frame.text().unwrap(), "hello desk");
    }

    #[tokio::test]
    async fn own_frames_and_heartbeats_are_ignored() {
        let sink = Arc::new(RecordingSink::default());
        let server = DirectServer::new(sink.clone(), ServerConfig::default());
        let (conn, _rx) = ConnectionHandle::new(8);
        let mut handler = DirectHandler {
            server: server.clone(),
            reassembler: Reassembler::new(),
        };

        let own = server.inner.codec.encode_text("echo").unwrap();
        handler.on_message(&conn, Message::Binary(own)).await;
        let heartbeat = FrameCodec::new().encode_heartbeat();
        handler.on_message(&conn, Message::Binary(heartbeat)).await;

        assert!(sink.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn handshake_records_peer_info() {
        let server = DirectServer::new(Arc::new(RecordingSink::default()), ServerConfig::default());
        let (conn, _rx) = ConnectionHandle::new(8);
        server.inner.clients.insert(conn.clone()).await;
        let mut handler = DirectHandler {
            server: server.clone(),
            reassembler: Reassembler::new(),
        };

        let frame = FrameCodec::new().encode_handshake("laptop", "linux").unwrap();
        handler.on_message(&conn, Message::Binary(frame)).await;

        let clients = server.clients().await;
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].device_name.as_deref(), Some("laptop"));
        assert_eq!(clients[0].platform.as_deref(), Some("linux"));

        handler.on_close(&conn).await;
        assert_eq!(server.client_count().await, 0);
    }
}
