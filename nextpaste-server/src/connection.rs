use std::{
    fmt,
    future::Future,
    sync::{
        Arc, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::{SinkExt, StreamExt, stream::SplitSink};
use serde::Serialize;
use tokio::{
    sync::{mpsc, watch},
    time::{MissedTickBehavior, timeout},
};
use tracing::{debug, info, warn};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// What the peer told us about itself in its handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PeerInfo {
    pub device_name: Option<String>,
    pub platform: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionSummary {
    pub id: String,
    pub device_name: Option<String>,
    pub platform: Option<String>,
    pub connected_at_unix_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    Full,
    Closed,
}

/// Shared handle to one live connection: its outbound queue and close signal.
///
/// Handles are cheap to clone; rooms keep one per member.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::Sender<Message>,
    closed: Arc<watch::Sender<bool>>,
    peer: Arc<RwLock<PeerInfo>>,
    connected_at: SystemTime,
}

impl ConnectionHandle {
    pub fn new(queue_capacity: usize) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let (closed, _) = watch::channel(false);
        let handle = Self {
            id: ConnectionId::next(),
            tx,
            closed: Arc::new(closed),
            peer: Arc::new(RwLock::new(PeerInfo::default())),
            connected_at: SystemTime::now(),
        };
        (handle, rx)
    }

    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queues a message without ever waiting for room in the queue.
    pub fn try_enqueue(&self, message: Message) -> Result<(), EnqueueError> {
        if self.is_closed() {
            return Err(EnqueueError::Closed);
        }
        self.tx.try_send(message).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => EnqueueError::Full,
            mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }

    /// Asks both loops of this connection to stop. Safe to call any number of times.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    #[must_use]
    pub fn peer(&self) -> PeerInfo {
        self.peer
            .read()
            .map(|peer| peer.clone())
            .unwrap_or_default()
    }

    pub fn set_peer(&self, info: PeerInfo) {
        if let Ok(mut peer) = self.peer.write() {
            *peer = info;
        }
    }

    #[must_use]
    pub fn connected_at(&self) -> SystemTime {
        self.connected_at
    }

    #[must_use]
    pub fn summary(&self) -> ConnectionSummary {
        let peer = self.peer();
        ConnectionSummary {
            id: self.id.to_string(),
            device_name: peer.device_name,
            platform: peer.platform,
            connected_at_unix_ms: self
                .connected_at
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
        }
    }

    /// Label for log lines: device name once known, connection id before that.
    #[must_use]
    pub fn label(&self) -> String {
        self.peer()
            .device_name
            .unwrap_or_else(|| self.id.to_string())
    }

    fn subscribe_closed(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LoopTimings {
    pub idle_timeout: Duration,
    pub keepalive_interval: Duration,
    pub write_timeout: Duration,
}

/// Shortest keepalive period the write loop will use.
pub const MIN_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);

impl LoopTimings {
    /// `keepalive_interval`, raised to [`MIN_KEEPALIVE_INTERVAL`] so a zero never reaches
    /// `tokio::time::interval`.
    #[must_use]
    pub fn keepalive_period(&self) -> Duration {
        self.keepalive_interval.max(MIN_KEEPALIVE_INTERVAL)
    }
}

/// Per-endpoint behaviour plugged into the generic read loop.
pub trait InboundHandler: Send + 'static {
    /// Called for every text or binary message, in arrival order.
    fn on_message(
        &mut self,
        conn: &ConnectionHandle,
        message: Message,
    ) -> impl Future<Output = ()> + Send;

    /// Called exactly once when the read loop ends, whatever the reason.
    fn on_close(&mut self, conn: &ConnectionHandle) -> impl Future<Output = ()> + Send;
}

/// Runs the read loop on the current task and the write loop on a spawned one
/// until the peer goes away, a timeout fires, or `conn.close()` is called.
pub async fn run_connection<H: InboundHandler>(
    socket: WebSocket,
    conn: ConnectionHandle,
    outbound_rx: mpsc::Receiver<Message>,
    mut handler: H,
    timings: LoopTimings,
) {
    let (ws_sender, mut ws_receiver) = socket.split();
    let mut writer = tokio::spawn(write_loop(ws_sender, outbound_rx, conn.clone(), timings));
    let mut closed_rx = conn.subscribe_closed();

    loop {
        let next = tokio::select! {
            _ = wait_closed(&mut closed_rx) => {
                debug!(conn = %conn.id(), "connection closed locally");
                break;
            }
            next = timeout(timings.idle_timeout, ws_receiver.next()) => next,
        };

        let message = match next {
            Err(_) => {
                warn!(
                    conn = %conn.id(),
                    "no traffic for {:?}; treating connection as dead",
                    timings.idle_timeout
                );
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(err))) => {
                debug!(conn = %conn.id(), "websocket receive error: {}", err);
                break;
            }
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
            message => handler.on_message(&conn, message).await,
        }
    }

    handler.on_close(&conn).await;
    conn.close();

    if timeout(timings.write_timeout, &mut writer).await.is_err() {
        writer.abort();
    }
    info!(conn = %conn.id(), peer = %conn.label(), "connection finished");
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound_rx: mpsc::Receiver<Message>,
    conn: ConnectionHandle,
    timings: LoopTimings,
) {
    let mut closed_rx = conn.subscribe_closed();
    let mut keepalive = tokio::time::interval(timings.keepalive_period());
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    keepalive.tick().await; // skip first immediate tick

    loop {
        tokio::select! {
            message = outbound_rx.recv() => {
                let Some(message) = message else { break };
                if !send_with_timeout(&mut sink, message, &conn, timings.write_timeout).await {
                    conn.close();
                    return;
                }
                keepalive.reset();
            }
            _ = keepalive.tick() => {
                let ping = Message::Ping(Bytes::new());
                if !send_with_timeout(&mut sink, ping, &conn, timings.write_timeout).await {
                    conn.close();
                    return;
                }
            }
            _ = wait_closed(&mut closed_rx) => break,
        }
    }

    // Whatever was queued before the close still goes out, then the close frame.
    while let Ok(message) = outbound_rx.try_recv() {
        if !send_with_timeout(&mut sink, message, &conn, timings.write_timeout).await {
            return;
        }
    }
    let _ = timeout(timings.write_timeout, sink.send(Message::Close(None))).await;
}

async fn send_with_timeout(
    sink: &mut SplitSink<WebSocket, Message>,
    message: Message,
    conn: &ConnectionHandle,
    write_timeout: Duration,
) -> bool {
    match timeout(write_timeout, sink.send(message)).await {
        Ok(Ok(())) => true,
        Ok(Err(err)) => {
            debug!(conn = %conn.id(), "websocket write failed: {}", err);
            false
        }
        Err(_) => {
            warn!(conn = %conn.id(), "websocket write timed out after {:?}", write_timeout);
            false
        }
    }
}

async fn wait_closed(closed_rx: &mut watch::Receiver<bool>) {
    let _ = closed_rx.wait_for(|closed| *closed).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_keepalive_is_raised_to_the_minimum() {
        let timings = LoopTimings {
            idle_timeout: Duration::from_secs(60),
            keepalive_interval: Duration::ZERO,
            write_timeout: Duration::from_secs(10),
        };
        assert_eq!(timings.keepalive_period(), MIN_KEEPALIVE_INTERVAL);

        let slow = LoopTimings {
            keepalive_interval: Duration::from_secs(30),
            ..timings
        };
        assert_eq!(slow.keepalive_period(), Duration::from_secs(30));
    }

    #[test]
    fn connection_ids_are_unique() {
        let (a, _rx_a) = ConnectionHandle::new(1);
        let (b, _rx_b) = ConnectionHandle::new(1);
        assert_ne!(a.id(), b.id());
        assert!(a.id().to_string().starts_with("conn-"));
    }

    #[test]
    fn full_queue_rejects_without_blocking() {
        let (conn, mut rx) = ConnectionHandle::new(2);
        assert_eq!(conn.try_enqueue(Message::Binary(Bytes::from_static(b"1"))), Ok(()));
        assert_eq!(conn.try_enqueue(Message::Binary(Bytes::from_static(b"2"))), Ok(()));
        assert_eq!(
            conn.try_enqueue(Message::Binary(Bytes::from_static(b"3"))),
            Err(EnqueueError::Full)
        );
        assert_eq!(rx.try_recv().ok(), Some(Message::Binary(Bytes::from_static(b"1"))));
    }

    #[test]
    fn closed_connection_rejects_and_close_is_idempotent() {
        let (conn, _rx) = ConnectionHandle::new(4);
        conn.close();
        conn.close();
        assert!(conn.is_closed());
        assert_eq!(
            conn.try_enqueue(Message::Binary(Bytes::new())),
            Err(EnqueueError::Closed)
        );
    }

    #[test]
    fn peer_info_updates_label() {
        let (conn, _rx) = ConnectionHandle::new(1);
        assert_eq!(conn.label(), conn.id().to_string());
        conn.set_peer(PeerInfo {
            device_name: Some("studio-mac".to_owned()),
            platform: Some("macos".to_owned()),
        });
        assert_eq!(conn.label(), "studio-mac");
        assert_eq!(conn.summary().platform.as_deref(), Some("macos"));
    }
}
