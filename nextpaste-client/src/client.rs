use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use bytes::Bytes;
use futures::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use nextpaste_core::{
    ClipboardContent, ClipboardSink, CodecError, DeviceId, FrameCodec, MessageType, Reassembler,
    ReassemblyError,
};
use tokio::{
    net::TcpStream,
    sync::{
        mpsc::{self, error::TrySendError},
        watch,
    },
    task::JoinHandle,
    time::{MissedTickBehavior, timeout},
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{ClientConfig, ClientError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;

/// Invoked after every successful handshake, including reconnects.
pub type ConnectedHook = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting out the reconnect delay after a lost or failed session.
    Retrying,
}

struct SessionControl {
    /// Bumped by every `connect` and `disconnect`; a session loop only touches
    /// this state while its own generation is current.
    generation: u64,
    status: ConnectionStatus,
    ever_connected: bool,
    cancel: Option<watch::Sender<bool>>,
    outbound: Option<mpsc::Sender<Bytes>>,
    task: Option<JoinHandle<()>>,
    on_connected: Option<ConnectedHook>,
}

struct Shared {
    config: ClientConfig,
    codec: FrameCodec,
    sink: Arc<dyn ClipboardSink>,
    control: Mutex<SessionControl>,
}

impl Shared {
    fn control(&self) -> MutexGuard<'_, SessionControl> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, generation: u64, f: impl FnOnce(&mut SessionControl)) -> bool {
        let mut control = self.control();
        if control.generation != generation {
            return false;
        }
        f(&mut control);
        true
    }

    fn ever_connected(&self, generation: u64) -> bool {
        let control = self.control();
        control.generation == generation && control.ever_connected
    }
}

enum SessionEnd {
    Cancelled,
    ConnectFailed(String),
    Lost,
}

/// Keeps one device in sync with a relay room or a direct server.
///
/// A first connection failure is final. Once any attempt has succeeded, lost or
/// failed sessions are retried every `reconnect_delay` until [`SyncClient::disconnect`].
#[derive(Clone)]
pub struct SyncClient {
    shared: Arc<Shared>,
}

impl SyncClient {
    pub fn new(config: ClientConfig, sink: Arc<dyn ClipboardSink>) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                codec: FrameCodec::new(),
                sink,
                control: Mutex::new(SessionControl {
                    generation: 0,
                    status: ConnectionStatus::Disconnected,
                    ever_connected: false,
                    cancel: None,
                    outbound: None,
                    task: None,
                    on_connected: None,
                }),
            }),
        }
    }

    #[must_use]
    pub fn device_id(&self) -> DeviceId {
        self.shared.codec.device_id()
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    pub fn set_on_connected(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.shared.control().on_connected = Some(Arc::new(hook));
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.shared.control().status
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Starts the session loop in the background. Must be called from within a
    /// tokio runtime.
    pub fn connect(&self, url: &str) -> Result<(), ClientError> {
        let url = parse_server_url(url)?;

        let mut control = self.shared.control();
        if control.status != ConnectionStatus::Disconnected {
            return Err(ClientError::AlreadyConnected);
        }

        control.generation = control.generation.wrapping_add(1);
        control.status = ConnectionStatus::Connecting;
        control.ever_connected = false;
        control.outbound = None;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        control.cancel = Some(cancel_tx);
        control.task = Some(tokio::spawn(connect_loop(
            self.shared.clone(),
            url,
            control.generation,
            cancel_rx,
        )));
        Ok(())
    }

    /// Stops the session loop and closes the connection. Safe to call when idle.
    pub async fn disconnect(&self) {
        let (cancel, task) = {
            let mut control = self.shared.control();
            control.generation = control.generation.wrapping_add(1);
            control.status = ConnectionStatus::Disconnected;
            control.ever_connected = false;
            control.outbound = None;
            (control.cancel.take(), control.task.take())
        };

        let Some(cancel) = cancel else { return };
        cancel.send_replace(true);

        if let Some(mut task) = task {
            if timeout(self.shared.config.disconnect_grace(), &mut task)
                .await
                .is_err()
            {
                warn!("session did not stop within the grace period; aborting it");
                task.abort();
            }
        }
        info!("disconnected");
    }

    pub async fn send_text(&self, text: &str) -> Result<(), ClientError> {
        let outbound = self.outbound()?;
        let frame = self.shared.codec.encode_text(text)?;
        enqueue(&outbound, vec![frame]).await
    }

    pub async fn send_image(&self, data: &[u8], mime: &str) -> Result<(), ClientError> {
        let outbound = self.outbound()?;
        let frames = self
            .shared
            .codec
            .encode_image(data, mime, self.shared.config.fragment_payload)?;
        enqueue(&outbound, frames).await
    }

    pub async fn send_file(&self, name: &str, data: &[u8], mime: &str) -> Result<(), ClientError> {
        let outbound = self.outbound()?;
        let frames =
            self.shared
                .codec
                .encode_file(name, data, mime, self.shared.config.fragment_payload)?;
        enqueue(&outbound, frames).await
    }

    pub async fn send_clipboard(&self, content: &ClipboardContent) -> Result<(), ClientError> {
        let outbound = self.outbound()?;
        let frames = content.encode(&self.shared.codec, self.shared.config.fragment_payload)?;
        enqueue(&outbound, frames).await
    }

    fn outbound(&self) -> Result<mpsc::Sender<Bytes>, ClientError> {
        let control = self.shared.control();
        match (control.status, &control.outbound) {
            (ConnectionStatus::Connected, Some(outbound)) => Ok(outbound.clone()),
            _ => Err(ClientError::NotConnected),
        }
    }
}

async fn enqueue(outbound: &mpsc::Sender<Bytes>, frames: Vec<Bytes>) -> Result<(), ClientError> {
    for frame in frames {
        outbound
            .send(frame)
            .await
            .map_err(|_| ClientError::NotConnected)?;
    }
    Ok(())
}

fn parse_server_url(raw: &str) -> Result<Url, ClientError> {
    let url =
        Url::parse(raw.trim()).map_err(|err| ClientError::InvalidUrl(format!("{raw}: {err}")))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        scheme => Err(ClientError::InvalidUrl(format!(
            "{raw}: unsupported scheme {scheme}"
        ))),
    }
}

async fn connect_loop(
    shared: Arc<Shared>,
    url: Url,
    generation: u64,
    mut cancel_rx: watch::Receiver<bool>,
) {
    loop {
        if !shared.update(generation, |c| c.status = ConnectionStatus::Connecting) {
            break;
        }

        match run_session(&shared, &url, generation, cancel_rx.clone()).await {
            SessionEnd::Cancelled => break,
            SessionEnd::ConnectFailed(reason) => {
                warn!(server_url = %url, "connect failed: {}", reason);
                if !shared.ever_connected(generation) {
                    error!(server_url = %url, "first connection attempt failed; not retrying");
                    break;
                }
            }
            SessionEnd::Lost => warn!(server_url = %url, "session lost"),
        }

        let retrying = shared.update(generation, |c| {
            c.status = ConnectionStatus::Retrying;
            c.outbound = None;
        });
        if !retrying {
            break;
        }

        let delay = shared.config.reconnect_delay();
        info!(server_url = %url, "reconnecting in {:?}", delay);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = wait_cancelled(&mut cancel_rx) => break,
        }
    }

    shared.update(generation, |c| {
        c.status = ConnectionStatus::Disconnected;
        c.outbound = None;
        c.cancel = None;
        c.task = None;
    });
}

async fn run_session(
    shared: &Arc<Shared>,
    url: &Url,
    generation: u64,
    mut cancel_rx: watch::Receiver<bool>,
) -> SessionEnd {
    info!(server_url = %url, "connecting");
    let connect_timeout = shared.config.connect_timeout();
    let ws_stream = tokio::select! {
        result = timeout(connect_timeout, connect_async(url.as_str())) => match result {
            Ok(Ok((ws_stream, _))) => ws_stream,
            Ok(Err(err)) => return SessionEnd::ConnectFailed(err.to_string()),
            Err(_) => {
                return SessionEnd::ConnectFailed(format!("timed out after {:?}", connect_timeout));
            }
        },
        _ = wait_cancelled(&mut cancel_rx) => return SessionEnd::Cancelled,
    };

    if !shared.update(generation, |c| c.ever_connected = true) {
        return SessionEnd::Cancelled;
    }

    let (mut ws_write, ws_read) = ws_stream.split();
    let write_timeout = shared.config.write_timeout();
    let handshake = match shared
        .codec
        .encode_handshake(&shared.config.device_name, &shared.config.platform)
    {
        Ok(frame) => frame,
        Err(err) => {
            error!("failed to encode handshake: {}", err);
            return SessionEnd::Lost;
        }
    };
    if !send_frame(&mut ws_write, handshake, write_timeout).await {
        return SessionEnd::Lost;
    }

    let (outbound_tx, outbound_rx) = mpsc::channel(shared.config.queue_capacity.max(1));
    let mut hook = None;
    let current = shared.update(generation, |c| {
        c.status = ConnectionStatus::Connected;
        c.outbound = Some(outbound_tx.clone());
        hook = c.on_connected.clone();
    });
    if !current {
        return SessionEnd::Cancelled;
    }

    info!(
        server_url = %url,
        device_id = %shared.codec.device_id(),
        device_name = %shared.config.device_name,
        "connected"
    );
    if let Some(hook) = hook {
        hook();
    }

    tokio::select! {
        _ = write_loop(ws_write, outbound_rx, cancel_rx.clone(), write_timeout) => {}
        _ = heartbeat_loop(shared.clone(), outbound_tx) => {}
        _ = read_loop(shared.clone(), ws_read) => {}
    }

    if *cancel_rx.borrow() {
        SessionEnd::Cancelled
    } else {
        SessionEnd::Lost
    }
}

async fn write_loop(
    mut ws_write: WsWrite,
    mut outbound_rx: mpsc::Receiver<Bytes>,
    mut cancel_rx: watch::Receiver<bool>,
    write_timeout: Duration,
) {
    loop {
        tokio::select! {
            frame = outbound_rx.recv() => {
                let Some(frame) = frame else { break };
                if !send_frame(&mut ws_write, frame, write_timeout).await {
                    return;
                }
            }
            _ = wait_cancelled(&mut cancel_rx) => break,
        }
    }

    while let Ok(frame) = outbound_rx.try_recv() {
        if !send_frame(&mut ws_write, frame, write_timeout).await {
            return;
        }
    }
    let _ = timeout(write_timeout, ws_write.send(Message::Close(None))).await;
}

async fn send_frame(ws_write: &mut WsWrite, frame: Bytes, write_timeout: Duration) -> bool {
    match timeout(write_timeout, ws_write.send(Message::Binary(frame))).await {
        Ok(Ok(())) => true,
        Ok(Err(err)) => {
            warn!("websocket write failed: {}", err);
            false
        }
        Err(_) => {
            warn!("websocket write timed out after {:?}", write_timeout);
            false
        }
    }
}

async fn heartbeat_loop(shared: Arc<Shared>, outbound_tx: mpsc::Sender<Bytes>) {
    let mut ticker = tokio::time::interval(shared.config.heartbeat_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await; // skip first immediate tick

    loop {
        ticker.tick().await;
        match outbound_tx.try_send(shared.codec.encode_heartbeat()) {
            Ok(()) => debug!("heartbeat queued"),
            Err(TrySendError::Full(_)) => debug!("outbound queue busy; skipping heartbeat"),
            Err(TrySendError::Closed(_)) => break,
        }
    }
}

async fn read_loop(shared: Arc<Shared>, mut ws_read: WsRead) {
    let mut reassembler = Reassembler::with_limit(shared.config.max_transfer_bytes);

    while let Some(next) = ws_read.next().await {
        let message = match next {
            Ok(message) => message,
            Err(err) => {
                warn!("websocket read failed: {}", err);
                return;
            }
        };

        match message {
            Message::Binary(data) => handle_frame(&shared, &mut reassembler, &data),
            Message::Text(_) => {
                warn!("ignoring text message; the server speaks an incompatible protocol");
            }
            Message::Close(frame) => {
                debug!(?frame, "server closed the connection");
                return;
            }
            _ => {}
        }
    }
}

fn handle_frame(shared: &Shared, reassembler: &mut Reassembler, data: &[u8]) {
    let frame = match shared.codec.decode(data) {
        Ok(frame) => frame,
        Err(CodecError::Loopback) => return,
        Err(err) => {
            warn!("dropping malformed frame: {}", err);
            return;
        }
    };

    match frame.kind {
        MessageType::Heartbeat => {}
        MessageType::Handshake => match frame.handshake() {
            Ok(info) => info!(peer = %info.name, os = %info.os, ver = info.protocol_minor, "peer handshake"),
            Err(err) => debug!("unreadable handshake payload: {}", err),
        },
        MessageType::Text => match frame.text() {
            Ok("") => {}
            Ok(text) => {
                info!(chars = text.chars().count(), from = %frame.sender, "received text");
                shared.sink.write(ClipboardContent::text(text));
            }
            Err(err) => warn!("dropping text frame: {}", err),
        },
        MessageType::Image | MessageType::File => match reassembler.ingest(&frame) {
            Ok(Some(transfer)) => {
                let content = ClipboardContent::from(transfer);
                info!(
                    kind = %content.kind,
                    bytes = content.bytes.len(),
                    from = %frame.sender,
                    "received transfer"
                );
                shared.sink.write(content);
            }
            Ok(None) => {}
            Err(err @ ReassemblyError::Orphan { .. }) => debug!("{}", err),
            Err(err) => warn!("dropping transfer: {}", err),
        },
    }
}

async fn wait_cancelled(cancel_rx: &mut watch::Receiver<bool>) {
    let _ = cancel_rx.wait_for(|cancelled| *cancelled).await;
}

#[cfg(test)]
mod tests {
    use nextpaste_core::NullSink;

    use super::*;

    fn client() -> SyncClient {
        SyncClient::new(ClientConfig::default(), Arc::new(NullSink))
    }

    #[test]
    fn server_urls_must_be_websocket_urls() {
        assert!(parse_server_url("ws://127.0.0.1:8080/v11/ws/desk").is_ok());
        assert!(parse_server_url(" wss://relay.example/v11/ws/desk ").is_ok());
        assert!(matches!(
            parse_server_url("http://relay.example/v11/ws/desk"),
            Err(ClientError::InvalidUrl(_))
        ));
        assert!(matches!(
            parse_server_url("not a url"),
            Err(ClientError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn sending_without_a_session_is_rejected() {
        let client = client();
        assert_eq!(client.status(), ConnectionStatus::Disconnected);
        assert!(matches!(
            client.send_text("hi").await,
            Err(ClientError::NotConnected)
        ));
        assert!(matches!(
            client.send_image(&[1, 2, 3], "image/png").await,
            Err(ClientError::NotConnected)
        ));
        assert!(matches!(
            client
                .send_clipboard(&ClipboardContent::file("a.txt", b"a".to_vec(), "text/plain"))
                .await,
            Err(ClientError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn invalid_url_leaves_client_disconnected() {
        let client = client();
        assert!(matches!(
            client.connect("ftp://example.com"),
            Err(ClientError::InvalidUrl(_))
        ));
        assert_eq!(client.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn disconnect_when_idle_is_a_no_op() {
        let client = client();
        client.disconnect().await;
        assert_eq!(client.status(), ConnectionStatus::Disconnected);
    }
}
