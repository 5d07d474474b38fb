use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use nextpaste_core::{FrameCodec, MIME_IMAGE_PNG, Reassembler};
use nextpaste_server::{AppState, Namespace, ServerConfig, serve};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
    sync::oneshot,
    time::timeout,
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
type WsWrite = futures::stream::SplitSink<WsStream, Message>;
type WsRead = futures::stream::SplitStream<WsStream>;

struct TestClient {
    write: WsWrite,
    read: WsRead,
}

struct TestRelay {
    base_url: String,
    state: AppState,
    shutdown_tx: oneshot::Sender<()>,
}

#[tokio::test]
async fn frames_are_forwarded_to_other_members_only() {
    let relay = start_relay(ServerConfig::default()).await;
    let mut a = connect_client(&relay, "v11/ws/desk").await;
    let mut b = connect_client(&relay, "v11/ws/desk").await;
    let mut c = connect_client(&relay, "v11/ws/desk").await;
    wait_for_members(&relay.state, Namespace::Current, "desk", 3).await;

    let frame = FrameCodec::new().encode_text("hello from a").expect("encode text");
    send_binary(&mut a, frame.clone()).await;

    assert_eq!(recv_binary(&mut b, Duration::from_secs(2)).await, Some(frame.clone()));
    assert_eq!(recv_binary(&mut c, Duration::from_secs(2)).await, Some(frame));
    assert!(
        recv_binary(&mut a, Duration::from_millis(300)).await.is_none(),
        "sender unexpectedly received its own frame"
    );

    let _ = relay.shutdown_tx.send(());
}

#[tokio::test]
async fn rooms_are_isolated() {
    let relay = start_relay(ServerConfig::default()).await;
    let mut a = connect_client(&relay, "v11/ws/one").await;
    let mut b = connect_client(&relay, "v11/ws/two").await;
    wait_for_members(&relay.state, Namespace::Current, "one", 1).await;
    wait_for_members(&relay.state, Namespace::Current, "two", 1).await;

    let frame = FrameCodec::new().encode_text("only for room one").expect("encode text");
    send_binary(&mut a, frame).await;

    assert!(recv_binary(&mut b, Duration::from_millis(400)).await.is_none());
    let _ = relay.shutdown_tx.send(());
}

#[tokio::test]
async fn namespaces_are_isolated_and_legacy_traffic_is_forwarded_verbatim() {
    let relay = start_relay(ServerConfig::default()).await;
    let mut current = connect_client(&relay, "v11/ws/shared").await;
    let mut legacy_a = connect_client(&relay, "ws/shared").await;
    let mut legacy_b = connect_client(&relay, "ws/shared").await;
    wait_for_members(&relay.state, Namespace::Current, "shared", 1).await;
    wait_for_members(&relay.state, Namespace::Legacy, "shared", 2).await;

    let frame = FrameCodec::new().encode_text("current only").expect("encode text");
    send_binary(&mut current, frame).await;
    assert!(recv_message(&mut legacy_a, Duration::from_millis(300)).await.is_none());

    let legacy = r#"{"type":"text","data":"hi"}"#;
    legacy_a
        .write
        .send(Message::Text(legacy.into()))
        .await
        .expect("send legacy text");

    match recv_message(&mut legacy_b, Duration::from_secs(2)).await {
        Some(Message::Text(text)) => assert_eq!(text.as_str(), legacy),
        other => panic!("expected forwarded legacy text, got {other:?}"),
    }
    assert!(recv_message(&mut current, Duration::from_millis(300)).await.is_none());

    let _ = relay.shutdown_tx.send(());
}

#[tokio::test]
async fn malformed_frame_is_dropped_and_connection_stays_open() {
    let relay = start_relay(ServerConfig::default()).await;
    let mut a = connect_client(&relay, "v11/ws/malformed").await;
    let mut b = connect_client(&relay, "v11/ws/malformed").await;
    wait_for_members(&relay.state, Namespace::Current, "malformed", 2).await;

    send_binary(&mut a, Bytes::from_static(&[0xFF, 0x00, 0xAB, 0xCD])).await;
    let mut bad_magic = FrameCodec::new().encode_text("x").expect("encode text").to_vec();
    bad_magic[0] = 0x00;
    send_binary(&mut a, Bytes::from(bad_magic)).await;
    assert!(recv_binary(&mut b, Duration::from_millis(400)).await.is_none());

    let frame = FrameCodec::new().encode_text("still here").expect("encode text");
    send_binary(&mut a, frame.clone()).await;
    assert_eq!(recv_binary(&mut b, Duration::from_secs(2)).await, Some(frame));

    let _ = relay.shutdown_tx.send(());
}

#[tokio::test]
async fn fragmented_image_is_forwarded_in_order() {
    let relay = start_relay(ServerConfig::default()).await;
    let mut a = connect_client(&relay, "v11/ws/images").await;
    let mut b = connect_client(&relay, "v11/ws/images").await;
    wait_for_members(&relay.state, Namespace::Current, "images", 2).await;

    let image: Vec<u8> = (0..200 * 1024).map(|i| (i % 251) as u8).collect();
    let frames = FrameCodec::new()
        .encode_image(&image, MIME_IMAGE_PNG, 64 * 1024)
        .expect("encode image");
    assert_eq!(frames.len(), 4);
    for frame in &frames {
        send_binary(&mut a, frame.clone()).await;
    }

    let receiver_codec = FrameCodec::new();
    let mut reassembler = Reassembler::new();
    let mut completed = None;
    for expected in &frames {
        let got = recv_binary(&mut b, Duration::from_secs(2))
            .await
            .expect("fragment forwarded");
        assert_eq!(&got, expected);
        let frame = receiver_codec.decode(&got).expect("decode fragment");
        if let Some(transfer) = reassembler.ingest(&frame).expect("ingest fragment") {
            completed = Some(transfer);
        }
    }

    let completed = completed.expect("transfer completes on the last fragment");
    assert_eq!(completed.data, image);
    assert_eq!(completed.meta.mime.as_deref(), Some(MIME_IMAGE_PNG));

    let _ = relay.shutdown_tx.send(());
}

#[tokio::test]
async fn handshake_is_forwarded_and_recorded_in_stats() {
    let relay = start_relay(ServerConfig::default()).await;
    let mut a = connect_client(&relay, "v11/ws/hello").await;
    let mut b = connect_client(&relay, "v11/ws/hello").await;
    wait_for_members(&relay.state, Namespace::Current, "hello", 2).await;

    let handshake = FrameCodec::new()
        .encode_handshake("studio-mac", "macos")
        .expect("encode handshake");
    send_binary(&mut a, handshake.clone()).await;
    assert_eq!(recv_binary(&mut b, Duration::from_secs(2)).await, Some(handshake));

    let stats = relay.state.registry(Namespace::Current).stats().await;
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].room_id, "hello");
    assert_eq!(stats[0].member_count, 2);
    assert!(
        stats[0]
            .members
            .iter()
            .any(|m| m.device_name.as_deref() == Some("studio-mac")
                && m.platform.as_deref() == Some("macos"))
    );

    let _ = relay.shutdown_tx.send(());
}

#[tokio::test]
async fn heartbeats_are_not_forwarded() {
    let relay = start_relay(ServerConfig::default()).await;
    let mut a = connect_client(&relay, "v11/ws/beat").await;
    let mut b = connect_client(&relay, "v11/ws/beat").await;
    wait_for_members(&relay.state, Namespace::Current, "beat", 2).await;

    send_binary(&mut a, FrameCodec::new().encode_heartbeat()).await;
    assert!(recv_binary(&mut b, Duration::from_millis(400)).await.is_none());

    let _ = relay.shutdown_tx.send(());
}

#[tokio::test]
async fn room_is_removed_after_last_member_leaves() {
    let relay = start_relay(ServerConfig::default()).await;
    let mut a = connect_client(&relay, "v11/ws/temp").await;
    wait_for_members(&relay.state, Namespace::Current, "temp", 1).await;

    a.write.send(Message::Close(None)).await.expect("send close");
    let state = &relay.state;
    wait_until(move || async move { state.registry(Namespace::Current).room_count().await == 0 }).await;

    let _ = relay.shutdown_tx.send(());
}

#[tokio::test]
async fn shutdown_closes_connected_clients() {
    let relay = start_relay(ServerConfig::default()).await;
    let mut a = connect_client(&relay, "v11/ws/bye").await;
    wait_for_members(&relay.state, Namespace::Current, "bye", 1).await;

    let _ = relay.shutdown_tx.send(());
    assert_terminated(&mut a).await;
    assert_eq!(relay.state.registry(Namespace::Current).room_count().await, 0);
}

#[tokio::test]
async fn idle_connection_is_closed() {
    let config = ServerConfig {
        idle_timeout: Duration::from_millis(300),
        keepalive_interval: Duration::from_secs(60),
        ..ServerConfig::default()
    };
    let relay = start_relay(config).await;
    let mut a = connect_client(&relay, "v11/ws/quiet").await;
    wait_for_members(&relay.state, Namespace::Current, "quiet", 1).await;

    assert_terminated(&mut a).await;
    let state = &relay.state;
    wait_until(move || async move { state.registry(Namespace::Current).room_count().await == 0 }).await;

    let _ = relay.shutdown_tx.send(());
}

#[tokio::test]
async fn oversized_message_is_not_forwarded() {
    let config = ServerConfig {
        max_message_bytes: 1024,
        ..ServerConfig::default()
    };
    let relay = start_relay(config).await;
    let mut a = connect_client(&relay, "v11/ws/big").await;
    let mut b = connect_client(&relay, "v11/ws/big").await;
    wait_for_members(&relay.state, Namespace::Current, "big", 2).await;

    let frame = FrameCodec::new()
        .encode_text(&"x".repeat(4096))
        .expect("encode text");
    let _ = a.write.send(Message::Binary(frame)).await;

    assert!(recv_binary(&mut b, Duration::from_millis(400)).await.is_none());
    let _ = relay.shutdown_tx.send(());
}

#[tokio::test]
async fn zero_keepalive_still_delivers_frames() {
    let config = ServerConfig {
        keepalive_interval: Duration::ZERO,
        ..ServerConfig::default()
    };
    let relay = start_relay(config).await;
    let mut a = connect_client(&relay, "v11/ws/eager").await;
    let mut b = connect_client(&relay, "v11/ws/eager").await;
    wait_for_members(&relay.state, Namespace::Current, "eager", 2).await;

    let frame = FrameCodec::new().encode_text("still flowing").expect("encode text");
    send_binary(&mut a, frame.clone()).await;
    assert_eq!(recv_binary(&mut b, Duration::from_secs(2)).await, Some(frame));

    let _ = relay.shutdown_tx.send(());
}

#[tokio::test]
async fn health_endpoints_answer_on_both_paths() {
    let relay = start_relay(ServerConfig::default()).await;
    let address = relay.base_url.trim_start_matches("ws://").to_owned();

    for path in ["/health", "/healthz"] {
        let response = http_get(&address, path).await;
        assert!(response.starts_with("HTTP/1.1 200"), "{path}: {response}");
        assert!(response.contains(r#"{"ok":true}"#), "{path}: {response}");
    }

    let _ = relay.shutdown_tx.send(());
}

async fn start_relay(config: ServerConfig) -> TestRelay {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral relay socket");
    let address = listener.local_addr().expect("relay local addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let state = AppState::with_config(config);

    let server_state = state.clone();
    tokio::spawn(async move {
        let _ = serve(listener, server_state, async {
            let _ = shutdown_rx.await;
        })
        .await;
    });

    TestRelay {
        base_url: format!("ws://{}", address),
        state,
        shutdown_tx,
    }
}

async fn connect_client(relay: &TestRelay, path: &str) -> TestClient {
    let url = format!("{}/{}", relay.base_url, path);
    let (ws_stream, _) = connect_async(&url).await.expect("connect websocket");
    let (write, read) = ws_stream.split();
    TestClient { write, read }
}

async fn send_binary(client: &mut TestClient, frame: Bytes) {
    client
        .write
        .send(Message::Binary(frame))
        .await
        .expect("send binary frame");
}

async fn wait_for_members(state: &AppState, namespace: Namespace, room_id: &str, count: usize) {
    wait_until(move || async move {
        match state.registry(namespace).room(room_id).await {
            Some(room) => room.len().await == count,
            None => false,
        }
    })
    .await;
}

async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !condition().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn assert_terminated(client: &mut TestClient) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .expect("connection should be closed by the relay");
        match timeout(remaining, client.read.next()).await {
            Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(Message::Close(_)))) => return,
            Ok(Some(Ok(_))) => continue,
            Err(_) => panic!("connection should be closed by the relay"),
        }
    }
}

/// Next text or binary message, skipping control frames.
async fn recv_message(client: &mut TestClient, wait: Duration) -> Option<Message> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let remaining = deadline.checked_duration_since(tokio::time::Instant::now())?;
        let message = timeout(remaining, client.read.next()).await.ok()??.ok()?;
        match message {
            Message::Text(_) | Message::Binary(_) => return Some(message),
            Message::Close(_) => return None,
            _ => continue,
        }
    }
}

async fn recv_binary(client: &mut TestClient, wait: Duration) -> Option<Bytes> {
    match recv_message(client, wait).await? {
        Message::Binary(bytes) => Some(bytes),
        _ => None,
    }
}

async fn http_get(address: &str, path: &str) -> String {
    let mut stream = tokio::net::TcpStream::connect(address)
        .await
        .expect("connect to relay");
    let request = format!("GET {path} HTTP/1.1\r\nHost: {address}\r\nConnection: close\r\n\r\n");
    stream
        .write_all(request.as_bytes())
        .await
        .expect("write http request");
    let mut response = Vec::new();
    timeout(Duration::from_secs(2), stream.read_to_end(&mut response))
        .await
        .expect("http response in time")
        .expect("read http response");
    String::from_utf8_lossy(&response).into_owned()
}
