//! Integration tests for WebSocket auth, room membership, and event fan-out,
//! driven over a real listener.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;

use arena_socket_server::auth::jwt;
use arena_socket_server::cluster::Fanout;
use arena_socket_server::hub::Hub;
use arena_socket_server::ingress::handlers;
use arena_socket_server::routes;
use arena_socket_server::state::AppState;

const SECRET: &str = "integration-test-secret";
const INSTANCE_ID: &str = "test-inst";

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

struct TestServer {
    addr: SocketAddr,
    hub: Arc<Hub>,
    fanout: Fanout,
}

/// Start the real router on an ephemeral port, without Redis or Kafka
/// attached: fan-out is local-only and presence is disabled.
async fn start_test_server() -> TestServer {
    let (hub, commands) = Hub::new(None);
    tokio::spawn(Arc::clone(&hub).run(commands));

    let fanout = Fanout::new(Arc::clone(&hub), None);
    let state = AppState {
        hub: Arc::clone(&hub),
        presence: None,
        jwt_secret: SECRET.to_string(),
        instance_id: INSTANCE_ID.to_string(),
        ws_path: "/ws".to_string(),
    };

    let app = routes::build_router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer { addr, hub, fanout }
}

async fn connect(addr: SocketAddr, user_id: &str) -> WsStream {
    let token = jwt::issue_token(SECRET.as_bytes(), user_id, None, 0, 900).unwrap();
    let url = format!("ws://{}/ws?token={}", addr, token);
    let (stream, _) = tokio_tungstenite::connect_async(&url)
        .await
        .expect("failed to connect");
    stream
}

/// Read frames until a text frame arrives, skipping transport pings.
async fn recv_json(stream: &mut WsStream) -> serde_json::Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("read error");
        match frame {
            Message::Text(text) => return serde_json::from_str(text.as_str()).expect("JSON frame"),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

async fn send_json(stream: &mut WsStream, value: serde_json::Value) {
    stream
        .send(Message::Text(value.to_string().into()))
        .await
        .expect("failed to send");
}

/// Assert that no application frame arrives within the window.
async fn expect_silence(stream: &mut WsStream, window: Duration) {
    loop {
        match tokio::time::timeout(window, stream.next()).await {
            Err(_) => return,
            Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => continue,
            Ok(other) => panic!("expected silence, got {:?}", other),
        }
    }
}

#[tokio::test]
async fn connected_greeting_is_the_first_frame() {
    let server = start_test_server().await;
    let mut ws = connect(server.addr, "u1").await;

    let greeting = recv_json(&mut ws).await;
    assert_eq!(greeting["type"], "CONNECTED");
    assert_eq!(greeting["payload"]["userId"], "u1");
    assert_eq!(greeting["payload"]["instanceId"], INSTANCE_ID);
    assert!(greeting["timestamp"].is_string());
}

#[tokio::test]
async fn invalid_token_closes_with_4002() {
    let server = start_test_server().await;
    let url = format!("ws://{}/ws?token=not-a-jwt", server.addr);
    let (mut ws, _) = tokio_tungstenite::connect_async(&url)
        .await
        .expect("upgrade still succeeds");

    let frame = tokio::time::timeout(Duration::from_secs(2), ws.next())
        .await
        .expect("expected close frame")
        .expect("stream ended")
        .expect("read error");
    match frame {
        Message::Close(Some(frame)) => {
            assert_eq!(frame.code, CloseCode::from(4002));
        }
        Message::Close(None) => {}
        other => panic!("expected close, got {other:?}"),
    }
}

#[tokio::test]
async fn missing_token_closes_with_4002() {
    let server = start_test_server().await;
    let url = format!("ws://{}/ws", server.addr);
    let (mut ws, _) = tokio_tungstenite::connect_async(&url)
        .await
        .expect("upgrade still succeeds");

    let frame = tokio::time::timeout(Duration::from_secs(2), ws.next())
        .await
        .expect("expected close frame")
        .expect("stream ended")
        .expect("read error");
    assert!(frame.is_close(), "expected close, got {frame:?}");
}

#[tokio::test]
async fn join_room_then_receive_leaderboard_update() {
    let server = start_test_server().await;
    let mut ws = connect(server.addr, "u1").await;
    recv_json(&mut ws).await; // CONNECTED

    send_json(
        &mut ws,
        serde_json::json!({
            "type": "JOIN_ROOM",
            "requestId": "r1",
            "payload": {"roomId": "contest:42"},
        }),
    )
    .await;

    let joined = recv_json(&mut ws).await;
    assert_eq!(joined["type"], "ROOM_JOINED");
    assert_eq!(joined["requestId"], "r1");
    assert_eq!(joined["payload"]["roomId"], "contest:42");
    assert_eq!(joined["payload"]["memberCount"], 1);

    let event = serde_json::json!({
        "contestId": "42",
        "timestamp": "2025-06-01T10:00:00Z",
    });
    handlers::dispatch("leaderboard.updated", event.to_string().as_bytes(), &server.fanout)
        .await
        .unwrap();

    let update = recv_json(&mut ws).await;
    assert_eq!(update["type"], "LEADERBOARD_UPDATE");
    assert_eq!(update["payload"]["contestId"], "42");
}

#[tokio::test]
async fn multi_device_user_gets_exactly_one_copy_per_connection() {
    let server = start_test_server().await;
    let mut first = connect(server.addr, "u1").await;
    let mut second = connect(server.addr, "u1").await;
    recv_json(&mut first).await;
    recv_json(&mut second).await;

    let event = serde_json::json!({
        "submissionId": "s1",
        "userId": "u1",
        "problemId": "p1",
        "contestId": null,
        "verdict": "ACCEPTED",
        "score": 100,
        "testCasesPassed": 10,
        "testCasesTotal": 10,
        "timestamp": "2025-06-01T10:00:00Z",
    });
    handlers::dispatch("submission.judged", event.to_string().as_bytes(), &server.fanout)
        .await
        .unwrap();

    let a = recv_json(&mut first).await;
    let b = recv_json(&mut second).await;
    assert_eq!(a["type"], "SUBMISSION_RESULT");
    assert_eq!(b["type"], "SUBMISSION_RESULT");
    assert_eq!(a["payload"]["verdict"], "ACCEPTED");

    expect_silence(&mut first, Duration::from_millis(300)).await;
    expect_silence(&mut second, Duration::from_millis(300)).await;
}

#[tokio::test]
async fn unknown_type_gets_error_and_connection_stays_open() {
    let server = start_test_server().await;
    let mut ws = connect(server.addr, "u1").await;
    recv_json(&mut ws).await;

    send_json(
        &mut ws,
        serde_json::json!({"type": "FOO", "requestId": "rx"}),
    )
    .await;

    let error = recv_json(&mut ws).await;
    assert_eq!(error["type"], "ERROR");
    assert_eq!(error["payload"]["code"], "UNKNOWN_TYPE");
    assert_eq!(error["payload"]["requestId"], "rx");

    // Still usable afterwards.
    send_json(
        &mut ws,
        serde_json::json!({"type": "PING", "requestId": "p1"}),
    )
    .await;
    let pong = recv_json(&mut ws).await;
    assert_eq!(pong["type"], "PONG");
    assert_eq!(pong["requestId"], "p1");
}

#[tokio::test]
async fn leave_room_acknowledges() {
    let server = start_test_server().await;
    let mut ws = connect(server.addr, "u1").await;
    recv_json(&mut ws).await;

    send_json(
        &mut ws,
        serde_json::json!({
            "type": "JOIN_ROOM",
            "requestId": "r1",
            "payload": {"roomId": "problem:9"},
        }),
    )
    .await;
    recv_json(&mut ws).await; // ROOM_JOINED

    send_json(
        &mut ws,
        serde_json::json!({
            "type": "LEAVE_ROOM",
            "requestId": "r2",
            "payload": {"roomId": "problem:9"},
        }),
    )
    .await;

    let left = recv_json(&mut ws).await;
    assert_eq!(left["type"], "ROOM_LEFT");
    assert_eq!(left["requestId"], "r2");
    assert_eq!(left["payload"]["roomId"], "problem:9");
    assert!(!server.hub.has_room("problem:9"), "emptied room is dropped");
}

#[tokio::test]
async fn disconnect_leaves_all_rooms() {
    let server = start_test_server().await;
    let mut leaving = connect(server.addr, "u1").await;
    let mut staying = connect(server.addr, "u2").await;
    recv_json(&mut leaving).await;
    recv_json(&mut staying).await;

    for room in ["contest:1", "problem:9"] {
        send_json(
            &mut leaving,
            serde_json::json!({"type": "JOIN_ROOM", "payload": {"roomId": room}}),
        )
        .await;
        recv_json(&mut leaving).await;
    }
    send_json(
        &mut staying,
        serde_json::json!({"type": "JOIN_ROOM", "payload": {"roomId": "contest:1"}}),
    )
    .await;
    recv_json(&mut staying).await;

    leaving.close(None).await.expect("close");

    // Wait for the close frame to cross the socket; once the endpoint sees
    // it, teardown is applied before the endpoint task finishes.
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(server.hub.room_member_count("contest:1"), 1);
    assert!(!server.hub.has_room("problem:9"), "solo room is destroyed");
    assert_eq!(server.hub.user_connection_count("u1"), 0);
    assert_eq!(server.hub.user_connection_count("u2"), 1);
}

#[tokio::test]
async fn health_and_ready_report_state() {
    let server = start_test_server().await;
    let mut ws = connect(server.addr, "u1").await;
    recv_json(&mut ws).await;

    let client = reqwest::Client::new();

    let health: serde_json::Value = client
        .get(format!("http://{}/health", server.addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");

    let ready: serde_json::Value = client
        .get(format!("http://{}/ready", server.addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(ready["status"], "ready");
    assert_eq!(ready["stats"]["totalClients"], 1);
    assert_eq!(ready["stats"]["totalUsers"], 1);
}

#[tokio::test]
async fn reconnect_after_disconnect_registers_cleanly() {
    let server = start_test_server().await;

    {
        let mut ws = connect(server.addr, "u1").await;
        recv_json(&mut ws).await;
        ws.close(None).await.expect("close");
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.hub.connection_count(), 0);

    let mut ws = connect(server.addr, "u1").await;
    let greeting = recv_json(&mut ws).await;
    assert_eq!(greeting["type"], "CONNECTED");
    assert_eq!(server.hub.connection_count(), 1);
}
