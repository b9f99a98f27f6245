use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use courier::server::router::build_router;
use courier::server::state::{AppState, SharedState};
use courier::storage::{Storage, DROP_BOX_ID_SIZE};

type WsSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CMD_NOP: u8 = 0;
const CMD_WATCH: u8 = 1;
const CMD_IGNORE: u8 = 2;

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

/// Bind a server on an ephemeral port.  Returns the bare address (host:port),
/// a handle to the shared state for inspecting subscriptions, and the
/// shutdown sender.
async fn start_server(storage: Storage) -> (String, SharedState, oneshot::Sender<()>) {
    let state = AppState::shared(storage);
    let app = build_router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind server");
    let addr = listener.local_addr().expect("server addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    let server = axum::serve(listener, app).with_graceful_shutdown(async {
        let _ = shutdown_rx.await;
    });
    tokio::spawn(async move {
        let _ = server.await;
    });

    (addr.to_string(), state, shutdown_tx)
}

fn storage_with_user() -> (Storage, i64, String) {
    let storage = Storage::open_in_memory().expect("open storage");
    let user_id = storage.create_user("tester", now_secs()).expect("create user");
    let token = storage
        .create_access_token(user_id, now_secs())
        .expect("create token");
    (storage, user_id, token)
}

async fn connect_socket(addr: &str, token: &str) -> WsSocket {
    let mut request = format!("ws://{addr}/drop-boxes/watch")
        .into_client_request()
        .expect("ws request");
    request.headers_mut().insert(
        "Sec-WebSocket-Protocol",
        token.parse().expect("token header value"),
    );
    let (socket, _response) = tokio_tungstenite::connect_async(request)
        .await
        .expect("ws connect");
    socket
}

fn command_frame(opcode: u8, box_id: &[u8; DROP_BOX_ID_SIZE]) -> Vec<u8> {
    let mut frame = vec![opcode];
    frame.extend_from_slice(box_id);
    frame
}

/// The frame a watcher should receive when `package` lands in `box_id`.
fn expected_delivery(box_id: &[u8; DROP_BOX_ID_SIZE], package: &[u8]) -> Vec<u8> {
    let mut frame = vec![CMD_WATCH];
    frame.extend_from_slice(box_id);
    frame.extend_from_slice(package);
    frame
}

/// Wait up to `timeout` for the next binary frame.
async fn recv_binary(socket: &mut WsSocket, timeout: Duration) -> Option<Vec<u8>> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let message = tokio::time::timeout_at(deadline, socket.next()).await.ok()??;
        match message {
            Ok(WsMessage::Binary(payload)) => return Some(payload),
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
}

async fn put_package(addr: &str, token: &str, hex_id: &str, package: &[u8]) {
    let url = format!("http://{addr}/drop-boxes/{hex_id}");
    let token = token.to_string();
    let package = package.to_vec();
    tokio::task::spawn_blocking(move || {
        let response = ureq::put(&url)
            .set("X-Access-Token", &token)
            .send_bytes(&package)
            .expect("put package");
        assert_eq!(response.status(), 200);
    })
    .await
    .expect("put task");
}

#[tokio::test]
async fn watch_then_drop_delivers_the_framed_package() {
    let (storage, _user_id, token) = storage_with_user();
    let (addr, _state, shutdown_tx) = start_server(storage).await;

    let box_id: [u8; DROP_BOX_ID_SIZE] = rand::random();
    let mut socket = connect_socket(&addr, &token).await;

    socket
        .send(WsMessage::Binary(command_frame(CMD_WATCH, &box_id)))
        .await
        .expect("send watch");

    put_package(&addr, &token, &hex::encode(box_id), b"Hello").await;

    let frame = recv_binary(&mut socket, Duration::from_secs(2))
        .await
        .expect("box notification");
    assert_eq!(frame, expected_delivery(&box_id, b"Hello"));

    shutdown_tx.send(()).ok();
}

#[tokio::test]
async fn watching_a_nonempty_box_delivers_immediately() {
    let (storage, _user_id, token) = storage_with_user();
    let (addr, _state, shutdown_tx) = start_server(storage).await;

    let box_id: [u8; DROP_BOX_ID_SIZE] = rand::random();
    put_package(&addr, &token, &hex::encode(box_id), b"X").await;

    let mut socket = connect_socket(&addr, &token).await;
    socket
        .send(WsMessage::Binary(command_frame(CMD_WATCH, &box_id)))
        .await
        .expect("send watch");

    let frame = recv_binary(&mut socket, Duration::from_secs(2))
        .await
        .expect("existing package");
    assert_eq!(frame, expected_delivery(&box_id, b"X"));

    shutdown_tx.send(()).ok();
}

#[tokio::test]
async fn ignore_stops_delivery() {
    let (storage, _user_id, token) = storage_with_user();
    let (addr, _state, shutdown_tx) = start_server(storage).await;

    let box_id: [u8; DROP_BOX_ID_SIZE] = rand::random();
    let mut socket = connect_socket(&addr, &token).await;

    socket
        .send(WsMessage::Binary(command_frame(CMD_WATCH, &box_id)))
        .await
        .expect("send watch");
    put_package(&addr, &token, &hex::encode(box_id), b"one").await;
    let frame = recv_binary(&mut socket, Duration::from_secs(2))
        .await
        .expect("first delivery");
    assert_eq!(frame, expected_delivery(&box_id, b"one"));

    socket
        .send(WsMessage::Binary(command_frame(CMD_IGNORE, &box_id)))
        .await
        .expect("send ignore");
    // Give the session a moment to process the ignore before dropping again.
    tokio::time::sleep(Duration::from_millis(150)).await;

    put_package(&addr, &token, &hex::encode(box_id), b"two").await;
    assert!(
        recv_binary(&mut socket, Duration::from_millis(300)).await.is_none(),
        "ignored box must not deliver"
    );

    shutdown_tx.send(()).ok();
}

#[tokio::test]
async fn duplicate_watch_delivers_each_package_once() {
    let (storage, _user_id, token) = storage_with_user();
    let (addr, _state, shutdown_tx) = start_server(storage).await;

    let box_id: [u8; DROP_BOX_ID_SIZE] = rand::random();
    let mut socket = connect_socket(&addr, &token).await;

    for _ in 0..2 {
        socket
            .send(WsMessage::Binary(command_frame(CMD_WATCH, &box_id)))
            .await
            .expect("send watch");
    }
    tokio::time::sleep(Duration::from_millis(150)).await;

    put_package(&addr, &token, &hex::encode(box_id), b"pkg").await;

    let frame = recv_binary(&mut socket, Duration::from_secs(2))
        .await
        .expect("delivery");
    assert_eq!(frame, expected_delivery(&box_id, b"pkg"));
    assert!(
        recv_binary(&mut socket, Duration::from_millis(300)).await.is_none(),
        "the duplicate watch must not double-deliver"
    );

    shutdown_tx.send(()).ok();
}

#[tokio::test]
async fn nop_unknown_and_malformed_commands_leave_the_session_running() {
    let (storage, _user_id, token) = storage_with_user();
    let (addr, _state, shutdown_tx) = start_server(storage).await;

    let box_id: [u8; DROP_BOX_ID_SIZE] = rand::random();
    let mut socket = connect_socket(&addr, &token).await;

    socket
        .send(WsMessage::Binary(vec![CMD_NOP]))
        .await
        .expect("send nop");
    socket
        .send(WsMessage::Binary(vec![9, 1, 2, 3]))
        .await
        .expect("send unknown opcode");
    socket
        .send(WsMessage::Binary(vec![CMD_WATCH, 0x01, 0x02]))
        .await
        .expect("send short watch");
    socket
        .send(WsMessage::Binary(command_frame(CMD_IGNORE, &box_id)))
        .await
        .expect("send ignore for unwatched box");

    // The session survived all of that: a watch still works.
    socket
        .send(WsMessage::Binary(command_frame(CMD_WATCH, &box_id)))
        .await
        .expect("send watch");
    put_package(&addr, &token, &hex::encode(box_id), b"alive").await;

    let frame = recv_binary(&mut socket, Duration::from_secs(2))
        .await
        .expect("delivery after junk commands");
    assert_eq!(frame, expected_delivery(&box_id, b"alive"));

    shutdown_tx.send(()).ok();
}

#[tokio::test]
async fn upgrade_without_a_token_is_rejected() {
    let (storage, _user_id, _token) = storage_with_user();
    let (addr, _state, shutdown_tx) = start_server(storage).await;

    let result = tokio_tungstenite::connect_async(format!("ws://{addr}/drop-boxes/watch")).await;

    match result {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), 401);
        }
        Err(e) => panic!("expected HTTP 401, got error: {e}"),
        Ok(_) => panic!("upgrade should have been refused"),
    }

    shutdown_tx.send(()).ok();
}

#[tokio::test]
async fn user_messages_are_pushed_to_the_connected_socket() {
    let storage = Storage::open_in_memory().expect("open storage");
    let alice = storage.create_user("alice", now_secs()).expect("alice");
    let bob = storage.create_user("bob", now_secs()).expect("bob");
    let alice_token = storage.create_access_token(alice, now_secs()).expect("token");
    let bob_token = storage.create_access_token(bob, now_secs()).expect("token");
    let (addr, _state, shutdown_tx) = start_server(storage).await;

    let mut socket = connect_socket(&addr, &alice_token).await;
    // Let the session subscribe to Alice's message topic before sending.
    tokio::time::sleep(Duration::from_millis(150)).await;

    {
        let url = format!("http://{addr}/users/{alice}/messages");
        tokio::task::spawn_blocking(move || {
            use base64::Engine as _;
            let b64 = base64::engine::general_purpose::STANDARD;
            let response = ureq::post(&url)
                .set("X-Access-Token", &bob_token)
                .send_json(serde_json::json!({
                    "cipher_text": b64.encode(b"sealed"),
                    "nonce": b64.encode(b"nonce"),
                }))
                .expect("send message");
            assert_eq!(response.status(), 201);
        })
        .await
        .expect("send task");
    }

    let payload = recv_binary(&mut socket, Duration::from_secs(2))
        .await
        .expect("message notification");
    let notification: serde_json::Value =
        serde_json::from_slice(&payload).expect("notification json");
    assert_eq!(notification["sender_id"].as_i64(), Some(bob));
    {
        use base64::Engine as _;
        let b64 = base64::engine::general_purpose::STANDARD;
        assert_eq!(
            notification["cipher_text"].as_str(),
            Some(b64.encode(b"sealed").as_str())
        );
    }

    shutdown_tx.send(()).ok();
}

#[tokio::test]
async fn closing_the_socket_releases_every_subscription() {
    let (storage, user_id, token) = storage_with_user();
    let (addr, state, shutdown_tx) = start_server(storage).await;

    let box_id: [u8; DROP_BOX_ID_SIZE] = rand::random();
    let hex_id = hex::encode(box_id);

    let mut socket = connect_socket(&addr, &token).await;
    socket
        .send(WsMessage::Binary(command_frame(CMD_WATCH, &box_id)))
        .await
        .expect("send watch");

    // Wait until the subscription is visible.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let count = {
            let st = state.lock().await;
            st.drop_boxes.subscriber_count(&hex_id)
        };
        if count == 1 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "watch never registered");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    socket.close(None).await.expect("close socket");

    // Both the drop-box watch and the user-message subscription must go.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let (boxes, messages) = {
            let st = state.lock().await;
            (
                st.drop_boxes.subscriber_count(&hex_id),
                st.user_messages.subscriber_count(&user_id),
            )
        };
        if boxes == 0 && messages == 0 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "subscriptions were not released: boxes={boxes} messages={messages}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    shutdown_tx.send(()).ok();
}

#[tokio::test]
async fn deliveries_preserve_drop_order() {
    let (storage, _user_id, token) = storage_with_user();
    let (addr, _state, shutdown_tx) = start_server(storage).await;

    let box_id: [u8; DROP_BOX_ID_SIZE] = rand::random();
    let mut socket = connect_socket(&addr, &token).await;

    socket
        .send(WsMessage::Binary(command_frame(CMD_WATCH, &box_id)))
        .await
        .expect("send watch");
    tokio::time::sleep(Duration::from_millis(150)).await;

    for label in [b"p1".as_slice(), b"p2", b"p3"] {
        put_package(&addr, &token, &hex::encode(box_id), label).await;
    }

    for label in [b"p1".as_slice(), b"p2", b"p3"] {
        let frame = recv_binary(&mut socket, Duration::from_secs(2))
            .await
            .expect("ordered delivery");
        assert_eq!(frame, expected_delivery(&box_id, label));
    }

    shutdown_tx.send(()).ok();
}
