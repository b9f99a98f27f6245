//! The per-connection socket state machine.
//!
//! One session per accepted WebSocket.  The client authenticates during the
//! upgrade by carrying its access token in `Sec-WebSocket-Protocol`, then
//! drives its set of drop-box watches with single-byte commands; the server
//! pushes user messages and watched-box packages back as binary frames.
//!
//! A session is a small task group: the select loop below plays reader and
//! writer in one task (so frames never interleave and the subscription map
//! needs no lock), and each watched box gets a forwarder task that relays
//! its subscription queue into the loop's package channel.  All of them hang
//! off one `watch` channel; flipping it tears the whole session down, and
//! the session awaits every forwarder before it returns.

use std::collections::HashMap;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use crate::clog;
use crate::logging;
use crate::pubsub::{PubSub, Subscription};
use crate::server::state::SharedState;
use crate::server::utils::api_error;
use crate::storage::DROP_BOX_ID_SIZE;

const SOCKET_CMD_NOP: u8 = 0;
const SOCKET_CMD_WATCH: u8 = 1;
const SOCKET_CMD_IGNORE: u8 = 2;

/// Capacity of the channel between forwarders and the writing loop.  Matches
/// the subscription queues: a stalled client back-pressures its publishers
/// instead of ballooning memory.
const PACKAGE_CHANNEL_CAPACITY: usize = 5;

/// GET /drop-boxes/watch
pub async fn watch_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<SharedState>,
) -> Response {
    let token = headers
        .get("sec-websocket-protocol")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_string();

    let user_id = {
        let st = state.lock().await;
        match st.storage.verify_access_token(&token) {
            Ok(Some(user_id)) => user_id,
            Ok(None) => return api_error(StatusCode::UNAUTHORIZED, "invalid access token"),
            Err(e) => return api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        }
    };

    // Echo the token as the accepted subprotocol so strict clients see the
    // negotiation complete.
    ws.protocols([token])
        .on_upgrade(move |socket| run_session(socket, user_id, state))
}

/// Frame a package for the wire: watch opcode, box ID, payload.
fn package_frame(box_id: &[u8; DROP_BOX_ID_SIZE], package: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(1 + DROP_BOX_ID_SIZE + package.len());
    frame.push(SOCKET_CMD_WATCH);
    frame.extend_from_slice(box_id);
    frame.extend_from_slice(package);
    frame
}

struct SocketSession {
    user_id: i64,
    state: SharedState,
    drop_boxes: PubSub<String>,
    /// Sender side of the package channel the select loop drains.
    pkg_tx: mpsc::Sender<Vec<u8>>,
    /// Session-wide close signal; every forwarder selects on a clone.
    closed: watch::Receiver<bool>,
    /// hex box ID -> subscription registry ID.  Only the session loop
    /// touches this, so no lock is needed.
    subs: HashMap<String, u64>,
    forwarders: JoinSet<()>,
}

impl SocketSession {
    async fn handle_command(&mut self, buf: &[u8]) {
        if buf.is_empty() {
            clog!("socket: received an empty frame, ignoring");
            return;
        }
        match buf[0] {
            SOCKET_CMD_NOP => {}
            SOCKET_CMD_WATCH => self.watch_box(&buf[1..]).await,
            SOCKET_CMD_IGNORE => self.ignore_box(&buf[1..]),
            other => clog!("socket: unknown command {other}"),
        }
    }

    async fn watch_box(&mut self, raw: &[u8]) {
        let Ok(box_id) = <[u8; DROP_BOX_ID_SIZE]>::try_from(raw) else {
            clog!("socket: invalid drop box id length ({})", raw.len());
            return;
        };
        let hex_id = hex::encode(box_id);

        if self.subs.contains_key(&hex_id) {
            clog!(
                "socket: duplicate watch for {}, skipping",
                logging::box_id(&hex_id)
            );
            return;
        }

        let sub = self.drop_boxes.subscribe(hex_id.clone());
        self.subs.insert(hex_id, sub.id());

        // If the box already holds a package, hand it to the forwarder so it
        // goes out first.  A drop landing between this pickup and the
        // subscribe above can duplicate one delivery; clients treat package
        // receipt as idempotent.
        let current = {
            let st = self.state.lock().await;
            st.storage.pick_up_package(&box_id)
        };
        let initial = match current {
            Ok(Some(package)) if !package.is_empty() => Some(package),
            Ok(_) => None,
            Err(e) => {
                clog!("socket: pickup at watch time failed: {e}");
                None
            }
        };

        self.spawn_forwarder(box_id, sub, initial);
    }

    fn ignore_box(&mut self, raw: &[u8]) {
        let Ok(box_id) = <[u8; DROP_BOX_ID_SIZE]>::try_from(raw) else {
            clog!("socket: invalid drop box id length ({})", raw.len());
            return;
        };
        let hex_id = hex::encode(box_id);

        match self.subs.remove(&hex_id) {
            Some(sub_id) => self.drop_boxes.unsubscribe(&hex_id, sub_id),
            // Client error: they never watched this box.
            None => clog!(
                "socket: ignore for unwatched box {}",
                logging::box_id(&hex_id)
            ),
        }
    }

    /// Relay one subscription's queue into the package channel, framed.
    /// Exits when the subscription closes (IGNORE) or the session does; an
    /// exiting forwarder never takes the session down with it.
    fn spawn_forwarder(
        &mut self,
        box_id: [u8; DROP_BOX_ID_SIZE],
        mut sub: Subscription,
        initial: Option<Vec<u8>>,
    ) {
        let pkg_tx = self.pkg_tx.clone();
        let mut closed = self.closed.clone();
        self.forwarders.spawn(async move {
            if let Some(package) = initial {
                if pkg_tx.send(package_frame(&box_id, &package)).await.is_err() {
                    return;
                }
            }
            loop {
                tokio::select! {
                    _ = closed.changed() => return,
                    package = sub.recv() => match package {
                        Some(package) => {
                            if pkg_tx.send(package_frame(&box_id, &package)).await.is_err() {
                                return;
                            }
                        }
                        // Queue closed, normally by an unsubscribe.
                        None => return,
                    },
                }
            }
        });
    }
}

async fn run_session(mut socket: WebSocket, user_id: i64, state: SharedState) {
    let (drop_boxes, user_messages) = {
        let st = state.lock().await;
        (st.drop_boxes.clone(), st.user_messages.clone())
    };
    let mut messages = user_messages.subscribe(user_id);
    let (pkg_tx, mut pkg_rx) = mpsc::channel::<Vec<u8>>(PACKAGE_CHANNEL_CAPACITY);
    let (closed_tx, closed_rx) = watch::channel(false);

    let mut session = SocketSession {
        user_id,
        state,
        drop_boxes: drop_boxes.clone(),
        pkg_tx,
        closed: closed_rx,
        subs: HashMap::new(),
        forwarders: JoinSet::new(),
    };

    clog!(
        "socket: session opened for {}",
        logging::user_id(session.user_id)
    );

    loop {
        tokio::select! {
            frame = socket.recv() => {
                match frame {
                    Some(Ok(Message::Binary(buf))) => session.handle_command(&buf).await,
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Text(_))) => {
                        clog!("socket: received a non-binary message");
                        break;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                }
            }
            msg = messages.recv() => {
                match msg {
                    // User-message payloads arrive already framed; forward
                    // them opaquely.
                    Some(payload) => {
                        if socket.send(Message::Binary(payload)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            pkg = pkg_rx.recv() => {
                if let Some(frame) = pkg {
                    if socket.send(Message::Binary(frame)).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    // Closing: signal the forwarders, release every subscription, and wait
    // for the whole task group before the session's resources go away.
    let _ = closed_tx.send(true);
    drop(pkg_rx);
    for (hex_id, sub_id) in session.subs.drain() {
        drop_boxes.unsubscribe(&hex_id, sub_id);
    }
    user_messages.unsubscribe(&session.user_id, messages.id());
    while session.forwarders.join_next().await.is_some() {}

    clog!(
        "socket: session closed for {}",
        logging::user_id(session.user_id)
    );
}
