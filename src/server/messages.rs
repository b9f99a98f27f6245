//! User-to-user message handlers.
//!
//! Messages are sealed by the sender for the recipient; the server stores
//! the ciphertext for pickup and, once the row is durable, publishes its
//! JSON form on the recipient's user-message topic so a connected socket
//! sees it immediately.  Deleting a message is the recipient's pickup
//! acknowledgement.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Extension;
use base64::Engine as _;
use serde::Deserialize;

use crate::clog;
use crate::logging;
use crate::server::auth::UserId;
use crate::server::state::SharedState;
use crate::server::utils::{api_error, now_secs};
use crate::storage::MessageRow;

#[derive(Deserialize)]
pub struct SendMessageRequest {
    /// Base64 ciphertext, opaque to the server.
    pub cipher_text: String,
    /// Base64 nonce the recipient needs to open it.
    pub nonce: String,
}

/// Build the JSON representation of a stored message.  The same bytes are
/// returned from GET /messages and pushed over the socket.
fn message_to_json(m: &MessageRow) -> serde_json::Value {
    let b64 = base64::engine::general_purpose::STANDARD;
    serde_json::json!({
        "id": m.id,
        "sender_id": m.sender_id,
        "cipher_text": b64.encode(&m.cipher_text),
        "nonce": b64.encode(&m.nonce),
        "sent_at": m.sent_at,
    })
}

/// POST /users/{user_id}/messages
pub async fn send_message_handler(
    State(state): State<SharedState>,
    Path(recipient_id): Path<i64>,
    Extension(UserId(sender_id)): Extension<UserId>,
    axum::Json(req): axum::Json<SendMessageRequest>,
) -> Response {
    let b64 = base64::engine::general_purpose::STANDARD;
    let cipher_text = match b64.decode(&req.cipher_text) {
        Ok(bytes) => bytes,
        Err(_) => return api_error(StatusCode::BAD_REQUEST, "invalid cipher_text"),
    };
    let nonce = match b64.decode(&req.nonce) {
        Ok(bytes) => bytes,
        Err(_) => return api_error(StatusCode::BAD_REQUEST, "invalid nonce"),
    };

    let sent_at = now_secs();

    let (payload, message_id, user_messages) = {
        let st = state.lock().await;
        match st.storage.user_exists(recipient_id) {
            Ok(true) => {}
            Ok(false) => return api_error(StatusCode::NOT_FOUND, "user not found"),
            Err(e) => return api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        }

        let message_id = match st
            .storage
            .insert_message(recipient_id, sender_id, &cipher_text, &nonce, sent_at)
        {
            Ok(id) => id,
            Err(e) => return api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        };

        let row = MessageRow {
            id: message_id,
            recipient_id,
            sender_id,
            cipher_text,
            nonce,
            sent_at,
        };
        let payload = serde_json::to_vec(&message_to_json(&row)).unwrap_or_default();
        (payload, message_id, st.user_messages.clone())
    };

    clog!(
        "message: {} -> {}",
        logging::user_id(sender_id),
        logging::user_id(recipient_id)
    );

    user_messages.publish(payload, &recipient_id).await;

    (
        StatusCode::CREATED,
        axum::Json(serde_json::json!({ "id": message_id })),
    )
        .into_response()
}

/// GET /messages
pub async fn list_messages_handler(
    State(state): State<SharedState>,
    Extension(UserId(user_id)): Extension<UserId>,
) -> Response {
    let st = state.lock().await;
    match st.storage.list_messages(user_id) {
        Ok(messages) => {
            let json: Vec<serde_json::Value> = messages.iter().map(message_to_json).collect();
            (StatusCode::OK, axum::Json(serde_json::json!(json))).into_response()
        }
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// GET /messages/{message_id}
pub async fn get_message_handler(
    State(state): State<SharedState>,
    Path(message_id): Path<i64>,
    Extension(UserId(user_id)): Extension<UserId>,
) -> Response {
    let st = state.lock().await;
    match st.storage.get_message(user_id, message_id) {
        Ok(Some(m)) => (StatusCode::OK, axum::Json(message_to_json(&m))).into_response(),
        Ok(None) => api_error(StatusCode::NOT_FOUND, "message not found"),
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// DELETE /messages/{message_id}
pub async fn delete_message_handler(
    State(state): State<SharedState>,
    Path(message_id): Path<i64>,
    Extension(UserId(user_id)): Extension<UserId>,
) -> Response {
    let st = state.lock().await;
    match st.storage.delete_message(user_id, message_id) {
        Ok(true) => (
            StatusCode::OK,
            axum::Json(serde_json::json!({ "status": "deleted" })),
        )
            .into_response(),
        Ok(false) => api_error(StatusCode::NOT_FOUND, "message not found"),
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}
