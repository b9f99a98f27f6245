//! Axum router construction.

use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;

use crate::server::auth;
use crate::server::config::MAX_PACKAGE_SIZE;
use crate::server::drop_boxes;
use crate::server::messages;
use crate::server::sockets;
use crate::server::state::SharedState;

/// Build the complete router.  Everything except the health check and the
/// watch upgrade sits behind the access-token layer; the upgrade carries its
/// token in `Sec-WebSocket-Protocol` and authenticates in its own handler.
pub fn build_router(state: SharedState) -> Router {
    let session_routes = Router::new()
        .route(
            "/drop-boxes/send",
            post(drop_boxes::send_multiple_packages_handler),
        )
        .route(
            "/drop-boxes/:box_id",
            get(drop_boxes::pick_up_package_handler).put(drop_boxes::drop_package_handler),
        )
        .route(
            "/users/:user_id/messages",
            post(messages::send_message_handler),
        )
        .route("/messages", get(messages::list_messages_handler))
        .route(
            "/messages/:message_id",
            get(messages::get_message_handler).delete(messages::delete_message_handler),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_session,
        ));

    Router::new()
        .route("/health", get(health_handler))
        .route("/drop-boxes/watch", get(sockets::watch_handler))
        .merge(session_routes)
        .layer(DefaultBodyLimit::max(MAX_PACKAGE_SIZE))
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    StatusCode::OK
}
