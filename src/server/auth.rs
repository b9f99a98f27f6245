//! Access-token authentication for REST requests.
//!
//! The gate itself is [`crate::storage::Storage::verify_access_token`]; this
//! module wraps it in an axum middleware layer that resolves the
//! `X-Access-Token` header and stores the result as a [`UserId`] request
//! extension for the handlers behind it.

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;

use crate::server::config::ACCESS_TOKEN_HEADER;
use crate::server::state::SharedState;
use crate::server::utils::api_error;

/// The authenticated caller, injected into request extensions by
/// [`require_session`].
#[derive(Clone, Copy, Debug)]
pub struct UserId(pub i64);

/// Middleware: reject requests without a valid access token, otherwise run
/// the inner handler with [`UserId`] available.
pub async fn require_session(
    State(state): State<SharedState>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = request
        .headers()
        .get(ACCESS_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_string();

    let verified = {
        let st = state.lock().await;
        st.storage.verify_access_token(&token)
    };

    match verified {
        Ok(Some(user_id)) => {
            request.extensions_mut().insert(UserId(user_id));
            next.run(request).await
        }
        Ok(None) => api_error(StatusCode::UNAUTHORIZED, "invalid access token"),
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}
