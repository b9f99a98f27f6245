//! Drop-box HTTP handlers.
//!
//! A drop box is an anonymous mailbox: 16 client-chosen bytes of address,
//! one opaque package of content, last writer wins.  Packages are published
//! on the drop-box bus only after the store write is durable, so a watcher
//! that fetches on notification always sees the stored value.

use std::collections::HashMap;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Extension;
use axum_extra::extract::Multipart;

use crate::clog;
use crate::logging;
use crate::server::auth::UserId;
use crate::server::state::SharedState;
use crate::server::utils::api_error;
use crate::storage::DROP_BOX_ID_SIZE;

/// Decode and validate a hex drop-box ID from a URL or multipart form name.
pub(crate) fn parse_drop_box_id(hex_id: &str) -> Option<[u8; DROP_BOX_ID_SIZE]> {
    let bytes = hex::decode(hex_id).ok()?;
    <[u8; DROP_BOX_ID_SIZE]>::try_from(bytes).ok()
}

/// PUT /drop-boxes/{box_id}
pub async fn drop_package_handler(
    State(state): State<SharedState>,
    Path(hex_id): Path<String>,
    Extension(UserId(user_id)): Extension<UserId>,
    body: Bytes,
) -> Response {
    let Some(box_id) = parse_drop_box_id(&hex_id) else {
        return api_error(StatusCode::BAD_REQUEST, "invalid drop box id");
    };

    let drop_boxes = {
        let st = state.lock().await;
        if let Err(e) = st.storage.put_package(&box_id, &body) {
            return api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
        }
        st.drop_boxes.clone()
    };

    clog!(
        "drop: {} dropped a package into {}",
        logging::user_id(user_id),
        logging::box_id(&hex_id)
    );

    // The package is durable; notify watchers before returning so that two
    // PUTs serialised by one client reach every watcher in drop order.  A
    // watcher that has fallen a full queue behind back-pressures us here.
    drop_boxes.publish(body.to_vec(), &hex_id).await;

    StatusCode::OK.into_response()
}

/// GET /drop-boxes/{box_id}
pub async fn pick_up_package_handler(
    State(state): State<SharedState>,
    Path(hex_id): Path<String>,
) -> Response {
    let Some(box_id) = parse_drop_box_id(&hex_id) else {
        return api_error(StatusCode::BAD_REQUEST, "invalid drop box id");
    };

    let st = state.lock().await;
    match st.storage.pick_up_package(&box_id) {
        Ok(package) => (StatusCode::OK, package.unwrap_or_default()).into_response(),
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// POST /drop-boxes/send
///
/// Multipart body: each part's form name is a hex box ID, each part's body a
/// package.  The whole batch is validated before anything is written, stored
/// in one transaction, and published concurrently after the response.
pub async fn send_multiple_packages_handler(
    State(state): State<SharedState>,
    Extension(UserId(user_id)): Extension<UserId>,
    mut multipart: Multipart,
) -> Response {
    let mut packages: HashMap<[u8; DROP_BOX_ID_SIZE], Vec<u8>> = HashMap::new();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return api_error(StatusCode::BAD_REQUEST, format!("error reading part: {e}")),
        };

        let name = field.name().unwrap_or("").to_string();
        let Some(box_id) = parse_drop_box_id(&name) else {
            return api_error(StatusCode::BAD_REQUEST, "invalid drop box id");
        };

        match field.bytes().await {
            Ok(data) => {
                // Duplicate box IDs within one batch: last part wins.
                packages.insert(box_id, data.to_vec());
            }
            Err(e) => {
                return api_error(
                    StatusCode::BAD_REQUEST,
                    format!("error reading part data: {e}"),
                )
            }
        }
    }

    let drop_boxes = {
        let st = state.lock().await;
        if let Err(e) = st.storage.put_packages(&packages) {
            return api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
        }
        st.drop_boxes.clone()
    };

    clog!(
        "drop: {} dropped {} package(s) in a batch",
        logging::user_id(user_id),
        packages.len()
    );

    for (box_id, package) in packages {
        let drop_boxes = drop_boxes.clone();
        tokio::spawn(async move {
            drop_boxes.publish(package, &hex::encode(box_id)).await;
        });
    }

    StatusCode::OK.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_well_formed_id() {
        let id = parse_drop_box_id("00112233445566778899aabbccddeeff").unwrap();
        assert_eq!(id[0], 0x00);
        assert_eq!(id[15], 0xff);
    }

    #[test]
    fn rejects_wrong_lengths_and_non_hex() {
        assert!(parse_drop_box_id("0011").is_none());
        assert!(parse_drop_box_id("00112233445566778899aabbccddeeff00").is_none());
        assert!(parse_drop_box_id("zz112233445566778899aabbccddeeff").is_none());
        assert!(parse_drop_box_id("").is_none());
    }
}
