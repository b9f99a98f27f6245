//! Shared application state.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::pubsub::PubSub;
use crate::storage::Storage;

/// Everything the handlers share: the database plus the two pub/sub buses.
///
/// The buses are cheap clones over shared internals, so handlers clone them
/// out of the lock and publish without holding it; only storage access needs
/// the lock held.
pub struct AppState {
    pub storage: Storage,
    /// Drop-box notifications, keyed by hex box ID.
    pub drop_boxes: PubSub<String>,
    /// User-message notifications, keyed by user ID.
    pub user_messages: PubSub<i64>,
}

pub type SharedState = Arc<Mutex<AppState>>;

impl AppState {
    pub fn shared(storage: Storage) -> SharedState {
        Arc::new(Mutex::new(AppState {
            storage,
            drop_boxes: PubSub::new(),
            user_messages: PubSub::new(),
        }))
    }
}
