//! courier server: HTTP + WebSocket front end over the storage and buses.

pub mod auth;
pub mod config;
pub mod drop_boxes;
pub mod messages;
pub mod router;
pub mod sockets;
pub mod state;
pub mod utils;

use clap::Parser;

use crate::clog;
use crate::storage::Storage;

use config::{Cli, Config};
use state::AppState;

/// Entry point: parse CLI, open storage, start serving.
pub async fn run() {
    let cli = Cli::parse();
    let config = Config::from_cli_and_env(cli);

    crate::logging::init();

    clog!("courier starting");
    clog!("  data directory: {}", config.data_dir.display());

    let db_path = config.data_dir.join("courier.db");
    let storage = Storage::open(&db_path).expect("failed to open database");
    clog!("  database: {}", db_path.display());

    let state = AppState::shared(storage);
    let app = router::build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("failed to bind");
    clog!("courier listening on http://{}", config.bind_addr);

    axum::serve(listener, app).await.expect("server error");
}
