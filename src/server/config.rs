//! Configuration types and constants for the courier server.

use std::path::PathBuf;

use clap::Parser;

/// Largest package accepted over HTTP, including multipart overhead.
pub(crate) const MAX_PACKAGE_SIZE: usize = 10 * 1024 * 1024; // 10 MiB

/// Header carrying the access token on REST requests.  The socket handshake
/// uses `Sec-WebSocket-Protocol` instead, since browsers cannot set custom
/// headers on an upgrade request.
pub(crate) const ACCESS_TOKEN_HEADER: &str = "x-access-token";

/// Relay server for an end-to-end-encrypted messenger.
///
/// Accepts sealed packages addressed to anonymous drop boxes or to users,
/// persists them in SQLite, and pushes real-time notifications over a binary
/// WebSocket.
///
/// Configuration can be set via CLI arguments or environment variables.
/// CLI arguments take precedence over environment variables.
#[derive(Parser, Debug)]
#[command(name = "courier", version, about)]
pub struct Cli {
    /// HTTP server bind address [env: COURIER_BIND] [default: 127.0.0.1:4040]
    #[arg(long, short = 'b')]
    pub bind: Option<String>,

    /// Data directory for the database [env: COURIER_HOME] [default: ~/.courier]
    #[arg(long, short = 'd')]
    pub data_dir: Option<PathBuf>,
}

pub struct Config {
    pub bind_addr: String,
    pub data_dir: PathBuf,
}

impl Config {
    pub fn from_cli_and_env(cli: Cli) -> Self {
        let data_dir = cli
            .data_dir
            .or_else(|| std::env::var("COURIER_HOME").ok().map(PathBuf::from))
            .unwrap_or_else(|| {
                std::env::var("HOME")
                    .map(|h| PathBuf::from(h).join(".courier"))
                    .unwrap_or_else(|_| PathBuf::from(".courier"))
            });

        let bind_addr = cli
            .bind
            .or_else(|| std::env::var("COURIER_BIND").ok())
            .unwrap_or_else(|| "127.0.0.1:4040".to_string());

        Self {
            bind_addr,
            data_dir,
        }
    }
}
