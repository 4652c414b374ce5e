//! Scribe server: collaborative plain-text editing over WebSocket.
//!
//! Every path is its own document: clients of `ws://host:port/notes` edit
//! `notes`, clients of `ws://host:port/` edit `default`.

use clap::Parser;
use log::info;

use scribe_collab::server::{BoxError, ServerConfig, SyncServer};
use scribe_core::TextEncoding;

#[derive(Debug, Parser)]
#[command(name = "scribe-server", version, about = "Collaborative text editing server")]
struct Args {
    /// Interface to listen on
    #[arg(long, env = "SCRIBE_BIND", default_value = "127.0.0.1")]
    bind: String,

    /// Port to listen on
    #[arg(short, long, env = "PORT", default_value_t = 9090)]
    port: u16,

    /// Unit for lengths and offsets: utf8 (code points) or utf16 (code units)
    #[arg(long, env = "SCRIBE_ENCODING", default_value_t = TextEncoding::Utf8)]
    encoding: TextEncoding,

    /// Maximum connections per document
    #[arg(long, env = "SCRIBE_MAX_PEERS", default_value_t = 100)]
    max_peers: usize,

    /// Events buffered per connection before it is dropped as lagging
    #[arg(long, env = "SCRIBE_BROADCAST_CAPACITY", default_value_t = 256)]
    broadcast_capacity: usize,

    /// Seconds between WebSocket pings
    #[arg(long, env = "SCRIBE_HEARTBEAT_SECS", default_value_t = 30)]
    heartbeat_secs: u64,

    /// Text new documents start from
    #[arg(long, env = "SCRIBE_INITIAL_DOCUMENT", default_value = "")]
    initial_document: String,
}

impl Args {
    fn server_config(self) -> ServerConfig {
        ServerConfig {
            bind_addr: format!("{}:{}", self.bind, self.port),
            max_peers_per_room: self.max_peers,
            broadcast_capacity: self.broadcast_capacity,
            heartbeat_interval_secs: self.heartbeat_secs,
            text_encoding: self.encoding,
            initial_document: self.initial_document,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Args::parse().server_config();
    info!("Scribe server starting on {}", config.bind_addr);
    let server = SyncServer::new(config);

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }
    Ok(())
}
