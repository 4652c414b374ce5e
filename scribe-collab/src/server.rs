//! WebSocket sync server with path-based document routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐  ws://host/notes
//!            ├──────────────────► Room "notes" ── Session ── BroadcastGroup
//! Client B ──┘                         ▲                         │
//!                                      │ RoomCommand (mpsc)      │ Outbound
//! Client C ───── ws://host/ ─────► Room "default"                ▼
//!                                                   ┌────────────┼────────────┐
//!                                                   ▼            ▼            ▼
//!                                                Client A     Client B    (origin gets "ok")
//! ```
//!
//! Each connection runs its own task. It forwards parsed events to its room
//! and relays the room's broadcasts back to the socket. Nothing but the room
//! task touches the room's session.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use scribe_core::{ClientId, TextEncoding};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::broadcast::{Echo, Outbound};
use crate::protocol::{ClientEvent, ProtocolError, ServerEvent};
use crate::room::{DocumentHandle, RoomConfig, RoomManager};

/// Document used for connections to `/`.
pub const DEFAULT_DOCUMENT: &str = "default";

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum connections per room
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Interval between WebSocket pings
    pub heartbeat_interval_secs: u64,
    /// Unit for operation lengths and offsets, fixed for the server's lifetime
    pub text_encoding: TextEncoding,
    /// Text every new document starts from
    pub initial_document: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
            text_encoding: TextEncoding::Utf8,
            initial_document: String::new(),
        }
    }
}

impl ServerConfig {
    pub fn room_config(&self) -> RoomConfig {
        RoomConfig {
            broadcast_capacity: self.broadcast_capacity,
            max_peers: self.max_peers_per_room,
            encoding: self.text_encoding,
            initial_document: self.initial_document.clone(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    /// Events answered with an `error` frame
    pub rejected_events: u64,
    pub active_rooms: usize,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    room_manager: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        let room_manager = Arc::new(RoomManager::new(config.room_config()));
        Self {
            config,
            room_manager,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Start listening for WebSocket connections.
    ///
    /// This runs the server event loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!(
            "Sync server listening on {} ({} units)",
            self.config.bind_addr,
            self.config.text_encoding
        );

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let stats = self.stats.clone();
            let config = self.config.clone();
            let room_manager = self.room_manager.clone();

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, room_manager, stats, config).await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        room_manager: Arc<RoomManager>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), BoxError> {
        let mut path = String::new();
        let ws_stream = tokio_tungstenite::accept_hdr_async(
            stream,
            |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                path = request.uri().path().to_owned();
                Ok(response)
            },
        )
        .await?;
        let (mut ws_sender, ws_receiver) = ws_stream.split();

        let client_id = Uuid::new_v4();
        let document = document_name(&path);
        log::info!("WebSocket connection {client_id} from {addr} for '{document}'");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let room = room_manager.get_or_create(&document).await;
        stats.write().await.active_rooms = room_manager.room_count().await;

        let result = match room.connect(client_id).await {
            Ok((snapshot, broadcast_rx)) => {
                let result = async {
                    send_event(&mut ws_sender, &ServerEvent::Doc(snapshot)).await?;
                    Self::pump(
                        &mut ws_sender,
                        ws_receiver,
                        broadcast_rx,
                        &room,
                        client_id,
                        &stats,
                        &config,
                    )
                    .await
                }
                .await;
                room.disconnect(client_id).await;
                result
            }
            Err(e) => {
                log::warn!("Refusing {client_id} from {addr}: {e}");
                stats.write().await.rejected_events += 1;
                send_event(&mut ws_sender, &ServerEvent::error(&e)).await
            }
        };
        let _ = ws_sender.close().await;

        stats.write().await.active_connections -= 1;
        log::info!("Connection {client_id} closed");
        result
    }

    /// Relay frames until either side goes away.
    async fn pump(
        ws_sender: &mut WsSink,
        mut ws_receiver: WsSource,
        mut broadcast_rx: broadcast::Receiver<Arc<Outbound>>,
        room: &DocumentHandle,
        client_id: ClientId,
        stats: &RwLock<ServerStats>,
        config: &ServerConfig,
    ) -> Result<(), BoxError> {
        let ok_frame = ServerEvent::Ok.encode()?;
        let mut heartbeat =
            tokio::time::interval(Duration::from_secs(config.heartbeat_interval_secs.max(1)));
        // The first tick completes immediately.
        heartbeat.tick().await;

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += text.len() as u64;
                            }

                            let decoded = ClientEvent::decode(text.as_str(), config.text_encoding);
                            let reply = match decoded {
                                Ok(event) => {
                                    log::debug!("{client_id} sent '{}'", event.name());
                                    dispatch(room, client_id, event).await
                                }
                                Err(e) => Err(e),
                            };
                            let reply = match reply {
                                Ok(reply) => reply,
                                Err(e) => {
                                    log::warn!("Rejected event from {client_id}: {e}");
                                    stats.write().await.rejected_events += 1;
                                    Some(ServerEvent::error(&e))
                                }
                            };
                            if let Some(event) = reply {
                                send_event(ws_sender, &event).await?;
                            }
                        }

                        Some(Ok(Message::Binary(_))) => {
                            log::warn!("Binary frame from {client_id} ignored");
                            stats.write().await.rejected_events += 1;
                            let event = ServerEvent::Error {
                                message: "binary frames are not supported".to_string(),
                            };
                            send_event(ws_sender, &event).await?;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::debug!("{client_id} closed the connection");
                            break;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {client_id}: {e}");
                            break;
                        }

                        Some(Ok(_)) => {}
                    }
                }

                // Committed events from the room
                msg = broadcast_rx.recv() => {
                    match msg {
                        Ok(outbound) => {
                            let frame = if outbound.origin == client_id {
                                match outbound.echo {
                                    Echo::Skip => continue,
                                    Echo::Acknowledge => ok_frame.clone(),
                                }
                            } else {
                                outbound.frame.clone()
                            };
                            ws_sender.send(Message::Text(frame.into())).await?;
                        }
                        Err(RecvError::Lagged(n)) => {
                            log::warn!("{client_id} lagged by {n} events, disconnecting");
                            room.record_dropped(n);
                            break;
                        }
                        Err(RecvError::Closed) => break,
                    }
                }

                _ = heartbeat.tick() => {
                    ws_sender.send(Message::Ping(Vec::new().into())).await?;
                }
            }
        }

        Ok(())
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn room_manager(&self) -> &Arc<RoomManager> {
        &self.room_manager
    }
}

/// Forward one parsed event to the room, returning the direct reply if any.
async fn dispatch(
    room: &DocumentHandle,
    client_id: ClientId,
    event: ClientEvent,
) -> Result<Option<ServerEvent>, ProtocolError> {
    match event {
        ClientEvent::Join { username } => {
            room.join(client_id, username).await?;
            Ok(Some(ServerEvent::Registered(client_id)))
        }
        // Acknowledged through the broadcast channel.
        ClientEvent::Operation {
            revision,
            operation,
        } => {
            room.submit(client_id, revision, operation).await?;
            Ok(None)
        }
        ClientEvent::Selection(selection) => {
            room.select(client_id, selection).await?;
            Ok(None)
        }
    }
}

async fn send_event(sink: &mut WsSink, event: &ServerEvent) -> Result<(), BoxError> {
    sink.send(Message::Text(event.encode()?.into())).await?;
    Ok(())
}

/// Document name for a request path: `/notes` → `notes`, `/` → `default`.
pub fn document_name(path: &str) -> String {
    let name = path.trim_matches('/');
    if name.is_empty() {
        DEFAULT_DOCUMENT.to_string()
    } else {
        name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.max_peers_per_room, 100);
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.heartbeat_interval_secs, 30);
        assert_eq!(config.text_encoding, TextEncoding::Utf8);
        assert!(config.initial_document.is_empty());
    }

    #[test]
    fn test_room_config_from_server_config() {
        let config = ServerConfig {
            max_peers_per_room: 5,
            broadcast_capacity: 8,
            text_encoding: TextEncoding::Utf16,
            initial_document: "seed".to_string(),
            ..ServerConfig::default()
        };
        let room = config.room_config();
        assert_eq!(room.max_peers, 5);
        assert_eq!(room.broadcast_capacity, 8);
        assert_eq!(room.encoding, TextEncoding::Utf16);
        assert_eq!(room.initial_document, "seed");
    }

    #[test]
    fn test_server_custom_config() {
        let config = ServerConfig {
            bind_addr: "0.0.0.0:8080".to_string(),
            ..ServerConfig::default()
        };
        let server = SyncServer::new(config);
        assert_eq!(server.bind_addr(), "0.0.0.0:8080");
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = SyncServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_messages, 0);
        assert_eq!(stats.total_bytes, 0);
        assert_eq!(stats.rejected_events, 0);
        assert_eq!(stats.active_rooms, 0);
        assert_eq!(server.room_manager().room_count().await, 0);
    }

    #[test]
    fn test_document_name() {
        assert_eq!(document_name("/"), "default");
        assert_eq!(document_name(""), "default");
        assert_eq!(document_name("/notes"), "notes");
        assert_eq!(document_name("/team/notes/"), "team/notes");
    }
}
