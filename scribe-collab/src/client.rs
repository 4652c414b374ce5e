//! WebSocket sync client for connecting to the collaboration server.
//!
//! Provides:
//! - Connection lifecycle (connect, join, close)
//! - Local edits sent one at a time, later ones buffered until acknowledged
//! - Remote operations and selections transformed onto the local document
//!
//! The OT bookkeeping lives in [`OtClient`], a synchronous state machine that
//! knows nothing about sockets:
//!
//! ```text
//!   server revision r        in flight           buffered
//!   ─────────────────► [ outstanding ] ─► [ b0 ] ─► [ b1 ] ─► local document
//!
//!   remote op ──transform──► outstanding ──► b0 ──► b1 ──► apply
//!   ok        ──► r += 1, b0 becomes outstanding and is sent
//! ```

use std::collections::VecDeque;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use scribe_core::{transform, ClientId, Operation, OtError, Selection, TextEncoding};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{ClientEvent, DocSnapshot, ProtocolError, ServerEvent};

/// Client-side view of one document.
#[derive(Debug, Clone)]
pub struct OtClient {
    revision: usize,
    document: String,
    encoding: TextEncoding,
    outstanding: Option<Operation>,
    buffer: VecDeque<Operation>,
}

impl OtClient {
    pub fn new(document: impl Into<String>, revision: usize, encoding: TextEncoding) -> Self {
        Self {
            revision,
            document: document.into(),
            encoding,
            outstanding: None,
            buffer: VecDeque::new(),
        }
    }

    /// Last server revision this client has seen.
    pub fn revision(&self) -> usize {
        self.revision
    }

    pub fn document(&self) -> &str {
        &self.document
    }

    pub fn encoding(&self) -> TextEncoding {
        self.encoding
    }

    pub fn outstanding(&self) -> Option<&Operation> {
        self.outstanding.as_ref()
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// True when every local edit has been acknowledged.
    pub fn is_synchronized(&self) -> bool {
        self.outstanding.is_none()
    }

    /// Apply a local edit. Returns `(revision, op)` when it should be sent
    /// right away; otherwise it waits behind the operation in flight.
    pub fn apply_local(&mut self, op: Operation) -> Result<Option<(usize, Operation)>, OtError> {
        self.document = op.apply(&self.document)?;
        if self.outstanding.is_some() {
            self.buffer.push_back(op);
            return Ok(None);
        }
        self.outstanding = Some(op.clone());
        Ok(Some((self.revision, op)))
    }

    /// Apply an operation committed by someone else. Returns it as applied
    /// to the local document.
    pub fn apply_remote(&mut self, op: &Operation) -> Result<Operation, OtError> {
        let mut remote = op.clone();
        remote.set_meta(None);

        let outstanding = match &self.outstanding {
            Some(pending) => {
                let (rebased, rest) = rebase(pending, &remote)?;
                remote = rest;
                Some(rebased)
            }
            None => None,
        };
        let mut buffer = VecDeque::with_capacity(self.buffer.len());
        for pending in &self.buffer {
            let (rebased, rest) = rebase(pending, &remote)?;
            buffer.push_back(rebased);
            remote = rest;
        }
        let document = remote.apply(&self.document)?;

        self.outstanding = outstanding;
        self.buffer = buffer;
        self.document = document;
        self.revision += 1;
        Ok(remote)
    }

    /// The server committed our operation in flight. Returns the next one to
    /// send, if any.
    pub fn acknowledge(&mut self) -> Result<Option<(usize, Operation)>, ProtocolError> {
        if self.outstanding.take().is_none() {
            return Err(ProtocolError::UnexpectedAck);
        }
        self.revision += 1;
        self.outstanding = self.buffer.pop_front();
        Ok(self
            .outstanding
            .clone()
            .map(|op| (self.revision, op)))
    }

    /// Map a selection expressed against the server document onto the local
    /// document.
    pub fn transform_selection(&self, selection: &Selection) -> Selection {
        self.outstanding
            .iter()
            .chain(self.buffer.iter())
            .fold(selection.clone(), |sel, op| sel.transform(op))
    }
}

/// Transform a pending local operation past `remote`, keeping its selection.
fn rebase(pending: &Operation, remote: &Operation) -> Result<(Operation, Operation), OtError> {
    let meta = pending.meta().map(|selection| selection.transform(remote));
    let (mut rebased, rest) = transform(pending, remote)?;
    rebased.set_meta(meta);
    Ok((rebased, rest))
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// Initial document received
    Snapshot(DocSnapshot),
    /// The server accepted our join
    Registered(ClientId),
    /// An operation from another client, already applied locally
    RemoteOperation {
        client_id: ClientId,
        operation: Operation,
        selection: Option<Selection>,
    },
    RemoteSelection {
        client_id: ClientId,
        selection: Selection,
    },
    PeerJoined {
        client_id: ClientId,
        username: String,
    },
    PeerLeft(ClientId),
    /// Our operation was committed as `revision`
    Acknowledged { revision: usize },
    /// The server refused one of our events
    Rejected(String),
}

/// The sync client.
///
/// Manages a WebSocket connection to the collaboration server, keeps the
/// local copy of the document consistent and reports what happens as
/// [`SyncEvent`]s.
pub struct SyncClient {
    username: String,

    /// Document we're editing
    document_name: String,

    encoding: TextEncoding,

    state: Arc<RwLock<ConnectionState>>,

    /// Set once the server's snapshot arrived
    ot: Arc<Mutex<Option<OtClient>>>,

    client_id: Arc<RwLock<Option<ClientId>>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Message>>,

    event_rx: Option<mpsc::Receiver<SyncEvent>>,

    event_tx: mpsc::Sender<SyncEvent>,

    server_url: String,
}

impl SyncClient {
    pub fn new(
        username: impl Into<String>,
        document_name: impl Into<String>,
        server_url: impl Into<String>,
        encoding: TextEncoding,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            username: username.into(),
            document_name: document_name.into(),
            encoding,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            ot: Arc::new(Mutex::new(None)),
            client_id: Arc::new(RwLock::new(None)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            server_url: server_url.into(),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect, wait for the document snapshot and join.
    ///
    /// Spawns background tasks for reading and writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let url = format!(
            "{}/{}",
            self.server_url.trim_end_matches('/'),
            self.document_name
        );
        let (ws_stream, _) = match tokio_tungstenite::connect_async(&url).await {
            Ok(connected) => connected,
            Err(e) => {
                log::warn!("Failed to connect to {url}: {e}");
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // The server always opens with the snapshot.
        let snapshot = loop {
            match ws_reader.next().await {
                Some(Ok(Message::Text(text))) => {
                    match ServerEvent::decode(text.as_str(), self.encoding)? {
                        ServerEvent::Doc(snapshot) => break snapshot,
                        ServerEvent::Error { message } => {
                            log::warn!("Server refused connection: {message}");
                            *self.state.write().await = ConnectionState::Disconnected;
                            return Err(ProtocolError::ConnectionClosed);
                        }
                        other => log::debug!("Ignoring '{}' before snapshot", other.name()),
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(_)) | None => {
                    *self.state.write().await = ConnectionState::Disconnected;
                    return Err(ProtocolError::ConnectionClosed);
                }
            }
        };
        *self.ot.lock().await = Some(OtClient::new(
            snapshot.document.clone(),
            snapshot.revision,
            self.encoding,
        ));

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if ws_writer.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });
        self.outgoing_tx = Some(out_tx.clone());

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;
        let _ = self.event_tx.send(SyncEvent::Snapshot(snapshot)).await;

        self.send(&ClientEvent::Join {
            username: self.username.clone(),
        })
        .await?;

        // Reader task: process incoming WebSocket messages
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let ot = self.ot.clone();
        let client_id = self.client_id.clone();
        let encoding = self.encoding;
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        let event = match ServerEvent::decode(text.as_str(), encoding) {
                            Ok(event) => event,
                            Err(e) => {
                                log::warn!("Undecodable frame from server: {e}");
                                continue;
                            }
                        };
                        match Self::handle_event(event, &ot, &client_id, &out_tx).await {
                            Ok(Some(evt)) => {
                                let _ = event_tx.send(evt).await;
                            }
                            Ok(None) => {}
                            Err(e) => {
                                log::error!("Client state diverged from server: {e}");
                                break;
                            }
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        Ok(())
    }

    async fn handle_event(
        event: ServerEvent,
        ot: &Mutex<Option<OtClient>>,
        client_id: &RwLock<Option<ClientId>>,
        out_tx: &mpsc::Sender<Message>,
    ) -> Result<Option<SyncEvent>, ProtocolError> {
        let mut guard = ot.lock().await;
        let ot = guard.as_mut().ok_or(ProtocolError::ConnectionClosed)?;

        let event = match event {
            ServerEvent::Registered(id) => {
                *client_id.write().await = Some(id);
                SyncEvent::Registered(id)
            }
            ServerEvent::Ok => {
                if let Some((revision, op)) = ot.acknowledge()? {
                    let frame = ClientEvent::Operation {
                        revision: revision as i64,
                        operation: op,
                    }
                    .encode()?;
                    out_tx
                        .send(Message::Text(frame.into()))
                        .await
                        .map_err(|_| ProtocolError::ConnectionClosed)?;
                }
                SyncEvent::Acknowledged {
                    revision: ot.revision(),
                }
            }
            ServerEvent::Operation {
                client_id,
                operation,
            } => {
                let applied = ot.apply_remote(&operation)?;
                let selection = operation.meta().map(|sel| ot.transform_selection(sel));
                SyncEvent::RemoteOperation {
                    client_id,
                    operation: applied,
                    selection,
                }
            }
            ServerEvent::Selection {
                client_id,
                selection,
            } => SyncEvent::RemoteSelection {
                client_id,
                selection: ot.transform_selection(&selection),
            },
            ServerEvent::Join {
                client_id,
                username,
            } => SyncEvent::PeerJoined {
                client_id,
                username,
            },
            ServerEvent::Quit(client_id) => SyncEvent::PeerLeft(client_id),
            ServerEvent::Error { message } => {
                log::warn!("Server rejected event: {message}");
                SyncEvent::Rejected(message)
            }
            ServerEvent::Doc(_) => return Ok(None),
        };
        Ok(Some(event))
    }

    /// Apply a local edit and send it (or buffer it behind the one in
    /// flight). A selection attached as meta travels with it.
    pub async fn submit(&self, op: Operation) -> Result<(), ProtocolError> {
        let mut guard = self.ot.lock().await;
        let ot = guard.as_mut().ok_or(ProtocolError::ConnectionClosed)?;
        if let Some((revision, op)) = ot.apply_local(op)? {
            self.send(&ClientEvent::Operation {
                revision: revision as i64,
                operation: op,
            })
            .await?;
        }
        Ok(())
    }

    /// Broadcast our cursor or selection.
    pub async fn update_selection(&self, selection: Selection) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::Selection(selection)).await
    }

    /// Send a close frame. The reader reports `Disconnected` when the server
    /// answers.
    pub async fn close(&self) -> Result<(), ProtocolError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ProtocolError::ConnectionClosed)?;
        tx.send(Message::Close(None))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    async fn send(&self, event: &ClientEvent) -> Result<(), ProtocolError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ProtocolError::ConnectionClosed)?;
        let frame = event.encode()?;
        tx.send(Message::Text(frame.into()))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Local copy of the document, once the snapshot has arrived.
    pub async fn document(&self) -> Option<String> {
        self.ot.lock().await.as_ref().map(|ot| ot.document().to_owned())
    }

    pub async fn revision(&self) -> Option<usize> {
        self.ot.lock().await.as_ref().map(OtClient::revision)
    }

    /// True when every local edit has been acknowledged.
    pub async fn is_synchronized(&self) -> bool {
        self.ot
            .lock()
            .await
            .as_ref()
            .is_some_and(OtClient::is_synchronized)
    }

    /// Id assigned by the server on join.
    pub async fn client_id(&self) -> Option<ClientId> {
        *self.client_id.read().await
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn document_name(&self) -> &str {
        &self.document_name
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub fn encoding(&self) -> TextEncoding {
        self.encoding
    }
}
