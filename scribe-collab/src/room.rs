//! Document rooms: one actor task per document.
//!
//! ```text
//!  connection ─┐                    ┌────────────── Room task ──────────────┐
//!  connection ─┼─ RoomCommand ─► mpsc ─► Session::add_operation ─► broadcast ─┼─► connections
//!  connection ─┘                    └────────────────────────────────────────┘
//! ```
//!
//! The room task is the only owner of its [`Session`]; commands are handled
//! strictly one at a time, which makes every commit atomic with respect to
//! every other command on the same document.

use std::collections::HashMap;
use std::sync::Arc;

use scribe_core::{ClientId, Operation, OtError, Selection, Session, TextEncoding};
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};

use crate::broadcast::{BroadcastGroup, BroadcastStats, Echo, Outbound};
use crate::protocol::{DocSnapshot, ProtocolError, ServerEvent};

/// Commands queued per room
const COMMAND_QUEUE: usize = 1024;

/// Settings every new room is created with.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    pub broadcast_capacity: usize,
    pub max_peers: usize,
    pub encoding: TextEncoding,
    pub initial_document: String,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 256,
            max_peers: 100,
            encoding: TextEncoding::default(),
            initial_document: String::new(),
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T, ProtocolError>>;

enum RoomCommand {
    Connect {
        client_id: ClientId,
        reply: Reply<(DocSnapshot, broadcast::Receiver<Arc<Outbound>>)>,
    },
    Join {
        client_id: ClientId,
        username: String,
        reply: Reply<()>,
    },
    Operation {
        client_id: ClientId,
        revision: i64,
        operation: Operation,
        reply: Reply<usize>,
    },
    Selection {
        client_id: ClientId,
        selection: Selection,
        reply: Reply<()>,
    },
    Disconnect {
        client_id: ClientId,
    },
    Snapshot {
        reply: oneshot::Sender<DocSnapshot>,
    },
}

/// Cheap, cloneable handle to a running room.
#[derive(Clone)]
pub struct DocumentHandle {
    name: Arc<str>,
    commands: mpsc::Sender<RoomCommand>,
    broadcast: Arc<BroadcastGroup>,
}

impl DocumentHandle {
    /// Spawn the room task for `name`.
    pub fn spawn(name: &str, config: &RoomConfig) -> Self {
        let (commands, rx) = mpsc::channel(COMMAND_QUEUE);
        let broadcast = Arc::new(BroadcastGroup::new(config.broadcast_capacity));
        let room = Room {
            name: name.into(),
            session: Session::with_encoding(config.initial_document.clone(), config.encoding),
            broadcast: broadcast.clone(),
            max_peers: config.max_peers,
        };
        tokio::spawn(room.run(rx));
        log::info!("Room '{name}' opened");

        Self {
            name: name.into(),
            commands,
            broadcast,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True once the room task has stopped.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Subscribe `client_id` and return the document as of the subscription.
    ///
    /// Every event committed after the snapshot is delivered on the receiver.
    pub async fn connect(
        &self,
        client_id: ClientId,
    ) -> Result<(DocSnapshot, broadcast::Receiver<Arc<Outbound>>), ProtocolError> {
        self.request(|reply| RoomCommand::Connect { client_id, reply })
            .await?
    }

    pub async fn join(&self, client_id: ClientId, username: String) -> Result<(), ProtocolError> {
        self.request(|reply| RoomCommand::Join {
            client_id,
            username,
            reply,
        })
        .await?
    }

    /// Commit `operation`, written against `revision`. Returns the new
    /// revision; the acknowledgement itself arrives on the broadcast channel.
    pub async fn submit(
        &self,
        client_id: ClientId,
        revision: i64,
        operation: Operation,
    ) -> Result<usize, ProtocolError> {
        self.request(|reply| RoomCommand::Operation {
            client_id,
            revision,
            operation,
            reply,
        })
        .await?
    }

    pub async fn select(
        &self,
        client_id: ClientId,
        selection: Selection,
    ) -> Result<(), ProtocolError> {
        self.request(|reply| RoomCommand::Selection {
            client_id,
            selection,
            reply,
        })
        .await?
    }

    pub async fn disconnect(&self, client_id: ClientId) {
        if self
            .commands
            .send(RoomCommand::Disconnect { client_id })
            .await
            .is_err()
        {
            log::warn!("Room '{}' gone before {client_id} disconnected", self.name);
        }
    }

    pub async fn snapshot(&self) -> Result<DocSnapshot, ProtocolError> {
        self.request(|reply| RoomCommand::Snapshot { reply }).await
    }

    pub async fn stats(&self) -> BroadcastStats {
        self.broadcast.stats().await
    }

    /// Lagging receivers report what they missed here.
    pub fn record_dropped(&self, n: u64) {
        self.broadcast.record_dropped(n);
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> RoomCommand,
    ) -> Result<T, ProtocolError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| ProtocolError::RoomUnavailable)?;
        rx.await.map_err(|_| ProtocolError::RoomUnavailable)
    }
}

/// State owned by a room task.
struct Room {
    name: String,
    session: Session,
    broadcast: Arc<BroadcastGroup>,
    max_peers: usize,
}

impl Room {
    async fn run(mut self, mut commands: mpsc::Receiver<RoomCommand>) {
        while let Some(command) = commands.recv().await {
            self.handle(command).await;
        }
        log::info!("Room '{}' closed", self.name);
    }

    async fn handle(&mut self, command: RoomCommand) {
        // A dropped reply means the connection went away mid-request.
        match command {
            RoomCommand::Connect { client_id, reply } => {
                let _ = reply.send(self.connect(client_id).await);
            }
            RoomCommand::Join {
                client_id,
                username,
                reply,
            } => {
                let _ = reply.send(self.join(client_id, username));
            }
            RoomCommand::Operation {
                client_id,
                revision,
                operation,
                reply,
            } => {
                let _ = reply.send(self.submit(client_id, revision, operation));
            }
            RoomCommand::Selection {
                client_id,
                selection,
                reply,
            } => {
                let _ = reply.send(self.select(client_id, selection));
            }
            RoomCommand::Disconnect { client_id } => self.disconnect(client_id).await,
            RoomCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn snapshot(&self) -> DocSnapshot {
        DocSnapshot {
            document: self.session.document().to_owned(),
            revision: self.session.revision(),
            clients: self.session.clients().clone(),
        }
    }

    async fn connect(
        &mut self,
        client_id: ClientId,
    ) -> Result<(DocSnapshot, broadcast::Receiver<Arc<Outbound>>), ProtocolError> {
        if self.broadcast.peer_count().await >= self.max_peers {
            log::warn!("Room '{}' full, refusing {client_id}", self.name);
            return Err(ProtocolError::RoomFull(self.max_peers));
        }
        let rx = self.broadcast.add_peer(client_id).await;
        log::debug!("{client_id} connected to '{}'", self.name);
        Ok((self.snapshot(), rx))
    }

    fn join(&mut self, client_id: ClientId, username: String) -> Result<(), ProtocolError> {
        if self.session.client(&client_id).is_some() {
            self.session.set_name(&client_id, username);
            return Ok(());
        }

        self.session.add_client(client_id);
        self.session.set_name(&client_id, username.clone());
        log::info!("{username} ({client_id}) joined '{}'", self.name);

        let frame = ServerEvent::Join {
            client_id,
            username,
        }
        .encode()?;
        self.publish(client_id, frame, Echo::Skip);
        Ok(())
    }

    fn submit(
        &mut self,
        client_id: ClientId,
        revision: i64,
        operation: Operation,
    ) -> Result<usize, ProtocolError> {
        if self.session.client(&client_id).is_none() {
            return Err(ProtocolError::NotJoined("op"));
        }
        let current = self.session.revision();
        let revision = usize::try_from(revision)
            .map_err(|_| OtError::InvalidRevision { revision, current })?;

        let committed = self.session.add_operation(revision, operation)?;
        if let Some(selection) = committed.meta() {
            self.session.set_selection(&client_id, selection.clone());
        }
        log::debug!(
            "'{}' r{} from {client_id}: {committed}",
            self.name,
            self.session.revision()
        );

        let frame = ServerEvent::Operation {
            client_id,
            operation: committed,
        }
        .encode()?;
        self.publish(client_id, frame, Echo::Acknowledge);
        Ok(self.session.revision())
    }

    fn select(&mut self, client_id: ClientId, selection: Selection) -> Result<(), ProtocolError> {
        if self.session.client(&client_id).is_none() {
            return Err(ProtocolError::NotJoined("sel"));
        }
        log::trace!("'{}' selection from {client_id}", self.name);
        self.session.set_selection(&client_id, selection.clone());

        let frame = ServerEvent::Selection {
            client_id,
            selection,
        }
        .encode()?;
        self.publish(client_id, frame, Echo::Skip);
        Ok(())
    }

    async fn disconnect(&mut self, client_id: ClientId) {
        self.broadcast.remove_peer(&client_id).await;
        if let Some(client) = self.session.remove_client(&client_id) {
            log::info!("{} ({client_id}) left '{}'", client.name, self.name);
            match ServerEvent::Quit(client_id).encode() {
                Ok(frame) => self.publish(client_id, frame, Echo::Skip),
                Err(e) => log::error!("Failed to encode quit for {client_id}: {e}"),
            }
        }
    }

    fn publish(&self, origin: ClientId, frame: String, echo: Echo) {
        self.broadcast.broadcast(Outbound {
            origin,
            frame,
            echo,
        });
    }
}

/// Maps document names to rooms, creating them on first use.
///
/// Rooms live for as long as the manager.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, DocumentHandle>>,
    config: RoomConfig,
}

impl RoomManager {
    pub fn new(config: RoomConfig) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Get or create the room for `name`. A room whose task has stopped is
    /// replaced.
    pub async fn get_or_create(&self, name: &str) -> DocumentHandle {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(name).filter(|room| !room.is_closed()) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(name) {
            if !room.is_closed() {
                return room.clone();
            }
            log::warn!("Room '{name}' stopped, reopening");
        }

        let room = DocumentHandle::spawn(name, &self.config);
        rooms.insert(name.to_owned(), room.clone());
        room
    }

    pub async fn get(&self, name: &str) -> Option<DocumentHandle> {
        self.rooms.read().await.get(name).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_documents(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }

    pub fn config(&self) -> &RoomConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scribe_core::Range;
    use uuid::Uuid;

    fn op(build: impl FnOnce(&mut Operation) -> &mut Operation) -> Operation {
        let mut op = Operation::new();
        build(&mut op);
        op
    }

    fn room(initial: &str) -> DocumentHandle {
        DocumentHandle::spawn(
            "test",
            &RoomConfig {
                initial_document: initial.to_owned(),
                ..RoomConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn test_connect_returns_snapshot() {
        let handle = room("hello");
        let (snapshot, _rx) = handle.connect(Uuid::new_v4()).await.unwrap();
        assert_eq!(snapshot.document, "hello");
        assert_eq!(snapshot.revision, 0);
        assert!(snapshot.clients.is_empty());
        assert_eq!(handle.stats().await.active_peers, 1);
    }

    #[tokio::test]
    async fn test_join_broadcasts_to_others() {
        let handle = room("");
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let (_, _alice_rx) = handle.connect(alice).await.unwrap();
        let (_, mut bob_rx) = handle.connect(bob).await.unwrap();

        handle.join(alice, "alice".into()).await.unwrap();

        let event = bob_rx.recv().await.unwrap();
        assert_eq!(event.origin, alice);
        assert_eq!(event.echo, Echo::Skip);
        assert_eq!(
            ServerEvent::decode(&event.frame, TextEncoding::Utf8).unwrap(),
            ServerEvent::Join {
                client_id: alice,
                username: "alice".into()
            }
        );

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.clients[&alice].name, "alice");
    }

    #[tokio::test]
    async fn test_submit_commits_and_acknowledges() {
        let handle = room("I love you.");
        let alice = Uuid::new_v4();
        let (_, mut rx) = handle.connect(alice).await.unwrap();
        handle.join(alice, "alice".into()).await.unwrap();
        let _join = rx.recv().await.unwrap();

        let revision = handle
            .submit(alice, 0, op(|o| o.delete(1).insert("She").retain(10)))
            .await
            .unwrap();
        assert_eq!(revision, 1);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.origin, alice);
        assert_eq!(event.echo, Echo::Acknowledge);

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.document, "She love you.");
        assert_eq!(snapshot.revision, 1);
    }

    #[tokio::test]
    async fn test_submit_rebases_stale_operation() {
        let handle = room("I love you.");
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let (_, _rx_a) = handle.connect(alice).await.unwrap();
        let (_, mut rx_b) = handle.connect(bob).await.unwrap();
        handle.join(alice, "alice".into()).await.unwrap();
        handle.join(bob, "bob".into()).await.unwrap();

        handle
            .submit(alice, 0, op(|o| o.delete(1).insert("She").retain(10)))
            .await
            .unwrap();
        handle
            .submit(bob, 0, op(|o| o.retain(2).insert("really ").retain(9)))
            .await
            .unwrap();

        // join(alice), join(bob), op(alice), then bob's own ack.
        let _ = rx_b.recv().await.unwrap();
        let _ = rx_b.recv().await.unwrap();
        let from_alice = rx_b.recv().await.unwrap();
        assert_eq!(from_alice.origin, alice);
        let own = rx_b.recv().await.unwrap();
        assert_eq!(own.origin, bob);
        assert_eq!(own.echo, Echo::Acknowledge);

        assert_eq!(
            handle.snapshot().await.unwrap().document,
            "She really love you."
        );
    }

    #[tokio::test]
    async fn test_submit_errors_leave_document_unchanged() {
        let handle = room("ab");
        let alice = Uuid::new_v4();
        let (_, _rx) = handle.connect(alice).await.unwrap();

        let err = handle
            .submit(alice, 0, op(|o| o.retain(2)))
            .await
            .unwrap_err();
        assert_eq!(err, ProtocolError::NotJoined("op"));

        handle.join(alice, "alice".into()).await.unwrap();

        let err = handle
            .submit(alice, -1, op(|o| o.retain(2)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Ot(OtError::InvalidRevision { revision: -1, current: 0 })
        ));

        let err = handle
            .submit(alice, 5, op(|o| o.retain(2)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Ot(OtError::InvalidRevision { revision: 5, .. })
        ));

        let err = handle
            .submit(alice, 0, op(|o| o.retain(3)))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Ot(OtError::BaseLengthMismatch { .. })));

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.document, "ab");
        assert_eq!(snapshot.revision, 0);
    }

    #[tokio::test]
    async fn test_selection_updates_registry_only() {
        let handle = room("hello");
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let (_, _rx_a) = handle.connect(alice).await.unwrap();
        let (_, mut rx_b) = handle.connect(bob).await.unwrap();

        let selection = Selection::new(vec![Range::new(1, 4)]);
        assert_eq!(
            handle.select(alice, selection.clone()).await.unwrap_err(),
            ProtocolError::NotJoined("sel")
        );

        handle.join(alice, "alice".into()).await.unwrap();
        handle.select(alice, selection.clone()).await.unwrap();

        let _join = rx_b.recv().await.unwrap();
        let event = rx_b.recv().await.unwrap();
        assert_eq!(
            ServerEvent::decode(&event.frame, TextEncoding::Utf8).unwrap(),
            ServerEvent::Selection {
                client_id: alice,
                selection: selection.clone()
            }
        );

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.clients[&alice].selection, selection);
        assert_eq!(snapshot.revision, 0);
        assert_eq!(snapshot.document, "hello");
    }

    #[tokio::test]
    async fn test_operation_meta_updates_selection() {
        let handle = room("abc");
        let alice = Uuid::new_v4();
        let (_, _rx) = handle.connect(alice).await.unwrap();
        handle.join(alice, "alice".into()).await.unwrap();

        let edit = op(|o| o.retain(3).insert("d"))
            .with_meta(Selection::new(vec![Range::new(4, 4)]));
        handle.submit(alice, 0, edit).await.unwrap();

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(
            snapshot.clients[&alice].selection,
            Selection::new(vec![Range::new(4, 4)])
        );
    }

    #[tokio::test]
    async fn test_disconnect_broadcasts_quit_for_joined_clients() {
        let handle = room("");
        let (alice, bob, carol) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let (_, _rx_a) = handle.connect(alice).await.unwrap();
        let (_, _rx_c) = handle.connect(carol).await.unwrap();
        let (_, mut rx_b) = handle.connect(bob).await.unwrap();
        handle.join(alice, "alice".into()).await.unwrap();

        // Never joined: no quit.
        handle.disconnect(carol).await;
        handle.disconnect(alice).await;

        let _join = rx_b.recv().await.unwrap();
        let quit = rx_b.recv().await.unwrap();
        assert_eq!(
            ServerEvent::decode(&quit.frame, TextEncoding::Utf8).unwrap(),
            ServerEvent::Quit(alice)
        );

        let snapshot = handle.snapshot().await.unwrap();
        assert!(snapshot.clients.is_empty());
        assert_eq!(handle.stats().await.active_peers, 1);
    }

    #[tokio::test]
    async fn test_room_full() {
        let handle = DocumentHandle::spawn(
            "small",
            &RoomConfig {
                max_peers: 1,
                ..RoomConfig::default()
            },
        );
        let (_, _rx) = handle.connect(Uuid::new_v4()).await.unwrap();
        let err = handle.connect(Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err, ProtocolError::RoomFull(1));
    }

    #[tokio::test]
    async fn test_room_manager_get_or_create() {
        let manager = RoomManager::new(RoomConfig::default());

        let room1 = manager.get_or_create("notes").await;
        let room2 = manager.get_or_create("notes").await;
        assert_eq!(room1.name(), room2.name());
        assert_eq!(manager.room_count().await, 1);

        // Same actor behind both handles.
        let alice = Uuid::new_v4();
        let (_, _rx) = room1.connect(alice).await.unwrap();
        assert_eq!(room2.stats().await.active_peers, 1);
    }

    #[tokio::test]
    async fn test_room_manager_multiple_docs() {
        let manager = RoomManager::new(RoomConfig {
            initial_document: "seed".into(),
            ..RoomConfig::default()
        });

        let _a = manager.get_or_create("a").await;
        let _b = manager.get_or_create("b").await;
        assert_eq!(manager.room_count().await, 2);

        let docs = manager.active_documents().await;
        assert!(docs.contains(&"a".to_string()));
        assert!(docs.contains(&"b".to_string()));
        assert!(manager.get("c").await.is_none());

        let snapshot = manager.get("a").await.unwrap().snapshot().await.unwrap();
        assert_eq!(snapshot.document, "seed");
    }

    #[tokio::test]
    async fn test_room_manager_replaces_stopped_room() {
        let manager = RoomManager::new(RoomConfig {
            initial_document: "fresh".into(),
            ..RoomConfig::default()
        });

        let (commands, rx) = mpsc::channel(1);
        drop(rx);
        let stopped = DocumentHandle {
            name: "notes".into(),
            commands,
            broadcast: Arc::new(BroadcastGroup::new(4)),
        };
        assert!(stopped.is_closed());
        manager
            .rooms
            .write()
            .await
            .insert("notes".to_owned(), stopped);

        let room = manager.get_or_create("notes").await;
        assert!(!room.is_closed());
        assert_eq!(room.snapshot().await.unwrap().document, "fresh");
        assert!(!manager.get("notes").await.unwrap().is_closed());
        assert_eq!(manager.room_count().await, 1);
    }

    #[tokio::test]
    async fn test_far_out_selection_keeps_room_alive() {
        let handle = room("hi");
        let alice = Uuid::new_v4();
        let (_, _rx) = handle.connect(alice).await.unwrap();
        handle.join(alice, "alice".into()).await.unwrap();
        handle
            .submit(alice, 0, op(|o| o.insert("> ").retain(2)))
            .await
            .unwrap();

        let edit = op(|o| o.retain(2)).with_meta(Selection::new(vec![Range::new(usize::MAX, 0)]));
        handle.submit(alice, 0, edit).await.unwrap();

        assert!(!handle.is_closed());
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.document, "> hi");
        assert_eq!(snapshot.revision, 2);
    }
}
