//! Fan-out of committed events to every connection in a room.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers.
//! Each connection gets an independent receiver that buffers up to `capacity`
//! events; a receiver that falls further behind than that is lagging and is
//! disconnected by its connection task.
//!
//! Acknowledgements ride on the same channel as everything else, so a
//! connection sees its own `ok` in exactly the order the room committed it
//! relative to other clients' operations.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use scribe_core::ClientId;
use tokio::sync::{broadcast, RwLock};

/// What the originating connection does with an [`Outbound`] event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Echo {
    /// The origin already got its reply directly.
    Skip,
    /// The origin receives `ok` in place of the frame.
    Acknowledge,
}

/// A pre-encoded frame for every connection in the room.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub origin: ClientId,
    pub frame: String,
    pub echo: Echo,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Atomic broadcast stats, lock-free on the hot path.
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

/// The broadcast channel of a single document room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Outbound>>,

    /// Connections subscribed to this room
    peers: RwLock<HashSet<ClientId>>,

    /// Events buffered per receiver
    capacity: usize,

    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// Create a new broadcast group with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: RwLock::new(HashSet::new()),
            capacity,
            stats: AtomicBroadcastStats::new(),
        }
    }

    /// Add a peer and return its receiver.
    pub async fn add_peer(&self, client_id: ClientId) -> broadcast::Receiver<Arc<Outbound>> {
        let mut peers = self.peers.write().await;
        peers.insert(client_id);
        self.sender.subscribe()
    }

    /// Returns whether the peer was present.
    pub async fn remove_peer(&self, client_id: &ClientId) -> bool {
        self.peers.write().await.remove(client_id)
    }

    /// Send to every subscriber, returning how many there were.
    pub fn broadcast(&self, outbound: Outbound) -> usize {
        let count = self.sender.send(Arc::new(outbound)).unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record events a lagging receiver never saw.
    pub fn record_dropped(&self, n: u64) {
        self.stats.messages_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn has_peer(&self, client_id: &ClientId) -> bool {
        self.peers.read().await.contains(client_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        let peers = self.peers.read().await;
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: peers.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
