//! Per-room fan-out with backpressure.
//!
//! Every room is one [`BroadcastGroup`]: a tokio broadcast channel shared by
//! all connections in the room, the presence each connection announced, and
//! the relay's authoritative replica of the room's estimation state.
//!
//! Messages are encoded once and fanned out as `(sender, bytes)` so each
//! connection can skip its own messages without decoding them. A receiver
//! that falls more than `capacity` messages behind starts dropping.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use estimo_core::{Presence, PresencePatch, SharedEstimationState, SharedSnapshot, SharedStateError};
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{ProtocolError, SyncMessage};

/// An encoded message and the connection that sent it.
pub type Outbound = (Uuid, Arc<Vec<u8>>);

/// Why a room turned a Join away. The message is sent to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum JoinRejection {
    #[error("room is full")]
    RoomFull,
    #[error("connection id already in use")]
    DuplicateConnection,
}

/// A successful join: the room, the peer's receiver, and who was there.
pub type Admission = (Arc<BroadcastGroup>, broadcast::Receiver<Outbound>, Vec<(Uuid, Presence)>);

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Counters touched on the hot path without taking a lock.
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

/// A single room.
pub struct BroadcastGroup {
    room: String,
    sender: broadcast::Sender<Outbound>,
    /// Connection id → announced presence
    peers: RwLock<HashMap<Uuid, Presence>>,
    replica: RwLock<SharedEstimationState>,
    capacity: usize,
    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// `capacity` is how many messages each peer may buffer before lagging.
    pub fn new(room: impl Into<String>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            room: room.into(),
            sender,
            peers: RwLock::new(HashMap::new()),
            replica: RwLock::new(SharedEstimationState::new()),
            capacity,
            atomic_stats: AtomicBroadcastStats::new(),
        }
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    /// Add a peer without any capacity limit.
    pub async fn add_peer(&self, conn: Uuid, presence: Presence) -> broadcast::Receiver<Outbound> {
        let mut peers = self.peers.write().await;
        peers.insert(conn, presence);
        self.sender.subscribe()
    }

    /// Add a peer unless the room already holds `max_peers` or already has
    /// a peer under `conn`.
    ///
    /// On success returns the peer's receiver and the peers that were already
    /// present. The receiver is subscribed before the caller reads any state,
    /// so nothing broadcast after this call can be missed.
    pub async fn try_add_peer(
        &self,
        conn: Uuid,
        presence: Presence,
        max_peers: usize,
    ) -> Result<(broadcast::Receiver<Outbound>, Vec<(Uuid, Presence)>), JoinRejection> {
        let mut peers = self.peers.write().await;
        if peers.contains_key(&conn) {
            return Err(JoinRejection::DuplicateConnection);
        }
        if peers.len() >= max_peers {
            return Err(JoinRejection::RoomFull);
        }
        let existing = peers.iter().map(|(id, p)| (*id, p.clone())).collect();
        peers.insert(conn, presence);
        Ok((self.sender.subscribe(), existing))
    }

    pub async fn remove_peer(&self, conn: &Uuid) -> Option<Presence> {
        self.peers.write().await.remove(conn)
    }

    /// Merge a presence patch into a peer's stored presence.
    pub async fn patch_peer(&self, conn: &Uuid, patch: &PresencePatch) -> bool {
        match self.peers.write().await.get_mut(conn) {
            Some(presence) => presence.apply(patch),
            None => false,
        }
    }

    /// Encode once and send to every receiver. Filtering out the sender is
    /// the receiving side's job.
    pub fn broadcast(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let encoded = Arc::new(msg.encode()?);
        Ok(self.broadcast_raw(msg.peer_id, encoded))
    }

    /// Broadcast pre-encoded bytes.
    pub fn broadcast_raw(&self, sender: Uuid, encoded: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send((sender, encoded)).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record messages a lagging receiver lost.
    pub fn record_dropped(&self, n: u64) {
        self.atomic_stats.messages_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub async fn apply_update(&self, update: &[u8]) -> Result<(), SharedStateError> {
        self.replica.write().await.apply_remote(update)
    }

    /// Full state of the room's replica.
    pub async fn encode_state(&self) -> Vec<u8> {
        self.replica.read().await.encode_state()
    }

    pub async fn diff_since(&self, state_vector: &[u8]) -> Result<Vec<u8>, SharedStateError> {
        self.replica.read().await.diff_since(state_vector)
    }

    pub async fn snapshot(&self) -> SharedSnapshot {
        self.replica.read().await.snapshot()
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<(Uuid, Presence)> {
        self.peers
            .read()
            .await
            .iter()
            .map(|(id, p)| (*id, p.clone()))
            .collect()
    }

    pub async fn has_peer(&self, conn: &Uuid) -> bool {
        self.peers.read().await.contains_key(conn)
    }

    pub async fn stats(&self) -> BroadcastStats {
        let peers = self.peers.read().await;
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: peers.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Outbound> {
        self.sender.subscribe()
    }
}

/// Room registry: room token → broadcast group.
///
/// Rooms are created on first join and dropped with their state once the
/// last peer leaves. Joining and dropping both happen under the registry's
/// write lock.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<BroadcastGroup>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Find or open `room` and seat `conn` in it, all under the registry
    /// lock. A concurrent [`remove_if_empty`](Self::remove_if_empty) either
    /// sees the new peer or runs before the room is looked up, so a joiner
    /// never lands in a room that is no longer registered.
    pub async fn join(
        &self,
        room: &str,
        conn: Uuid,
        presence: Presence,
        max_peers: usize,
    ) -> Result<Admission, JoinRejection> {
        let mut rooms = self.rooms.write().await;
        let group = match rooms.get(room) {
            Some(group) => group.clone(),
            None => {
                log::info!("Opening room {room}");
                let group = Arc::new(BroadcastGroup::new(room, self.default_capacity));
                rooms.insert(room.to_string(), group.clone());
                group
            }
        };
        match group.try_add_peer(conn, presence, max_peers).await {
            Ok((rx, existing)) => Ok((group, rx, existing)),
            Err(rejection) => {
                if group.peer_count().await == 0 {
                    rooms.remove(room);
                }
                Err(rejection)
            }
        }
    }

    pub async fn get(&self, room: &str) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(room).cloned()
    }

    /// Drop a room if nobody is left in it.
    pub async fn remove_if_empty(&self, room: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(group) = rooms.get(room) {
            if group.peer_count().await == 0 {
                rooms.remove(room);
                log::info!("Room {room} closed (empty)");
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}
