//! WebSocket client for the relay.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect with a fresh
//!   connection id)
//! - Delta send/receive with a Lamport clock
//! - Presence patches, folded into the presence sent on the next Join
//! - Offline queue for deltas produced while disconnected
//!
//! ```text
//!  send_delta ──► out_tx ──► writer task ──► WebSocket ──► relay
//!                                                           │
//!  events() ◄── event_tx ◄── reader task ◄── WebSocket ◄────┘
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use estimo_core::{Presence, PresencePatch};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::error::CollabError;
use crate::protocol::{MessageType, SyncMessage};

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Relay base URL, e.g. `ws://127.0.0.1:9090`
    pub server_url: String,
    /// Maximum deltas held while offline
    pub offline_queue_capacity: usize,
    /// Buffered events before the reader waits for the application
    pub event_capacity: usize,
    /// Interval between heartbeat pings
    pub heartbeat_interval_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            offline_queue_capacity: 10_000,
            event_capacity: 256,
            heartbeat_interval_secs: 20,
        }
    }
}

impl ClientConfig {
    pub fn for_testing(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            offline_queue_capacity: 64,
            event_capacity: 64,
            heartbeat_interval_secs: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// Joined the room under a new connection id
    Connected { conn_id: Uuid },
    Disconnected,
    /// Full or partial state from the relay
    StateSynced(Vec<u8>),
    RemoteDelta {
        peer_id: Uuid,
        clock: u64,
        update: Vec<u8>,
    },
    PeerJoined {
        peer_id: Uuid,
        presence: Presence,
    },
    PresenceUpdated {
        peer_id: Uuid,
        patch: PresencePatch,
    },
    PeerLeft(Uuid),
    /// Everyone else in the room, replacing what was known
    Roster(Vec<(Uuid, Presence)>),
    /// The relay refused the Join
    Rejected(String),
}

/// Deltas produced while disconnected, replayed on reconnection.
pub struct OfflineQueue {
    queue: VecDeque<QueuedDelta>,
    max_size: usize,
}

#[derive(Debug, Clone)]
struct QueuedDelta {
    clock: u64,
    payload: Vec<u8>,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue a delta; false when full.
    pub fn enqueue(&mut self, clock: u64, payload: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(QueuedDelta { clock, payload });
        true
    }

    /// Drain all queued deltas in the order they were produced.
    pub fn drain(&mut self) -> Vec<(u64, Vec<u8>)> {
        self.queue.drain(..).map(|d| (d.clock, d.payload)).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|d| d.payload.len()).sum()
    }
}

/// The sync client for one room.
pub struct SyncClient {
    config: ClientConfig,
    room: String,

    /// Connection id of the current (or last) connection
    conn_id: Uuid,

    /// Presence announced on every Join
    presence: Arc<RwLock<Presence>>,

    state: Arc<RwLock<ConnectionState>>,

    /// Lamport clock
    clock: Arc<RwLock<u64>>,

    offline_queue: Arc<Mutex<OfflineQueue>>,

    /// Channel to the writer task
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,

    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    event_tx: mpsc::Sender<SyncEvent>,

    tasks: Vec<JoinHandle<()>>,
}

impl SyncClient {
    pub fn new(config: ClientConfig, room: impl Into<String>, presence: Presence) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity);
        let offline_queue = OfflineQueue::new(config.offline_queue_capacity);
        Self {
            config,
            room: room.into(),
            conn_id: Uuid::new_v4(),
            presence: Arc::new(RwLock::new(presence)),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            clock: Arc::new(RwLock::new(0)),
            offline_queue: Arc::new(Mutex::new(offline_queue)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            tasks: Vec::new(),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    fn url(&self) -> String {
        format!("{}/{}", self.config.server_url.trim_end_matches('/'), self.room)
    }

    /// Connect and join the room.
    ///
    /// Spawns reader, writer and heartbeat tasks. Deltas queued while
    /// offline are replayed right after the Join.
    pub async fn connect(&mut self) -> Result<(), CollabError> {
        if *self.state.read().await == ConnectionState::Connected {
            return Ok(());
        }
        self.stop_tasks();
        *self.state.write().await = ConnectionState::Connecting;

        let url = self.url();
        let ws_stream = match tokio_tungstenite::connect_async(&url).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(CollabError::Connect {
                    url,
                    reason: e.to_string(),
                });
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        self.conn_id = Uuid::new_v4();
        let conn_id = self.conn_id;

        // Writer task: forward the outgoing channel to the WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        self.tasks.push(tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        }));

        let join = SyncMessage::join(conn_id, &self.room, &*self.presence.read().await)?;
        out_tx
            .send(join.encode()?)
            .await
            .map_err(|_| crate::protocol::ProtocolError::ConnectionClosed)?;

        {
            let mut queue = self.offline_queue.lock().await;
            let queued = queue.drain();
            if !queued.is_empty() {
                log::info!("Replaying {} queued deltas", queued.len());
            }
            for (clock, payload) in queued {
                let msg = SyncMessage::delta(conn_id, &self.room, clock, payload);
                let _ = out_tx.send(msg.encode()?).await;
            }
        }

        // Heartbeat task
        let heartbeat_tx = out_tx.clone();
        let interval = Duration::from_secs(self.config.heartbeat_interval_secs.max(1));
        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Ok(ping) = SyncMessage::ping(conn_id).encode() else {
                    return;
                };
                if heartbeat_tx.send(ping).await.is_err() {
                    return;
                }
            }
        }));

        self.outgoing_tx = Some(out_tx);
        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected { conn_id }).await;
        log::info!("Connected to {url} as {conn_id}");

        // Reader task
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let clock = self.clock.clone();
        self.tasks.push(tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        let sync_msg = match SyncMessage::decode(&bytes) {
                            Ok(m) => m,
                            Err(e) => {
                                log::warn!("Failed to decode message from relay: {e}");
                                continue;
                            }
                        };
                        if sync_msg.peer_id == conn_id {
                            continue;
                        }
                        {
                            let mut c = clock.write().await;
                            *c = (*c).max(sync_msg.clock);
                        }
                        let Some(event) = Self::to_event(sync_msg) else {
                            continue;
                        };
                        let rejected = matches!(event, SyncEvent::Rejected(_));
                        if event_tx.send(event).await.is_err() || rejected {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
            log::info!("Connection {conn_id} closed");
        }));

        Ok(())
    }

    fn to_event(msg: SyncMessage) -> Option<SyncEvent> {
        match msg.msg_type {
            MessageType::Delta => Some(SyncEvent::RemoteDelta {
                peer_id: msg.peer_id,
                clock: msg.clock,
                update: msg.payload,
            }),
            MessageType::SyncStep2 => Some(SyncEvent::StateSynced(msg.payload)),
            MessageType::Join => match msg.presence_state() {
                Ok(presence) => Some(SyncEvent::PeerJoined {
                    peer_id: msg.peer_id,
                    presence,
                }),
                Err(e) => {
                    log::warn!("Join from {} without presence: {e}", msg.peer_id);
                    None
                }
            },
            MessageType::Presence => msg.presence_patch().ok().map(|patch| SyncEvent::PresenceUpdated {
                peer_id: msg.peer_id,
                patch,
            }),
            MessageType::PeerLeft => Some(SyncEvent::PeerLeft(msg.peer_id)),
            MessageType::Roster => match msg.roster_entries() {
                Ok(peers) => Some(SyncEvent::Roster(peers)),
                Err(e) => {
                    log::warn!("Unreadable roster from relay: {e}");
                    None
                }
            },
            MessageType::Rejected => Some(SyncEvent::Rejected(msg.reason())),
            MessageType::Pong => None,
            other => {
                log::debug!("Unhandled message type from relay: {other:?}");
                None
            }
        }
    }

    fn stop_tasks(&mut self) {
        self.outgoing_tx = None;
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    /// Leave the room and close the connection.
    pub async fn disconnect(&mut self) {
        let was_connected = *self.state.read().await == ConnectionState::Connected;
        // Dropping the sender lets the writer send a Close frame
        self.outgoing_tx = None;
        for task in self.tasks.drain(..) {
            if !task.is_finished() {
                task.abort();
            }
        }
        *self.state.write().await = ConnectionState::Disconnected;
        if was_connected {
            let _ = self.event_tx.send(SyncEvent::Disconnected).await;
        }
    }

    async fn tick(&self) -> u64 {
        let mut clock = self.clock.write().await;
        *clock += 1;
        *clock
    }

    /// Send an update to the relay, or queue it while offline.
    pub async fn send_delta(&self, update: Vec<u8>) -> Result<(), CollabError> {
        let clock = self.tick().await;

        if *self.state.read().await == ConnectionState::Connected {
            if let Some(tx) = &self.outgoing_tx {
                let msg = SyncMessage::delta(self.conn_id, &self.room, clock, update.clone());
                if tx.send(msg.encode()?).await.is_ok() {
                    return Ok(());
                }
            }
        }

        let mut queue = self.offline_queue.lock().await;
        if !queue.enqueue(clock, update) {
            return Err(CollabError::QueueFull);
        }
        Ok(())
    }

    /// Merge a presence patch. Sent right away when connected; otherwise it
    /// only reaches the relay through the next Join.
    pub async fn send_presence(&self, patch: &PresencePatch) -> Result<(), CollabError> {
        self.presence.write().await.apply(patch);

        if *self.state.read().await != ConnectionState::Connected {
            return Ok(());
        }
        let clock = self.tick().await;
        let msg = SyncMessage::presence(self.conn_id, &self.room, clock, patch)?;
        if let Some(tx) = &self.outgoing_tx {
            let _ = tx.send(msg.encode()?).await;
        }
        Ok(())
    }

    /// Ask the relay for everything missing since `state_vector`.
    pub async fn request_sync(&self, state_vector: Vec<u8>) -> Result<(), CollabError> {
        let msg = SyncMessage::sync_step1(self.conn_id, &self.room, state_vector);
        if let Some(tx) = &self.outgoing_tx {
            let _ = tx.send(msg.encode()?).await;
        }
        Ok(())
    }

    pub async fn send_ping(&self) -> Result<(), CollabError> {
        if let Some(tx) = &self.outgoing_tx {
            let _ = tx.send(SyncMessage::ping(self.conn_id).encode()?).await;
        }
        Ok(())
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn presence(&self) -> Presence {
        self.presence.read().await.clone()
    }

    pub fn conn_id(&self) -> Uuid {
        self.conn_id
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn server_url(&self) -> &str {
        &self.config.server_url
    }

    pub async fn clock(&self) -> u64 {
        *self.clock.read().await
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.offline_queue.lock().await.len()
    }

    /// Pretend to be connected, with outgoing messages landing in the
    /// returned receiver instead of a socket.
    #[cfg(test)]
    pub(crate) async fn attach_wire(&mut self, capacity: usize) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel(capacity);
        self.outgoing_tx = Some(tx);
        *self.state.write().await = ConnectionState::Connected;
        rx
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.stop_tasks();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> SyncClient {
        SyncClient::new(
            ClientConfig::for_testing("ws://127.0.0.1:9"),
            "room",
            Presence::generated("Fox-42"),
        )
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = client();
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert_eq!(client.clock().await, 0);
        assert_eq!(client.offline_queue_len().await, 0);
        assert_eq!(client.room(), "room");
        assert_eq!(client.url(), "ws://127.0.0.1:9/room");
    }

    #[tokio::test]
    async fn test_send_delta_offline_queues() {
        let client = client();
        client.send_delta(vec![1, 2, 3]).await.unwrap();
        client.send_delta(vec![4, 5, 6]).await.unwrap();

        assert_eq!(client.offline_queue_len().await, 2);
        assert_eq!(client.clock().await, 2);
    }

    #[tokio::test]
    async fn test_offline_queue_overflow_is_error() {
        let mut config = ClientConfig::for_testing("ws://127.0.0.1:9");
        config.offline_queue_capacity = 1;
        let client = SyncClient::new(config, "room", Presence::generated("Fox-42"));

        client.send_delta(vec![1]).await.unwrap();
        assert_eq!(client.send_delta(vec![2]).await, Err(CollabError::QueueFull));
    }

    #[tokio::test]
    async fn test_presence_patch_offline_is_kept_for_join() {
        let client = client();
        client.send_presence(&PresencePatch::username("Alice")).await.unwrap();
        assert_eq!(client.presence().await.username, "Alice");
    }

    #[tokio::test]
    async fn test_connect_failure_reports_url() {
        let mut client = client();
        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, CollabError::Connect { ref url, .. } if url == "ws://127.0.0.1:9/room"));
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }

    #[test]
    fn test_offline_queue() {
        let mut queue = OfflineQueue::new(100);
        assert!(queue.is_empty());

        queue.enqueue(1, vec![1, 2, 3]);
        queue.enqueue(2, vec![4, 5, 6, 7]);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.total_bytes(), 7);

        let drained = queue.drain();
        assert_eq!(drained[0], (1, vec![1, 2, 3]));
        assert_eq!(drained[1].0, 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_offline_queue_capacity_and_clear() {
        let mut queue = OfflineQueue::new(2);
        assert!(queue.enqueue(1, vec![1]));
        assert!(queue.enqueue(2, vec![2]));
        assert!(!queue.enqueue(3, vec![3]));
        queue.clear();
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_take_event_rx() {
        let mut client = client();
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }

    #[test]
    fn test_roster_maps_to_event() {
        let peers = vec![(Uuid::new_v4(), Presence::generated("Owl-07"))];
        let msg = SyncMessage::roster("room", &peers).unwrap();
        assert_eq!(SyncClient::to_event(msg), Some(SyncEvent::Roster(peers)));
    }

    #[tokio::test]
    async fn test_presence_sent_when_connected() {
        let mut client = client();
        let mut wire = client.attach_wire(4).await;
        client.send_presence(&PresencePatch::spectator(true)).await.unwrap();

        let sent = SyncMessage::decode(&wire.recv().await.unwrap()).unwrap();
        assert_eq!(sent.peer_id, client.conn_id());
        assert_eq!(sent.presence_patch().unwrap(), PresencePatch::spectator(true));
    }

    #[test]
    fn test_rejected_maps_to_event() {
        let msg = SyncMessage::rejected(Uuid::nil(), "room", "room is full");
        assert_eq!(
            SyncClient::to_event(msg),
            Some(SyncEvent::Rejected("room is full".into()))
        );
    }
}
