//! WebSocket relay with room-based routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Room ("3f9a1c07b2") ── replica (yrs) ── BroadcastGroup
//! Client B ──┘                                               │
//!                                             ┌──────────────┼──────────────┐
//!                                             ▼              ▼              ▼
//!                                          Client A       Client B       Client C
//! ```
//!
//! Each room keeps:
//! - an authoritative replica of the estimation state, so a newcomer gets
//!   everything in one SyncStep2
//! - the presence every connection announced, sent to newcomers (and to
//!   peers that fell behind) as one Roster
//! - a `BroadcastGroup` for fan-out
//!
//! Room state lives only while somebody is connected. The relay never
//! interprets estimates; it applies and forwards yrs updates verbatim.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, Outbound, RoomManager};
use crate::protocol::{MessageType, SyncMessage};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type ConnResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Relay configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum peers per room; further joins are rejected
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Expected client heartbeat; a connection silent for three intervals
    /// is dropped
    pub heartbeat_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
        }
    }
}

impl ServerConfig {
    /// Ephemeral port, small rooms, short heartbeat.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            max_peers_per_room: 8,
            broadcast_capacity: 64,
            heartbeat_interval_secs: 5,
        }
    }

    fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1) * 3)
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub rejected_joins: u64,
}

/// The relay server. Cheap to clone; clones share rooms and stats.
#[derive(Clone)]
pub struct RelayServer {
    config: ServerConfig,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
}

/// Per-connection state once the peer has joined a room.
struct Joined {
    conn: Uuid,
    group: Arc<BroadcastGroup>,
    rx: broadcast::Receiver<Outbound>,
}

impl RelayServer {
    pub fn new(config: ServerConfig) -> Self {
        let rooms = Arc::new(RoomManager::new(config.broadcast_capacity));
        Self {
            config,
            rooms,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay listening on {}", listener.local_addr()?);
        self.serve(listener).await?;
        Ok(())
    }

    /// Accept connections from an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> ConnResult<()> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut joined: Option<Joined> = None;
        let idle = tokio::time::sleep(self.config.idle_timeout());
        tokio::pin!(idle);

        let outcome = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        idle.as_mut().reset(tokio::time::Instant::now() + self.config.idle_timeout());
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                let bytes: Vec<u8> = data.into();
                                match SyncMessage::decode(&bytes) {
                                    Ok(sync_msg) => {
                                        {
                                            let mut s = self.stats.write().await;
                                            s.total_messages += 1;
                                            s.total_bytes += bytes.len() as u64;
                                        }
                                        if !self.handle_message(sync_msg, &mut joined, &mut ws_sender).await? {
                                            break;
                                        }
                                    }
                                    Err(e) => log::warn!("Failed to decode message from {addr}: {e}"),
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }
                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }
                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }
                            _ => {}
                        }
                    }

                    out = async {
                        match joined.as_mut() {
                            Some(j) => j.rx.recv().await,
                            // Not in a room yet: nothing to forward
                            None => std::future::pending().await,
                        }
                    } => {
                        match out {
                            Ok((sender, bytes)) => {
                                if joined.as_ref().map(|j| j.conn) == Some(sender) {
                                    continue; // Skip own messages
                                }
                                ws_sender.send(Message::Binary(bytes.to_vec().into())).await?;
                            }
                            Err(RecvError::Lagged(n)) => {
                                if let Some(j) = joined.as_ref() {
                                    log::warn!("Peer {} lagged by {n} messages, resending state", j.conn);
                                    j.group.record_dropped(n);
                                    Self::send_room_state(j, &mut ws_sender).await?;
                                }
                            }
                            Err(RecvError::Closed) => break,
                        }
                    }

                    _ = &mut idle => {
                        log::warn!("Connection from {addr} idle too long, closing");
                        break;
                    }
                }
            }
            Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
        }
        .await;

        if let Some(j) = joined {
            self.leave(j).await;
        }
        {
            let mut s = self.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
            s.active_rooms = self.rooms.room_count().await;
        }
        outcome
    }

    /// Returns false when the connection should close.
    async fn handle_message(
        &self,
        msg: SyncMessage,
        joined: &mut Option<Joined>,
        ws_sender: &mut WsSink,
    ) -> ConnResult<bool> {
        match msg.msg_type {
            MessageType::Join => {
                if joined.is_some() {
                    log::warn!("Peer {} sent a second Join, ignoring", msg.peer_id);
                    return Ok(true);
                }
                let presence = match msg.presence_state() {
                    Ok(p) => p,
                    Err(e) => {
                        log::warn!("Join from {} without valid presence: {e}", msg.peer_id);
                        return Ok(true);
                    }
                };

                let (group, rx, existing) = match self
                    .rooms
                    .join(&msg.room, msg.peer_id, presence.clone(), self.config.max_peers_per_room)
                    .await
                {
                    Ok(admission) => admission,
                    Err(rejection) => {
                        log::warn!("Rejecting {} from room {}: {rejection}", msg.peer_id, msg.room);
                        self.stats.write().await.rejected_joins += 1;
                        let reject = SyncMessage::rejected(Uuid::nil(), &msg.room, &rejection.to_string());
                        send(ws_sender, &reject).await?;
                        return Ok(false);
                    }
                };

                // Seated from here on: any failure below still runs `leave`
                *joined = Some(Joined {
                    conn: msg.peer_id,
                    group: group.clone(),
                    rx,
                });

                let state = SyncMessage::sync_step2(Uuid::nil(), &msg.room, group.encode_state().await);
                send(ws_sender, &state).await?;
                send(ws_sender, &SyncMessage::roster(&msg.room, &existing)?).await?;
                group.broadcast(&msg)?;

                self.stats.write().await.active_rooms = self.rooms.room_count().await;
                log::info!(
                    "Peer {} ({}) joined room {}",
                    presence.username,
                    msg.peer_id,
                    msg.room
                );
            }

            MessageType::Delta => {
                let Some(j) = joined.as_ref() else {
                    log::debug!("Delta before Join from {}", msg.peer_id);
                    return Ok(true);
                };
                match j.group.apply_update(&msg.payload).await {
                    Ok(()) => {
                        j.group.broadcast_raw(j.conn, Arc::new(msg.encode()?));
                    }
                    Err(e) => log::warn!("Dropping bad delta from {}: {e}", j.conn),
                }
            }

            MessageType::Presence => {
                let Some(j) = joined.as_ref() else {
                    return Ok(true);
                };
                match msg.presence_patch() {
                    Ok(patch) => {
                        j.group.patch_peer(&j.conn, &patch).await;
                        log::trace!("Presence patch from {} in room {}", j.conn, j.group.room());
                        // Re-tag with the connection id the relay knows
                        let mut forwarded = msg;
                        forwarded.peer_id = j.conn;
                        j.group.broadcast(&forwarded)?;
                    }
                    Err(e) => log::warn!("Bad presence patch from {}: {e}", j.conn),
                }
            }

            MessageType::SyncStep1 => {
                let Some(j) = joined.as_ref() else {
                    return Ok(true);
                };
                match j.group.diff_since(&msg.payload).await {
                    Ok(diff) => {
                        let response = SyncMessage::sync_step2(Uuid::nil(), j.group.room(), diff);
                        send(ws_sender, &response).await?;
                    }
                    Err(e) => log::warn!("Bad state vector from {}: {e}", j.conn),
                }
            }

            MessageType::Ping => {
                send(ws_sender, &SyncMessage::pong(msg.peer_id)).await?;
            }

            other => log::debug!("Unhandled message type from client: {other:?}"),
        }
        Ok(true)
    }

    /// Full replica plus the complete roster, for a peer that fell behind.
    /// The roster replaces the peer's view, so Joins and PeerLefts it missed
    /// do not leave stale entries behind.
    async fn send_room_state(j: &Joined, ws_sender: &mut WsSink) -> ConnResult<()> {
        let state = SyncMessage::sync_step2(Uuid::nil(), j.group.room(), j.group.encode_state().await);
        send(ws_sender, &state).await?;
        let others: Vec<_> = j.group.peers().await.into_iter().filter(|(conn, _)| *conn != j.conn).collect();
        send(ws_sender, &SyncMessage::roster(j.group.room(), &others)?).await?;
        Ok(())
    }

    async fn leave(&self, j: Joined) {
        let room = j.group.room().to_string();
        j.group.remove_peer(&j.conn).await;
        let _ = j.group.broadcast(&SyncMessage::peer_left(j.conn, &room));
        drop(j.rx);
        self.rooms.remove_if_empty(&room).await;
        log::info!("Peer {} left room {room}", j.conn);
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }
}

async fn send(ws_sender: &mut WsSink, msg: &SyncMessage) -> ConnResult<()> {
    ws_sender.send(Message::Binary(msg.encode()?.into())).await?;
    Ok(())
}
