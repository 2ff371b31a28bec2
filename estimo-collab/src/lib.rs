//! # estimo-collab: relay and client for estimo rooms
//!
//! Carries replication updates and presence between participants of a room.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ RelayServer │
//! │ (per tab)   │     Binary Proto    │ (central)   │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐
//! │ RoomSession │                     │ Yrs replica │
//! │ + replica   │                     │ (authority) │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                           ┌───────┴───────┐
//! ┌─────────────┐                    │ BroadcastGroup│
//! │ Participant │                    │ (fan-out)     │
//! └─────────────┘                    └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Binary wire protocol (bincode-encoded SyncMessage)
//! - [`broadcast`]: Room-based fan-out with backpressure
//! - [`server`]: WebSocket relay
//! - [`client`]: WebSocket client with offline queue
//! - [`presence`]: Other participants' presence per connection
//! - [`session`]: One room as seen by one participant
//! - [`participant`]: Identity, session, reconciliation and celebration

pub mod broadcast;
pub mod client;
pub mod error;
pub mod participant;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod session;

pub use broadcast::{BroadcastGroup, BroadcastStats, JoinRejection, RoomManager};
pub use client::{ClientConfig, ConnectionState, OfflineQueue, SyncClient, SyncEvent};
pub use error::CollabError;
pub use participant::{Participant, ParticipantUpdate};
pub use presence::PresenceRoom;
pub use protocol::{MessageType, ProtocolError, SyncMessage};
pub use server::{RelayServer, ServerConfig, ServerStats};
pub use session::{RoomSession, SessionUpdate};
