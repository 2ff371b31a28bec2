//! A participant's view of one room over the relay.
//!
//! ```text
//!  SyncEvent ──► apply_event ──┬─► SharedEstimationState ──► shared watch
//!                              └─► PresenceRoom ──────────► others watch
//!
//!  mutate / update_presence ──► local apply ──► SyncClient ──► relay
//! ```
//!
//! Local estimation changes are applied optimistically before they are
//! sent; the own presence moves once the client has taken the patch. Remote
//! changes arrive later as events and are merged by the replica.

use estimo_core::{Presence, PresencePatch, SharedEstimationState, SharedMutation, SharedSnapshot};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::client::{ClientConfig, ConnectionState, SyncClient, SyncEvent};
use crate::error::CollabError;
use crate::presence::PresenceRoom;

/// What an applied event changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    Connected,
    Disconnected,
    /// The relay sent its full state (a rejoin or a resync)
    Synced,
    /// Estimates or the reveal flag changed
    Shared,
    /// Someone else's presence changed
    Others,
    Rejected(String),
    Unchanged,
}

pub struct RoomSession {
    client: SyncClient,
    events: mpsc::Receiver<SyncEvent>,
    shared: SharedEstimationState,
    room: PresenceRoom,
    me: Presence,
    shared_tx: watch::Sender<SharedSnapshot>,
    others_tx: watch::Sender<Vec<Presence>>,
}

impl RoomSession {
    /// A disconnected session seeded with `initial_presence` and, if given,
    /// a full-state update for the shared estimation state.
    pub fn new(
        room: impl Into<String>,
        initial_presence: Presence,
        initial_state: Option<&[u8]>,
        config: ClientConfig,
    ) -> Result<Self, CollabError> {
        let shared = match initial_state {
            Some(update) => SharedEstimationState::from_state(update)?,
            None => SharedEstimationState::new(),
        };
        let mut client = SyncClient::new(config, room, initial_presence.clone());
        let events = client.take_event_rx().unwrap_or_else(|| mpsc::channel(1).1);
        let (shared_tx, _) = watch::channel(shared.snapshot());
        let (others_tx, _) = watch::channel(Vec::new());

        Ok(Self {
            room: PresenceRoom::new(client.conn_id()),
            client,
            events,
            shared,
            me: initial_presence,
            shared_tx,
            others_tx,
        })
    }

    /// Open the connection and join the room.
    pub async fn connect(&mut self) -> Result<(), CollabError> {
        self.client.connect().await
    }

    pub async fn disconnect(&mut self) {
        self.client.disconnect().await;
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.client.connection_state().await
    }

    pub fn room_id(&self) -> &str {
        self.client.room()
    }

    pub fn conn_id(&self) -> Uuid {
        self.client.conn_id()
    }

    /// Our own presence as last set locally.
    pub fn presence(&self) -> &Presence {
        &self.me
    }

    /// Merge a partial presence update and announce it.
    ///
    /// The local presence only moves once the client has taken the patch.
    /// If this future is dropped first, the presence is unchanged and the
    /// next reconciliation finds the same difference again.
    pub async fn update_presence(&mut self, patch: PresencePatch) -> Result<(), CollabError> {
        let mut next = self.me.clone();
        if patch.is_empty() || !next.apply(&patch) {
            return Ok(());
        }
        self.client.send_presence(&patch).await?;
        self.me = next;
        Ok(())
    }

    /// Apply `mutations` atomically, publish, then replicate.
    pub async fn mutate(&mut self, mutations: &[SharedMutation]) -> Result<SharedSnapshot, CollabError> {
        let update = self.shared.mutate(mutations)?;
        self.publish_shared();
        self.client.send_delta(update).await?;
        Ok(self.shared_tx.borrow().clone())
    }

    /// Read the current shared state through `selector`.
    pub fn observe_shared<T>(&self, selector: impl FnOnce(&SharedSnapshot) -> T) -> T {
        selector(&self.shared_tx.borrow())
    }

    /// Read the current presence of everyone else through `selector`.
    pub fn observe_others<T>(&self, selector: impl FnOnce(&[Presence]) -> T) -> T {
        selector(&self.others_tx.borrow())
    }

    pub fn subscribe_shared(&self) -> watch::Receiver<SharedSnapshot> {
        self.shared_tx.subscribe()
    }

    pub fn subscribe_others(&self) -> watch::Receiver<Vec<Presence>> {
        self.others_tx.subscribe()
    }

    pub fn shared(&self) -> &SharedEstimationState {
        &self.shared
    }

    #[cfg(test)]
    pub(crate) async fn attach_wire(&mut self, capacity: usize) -> mpsc::Receiver<Vec<u8>> {
        self.client.attach_wire(capacity).await
    }

    /// Wait for the next event from the relay and apply it.
    pub async fn next_event(&mut self) -> Option<SessionUpdate> {
        let event = self.events.recv().await?;
        Some(self.apply_event(event))
    }

    /// Apply an event if one is already waiting.
    pub fn try_next_event(&mut self) -> Option<SessionUpdate> {
        let event = self.events.try_recv().ok()?;
        Some(self.apply_event(event))
    }

    pub fn apply_event(&mut self, event: SyncEvent) -> SessionUpdate {
        match event {
            SyncEvent::Connected { conn_id } => {
                self.room = PresenceRoom::new(conn_id);
                self.publish_others();
                SessionUpdate::Connected
            }
            SyncEvent::Disconnected => {
                self.room.clear();
                self.publish_others();
                SessionUpdate::Disconnected
            }
            SyncEvent::StateSynced(update) => {
                if let Err(e) = self.shared.apply_remote(&update) {
                    log::warn!("Dropping state for room {}: {e}", self.client.room());
                    return SessionUpdate::Unchanged;
                }
                self.publish_shared();
                SessionUpdate::Synced
            }
            SyncEvent::RemoteDelta { update, .. } => {
                if let Err(e) = self.shared.apply_remote(&update) {
                    log::warn!("Dropping update for room {}: {e}", self.client.room());
                    return SessionUpdate::Unchanged;
                }
                if self.publish_shared() {
                    SessionUpdate::Shared
                } else {
                    SessionUpdate::Unchanged
                }
            }
            SyncEvent::PeerJoined { peer_id, presence } => {
                self.others_changed(|room| room.handle_join(peer_id, presence))
            }
            SyncEvent::PresenceUpdated { peer_id, patch } => {
                self.others_changed(|room| room.handle_patch(peer_id, &patch))
            }
            SyncEvent::PeerLeft(peer_id) => self.others_changed(|room| room.handle_leave(peer_id).is_some()),
            SyncEvent::Roster(peers) => self.others_changed(|room| room.replace_all(peers)),
            SyncEvent::Rejected(reason) => {
                log::error!("Relay rejected room {}: {reason}", self.client.room());
                SessionUpdate::Rejected(reason)
            }
        }
    }

    fn others_changed(&mut self, f: impl FnOnce(&mut PresenceRoom) -> bool) -> SessionUpdate {
        if f(&mut self.room) {
            self.publish_others();
            SessionUpdate::Others
        } else {
            SessionUpdate::Unchanged
        }
    }

    /// Publish the replica's snapshot if estimates or the flag moved.
    fn publish_shared(&self) -> bool {
        let next = self.shared.snapshot();
        self.shared_tx.send_if_modified(|current| {
            let changed =
                current.estimates != next.estimates || current.estimates_revealed != next.estimates_revealed;
            *current = next;
            changed
        })
    }

    fn publish_others(&self) {
        let mut others: Vec<Presence> = self.room.others().cloned().collect();
        others.sort_by(|a, b| a.username.cmp(&b.username).then_with(|| a.id.cmp(&b.id)));
        self.others_tx.send_if_modified(|current| {
            if *current == others {
                return false;
            }
            *current = others;
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use estimo_core::Estimate;
    use tokio::time::{timeout, Duration};

    use crate::protocol::SyncMessage;

    fn session() -> RoomSession {
        RoomSession::new(
            "room",
            Presence::generated("Fox-42"),
            None,
            ClientConfig::for_testing("ws://127.0.0.1:9"),
        )
        .unwrap()
    }

    fn set(pid: &str, estimate: Estimate) -> SharedMutation {
        SharedMutation::SetEstimate {
            participant_id: pid.into(),
            estimate,
        }
    }

    #[tokio::test]
    async fn test_mutate_offline_applies_locally() {
        let mut session = session();
        let mut shared = session.subscribe_shared();

        let snapshot = session.mutate(&[set("P1", Estimate::Five)]).await.unwrap();
        assert_eq!(snapshot.estimates.get("P1"), Some(Estimate::Five));
        assert!(shared.has_changed().unwrap());
        assert_eq!(shared.borrow_and_update().estimates.len(), 1);
        assert_eq!(session.client.offline_queue_len().await, 1);
    }

    #[tokio::test]
    async fn test_invalid_mutation_changes_nothing() {
        let mut session = session();
        let err = session
            .mutate(&[set("P1", Estimate::One), set("", Estimate::Two)])
            .await
            .unwrap_err();
        assert!(matches!(err, CollabError::State(_)));
        assert!(session.observe_shared(|s| s.estimates.is_empty()));
    }

    #[test]
    fn test_remote_delta_and_duplicate() {
        let mut session = session();
        let mut remote = SharedEstimationState::new();
        let update = remote.set_estimate("P2", "8").unwrap();

        let delta = SyncEvent::RemoteDelta {
            peer_id: Uuid::new_v4(),
            clock: 1,
            update: update.clone(),
        };
        assert_eq!(session.apply_event(delta.clone()), SessionUpdate::Shared);
        assert_eq!(session.apply_event(delta), SessionUpdate::Unchanged);
        assert_eq!(session.observe_shared(|s| s.estimates.get("P2")), Some(Estimate::Eight));
    }

    #[test]
    fn test_state_sync_always_reported() {
        let mut session = session();
        let empty = SharedEstimationState::new().encode_state();
        assert_eq!(session.apply_event(SyncEvent::StateSynced(empty)), SessionUpdate::Synced);
    }

    #[test]
    fn test_garbage_update_is_dropped() {
        let mut session = session();
        let update = session.apply_event(SyncEvent::StateSynced(vec![0xff, 0x00, 0x13]));
        assert_eq!(update, SessionUpdate::Unchanged);
    }

    #[test]
    fn test_others_follow_presence_events() {
        let mut session = session();
        let conn = Uuid::new_v4();
        session.apply_event(SyncEvent::Connected { conn_id: conn });
        let bob = Uuid::new_v4();

        let joined = SyncEvent::PeerJoined {
            peer_id: bob,
            presence: Presence::generated("Bob"),
        };
        assert_eq!(session.apply_event(joined), SessionUpdate::Others);
        assert_eq!(session.observe_others(|o| o.len()), 1);

        let patched = SyncEvent::PresenceUpdated {
            peer_id: bob,
            patch: PresencePatch::spectator(true),
        };
        assert_eq!(session.apply_event(patched), SessionUpdate::Others);
        assert!(session.observe_others(|o| o[0].is_spectator));

        assert_eq!(session.apply_event(SyncEvent::PeerLeft(bob)), SessionUpdate::Others);
        assert_eq!(session.apply_event(SyncEvent::PeerLeft(bob)), SessionUpdate::Unchanged);
    }

    #[test]
    fn test_own_join_is_not_an_other() {
        let mut session = session();
        let conn = Uuid::new_v4();
        session.apply_event(SyncEvent::Connected { conn_id: conn });
        let own = SyncEvent::PeerJoined {
            peer_id: conn,
            presence: Presence::generated("Me"),
        };
        assert_eq!(session.apply_event(own), SessionUpdate::Unchanged);
    }

    #[test]
    fn test_disconnect_forgets_others() {
        let mut session = session();
        session.apply_event(SyncEvent::PeerJoined {
            peer_id: Uuid::new_v4(),
            presence: Presence::generated("Bob"),
        });
        assert_eq!(session.apply_event(SyncEvent::Disconnected), SessionUpdate::Disconnected);
        assert_eq!(session.observe_others(|o| o.len()), 0);
    }

    #[tokio::test]
    async fn test_update_presence_locally() {
        let mut session = session();
        session.update_presence(PresencePatch::username("Alice")).await.unwrap();
        assert_eq!(session.presence().username, "Alice");
        assert_eq!(session.client.presence().await.username, "Alice");
    }

    #[test]
    fn test_roster_replaces_others() {
        let mut session = session();
        session.apply_event(SyncEvent::Connected { conn_id: Uuid::new_v4() });
        let bob = Uuid::new_v4();
        let gone = Uuid::new_v4();
        session.apply_event(SyncEvent::PeerJoined {
            peer_id: bob,
            presence: Presence::generated("Bob"),
        });
        session.apply_event(SyncEvent::PeerJoined {
            peer_id: gone,
            presence: Presence::generated("Gone"),
        });

        let roster = SyncEvent::Roster(vec![(bob, Presence::generated("Bob"))]);
        assert_eq!(session.apply_event(roster), SessionUpdate::Others);
        let names = session.observe_others(|o| o.iter().map(|p| p.username.clone()).collect::<Vec<_>>());
        assert_eq!(names, vec!["Bob"]);
    }

    #[tokio::test]
    async fn test_dropped_presence_update_leaves_presence_alone() {
        let mut session = session();
        // Room for exactly one message, which the first update takes
        let mut wire = session.attach_wire(1).await;
        session.update_presence(PresencePatch::spectator(true)).await.unwrap();
        assert!(session.presence().is_spectator);

        let stalled = timeout(
            Duration::from_millis(50),
            session.update_presence(PresencePatch::username("Alice")),
        )
        .await;
        assert!(stalled.is_err());
        assert_eq!(session.presence().username, "Fox-42");

        // Once the wire drains the same patch goes through
        wire.recv().await.unwrap();
        session.update_presence(PresencePatch::username("Alice")).await.unwrap();
        assert_eq!(session.presence().username, "Alice");
        let sent = SyncMessage::decode(&wire.recv().await.unwrap()).unwrap();
        assert_eq!(sent.presence_patch().unwrap(), PresencePatch::username("Alice"));
    }

    #[test]
    fn test_seeded_from_initial_state() {
        let mut origin = SharedEstimationState::new();
        origin.set_estimate("P1", "3").unwrap();
        origin.set_revealed(true).unwrap();

        let session = RoomSession::new(
            "room",
            Presence::generated("Fox-42"),
            Some(&origin.encode_state()),
            ClientConfig::for_testing("ws://127.0.0.1:9"),
        )
        .unwrap();
        assert!(session.observe_shared(|s| s.estimates_revealed));
        assert_eq!(session.shared().estimate_of("P1"), Some(Estimate::Three));
    }
}
