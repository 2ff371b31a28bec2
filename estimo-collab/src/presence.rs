//! Other participants' presence as seen by one client.
//!
//! ```text
//! Join(conn, presence) ──► insert / replace
//! Presence(conn, patch) ─► merge field-wise
//! PeerLeft(conn) ────────► remove
//! Roster(peers) ─────────► replace everything
//! ```
//!
//! Entries are keyed by connection id. A participant open in two tabs has
//! two connections and so two entries with the same participant id; the
//! presentation layer decides how to show that.

use std::collections::HashMap;

use estimo_core::{Presence, PresencePatch};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct PresenceRoom {
    /// Our own connection id; messages from it are ignored.
    local_conn: Uuid,
    peers: HashMap<Uuid, Presence>,
}

impl PresenceRoom {
    pub fn new(local_conn: Uuid) -> Self {
        Self {
            local_conn,
            peers: HashMap::new(),
        }
    }

    pub fn local_conn(&self) -> Uuid {
        self.local_conn
    }

    /// Record a peer's full presence. Returns true if anything changed.
    pub fn handle_join(&mut self, conn: Uuid, presence: Presence) -> bool {
        if conn == self.local_conn {
            return false;
        }
        log::debug!("Peer {} ({conn}) is present", presence.username);
        self.peers.insert(conn, presence.clone()) != Some(presence)
    }

    /// Merge a patch into a known peer. Patches for unknown peers are
    /// dropped; their Join will carry the full state.
    pub fn handle_patch(&mut self, conn: Uuid, patch: &PresencePatch) -> bool {
        if conn == self.local_conn {
            return false;
        }
        match self.peers.get_mut(&conn) {
            Some(presence) => presence.apply(patch),
            None => {
                log::trace!("Presence patch for unknown peer {conn}");
                false
            }
        }
    }

    pub fn handle_leave(&mut self, conn: Uuid) -> Option<Presence> {
        let left = self.peers.remove(&conn);
        if let Some(p) = &left {
            log::debug!("Peer {} ({conn}) left", p.username);
        }
        left
    }

    /// Replace every entry with `peers`. Returns true if anything changed.
    pub fn replace_all(&mut self, peers: Vec<(Uuid, Presence)>) -> bool {
        let next: HashMap<Uuid, Presence> = peers
            .into_iter()
            .filter(|(conn, _)| *conn != self.local_conn)
            .collect();
        if next == self.peers {
            return false;
        }
        log::debug!("Roster replaced: {} -> {} peers", self.peers.len(), next.len());
        self.peers = next;
        true
    }

    /// Forget everyone, e.g. after losing the connection.
    pub fn clear(&mut self) {
        self.peers.clear();
    }

    pub fn peer(&self, conn: &Uuid) -> Option<&Presence> {
        self.peers.get(conn)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn others(&self) -> impl Iterator<Item = &Presence> {
        self.peers.values()
    }

    /// Others that are not spectating.
    pub fn active_others(&self) -> impl Iterator<Item = &Presence> {
        self.peers.values().filter(|p| !p.is_spectator)
    }
}
