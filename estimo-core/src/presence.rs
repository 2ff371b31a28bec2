//! Network presence and its reconciliation with the durable identity.
//!
//! ```text
//!   persisted identity (pid, puser)      network presence (nid, nuser)
//!              │                                   │
//!              └──────────► PresenceReconciler ◄───┘
//!                               │
//!           ┌───────────────────┴────────────────────┐
//!   identity write (seed)                 presence patch (reclaim)
//!   pid unset    → adopt nid              pid set, ≠ nid     → push pid
//!   puser unset  → adopt nuser            puser set, ≠ nuser → push puser
//! ```
//!
//! Persisted identity wins once it exists; the network only seeds an empty
//! identity. Both rules read the same snapshot and each side gets at most
//! one compound write per pass.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::Identity;

/// A participant's ephemeral, network-visible record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    pub id: String,
    pub username: String,
    pub is_spectator: bool,
}

impl Presence {
    /// Fresh presence for a new connection: random id, given name.
    pub fn generated(username: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            username: username.into(),
            is_spectator: false,
        }
    }

    /// Merge a patch field-wise. Returns true if anything changed.
    pub fn apply(&mut self, patch: &PresencePatch) -> bool {
        let mut changed = false;
        if let Some(id) = &patch.id {
            if *id != self.id {
                self.id = id.clone();
                changed = true;
            }
        }
        if let Some(username) = &patch.username {
            if *username != self.username {
                self.username = username.clone();
                changed = true;
            }
        }
        if let Some(is_spectator) = patch.is_spectator {
            if is_spectator != self.is_spectator {
                self.is_spectator = is_spectator;
                changed = true;
            }
        }
        changed
    }
}

/// Partial presence, merged field-wise.
///
/// Every field is always serialized so the type stays usable with
/// non-self-describing formats.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresencePatch {
    pub id: Option<String>,
    pub username: Option<String>,
    pub is_spectator: Option<bool>,
}

impl PresencePatch {
    pub fn is_empty(&self) -> bool {
        self.id.is_none() && self.username.is_none() && self.is_spectator.is_none()
    }

    pub fn spectator(is_spectator: bool) -> Self {
        Self {
            is_spectator: Some(is_spectator),
            ..Self::default()
        }
    }

    pub fn username(username: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            ..Self::default()
        }
    }
}

impl From<&Presence> for PresencePatch {
    fn from(p: &Presence) -> Self {
        Self {
            id: Some(p.id.clone()),
            username: Some(p.username.clone()),
            is_spectator: Some(p.is_spectator),
        }
    }
}

/// Where the identity/presence pair stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilePhase {
    /// No network id assigned yet.
    AwaitingNetwork,
    /// The durable identity is being filled from the network.
    Seeding,
    /// The durable identity is being pushed onto the network presence.
    Reclaiming,
    Converged,
}

/// Writes produced by one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    /// Full identity to persist, if it must change.
    pub identity: Option<Identity>,
    /// Patch to send to the network, if presence must change.
    pub presence: Option<PresencePatch>,
    pub phase: ReconcilePhase,
}

impl Reconciliation {
    pub fn is_noop(&self) -> bool {
        self.identity.is_none() && self.presence.is_none()
    }
}

#[derive(Debug)]
pub struct PresenceReconciler {
    phase: ReconcilePhase,
}

impl Default for PresenceReconciler {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceReconciler {
    pub fn new() -> Self {
        Self {
            phase: ReconcilePhase::AwaitingNetwork,
        }
    }

    pub fn phase(&self) -> ReconcilePhase {
        self.phase
    }

    /// Compute the writes that bring identity and presence together.
    ///
    /// Pure with respect to its inputs; the caller applies the result. Run it
    /// again after the writes land and it reports `Converged`.
    pub fn reconcile(&mut self, identity: &Identity, presence: Option<&Presence>) -> Reconciliation {
        let Some(presence) = presence.filter(|p| !p.id.is_empty()) else {
            self.transition(ReconcilePhase::AwaitingNetwork);
            return Reconciliation {
                identity: None,
                presence: None,
                phase: self.phase,
            };
        };

        let mut seeded = identity.clone();
        let mut patch = PresencePatch::default();

        match &identity.username {
            None => seeded.username = Some(presence.username.clone()),
            Some(name) if *name != presence.username => patch.username = Some(name.clone()),
            Some(_) => {}
        }
        match &identity.id {
            None => seeded.id = Some(presence.id.clone()),
            Some(id) if *id != presence.id => patch.id = Some(id.clone()),
            Some(_) => {}
        }

        let identity_write = (seeded != *identity).then_some(seeded);
        let presence_write = (!patch.is_empty()).then_some(patch);

        let phase = if identity_write.is_some() {
            ReconcilePhase::Seeding
        } else if presence_write.is_some() {
            ReconcilePhase::Reclaiming
        } else {
            ReconcilePhase::Converged
        };
        self.transition(phase);

        Reconciliation {
            identity: identity_write,
            presence: presence_write,
            phase,
        }
    }

    fn transition(&mut self, next: ReconcilePhase) {
        if self.phase != next {
            log::info!("Presence reconciliation {:?} -> {:?}", self.phase, next);
            self.phase = next;
        }
    }
}
