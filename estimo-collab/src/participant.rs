//! One participant in a room: durable identity, live session, reconciler and
//! celebration trigger wired together.
//!
//! ```text
//!   IdentityStore ──┐                     ┌──► TableView
//!                   ├─► PresenceReconciler │
//!   RoomSession ────┘         │            └──► ConsensusCelebrationTrigger
//!        ▲                    ▼
//!        └──── identity write / presence patch
//! ```
//!
//! Reconciliation runs after every change to the identity or to the
//! connection; the celebration check runs after every shared-state change.
//! A reconciliation cut short by dropping [`Participant::next_update`] is
//! run again at the start of the next call.

use estimo_core::{
    names, BrowserContext, Celebration, ConsensusCelebrationTrigger, Estimate, ExecutionContext, Identity,
    IdentityStore, Presence, PresencePatch, PresenceReconciler, Reconciliation, SharedMutation, StoreOptions,
    TableView, WriteOutcome,
};
use tokio::sync::watch;

use crate::client::{ClientConfig, ConnectionState};
use crate::error::CollabError;
use crate::session::{RoomSession, SessionUpdate};

/// What changed for the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParticipantUpdate {
    Connected,
    Disconnected,
    Rejected(String),
    /// The durable identity changed, here or in another tab
    Identity,
    /// Estimates, the reveal flag or someone's presence changed
    Table,
    Celebration(Celebration),
}

pub struct Participant {
    identity: IdentityStore,
    session: RoomSession,
    reconciler: PresenceReconciler,
    trigger: ConsensusCelebrationTrigger,
    /// Set on (re)connect until the relay's state has arrived
    awaiting_state: bool,
    /// Set while `next_update` reconciles
    reconcile_pending: bool,
}

impl Participant {
    pub fn new(identity: IdentityStore, session: RoomSession) -> Self {
        let mut participant = Self {
            identity,
            session,
            reconciler: PresenceReconciler::new(),
            trigger: ConsensusCelebrationTrigger::new(),
            awaiting_state: false,
            reconcile_pending: false,
        };
        participant.check_celebration();
        participant
    }

    /// Open the durable identity from `ctx` and prepare a session for `room`.
    ///
    /// The initial presence takes whatever the stored identity already has
    /// and fills the rest with a random id and a generated name.
    pub fn open(ctx: &ExecutionContext, room: &str, config: ClientConfig) -> Result<Self, CollabError> {
        Self::open_with(ctx, room, config, StoreOptions::default())
    }

    /// Like [`open`](Self::open) with explicit identity options. With
    /// [`StoreOptions::deferred`] nothing is read until [`connect`](Self::connect),
    /// so the first presence is a generated one and the stored identity is
    /// reclaimed once the relay has accepted it.
    pub fn open_with(
        ctx: &ExecutionContext,
        room: &str,
        config: ClientConfig,
        options: StoreOptions,
    ) -> Result<Self, CollabError> {
        let identity = IdentityStore::with_options(ctx, options);
        let stored = identity.identity();
        let mut presence = Presence::generated(names::generate_username());
        presence.apply(&PresencePatch {
            id: stored.id,
            username: stored.username,
            is_spectator: None,
        });

        let session = RoomSession::new(room, presence, None, config)?;
        Ok(Self::new(identity, session))
    }

    /// Like [`open`](Self::open) for a fresh tab of `browser`.
    pub fn open_in(browser: &BrowserContext, room: &str, config: ClientConfig) -> Result<Self, CollabError> {
        Self::open(&ExecutionContext::Browser(browser.open_tab()), room, config)
    }

    /// Read a deferred identity if that has not happened yet, then join.
    pub async fn connect(&mut self) -> Result<(), CollabError> {
        if self.identity.hydrate() {
            log::debug!("Identity hydrated before joining {}", self.session.room_id());
        }
        self.session.connect().await
    }

    pub async fn disconnect(&mut self) {
        self.session.disconnect().await;
    }

    pub fn session(&self) -> &RoomSession {
        &self.session
    }

    /// The key this participant's estimate is stored under.
    pub fn participant_id(&self) -> &str {
        &self.session.presence().id
    }

    pub fn presence(&self) -> &Presence {
        self.session.presence()
    }

    pub fn identity(&self) -> Identity {
        self.identity.identity()
    }

    pub fn subscribe_identity(&self) -> watch::Receiver<Identity> {
        self.identity.subscribe()
    }

    pub async fn set_identity(&mut self, identity: Identity) -> Result<WriteOutcome, CollabError> {
        let outcome = self.identity.set(identity);
        self.reconcile().await?;
        Ok(outcome)
    }

    pub async fn remove_identity(&mut self) -> Result<Identity, CollabError> {
        let removed = self.identity.remove();
        self.reconcile().await?;
        Ok(removed)
    }

    /// Bring the durable identity and the network presence into agreement.
    ///
    /// The presence only counts as present while connected; before that the
    /// reconciler waits.
    pub async fn reconcile(&mut self) -> Result<Reconciliation, CollabError> {
        let connected = self.session.connection_state().await == ConnectionState::Connected;
        let identity = self.identity.identity();
        let outcome = self
            .reconciler
            .reconcile(&identity, connected.then_some(self.session.presence()));

        if let Some(next) = outcome.identity.clone() {
            if self.identity.set(next) == WriteOutcome::Unpersisted {
                log::warn!("Identity kept in memory only");
            }
        }
        if let Some(patch) = outcome.presence.clone() {
            self.session.update_presence(patch).await?;
        }
        Ok(outcome)
    }

    pub fn self_estimate(&self) -> Option<Estimate> {
        let id = self.participant_id();
        self.session.observe_shared(|s| s.estimates.get(id))
    }

    pub fn revealed(&self) -> bool {
        self.session.observe_shared(|s| s.estimates_revealed)
    }

    /// Everyone else who is not spectating.
    pub fn others_active(&self) -> Vec<Presence> {
        let me = self.participant_id();
        self.session
            .observe_others(|others| others.iter().filter(|p| !p.is_spectator && p.id != me).cloned().collect())
    }

    pub fn table(&self) -> TableView {
        let snapshot = self.session.observe_shared(Clone::clone);
        self.session
            .observe_others(|others| TableView::build(&snapshot, self.session.presence(), others))
    }

    /// Feed the current state to the celebration trigger.
    pub fn check_celebration(&mut self) -> Option<Celebration> {
        let table = self.table();
        let estimates = self.session.observe_shared(|s| s.estimates.clone());
        self.trigger.observe(table.revealed, &estimates, table.active_ids())
    }

    pub fn celebrations(&self) -> u64 {
        self.trigger.fired()
    }

    /// Record `label` as this participant's estimate.
    pub async fn submit_estimate(&mut self, label: &str) -> Result<Option<Celebration>, CollabError> {
        if self.presence().is_spectator {
            return Err(CollabError::Spectating);
        }
        let estimate: Estimate = label.parse().map_err(estimo_core::SharedStateError::from)?;
        let participant_id = self.participant_id().to_string();
        self.apply(&[SharedMutation::SetEstimate {
            participant_id,
            estimate,
        }])
        .await
    }

    pub async fn toggle_reveal(&mut self) -> Result<Option<Celebration>, CollabError> {
        let revealed = self.revealed();
        self.apply(&[SharedMutation::SetRevealed(!revealed)]).await
    }

    /// Start a new round: hide and forget every estimate.
    pub async fn clear_all(&mut self) -> Result<Option<Celebration>, CollabError> {
        self.apply(&[SharedMutation::SetRevealed(false), SharedMutation::ClearAll])
            .await
    }

    /// Switch between voting and watching. Becoming a spectator withdraws
    /// the own estimate.
    pub async fn toggle_spectator(&mut self) -> Result<Option<Celebration>, CollabError> {
        let spectating = !self.presence().is_spectator;
        self.session
            .update_presence(PresencePatch::spectator(spectating))
            .await?;
        if spectating && self.self_estimate().is_some() {
            let participant_id = self.participant_id().to_string();
            return self.apply(&[SharedMutation::ClearEstimate { participant_id }]).await;
        }
        Ok(self.check_celebration())
    }

    /// Change the display name everywhere: identity first, then presence.
    pub async fn rename(&mut self, username: &str) -> Result<(), CollabError> {
        let username = username.trim();
        if username.is_empty() {
            return Ok(());
        }
        self.identity.update(|identity| Identity {
            username: Some(username.to_string()),
            ..identity.clone()
        });
        // The reconciler only pushes while connected
        self.session
            .update_presence(PresencePatch::username(username))
            .await?;
        self.reconcile().await?;
        Ok(())
    }

    async fn apply(&mut self, mutations: &[SharedMutation]) -> Result<Option<Celebration>, CollabError> {
        self.session.mutate(mutations).await?;
        Ok(self.check_celebration())
    }

    /// Reconcile, remembering that it is under way until it finishes.
    async fn settle(&mut self, after: &str) {
        self.reconcile_pending = true;
        if let Err(e) = self.reconcile().await {
            log::warn!("Reconciliation after {after} failed: {e}");
        }
        self.reconcile_pending = false;
    }

    /// Wait for the next change worth showing.
    ///
    /// Returns `None` once the session's event stream has ended. Safe to use
    /// as a `tokio::select!` branch.
    pub async fn next_update(&mut self) -> Option<ParticipantUpdate> {
        if self.reconcile_pending {
            self.settle("an interrupted update").await;
        }
        loop {
            let update = tokio::select! {
                update = self.session.next_event() => update?,
                _ = self.identity.changed() => {
                    self.settle("identity change").await;
                    return Some(ParticipantUpdate::Identity);
                }
            };

            match update {
                SessionUpdate::Connected => {
                    self.awaiting_state = true;
                    self.settle("connect").await;
                    return Some(ParticipantUpdate::Connected);
                }
                SessionUpdate::Disconnected => return Some(ParticipantUpdate::Disconnected),
                SessionUpdate::Rejected(reason) => return Some(ParticipantUpdate::Rejected(reason)),
                SessionUpdate::Synced if self.awaiting_state => {
                    // The relay's state is a new baseline, not a reveal
                    self.awaiting_state = false;
                    self.trigger.reset_baseline();
                    self.check_celebration();
                    return Some(ParticipantUpdate::Table);
                }
                SessionUpdate::Synced | SessionUpdate::Shared => {
                    return Some(match self.check_celebration() {
                        Some(celebration) => ParticipantUpdate::Celebration(celebration),
                        None => ParticipantUpdate::Table,
                    });
                }
                SessionUpdate::Others => return Some(ParticipantUpdate::Table),
                SessionUpdate::Unchanged => continue,
            }
        }
    }
}
