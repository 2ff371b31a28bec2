//! What one participant sees of the room.

use crate::collab::SharedSnapshot;
use crate::estimate::{Estimate, EstimateView};
use crate::presence::Presence;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantRow {
    pub id: String,
    pub username: String,
    pub estimate: EstimateView,
    pub is_self: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableView {
    pub revealed: bool,
    pub self_estimate: Option<Estimate>,
    /// Voting participants, self first, then others by username.
    pub rows: Vec<ParticipantRow>,
    /// Usernames of spectators, self included.
    pub spectators: Vec<String>,
}

impl TableView {
    pub fn build<'a, I>(snapshot: &SharedSnapshot, me: &Presence, others: I) -> Self
    where
        I: IntoIterator<Item = &'a Presence>,
    {
        let estimates = &snapshot.estimates;
        let revealed = snapshot.estimates_revealed;
        let mut rows = Vec::new();
        let mut spectators = Vec::new();

        if me.is_spectator {
            spectators.push(me.username.clone());
        } else {
            rows.push(ParticipantRow {
                id: me.id.clone(),
                username: me.username.clone(),
                estimate: estimates.view_for(&me.id, &me.id, revealed),
                is_self: true,
            });
        }

        let mut others: Vec<&Presence> = others.into_iter().filter(|p| p.id != me.id).collect();
        others.sort_by(|a, b| a.username.cmp(&b.username).then_with(|| a.id.cmp(&b.id)));
        for p in others {
            if p.is_spectator {
                spectators.push(p.username.clone());
                continue;
            }
            rows.push(ParticipantRow {
                id: p.id.clone(),
                username: p.username.clone(),
                estimate: estimates.view_for(&me.id, &p.id, revealed),
                is_self: false,
            });
        }

        Self {
            revealed,
            self_estimate: estimates.get(&me.id),
            rows,
            spectators,
        }
    }

    /// Ids of every voting participant.
    pub fn active_ids(&self) -> impl Iterator<Item = &str> {
        self.rows.iter().map(|r| r.id.as_str())
    }

    /// Rows other than self.
    pub fn others(&self) -> impl Iterator<Item = &ParticipantRow> {
        self.rows.iter().filter(|r| !r.is_self)
    }
}
