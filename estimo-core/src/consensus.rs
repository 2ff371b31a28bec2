//! Consensus detection and the one-shot celebration trigger.
//!
//! The trigger is edge-triggered on the shared reveal flag: it remembers the
//! last flag value it saw and only evaluates consensus on a `false → true`
//! transition. The very first observation just records the baseline, so
//! joining a room that is already revealed never celebrates.

use crate::estimate::{Estimate, EstimateMap};

/// The common estimate, if every active participant with an entry agrees.
///
/// Participants without an entry and ids outside `active_ids` (spectators,
/// people who left) do not count. No voters means no consensus.
pub fn consensus<'a, I>(estimates: &EstimateMap, active_ids: I) -> Option<Estimate>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut votes = active_ids.into_iter().filter_map(|id| estimates.get(id));
    let first = votes.next()?;
    votes.all(|e| e == first).then_some(first)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Celebration {
    pub estimate: Estimate,
    /// How many participants agreed.
    pub voters: usize,
}

/// Receives celebrations. What happens visually is up to the implementor.
pub trait CelebrationSink {
    fn celebrate(&mut self, celebration: &Celebration);
}

impl<F> CelebrationSink for F
where
    F: FnMut(&Celebration),
{
    fn celebrate(&mut self, celebration: &Celebration) {
        self(celebration)
    }
}

#[derive(Debug, Default)]
pub struct ConsensusCelebrationTrigger {
    last_revealed: Option<bool>,
    fired: u64,
}

impl ConsensusCelebrationTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of celebrations fired so far.
    pub fn fired(&self) -> u64 {
        self.fired
    }

    /// Forget the last observed flag; the next observation is a baseline
    /// again. Used when a replica is replaced wholesale, e.g. on rejoin.
    pub fn reset_baseline(&mut self) {
        self.last_revealed = None;
    }

    /// Feed the latest shared state. Returns a celebration exactly when the
    /// reveal flag just went from false to true and the active voters agree.
    pub fn observe<'a, I>(&mut self, revealed: bool, estimates: &EstimateMap, active_ids: I) -> Option<Celebration>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let previous = self.last_revealed.replace(revealed);
        if previous != Some(false) || !revealed {
            return None;
        }

        let active: Vec<&str> = active_ids.into_iter().collect();
        let estimate = consensus(estimates, active.iter().copied())?;
        let voters = active.iter().filter(|id| estimates.get(id).is_some()).count();

        self.fired += 1;
        log::info!("Consensus on {estimate} among {voters} participants");
        Some(Celebration { estimate, voters })
    }

    /// Like [`observe`](Self::observe), forwarding a celebration to `sink`.
    pub fn observe_into<'a, I, S>(&mut self, revealed: bool, estimates: &EstimateMap, active_ids: I, sink: &mut S) -> bool
    where
        I: IntoIterator<Item = &'a str>,
        S: CelebrationSink + ?Sized,
    {
        match self.observe(revealed, estimates, active_ids) {
            Some(celebration) => {
                sink.celebrate(&celebration);
                true
            }
            None => false,
        }
    }
}
