//! Estimate labels, the estimate map and per-viewer visibility.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::EstimateError;

/// One card from the fixed deck. `/` means "pass" or "unsure".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Estimate {
    #[serde(rename = "/")]
    Pass,
    #[serde(rename = "0")]
    Zero,
    #[serde(rename = "1")]
    One,
    #[serde(rename = "2")]
    Two,
    #[serde(rename = "3")]
    Three,
    #[serde(rename = "5")]
    Five,
    #[serde(rename = "8")]
    Eight,
    #[serde(rename = "13")]
    Thirteen,
}

impl Estimate {
    /// The whole deck in display order.
    pub const ALL: [Estimate; 8] = [
        Estimate::Pass,
        Estimate::Zero,
        Estimate::One,
        Estimate::Two,
        Estimate::Three,
        Estimate::Five,
        Estimate::Eight,
        Estimate::Thirteen,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Estimate::Pass => "/",
            Estimate::Zero => "0",
            Estimate::One => "1",
            Estimate::Two => "2",
            Estimate::Three => "3",
            Estimate::Five => "5",
            Estimate::Eight => "8",
            Estimate::Thirteen => "13",
        }
    }
}

impl FromStr for Estimate {
    type Err = EstimateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Estimate::ALL
            .iter()
            .copied()
            .find(|e| e.as_str() == s)
            .ok_or_else(|| EstimateError::IllegalLabel(s.to_string()))
    }
}

impl fmt::Display for Estimate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Participant id → estimate. Absent key means no estimate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EstimateMap(BTreeMap<String, Estimate>);

impl EstimateMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, participant_id: &str) -> Option<Estimate> {
        self.0.get(participant_id).copied()
    }

    pub fn insert(&mut self, participant_id: impl Into<String>, estimate: Estimate) -> Option<Estimate> {
        self.0.insert(participant_id.into(), estimate)
    }

    pub fn remove(&mut self, participant_id: &str) -> Option<Estimate> {
        self.0.remove(participant_id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Estimate)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// What `viewer` is allowed to see of `subject`'s entry.
    pub fn view_for(&self, viewer: &str, subject: &str, revealed: bool) -> EstimateView {
        match self.get(subject) {
            None => EstimateView::NotSubmitted,
            Some(estimate) if revealed || viewer == subject => EstimateView::Visible(estimate),
            Some(_) => EstimateView::Hidden,
        }
    }
}

impl FromIterator<(String, Estimate)> for EstimateMap {
    fn from_iter<I: IntoIterator<Item = (String, Estimate)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// An entry as seen by one viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstimateView {
    NotSubmitted,
    /// Submitted but not yet revealed.
    Hidden,
    Visible(Estimate),
}

impl fmt::Display for EstimateView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EstimateView::NotSubmitted => f.write_str("…"),
            EstimateView::Hidden => f.write_str("?"),
            EstimateView::Visible(e) => write!(f, "{e}"),
        }
    }
}
