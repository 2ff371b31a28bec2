//! Replicated estimation state on top of a yrs document.
//!
//! ```text
//!  Doc
//!   ├── "estimates": Map<participant id, label>
//!   └── "flags":     Map { "estimatesRevealed": bool }
//! ```
//!
//! Every local operation is one transaction and yields one v1 update to ship
//! to the other replicas. Conflict resolution between concurrent writers is
//! left to yrs; this type only defines the mutation vocabulary and how the
//! document is read back.

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Any, Doc, Map, Out, ReadTxn, StateVector, Transact, Update};

use crate::error::SharedStateError;
use crate::estimate::{Estimate, EstimateMap};

const ESTIMATES_MAP: &str = "estimates";
const FLAGS_MAP: &str = "flags";
const REVEALED_FLAG: &str = "estimatesRevealed";

impl From<yrs::encoding::read::Error> for SharedStateError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        SharedStateError::Replication(e.to_string())
    }
}

/// Read-only projection of the shared state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SharedSnapshot {
    pub estimates: EstimateMap,
    pub estimates_revealed: bool,
    /// Number of changes this replica has observed.
    pub version: u64,
}

/// One atomic operation on the shared state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SharedMutation {
    SetEstimate {
        participant_id: String,
        estimate: Estimate,
    },
    ClearEstimate {
        participant_id: String,
    },
    /// Replace the whole map with an empty one.
    ClearAll,
    SetRevealed(bool),
}

impl SharedMutation {
    fn validate(&self) -> Result<(), SharedStateError> {
        match self {
            SharedMutation::SetEstimate { participant_id, .. }
            | SharedMutation::ClearEstimate { participant_id } if participant_id.is_empty() => {
                Err(SharedStateError::EmptyParticipant)
            }
            _ => Ok(()),
        }
    }
}

/// One replica of the room's estimation state.
pub struct SharedEstimationState {
    doc: Doc,
    version: u64,
}

impl Default for SharedEstimationState {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedEstimationState {
    /// Empty state: no estimates, not revealed.
    pub fn new() -> Self {
        let doc = Doc::new();
        // Register both root types up front so no transaction has to.
        doc.get_or_insert_map(ESTIMATES_MAP);
        doc.get_or_insert_map(FLAGS_MAP);
        Self { doc, version: 0 }
    }

    /// A replica seeded from a full-state update.
    pub fn from_state(update: &[u8]) -> Result<Self, SharedStateError> {
        let mut state = Self::new();
        state.apply_remote(update)?;
        Ok(state)
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Apply `mutations` in order inside a single transaction and return the
    /// update to broadcast. Nothing is applied if any mutation is invalid.
    pub fn mutate(&mut self, mutations: &[SharedMutation]) -> Result<Vec<u8>, SharedStateError> {
        for m in mutations {
            m.validate()?;
        }

        let estimates = self.doc.get_or_insert_map(ESTIMATES_MAP);
        let flags = self.doc.get_or_insert_map(FLAGS_MAP);
        let mut txn = self.doc.transact_mut();

        for m in mutations {
            match m {
                SharedMutation::SetEstimate {
                    participant_id,
                    estimate,
                } => {
                    estimates.insert(&mut txn, participant_id.as_str(), estimate.as_str().to_string());
                }
                SharedMutation::ClearEstimate { participant_id } => {
                    estimates.remove(&mut txn, participant_id);
                }
                SharedMutation::ClearAll => estimates.clear(&mut txn),
                SharedMutation::SetRevealed(revealed) => {
                    flags.insert(&mut txn, REVEALED_FLAG, *revealed);
                }
            }
        }

        let update = txn.encode_update_v1();
        drop(txn);
        self.version += 1;
        log::trace!("Applied {} local mutations ({} byte update)", mutations.len(), update.len());
        Ok(update)
    }

    /// Validate a raw label and record it for `participant_id`.
    pub fn set_estimate(&mut self, participant_id: &str, label: &str) -> Result<Vec<u8>, SharedStateError> {
        let estimate: Estimate = label.parse()?;
        self.mutate(&[SharedMutation::SetEstimate {
            participant_id: participant_id.to_string(),
            estimate,
        }])
    }

    pub fn clear_estimate(&mut self, participant_id: &str) -> Result<Vec<u8>, SharedStateError> {
        self.mutate(&[SharedMutation::ClearEstimate {
            participant_id: participant_id.to_string(),
        }])
    }

    pub fn clear_all(&mut self) -> Result<Vec<u8>, SharedStateError> {
        self.mutate(&[SharedMutation::ClearAll])
    }

    pub fn set_revealed(&mut self, revealed: bool) -> Result<Vec<u8>, SharedStateError> {
        self.mutate(&[SharedMutation::SetRevealed(revealed)])
    }

    /// Hide everything and empty the map, atomically.
    pub fn new_round(&mut self) -> Result<Vec<u8>, SharedStateError> {
        self.mutate(&[SharedMutation::SetRevealed(false), SharedMutation::ClearAll])
    }

    /// Apply an update produced by another replica.
    pub fn apply_remote(&mut self, update: &[u8]) -> Result<(), SharedStateError> {
        let update = Update::decode_v1(update)?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| SharedStateError::Replication(e.to_string()))?;
        drop(txn);
        self.version += 1;
        Ok(())
    }

    /// Everything this replica knows, as one update.
    pub fn encode_state(&self) -> Vec<u8> {
        self.doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }

    pub fn state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    /// What a replica at `remote_state_vector` is missing.
    pub fn diff_since(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>, SharedStateError> {
        let sv = StateVector::decode_v1(remote_state_vector)?;
        Ok(self.doc.transact().encode_state_as_update_v1(&sv))
    }

    pub fn revealed(&self) -> bool {
        let flags = self.doc.get_or_insert_map(FLAGS_MAP);
        let txn = self.doc.transact();
        matches!(flags.get(&txn, REVEALED_FLAG), Some(Out::Any(Any::Bool(true))))
    }

    pub fn estimate_of(&self, participant_id: &str) -> Option<Estimate> {
        let estimates = self.doc.get_or_insert_map(ESTIMATES_MAP);
        let txn = self.doc.transact();
        match estimates.get(&txn, participant_id) {
            Some(Out::Any(Any::String(label))) => label.parse().ok(),
            _ => None,
        }
    }

    /// Current estimates and reveal flag. Entries that are not legal labels
    /// (written by a misbehaving remote) are skipped.
    pub fn snapshot(&self) -> SharedSnapshot {
        let estimates_ref = self.doc.get_or_insert_map(ESTIMATES_MAP);
        let flags = self.doc.get_or_insert_map(FLAGS_MAP);
        let txn = self.doc.transact();

        let mut estimates = EstimateMap::new();
        for (participant_id, value) in estimates_ref.iter(&txn) {
            let parsed = match &value {
                Out::Any(Any::String(label)) => label.parse::<Estimate>().ok(),
                _ => None,
            };
            match parsed {
                Some(estimate) => {
                    estimates.insert(participant_id, estimate);
                }
                None => log::warn!("Ignoring illegal estimate {value:?} for participant {participant_id}"),
            }
        }

        SharedSnapshot {
            estimates,
            estimates_revealed: matches!(
                flags.get(&txn, REVEALED_FLAG),
                Some(Out::Any(Any::Bool(true)))
            ),
            version: self.version,
        }
    }
}
