//! Reconciliation core for estimo planning-poker rooms.
//!
//! ```text
//!  storage ─► browser/events ─► durable ─► identity ─┐
//!                                                     ├─► presence (reconciler)
//!  collab (yrs) ─► estimate / consensus / table ◄─────┘
//! ```
//!
//! Everything here is transport-agnostic: replication updates come in and go
//! out as opaque byte vectors, presence as plain structs.

pub mod browser;
pub mod codec;
pub mod collab;
pub mod consensus;
pub mod durable;
pub mod error;
pub mod estimate;
pub mod events;
pub mod identity;
pub mod names;
pub mod presence;
pub mod storage;
pub mod table;

pub use browser::{BrowserContext, ExecutionContext, Tab};
pub use codec::{Codec, JsonCodec};
pub use collab::{SharedEstimationState, SharedMutation, SharedSnapshot};
pub use consensus::{consensus, Celebration, CelebrationSink, ConsensusCelebrationTrigger};
pub use durable::{DurableValue, StoreOptions, WriteOutcome};
pub use error::{CodecError, EstimateError, SharedStateError, StorageError};
pub use estimate::{Estimate, EstimateMap, EstimateView};
pub use events::{BusEvent, CrossTabEventBus, Listener, NoticeSource, TabId};
pub use identity::{Identity, IdentityStore, IDENTITY_KEY};
pub use presence::{Presence, PresencePatch, PresenceReconciler, ReconcilePhase, Reconciliation};
pub use storage::{FileMedium, MediumSnapshot, MemoryMedium, StorageMedium};
pub use table::{ParticipantRow, TableView};
