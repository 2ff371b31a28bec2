//! Storage media backing durable values.
//!
//! A medium is the raw string-keyed, string-valued area shared by every tab
//! of one browser context. It knows nothing about codecs or notifications;
//! [`crate::browser::Tab`] layers the native change event on top and
//! [`crate::durable::DurableValue`] layers the codec and reactivity.
//!
//! ```text
//! DurableValue ──► Tab ──► StorageMedium (memory | file)
//!      ▲            │
//!      └── bus ◄────┘  storage event (other tabs only)
//! ```

pub mod file;
pub mod memory;
pub mod snapshot;

pub use file::FileMedium;
pub use memory::MemoryMedium;
pub use snapshot::MediumSnapshot;

use crate::error::StorageError;

/// A string key/value storage area.
///
/// Implementations must be safe to share between tabs of the same context.
pub trait StorageMedium: Send + Sync {
    /// Read the raw stored text for `key`, `None` when absent.
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Store `value` under `key`, replacing any previous text.
    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Remove `key`. Removing an absent key is not an error.
    fn remove_item(&self, key: &str) -> Result<(), StorageError>;

    /// Every key currently stored, in no particular order.
    fn keys(&self) -> Result<Vec<String>, StorageError>;
}
