//! Change detection for media shared with other processes.
//!
//! Tabs of one [`crate::BrowserContext`] learn about each other's writes
//! over the bus. A second process opening the same directory has its own
//! bus, so its writes only show up by comparing the medium against what was
//! seen last time.

use std::collections::HashMap;

use super::StorageMedium;
use crate::error::StorageError;

/// The text of every key as last observed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediumSnapshot {
    items: HashMap<String, String>,
}

impl MediumSnapshot {
    /// Record the medium's current contents.
    pub fn capture(medium: &dyn StorageMedium) -> Result<Self, StorageError> {
        Ok(Self {
            items: Self::read_all(medium)?,
        })
    }

    fn read_all(medium: &dyn StorageMedium) -> Result<HashMap<String, String>, StorageError> {
        let mut items = HashMap::new();
        for key in medium.keys()? {
            // A key removed between listing and reading is simply absent
            if let Some(text) = medium.get_item(&key)? {
                items.insert(key, text);
            }
        }
        Ok(items)
    }

    /// Re-read the medium and return the keys that were added, changed or
    /// removed since the last capture.
    pub fn refresh(&mut self, medium: &dyn StorageMedium) -> Result<Vec<String>, StorageError> {
        let current = Self::read_all(medium)?;
        let mut changed: Vec<String> = current
            .iter()
            .filter(|(key, text)| self.items.get(*key) != Some(*text))
            .map(|(key, _)| key.clone())
            .collect();
        changed.extend(self.items.keys().filter(|key| !current.contains_key(*key)).cloned());
        changed.sort();
        self.items = current;
        Ok(changed)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryMedium;

    #[test]
    fn test_refresh_reports_added_changed_removed() {
        let medium = MemoryMedium::new();
        medium.set_item("kept", "1").unwrap();
        medium.set_item("changed", "1").unwrap();
        medium.set_item("removed", "1").unwrap();

        let mut snapshot = MediumSnapshot::capture(&medium).unwrap();
        assert_eq!(snapshot.len(), 3);

        medium.set_item("changed", "2").unwrap();
        medium.remove_item("removed").unwrap();
        medium.set_item("added", "1").unwrap();

        assert_eq!(snapshot.refresh(&medium).unwrap(), vec!["added", "changed", "removed"]);
        assert!(snapshot.refresh(&medium).unwrap().is_empty());
    }

    #[test]
    fn test_rewriting_same_text_is_not_a_change() {
        let medium = MemoryMedium::new();
        medium.set_item("k", "1").unwrap();
        let mut snapshot = MediumSnapshot::capture(&medium).unwrap();

        medium.set_item("k", "1").unwrap();
        assert!(snapshot.refresh(&medium).unwrap().is_empty());
    }
}
