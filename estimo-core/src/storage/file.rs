//! Directory-backed storage area.
//!
//! Each key maps to one file named after the hex encoding of the key, so
//! arbitrary key text never escapes the directory. Writes go to a sibling
//! temporary file first and are renamed into place, which keeps a reader
//! from ever observing half-written text.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use super::StorageMedium;
use crate::error::StorageError;

const ITEM_EXTENSION: &str = "json";
const PENDING_EXTENSION: &str = "pending";

#[derive(Debug, Clone)]
pub struct FileMedium {
    root: PathBuf,
}

impl FileMedium {
    /// Open (and create if needed) a storage directory.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        log::debug!("File storage medium opened at {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn item_path(&self, key: &str, extension: &str) -> PathBuf {
        let mut name = String::with_capacity(key.len() * 2 + extension.len() + 1);
        for byte in key.bytes() {
            name.push_str(&format!("{byte:02x}"));
        }
        name.push('.');
        name.push_str(extension);
        self.root.join(name)
    }
}

/// Inverse of the file naming: `None` for anything that is not one of ours.
fn key_from_file_name(name: &str) -> Option<String> {
    let stem = name.strip_suffix(ITEM_EXTENSION)?.strip_suffix('.')?;
    if stem.len() % 2 != 0 {
        return None;
    }
    let bytes = (0..stem.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(stem.get(i..i + 2)?, 16).ok())
        .collect::<Option<Vec<u8>>>()?;
    String::from_utf8(bytes).ok()
}

impl StorageMedium for FileMedium {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        match fs::read_to_string(self.item_path(key, ITEM_EXTENSION)) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let pending = self.item_path(key, PENDING_EXTENSION);
        fs::write(&pending, value)?;
        fs::rename(&pending, self.item_path(key, ITEM_EXTENSION))?;
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.item_path(key, ITEM_EXTENSION)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if let Some(key) = entry.file_name().to_str().and_then(key_from_file_name) {
                keys.push(key);
            }
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_medium_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let medium = FileMedium::open(dir.path().join("profile")).unwrap();

        assert_eq!(medium.get_item("estimo:identity").unwrap(), None);
        medium.set_item("estimo:identity", r#"{"id":"P1"}"#).unwrap();
        assert_eq!(
            medium.get_item("estimo:identity").unwrap().as_deref(),
            Some(r#"{"id":"P1"}"#)
        );

        medium.remove_item("estimo:identity").unwrap();
        assert_eq!(medium.get_item("estimo:identity").unwrap(), None);
    }

    #[test]
    fn test_file_medium_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let medium = FileMedium::open(dir.path()).unwrap();
            medium.set_item("k", "v").unwrap();
        }
        let reopened = FileMedium::open(dir.path()).unwrap();
        assert_eq!(reopened.get_item("k").unwrap().as_deref(), Some("v"));
    }

    #[test]
    fn test_file_medium_keys_do_not_escape_root() {
        let dir = tempfile::tempdir().unwrap();
        let medium = FileMedium::open(dir.path()).unwrap();
        medium.set_item("../outside", "x").unwrap();

        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(medium.get_item("../outside").unwrap().as_deref(), Some("x"));
    }

    #[test]
    fn test_file_medium_lists_keys() {
        let dir = tempfile::tempdir().unwrap();
        let medium = FileMedium::open(dir.path()).unwrap();
        medium.set_item("estimo:identity", "{}").unwrap();
        medium.set_item("../outside", "x").unwrap();
        fs::write(dir.path().join("notes.txt"), "not an item").unwrap();
        fs::write(dir.path().join("zz.json"), "bad hex").unwrap();

        let mut keys = medium.keys().unwrap();
        keys.sort();
        assert_eq!(keys, vec!["../outside".to_string(), "estimo:identity".to_string()]);
    }

    #[test]
    fn test_file_medium_remove_absent() {
        let dir = tempfile::tempdir().unwrap();
        let medium = FileMedium::open(dir.path()).unwrap();
        assert!(medium.remove_item("never-written").is_ok());
    }
}
