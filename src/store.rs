// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

//! Storage of the state blobs of TPM instances.

use crate::error::StoreError;
use log::{debug, warn};
use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
};

/// Backend holding named blobs per instance.
pub trait NvramStore {
    /// Returns the blob, or `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns a `StoreError` if the blob exists but cannot be read.
    fn load(&self, instance_id: &str, name: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Replaces the blob.
    ///
    /// # Errors
    ///
    /// Returns a `StoreError` if the blob cannot be written.
    fn store(&mut self, instance_id: &str, name: &str, data: &[u8]) -> Result<(), StoreError>;

    /// Removes the blob.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if `must_exist` is set and there is no blob, or
    /// another `StoreError` if it cannot be removed.
    fn delete(&mut self, instance_id: &str, name: &str, must_exist: bool)
        -> Result<(), StoreError>;
}

fn check_name(name: &str) -> Result<(), StoreError> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidName(name.to_string()))
    }
}

/// Blobs as files in one directory per instance. Writes go to a temporary
/// file that is renamed over the blob.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, instance_id: &str, name: &str) -> Result<PathBuf, StoreError> {
        check_name(instance_id)?;
        check_name(name)?;
        Ok(self.root.join(instance_id).join(name))
    }
}

fn file_error(path: &Path, e: io::Error) -> StoreError {
    StoreError::File(path.display().to_string(), e)
}

impl NvramStore for FileStore {
    fn load(&self, instance_id: &str, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.path(instance_id, name)?;
        match fs::read(&path) {
            Ok(data) => {
                debug!("{}: {} bytes", path.display(), data.len());
                Ok(Some(data))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(file_error(&path, e)),
        }
    }

    fn store(&mut self, instance_id: &str, name: &str, data: &[u8]) -> Result<(), StoreError> {
        let path = self.path(instance_id, name)?;
        let dir = self.root.join(instance_id);
        fs::create_dir_all(&dir).map_err(|e| file_error(&dir, e))?;
        let tmp = dir.join(format!(".{name}.tmp"));
        fs::write(&tmp, data).map_err(|e| file_error(&tmp, e))?;
        if let Err(e) = fs::rename(&tmp, &path) {
            if let Err(e) = fs::remove_file(&tmp) {
                warn!("{}: {e}", tmp.display());
            }
            return Err(file_error(&path, e));
        }
        debug!("{}: stored {} bytes", path.display(), data.len());
        Ok(())
    }

    fn delete(
        &mut self,
        instance_id: &str,
        name: &str,
        must_exist: bool,
    ) -> Result<(), StoreError> {
        let path = self.path(instance_id, name)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if must_exist {
                    Err(StoreError::NotFound(path.display().to_string()))
                } else {
                    Ok(())
                }
            }
            Err(e) => Err(file_error(&path, e)),
        }
    }
}

/// Blobs kept in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    blobs: HashMap<(String, String), Vec<u8>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl NvramStore for MemoryStore {
    fn load(&self, instance_id: &str, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        check_name(name)?;
        Ok(self
            .blobs
            .get(&(instance_id.to_string(), name.to_string()))
            .cloned())
    }

    fn store(&mut self, instance_id: &str, name: &str, data: &[u8]) -> Result<(), StoreError> {
        check_name(name)?;
        self.blobs
            .insert((instance_id.to_string(), name.to_string()), data.to_vec());
        Ok(())
    }

    fn delete(
        &mut self,
        instance_id: &str,
        name: &str,
        must_exist: bool,
    ) -> Result<(), StoreError> {
        check_name(name)?;
        let removed = self
            .blobs
            .remove(&(instance_id.to_string(), name.to_string()));
        if removed.is_none() && must_exist {
            return Err(StoreError::NotFound(format!("{instance_id}/{name}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store() {
        let mut store = MemoryStore::new();
        assert_eq!(store.load("0", "tpm2-permall").unwrap(), None);
        store.store("0", "tpm2-permall", b"abc").unwrap();
        assert_eq!(store.load("0", "tpm2-permall").unwrap(), Some(b"abc".to_vec()));
        assert_eq!(store.load("1", "tpm2-permall").unwrap(), None);
        store.delete("0", "tpm2-permall", true).unwrap();
        assert!(matches!(
            store.delete("0", "tpm2-permall", true),
            Err(StoreError::NotFound(_))
        ));
        store.delete("0", "tpm2-permall", false).unwrap();
    }

    #[test]
    fn test_invalid_names() {
        for name in ["", "../x", ".hidden", "a/b"] {
            assert!(matches!(check_name(name), Err(StoreError::InvalidName(_))));
        }
    }
}
