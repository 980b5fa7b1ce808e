//! RAM-resident directory.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use ahash::AHashMap;
use parking_lot::RwLock;

use crate::error::{Result, ShardError};
use crate::storage::{Directory, DirectoryKind};

/// Directory that keeps every file in memory. Contents are lost on drop.
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    files: RwLock<AHashMap<String, Arc<Vec<u8>>>>,
    closed: AtomicBool,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total bytes held.
    pub fn size_in_bytes(&self) -> usize {
        self.files.read().values().map(|data| data.len()).sum()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ShardError::already_closed("memory directory"));
        }
        Ok(())
    }
}

impl Directory for MemoryDirectory {
    fn kind(&self) -> DirectoryKind {
        DirectoryKind::Memory
    }

    fn list_files(&self) -> Result<Vec<String>> {
        self.ensure_open()?;
        Ok(self.files.read().keys().cloned().collect())
    }

    fn file_exists(&self, name: &str) -> bool {
        self.files.read().contains_key(name)
    }

    fn read_file(&self, name: &str) -> Result<Vec<u8>> {
        self.ensure_open()?;
        self.files
            .read()
            .get(name)
            .map(|data| data.as_ref().clone())
            .ok_or_else(|| ShardError::not_found(format!("file {name}")))
    }

    fn write_file(&self, name: &str, data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.files
            .write()
            .insert(name.to_string(), Arc::new(data.to_vec()));
        Ok(())
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        match self.files.write().remove(name) {
            Some(_) => Ok(()),
            None => Err(ShardError::not_found(format!("file {name}"))),
        }
    }

    fn sync(&self, _names: &[String]) -> Result<()> {
        self.ensure_open()
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read_delete() {
        let dir = MemoryDirectory::new();
        dir.write_file("a", b"hello").unwrap();
        assert!(dir.file_exists("a"));
        assert_eq!(dir.read_file("a").unwrap(), b"hello");
        assert_eq!(dir.size_in_bytes(), 5);

        dir.delete_file("a").unwrap();
        assert!(!dir.file_exists("a"));
        assert!(matches!(
            dir.read_file("a"),
            Err(ShardError::NotFound(_))
        ));
    }

    #[test]
    fn test_closed_directory_rejects_io() {
        let dir = MemoryDirectory::new();
        dir.close().unwrap();
        assert!(dir.is_closed());
        assert!(dir.write_file("a", b"x").is_err());
        assert!(dir.list_files().is_err());
    }
}
