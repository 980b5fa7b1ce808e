//! Write cache in front of a slower directory.
//!
//! Near-real-time reopens produce many small, short-lived files. The caching
//! directory keeps files that are small enough in RAM until they are synced,
//! and writes everything else straight through to the delegate.

use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;

use crate::error::{Result, ShardError};
use crate::storage::{Directory, DirectoryKind};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// RAM cache for small files layered over another [`Directory`].
#[derive(Debug)]
pub struct NrtCachingDirectory {
    delegate: Arc<dyn Directory>,
    max_file_bytes: usize,
    max_cached_bytes: usize,
    cache: RwLock<AHashMap<String, Arc<Vec<u8>>>>,
}

impl NrtCachingDirectory {
    /// Cache files up to `max_merge_size_mb`, holding at most `max_cached_mb` in total.
    pub fn new(delegate: Arc<dyn Directory>, max_merge_size_mb: f64, max_cached_mb: f64) -> Self {
        Self {
            delegate,
            max_file_bytes: (max_merge_size_mb * BYTES_PER_MB) as usize,
            max_cached_bytes: (max_cached_mb * BYTES_PER_MB) as usize,
            cache: RwLock::new(AHashMap::new()),
        }
    }

    pub fn delegate(&self) -> &Arc<dyn Directory> {
        &self.delegate
    }

    /// Names of the files currently held only in RAM.
    pub fn cached_files(&self) -> Vec<String> {
        self.cache.read().keys().cloned().collect()
    }

    pub fn cached_bytes(&self) -> usize {
        self.cache.read().values().map(|data| data.len()).sum()
    }

    fn should_cache(&self, cache: &AHashMap<String, Arc<Vec<u8>>>, len: usize) -> bool {
        if len > self.max_file_bytes {
            return false;
        }
        let held: usize = cache.values().map(|data| data.len()).sum();
        held + len <= self.max_cached_bytes
    }

    /// Move a cached file to the delegate.
    fn uncache(&self, name: &str) -> Result<()> {
        let data = self.cache.read().get(name).cloned();
        if let Some(data) = data {
            self.delegate.write_file(name, &data)?;
            self.cache.write().remove(name);
        }
        Ok(())
    }
}

impl Directory for NrtCachingDirectory {
    fn kind(&self) -> DirectoryKind {
        self.delegate.kind()
    }

    fn list_files(&self) -> Result<Vec<String>> {
        let mut names = self.delegate.list_files()?;
        let cache = self.cache.read();
        names.extend(
            cache
                .keys()
                .filter(|name| !self.delegate.file_exists(name))
                .cloned(),
        );
        Ok(names)
    }

    fn file_exists(&self, name: &str) -> bool {
        self.cache.read().contains_key(name) || self.delegate.file_exists(name)
    }

    fn read_file(&self, name: &str) -> Result<Vec<u8>> {
        if let Some(data) = self.cache.read().get(name) {
            return Ok(data.as_ref().clone());
        }
        self.delegate.read_file(name)
    }

    fn write_file(&self, name: &str, data: &[u8]) -> Result<()> {
        if self.delegate.is_closed() {
            return Err(ShardError::already_closed("caching directory"));
        }
        let mut cache = self.cache.write();
        if self.should_cache(&cache, data.len()) {
            log::debug!("Caching {name} ({} bytes) in RAM", data.len());
            cache.insert(name.to_string(), Arc::new(data.to_vec()));
            return Ok(());
        }
        cache.remove(name);
        drop(cache);
        self.delegate.write_file(name, data)
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        if self.cache.write().remove(name).is_some() {
            return Ok(());
        }
        self.delegate.delete_file(name)
    }

    fn sync(&self, names: &[String]) -> Result<()> {
        for name in names {
            self.uncache(name)?;
        }
        self.delegate.sync(names)
    }

    fn close(&self) -> Result<()> {
        // Anything still cached was never synced; keep it rather than dropping it.
        for name in self.cached_files() {
            self.uncache(&name)?;
        }
        self.delegate.close()
    }

    fn is_closed(&self) -> bool {
        self.delegate.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryDirectory;

    fn caching(max_merge_mb: f64, max_cached_mb: f64) -> (Arc<MemoryDirectory>, NrtCachingDirectory) {
        let delegate = Arc::new(MemoryDirectory::new());
        let dir = NrtCachingDirectory::new(delegate.clone(), max_merge_mb, max_cached_mb);
        (delegate, dir)
    }

    #[test]
    fn test_small_files_stay_cached_until_sync() {
        let (delegate, dir) = caching(1.0, 2.0);
        dir.write_file("seg_1", b"small").unwrap();

        assert!(dir.file_exists("seg_1"));
        assert!(!delegate.file_exists("seg_1"));
        assert_eq!(dir.list_files().unwrap(), vec!["seg_1".to_string()]);

        dir.sync(&["seg_1".to_string()]).unwrap();
        assert!(delegate.file_exists("seg_1"));
        assert!(dir.cached_files().is_empty());
        assert_eq!(dir.read_file("seg_1").unwrap(), b"small");
    }

    #[test]
    fn test_large_files_bypass_cache() {
        let (delegate, dir) = caching(0.000_01, 1.0);
        let data = vec![7u8; 64];
        dir.write_file("big", &data).unwrap();
        assert!(delegate.file_exists("big"));
        assert_eq!(dir.cached_bytes(), 0);
    }

    #[test]
    fn test_total_cache_budget_is_enforced() {
        // 100-byte budget, files of 60 bytes: only the first fits.
        let (delegate, dir) = caching(1.0, 100.0 / BYTES_PER_MB);
        dir.write_file("a", &[1u8; 60]).unwrap();
        dir.write_file("b", &[2u8; 60]).unwrap();
        assert_eq!(dir.cached_files(), vec!["a".to_string()]);
        assert!(delegate.file_exists("b"));
    }

    #[test]
    fn test_close_flushes_cache_and_closes_delegate() {
        let (delegate, dir) = caching(1.0, 1.0);
        dir.write_file("pending", b"x").unwrap();
        dir.close().unwrap();
        assert!(delegate.is_closed());
        assert!(dir.is_closed());
        assert!(dir.cached_files().is_empty());
    }
}
