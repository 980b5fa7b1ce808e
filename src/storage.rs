//! Directory abstraction used by the index and taxonomy writers.
//!
//! A [`Directory`] is a flat namespace of immutable files. Writers create a
//! file once with [`Directory::write_file`], make it durable with
//! [`Directory::sync`], and delete it when no commit references it anymore.
//!
//! Directories are opened through a [`DirectoryFactory`]; [`StorageFactory`]
//! is the standard implementation driven by [`StorageConfig`].

pub mod caching;
pub mod file;
pub mod memory;

use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::storage::file::{FileStorageConfig, FsDirectory};
use crate::storage::memory::MemoryDirectory;

/// Physical backing of a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryKind {
    Memory,
    File,
    Mmap,
}

/// A flat namespace of write-once files.
pub trait Directory: Send + Sync + Debug {
    /// Physical backing of this directory.
    fn kind(&self) -> DirectoryKind;

    /// List every file name, in no particular order.
    fn list_files(&self) -> Result<Vec<String>>;

    fn file_exists(&self, name: &str) -> bool;

    /// Read the full contents of a file.
    fn read_file(&self, name: &str) -> Result<Vec<u8>>;

    /// Create (or replace) a file with the given contents.
    fn write_file(&self, name: &str, data: &[u8]) -> Result<()>;

    fn delete_file(&self, name: &str) -> Result<()>;

    /// Make the named files durable.
    fn sync(&self, names: &[String]) -> Result<()>;

    /// Release the directory. Further use is an error.
    fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;
}

/// Opens the directories a shard stores its index and taxonomy in.
///
/// `path` is `None` for ephemeral shards that have no root directory.
pub trait DirectoryFactory: Send + Sync + Debug {
    fn open(&self, path: Option<&Path>) -> Result<Arc<dyn Directory>>;
}

/// Storage backend configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageConfig {
    /// Keep every file in RAM.
    #[default]
    Memory,
    /// Store files under the shard's root directory.
    File(FileStorageConfig),
}

/// Standard [`DirectoryFactory`] driven by a [`StorageConfig`].
///
/// File storage without a path (ephemeral shards) falls back to memory.
#[derive(Debug, Clone, Default)]
pub struct StorageFactory {
    config: StorageConfig,
}

impl StorageFactory {
    pub fn new(config: StorageConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }
}

impl DirectoryFactory for StorageFactory {
    fn open(&self, path: Option<&Path>) -> Result<Arc<dyn Directory>> {
        match (&self.config, path) {
            (StorageConfig::File(file_config), Some(path)) => {
                Ok(Arc::new(FsDirectory::open(path, file_config.clone())?))
            }
            _ => Ok(Arc::new(MemoryDirectory::new())),
        }
    }
}

/// Name of the file holding generation `generation` for `prefix`, e.g. `segments_3`.
pub fn file_name_from_generation(prefix: &str, generation: u64) -> String {
    format!("{prefix}_{generation}")
}

/// Parse the generation out of a file named by [`file_name_from_generation`].
pub fn parse_generation(prefix: &str, name: &str) -> Option<u64> {
    name.strip_prefix(prefix)?
        .strip_prefix('_')?
        .parse::<u64>()
        .ok()
}

/// Generations of every `prefix_<n>` file in `directory`, ascending.
pub fn list_generations(directory: &dyn Directory, prefix: &str) -> Result<Vec<u64>> {
    let mut generations: Vec<u64> = directory
        .list_files()?
        .iter()
        .filter_map(|name| parse_generation(prefix, name))
        .collect();
    generations.sort_unstable();
    Ok(generations)
}
