//! Filesystem-backed directory, optionally reading through memory maps.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use memmap2::Mmap;
use serde::{Deserialize, Serialize};

use crate::error::{Result, ShardError};
use crate::storage::{Directory, DirectoryKind};

/// Configuration for [`FsDirectory`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStorageConfig {
    /// Read files through `mmap` instead of buffered reads.
    #[serde(default)]
    pub use_mmap: bool,
}

impl FileStorageConfig {
    pub fn mmap() -> Self {
        Self { use_mmap: true }
    }
}

/// Directory stored as plain files under `root`.
///
/// Files are written to a temporary name and renamed into place, so a reader
/// never observes a partially written file.
#[derive(Debug)]
pub struct FsDirectory {
    root: PathBuf,
    config: FileStorageConfig,
    closed: AtomicBool,
}

impl FsDirectory {
    /// Open (creating if needed) the directory at `root`.
    pub fn open(root: impl AsRef<Path>, config: FileStorageConfig) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            config,
            closed: AtomicBool::new(false),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ShardError::already_closed(format!(
                "directory {}",
                self.root.display()
            )));
        }
        Ok(())
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn read_mapped(path: &Path) -> Result<Vec<u8>> {
        let file = File::open(path)?;
        if file.metadata()?.len() == 0 {
            return Ok(Vec::new());
        }
        // SAFETY: files are write-once (written under a temp name, then
        // renamed), so the mapped bytes are never modified underneath us.
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(mmap.to_vec())
    }
}

impl Directory for FsDirectory {
    fn kind(&self) -> DirectoryKind {
        if self.config.use_mmap {
            DirectoryKind::Mmap
        } else {
            DirectoryKind::File
        }
    }

    fn list_files(&self) -> Result<Vec<String>> {
        self.ensure_open()?;
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with('.') {
                    names.push(name.to_string());
                }
            }
        }
        Ok(names)
    }

    fn file_exists(&self, name: &str) -> bool {
        self.path(name).is_file()
    }

    fn read_file(&self, name: &str) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let path = self.path(name);
        if !path.is_file() {
            return Err(ShardError::not_found(format!("file {}", path.display())));
        }
        if self.config.use_mmap {
            Self::read_mapped(&path)
        } else {
            Ok(fs::read(&path)?)
        }
    }

    fn write_file(&self, name: &str, data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let tmp = self.path(&format!(".{name}.{}.tmp", uuid::Uuid::new_v4()));
        {
            let mut file = File::create(&tmp)?;
            file.write_all(data)?;
            file.flush()?;
        }
        if let Err(e) = fs::rename(&tmp, self.path(name)) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        match fs::remove_file(self.path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ShardError::not_found(format!("file {name}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn sync(&self, names: &[String]) -> Result<()> {
        self.ensure_open()?;
        for name in names {
            File::open(self.path(name))?.sync_all()?;
        }
        // Persist the renames themselves. Not supported on every platform.
        #[cfg(unix)]
        File::open(&self.root)?.sync_all()?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
