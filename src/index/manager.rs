//! Reference managers hand out the current searcher and swap in new ones.

use std::fmt::Debug;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::{Result, ShardError};
use crate::index::searcher::{SearcherAndTaxonomy, SearcherHandle};
use crate::index::taxonomy::DirectoryTaxonomyWriter;
use crate::index::writer::IndexWriter;

/// Source of the current point-in-time view.
///
/// Every handle returned by [`acquire`](ReferenceManager::acquire) must be
/// given back through [`release`](ReferenceManager::release).
pub trait ReferenceManager: Send + Sync + Debug {
    fn acquire(&self) -> Result<SearcherHandle>;

    fn release(&self, handle: SearcherHandle) -> Result<()>;

    /// Refresh unless another refresh is already running. Returns whether a
    /// new view was installed.
    fn maybe_refresh(&self) -> Result<bool>;

    /// Refresh, waiting for any concurrent refresh to finish first.
    fn maybe_refresh_blocking(&self) -> Result<()>;

    /// Version of the view [`acquire`](ReferenceManager::acquire) currently returns.
    fn current_version(&self) -> Result<u64>;

    fn close(&self) -> Result<()>;
}

/// Manages a searcher over a writer's live documents together with the
/// taxonomy reader matching it.
#[derive(Debug)]
pub struct SearcherTaxonomyManager {
    writer: Arc<dyn IndexWriter>,
    taxonomy: Option<Arc<DirectoryTaxonomyWriter>>,
    current: RwLock<Option<SearcherHandle>>,
    refresh_lock: Mutex<()>,
}

impl SearcherTaxonomyManager {
    pub fn new(
        writer: Arc<dyn IndexWriter>,
        taxonomy: Option<Arc<DirectoryTaxonomyWriter>>,
    ) -> Result<Self> {
        let initial = Self::open_view(writer.as_ref(), taxonomy.as_deref())?;
        Ok(Self {
            writer,
            taxonomy,
            current: RwLock::new(Some(initial)),
            refresh_lock: Mutex::new(()),
        })
    }

    // The index view is opened before the taxonomy reader, so every ordinal
    // the view references already exists in the reader.
    fn open_view(
        writer: &dyn IndexWriter,
        taxonomy: Option<&DirectoryTaxonomyWriter>,
    ) -> Result<SearcherHandle> {
        let searcher = writer.open_view()?;
        let taxonomy = taxonomy.map(DirectoryTaxonomyWriter::reader);
        Ok(SearcherAndTaxonomy::new(searcher, taxonomy))
    }

    fn refresh_if_needed(&self) -> Result<bool> {
        let current_version = self.current_version()?;
        if self.writer.version() == current_version {
            return Ok(false);
        }
        let fresh = Self::open_view(self.writer.as_ref(), self.taxonomy.as_deref())?;
        let version = fresh.version();
        let old = {
            let mut current = self.current.write();
            if current.is_none() {
                drop(current);
                fresh.dec_ref()?;
                return Err(ShardError::already_closed("searcher manager"));
            }
            current.replace(fresh)
        };
        if let Some(old) = old {
            old.dec_ref()?;
        }
        log::debug!("Refreshed searcher from version {current_version} to {version}");
        Ok(true)
    }
}

impl ReferenceManager for SearcherTaxonomyManager {
    fn acquire(&self) -> Result<SearcherHandle> {
        loop {
            let handle = self
                .current
                .read()
                .clone()
                .ok_or_else(|| ShardError::already_closed("searcher manager"))?;
            if handle.try_inc_ref() {
                return Ok(handle);
            }
            // Swapped out and freed between the read and the increment; retry
            // against the replacement.
        }
    }

    fn release(&self, handle: SearcherHandle) -> Result<()> {
        handle.dec_ref()
    }

    fn maybe_refresh(&self) -> Result<bool> {
        match self.refresh_lock.try_lock() {
            Some(_guard) => self.refresh_if_needed(),
            None => Ok(false),
        }
    }

    fn maybe_refresh_blocking(&self) -> Result<()> {
        let _guard = self.refresh_lock.lock();
        self.refresh_if_needed().map(|_| ())
    }

    fn current_version(&self) -> Result<u64> {
        self.current
            .read()
            .as_ref()
            .map(|handle| handle.version())
            .ok_or_else(|| ShardError::already_closed("searcher manager"))
    }

    fn close(&self) -> Result<()> {
        let _guard = self.refresh_lock.lock();
        match self.current.write().take() {
            Some(handle) => handle.dec_ref(),
            None => Ok(()),
        }
    }
}
