//! Point-in-time views of an index.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;

use crate::data::{Document, Term};
use crate::error::{Result, ShardError};
use crate::index::taxonomy::TaxonomyReader;

/// Frozen set of documents visible at one version.
///
/// The document set is dropped when the owning [`SearcherAndTaxonomy`] loses
/// its last reference; any access after that fails with
/// [`ShardError::AlreadyClosed`].
#[derive(Debug)]
pub struct IndexSearcher {
    version: u64,
    generation: Option<u64>,
    docs: RwLock<Option<Arc<Vec<Arc<Document>>>>>,
}

impl IndexSearcher {
    pub fn new(version: u64, generation: Option<u64>, docs: Arc<Vec<Arc<Document>>>) -> Self {
        Self {
            version,
            generation,
            docs: RwLock::new(Some(docs)),
        }
    }

    /// Version of the view.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Latest commit generation included in the view, if any.
    pub fn generation(&self) -> Option<u64> {
        self.generation
    }

    pub fn documents(&self) -> Result<Arc<Vec<Arc<Document>>>> {
        self.docs
            .read()
            .clone()
            .ok_or_else(|| ShardError::already_closed(format!("searcher version {}", self.version)))
    }

    pub fn num_docs(&self) -> Result<usize> {
        Ok(self.documents()?.len())
    }

    pub fn doc(&self, index: usize) -> Result<Option<Arc<Document>>> {
        Ok(self.documents()?.get(index).cloned())
    }

    /// Number of documents holding `term`.
    pub fn count(&self, term: &Term) -> Result<usize> {
        Ok(self.documents()?.iter().filter(|d| term.matches(d)).count())
    }

    /// Documents holding `term`, in index order.
    pub fn find(&self, term: &Term) -> Result<Vec<Arc<Document>>> {
        Ok(self
            .documents()?
            .iter()
            .filter(|d| term.matches(d))
            .cloned()
            .collect())
    }

    pub fn is_closed(&self) -> bool {
        self.docs.read().is_none()
    }

    fn free(&self) {
        self.docs.write().take();
    }
}

/// A searcher and the taxonomy reader opened alongside it.
///
/// Both carry the same version so facet ordinals found in the searcher's
/// documents always resolve in the taxonomy. Holds an explicit reference
/// count starting at one; the view is freed when it reaches zero.
#[derive(Debug)]
pub struct SearcherAndTaxonomy {
    searcher: IndexSearcher,
    taxonomy: Option<TaxonomyReader>,
    ref_count: AtomicUsize,
}

/// Shared, reference-counted point-in-time view.
pub type SearcherHandle = Arc<SearcherAndTaxonomy>;

impl SearcherAndTaxonomy {
    pub fn new(searcher: IndexSearcher, taxonomy: Option<TaxonomyReader>) -> SearcherHandle {
        Arc::new(Self {
            searcher,
            taxonomy,
            ref_count: AtomicUsize::new(1),
        })
    }

    pub fn searcher(&self) -> &IndexSearcher {
        &self.searcher
    }

    pub fn taxonomy(&self) -> Option<&TaxonomyReader> {
        self.taxonomy.as_ref()
    }

    pub fn version(&self) -> u64 {
        self.searcher.version()
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Take a reference unless the view has already been freed.
    pub fn try_inc_ref(&self) -> bool {
        let mut current = self.ref_count.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return false;
            }
            match self.ref_count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Drop a reference, freeing the view when it was the last one.
    pub fn dec_ref(&self) -> Result<()> {
        let mut current = self.ref_count.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return Err(ShardError::internal(format!(
                    "searcher version {} released more times than acquired",
                    self.version()
                )));
            }
            match self.ref_count.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        if current == 1 {
            log::debug!("Freeing searcher version {}", self.version());
            self.searcher.free();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(docs: &[&str]) -> SearcherHandle {
        let docs = docs
            .iter()
            .map(|t| Arc::new(Document::new().add_text("title", *t)))
            .collect();
        SearcherAndTaxonomy::new(IndexSearcher::new(5, Some(1), Arc::new(docs)), None)
    }

    #[test]
    fn test_counts_terms() {
        let handle = handle(&["a", "b", "a"]);
        let searcher = handle.searcher();
        assert_eq!(searcher.num_docs().unwrap(), 3);
        assert_eq!(searcher.count(&Term::new("title", "a")).unwrap(), 2);
        assert_eq!(searcher.find(&Term::new("title", "b")).unwrap().len(), 1);
        assert_eq!(handle.version(), 5);
    }

    #[test]
    fn test_view_freed_at_zero_references() {
        let handle = handle(&["a"]);
        assert!(handle.try_inc_ref());
        assert_eq!(handle.ref_count(), 2);

        handle.dec_ref().unwrap();
        assert!(!handle.searcher().is_closed());
        handle.dec_ref().unwrap();
        assert!(handle.searcher().is_closed());

        assert!(!handle.try_inc_ref());
        assert!(matches!(
            handle.searcher().num_docs(),
            Err(ShardError::AlreadyClosed(_))
        ));
        assert!(matches!(handle.dec_ref(), Err(ShardError::Internal(_))));
    }
}
