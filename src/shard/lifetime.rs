//! Searcher version cache.
//!
//! Lets a follow-up request (the next page of results, a drill-down) run
//! against the exact view an earlier request used. Each recorded version
//! holds one reference on its searcher until it is pruned or the cache is
//! closed.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::RwLock;

use crate::error::{Result, ShardError};
use crate::index::searcher::{SearcherAndTaxonomy, SearcherHandle};

/// Decides whether a cached searcher should be evicted.
pub trait Pruner: Send + Sync {
    /// `age_sec` is how long ago the next-newer version was recorded; the
    /// newest version always has age zero.
    fn do_prune(&self, age_sec: f64, searcher: &SearcherAndTaxonomy) -> bool;
}

/// Evicts versions superseded for longer than `max_age_sec`.
#[derive(Debug, Clone, Copy)]
pub struct PruneByAge {
    max_age_sec: f64,
}

impl PruneByAge {
    pub fn new(max_age_sec: f64) -> Self {
        Self { max_age_sec }
    }
}

impl Pruner for PruneByAge {
    fn do_prune(&self, age_sec: f64, _searcher: &SearcherAndTaxonomy) -> bool {
        age_sec > self.max_age_sec
    }
}

#[derive(Debug)]
struct Tracker {
    handle: SearcherHandle,
    recorded_at: Instant,
}

/// Cache of searchers keyed by version.
#[derive(Debug, Default)]
pub struct SearcherLifetimeManager {
    searchers: RwLock<BTreeMap<u64, Arc<Tracker>>>,
    closed: AtomicBool,
}

impl SearcherLifetimeManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache `handle` under its version and return the version as the token.
    ///
    /// Recording a version that is already cached returns the same token and
    /// takes no extra reference.
    pub fn record(&self, handle: &SearcherHandle) -> Result<u64> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ShardError::already_closed("searcher lifetime manager"));
        }
        let version = handle.version();
        let mut searchers = self.searchers.write();
        if searchers.contains_key(&version) {
            return Ok(version);
        }
        if !handle.try_inc_ref() {
            return Err(ShardError::already_closed(format!(
                "searcher version {version}"
            )));
        }
        searchers.insert(
            version,
            Arc::new(Tracker {
                handle: handle.clone(),
                recorded_at: Instant::now(),
            }),
        );
        log::debug!("Recorded searcher version {version}");
        Ok(version)
    }

    /// The cached searcher for `version`, with a new reference the caller
    /// must [`release`](Self::release). `None` once the version was pruned.
    pub fn acquire(&self, version: u64) -> Option<SearcherHandle> {
        let searchers = self.searchers.read();
        let tracker = searchers.get(&version)?;
        tracker
            .handle
            .try_inc_ref()
            .then(|| tracker.handle.clone())
    }

    pub fn release(&self, handle: SearcherHandle) -> Result<()> {
        handle.dec_ref()
    }

    pub fn contains(&self, version: u64) -> bool {
        self.searchers.read().contains_key(&version)
    }

    /// Cached versions, ascending.
    pub fn versions(&self) -> Vec<u64> {
        self.searchers.read().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.searchers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.searchers.read().is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Evict every version `pruner` selects. Returns the evicted versions.
    ///
    /// Decisions are made against a copy of the entries taken when the sweep
    /// starts, so a version recorded during the sweep is never evicted by it.
    pub fn prune(&self, pruner: &dyn Pruner) -> Result<Vec<u64>> {
        let trackers: Vec<(u64, Arc<Tracker>)> = self
            .searchers
            .read()
            .iter()
            .rev()
            .map(|(version, tracker)| (*version, tracker.clone()))
            .collect();

        let now = Instant::now();
        let mut newer_recorded_at: Option<Instant> = None;
        let mut evicted = Vec::new();
        for (version, tracker) in trackers {
            let age_sec = newer_recorded_at
                .map_or(0.0, |t| now.saturating_duration_since(t).as_secs_f64());
            if pruner.do_prune(age_sec, &tracker.handle) {
                let removed = {
                    let mut searchers = self.searchers.write();
                    match searchers.get(&version) {
                        Some(current) if Arc::ptr_eq(current, &tracker) => {
                            searchers.remove(&version)
                        }
                        _ => None,
                    }
                };
                if let Some(removed) = removed {
                    removed.handle.dec_ref()?;
                    evicted.push(version);
                }
            }
            newer_recorded_at = Some(tracker.recorded_at);
        }
        if !evicted.is_empty() {
            log::debug!("Pruned searcher versions {evicted:?}");
        }
        Ok(evicted)
    }

    /// Drop every cached reference. Later [`record`](Self::record) calls fail.
    pub fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        let trackers = std::mem::take(&mut *self.searchers.write());
        let mut first_error = None;
        for tracker in trackers.into_values() {
            if let Err(e) = tracker.handle.dec_ref() {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Document;
    use crate::index::searcher::IndexSearcher;
    use std::thread;
    use std::time::Duration;

    fn handle(version: u64, docs: usize) -> SearcherHandle {
        let docs = (0..docs).map(|_| Arc::new(Document::new())).collect();
        SearcherAndTaxonomy::new(IndexSearcher::new(version, None, Arc::new(docs)), None)
    }

    struct PruneVersions(Vec<u64>);

    impl Pruner for PruneVersions {
        fn do_prune(&self, _age_sec: f64, searcher: &SearcherAndTaxonomy) -> bool {
            self.0.contains(&searcher.version())
        }
    }

    #[test]
    fn test_record_and_acquire_same_view() {
        let cache = SearcherLifetimeManager::new();
        let original = handle(3, 2);
        assert_eq!(cache.record(&original).unwrap(), 3);
        assert_eq!(cache.record(&original).unwrap(), 3);
        assert_eq!(original.ref_count(), 2);

        let again = cache.acquire(3).unwrap();
        assert!(Arc::ptr_eq(&again, &original));
        assert_eq!(again.searcher().num_docs().unwrap(), 2);
        cache.release(again).unwrap();
        assert!(cache.acquire(4).is_none());
    }

    #[test]
    fn test_pruned_version_is_not_found_and_freed() {
        let cache = SearcherLifetimeManager::new();
        let old = handle(1, 1);
        cache.record(&old).unwrap();
        old.dec_ref().unwrap();

        assert_eq!(cache.prune(&PruneVersions(vec![1])).unwrap(), vec![1]);
        assert!(cache.acquire(1).is_none());
        assert!(old.searcher().is_closed());
    }

    #[test]
    fn test_age_measured_from_newer_version() {
        let cache = SearcherLifetimeManager::new();
        cache.record(&handle(1, 0)).unwrap();
        thread::sleep(Duration::from_millis(30));
        cache.record(&handle(2, 0)).unwrap();
        thread::sleep(Duration::from_millis(30));

        // The newest version has age zero, the older one about 30ms.
        assert!(cache.prune(&PruneByAge::new(10.0)).unwrap().is_empty());
        assert_eq!(cache.prune(&PruneByAge::new(0.01)).unwrap(), vec![1]);
        assert_eq!(cache.prune(&PruneByAge::new(0.0)).unwrap(), Vec::<u64>::new());
        assert_eq!(cache.versions(), vec![2]);
    }

    /// Records a new version and reacquires an old one from inside the sweep.
    struct RecordDuringSweep<'a> {
        cache: &'a SearcherLifetimeManager,
        newer: SearcherHandle,
        held: parking_lot::Mutex<Option<SearcherHandle>>,
    }

    impl Pruner for RecordDuringSweep<'_> {
        fn do_prune(&self, _age_sec: f64, _searcher: &SearcherAndTaxonomy) -> bool {
            let mut held = self.held.lock();
            if held.is_none() {
                self.cache.record(&self.newer).unwrap();
                *held = self.cache.acquire(2);
            }
            true
        }
    }

    #[test]
    fn test_version_recorded_during_prune_survives() {
        let cache = SearcherLifetimeManager::new();
        for version in [1, 2] {
            let h = handle(version, 1);
            cache.record(&h).unwrap();
            h.dec_ref().unwrap();
        }

        let pruner = RecordDuringSweep {
            cache: &cache,
            newer: handle(3, 4),
            held: parking_lot::Mutex::new(None),
        };
        assert_eq!(cache.prune(&pruner).unwrap(), vec![2, 1]);
        assert_eq!(cache.versions(), vec![3]);

        let newer = cache.acquire(3).unwrap();
        assert_eq!(newer.searcher().num_docs().unwrap(), 4);
        cache.release(newer).unwrap();

        // Evicted while held: readable until the holder lets go.
        let held = pruner.held.lock().take().unwrap();
        assert_eq!(held.version(), 2);
        assert_eq!(held.searcher().num_docs().unwrap(), 1);
        held.dec_ref().unwrap();
        assert!(held.searcher().is_closed());
    }

    #[test]
    fn test_close_releases_everything() {
        let cache = SearcherLifetimeManager::new();
        let h = handle(1, 0);
        cache.record(&h).unwrap();
        h.dec_ref().unwrap();
        cache.close().unwrap();

        assert!(h.searcher().is_closed());
        assert!(cache.is_empty());
        assert!(cache.is_closed());
        assert!(matches!(
            cache.record(&handle(2, 0)),
            Err(ShardError::AlreadyClosed(_))
        ));
    }
}
