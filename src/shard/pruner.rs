//! Background eviction of expired searcher versions.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::IndexState;
use crate::error::{Result, ShardError};
use crate::index::searcher::SearcherAndTaxonomy;
use crate::shard::lifetime::{PruneByAge, Pruner, SearcherLifetimeManager};
use crate::shard::snapshot::SnapshotRegistry;
use crate::util::shutdown::ShutdownSignal;

/// Age-based pruning that never evicts a pinned version.
#[derive(Debug, Clone)]
pub struct SnapshotAwarePruner {
    pinned: BTreeSet<u64>,
    by_age: PruneByAge,
}

impl SnapshotAwarePruner {
    pub fn new(pinned: BTreeSet<u64>, max_age_sec: f64) -> Self {
        Self {
            pinned,
            by_age: PruneByAge::new(max_age_sec),
        }
    }
}

impl Pruner for SnapshotAwarePruner {
    fn do_prune(&self, age_sec: f64, searcher: &SearcherAndTaxonomy) -> bool {
        !self.pinned.contains(&searcher.version()) && self.by_age.do_prune(age_sec, searcher)
    }
}

/// One pruning sweep with the current live settings and pinned versions.
pub fn prune_once(
    index: &IndexState,
    lifetime: &SearcherLifetimeManager,
    snapshots: &SnapshotRegistry,
) -> Result<Vec<u64>> {
    let max_age_sec = index.live_settings().max_searcher_age_sec;
    lifetime.prune(&SnapshotAwarePruner::new(snapshots.versions(), max_age_sec))
}

/// Thread running [`prune_once`] every `pruner_interval_ms`.
///
/// Stops when its signal fires (index shutdown, shard close, or
/// [`close`](Self::close)) or once the version cache has been closed.
#[derive(Debug)]
pub struct SearcherPruner {
    signal: ShutdownSignal,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SearcherPruner {
    pub fn start(
        shard_name: &str,
        index: Arc<IndexState>,
        lifetime: Arc<SearcherLifetimeManager>,
        snapshots: Arc<SnapshotRegistry>,
        parent: &ShutdownSignal,
    ) -> Result<Self> {
        let signal = parent.child();
        let interval = Duration::from_millis(index.settings().pruner_interval_ms);
        let loop_signal = signal.clone();
        let name = shard_name.to_string();
        let handle = thread::Builder::new()
            .name(format!("iris-shard-pruner-{shard_name}"))
            .spawn(move || {
                log::debug!("Searcher pruner for {name} started");
                while !loop_signal.wait_timeout(interval) {
                    if lifetime.is_closed() {
                        break;
                    }
                    if let Err(e) = prune_once(&index, &lifetime, &snapshots) {
                        log::warn!("Failed to prune searchers of {name}: {e}");
                    }
                }
                log::debug!("Searcher pruner for {name} stopped");
            })?;
        Ok(Self {
            signal,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle.lock().as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the thread and wait for it to exit.
    pub fn close(&self) -> Result<()> {
        self.signal.trigger();
        let handle = self.handle.lock().take();
        match handle {
            Some(handle) => handle
                .join()
                .map_err(|_| ShardError::internal("searcher pruner thread panicked")),
            None => Ok(()),
        }
    }
}

impl Drop for SearcherPruner {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("{e}");
        }
    }
}
