//! Per-shard runtime.
//!
//! [`ShardState`] owns one partition of an index: it opens the shard's
//! directories and writers, keeps a near-real-time searcher available to
//! concurrent readers, caches searcher versions for follow-up requests, pins
//! durable snapshots, and runs bulk ingestion.
//!
//! # Lifecycle
//!
//! A shard is created not started. [`ShardState::start`] (or one of the
//! replication variants) opens every resource and starts the reopen and
//! pruner threads; any failure part-way releases what was already opened and
//! leaves the shard not started. [`ShardState::close`] commits, then releases
//! everything in dependency order. Start, close, commit, snapshot, and
//! reopen-thread restarts are serialized per shard.
//!
//! # Example
//!
//! ```
//! use iris_shard::{Document, IndexState, IndexingJob, OpenMode, ShardState};
//!
//! # fn main() -> iris_shard::Result<()> {
//! let index = IndexState::builder("books").build()?;
//! let shard = ShardState::new(index, 0);
//! shard.start(OpenMode::Create)?;
//!
//! let doc = Document::new_with_id("1").add_text("title", "Dune");
//! shard.add_documents(vec![IndexingJob::add(0, vec![doc])])?;
//! shard.maybe_refresh_blocking()?;
//!
//! let searcher = shard.searcher()?;
//! assert_eq!(searcher.searcher().num_docs()?, 1);
//! drop(searcher);
//!
//! shard.close()?;
//! # Ok(())
//! # }
//! ```

pub mod indexing;
pub mod lifetime;
pub mod pruner;
pub mod reopen;
pub mod role;
pub mod snapshot;

use std::net::SocketAddr;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock, RwLockReadGuard};

use crate::config::IndexState;
use crate::data::Term;
use crate::error::{Result, ShardError};
use crate::index::OpenMode;
use crate::index::commit::{CommitPoint, SEGMENTS_PREFIX, TAXONOMY_PREFIX};
use crate::index::deletion_policy::PersistentSnapshotDeletionPolicy;
use crate::index::manager::{ReferenceManager, SearcherTaxonomyManager};
use crate::index::searcher::{SearcherAndTaxonomy, SearcherHandle};
use crate::index::taxonomy::DirectoryTaxonomyWriter;
use crate::index::writer::IndexWriter;
use crate::shard::indexing::{BulkIndexResponse, BulkIndexer, IndexingJob, PendingIndexing};
use crate::shard::lifetime::SearcherLifetimeManager;
use crate::shard::pruner::SearcherPruner;
use crate::shard::reopen::ReopenScheduler;
use crate::shard::role::{NodeContext, RoleKind, ShardRole};
use crate::shard::snapshot::{SnapshotId, SnapshotRegistry};
use crate::storage::caching::NrtCachingDirectory;
use crate::storage::{Directory, DirectoryKind};
use crate::util::close::CloseStack;
use crate::util::shutdown::ShutdownSignal;

const INDEX_DIR_NAME: &str = "index";
const TAXONOMY_DIR_NAME: &str = "taxonomy";

/// Storage opened for a shard before its role is built.
struct ShardStorage {
    mode: OpenMode,
    index_dir: Arc<dyn Directory>,
    taxonomy_dir: Arc<dyn Directory>,
    index_policy: Arc<PersistentSnapshotDeletionPolicy>,
    taxonomy_policy: Arc<PersistentSnapshotDeletionPolicy>,
}

/// Resources of a started shard.
struct StartedShard {
    role: ShardRole,
    index_dir: Arc<dyn Directory>,
    taxonomy_dir: Arc<dyn Directory>,
    index_policy: Arc<PersistentSnapshotDeletionPolicy>,
    taxonomy_policy: Arc<PersistentSnapshotDeletionPolicy>,
    lifetime: Arc<SearcherLifetimeManager>,
    reopen: Mutex<Option<Arc<ReopenScheduler>>>,
    pruner: Mutex<Option<SearcherPruner>>,
    /// Whether mutations are still accepted. Mutations hold the read side
    /// for their whole run; close flips it under the write side.
    accepting: RwLock<bool>,
    /// Child of the index signal; fired when this shard closes.
    signal: ShutdownSignal,
}

impl StartedShard {
    /// Stop accepting mutations, waiting for running ones to finish.
    fn drain_mutations(&self) {
        *self.accepting.write() = false;
    }

    /// Release everything in dependency order. Every step is attempted.
    fn shutdown(&self) -> Result<()> {
        self.signal.trigger();
        let mut stack = CloseStack::new();
        if let Some(reopen) = self.reopen.lock().take() {
            stack.push("reopen thread", move || reopen.close());
        }
        if let Some(pruner) = self.pruner.lock().take() {
            stack.push("searcher pruner", move || pruner.close());
        }
        let role = self.role.clone();
        stack.push("searcher manager", move || role.close_searchers());
        let lifetime = self.lifetime.clone();
        stack.push("searcher lifetime manager", move || lifetime.close());
        let role = self.role.clone();
        stack.push("writers", move || role.close_writers());
        let index_dir = self.index_dir.clone();
        stack.push("index directory", move || index_dir.close());
        let taxonomy_dir = self.taxonomy_dir.clone();
        stack.push("taxonomy directory", move || taxonomy_dir.close());
        stack.close_all()
    }
}

/// Scoped searcher acquisition; released on drop.
pub struct SearcherGuard {
    handle: Option<SearcherHandle>,
    manager: Arc<dyn ReferenceManager>,
}

impl SearcherGuard {
    pub fn handle(&self) -> Option<&SearcherHandle> {
        self.handle.as_ref()
    }

    /// Release now, reporting any error instead of logging it.
    pub fn release(mut self) -> Result<()> {
        match self.handle.take() {
            Some(handle) => self.manager.release(handle),
            None => Ok(()),
        }
    }
}

impl Deref for SearcherGuard {
    type Target = SearcherAndTaxonomy;

    fn deref(&self) -> &Self::Target {
        // Only `release` takes the handle, and it consumes the guard.
        self.handle
            .as_deref()
            .unwrap_or_else(|| unreachable!("searcher guard used after release"))
    }
}

impl Drop for SearcherGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = self.manager.release(handle) {
                log::warn!("Failed to release searcher: {e}");
            }
        }
    }
}

/// Runtime state of one shard of an index.
pub struct ShardState {
    index: Arc<IndexState>,
    ord: u32,
    name: String,
    root_dir: Option<PathBuf>,
    snapshots: Arc<SnapshotRegistry>,
    lifecycle: Mutex<()>,
    started: RwLock<Option<Arc<StartedShard>>>,
}

impl std::fmt::Debug for ShardState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardState")
            .field("name", &self.name)
            .field("root_dir", &self.root_dir)
            .field("state", &self.state())
            .finish()
    }
}

impl ShardState {
    /// Create shard `ord` of `index`, not yet started.
    pub fn new(index: Arc<IndexState>, ord: u32) -> Self {
        let name = format!("{}:{ord}", index.name());
        let root_dir = index.shard_root(ord);
        Self {
            index,
            ord,
            name,
            root_dir,
            snapshots: Arc::new(SnapshotRegistry::new()),
            lifecycle: Mutex::new(()),
            started: RwLock::new(None),
        }
    }

    /// `"<index>:<ord>"`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ord(&self) -> u32 {
        self.ord
    }

    pub fn index(&self) -> &Arc<IndexState> {
        &self.index
    }

    /// `<index root>/shard<ord>`; `None` for ephemeral shards.
    pub fn root_dir(&self) -> Option<&Path> {
        self.root_dir.as_deref()
    }

    pub fn is_started(&self) -> bool {
        self.started.read().is_some()
    }

    pub fn state(&self) -> &'static str {
        if self.is_started() {
            "started"
        } else {
            "not started"
        }
    }

    pub fn role_kind(&self) -> Option<RoleKind> {
        self.started.read().as_ref().map(|s| s.role.kind())
    }

    pub fn snapshot_registry(&self) -> &Arc<SnapshotRegistry> {
        &self.snapshots
    }

    fn current(&self) -> Result<Arc<StartedShard>> {
        self.started
            .read()
            .clone()
            .ok_or_else(|| ShardError::NotStarted(self.name.clone()))
    }

    fn writer_of(&self, started: &StartedShard) -> Result<Arc<dyn IndexWriter>> {
        started.role.writer().ok_or_else(|| {
            ShardError::unsupported(format!("{} is a replica and has no writer", self.name))
        })
    }

    // ── lifecycle ──

    /// Start as a standalone shard.
    ///
    /// # Errors
    ///
    /// [`ShardError::AlreadyStarted`] if the shard is running. Any other
    /// error leaves the shard not started with nothing left open.
    pub fn start(&self, mode: OpenMode) -> Result<()> {
        let index = self.index.clone();
        self.start_role(mode, move |storage, rollback| {
            let taxonomy = Arc::new(DirectoryTaxonomyWriter::open(
                storage.taxonomy_dir.clone(),
                storage.mode,
                storage.taxonomy_policy.clone(),
            )?);
            let taxonomy_close = taxonomy.clone();
            rollback.push("taxonomy writer", move || taxonomy_close.close());

            let writer = index.writer_factory().open(
                storage.index_dir.clone(),
                storage.mode,
                storage.index_policy.clone(),
            )?;
            let writer_close = writer.clone();
            rollback.push("index writer", move || writer_close.close());

            let manager: Arc<dyn ReferenceManager> = Arc::new(SearcherTaxonomyManager::new(
                writer.clone(),
                Some(taxonomy.clone()),
            )?);
            let manager_close = manager.clone();
            rollback.push("searcher manager", move || manager_close.close());

            Ok(ShardRole::Standalone {
                writer,
                taxonomy,
                manager,
            })
        })
    }

    /// Start as replication primary.
    pub fn start_primary(&self, mode: OpenMode, primary_gen: u64) -> Result<()> {
        let index = self.index.clone();
        let name = self.name.clone();
        self.start_role(mode, move |storage, rollback| {
            let node = index
                .replication_factory()
                .start_primary(node_context(&name, &index, storage), primary_gen)?;
            let node_close = node.clone();
            rollback.push("primary node", move || node_close.close());
            Ok(ShardRole::Primary(node))
        })
    }

    /// Start as replica of the primary at `primary_address`.
    pub fn start_replica(
        &self,
        mode: OpenMode,
        primary_address: SocketAddr,
        primary_gen: u64,
    ) -> Result<()> {
        let index = self.index.clone();
        let name = self.name.clone();
        self.start_role(mode, move |storage, rollback| {
            let node = index.replication_factory().start_replica(
                node_context(&name, &index, storage),
                primary_address,
                primary_gen,
            )?;
            let node_close = node.clone();
            rollback.push("replica node", move || node_close.close());
            Ok(ShardRole::Replica(node))
        })
    }

    fn start_role<F>(&self, mode: OpenMode, build_role: F) -> Result<()>
    where
        F: FnOnce(&ShardStorage, &mut CloseStack) -> Result<ShardRole>,
    {
        let _lifecycle = self.lifecycle.lock();
        if self.is_started() {
            return Err(ShardError::AlreadyStarted(self.name.clone()));
        }

        let mut rollback = CloseStack::new();
        match self.open_started(mode, build_role, &mut rollback) {
            Ok(started) => {
                let kind = started.role.kind();
                *self.started.write() = Some(Arc::new(started));
                log::info!("Started shard {} as {kind} in {mode:?} mode", self.name);
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to start shard {}: {e}", self.name);
                rollback.rollback();
                self.snapshots.clear();
                Err(e)
            }
        }
    }

    fn open_started<F>(
        &self,
        mode: OpenMode,
        build_role: F,
        rollback: &mut CloseStack,
    ) -> Result<StartedShard>
    where
        F: FnOnce(&ShardStorage, &mut CloseStack) -> Result<ShardRole>,
    {
        let signal = self.index.shutdown_signal().child();
        let rollback_signal = signal.clone();
        rollback.push("shutdown signal", move || {
            rollback_signal.trigger();
            Ok(())
        });

        let index_dir = self.open_directory(INDEX_DIR_NAME)?;
        let index_dir_close = index_dir.clone();
        rollback.push("index directory", move || index_dir_close.close());

        let taxonomy_dir = self.open_directory(TAXONOMY_DIR_NAME)?;
        let taxonomy_dir_close = taxonomy_dir.clone();
        rollback.push("taxonomy directory", move || taxonomy_dir_close.close());

        let storage = ShardStorage {
            mode,
            index_policy: Arc::new(PersistentSnapshotDeletionPolicy::open(
                index_dir.clone(),
                SEGMENTS_PREFIX,
            )?),
            taxonomy_policy: Arc::new(PersistentSnapshotDeletionPolicy::open(
                taxonomy_dir.clone(),
                TAXONOMY_PREFIX,
            )?),
            index_dir,
            taxonomy_dir,
        };

        let role = build_role(&storage, rollback)?;

        let lifetime = Arc::new(SearcherLifetimeManager::new());
        let lifetime_close = lifetime.clone();
        rollback.push("searcher lifetime manager", move || lifetime_close.close());
        self.reload_snapshots(&role, &storage, &lifetime)?;

        // Dropping either scheduler joins its thread, so an early return
        // below stops whatever was already running.
        let reopen = match role.reopen_target() {
            Some((writer, manager)) => Some(Arc::new(ReopenScheduler::start(
                &self.name,
                writer,
                manager,
                &self.index.live_settings(),
                &signal,
            )?)),
            None => None,
        };
        let pruner = SearcherPruner::start(
            &self.name,
            self.index.clone(),
            lifetime.clone(),
            self.snapshots.clone(),
            &signal,
        )?;

        Ok(StartedShard {
            role,
            index_dir: storage.index_dir,
            taxonomy_dir: storage.taxonomy_dir,
            index_policy: storage.index_policy,
            taxonomy_policy: storage.taxonomy_policy,
            lifetime,
            reopen: Mutex::new(reopen),
            pruner: Mutex::new(Some(pruner)),
            accepting: RwLock::new(true),
            signal,
        })
    }

    fn open_directory(&self, sub_dir: &str) -> Result<Arc<dyn Directory>> {
        let path = self.root_dir.as_ref().map(|root| root.join(sub_dir));
        let directory = self.index.directory_factory().open(path.as_deref())?;
        let settings = self.index.settings();
        if directory.kind() == DirectoryKind::Mmap || !settings.nrt_caching_enabled() {
            return Ok(directory);
        }
        Ok(Arc::new(NrtCachingDirectory::new(
            directory,
            settings.nrt_caching_directory_max_merge_size_mb,
            settings.nrt_caching_directory_max_size_mb,
        )))
    }

    /// Re-register every persisted snapshot and make its commit acquirable
    /// by version again.
    fn reload_snapshots(
        &self,
        role: &ShardRole,
        storage: &ShardStorage,
        lifetime: &SearcherLifetimeManager,
    ) -> Result<()> {
        self.snapshots.clear();
        let writer = role.writer();
        let taxonomy = role.taxonomy_writer();
        for generation in storage.index_policy.snapshotted_generations() {
            let version = match &writer {
                Some(writer) => {
                    let searcher = writer.open_commit(generation)?;
                    // Ordinals are never reassigned, so the current taxonomy
                    // covers every ordinal of an older commit.
                    let handle = SearcherAndTaxonomy::new(
                        searcher,
                        taxonomy.as_ref().map(|t| t.reader()),
                    );
                    let recorded = lifetime.record(&handle);
                    handle.dec_ref()?;
                    recorded?
                }
                None => CommitPoint::read(storage.index_dir.as_ref(), generation)?.version,
            };
            self.snapshots.insert(generation, version);
            log::debug!(
                "Reloaded snapshot of generation {generation} at version {version} for {}",
                self.name
            );
        }
        Ok(())
    }

    /// Commit pending changes, then release every resource.
    ///
    /// New requests fail with [`ShardError::NotStarted`] as soon as close
    /// begins. Mutations already running finish first and are part of the
    /// final commit. Closing a shard that is not started does nothing.
    pub fn close(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock();
        let Some(started) = self.started.write().take() else {
            return Ok(());
        };
        started.drain_mutations();

        let commit_result = started.role.commit();
        if let Err(e) = &commit_result {
            log::warn!("Failed to commit shard {} before close: {e}", self.name);
        }
        self.snapshots.clear();
        let close_result = started.shutdown();

        log::info!("Closed shard {}", self.name);
        commit_result.and(close_result)
    }

    /// Commit the taxonomy, then the index.
    ///
    /// Returns the new index generation, or `None` when the shard has no
    /// writer (not started, or a replica).
    pub fn commit(&self) -> Result<Option<u64>> {
        let _lifecycle = self.lifecycle.lock();
        match self.started.read().clone() {
            Some(started) => started.role.commit(),
            None => Ok(None),
        }
    }

    /// Recursively delete the shard's root directory.
    ///
    /// # Errors
    ///
    /// [`ShardError::AlreadyStarted`] while the shard is running.
    pub fn delete_shard(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock();
        if self.is_started() {
            return Err(ShardError::AlreadyStarted(self.name.clone()));
        }
        if let Some(root) = &self.root_dir {
            if root.exists() {
                std::fs::remove_dir_all(root)?;
                log::info!("Deleted shard {} at {}", self.name, root.display());
            }
        }
        Ok(())
    }

    /// Replace the reopen thread with one using the current live settings.
    ///
    /// The old thread is fully stopped before the new one starts.
    pub fn restart_reopen_thread(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock();
        let started = self.current()?;
        let Some((writer, manager)) = started.role.reopen_target() else {
            return Ok(());
        };
        let mut slot = started.reopen.lock();
        if let Some(old) = slot.take() {
            old.close()?;
        }
        *slot = Some(Arc::new(ReopenScheduler::start(
            &self.name,
            writer,
            manager,
            &self.index.live_settings(),
            &started.signal,
        )?));
        log::debug!("Restarted reopen thread of shard {}", self.name);
        Ok(())
    }

    // ── searchers ──

    /// Acquire the current searcher. Pair with [`release`](Self::release).
    pub fn acquire(&self) -> Result<SearcherHandle> {
        self.current()?.role.manager().acquire()
    }

    pub fn release(&self, handle: SearcherHandle) -> Result<()> {
        match self.started.read().clone() {
            Some(started) => started.role.manager().release(handle),
            None => handle.dec_ref(),
        }
    }

    /// Acquire the current searcher for the lifetime of the returned guard.
    pub fn searcher(&self) -> Result<SearcherGuard> {
        let manager = self.current()?.role.manager();
        let handle = manager.acquire()?;
        Ok(SearcherGuard {
            handle: Some(handle),
            manager,
        })
    }

    /// Refresh now, blocking until the new view is installed.
    pub fn maybe_refresh_blocking(&self) -> Result<()> {
        self.current()?.role.manager().maybe_refresh_blocking()
    }

    /// Wait until the mutation with sequence number `generation` is
    /// searchable. Returns `false` if `timeout` elapses first.
    ///
    /// A wait spans [`restart_reopen_thread`](Self::restart_reopen_thread):
    /// it moves over to the new thread with whatever time is left.
    pub fn wait_for_generation(&self, generation: u64, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut previous: Option<Arc<ReopenScheduler>> = None;
        loop {
            let started = self.current()?;
            // Blocks while a restart swaps the thread.
            let scheduler = started.reopen.lock().clone();
            let Some(scheduler) = scheduler else {
                return Err(ShardError::unsupported(format!(
                    "{} has no reopen thread",
                    self.name
                )));
            };
            if previous.as_ref().is_some_and(|p| Arc::ptr_eq(p, &scheduler)) {
                // Closed and never replaced.
                return Ok(false);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            match scheduler.wait_for_generation(generation, remaining) {
                Err(ShardError::AlreadyClosed(_)) if !remaining.is_zero() => {
                    log::debug!(
                        "Reopen thread of shard {} closed during wait for {generation}",
                        self.name
                    );
                    previous = Some(scheduler);
                }
                Err(ShardError::AlreadyClosed(_)) => return Ok(false),
                result => return result,
            }
        }
    }

    /// Cache `handle` so it can be reacquired by version later.
    pub fn checkpoint(&self, handle: &SearcherHandle) -> Result<u64> {
        self.current()?.lifetime.record(handle)
    }

    /// Reacquire a checkpointed version. `Ok(None)` once it was pruned.
    pub fn acquire_version(&self, version: u64) -> Result<Option<SearcherHandle>> {
        Ok(self.current()?.lifetime.acquire(version))
    }

    /// Reacquire a checkpointed version, falling back to the current
    /// searcher when it was pruned.
    pub fn acquire_version_or_current(&self, version: u64) -> Result<SearcherHandle> {
        if let Some(handle) = self.acquire_version(version)? {
            return Ok(handle);
        }
        log::debug!(
            "Searcher version {version} of {} is gone, using the current searcher",
            self.name
        );
        self.acquire()
    }

    // ── snapshots ──

    /// Commit and pin the resulting index and taxonomy commits.
    ///
    /// The snapshotted view stays acquirable by its version until
    /// [`release_snapshot`](Self::release_snapshot), regardless of age.
    pub fn create_snapshot(&self) -> Result<SnapshotId> {
        let _lifecycle = self.lifecycle.lock();
        let started = self.current()?;
        let ShardRole::Standalone {
            writer, taxonomy, ..
        } = &started.role
        else {
            return Err(ShardError::unsupported(format!(
                "{}: snapshots need a standalone shard",
                self.name
            )));
        };

        started.role.commit()?;
        let index_generation = started.index_policy.snapshot()?;
        let taxonomy_generation = match started.taxonomy_policy.snapshot() {
            Ok(generation) => generation,
            Err(e) => {
                started.index_policy.release(index_generation)?;
                return Err(e);
            }
        };

        let recorded = writer.open_commit(index_generation).and_then(|searcher| {
            // The taxonomy is committed before the index, so categories
            // added in between are only in the live reader.
            let handle = SearcherAndTaxonomy::new(searcher, Some(taxonomy.reader()));
            let recorded = started.lifetime.record(&handle);
            handle.dec_ref()?;
            recorded
        });
        let version = match recorded {
            Ok(version) => version,
            Err(e) => {
                started.index_policy.release(index_generation)?;
                started.taxonomy_policy.release(taxonomy_generation)?;
                return Err(e);
            }
        };

        self.snapshots.insert(index_generation, version);
        log::info!(
            "Created snapshot of {} at generation {index_generation} (version {version})",
            self.name
        );
        Ok(SnapshotId {
            index_generation,
            taxonomy_generation,
            version,
        })
    }

    /// Release a snapshot. Its version becomes subject to normal pruning.
    ///
    /// Both commits are released even if one of them fails; the first
    /// error is returned.
    pub fn release_snapshot(&self, id: &SnapshotId) -> Result<()> {
        let _lifecycle = self.lifecycle.lock();
        let started = self.current()?;
        let index_result = started.index_policy.release(id.index_generation);
        let taxonomy_result = started.taxonomy_policy.release(id.taxonomy_generation);
        if !started
            .index_policy
            .snapshotted_generations()
            .contains(&id.index_generation)
        {
            self.snapshots.remove(id.index_generation);
        }
        index_result.and(taxonomy_result)?;
        log::info!(
            "Released snapshot of {} at generation {}",
            self.name,
            id.index_generation
        );
        Ok(())
    }

    /// `(generation, version)` of every pinned snapshot.
    pub fn snapshots(&self) -> Vec<(u64, u64)> {
        self.snapshots.entries()
    }

    // ── ingestion ──

    /// Run a bulk request and wait for every job.
    ///
    /// # Errors
    ///
    /// The first job failure, as [`ShardError::Indexing`], after all jobs
    /// finished. Jobs that succeeded stay applied.
    pub fn add_documents(&self, jobs: Vec<IndexingJob>) -> Result<BulkIndexResponse> {
        let started = self.current()?;
        let _accepting = self.accepting_mutations(&started)?;
        let writer = self.writer_of(&started)?;
        BulkIndexer::new(self.index.clone(), writer, started.role.taxonomy_writer()).run(jobs)
    }

    /// Run a bulk request on a helper thread.
    pub fn add_documents_async(self: &Arc<Self>, jobs: Vec<IndexingJob>) -> Result<PendingIndexing> {
        let (sender, receiver) = crossbeam_channel::bounded(1);
        let shard = self.clone();
        thread::Builder::new()
            .name(format!("iris-shard-bulk-{}", self.name))
            .spawn(move || {
                // The receiver may have been dropped; nobody is waiting then.
                let _ = sender.send(shard.add_documents(jobs));
            })?;
        Ok(PendingIndexing::new(self.name.clone(), receiver))
    }

    /// Delete every document matching any of `terms`. Returns the sequence number.
    pub fn delete_documents(&self, terms: &[Term]) -> Result<u64> {
        let started = self.current()?;
        let _accepting = self.accepting_mutations(&started)?;
        self.writer_of(&started)?.delete_documents(terms)
    }

    /// Guard that keeps close from committing until the mutation is done.
    fn accepting_mutations<'a>(
        &self,
        started: &'a StartedShard,
    ) -> Result<RwLockReadGuard<'a, bool>> {
        let accepting = started.accepting.read();
        if !*accepting {
            return Err(ShardError::NotStarted(self.name.clone()));
        }
        Ok(accepting)
    }
}

fn node_context(shard_name: &str, index: &IndexState, storage: &ShardStorage) -> NodeContext {
    NodeContext {
        shard_name: shard_name.to_string(),
        mode: storage.mode,
        index_dir: storage.index_dir.clone(),
        taxonomy_dir: storage.taxonomy_dir.clone(),
        index_policy: storage.index_policy.clone(),
        taxonomy_policy: storage.taxonomy_policy.clone(),
        writer_factory: index.writer_factory().clone(),
    }
}

impl Drop for ShardState {
    fn drop(&mut self) {
        if self.is_started() {
            if let Err(e) = self.close() {
                log::warn!("Failed to close shard {} on drop: {e}", self.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IndexSettings, LiveSettings};
    use crate::data::{DataValue, Document};
    use crate::facet::FACET_ORDINALS_FIELD;
    use crate::index::searcher::IndexSearcher;
    use crate::index::writer::{DefaultIndexWriterFactory, IndexWriterFactory};
    use crate::shard::role::{NrtPrimaryNode, NrtReplicaNode, ReplicationNodeFactory};
    use crate::storage::{StorageConfig, file::FileStorageConfig};
    use tempfile::TempDir;

    fn index(root: Option<&Path>) -> Arc<IndexState> {
        let mut builder = IndexState::builder("books").settings(IndexSettings {
            indexing_threads: 2,
            pruner_interval_ms: 20,
            storage: StorageConfig::File(FileStorageConfig::default()),
            ..Default::default()
        });
        if let Some(root) = root {
            builder = builder.root_dir(root);
        }
        builder.build().unwrap()
    }

    fn docs(n: usize) -> Vec<Document> {
        (0..n)
            .map(|i| Document::new_with_id(i.to_string()).add_text("title", "t"))
            .collect()
    }

    #[test]
    fn test_name_and_state() {
        let shard = ShardState::new(index(None), 2);
        assert_eq!(shard.name(), "books:2");
        assert_eq!(shard.state(), "not started");
        assert!(shard.root_dir().is_none());
        assert!(shard.role_kind().is_none());
        assert_eq!(shard.commit().unwrap(), None);
        assert!(matches!(shard.acquire(), Err(ShardError::NotStarted(_))));
        shard.close().unwrap();
    }

    #[test]
    fn test_commit_and_reopen_from_disk() {
        let temp_dir = TempDir::new().unwrap();
        let index = index(Some(temp_dir.path()));
        {
            let shard = ShardState::new(index.clone(), 0);
            shard.start(OpenMode::Create).unwrap();
            assert_eq!(shard.role_kind(), Some(RoleKind::Standalone));
            shard.add_documents(vec![IndexingJob::add(0, docs(3))]).unwrap();
            assert_eq!(shard.commit().unwrap(), Some(1));
            shard.close().unwrap();
            assert!(temp_dir.path().join("shard0/index/segments_2").exists());
        }

        let shard = ShardState::new(index, 0);
        shard.start(OpenMode::Append).unwrap();
        let searcher = shard.searcher().unwrap();
        assert_eq!(searcher.searcher().num_docs().unwrap(), 3);
        drop(searcher);
        assert_eq!(shard.commit().unwrap(), Some(3));
        shard.close().unwrap();

        shard.delete_shard().unwrap();
        assert!(!temp_dir.path().join("shard0").exists());
    }

    #[test]
    fn test_append_to_empty_shard_fails_cleanly() {
        let temp_dir = TempDir::new().unwrap();
        let shard = ShardState::new(index(Some(temp_dir.path())), 0);
        assert!(matches!(
            shard.start(OpenMode::Append),
            Err(ShardError::NotFound(_))
        ));
        assert!(!shard.is_started());
        shard.start(OpenMode::Create).unwrap();
        assert!(matches!(
            shard.delete_shard(),
            Err(ShardError::AlreadyStarted(_))
        ));
    }

    #[test]
    fn test_delete_documents_and_wait_for_generation() {
        let shard = ShardState::new(index(None), 0);
        shard.start(OpenMode::Create).unwrap();
        shard.add_documents(vec![IndexingJob::add(0, docs(4))]).unwrap();
        let seq = shard.delete_documents(&[Term::new("_id", "1")]).unwrap();

        assert!(shard.wait_for_generation(seq, Duration::from_secs(10)).unwrap());
        let handle = shard.acquire().unwrap();
        assert_eq!(handle.searcher().num_docs().unwrap(), 3);
        shard.release(handle).unwrap();
    }

    #[test]
    fn test_version_checkpoint_fallback() {
        let shard = ShardState::new(index(None), 0);
        shard.start(OpenMode::Create).unwrap();
        let handle = shard.acquire().unwrap();
        let version = shard.checkpoint(&handle).unwrap();
        shard.release(handle).unwrap();

        let again = shard.acquire_version_or_current(version).unwrap();
        assert_eq!(again.version(), version);
        shard.release(again).unwrap();

        assert!(shard.acquire_version(version + 100).unwrap().is_none());
        let fallback = shard.acquire_version_or_current(version + 100).unwrap();
        assert_eq!(fallback.version(), version);
        shard.release(fallback).unwrap();
    }

    #[test]
    fn test_snapshot_survives_restart() {
        let temp_dir = TempDir::new().unwrap();
        let index = index(Some(temp_dir.path()));
        let id = {
            let shard = ShardState::new(index.clone(), 0);
            shard.start(OpenMode::Create).unwrap();
            shard.add_documents(vec![IndexingJob::add(0, docs(2))]).unwrap();
            let id = shard.create_snapshot().unwrap();
            shard.add_documents(vec![IndexingJob::add(0, docs(5))]).unwrap();
            shard.close().unwrap();
            id
        };

        let shard = ShardState::new(index, 0);
        shard.start(OpenMode::Append).unwrap();
        assert_eq!(shard.snapshots(), vec![(id.index_generation, id.version)]);
        let pinned = shard.acquire_version(id.version).unwrap().unwrap();
        assert_eq!(pinned.searcher().num_docs().unwrap(), 2);
        shard.release(pinned).unwrap();

        shard.release_snapshot(&id).unwrap();
        assert!(shard.snapshots().is_empty());
        assert!(!temp_dir
            .path()
            .join(format!("shard0/index/segments_{}", id.index_generation))
            .exists());
    }

    /// Writer that adds a new category and a document using it right before
    /// each armed commit, after the taxonomy was already committed.
    #[derive(Debug)]
    struct LateCategoryWriter {
        inner: Arc<dyn IndexWriter>,
        armed: Arc<Mutex<Option<Arc<DirectoryTaxonomyWriter>>>>,
        late_ordinal: Arc<Mutex<Option<u32>>>,
    }

    impl IndexWriter for LateCategoryWriter {
        fn add_documents(&self, docs: Vec<Document>) -> Result<u64> {
            self.inner.add_documents(docs)
        }

        fn update_documents(&self, term: &Term, docs: Vec<Document>) -> Result<u64> {
            self.inner.update_documents(term, docs)
        }

        fn delete_documents(&self, terms: &[Term]) -> Result<u64> {
            self.inner.delete_documents(terms)
        }

        fn commit(&self) -> Result<u64> {
            if let Some(taxonomy) = self.armed.lock().take() {
                let ordinal = taxonomy.add_category(&["author".to_string(), "late".to_string()])?;
                let doc = Document::new_with_id("late")
                    .add_field(FACET_ORDINALS_FIELD, DataValue::Ordinals(vec![ordinal]));
                self.inner.add_documents(vec![doc])?;
                *self.late_ordinal.lock() = Some(ordinal);
            }
            self.inner.commit()
        }

        fn max_completed_sequence_number(&self) -> u64 {
            self.inner.max_completed_sequence_number()
        }

        fn version(&self) -> u64 {
            self.inner.version()
        }

        fn last_commit_generation(&self) -> Option<u64> {
            self.inner.last_commit_generation()
        }

        fn has_uncommitted_changes(&self) -> bool {
            self.inner.has_uncommitted_changes()
        }

        fn num_docs(&self) -> usize {
            self.inner.num_docs()
        }

        fn open_view(&self) -> Result<IndexSearcher> {
            self.inner.open_view()
        }

        fn open_commit(&self, generation: u64) -> Result<IndexSearcher> {
            self.inner.open_commit(generation)
        }

        fn close(&self) -> Result<()> {
            self.inner.close()
        }

        fn is_closed(&self) -> bool {
            self.inner.is_closed()
        }
    }

    #[derive(Debug, Default)]
    struct LateCategoryFactory {
        armed: Arc<Mutex<Option<Arc<DirectoryTaxonomyWriter>>>>,
        late_ordinal: Arc<Mutex<Option<u32>>>,
    }

    impl IndexWriterFactory for LateCategoryFactory {
        fn open(
            &self,
            directory: Arc<dyn Directory>,
            mode: OpenMode,
            policy: Arc<PersistentSnapshotDeletionPolicy>,
        ) -> Result<Arc<dyn IndexWriter>> {
            Ok(Arc::new(LateCategoryWriter {
                inner: DefaultIndexWriterFactory.open(directory, mode, policy)?,
                armed: self.armed.clone(),
                late_ordinal: self.late_ordinal.clone(),
            }))
        }
    }

    #[test]
    fn test_snapshot_resolves_categories_added_during_commit() {
        let factory = Arc::new(LateCategoryFactory::default());
        let index = IndexState::builder("books")
            .writer_factory(factory.clone())
            .build()
            .unwrap();
        let shard = ShardState::new(index, 0);
        shard.start(OpenMode::Create).unwrap();
        shard.add_documents(vec![IndexingJob::add(0, docs(2))]).unwrap();

        let taxonomy = shard.current().unwrap().role.taxonomy_writer().unwrap();
        *factory.armed.lock() = Some(taxonomy);
        let id = shard.create_snapshot().unwrap();
        let ordinal = (*factory.late_ordinal.lock()).unwrap();

        let pinned = shard.acquire_version(id.version).unwrap().unwrap();
        assert_eq!(pinned.searcher().num_docs().unwrap(), 3);
        let doc = pinned.searcher().doc(2).unwrap().unwrap();
        assert_eq!(
            doc.get(FACET_ORDINALS_FIELD).unwrap().as_ordinals(),
            Some(&[ordinal][..])
        );
        assert_eq!(
            pinned.taxonomy().unwrap().path(ordinal),
            Some(vec!["author".to_string(), "late".to_string()])
        );
        shard.release(pinned).unwrap();
    }

    #[test]
    fn test_release_snapshot_with_unknown_taxonomy_commit() {
        let shard = ShardState::new(index(None), 0);
        shard.start(OpenMode::Create).unwrap();
        shard.add_documents(vec![IndexingJob::add(0, docs(1))]).unwrap();
        let id = shard.create_snapshot().unwrap();

        let bogus = SnapshotId {
            taxonomy_generation: 999,
            ..id
        };
        assert!(matches!(
            shard.release_snapshot(&bogus),
            Err(ShardError::NotFound(_))
        ));
        // The index commit was still released.
        assert!(shard.snapshots().is_empty());
        let started = shard.current().unwrap();
        assert!(started.index_policy.snapshotted_generations().is_empty());
        assert_eq!(
            started.taxonomy_policy.snapshotted_generations(),
            vec![id.taxonomy_generation]
        );

        // Retrying with the real id frees the taxonomy commit too.
        assert!(matches!(
            shard.release_snapshot(&id),
            Err(ShardError::NotFound(_))
        ));
        assert!(started.taxonomy_policy.snapshotted_generations().is_empty());
    }

    #[test]
    fn test_restart_reopen_thread_applies_live_settings() {
        let index = index(None);
        let shard = ShardState::new(index.clone(), 0);
        shard.start(OpenMode::Create).unwrap();
        index
            .set_live_settings(LiveSettings {
                min_refresh_sec: 0.01,
                max_refresh_sec: 0.02,
                ..Default::default()
            })
            .unwrap();
        shard.restart_reopen_thread().unwrap();

        let scheduler = shard.current().unwrap().reopen.lock().clone().unwrap();
        assert_eq!(scheduler.max_stale(), Duration::from_secs_f64(0.02));
        assert!(scheduler.is_running());
        shard.close().unwrap();
        assert!(!scheduler.is_running());
    }

    #[test]
    fn test_index_shutdown_reaches_shard_threads() {
        let index = index(None);
        let shard = ShardState::new(index.clone(), 0);
        shard.start(OpenMode::Create).unwrap();
        let started = shard.current().unwrap();
        index.shutdown();
        assert!(started.signal.is_triggered());
        shard.close().unwrap();
    }

    #[derive(Debug)]
    struct LocalPrimary {
        writer: Arc<dyn IndexWriter>,
        manager: Arc<dyn ReferenceManager>,
    }

    impl NrtPrimaryNode for LocalPrimary {
        fn writer(&self) -> Arc<dyn IndexWriter> {
            self.writer.clone()
        }

        fn searcher_manager(&self) -> Arc<dyn ReferenceManager> {
            self.manager.clone()
        }

        fn commit(&self) -> Result<u64> {
            self.writer.commit()
        }

        fn close(&self) -> Result<()> {
            self.manager.close()?;
            self.writer.close()
        }
    }

    #[derive(Debug)]
    struct LocalReplica {
        manager: Arc<dyn ReferenceManager>,
    }

    impl NrtReplicaNode for LocalReplica {
        fn searcher_manager(&self) -> Arc<dyn ReferenceManager> {
            self.manager.clone()
        }

        fn close(&self) -> Result<()> {
            self.manager.close()
        }
    }

    #[derive(Debug)]
    struct LocalReplication;

    impl ReplicationNodeFactory for LocalReplication {
        fn start_primary(
            &self,
            context: NodeContext,
            _primary_gen: u64,
        ) -> Result<Arc<dyn NrtPrimaryNode>> {
            let writer = context
                .writer_factory
                .open(context.index_dir, context.mode, context.index_policy)?;
            let manager = Arc::new(SearcherTaxonomyManager::new(writer.clone(), None)?);
            Ok(Arc::new(LocalPrimary { writer, manager }))
        }

        fn start_replica(
            &self,
            context: NodeContext,
            _primary_address: SocketAddr,
            _primary_gen: u64,
        ) -> Result<Arc<dyn NrtReplicaNode>> {
            // Stand-in for files copied from the primary.
            let writer = DefaultIndexWriterFactory.open(
                context.index_dir,
                OpenMode::Create,
                context.index_policy,
            )?;
            let manager = Arc::new(SearcherTaxonomyManager::new(writer, None)?);
            Ok(Arc::new(LocalReplica { manager }))
        }
    }

    fn replicated_index() -> Arc<IndexState> {
        IndexState::builder("replicated")
            .settings(IndexSettings {
                indexing_threads: 1,
                ..Default::default()
            })
            .replication_factory(Arc::new(LocalReplication))
            .build()
            .unwrap()
    }

    #[test]
    fn test_default_replication_is_unsupported() {
        let shard = ShardState::new(index(None), 0);
        assert!(matches!(
            shard.start_primary(OpenMode::Create, 0),
            Err(ShardError::Unsupported(_))
        ));
        let addr: SocketAddr = "127.0.0.1:7000".parse().unwrap();
        assert!(matches!(
            shard.start_replica(OpenMode::Create, addr, 0),
            Err(ShardError::Unsupported(_))
        ));
        assert!(!shard.is_started());
    }

    #[test]
    fn test_primary_routes_through_node() {
        let shard = ShardState::new(replicated_index(), 0);
        shard.start_primary(OpenMode::Create, 0).unwrap();
        assert_eq!(shard.role_kind(), Some(RoleKind::Primary));
        assert!(matches!(
            shard.start(OpenMode::Create),
            Err(ShardError::AlreadyStarted(_))
        ));

        shard.add_documents(vec![IndexingJob::add(0, docs(2))]).unwrap();
        shard.maybe_refresh_blocking().unwrap();
        let handle = shard.acquire().unwrap();
        assert_eq!(handle.searcher().num_docs().unwrap(), 2);
        shard.release(handle).unwrap();
        assert_eq!(shard.commit().unwrap(), Some(1));
        assert!(shard.create_snapshot().is_err());
        shard.close().unwrap();
    }

    #[test]
    fn test_replica_has_no_writer() {
        let shard = ShardState::new(replicated_index(), 1);
        let addr: SocketAddr = "127.0.0.1:7000".parse().unwrap();
        shard.start_replica(OpenMode::Create, addr, 4).unwrap();
        assert_eq!(shard.role_kind(), Some(RoleKind::Replica));

        assert_eq!(shard.commit().unwrap(), None);
        assert!(matches!(
            shard.add_documents(vec![IndexingJob::add(0, docs(1))]),
            Err(ShardError::Unsupported(_))
        ));
        assert!(shard.wait_for_generation(0, Duration::from_millis(1)).is_err());
        shard.restart_reopen_thread().unwrap();

        let guard = shard.searcher().unwrap();
        assert_eq!(guard.searcher().num_docs().unwrap(), 0);
        guard.release().unwrap();
        shard.close().unwrap();
    }
}
