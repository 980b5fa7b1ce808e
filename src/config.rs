//! Index-level configuration and the state shared by all shards of an index.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{Result, ShardError};
use crate::facet::FacetsConfig;
use crate::index::writer::{DefaultIndexWriterFactory, IndexWriterFactory};
use crate::shard::role::{ReplicationNodeFactory, UnsupportedReplication};
use crate::storage::{DirectoryFactory, StorageConfig, StorageFactory};
use crate::util::shutdown::ShutdownSignal;

fn default_max_refresh_sec() -> f64 {
    1.0
}

fn default_min_refresh_sec() -> f64 {
    0.05
}

fn default_max_searcher_age_sec() -> f64 {
    60.0
}

/// Settings that may change while shards are running.
///
/// Refresh bounds take effect on the next
/// [`restart_reopen_thread`](crate::shard::ShardState::restart_reopen_thread);
/// the searcher age is re-read by the pruner on every tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LiveSettings {
    /// Longest time a new document may stay invisible to searchers.
    #[serde(default = "default_max_refresh_sec")]
    pub max_refresh_sec: f64,
    /// Shortest interval between two reopens, used while someone waits for a generation.
    #[serde(default = "default_min_refresh_sec")]
    pub min_refresh_sec: f64,
    /// How long a superseded searcher version stays acquirable.
    #[serde(default = "default_max_searcher_age_sec")]
    pub max_searcher_age_sec: f64,
}

impl Default for LiveSettings {
    fn default() -> Self {
        Self {
            max_refresh_sec: default_max_refresh_sec(),
            min_refresh_sec: default_min_refresh_sec(),
            max_searcher_age_sec: default_max_searcher_age_sec(),
        }
    }
}

impl LiveSettings {
    pub fn validate(&self) -> Result<()> {
        let values = [
            ("max_refresh_sec", self.max_refresh_sec),
            ("min_refresh_sec", self.min_refresh_sec),
            ("max_searcher_age_sec", self.max_searcher_age_sec),
        ];
        for (name, value) in values {
            if !value.is_finite() {
                return Err(ShardError::invalid_config(format!(
                    "{name} must be finite, got {value}"
                )));
            }
        }
        if self.min_refresh_sec <= 0.0 {
            return Err(ShardError::invalid_config(format!(
                "min_refresh_sec must be positive, got {}",
                self.min_refresh_sec
            )));
        }
        if self.min_refresh_sec > self.max_refresh_sec {
            return Err(ShardError::invalid_config(format!(
                "min_refresh_sec ({}) must not exceed max_refresh_sec ({})",
                self.min_refresh_sec, self.max_refresh_sec
            )));
        }
        if self.max_searcher_age_sec < 0.0 {
            return Err(ShardError::invalid_config(format!(
                "max_searcher_age_sec must not be negative, got {}",
                self.max_searcher_age_sec
            )));
        }
        Ok(())
    }
}

fn default_max_merge_size_mb() -> f64 {
    5.0
}

fn default_max_cached_mb() -> f64 {
    60.0
}

fn default_indexing_threads() -> usize {
    num_cpus::get()
}

fn default_pruner_interval_ms() -> u64 {
    1000
}

/// Settings fixed for the lifetime of an index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSettings {
    /// Largest file kept in the RAM write cache. Zero disables caching.
    #[serde(default = "default_max_merge_size_mb")]
    pub nrt_caching_directory_max_merge_size_mb: f64,
    /// Total size of the RAM write cache. Zero disables caching.
    #[serde(default = "default_max_cached_mb")]
    pub nrt_caching_directory_max_size_mb: f64,
    /// Worker threads running bulk-indexing jobs, shared by all shards.
    #[serde(default = "default_indexing_threads")]
    pub indexing_threads: usize,
    /// Period of the searcher pruner.
    #[serde(default = "default_pruner_interval_ms")]
    pub pruner_interval_ms: u64,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            nrt_caching_directory_max_merge_size_mb: default_max_merge_size_mb(),
            nrt_caching_directory_max_size_mb: default_max_cached_mb(),
            indexing_threads: default_indexing_threads(),
            pruner_interval_ms: default_pruner_interval_ms(),
            storage: StorageConfig::default(),
        }
    }
}

impl IndexSettings {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            (
                "nrt_caching_directory_max_merge_size_mb",
                self.nrt_caching_directory_max_merge_size_mb,
            ),
            (
                "nrt_caching_directory_max_size_mb",
                self.nrt_caching_directory_max_size_mb,
            ),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ShardError::invalid_config(format!(
                    "{name} must be a non-negative number, got {value}"
                )));
            }
        }
        if self.indexing_threads == 0 {
            return Err(ShardError::invalid_config("indexing_threads must be at least 1"));
        }
        if self.pruner_interval_ms == 0 {
            return Err(ShardError::invalid_config("pruner_interval_ms must be at least 1"));
        }
        Ok(())
    }

    /// Whether directories that are not memory-mapped get a RAM write cache.
    pub fn nrt_caching_enabled(&self) -> bool {
        self.nrt_caching_directory_max_merge_size_mb > 0.0
            && self.nrt_caching_directory_max_size_mb > 0.0
    }
}

/// State shared by every shard of one index.
///
/// Owns the collaborators shards are built from, the live settings, the
/// index-wide shutdown signal, and the bulk-indexing thread pool.
#[derive(Debug)]
pub struct IndexState {
    name: String,
    root_dir: Option<PathBuf>,
    settings: IndexSettings,
    live: RwLock<LiveSettings>,
    facets: FacetsConfig,
    directory_factory: Arc<dyn DirectoryFactory>,
    writer_factory: Arc<dyn IndexWriterFactory>,
    replication_factory: Arc<dyn ReplicationNodeFactory>,
    shutdown: ShutdownSignal,
    indexing_pool: Arc<rayon::ThreadPool>,
}

impl IndexState {
    pub fn builder(name: impl Into<String>) -> IndexStateBuilder {
        IndexStateBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Root directory of the index; `None` for ephemeral indexes.
    pub fn root_dir(&self) -> Option<&Path> {
        self.root_dir.as_deref()
    }

    /// Root directory of shard `ord`, `<root>/shard<ord>`.
    pub fn shard_root(&self, ord: u32) -> Option<PathBuf> {
        self.root_dir.as_ref().map(|root| root.join(format!("shard{ord}")))
    }

    pub fn settings(&self) -> &IndexSettings {
        &self.settings
    }

    pub fn live_settings(&self) -> LiveSettings {
        *self.live.read()
    }

    /// Replace the live settings after validating them.
    pub fn set_live_settings(&self, settings: LiveSettings) -> Result<()> {
        settings.validate()?;
        *self.live.write() = settings;
        log::info!("Updated live settings of index {}: {settings:?}", self.name);
        Ok(())
    }

    pub fn facets(&self) -> &FacetsConfig {
        &self.facets
    }

    pub fn directory_factory(&self) -> &Arc<dyn DirectoryFactory> {
        &self.directory_factory
    }

    pub fn writer_factory(&self) -> &Arc<dyn IndexWriterFactory> {
        &self.writer_factory
    }

    pub fn replication_factory(&self) -> &Arc<dyn ReplicationNodeFactory> {
        &self.replication_factory
    }

    /// Index-wide shutdown signal; every shard's loops stop when it fires.
    pub fn shutdown_signal(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    /// Fire the index-wide shutdown signal.
    pub fn shutdown(&self) {
        log::info!("Shutting down index {}", self.name);
        self.shutdown.trigger();
    }

    pub fn indexing_pool(&self) -> &Arc<rayon::ThreadPool> {
        &self.indexing_pool
    }
}

/// Builder for [`IndexState`].
pub struct IndexStateBuilder {
    name: String,
    root_dir: Option<PathBuf>,
    settings: IndexSettings,
    live: LiveSettings,
    facets: FacetsConfig,
    directory_factory: Option<Arc<dyn DirectoryFactory>>,
    writer_factory: Option<Arc<dyn IndexWriterFactory>>,
    replication_factory: Option<Arc<dyn ReplicationNodeFactory>>,
    shutdown: Option<ShutdownSignal>,
}

impl IndexStateBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            root_dir: None,
            settings: IndexSettings::default(),
            live: LiveSettings::default(),
            facets: FacetsConfig::default(),
            directory_factory: None,
            writer_factory: None,
            replication_factory: None,
            shutdown: None,
        }
    }

    pub fn root_dir(mut self, root_dir: impl Into<PathBuf>) -> Self {
        self.root_dir = Some(root_dir.into());
        self
    }

    pub fn settings(mut self, settings: IndexSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn live_settings(mut self, live: LiveSettings) -> Self {
        self.live = live;
        self
    }

    pub fn facets(mut self, facets: FacetsConfig) -> Self {
        self.facets = facets;
        self
    }

    /// Override the factory shards open their directories with.
    ///
    /// Defaults to a [`StorageFactory`] for `settings.storage`.
    pub fn directory_factory(mut self, factory: Arc<dyn DirectoryFactory>) -> Self {
        self.directory_factory = Some(factory);
        self
    }

    pub fn writer_factory(mut self, factory: Arc<dyn IndexWriterFactory>) -> Self {
        self.writer_factory = Some(factory);
        self
    }

    pub fn replication_factory(mut self, factory: Arc<dyn ReplicationNodeFactory>) -> Self {
        self.replication_factory = Some(factory);
        self
    }

    /// Make the index's signal a child of `parent`, e.g. a process-wide signal.
    pub fn shutdown_parent(mut self, parent: &ShutdownSignal) -> Self {
        self.shutdown = Some(parent.child());
        self
    }

    /// Validate the settings and build the index state.
    ///
    /// # Errors
    ///
    /// Returns [`ShardError::InvalidConfig`] for invalid settings and
    /// [`ShardError::Internal`] if the indexing pool cannot be created.
    pub fn build(self) -> Result<Arc<IndexState>> {
        self.settings.validate()?;
        self.live.validate()?;

        let index_name = self.name.clone();
        let indexing_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.settings.indexing_threads)
            .thread_name(move |i| format!("iris-shard-indexing-{index_name}-{i}"))
            .panic_handler(|_| log::error!("Indexing worker panicked"))
            .build()
            .map_err(|e| ShardError::internal(format!("failed to build indexing pool: {e}")))?;

        let directory_factory = self
            .directory_factory
            .unwrap_or_else(|| Arc::new(StorageFactory::new(self.settings.storage.clone())));

        Ok(Arc::new(IndexState {
            name: self.name,
            root_dir: self.root_dir,
            live: RwLock::new(self.live),
            facets: self.facets,
            directory_factory,
            writer_factory: self
                .writer_factory
                .unwrap_or_else(|| Arc::new(DefaultIndexWriterFactory)),
            replication_factory: self
                .replication_factory
                .unwrap_or_else(|| Arc::new(UnsupportedReplication)),
            shutdown: self.shutdown.unwrap_or_default(),
            indexing_pool: Arc::new(indexing_pool),
            settings: self.settings,
        }))
    }
}
