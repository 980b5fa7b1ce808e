//! # Iris Shard
//!
//! Per-shard near-real-time runtime for the iris search server.
//!
//! ## Features
//!
//! - Standalone, replication primary and replica shard roles
//! - Background searcher reopen with bounded staleness
//! - Versioned searchers that follow-up requests can reacquire
//! - Durable commit snapshots that survive restarts
//! - Parallel bulk indexing with per-job error reporting
//! - Memory, file and memory-mapped storage with a RAM write cache

pub mod config;
pub mod data;
pub mod error;
pub mod facet;
pub mod index;
pub mod shard;
pub mod storage;
pub mod util;

// Re-exports for the public API
pub use config::{IndexSettings, IndexState, IndexStateBuilder, LiveSettings};
pub use data::{DataValue, Document, Term};
pub use error::{ErrorKind, Result, ShardError};
pub use facet::{DimConfig, FacetsConfig};
pub use index::{OpenMode, SearcherAndTaxonomy, SearcherHandle};
pub use shard::indexing::{BulkIndexResponse, IndexingJob, PendingIndexing};
pub use shard::role::RoleKind;
pub use shard::snapshot::SnapshotId;
pub use shard::{SearcherGuard, ShardState};
pub use storage::{StorageConfig, StorageFactory};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
