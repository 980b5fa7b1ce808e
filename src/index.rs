//! The index-segment engine behind a shard.
//!
//! The shard runtime only talks to the engine through a handful of seams:
//! [`IndexWriter`](writer::IndexWriter) for mutations and commits,
//! [`ReferenceManager`](manager::ReferenceManager) for acquiring point-in-time
//! views, [`DirectoryTaxonomyWriter`](taxonomy::DirectoryTaxonomyWriter) for
//! facet ordinals, and
//! [`PersistentSnapshotDeletionPolicy`](deletion_policy::PersistentSnapshotDeletionPolicy)
//! for pinning commits. The implementations in this module keep live documents
//! in memory and persist each commit as a single checksummed commit point.

pub mod commit;
pub mod deletion_policy;
pub mod manager;
pub mod searcher;
pub mod taxonomy;
pub mod writer;

pub use commit::CommitPoint;
pub use deletion_policy::PersistentSnapshotDeletionPolicy;
pub use manager::{ReferenceManager, SearcherTaxonomyManager};
pub use searcher::{IndexSearcher, SearcherAndTaxonomy, SearcherHandle};
pub use taxonomy::{DirectoryTaxonomyWriter, TaxonomyReader};
pub use writer::{DefaultIndexWriterFactory, IndexWriter, IndexWriterFactory, SegmentIndexWriter};

use serde::{Deserialize, Serialize};

/// How a writer treats the directory it is opened on.
///
/// The caller always states its intent; the mode is never inferred from what
/// happens to be on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenMode {
    /// Start from an empty index. Generations continue past any existing commits.
    Create,
    /// Open the latest existing commit. Fails if there is none.
    Append,
}
