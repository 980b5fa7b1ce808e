//! The role a started shard plays, and the replication seams.
//!
//! A started shard is exactly one of standalone, replication primary, or
//! replication replica. Every acquire/release/refresh call is routed to the
//! reference manager of the active role. Primary and replica nodes are built
//! by a [`ReplicationNodeFactory`]; the transport that moves index files from
//! primary to replica lives entirely behind those node traits.

use std::fmt::{self, Debug, Display};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::{Result, ShardError};
use crate::index::OpenMode;
use crate::index::deletion_policy::PersistentSnapshotDeletionPolicy;
use crate::index::manager::ReferenceManager;
use crate::index::taxonomy::DirectoryTaxonomyWriter;
use crate::index::writer::{IndexWriter, IndexWriterFactory};
use crate::storage::Directory;

/// A shard acting as replication primary.
pub trait NrtPrimaryNode: Send + Sync + Debug {
    fn writer(&self) -> Arc<dyn IndexWriter>;

    /// Taxonomy writer used for facet fields, if the node keeps one.
    fn taxonomy_writer(&self) -> Option<Arc<DirectoryTaxonomyWriter>> {
        None
    }

    fn searcher_manager(&self) -> Arc<dyn ReferenceManager>;

    /// Commit and return the new generation.
    fn commit(&self) -> Result<u64>;

    fn close(&self) -> Result<()>;
}

/// A shard acting as replication replica. Its index is written by copying
/// files from the primary, so it has no writer of its own.
pub trait NrtReplicaNode: Send + Sync + Debug {
    fn searcher_manager(&self) -> Arc<dyn ReferenceManager>;

    fn close(&self) -> Result<()>;
}

/// Everything a replication node needs from the shard that hosts it.
#[derive(Debug, Clone)]
pub struct NodeContext {
    pub shard_name: String,
    pub mode: OpenMode,
    pub index_dir: Arc<dyn Directory>,
    pub taxonomy_dir: Arc<dyn Directory>,
    pub index_policy: Arc<PersistentSnapshotDeletionPolicy>,
    pub taxonomy_policy: Arc<PersistentSnapshotDeletionPolicy>,
    pub writer_factory: Arc<dyn IndexWriterFactory>,
}

/// Builds replication nodes.
pub trait ReplicationNodeFactory: Send + Sync + Debug {
    fn start_primary(&self, context: NodeContext, primary_gen: u64)
    -> Result<Arc<dyn NrtPrimaryNode>>;

    fn start_replica(
        &self,
        context: NodeContext,
        primary_address: SocketAddr,
        primary_gen: u64,
    ) -> Result<Arc<dyn NrtReplicaNode>>;
}

/// Factory used when no replication transport is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsupportedReplication;

impl ReplicationNodeFactory for UnsupportedReplication {
    fn start_primary(
        &self,
        context: NodeContext,
        _primary_gen: u64,
    ) -> Result<Arc<dyn NrtPrimaryNode>> {
        Err(ShardError::unsupported(format!(
            "{}: no replication transport configured for primary role",
            context.shard_name
        )))
    }

    fn start_replica(
        &self,
        context: NodeContext,
        primary_address: SocketAddr,
        _primary_gen: u64,
    ) -> Result<Arc<dyn NrtReplicaNode>> {
        Err(ShardError::unsupported(format!(
            "{}: no replication transport configured for replica of {primary_address}",
            context.shard_name
        )))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleKind {
    Standalone,
    Primary,
    Replica,
}

impl Display for RoleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RoleKind::Standalone => "standalone",
            RoleKind::Primary => "primary",
            RoleKind::Replica => "replica",
        };
        f.write_str(name)
    }
}

/// The active role of a started shard.
#[derive(Debug, Clone)]
pub enum ShardRole {
    Standalone {
        writer: Arc<dyn IndexWriter>,
        taxonomy: Arc<DirectoryTaxonomyWriter>,
        manager: Arc<dyn ReferenceManager>,
    },
    Primary(Arc<dyn NrtPrimaryNode>),
    Replica(Arc<dyn NrtReplicaNode>),
}

impl ShardRole {
    pub fn kind(&self) -> RoleKind {
        match self {
            ShardRole::Standalone { .. } => RoleKind::Standalone,
            ShardRole::Primary(_) => RoleKind::Primary,
            ShardRole::Replica(_) => RoleKind::Replica,
        }
    }

    pub fn manager(&self) -> Arc<dyn ReferenceManager> {
        match self {
            ShardRole::Standalone { manager, .. } => manager.clone(),
            ShardRole::Primary(node) => node.searcher_manager(),
            ShardRole::Replica(node) => node.searcher_manager(),
        }
    }

    /// The writer accepting documents; replicas have none.
    pub fn writer(&self) -> Option<Arc<dyn IndexWriter>> {
        match self {
            ShardRole::Standalone { writer, .. } => Some(writer.clone()),
            ShardRole::Primary(node) => Some(node.writer()),
            ShardRole::Replica(_) => None,
        }
    }

    pub fn taxonomy_writer(&self) -> Option<Arc<DirectoryTaxonomyWriter>> {
        match self {
            ShardRole::Standalone { taxonomy, .. } => Some(taxonomy.clone()),
            ShardRole::Primary(node) => node.taxonomy_writer(),
            ShardRole::Replica(_) => None,
        }
    }

    /// Writer and manager the reopen thread drives. Replicas are refreshed by
    /// their primary and have none.
    pub fn reopen_target(&self) -> Option<(Arc<dyn IndexWriter>, Arc<dyn ReferenceManager>)> {
        match self {
            ShardRole::Replica(_) => None,
            role => role.writer().map(|writer| (writer, role.manager())),
        }
    }

    /// Commit the taxonomy, then the index. `None` when this role has no writer.
    pub fn commit(&self) -> Result<Option<u64>> {
        match self {
            ShardRole::Standalone {
                writer, taxonomy, ..
            } => {
                taxonomy.commit()?;
                Ok(Some(writer.commit()?))
            }
            ShardRole::Primary(node) => Ok(Some(node.commit()?)),
            ShardRole::Replica(_) => Ok(None),
        }
    }

    /// Close the searcher side of the role.
    pub fn close_searchers(&self) -> Result<()> {
        match self {
            ShardRole::Standalone { manager, .. } => manager.close(),
            // Nodes close their own managers.
            ShardRole::Primary(_) | ShardRole::Replica(_) => Ok(()),
        }
    }

    /// Close the writers, or the replication node.
    pub fn close_writers(&self) -> Result<()> {
        match self {
            ShardRole::Standalone {
                writer, taxonomy, ..
            } => {
                let index_result = writer.close();
                let taxonomy_result = taxonomy.close();
                index_result.and(taxonomy_result)
            }
            ShardRole::Primary(node) => node.close(),
            ShardRole::Replica(node) => node.close(),
        }
    }
}
