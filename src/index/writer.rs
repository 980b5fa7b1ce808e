//! Index writers.
//!
//! An [`IndexWriter`] serializes its own mutations. Every mutation returns a
//! sequence number and advances the writer's version; [`IndexWriter::commit`]
//! persists the current documents under a new generation.

use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::data::{Document, Term};
use crate::error::{Result, ShardError};
use crate::index::OpenMode;
use crate::index::commit::CommitPoint;
use crate::index::deletion_policy::PersistentSnapshotDeletionPolicy;
use crate::index::searcher::IndexSearcher;
use crate::storage::Directory;

/// Mutation and commit surface of an index.
pub trait IndexWriter: Send + Sync + Debug {
    /// Add a block of documents. Returns the mutation's sequence number.
    fn add_documents(&self, docs: Vec<Document>) -> Result<u64>;

    /// Atomically delete every document matching `term`, then add `docs`.
    fn update_documents(&self, term: &Term, docs: Vec<Document>) -> Result<u64>;

    /// Delete every document matching any of `terms`.
    fn delete_documents(&self, terms: &[Term]) -> Result<u64>;

    /// Persist the current documents. Returns the new, strictly larger generation.
    fn commit(&self) -> Result<u64>;

    /// Highest sequence number whose mutation has been applied.
    fn max_completed_sequence_number(&self) -> u64;

    /// Version of the current (possibly uncommitted) document set.
    fn version(&self) -> u64;

    fn last_commit_generation(&self) -> Option<u64>;

    fn has_uncommitted_changes(&self) -> bool;

    fn num_docs(&self) -> usize;

    /// Searcher over every applied mutation, committed or not.
    fn open_view(&self) -> Result<IndexSearcher>;

    /// Searcher over the documents persisted at `generation`.
    fn open_commit(&self, generation: u64) -> Result<IndexSearcher>;

    fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;
}

/// Opens the writer for a shard's index directory.
pub trait IndexWriterFactory: Send + Sync + Debug {
    fn open(
        &self,
        directory: Arc<dyn Directory>,
        mode: OpenMode,
        policy: Arc<PersistentSnapshotDeletionPolicy>,
    ) -> Result<Arc<dyn IndexWriter>>;
}

/// Factory for [`SegmentIndexWriter`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultIndexWriterFactory;

impl IndexWriterFactory for DefaultIndexWriterFactory {
    fn open(
        &self,
        directory: Arc<dyn Directory>,
        mode: OpenMode,
        policy: Arc<PersistentSnapshotDeletionPolicy>,
    ) -> Result<Arc<dyn IndexWriter>> {
        Ok(Arc::new(SegmentIndexWriter::open(directory, mode, policy)?))
    }
}

#[derive(Debug)]
struct WriterState {
    /// Copy-on-write so open views keep their own snapshot.
    docs: Arc<Vec<Arc<Document>>>,
    version: u64,
    /// Highest generation ever written to the directory.
    generation: u64,
    /// Generation of the last commit this writer's documents are based on.
    last_commit: Option<u64>,
    committed_version: Option<u64>,
}

/// Writer keeping live documents in memory and committing them as
/// [`CommitPoint`]s.
#[derive(Debug)]
pub struct SegmentIndexWriter {
    directory: Arc<dyn Directory>,
    policy: Arc<PersistentSnapshotDeletionPolicy>,
    state: Mutex<WriterState>,
    sequence: AtomicU64,
    closed: AtomicBool,
}

impl SegmentIndexWriter {
    pub fn open(
        directory: Arc<dyn Directory>,
        mode: OpenMode,
        policy: Arc<PersistentSnapshotDeletionPolicy>,
    ) -> Result<Self> {
        let latest = CommitPoint::latest(directory.as_ref())?;
        let state = match (mode, latest) {
            (OpenMode::Append, Some(commit)) => WriterState {
                docs: Arc::new(commit.documents.into_iter().map(Arc::new).collect()),
                version: commit.version,
                generation: commit.generation,
                last_commit: Some(commit.generation),
                committed_version: Some(commit.version),
            },
            (OpenMode::Append, None) => {
                return Err(ShardError::not_found("no index commit to append to"));
            }
            // Keep numbering past old commits so generations and versions are never reused.
            (OpenMode::Create, latest) => WriterState {
                docs: Arc::new(Vec::new()),
                version: latest.as_ref().map_or(0, |c| c.version + 1),
                generation: latest.as_ref().map_or(0, |c| c.generation),
                last_commit: None,
                committed_version: None,
            },
        };
        log::debug!(
            "Opened index writer in {mode:?} mode at version {} with {} documents",
            state.version,
            state.docs.len()
        );
        Ok(Self {
            directory,
            policy,
            state: Mutex::new(state),
            sequence: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ShardError::already_closed("index writer"));
        }
        Ok(())
    }

    /// Apply `mutate` to the live documents as one versioned mutation.
    fn mutate<F>(&self, mutate: F) -> Result<u64>
    where
        F: FnOnce(&mut Vec<Arc<Document>>),
    {
        self.ensure_open()?;
        let mut state = self.state.lock();
        mutate(Arc::make_mut(&mut state.docs));
        state.version += 1;
        Ok(self.sequence.fetch_add(1, Ordering::AcqRel) + 1)
    }
}

impl IndexWriter for SegmentIndexWriter {
    fn add_documents(&self, docs: Vec<Document>) -> Result<u64> {
        self.mutate(|live| live.extend(docs.into_iter().map(Arc::new)))
    }

    fn update_documents(&self, term: &Term, docs: Vec<Document>) -> Result<u64> {
        self.mutate(|live| {
            live.retain(|doc| !term.matches(doc));
            live.extend(docs.into_iter().map(Arc::new));
        })
    }

    fn delete_documents(&self, terms: &[Term]) -> Result<u64> {
        self.mutate(|live| live.retain(|doc| !terms.iter().any(|t| t.matches(doc))))
    }

    fn commit(&self) -> Result<u64> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        let generation = state.generation + 1;
        let documents = state.docs.iter().map(|doc| doc.as_ref().clone()).collect();
        CommitPoint::new(generation, state.version, documents).write(self.directory.as_ref())?;
        state.generation = generation;
        state.last_commit = Some(generation);
        state.committed_version = Some(state.version);
        drop(state);

        self.policy.on_commit(generation)?;
        log::debug!("Committed index generation {generation}");
        Ok(generation)
    }

    fn max_completed_sequence_number(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }

    fn version(&self) -> u64 {
        self.state.lock().version
    }

    fn last_commit_generation(&self) -> Option<u64> {
        self.state.lock().last_commit
    }

    fn has_uncommitted_changes(&self) -> bool {
        let state = self.state.lock();
        state.committed_version != Some(state.version)
    }

    fn num_docs(&self) -> usize {
        self.state.lock().docs.len()
    }

    fn open_view(&self) -> Result<IndexSearcher> {
        self.ensure_open()?;
        let state = self.state.lock();
        Ok(IndexSearcher::new(
            state.version,
            state.last_commit,
            state.docs.clone(),
        ))
    }

    fn open_commit(&self, generation: u64) -> Result<IndexSearcher> {
        let commit = CommitPoint::read(self.directory.as_ref(), generation)?;
        let docs = commit.documents.into_iter().map(Arc::new).collect();
        Ok(IndexSearcher::new(
            commit.version,
            Some(generation),
            Arc::new(docs),
        ))
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::commit::SEGMENTS_PREFIX;
    use crate::storage::memory::MemoryDirectory;

    fn open(dir: &Arc<dyn Directory>, mode: OpenMode) -> Result<SegmentIndexWriter> {
        let policy = Arc::new(PersistentSnapshotDeletionPolicy::open(
            dir.clone(),
            SEGMENTS_PREFIX,
        )?);
        SegmentIndexWriter::open(dir.clone(), mode, policy)
    }

    fn doc(id: &str, title: &str) -> Document {
        Document::new_with_id(id).add_text("title", title)
    }

    #[test]
    fn test_mutations_advance_sequence_and_version() {
        let dir: Arc<dyn Directory> = Arc::new(MemoryDirectory::new());
        let writer = open(&dir, OpenMode::Create).unwrap();

        assert_eq!(writer.add_documents(vec![doc("1", "a"), doc("2", "b")]).unwrap(), 1);
        let seq = writer
            .update_documents(&Term::new("_id", "1"), vec![doc("1", "c")])
            .unwrap();
        assert_eq!(seq, 2);
        assert_eq!(writer.max_completed_sequence_number(), 2);
        assert_eq!(writer.version(), 2);
        assert_eq!(writer.num_docs(), 2);

        writer.delete_documents(&[Term::new("title", "b")]).unwrap();
        let view = writer.open_view().unwrap();
        assert_eq!(view.num_docs().unwrap(), 1);
        assert_eq!(view.count(&Term::new("title", "c")).unwrap(), 1);
    }

    #[test]
    fn test_views_are_isolated_from_later_mutations() {
        let dir: Arc<dyn Directory> = Arc::new(MemoryDirectory::new());
        let writer = open(&dir, OpenMode::Create).unwrap();
        writer.add_documents(vec![doc("1", "a")]).unwrap();
        let view = writer.open_view().unwrap();
        writer.add_documents(vec![doc("2", "b")]).unwrap();

        assert_eq!(view.num_docs().unwrap(), 1);
        assert_eq!(writer.open_view().unwrap().num_docs().unwrap(), 2);
    }

    #[test]
    fn test_commit_generations_increase_across_reopen() {
        let dir: Arc<dyn Directory> = Arc::new(MemoryDirectory::new());
        let writer = open(&dir, OpenMode::Create).unwrap();
        writer.add_documents(vec![doc("1", "a")]).unwrap();
        assert!(writer.has_uncommitted_changes());
        assert_eq!(writer.commit().unwrap(), 1);
        assert!(!writer.has_uncommitted_changes());
        assert_eq!(writer.commit().unwrap(), 2);
        writer.close().unwrap();
        assert!(matches!(writer.commit(), Err(ShardError::AlreadyClosed(_))));

        let appended = open(&dir, OpenMode::Append).unwrap();
        assert_eq!(appended.num_docs(), 1);
        assert_eq!(appended.last_commit_generation(), Some(2));
        assert_eq!(appended.commit().unwrap(), 3);

        let recreated = open(&dir, OpenMode::Create).unwrap();
        assert_eq!(recreated.num_docs(), 0);
        assert!(recreated.version() > appended.version());
        assert_eq!(recreated.commit().unwrap(), 4);
    }

    #[test]
    fn test_append_without_commit_fails() {
        let dir: Arc<dyn Directory> = Arc::new(MemoryDirectory::new());
        assert!(matches!(
            open(&dir, OpenMode::Append),
            Err(ShardError::NotFound(_))
        ));
    }

    #[test]
    fn test_open_commit_reads_persisted_documents() {
        let dir: Arc<dyn Directory> = Arc::new(MemoryDirectory::new());
        let writer = open(&dir, OpenMode::Create).unwrap();
        writer.add_documents(vec![doc("1", "a")]).unwrap();
        let generation = writer.commit().unwrap();
        writer.add_documents(vec![doc("2", "b")]).unwrap();

        let searcher = writer.open_commit(generation).unwrap();
        assert_eq!(searcher.num_docs().unwrap(), 1);
        assert_eq!(searcher.version(), 1);
        assert_eq!(searcher.generation(), Some(generation));
    }
}
