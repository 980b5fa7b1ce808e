//! Bulk document ingestion.
//!
//! A bulk request is split into [`IndexingJob`]s that run concurrently on the
//! index's indexing pool. The caller blocks until every job has finished.
//! Only the first failure is reported; jobs that succeeded are not rolled
//! back.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::IndexState;
use crate::data::{Document, Term};
use crate::error::{Result, ShardError};
use crate::index::taxonomy::DirectoryTaxonomyWriter;
use crate::index::writer::IndexWriter;
use crate::util::wait_group::WaitGroup;

/// How long [`PendingIndexing::wait`] waits before giving up with a warning.
pub const DEFAULT_INDEXING_TIMEOUT: Duration = Duration::from_secs(60);

/// One block of documents added atomically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexingJob {
    /// Position of the job in its bulk request.
    pub index: usize,
    /// When set, documents matching this term are replaced by the block.
    pub update_term: Option<Term>,
    pub documents: Vec<Document>,
}

impl IndexingJob {
    pub fn add(index: usize, documents: Vec<Document>) -> Self {
        Self {
            index,
            update_term: None,
            documents,
        }
    }

    pub fn update(index: usize, term: Term, documents: Vec<Document>) -> Self {
        Self {
            index,
            update_term: Some(term),
            documents,
        }
    }
}

/// Result of a successful bulk request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkIndexResponse {
    /// Writer sequence number covering every job of the request; pass it to
    /// `wait_for_generation` to wait until the documents are searchable.
    pub generation: u64,
    pub added_jobs: usize,
}

/// State shared by the jobs of one bulk request.
#[derive(Debug, Default)]
pub struct IndexingContext {
    error: Mutex<Option<ShardError>>,
    add_count: AtomicUsize,
    in_flight: WaitGroup,
}

impl IndexingContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep `error` unless an earlier one was recorded. Returns whether it was kept.
    pub fn record_error(&self, error: ShardError) -> bool {
        let mut slot = self.error.lock();
        if slot.is_some() {
            log::debug!("Discarding later indexing error: {error}");
            return false;
        }
        *slot = Some(error);
        true
    }

    pub fn has_error(&self) -> bool {
        self.error.lock().is_some()
    }

    pub fn take_error(&self) -> Option<ShardError> {
        self.error.lock().take()
    }

    /// Jobs that have finished, successfully or not.
    pub fn add_count(&self) -> usize {
        self.add_count.load(Ordering::Acquire)
    }

    /// Register `jobs` jobs before they are dispatched.
    pub fn register(&self, jobs: usize) {
        self.in_flight.add(jobs);
    }

    /// Block until every registered job has finished.
    pub fn wait(&self) {
        self.in_flight.wait();
    }

    fn job_finished(&self) {
        self.add_count.fetch_add(1, Ordering::AcqRel);
        self.in_flight.done();
    }
}

/// Counts the job as finished however it exits.
struct FinishGuard(Arc<IndexingContext>);

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.0.job_finished();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// One job bound to the writer it feeds.
pub struct AddDocumentsJob {
    job: IndexingJob,
    context: Arc<IndexingContext>,
    index: Arc<IndexState>,
    writer: Arc<dyn IndexWriter>,
    taxonomy: Option<Arc<DirectoryTaxonomyWriter>>,
}

impl AddDocumentsJob {
    pub fn new(
        job: IndexingJob,
        context: Arc<IndexingContext>,
        index: Arc<IndexState>,
        writer: Arc<dyn IndexWriter>,
        taxonomy: Option<Arc<DirectoryTaxonomyWriter>>,
    ) -> Self {
        Self {
            job,
            context,
            index,
            writer,
            taxonomy,
        }
    }

    /// Run the job, recording any failure in the shared context.
    pub fn run(self) {
        let _finished = FinishGuard(self.context.clone());
        let position = self.job.index;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.process()));
        let error = match outcome {
            Ok(Ok(_)) => return,
            Ok(Err(e)) => e,
            Err(payload) => ShardError::internal(format!(
                "indexing job panicked: {}",
                panic_message(payload.as_ref())
            )),
        };
        self.context
            .record_error(ShardError::indexing(position, error));
    }

    fn process(&self) -> Result<u64> {
        let facets = self.index.facets();
        let documents = if facets.is_empty() {
            self.job.documents.clone()
        } else {
            let taxonomy = self.taxonomy.as_ref().ok_or_else(|| {
                ShardError::unsupported("facet fields need a taxonomy writer")
            })?;
            self.job
                .documents
                .iter()
                .map(|doc| facets.build(taxonomy, doc.clone()))
                .collect::<Result<Vec<_>>>()?
        };
        match &self.job.update_term {
            Some(term) => self.writer.update_documents(term, documents),
            None => self.writer.add_documents(documents),
        }
    }
}

/// Runs bulk requests against one writer.
pub struct BulkIndexer {
    index: Arc<IndexState>,
    writer: Arc<dyn IndexWriter>,
    taxonomy: Option<Arc<DirectoryTaxonomyWriter>>,
}

impl BulkIndexer {
    pub fn new(
        index: Arc<IndexState>,
        writer: Arc<dyn IndexWriter>,
        taxonomy: Option<Arc<DirectoryTaxonomyWriter>>,
    ) -> Self {
        Self {
            index,
            writer,
            taxonomy,
        }
    }

    /// Run every job and wait for all of them.
    ///
    /// # Errors
    ///
    /// Returns the first recorded [`ShardError::Indexing`] once every job has
    /// finished.
    pub fn run(&self, jobs: Vec<IndexingJob>) -> Result<BulkIndexResponse> {
        let context = Arc::new(IndexingContext::new());
        self.run_with_context(jobs, &context)
    }

    /// [`run`](Self::run) with a caller-supplied context.
    pub fn run_with_context(
        &self,
        jobs: Vec<IndexingJob>,
        context: &Arc<IndexingContext>,
    ) -> Result<BulkIndexResponse> {
        context.register(jobs.len());
        let pool = self.index.indexing_pool();
        for job in jobs {
            let job = AddDocumentsJob::new(
                job,
                context.clone(),
                self.index.clone(),
                self.writer.clone(),
                self.taxonomy.clone(),
            );
            pool.spawn(move || job.run());
        }
        context.wait();

        if let Some(error) = context.take_error() {
            return Err(error);
        }
        Ok(BulkIndexResponse {
            generation: self.writer.max_completed_sequence_number(),
            added_jobs: context.add_count(),
        })
    }
}

/// A bulk request running on a helper thread.
#[derive(Debug)]
pub struct PendingIndexing {
    shard_name: String,
    receiver: Receiver<Result<BulkIndexResponse>>,
}

impl PendingIndexing {
    pub(crate) fn new(shard_name: String, receiver: Receiver<Result<BulkIndexResponse>>) -> Self {
        Self {
            shard_name,
            receiver,
        }
    }

    /// Wait up to `timeout` for the result. Logs a warning and returns `None`
    /// if the request is still running; it keeps running regardless.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<BulkIndexResponse>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => {
                log::warn!(
                    "Bulk indexing on {} did not finish within {timeout:?}",
                    self.shard_name
                );
                None
            }
            Err(RecvTimeoutError::Disconnected) => Some(Err(ShardError::internal(
                "bulk indexing thread exited without a result",
            ))),
        }
    }

    /// [`wait_timeout`](Self::wait_timeout) with [`DEFAULT_INDEXING_TIMEOUT`].
    pub fn wait(&self) -> Option<Result<BulkIndexResponse>> {
        self.wait_timeout(DEFAULT_INDEXING_TIMEOUT)
    }
}
