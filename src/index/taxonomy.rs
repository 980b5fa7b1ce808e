//! Facet taxonomy: assigns a stable ordinal to every category path.
//!
//! Ordinal 0 is the root (the empty path). Adding a path also adds each of
//! its ancestors, so the ordinal of a parent is always smaller than the
//! ordinals of its children. Ordinals are never reassigned.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use ahash::AHashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, ShardError};
use crate::index::OpenMode;
use crate::index::commit::{TAXONOMY_PREFIX, read_checked, write_durable};
use crate::index::deletion_policy::PersistentSnapshotDeletionPolicy;
use crate::storage::{Directory, file_name_from_generation, list_generations};

const DELIMITER: char = '\u{1f}';

fn encode_path(path: &[String]) -> String {
    path.join(&DELIMITER.to_string())
}

fn decode_path(label: &str) -> Vec<String> {
    if label.is_empty() {
        return Vec::new();
    }
    label.split(DELIMITER).map(str::to_string).collect()
}

#[derive(Debug, Serialize, Deserialize)]
struct TaxonomyCommit {
    generation: u64,
    labels: Vec<String>,
}

#[derive(Debug)]
struct TaxonomyState {
    labels: Vec<String>,
    ordinals: AHashMap<String, u32>,
    /// Last commit generation in the directory, including ones from earlier writers.
    generation: u64,
    /// Labels persisted by the last commit.
    committed_size: usize,
}

impl TaxonomyState {
    fn from_labels(labels: Vec<String>, generation: u64) -> Self {
        let ordinals = labels
            .iter()
            .enumerate()
            .map(|(ord, label)| (label.clone(), ord as u32))
            .collect();
        let committed_size = labels.len();
        Self {
            labels,
            ordinals,
            generation,
            committed_size,
        }
    }
}

/// Writer side of the taxonomy, stored in its own directory.
#[derive(Debug)]
pub struct DirectoryTaxonomyWriter {
    directory: Arc<dyn Directory>,
    policy: Arc<PersistentSnapshotDeletionPolicy>,
    state: Mutex<TaxonomyState>,
    closed: AtomicBool,
}

impl DirectoryTaxonomyWriter {
    pub fn open(
        directory: Arc<dyn Directory>,
        mode: OpenMode,
        policy: Arc<PersistentSnapshotDeletionPolicy>,
    ) -> Result<Self> {
        let last_generation = list_generations(directory.as_ref(), TAXONOMY_PREFIX)?
            .last()
            .copied();
        let state = match (mode, last_generation) {
            (OpenMode::Append, Some(generation)) => {
                let commit = Self::read_commit(directory.as_ref(), generation)?;
                TaxonomyState::from_labels(commit.labels, generation)
            }
            (OpenMode::Append, None) => {
                return Err(ShardError::not_found("no taxonomy commit to append to"));
            }
            (OpenMode::Create, generation) => {
                TaxonomyState::from_labels(vec![String::new()], generation.unwrap_or(0))
            }
        };
        log::debug!(
            "Opened taxonomy writer in {mode:?} mode with {} categories",
            state.labels.len()
        );
        Ok(Self {
            directory,
            policy,
            state: Mutex::new(state),
            closed: AtomicBool::new(false),
        })
    }

    fn read_commit(directory: &dyn Directory, generation: u64) -> Result<TaxonomyCommit> {
        let name = file_name_from_generation(TAXONOMY_PREFIX, generation);
        let commit: TaxonomyCommit = read_checked(directory, &name)?;
        if commit.labels.first().map(String::as_str) != Some("") {
            return Err(ShardError::corrupt(format!("{name}: missing root category")));
        }
        Ok(commit)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ShardError::already_closed("taxonomy writer"));
        }
        Ok(())
    }

    /// Ordinal of `path`, adding it and its ancestors when new.
    pub fn add_category(&self, path: &[String]) -> Result<u32> {
        self.ensure_open()?;
        if path.iter().any(|c| c.is_empty() || c.contains(DELIMITER)) {
            return Err(ShardError::invalid_argument(format!(
                "invalid category path {path:?}"
            )));
        }
        let mut state = self.state.lock();
        let mut ordinal = 0;
        for depth in 1..=path.len() {
            let label = encode_path(&path[..depth]);
            let existing = state.ordinals.get(&label).copied();
            ordinal = match existing {
                Some(ordinal) => ordinal,
                None => {
                    let ordinal = state.labels.len() as u32;
                    state.labels.push(label.clone());
                    state.ordinals.insert(label, ordinal);
                    ordinal
                }
            };
        }
        Ok(ordinal)
    }

    pub fn ordinal(&self, path: &[String]) -> Option<u32> {
        self.state.lock().ordinals.get(&encode_path(path)).copied()
    }

    /// Number of categories, including the root.
    pub fn size(&self) -> usize {
        self.state.lock().labels.len()
    }

    /// Persist every category added so far. Returns the new generation.
    pub fn commit(&self) -> Result<u64> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        let generation = state.generation + 1;
        let commit = TaxonomyCommit {
            generation,
            labels: state.labels.clone(),
        };
        write_durable(
            self.directory.as_ref(),
            &file_name_from_generation(TAXONOMY_PREFIX, generation),
            &commit,
        )?;
        state.generation = generation;
        state.committed_size = commit.labels.len();
        drop(state);
        self.policy.on_commit(generation)?;
        Ok(generation)
    }

    /// Whether categories were added since the last commit.
    pub fn has_uncommitted_changes(&self) -> bool {
        let state = self.state.lock();
        state.labels.len() != state.committed_size
    }

    /// Reader over every category added so far, committed or not.
    pub fn reader(&self) -> TaxonomyReader {
        TaxonomyReader {
            labels: Arc::new(self.state.lock().labels.clone()),
        }
    }

    /// Reader over the taxonomy as of commit `generation`.
    pub fn open_commit(&self, generation: u64) -> Result<TaxonomyReader> {
        let commit = Self::read_commit(self.directory.as_ref(), generation)?;
        Ok(TaxonomyReader {
            labels: Arc::new(commit.labels),
        })
    }

    pub fn policy(&self) -> &Arc<PersistentSnapshotDeletionPolicy> {
        &self.policy
    }

    pub fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Immutable view of the taxonomy at one point in time.
#[derive(Debug, Clone)]
pub struct TaxonomyReader {
    labels: Arc<Vec<String>>,
}

impl TaxonomyReader {
    pub fn size(&self) -> usize {
        self.labels.len()
    }

    /// Category path of `ordinal`; the root resolves to an empty path.
    pub fn path(&self, ordinal: u32) -> Option<Vec<String>> {
        self.labels
            .get(ordinal as usize)
            .map(|label| decode_path(label))
    }

    pub fn ordinal(&self, path: &[String]) -> Option<u32> {
        let label = encode_path(path);
        self.labels
            .iter()
            .position(|l| *l == label)
            .map(|ord| ord as u32)
    }
}
