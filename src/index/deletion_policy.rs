//! Commit retention with durable snapshots.
//!
//! Only the latest commit of a directory is kept, plus every commit that has
//! been snapshotted. Snapshot reference counts are persisted to
//! `snapshots_<n>` after every change, so a snapshot taken before a restart
//! still protects its commit afterwards.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, ShardError};
use crate::index::commit::{SNAPSHOTS_PREFIX, read_checked, write_durable};
use crate::storage::{Directory, file_name_from_generation, list_generations};

#[derive(Debug, Default, Serialize, Deserialize)]
struct SnapshotRefs {
    /// Commit generation to number of outstanding snapshots.
    refcounts: BTreeMap<u64, u32>,
}

#[derive(Debug)]
struct PolicyState {
    refs: SnapshotRefs,
    last_commit: Option<u64>,
    next_refs_generation: u64,
}

/// Deletion policy that keeps the last commit and every snapshotted commit.
#[derive(Debug)]
pub struct PersistentSnapshotDeletionPolicy {
    directory: Arc<dyn Directory>,
    commit_prefix: &'static str,
    state: Mutex<PolicyState>,
}

impl PersistentSnapshotDeletionPolicy {
    /// Load the policy for the commits named `<commit_prefix>_<gen>` in `directory`.
    pub fn open(directory: Arc<dyn Directory>, commit_prefix: &'static str) -> Result<Self> {
        let refs_generations = list_generations(directory.as_ref(), SNAPSHOTS_PREFIX)?;
        let refs = match refs_generations.last() {
            Some(&generation) => read_checked(
                directory.as_ref(),
                &file_name_from_generation(SNAPSHOTS_PREFIX, generation),
            )?,
            None => SnapshotRefs::default(),
        };
        let commits = list_generations(directory.as_ref(), commit_prefix)?;
        for generation in refs.refcounts.keys() {
            if !commits.contains(generation) {
                return Err(ShardError::corrupt(format!(
                    "snapshotted commit {} is missing",
                    file_name_from_generation(commit_prefix, *generation)
                )));
            }
        }
        Ok(Self {
            directory,
            commit_prefix,
            state: Mutex::new(PolicyState {
                refs,
                last_commit: commits.last().copied(),
                next_refs_generation: refs_generations.last().map_or(1, |g| g + 1),
            }),
        })
    }

    /// Record a new commit and delete commits nothing protects anymore.
    pub fn on_commit(&self, generation: u64) -> Result<()> {
        let mut state = self.state.lock();
        state.last_commit = Some(generation);
        self.delete_unreferenced(&state)
    }

    /// Pin the last commit. Returns its generation.
    pub fn snapshot(&self) -> Result<u64> {
        let mut state = self.state.lock();
        let generation = state
            .last_commit
            .ok_or_else(|| ShardError::not_found("no commit to snapshot"))?;
        *state.refs.refcounts.entry(generation).or_insert(0) += 1;
        self.persist(&mut state)?;
        Ok(generation)
    }

    /// Drop one snapshot reference to `generation`.
    pub fn release(&self, generation: u64) -> Result<()> {
        let mut state = self.state.lock();
        let count = state
            .refs
            .refcounts
            .get_mut(&generation)
            .ok_or_else(|| ShardError::not_found(format!("snapshot of generation {generation}")))?;
        *count -= 1;
        if *count == 0 {
            state.refs.refcounts.remove(&generation);
        }
        self.persist(&mut state)?;
        self.delete_unreferenced(&state)
    }

    /// Generations with at least one outstanding snapshot, ascending.
    pub fn snapshotted_generations(&self) -> Vec<u64> {
        self.state.lock().refs.refcounts.keys().copied().collect()
    }

    pub fn snapshot_count(&self) -> usize {
        self.state.lock().refs.refcounts.values().map(|c| *c as usize).sum()
    }

    pub fn last_commit(&self) -> Option<u64> {
        self.state.lock().last_commit
    }

    fn persist(&self, state: &mut PolicyState) -> Result<()> {
        let generation = state.next_refs_generation;
        let name = file_name_from_generation(SNAPSHOTS_PREFIX, generation);
        write_durable(self.directory.as_ref(), &name, &state.refs)?;
        state.next_refs_generation += 1;

        for old in list_generations(self.directory.as_ref(), SNAPSHOTS_PREFIX)? {
            if old < generation {
                self.directory
                    .delete_file(&file_name_from_generation(SNAPSHOTS_PREFIX, old))?;
            }
        }
        Ok(())
    }

    fn delete_unreferenced(&self, state: &PolicyState) -> Result<()> {
        let Some(last) = state.last_commit else {
            return Ok(());
        };
        for generation in list_generations(self.directory.as_ref(), self.commit_prefix)? {
            if generation < last && !state.refs.refcounts.contains_key(&generation) {
                let name = file_name_from_generation(self.commit_prefix, generation);
                log::debug!("Deleting unreferenced commit {name}");
                self.directory.delete_file(&name)?;
            }
        }
        Ok(())
    }
}
