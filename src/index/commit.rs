//! On-disk commit points.
//!
//! Every persisted file is a JSON body followed by a little-endian CRC32 of
//! that body. A commit point captures the live documents of the index at a
//! generation together with the version of the view they belong to.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::data::Document;
use crate::error::{Result, ShardError};
use crate::storage::{Directory, file_name_from_generation, list_generations};

/// File prefix of index commit points.
pub const SEGMENTS_PREFIX: &str = "segments";
/// File prefix of taxonomy commits.
pub const TAXONOMY_PREFIX: &str = "taxonomy";
/// File prefix of persisted snapshot reference counts.
pub const SNAPSHOTS_PREFIX: &str = "snapshots";

/// User-data key holding the RFC 3339 commit timestamp.
pub const COMMIT_TIME_KEY: &str = "commit_time";

const CHECKSUM_LEN: usize = 4;

/// Serialize `value` and append its checksum.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(value)?;
    let checksum = crc32fast::hash(&bytes);
    bytes.extend_from_slice(&checksum.to_le_bytes());
    Ok(bytes)
}

/// Verify the checksum of `bytes` and deserialize the body.
pub fn decode<T: DeserializeOwned>(name: &str, bytes: &[u8]) -> Result<T> {
    if bytes.len() < CHECKSUM_LEN {
        return Err(ShardError::corrupt(format!("{name}: truncated file")));
    }
    let (body, trailer) = bytes.split_at(bytes.len() - CHECKSUM_LEN);
    let mut expected = [0u8; CHECKSUM_LEN];
    expected.copy_from_slice(trailer);
    let expected = u32::from_le_bytes(expected);
    let actual = crc32fast::hash(body);
    if expected != actual {
        return Err(ShardError::corrupt(format!(
            "{name}: checksum mismatch (expected {expected:#010x}, got {actual:#010x})"
        )));
    }
    Ok(serde_json::from_slice(body)?)
}

/// Write `value` to `name` and make it durable.
pub fn write_durable<T: Serialize>(directory: &dyn Directory, name: &str, value: &T) -> Result<()> {
    directory.write_file(name, &encode(value)?)?;
    directory.sync(&[name.to_string()])
}

pub fn read_checked<T: DeserializeOwned>(directory: &dyn Directory, name: &str) -> Result<T> {
    decode(name, &directory.read_file(name)?)
}

/// Live documents of an index at one generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitPoint {
    pub generation: u64,
    /// Version of the view this commit was taken from.
    pub version: u64,
    pub documents: Vec<Document>,
    #[serde(default)]
    pub user_data: BTreeMap<String, String>,
}

impl CommitPoint {
    /// Build a commit point stamped with the current time.
    pub fn new(generation: u64, version: u64, documents: Vec<Document>) -> Self {
        let mut user_data = BTreeMap::new();
        user_data.insert(COMMIT_TIME_KEY.to_string(), Utc::now().to_rfc3339());
        Self {
            generation,
            version,
            documents,
            user_data,
        }
    }

    pub fn file_name(&self) -> String {
        file_name_from_generation(SEGMENTS_PREFIX, self.generation)
    }

    pub fn commit_time(&self) -> Option<DateTime<Utc>> {
        self.user_data
            .get(COMMIT_TIME_KEY)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
    }

    pub fn write(&self, directory: &dyn Directory) -> Result<()> {
        write_durable(directory, &self.file_name(), self)
    }

    /// Read the commit point of `generation`.
    pub fn read(directory: &dyn Directory, generation: u64) -> Result<Self> {
        let name = file_name_from_generation(SEGMENTS_PREFIX, generation);
        if !directory.file_exists(&name) {
            return Err(ShardError::not_found(format!("commit {name}")));
        }
        let commit: CommitPoint = read_checked(directory, &name)?;
        if commit.generation != generation {
            return Err(ShardError::corrupt(format!(
                "{name} records generation {}",
                commit.generation
            )));
        }
        Ok(commit)
    }

    /// The newest commit point in `directory`, if any.
    pub fn latest(directory: &dyn Directory) -> Result<Option<Self>> {
        match list_generations(directory, SEGMENTS_PREFIX)?.last() {
            Some(&generation) => Ok(Some(Self::read(directory, generation)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryDirectory;

    #[test]
    fn test_commit_point_survives_write_and_read() {
        let dir = MemoryDirectory::new();
        let docs = vec![Document::new_with_id("a").add_text("title", "hello")];
        let commit = CommitPoint::new(3, 17, docs);
        commit.write(&dir).unwrap();

        let loaded = CommitPoint::read(&dir, 3).unwrap();
        assert_eq!(loaded, commit);
        assert!(loaded.commit_time().is_some());
        assert_eq!(CommitPoint::latest(&dir).unwrap().unwrap().version, 17);
    }

    #[test]
    fn test_checksum_mismatch_is_corrupt() {
        let dir = MemoryDirectory::new();
        CommitPoint::new(1, 1, Vec::new()).write(&dir).unwrap();

        let mut bytes = dir.read_file("segments_1").unwrap();
        bytes[0] ^= 0xff;
        dir.write_file("segments_1", &bytes).unwrap();

        assert!(matches!(
            CommitPoint::read(&dir, 1),
            Err(ShardError::Corrupt(_))
        ));
        assert!(matches!(
            decode::<CommitPoint>("x", &[1, 2]),
            Err(ShardError::Corrupt(_))
        ));
    }

    #[test]
    fn test_latest_on_empty_directory() {
        let dir = MemoryDirectory::new();
        assert!(CommitPoint::latest(&dir).unwrap().is_none());
        assert!(matches!(
            CommitPoint::read(&dir, 1),
            Err(ShardError::NotFound(_))
        ));
    }
}
