//! Error types for the shard runtime.
//!
//! Every fallible operation in this crate returns [`Result`], whose error type
//! is [`ShardError`]. Use [`ShardError::kind`] to classify an error without
//! matching on every variant.

use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, ShardError>;

/// Coarse classification of a [`ShardError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid lifecycle transition (start twice, unsupported role, use after close).
    Lifecycle,
    /// A bulk-indexing job failed.
    Ingestion,
    /// I/O or on-disk format failure.
    Resource,
    /// A requested entry (searcher version, snapshot, commit) does not exist.
    NotFound,
    /// Caller supplied an invalid argument or configuration.
    InvalidInput,
    /// Broken internal invariant.
    Internal,
}

/// Errors raised by the shard runtime.
#[derive(Error, Debug)]
pub enum ShardError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("shard \"{0}\" was already started")]
    AlreadyStarted(String),

    #[error("shard \"{0}\" is not started")]
    NotStarted(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("already closed: {0}")]
    AlreadyClosed(String),

    #[error("error while indexing document {index}: {source}")]
    Indexing {
        /// Position of the failing job in its bulk request.
        index: usize,
        #[source]
        source: Box<ShardError>,
    },

    #[error("corrupt index: {0}")]
    Corrupt(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ShardError {
    /// Create an unsupported-operation error.
    pub fn unsupported<S: Into<String>>(msg: S) -> Self {
        ShardError::Unsupported(msg.into())
    }

    /// Create an already-closed error.
    pub fn already_closed<S: Into<String>>(msg: S) -> Self {
        ShardError::AlreadyClosed(msg.into())
    }

    /// Wrap an error raised while processing the job at `index`.
    pub fn indexing(index: usize, source: ShardError) -> Self {
        ShardError::Indexing {
            index,
            source: Box::new(source),
        }
    }

    /// Create a corrupt-index error.
    pub fn corrupt<S: Into<String>>(msg: S) -> Self {
        ShardError::Corrupt(msg.into())
    }

    /// Create a not-found error.
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        ShardError::NotFound(msg.into())
    }

    /// Create an invalid-argument error.
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        ShardError::InvalidArgument(msg.into())
    }

    /// Create an invalid-config error.
    pub fn invalid_config<S: Into<String>>(msg: S) -> Self {
        ShardError::InvalidConfig(msg.into())
    }

    /// Create an internal error.
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        ShardError::Internal(msg.into())
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ShardError::AlreadyStarted(_)
            | ShardError::NotStarted(_)
            | ShardError::Unsupported(_)
            | ShardError::AlreadyClosed(_) => ErrorKind::Lifecycle,
            ShardError::Indexing { .. } => ErrorKind::Ingestion,
            ShardError::Io(_) | ShardError::Json(_) | ShardError::Corrupt(_) => {
                ErrorKind::Resource
            }
            ShardError::NotFound(_) => ErrorKind::NotFound,
            ShardError::InvalidArgument(_) | ShardError::InvalidConfig(_) => {
                ErrorKind::InvalidInput
            }
            ShardError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Position of the failing job when this is an ingestion error.
    pub fn job_index(&self) -> Option<usize> {
        match self {
            ShardError::Indexing { index, .. } => Some(*index),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            ShardError::AlreadyStarted("idx:0".into()).kind(),
            ErrorKind::Lifecycle
        );
        assert_eq!(ShardError::not_found("v7").kind(), ErrorKind::NotFound);
        assert_eq!(
            ShardError::from(std::io::Error::other("disk")).kind(),
            ErrorKind::Resource
        );
        assert_eq!(
            ShardError::invalid_config("bad").kind(),
            ErrorKind::InvalidInput
        );
    }

    #[test]
    fn test_indexing_error_keeps_position_and_source() {
        let err = ShardError::indexing(3, ShardError::invalid_argument("bad facet"));
        assert_eq!(err.kind(), ErrorKind::Ingestion);
        assert_eq!(err.job_index(), Some(3));
        assert_eq!(
            err.to_string(),
            "error while indexing document 3: invalid argument: bad facet"
        );
        assert!(std::error::Error::source(&err).is_some());
    }
}
