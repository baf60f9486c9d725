//! Crate-wide error type and result alias.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TreeError>;

/// Every failure surface of the crate: verb validation, backing I/O, the
/// wire protocol, and configuration.
#[derive(Debug, Error)]
pub enum TreeError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Optimistic-concurrency failure: the presented ctime does not match
    /// the target's current one.
    #[error("conflict at {path}: expected ctime {expected}, found {found}")]
    Conflict {
        path: String,
        expected: i64,
        found: i64,
    },

    /// The path runs through a file, carries a traversal segment, or the
    /// operation would orphan a directory inside its own subtree.
    #[error("invalid parent: {0}")]
    InvalidParent(String),

    /// The repository or connection is not open.
    #[error("closed")]
    Closed,

    /// A registered type's validator rejected the payload.
    #[error("payload failed validation for type '{0}'")]
    Invalid(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Malformed or unexpected wire traffic.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A correlated request got no response in time.
    #[error("request {0} timed out")]
    Timeout(u64),

    /// The authority answered a verb with an error.
    #[error("remote error: {0}")]
    Remote(String),

    #[error("config error: {0}")]
    Config(String),
}

impl TreeError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, TreeError::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, TreeError::NotFound(_))
    }
}
