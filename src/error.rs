//! Error types for flag resolution and the flags database.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for flag operations.
pub type Result<T> = std::result::Result<T, FlagsError>;

/// Errors raised by a [`CoordinationStore`](crate::store::CoordinationStore).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The coordination service cannot be reached.
    #[error("coordination store unavailable: {0}")]
    Unavailable(String),

    /// `create` was called for a path that already holds a node.
    #[error("node already exists: {0}")]
    NodeExists(String),

    /// `set` was called for a path with no node.
    #[error("no node at path: {0}")]
    NoNode(String),

    /// Any other failure reported by the backing implementation.
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Errors surfaced by flag sources and the flags database.
#[derive(Error, Debug)]
pub enum FlagsError {
    /// A flag id that cannot be used as a store path segment.
    #[error("invalid flag id {0:?}")]
    InvalidFlagId(String),

    /// Stored or supplied flag data that does not follow the wire format.
    #[error("malformed flag data: {0}")]
    Malformed(String),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// `set_value` was given data whose id differs from the target key.
    #[error("flag data for {found} cannot be stored under {expected}")]
    IdMismatch {
        /// The key the caller asked to write.
        expected: String,
        /// The id carried by the flag data.
        found: String,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    /// The initial bulk load did not complete in time.
    #[error("flags db initialization timed out after {0:?}")]
    InitTimeout(Duration),

    /// An operation was attempted in a lifecycle state that does not allow it.
    #[error("flags db is {0}, expected {1}")]
    InvalidState(&'static str, &'static str),

    #[error("flags db is closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),
}
