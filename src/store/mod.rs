pub mod memory;
#[cfg(feature = "sled-store")]
pub mod sled_store;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::StoreError;

/// A change to a direct child of a watched path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildEvent {
    Added { name: String, data: Vec<u8> },
    Updated { name: String, data: Vec<u8> },
    Removed { name: String },
}

impl ChildEvent {
    pub fn name(&self) -> &str {
        match self {
            ChildEvent::Added { name, .. }
            | ChildEvent::Updated { name, .. }
            | ChildEvent::Removed { name } => name,
        }
    }
}

/// A hierarchical key-value store with `/`-separated paths whose
/// directories can be watched. Implementations must be thread-safe.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn exists(&self, path: &str) -> Result<bool, StoreError>;

    /// Creates a node; fails with [`StoreError::NodeExists`] if one is there.
    async fn create(&self, path: &str, data: &[u8]) -> Result<(), StoreError>;

    /// Replaces a node's payload; fails with [`StoreError::NoNode`] if absent.
    async fn set(&self, path: &str, data: &[u8]) -> Result<(), StoreError>;

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Deletes a node. Returns whether there was one to delete.
    async fn delete(&self, path: &str) -> Result<bool, StoreError>;

    /// Name and payload of every direct child of `path`.
    async fn children(&self, path: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError>;

    /// Subscribes to changes of the direct children of `path`. Events are
    /// delivered until the receiver is dropped.
    async fn watch_children(
        &self,
        path: &str,
    ) -> Result<mpsc::UnboundedReceiver<ChildEvent>, StoreError>;
}

/// Joins a directory path and a child name.
pub fn child_path(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name)
}

/// Splits a path into its parent directory and final segment.
pub fn split_path(path: &str) -> Option<(&str, &str)> {
    let (parent, name) = path.rsplit_once('/')?;
    if name.is_empty() {
        None
    } else {
        Some((parent, name))
    }
}
