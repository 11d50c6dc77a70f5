use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::{ChildEvent, CoordinationStore};
use crate::error::StoreError;

/// Persistent coordination store backed by sled, keyed by full path.
///
/// Suited to a single host, or to tests that need data to survive a
/// restart. Watches are driven by `sled::Tree::watch_prefix`; each one runs
/// a forwarding task that ends once its receiver is dropped.
pub struct SledStore {
    db: sled::Db,
    watches: Mutex<Vec<JoinHandle<()>>>,
}

impl SledStore {
    pub fn new(db: sled::Db) -> Self {
        Self {
            db,
            watches: Mutex::new(Vec::new()),
        }
    }

    /// Number of watch forwarding tasks still running.
    pub fn active_watches(&self) -> usize {
        let mut watches = self.watches.lock().unwrap_or_else(PoisonError::into_inner);
        watches.retain(|handle| !handle.is_finished());
        watches.len()
    }

    /// Open a sled database at the given directory path.
    pub fn open(data_dir: &str) -> Result<Self, StoreError> {
        let db = sled::open(data_dir).map_err(backend)?;
        Ok(Self::new(db))
    }

    fn dir_prefix(path: &str) -> String {
        format!("{}/", path.trim_end_matches('/'))
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.db.flush().map_err(backend)?;
        Ok(())
    }
}

fn backend(e: sled::Error) -> StoreError {
    match e {
        sled::Error::Io(io) => StoreError::Unavailable(io.to_string()),
        other => StoreError::Backend(other.to_string()),
    }
}

/// The child name for `key` under `prefix`, if it is a direct child.
fn direct_child(prefix: &str, key: &[u8]) -> Option<String> {
    let key = std::str::from_utf8(key).ok()?;
    let name = key.strip_prefix(prefix)?;
    (!name.is_empty() && !name.contains('/')).then(|| name.to_string())
}

#[async_trait]
impl CoordinationStore for SledStore {
    async fn exists(&self, path: &str) -> Result<bool, StoreError> {
        self.db.contains_key(path).map_err(backend)
    }

    async fn create(&self, path: &str, data: &[u8]) -> Result<(), StoreError> {
        let swapped = self
            .db
            .compare_and_swap(path, None as Option<&[u8]>, Some(data))
            .map_err(backend)?;
        if swapped.is_err() {
            return Err(StoreError::NodeExists(path.to_string()));
        }
        self.flush()
    }

    async fn set(&self, path: &str, data: &[u8]) -> Result<(), StoreError> {
        let updated = self
            .db
            .fetch_and_update(path, |old| old.map(|_| data.to_vec()))
            .map_err(backend)?;
        if updated.is_none() {
            return Err(StoreError::NoNode(path.to_string()));
        }
        self.flush()
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.db.get(path).map_err(backend)?.map(|ivec| ivec.to_vec()))
    }

    async fn delete(&self, path: &str) -> Result<bool, StoreError> {
        let removed = self.db.remove(path).map_err(backend)?.is_some();
        if removed {
            self.flush()?;
        }
        Ok(removed)
    }

    async fn children(&self, path: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let prefix = Self::dir_prefix(path);
        let mut children = Vec::new();
        for item in self.db.scan_prefix(&prefix) {
            let (key, value) = item.map_err(backend)?;
            if let Some(name) = direct_child(&prefix, &key) {
                children.push((name, value.to_vec()));
            }
        }
        Ok(children)
    }

    async fn watch_children(
        &self,
        path: &str,
    ) -> Result<mpsc::UnboundedReceiver<ChildEvent>, StoreError> {
        let prefix = Self::dir_prefix(path);
        // subscribe before listing so no write falls between the two
        let mut subscriber = self.db.watch_prefix(&prefix);
        let mut known: HashSet<String> = self
            .children(path)
            .await?
            .into_iter()
            .map(|(name, _)| name)
            .collect();

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = tx.closed() => break,
                    event = &mut subscriber => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                let child = match event {
                    sled::Event::Insert { key, value } => {
                        direct_child(&prefix, &key).map(|name| {
                            let data = value.to_vec();
                            if known.insert(name.clone()) {
                                ChildEvent::Added { name, data }
                            } else {
                                ChildEvent::Updated { name, data }
                            }
                        })
                    }
                    sled::Event::Remove { key } => direct_child(&prefix, &key).map(|name| {
                        known.remove(&name);
                        ChildEvent::Removed { name }
                    }),
                };
                let Some(child) = child else { continue };
                if tx.send(child).is_err() {
                    break;
                }
            }
            debug!(prefix = %prefix, "sled watch ended");
        });

        let mut watches = self.watches.lock().unwrap_or_else(PoisonError::into_inner);
        watches.retain(|handle| !handle.is_finished());
        watches.push(handle);
        Ok(rx)
    }
}
