use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};

use super::{split_path, ChildEvent, CoordinationStore};
use crate::error::StoreError;

/// In-memory coordination store backed by a `RwLock<BTreeMap>`.
///
/// Parent directories are implicit. [`MemoryStore::set_available`] lets
/// tests simulate the coordination service going away.
pub struct MemoryStore {
    data: RwLock<BTreeMap<String, Vec<u8>>>,
    watchers: Mutex<Vec<(String, mpsc::UnboundedSender<ChildEvent>)>>,
    available: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(BTreeMap::new()),
            watchers: Mutex::new(Vec::new()),
            available: AtomicBool::new(true),
        }
    }

    /// When unavailable, every operation fails with [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Writes a payload without any validation, as an operator with direct
    /// store access could.
    pub async fn put_raw(&self, path: &str, data: &[u8]) {
        let mut nodes = self.data.write().await;
        let existed = nodes.insert(path.to_string(), data.to_vec()).is_some();
        self.notify(path, |name| {
            if existed {
                ChildEvent::Updated { name, data: data.to_vec() }
            } else {
                ChildEvent::Added { name, data: data.to_vec() }
            }
        });
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store is offline".to_string()))
        }
    }

    /// Sends an event to every watcher of the path's parent. Called with the
    /// data lock held so watchers see writes in order.
    fn notify(&self, path: &str, event: impl Fn(String) -> ChildEvent) {
        let Some((parent, name)) = split_path(path) else {
            return;
        };
        let mut watchers = self.watchers.lock().unwrap_or_else(PoisonError::into_inner);
        watchers.retain(|(dir, tx)| {
            if dir.trim_end_matches('/') != parent {
                return !tx.is_closed();
            }
            tx.send(event(name.to_string())).is_ok()
        });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn exists(&self, path: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        Ok(self.data.read().await.contains_key(path))
    }

    async fn create(&self, path: &str, data: &[u8]) -> Result<(), StoreError> {
        self.check_available()?;
        let mut nodes = self.data.write().await;
        if nodes.contains_key(path) {
            return Err(StoreError::NodeExists(path.to_string()));
        }
        nodes.insert(path.to_string(), data.to_vec());
        self.notify(path, |name| ChildEvent::Added {
            name,
            data: data.to_vec(),
        });
        Ok(())
    }

    async fn set(&self, path: &str, data: &[u8]) -> Result<(), StoreError> {
        self.check_available()?;
        let mut nodes = self.data.write().await;
        let Some(node) = nodes.get_mut(path) else {
            return Err(StoreError::NoNode(path.to_string()));
        };
        *node = data.to_vec();
        self.notify(path, |name| ChildEvent::Updated {
            name,
            data: data.to_vec(),
        });
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.check_available()?;
        Ok(self.data.read().await.get(path).cloned())
    }

    async fn delete(&self, path: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut nodes = self.data.write().await;
        if nodes.remove(path).is_none() {
            return Ok(false);
        }
        self.notify(path, |name| ChildEvent::Removed { name });
        Ok(true)
    }

    async fn children(&self, path: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        self.check_available()?;
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let nodes = self.data.read().await;
        Ok(nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, value)| {
                let name = &key[prefix.len()..];
                (!name.is_empty() && !name.contains('/')).then(|| (name.to_string(), value.clone()))
            })
            .collect())
    }

    async fn watch_children(
        &self,
        path: &str,
    ) -> Result<mpsc::UnboundedReceiver<ChildEvent>, StoreError> {
        self.check_available()?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((path.trim_end_matches('/').to_string(), tx));
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_set_get_delete() {
        let store = MemoryStore::new();
        assert!(!store.exists("/f/a").await.unwrap());
        assert_eq!(
            store.set("/f/a", b"x").await,
            Err(StoreError::NoNode("/f/a".to_string()))
        );

        store.create("/f/a", b"1").await.unwrap();
        assert_eq!(
            store.create("/f/a", b"2").await,
            Err(StoreError::NodeExists("/f/a".to_string()))
        );
        store.set("/f/a", b"2").await.unwrap();
        assert_eq!(store.get("/f/a").await.unwrap(), Some(b"2".to_vec()));

        assert!(store.delete("/f/a").await.unwrap());
        assert!(!store.delete("/f/a").await.unwrap());
        assert_eq!(store.get("/f/a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_children_are_direct_only() {
        let store = MemoryStore::new();
        store.create("/f/a", b"1").await.unwrap();
        store.create("/f/b", b"2").await.unwrap();
        store.create("/f/b/nested", b"3").await.unwrap();
        store.create("/fx/c", b"4").await.unwrap();

        let children = store.children("/f").await.unwrap();
        assert_eq!(
            children,
            vec![
                ("a".to_string(), b"1".to_vec()),
                ("b".to_string(), b"2".to_vec())
            ]
        );
    }

    #[tokio::test]
    async fn test_watch_reports_child_changes() {
        let store = MemoryStore::new();
        let mut rx = store.watch_children("/f").await.unwrap();

        store.create("/f/a", b"1").await.unwrap();
        store.set("/f/a", b"2").await.unwrap();
        store.create("/other/b", b"x").await.unwrap();
        store.delete("/f/a").await.unwrap();

        assert_eq!(
            rx.recv().await,
            Some(ChildEvent::Added { name: "a".into(), data: b"1".to_vec() })
        );
        assert_eq!(
            rx.recv().await,
            Some(ChildEvent::Updated { name: "a".into(), data: b"2".to_vec() })
        );
        assert_eq!(rx.recv().await, Some(ChildEvent::Removed { name: "a".into() }));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_every_operation() {
        let store = MemoryStore::new();
        store.set_available(false);
        assert!(matches!(store.get("/f/a").await, Err(StoreError::Unavailable(_))));
        assert!(matches!(store.create("/f/a", b"1").await, Err(StoreError::Unavailable(_))));
        assert!(matches!(store.children("/f").await, Err(StoreError::Unavailable(_))));
        store.set_available(true);
        assert!(store.children("/f").await.unwrap().is_empty());
    }
}
