use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use notify::{EventKind, RecursiveMode, Watcher};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{FlagsError, Result};
use crate::flag_data::{FlagData, FlagId};
use crate::source::FlagSource;

const DEBOUNCE: Duration = Duration::from_millis(500);

/// Static, process-local flag data: compiled-in defaults or a directory of
/// `*.json` files in the wire format, one flag per file.
pub struct BootstrapSource {
    dir: Option<PathBuf>,
    flags: RwLock<Arc<HashMap<FlagId, FlagData>>>,
}

impl BootstrapSource {
    pub fn from_flags(flags: impl IntoIterator<Item = FlagData>) -> Self {
        let flags = flags
            .into_iter()
            .map(|data| (data.id().clone(), data))
            .collect();
        Self {
            dir: None,
            flags: RwLock::new(Arc::new(flags)),
        }
    }

    /// Reads every `*.json` file in `dir`. Files that fail to parse are
    /// logged and skipped; a missing or unreadable directory is an error.
    pub fn load_dir(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let flags = read_flag_dir(&dir)?;
        info!(dir = %dir.display(), flags = flags.len(), "loaded bootstrap flags");
        Ok(Self {
            dir: Some(dir),
            flags: RwLock::new(Arc::new(flags)),
        })
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Re-reads the backing directory and swaps in the new snapshot.
    /// Returns the number of flags now held. A source built from
    /// in-memory flags keeps what it has.
    pub fn reload(&self) -> Result<usize> {
        let Some(dir) = &self.dir else {
            return Ok(self.snapshot().len());
        };
        let flags = read_flag_dir(dir)?;
        let count = flags.len();
        *self.flags.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(flags);
        Ok(count)
    }

    /// Reloads whenever a `*.json` file in the backing directory changes.
    /// The returned handle owns the watcher; call [`BootstrapWatcher::stop`]
    /// to end it.
    pub fn watch(self: Arc<Self>) -> Result<BootstrapWatcher> {
        let dir = self
            .dir
            .clone()
            .ok_or_else(|| FlagsError::Config("bootstrap source has no directory to watch".into()))?;

        let (tx, rx) = mpsc::channel::<()>(1);
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                if matches!(
                    event.kind,
                    EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
                ) && event_affects_flag_file(&event)
                {
                    let _ = tx.try_send(());
                }
            }
        })
        .map_err(|e| FlagsError::Config(format!("failed to create file watcher: {e}")))?;

        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| FlagsError::Config(format!("failed to watch {}: {e}", dir.display())))?;

        info!(dir = %dir.display(), "watching bootstrap flags for changes");

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(reload_on_change(self, watcher, rx, shutdown_rx));
        Ok(BootstrapWatcher {
            shutdown: Some(shutdown_tx),
            handle,
        })
    }

    fn snapshot(&self) -> Arc<HashMap<FlagId, FlagData>> {
        Arc::clone(&self.flags.read().unwrap_or_else(PoisonError::into_inner))
    }
}

impl FlagSource for BootstrapSource {
    fn get(&self, id: &FlagId) -> Option<FlagData> {
        self.snapshot().get(id).cloned()
    }

    fn get_all(&self) -> HashMap<FlagId, FlagData> {
        (*self.snapshot()).clone()
    }
}

/// Handle to the background reload task started by [`BootstrapSource::watch`].
pub struct BootstrapWatcher {
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl BootstrapWatcher {
    /// Stops watching and waits for the task to finish.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.handle).await {
            warn!(error = %e, "bootstrap watcher task failed");
        }
    }
}

impl Drop for BootstrapWatcher {
    fn drop(&mut self) {
        if self.shutdown.is_some() {
            self.handle.abort();
        }
    }
}

async fn reload_on_change(
    source: Arc<BootstrapSource>,
    watcher: notify::RecommendedWatcher,
    mut changes: mpsc::Receiver<()>,
    mut shutdown: oneshot::Receiver<()>,
) {
    // the watcher stops delivering events once dropped
    let _watcher = watcher;

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            change = changes.recv() => {
                if change.is_none() {
                    break;
                }
            }
        }

        tokio::time::sleep(DEBOUNCE).await;
        while changes.try_recv().is_ok() {}

        let reloading = Arc::clone(&source);
        match tokio::task::spawn_blocking(move || reloading.reload()).await {
            Ok(Ok(count)) => info!(flags = count, "bootstrap flags reloaded"),
            Ok(Err(e)) => warn!(error = %e, "bootstrap reload failed, keeping previous flags"),
            Err(e) => warn!(error = %e, "bootstrap reload task failed"),
        }
    }
    debug!("bootstrap watcher stopped");
}

fn event_affects_flag_file(event: &notify::Event) -> bool {
    event.paths.iter().any(|p| is_flag_file(p))
}

fn is_flag_file(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("json")
}

fn read_flag_dir(dir: &Path) -> Result<HashMap<FlagId, FlagData>> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && is_flag_file(p))
        .collect();
    paths.sort();

    let mut flags = HashMap::new();
    for path in paths {
        let data = match std::fs::read(&path)
            .map_err(FlagsError::from)
            .and_then(|bytes| FlagData::from_json_bytes(&bytes))
        {
            Ok(data) => data,
            Err(e) => {
                warn!(file = %path.display(), error = %e, "skipping unreadable bootstrap flag file");
                continue;
            }
        };
        if flags.contains_key(data.id()) {
            warn!(
                file = %path.display(),
                flag_id = %data.id(),
                "flag already defined by an earlier bootstrap file, ignoring"
            );
            continue;
        }
        flags.insert(data.id().clone(), data);
    }
    Ok(flags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch_vector::FetchVector;
    use crate::rule::{RawFlag, Rule};

    fn constant(flag: &str, value: bool) -> FlagData {
        FlagData::new(
            FlagId::new(flag).unwrap(),
            FetchVector::new(),
            vec![Rule::catch_all(Some(value.into()))],
        )
    }

    #[test]
    fn test_from_flags() {
        let source = BootstrapSource::from_flags([constant("a", true), constant("b", false)]);
        let id = FlagId::new("a").unwrap();
        assert_eq!(source.get(&id), Some(constant("a", true)));
        assert_eq!(
            source.resolve(&id, &FetchVector::new()),
            Some(RawFlag::from(true))
        );
        assert_eq!(source.get_all().len(), 2);
        assert_eq!(source.reload().unwrap(), 2);
    }

    #[test]
    fn test_load_dir_skips_malformed_and_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.json"), r#"{"id":"a","rules":[{"value":1}]}"#).unwrap();
        std::fs::write(dir.path().join("b.json"), "{ not json").unwrap();
        std::fs::write(dir.path().join("c.json"), r#"{"id":"a","rules":[{"value":2}]}"#).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let source = BootstrapSource::load_dir(dir.path()).unwrap();
        let all = source.get_all();
        assert_eq!(all.len(), 1);
        let a = FlagId::new("a").unwrap();
        assert_eq!(
            source.resolve(&a, &FetchVector::new()),
            Some(RawFlag::from(1))
        );
    }

    #[test]
    fn test_reload_picks_up_changes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.json"), r#"{"id":"a"}"#).unwrap();
        let source = BootstrapSource::load_dir(dir.path()).unwrap();
        assert_eq!(source.get_all().len(), 1);

        std::fs::write(dir.path().join("b.json"), r#"{"id":"b"}"#).unwrap();
        std::fs::remove_file(dir.path().join("a.json")).unwrap();
        assert_eq!(source.reload().unwrap(), 1);
        assert!(source.get(&FlagId::new("a").unwrap()).is_none());
        assert!(source.get(&FlagId::new("b").unwrap()).is_some());
    }

    #[test]
    fn test_missing_dir_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(matches!(
            BootstrapSource::load_dir(missing),
            Err(FlagsError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_watch_requires_directory() {
        let source = Arc::new(BootstrapSource::from_flags(Vec::<FlagData>::new()));
        assert!(matches!(source.watch(), Err(FlagsError::Config(_))));
    }

    #[tokio::test]
    async fn test_watch_reloads_on_file_change() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.json"), r#"{"id":"a","rules":[{"value":1}]}"#).unwrap();
        let source = Arc::new(BootstrapSource::load_dir(dir.path()).unwrap());
        let watcher = Arc::clone(&source).watch().unwrap();

        std::fs::write(dir.path().join("b.json"), r#"{"id":"b","rules":[{"value":2}]}"#).unwrap();
        let b = FlagId::new("b").unwrap();
        for _ in 0..100 {
            if source.get(&b).is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(source.resolve(&b, &FetchVector::new()), Some(RawFlag::from(2)));
        assert_eq!(source.get_all().len(), 2);

        watcher.stop().await;

        // no reloads once stopped
        std::fs::remove_file(dir.path().join("a.json")).unwrap();
        tokio::time::sleep(DEBOUNCE * 2).await;
        assert!(source.get(&FlagId::new("a").unwrap()).is_some());
    }
}
