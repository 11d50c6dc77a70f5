//! Flag data held in a coordination store, served from a local cache.
//!
//! Every flag is one child node under a root path; the node payload is the
//! flag's JSON wire form. Reads never touch the store: they are answered
//! from a cache that is bulk-loaded at startup and then kept current by a
//! watch on the root path. Writes go synchronously to the store and show up
//! in this process's cache as soon as the store accepts them. Watch events
//! that were already in flight for an older write are held back until the
//! write's own event arrives, so the cache never steps back to them.
//!
//! # Lifecycle
//!
//! `Uninitialized` → `Starting` → `Live` → `Closed`. A failed or timed-out
//! start moves straight to `Closed`; the caller should treat that as fatal.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{FlagsError, Result, StoreError};
use crate::flag_data::{FlagData, FlagId};
use crate::source::FlagSource;
use crate::store::{child_path, ChildEvent, CoordinationStore};

pub const DEFAULT_ROOT_PATH: &str = "/flags/v1";
pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DbState {
    Uninitialized = 0,
    Starting = 1,
    Live = 2,
    Closed = 3,
}

impl DbState {
    fn from_u8(val: u8) -> Self {
        match val {
            0 => Self::Uninitialized,
            1 => Self::Starting,
            2 => Self::Live,
            _ => Self::Closed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Starting => "starting",
            Self::Live => "live",
            Self::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DbOptions {
    /// Directory in the store whose children are the flags.
    pub root_path: String,
    /// Upper bound on watch registration plus the initial bulk load.
    pub init_timeout: Duration,
}

impl Default for DbOptions {
    fn default() -> Self {
        Self {
            root_path: DEFAULT_ROOT_PATH.to_string(),
            init_timeout: DEFAULT_INIT_TIMEOUT,
        }
    }
}

/// What the watch should deliver for a write this process made.
#[derive(Debug, Clone, PartialEq)]
enum Echo {
    Written(Vec<u8>),
    Removed,
}

impl Echo {
    fn matches(&self, event: &ChildEvent) -> bool {
        match (self, event) {
            (Echo::Written(bytes), ChildEvent::Added { data, .. })
            | (Echo::Written(bytes), ChildEvent::Updated { data, .. }) => bytes == data,
            (Echo::Removed, ChildEvent::Removed { .. }) => true,
            _ => false,
        }
    }
}

/// Local writes to one id whose watch events have not arrived yet, oldest
/// first. Events that are not the newest write's echo are older than it and
/// are held back; the newest of them is kept in case the write turns out
/// not to happen.
#[derive(Default)]
struct PendingWrites {
    outstanding: Vec<(u64, Echo)>,
    held_back: Option<ChildEvent>,
}

impl PendingWrites {
    fn is_newest(&self, token: u64) -> bool {
        self.outstanding.last().is_some_and(|(t, _)| *t == token)
    }
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<FlagId, Arc<FlagData>>,
    pending: HashMap<FlagId, PendingWrites>,
}

/// Materialized view of the root path. Entries are swapped whole, never
/// edited, so a reader sees either the old record or the new one.
#[derive(Default)]
struct FlagCache {
    state: RwLock<CacheState>,
    next_token: AtomicU64,
}

impl FlagCache {
    fn read(&self) -> RwLockReadGuard<'_, CacheState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, CacheState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn get(&self, id: &FlagId) -> Option<Arc<FlagData>> {
        self.read().entries.get(id).cloned()
    }

    fn snapshot(&self) -> HashMap<FlagId, FlagData> {
        self.read()
            .entries
            .iter()
            .map(|(id, data)| (id.clone(), (**data).clone()))
            .collect()
    }

    fn replace_all(&self, entries: HashMap<FlagId, Arc<FlagData>>) {
        self.write().entries = entries;
    }

    /// Registers a local write before it is sent to the store.
    fn begin(&self, id: &FlagId, echo: Echo) -> u64 {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.write()
            .pending
            .entry(id.clone())
            .or_default()
            .outstanding
            .push((token, echo));
        token
    }

    /// The store accepted the write. Shows it locally unless its echo, or a
    /// newer local write, already took over.
    fn committed(&self, id: &FlagId, token: u64, data: Option<Arc<FlagData>>) {
        let mut state = self.write();
        if !state.pending.get(id).is_some_and(|p| p.is_newest(token)) {
            return;
        }
        match data {
            Some(data) => state.entries.insert(id.clone(), data),
            None => state.entries.remove(id),
        };
    }

    /// The write will produce no echo: it failed, or removed nothing. With
    /// `absent` the store was seen without the node, so the entry is dropped
    /// if this was the newest local write. Once no writes remain outstanding
    /// the newest held-back event is applied.
    fn abandon(&self, id: &FlagId, token: u64, absent: bool) {
        let mut state = self.write();
        let Some(pending) = state.pending.get_mut(id) else {
            return;
        };
        let was_newest = pending.is_newest(token);
        pending.outstanding.retain(|(t, _)| *t != token);
        let held_back = if pending.outstanding.is_empty() {
            state.pending.remove(id).and_then(|p| p.held_back)
        } else {
            None
        };
        if absent && was_newest {
            state.entries.remove(id);
        }
        if let Some(event) = held_back {
            Self::apply_event(&mut state.entries, id, event);
        }
    }

    fn apply(&self, event: ChildEvent) {
        let Ok(id) = FlagId::new(event.name()) else {
            warn!(node = %event.name(), "ignoring store node with invalid flag id");
            return;
        };
        let mut state = self.write();
        if let Some(pending) = state.pending.get_mut(&id) {
            let matched = pending
                .outstanding
                .iter()
                .position(|(_, echo)| echo.matches(&event));
            match matched {
                // the newest write's echo: everything older has passed too
                Some(i) if i + 1 == pending.outstanding.len() => {
                    state.pending.remove(&id);
                }
                Some(i) => {
                    pending.outstanding.drain(..=i);
                    pending.held_back = Some(event);
                    return;
                }
                None => {
                    pending.held_back = Some(event);
                    return;
                }
            }
        }
        Self::apply_event(&mut state.entries, &id, event);
    }

    fn apply_event(entries: &mut HashMap<FlagId, Arc<FlagData>>, id: &FlagId, event: ChildEvent) {
        match event {
            ChildEvent::Added { data, .. } | ChildEvent::Updated { data, .. } => {
                match decode_node(id, &data) {
                    Some(flag) => {
                        debug!(flag_id = %id, "flag updated from store");
                        entries.insert(id.clone(), Arc::new(flag));
                    }
                    // a bad write hides the flag rather than serving stale data
                    None => {
                        entries.remove(id);
                    }
                }
            }
            ChildEvent::Removed { .. } => {
                debug!(flag_id = %id, "flag removed from store");
                entries.remove(id);
            }
        }
    }
}

/// Releases a registered local write if the write future is dropped before
/// the store answers.
struct WriteGuard<'a> {
    cache: &'a FlagCache,
    id: &'a FlagId,
    token: u64,
    armed: bool,
}

impl<'a> WriteGuard<'a> {
    fn begin(cache: &'a FlagCache, id: &'a FlagId, echo: Echo) -> Self {
        let token = cache.begin(id, echo);
        Self {
            cache,
            id,
            token,
            armed: true,
        }
    }

    fn committed(mut self, data: Option<Arc<FlagData>>) {
        self.armed = false;
        self.cache.committed(self.id, self.token, data);
    }

    fn abandon(mut self, absent: bool) {
        self.armed = false;
        self.cache.abandon(self.id, self.token, absent);
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.cache.abandon(self.id, self.token, false);
        }
    }
}

/// Parses a node payload. Malformed payloads, and payloads whose id does not
/// match the node name, are logged and yield `None`.
fn decode_node(id: &FlagId, bytes: &[u8]) -> Option<FlagData> {
    match FlagData::from_json_bytes(bytes) {
        Ok(data) if data.id() == id => Some(data),
        Ok(data) => {
            warn!(flag_id = %id, payload_id = %data.id(), "stored flag data has mismatched id, ignoring it");
            None
        }
        Err(e) => {
            warn!(flag_id = %id, error = %e, "failed to parse stored flag data, ignoring it");
            None
        }
    }
}

struct WatchTask {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// A [`FlagSource`] backed by a [`CoordinationStore`].
pub struct FlagsDb {
    store: Arc<dyn CoordinationStore>,
    options: DbOptions,
    state: AtomicU8,
    cache: Arc<FlagCache>,
    watcher: Mutex<Option<WatchTask>>,
}

impl FlagsDb {
    /// Creates an unstarted db. Call [`FlagsDb::start`] before serving reads.
    pub fn new(store: Arc<dyn CoordinationStore>, options: DbOptions) -> Self {
        Self {
            store,
            options,
            state: AtomicU8::new(DbState::Uninitialized as u8),
            cache: Arc::new(FlagCache::default()),
            watcher: Mutex::new(None),
        }
    }

    /// Creates and starts a db in one step.
    pub async fn open(store: Arc<dyn CoordinationStore>, options: DbOptions) -> Result<Self> {
        let db = Self::new(store, options);
        db.start().await?;
        Ok(db)
    }

    /// Registers the watch, loads every existing flag and starts applying
    /// change notifications. Fails if this does not finish within
    /// [`DbOptions::init_timeout`] or the store cannot be reached.
    pub async fn start(&self) -> Result<()> {
        self.transition(DbState::Uninitialized, DbState::Starting)?;
        info!(root = %self.options.root_path, "starting flags db");

        let timeout = self.options.init_timeout;
        let events = match tokio::time::timeout(timeout, self.initial_load()).await {
            Ok(Ok(events)) => events,
            Ok(Err(e)) => {
                error!(root = %self.options.root_path, error = %e, "flags db failed to start");
                self.set_state(DbState::Closed);
                return Err(e);
            }
            Err(_) => {
                error!(root = %self.options.root_path, ?timeout, "flags db initial load timed out");
                self.set_state(DbState::Closed);
                return Err(FlagsError::InitTimeout(timeout));
            }
        };

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(apply_changes(Arc::clone(&self.cache), events, shutdown_rx));
        let task = WatchTask {
            shutdown: shutdown_tx,
            handle,
        };

        // hold the slot across the transition so close() either sees Starting
        // fail or finds the task to join
        let mut slot = self.watcher.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = self.transition(DbState::Starting, DbState::Live) {
            drop(slot);
            debug!(error = %e, "flags db closed while starting");
            let _ = task.shutdown.send(());
            task.handle.abort();
            return Err(FlagsError::Closed);
        }
        *slot = Some(task);
        drop(slot);

        info!(root = %self.options.root_path, "flags db is live");
        Ok(())
    }

    async fn initial_load(&self) -> Result<mpsc::UnboundedReceiver<ChildEvent>> {
        // watch first: anything written during the listing arrives as an event
        let events = self.store.watch_children(&self.options.root_path).await?;
        let children = self.store.children(&self.options.root_path).await?;

        let mut entries = HashMap::with_capacity(children.len());
        for (name, bytes) in children {
            let Ok(id) = FlagId::new(name.as_str()) else {
                warn!(node = %name, "ignoring store node with invalid flag id");
                continue;
            };
            if let Some(data) = decode_node(&id, &bytes) {
                entries.insert(id, Arc::new(data));
            }
        }
        info!(flags = entries.len(), "loaded flags from store");
        self.cache.replace_all(entries);
        Ok(events)
    }

    pub fn state(&self) -> DbState {
        DbState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn root_path(&self) -> &str {
        &self.options.root_path
    }

    /// The cached record for `id`. Never waits on the store.
    pub fn get_value(&self, id: &FlagId) -> Option<FlagData> {
        self.cache.get(id).map(|data| (*data).clone())
    }

    /// Like [`FlagsDb::get_value`] without copying the record.
    pub fn get_shared(&self, id: &FlagId) -> Option<Arc<FlagData>> {
        self.cache.get(id)
    }

    /// Every cached record. Entries that failed to parse are absent.
    pub fn get_all_flag_data(&self) -> HashMap<FlagId, FlagData> {
        self.cache.snapshot()
    }

    /// Writes `data` to the store under `id`, replacing any previous record.
    ///
    /// Success means the store has the write, and this process reads it
    /// from then on. Other processes observe it once their watch delivers it.
    pub async fn set_value(&self, id: &FlagId, data: FlagData) -> Result<()> {
        self.ensure_open()?;
        if data.id() != id {
            return Err(FlagsError::IdMismatch {
                expected: id.to_string(),
                found: data.id().to_string(),
            });
        }
        let path = self.path_of(id);
        let bytes = data.to_json_bytes()?;
        let guard = WriteGuard::begin(&self.cache, id, Echo::Written(bytes.clone()));
        match self.write_node(&path, &bytes).await {
            Ok(()) => guard.committed(Some(Arc::new(data))),
            Err(e) => {
                guard.abandon(false);
                return Err(e);
            }
        }
        debug!(flag_id = %id, "flag written to store");
        Ok(())
    }

    /// Deletes the record for `id`. Removing an absent flag is a no-op; in
    /// both cases the flag reads as absent afterwards.
    pub async fn remove_value(&self, id: &FlagId) -> Result<()> {
        self.ensure_open()?;
        let guard = WriteGuard::begin(&self.cache, id, Echo::Removed);
        match self.store.delete(&self.path_of(id)).await {
            Ok(true) => {
                guard.committed(None);
                debug!(flag_id = %id, "flag removed from store");
            }
            // nothing to delete means no echo will come
            Ok(false) => guard.abandon(true),
            Err(e) => {
                guard.abandon(false);
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Stops the watch task and waits for it to exit. Reads keep serving
    /// the last snapshot; writes fail with [`FlagsError::Closed`].
    pub async fn close(&self) {
        let previous = DbState::from_u8(self.state.swap(DbState::Closed as u8, Ordering::AcqRel));
        let task = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.shutdown.send(());
            if let Err(e) = task.handle.await {
                warn!(error = %e, "flags db watch task failed");
            }
        }
        if previous != DbState::Closed {
            info!(root = %self.options.root_path, "flags db closed");
        }
    }

    async fn write_node(&self, path: &str, bytes: &[u8]) -> Result<()> {
        if self.store.exists(path).await? {
            match self.store.set(path, bytes).await {
                // deleted since exists(), create it instead
                Err(StoreError::NoNode(_)) => {}
                other => return other.map_err(FlagsError::from),
            }
        }
        match self.store.create(path, bytes).await {
            Err(StoreError::NodeExists(_)) => self.store.set(path, bytes).await.map_err(FlagsError::from),
            other => other.map_err(FlagsError::from),
        }
    }

    fn path_of(&self, id: &FlagId) -> String {
        child_path(&self.options.root_path, id.as_str())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state() == DbState::Closed {
            return Err(FlagsError::Closed);
        }
        Ok(())
    }

    fn transition(&self, from: DbState, to: DbState) -> Result<()> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|actual| FlagsError::InvalidState(DbState::from_u8(actual).as_str(), from.as_str()))
    }

    fn set_state(&self, state: DbState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

impl FlagSource for FlagsDb {
    fn get(&self, id: &FlagId) -> Option<FlagData> {
        self.get_value(id)
    }

    fn get_all(&self) -> HashMap<FlagId, FlagData> {
        self.get_all_flag_data()
    }
}

impl Drop for FlagsDb {
    fn drop(&mut self) {
        let task = self
            .watcher
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.handle.abort();
        }
    }
}

impl std::fmt::Debug for FlagsDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlagsDb")
            .field("root_path", &self.options.root_path)
            .field("state", &self.state())
            .finish()
    }
}

async fn apply_changes(
    cache: Arc<FlagCache>,
    mut events: mpsc::UnboundedReceiver<ChildEvent>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            event = events.recv() => match event {
                Some(event) => cache.apply(event),
                None => {
                    warn!("flag watch stream ended, cache will no longer refresh");
                    break;
                }
            }
        }
    }
    debug!("flags db watch task stopped");
}
