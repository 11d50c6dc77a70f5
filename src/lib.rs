use std::sync::Arc;

use tracing::info;

pub mod bootstrap;
pub mod condition;
pub mod config;
pub mod definition;
pub mod dimension;
pub mod error;
pub mod fetch_vector;
pub mod flag_data;
pub mod flags_db;
pub mod ordered;
pub mod rule;
pub mod source;
pub mod store;

pub use bootstrap::{BootstrapSource, BootstrapWatcher};
pub use condition::{Condition, Predicate, RelationalOp, ValueSet};
pub use config::FlagsConfig;
pub use definition::{BoundFlag, FlagDefinition};
pub use dimension::Dimension;
pub use error::{FlagsError, Result, StoreError};
pub use fetch_vector::FetchVector;
pub use flag_data::{FlagData, FlagId};
pub use flags_db::{DbOptions, DbState, FlagsDb};
pub use ordered::OrderedFlagSource;
pub use rule::{RawFlag, Rule};
pub use source::FlagSource;
pub use store::{ChildEvent, CoordinationStore};

/// Everything a process needs to resolve flags: the store-backed db layered
/// over the bootstrap source.
pub struct FlagRuntime {
    db: Arc<FlagsDb>,
    bootstrap: Arc<BootstrapSource>,
    source: OrderedFlagSource,
    watcher: Option<BootstrapWatcher>,
}

impl FlagRuntime {
    pub fn db(&self) -> &Arc<FlagsDb> {
        &self.db
    }

    pub fn bootstrap(&self) -> &Arc<BootstrapSource> {
        &self.bootstrap
    }

    /// The db first, then the bootstrap source.
    pub fn source(&self) -> &OrderedFlagSource {
        &self.source
    }

    /// Stops background tasks and waits for them, db last.
    pub async fn shutdown(self) {
        if let Some(watcher) = self.watcher {
            watcher.stop().await;
        }
        self.db.close().await;
    }
}

/// Opens the configured store, starts a [`FlagsDb`] on it and layers it over
/// the bootstrap source. Fails if the db cannot finish its initial load.
pub async fn open(config: &FlagsConfig) -> Result<FlagRuntime> {
    let bootstrap = Arc::new(match &config.bootstrap.dir {
        Some(dir) => BootstrapSource::load_dir(dir)?,
        None => BootstrapSource::from_flags(Vec::<FlagData>::new()),
    });

    let store = config.open_store()?;
    let db = Arc::new(FlagsDb::open(store, config.db.options()).await?);

    let watcher = if config.bootstrap.watch && bootstrap.dir().is_some() {
        Some(Arc::clone(&bootstrap).watch()?)
    } else {
        None
    };

    let source = OrderedFlagSource::default()
        .then(Arc::clone(&db) as Arc<dyn FlagSource>)
        .then(Arc::clone(&bootstrap) as Arc<dyn FlagSource>);

    info!(
        root = %config.db.root_path,
        storage = ?config.db.storage,
        bootstrap_flags = bootstrap.get_all().len(),
        "flag runtime ready"
    );

    Ok(FlagRuntime {
        db,
        bootstrap,
        source,
        watcher,
    })
}
