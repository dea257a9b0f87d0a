/// Database handle
///
/// Opening a database names it (a directory, or a process-local name for
/// in-memory databases) and a version. When the stored version is lower,
/// the upgrade callback runs exactly once, even if several threads open the
/// same database at the same time, and every opener returns only after the
/// upgrade has committed or failed.

use crate::coordinator::{Command, UpgradeRequest};
use crate::engine::{Engine, Location};
use crate::schema::{DatabaseSchema, StoreSchema};
use crate::txn::{Transaction, TransactionMode, TxnShared};
use crate::upgrade::UpgradeTransaction;
use crate::{DatabaseConfig, Error, Result, Version};
use crossbeam::channel;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info};

/// Handle to an open database.
///
/// Handles are cheap to clone and share one engine per location. The
/// database closes when the last handle is dropped or closed.
#[derive(Clone)]
pub struct Database {
    engine: Arc<Engine>,
}

impl Database {
    /// Open (or create) the database stored in directory `path`
    pub fn open<F>(path: impl AsRef<Path>, version: Version, upgrade: F) -> Result<Self>
    where
        F: FnOnce(&mut UpgradeTransaction) -> Result<()> + Send + 'static,
    {
        Self::open_with_config(path, DatabaseConfig::default(), version, upgrade)
    }

    /// Open with a custom configuration.
    ///
    /// The configuration only takes effect when no other handle to the same
    /// database is open.
    pub fn open_with_config<F>(
        path: impl AsRef<Path>,
        config: DatabaseConfig,
        version: Version,
        upgrade: F,
    ) -> Result<Self>
    where
        F: FnOnce(&mut UpgradeTransaction) -> Result<()> + Send + 'static,
    {
        let path = path.as_ref();
        fs::create_dir_all(path)
            .map_err(|e| Error::Open(format!("Cannot create {}: {}", path.display(), e)))?;
        let dir = path
            .canonicalize()
            .map_err(|e| Error::Open(format!("Cannot resolve {}: {}", path.display(), e)))?;

        Self::open_location(Location::Disk(dir), config, version, upgrade)
    }

    /// Open a process-local database that lives until its last handle closes
    pub fn open_in_memory<F>(name: &str, version: Version, upgrade: F) -> Result<Self>
    where
        F: FnOnce(&mut UpgradeTransaction) -> Result<()> + Send + 'static,
    {
        Self::open_in_memory_with_config(name, DatabaseConfig::default(), version, upgrade)
    }

    pub fn open_in_memory_with_config<F>(
        name: &str,
        config: DatabaseConfig,
        version: Version,
        upgrade: F,
    ) -> Result<Self>
    where
        F: FnOnce(&mut UpgradeTransaction) -> Result<()> + Send + 'static,
    {
        if name.is_empty() {
            return Err(Error::Open("Database name cannot be empty".to_string()));
        }
        Self::open_location(Location::Memory(name.to_string()), config, version, upgrade)
    }

    fn open_location<F>(location: Location, config: DatabaseConfig, version: Version, upgrade: F) -> Result<Self>
    where
        F: FnOnce(&mut UpgradeTransaction) -> Result<()> + Send + 'static,
    {
        if version == 0 {
            return Err(Error::Open("Version must be at least 1".to_string()));
        }
        config.validate().map_err(Error::InvalidArgument)?;

        let engine = Engine::obtain(location, config)?;

        let stored = engine.state.committed.read().version;
        if stored == version {
            debug!("Opened {} at version {}", engine.location(), version);
            return Ok(Self { engine });
        }
        if stored > version {
            return Err(Error::Open(format!(
                "Requested version {} is lower than stored version {}",
                version, stored
            )));
        }

        let (reply, outcome) = channel::bounded(1);
        engine
            .commands
            .send(Command::Upgrade(UpgradeRequest {
                version,
                apply: Box::new(upgrade),
                reply,
            }))
            .map_err(|_| Error::Open("Database is closing".to_string()))?;
        let version = outcome
            .recv()
            .map_err(|_| Error::Open("Database closed during upgrade".to_string()))??;

        info!("Opened {} at version {}", engine.location(), version);
        Ok(Self { engine })
    }

    /// Start a transaction over `stores`.
    ///
    /// The transaction runs once every conflicting transaction created
    /// before it has finished; operations can be queued right away.
    pub fn transaction(&self, stores: &[&str], mode: TransactionMode) -> Result<Transaction> {
        if stores.is_empty() {
            return Err(Error::InvalidArgument(
                "A transaction needs at least one object store".to_string(),
            ));
        }

        let mut scope: Vec<String> = stores.iter().map(|s| s.to_string()).collect();
        scope.sort();
        scope.dedup();

        {
            let committed = self.engine.state.committed.read();
            if let Some(missing) = scope.iter().find(|name| !committed.stores.contains_key(*name)) {
                return Err(Error::NotFound(format!("object store '{}'", missing)));
            }
        }

        let id = self.engine.state.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let shared = TxnShared::new(id, mode, scope, self.engine.commands.clone());
        self.engine
            .commands
            .send(Command::Begin(Arc::clone(&shared)))
            .map_err(|_| Error::TransactionInactive("Database is closed".to_string()))?;

        Ok(Transaction::new(shared))
    }

    /// Current schema version
    pub fn version(&self) -> Version {
        self.engine.state.committed.read().version
    }

    pub fn store_names(&self) -> Vec<String> {
        self.engine.state.committed.read().stores.keys().cloned().collect()
    }

    pub fn store_schema(&self, name: &str) -> Option<StoreSchema> {
        self.engine
            .state
            .committed
            .read()
            .stores
            .get(name)
            .map(|store| store.schema().clone())
    }

    pub fn schema(&self) -> DatabaseSchema {
        self.engine.state.committed.read().schema()
    }

    pub fn location(&self) -> &Location {
        self.engine.location()
    }

    /// Close this handle.
    ///
    /// When it was the last handle, waits for every started transaction to
    /// finish before returning; new transactions are refused from then on.
    pub fn close(self) {
        drop(self);
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("location", self.engine.location())
            .field("version", &self.version())
            .finish()
    }
}
