/// Shared engine behind every handle to one database
///
/// All `Database` handles opened on the same location share one engine:
/// one committed state, one commit log and one coordinator thread. The
/// engine shuts down when the last handle is dropped, after every
/// transaction it started has finished.

use crate::coordinator::{self, Command};
use crate::log::{CommitLog, LogEntry, Mutation};
use crate::schema::DatabaseSchema;
use crate::store::StoreState;
use crate::{DatabaseConfig, Error, Result, Version};
use crossbeam::channel::{self, Sender};
use lazy_static::lazy_static;
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

lazy_static! {
    /// Open engines by location
    static ref ENGINES: Mutex<HashMap<Location, EngineSlot>> = Mutex::new(HashMap::new());
}

/// Where a database lives
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Location {
    /// Directory holding the commit log (canonical path)
    Disk(PathBuf),
    /// Process-local database, gone when its last handle closes
    Memory(String),
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Disk(path) => write!(f, "{}", path.display()),
            Location::Memory(name) => write!(f, "memory:{}", name),
        }
    }
}

/// Registry entry for one location.
///
/// Nobody waits on a signal while holding `ENGINES`; waiters clone the
/// signal, release the registry and look again once it fires.
enum EngineSlot {
    /// An opener is replaying the log; raised when it is done either way
    Starting(Arc<ShutdownSignal>),
    Running {
        engine: Weak<Engine>,
        shutdown: Arc<ShutdownSignal>,
    },
}

/// One-shot latch. The coordinator thread raises it when it exits, so a new
/// engine for the same location waits for the previous one.
#[derive(Default)]
pub(crate) struct ShutdownSignal {
    done: Mutex<bool>,
    cond: Condvar,
}

impl ShutdownSignal {
    pub(crate) fn notify(&self) {
        *self.done.lock() = true;
        self.cond.notify_all();
    }

    fn is_done(&self) -> bool {
        *self.done.lock()
    }

    fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.cond.wait(&mut done);
        }
    }
}

/// Clears a `Starting` slot when the opener returns or unwinds without
/// installing an engine
struct StartingGuard {
    location: Location,
    ready: Arc<ShutdownSignal>,
    installed: bool,
}

impl Drop for StartingGuard {
    fn drop(&mut self) {
        if !self.installed {
            let mut engines = ENGINES.lock();
            if matches!(engines.get(&self.location), Some(EngineSlot::Starting(_))) {
                engines.remove(&self.location);
            }
        }
        self.ready.notify();
    }
}

/// Published state: what a new transaction starts from
#[derive(Debug, Clone, Default)]
pub(crate) struct Committed {
    pub(crate) version: Version,
    pub(crate) stores: BTreeMap<String, Arc<StoreState>>,
}

impl Committed {
    pub(crate) fn schema(&self) -> DatabaseSchema {
        DatabaseSchema {
            version: self.version,
            stores: self
                .stores
                .iter()
                .map(|(name, store)| (name.clone(), store.schema().clone()))
                .collect(),
        }
    }

    /// Rebuild the committed state from log entries in append order
    fn recover(entries: Vec<LogEntry>, config: &DatabaseConfig) -> Result<Self> {
        let mut committed = Committed::default();

        for entry in entries {
            match entry {
                LogEntry::Upgrade {
                    version,
                    schema,
                    dropped_stores,
                } => {
                    if version <= committed.version {
                        return Err(Error::Corruption(format!(
                            "Upgrade to version {} logged after version {}",
                            version, committed.version
                        )));
                    }
                    for name in &dropped_stores {
                        committed.stores.remove(name);
                    }
                    committed
                        .stores
                        .retain(|name, _| schema.stores.contains_key(name));
                    for (name, store_schema) in schema.stores {
                        match committed.stores.get_mut(&name) {
                            Some(store) => Arc::make_mut(store).replace_schema(store_schema),
                            None => {
                                committed.stores.insert(
                                    name,
                                    Arc::new(StoreState::new(store_schema, config.max_record_bytes)),
                                );
                            }
                        }
                    }
                    committed.version = version;
                }
                LogEntry::Commit {
                    txn_id,
                    mutations,
                    key_generators,
                } => {
                    for mutation in mutations {
                        match mutation {
                            Mutation::Put { store, key, record } => {
                                committed.store_mut(&store, txn_id)?.replay_put(key, record)
                            }
                            Mutation::Delete { store, key } => {
                                committed.store_mut(&store, txn_id)?.replay_delete(key)
                            }
                        }
                    }
                    for (store, next_key) in key_generators {
                        committed.store_mut(&store, txn_id)?.observe_key(next_key);
                    }
                }
            }
        }

        for store in committed.stores.values_mut() {
            Arc::make_mut(store).rebuild_indexes()?;
        }
        Ok(committed)
    }

    fn store_mut(&mut self, name: &str, txn_id: u64) -> Result<&mut StoreState> {
        self.stores.get_mut(name).map(Arc::make_mut).ok_or_else(|| {
            Error::Corruption(format!(
                "Transaction {} wrote to unknown store '{}'",
                txn_id, name
            ))
        })
    }
}

pub(crate) struct EngineState {
    pub(crate) committed: RwLock<Committed>,
    pub(crate) log: Mutex<CommitLog>,
    pub(crate) config: DatabaseConfig,
    pub(crate) next_txn_id: AtomicU64,
}

pub(crate) struct Engine {
    location: Location,
    pub(crate) state: Arc<EngineState>,
    pub(crate) commands: Sender<Command>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Running engine for `location`, starting one when none is open.
    ///
    /// `config` only applies when a new engine starts. The registry lock is
    /// only held to inspect or update a slot: log replay and waiting for a
    /// closing engine happen outside it.
    pub(crate) fn obtain(location: Location, config: DatabaseConfig) -> Result<Arc<Engine>> {
        loop {
            let mut engines = ENGINES.lock();

            let blocker = match engines.get(&location) {
                Some(EngineSlot::Running { engine, shutdown }) => match engine.upgrade() {
                    Some(engine) => {
                        debug!("Reusing open engine for {}", location);
                        return Ok(engine);
                    }
                    // Previous engine may still be finishing its transactions
                    None if !shutdown.is_done() => Some(Arc::clone(shutdown)),
                    None => None,
                },
                Some(EngineSlot::Starting(ready)) => Some(Arc::clone(ready)),
                None => None,
            };
            if let Some(signal) = blocker {
                drop(engines);
                signal.wait();
                continue;
            }

            let ready = Arc::new(ShutdownSignal::default());
            engines.insert(location.clone(), EngineSlot::Starting(Arc::clone(&ready)));
            drop(engines);

            let mut guard = StartingGuard {
                location: location.clone(),
                ready,
                installed: false,
            };
            let shutdown = Arc::new(ShutdownSignal::default());
            let engine = Arc::new(Self::start(location.clone(), config, Arc::clone(&shutdown))?);

            ENGINES.lock().insert(
                location,
                EngineSlot::Running {
                    engine: Arc::downgrade(&engine),
                    shutdown,
                },
            );
            guard.installed = true;
            return Ok(engine);
        }
    }

    fn start(location: Location, config: DatabaseConfig, shutdown: Arc<ShutdownSignal>) -> Result<Self> {
        let (log, entries) = match &location {
            Location::Disk(dir) => CommitLog::open_dir(dir)
                .map_err(|e| Error::Open(format!("Cannot read commit log of {}: {}", location, e)))?,
            Location::Memory(_) => (CommitLog::memory(), Vec::new()),
        };
        let entry_count = entries.len();
        let committed = Committed::recover(entries, &config)
            .map_err(|e| Error::Open(format!("Cannot recover {}: {}", location, e)))?;

        info!(
            "Opened {} at version {} ({} stores, {} log entries)",
            location,
            committed.version,
            committed.stores.len(),
            entry_count
        );

        let state = Arc::new(EngineState {
            committed: RwLock::new(committed),
            log: Mutex::new(log),
            config,
            next_txn_id: AtomicU64::new(1),
        });
        let (commands, receiver) = channel::unbounded();
        let worker = coordinator::spawn(Arc::clone(&state), receiver, shutdown)?;

        Ok(Self {
            location,
            state,
            commands,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub(crate) fn location(&self) -> &Location {
        &self.location
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);

        if let Some(handle) = self.worker.lock().take() {
            if handle.thread().id() == thread::current().id() {
                // Last handle dropped inside a callback; the loop exits on its own
                debug!("Engine for {} dropped on its coordinator thread", self.location);
                return;
            }
            if let Err(e) = handle.join() {
                warn!("Coordinator thread for {} panicked: {:?}", self.location, e);
            }
        }

        info!("Closed {}", self.location);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{StoreOptions, StoreSchema};
    use crate::{RecordBuilder, Value};
    use std::collections::BTreeMap;

    fn upgrade_entry(version: Version, stores: &[&str], dropped: &[&str]) -> LogEntry {
        let mut schema = DatabaseSchema {
            version,
            stores: BTreeMap::new(),
        };
        for name in stores {
            let mut store = StoreSchema::new(*name, StoreOptions::new(), Default::default());
            store
                .indexes
                .push(crate::IndexDef::new("farmerNote", "farmerNote"));
            schema.stores.insert(name.to_string(), store);
        }
        LogEntry::Upgrade {
            version,
            schema,
            dropped_stores: dropped.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn put(store: &str, key: u64, note: &str) -> Mutation {
        Mutation::Put {
            store: store.to_string(),
            key,
            record: RecordBuilder::new().text("farmerNote", note).build(),
        }
    }

    #[test]
    fn test_recover_replays_in_order() {
        let mut generators = BTreeMap::new();
        generators.insert("FarmData".to_string(), 4);
        let entries = vec![
            upgrade_entry(1, &["FarmData"], &[]),
            LogEntry::Commit {
                txn_id: 1,
                mutations: vec![put("FarmData", 1, "a"), put("FarmData", 2, "b")],
                key_generators: BTreeMap::new(),
            },
            LogEntry::Commit {
                txn_id: 2,
                mutations: vec![Mutation::Delete {
                    store: "FarmData".to_string(),
                    key: 1,
                }],
                key_generators: generators,
            },
        ];

        let committed = Committed::recover(entries, &DatabaseConfig::default()).unwrap();
        let store = &committed.stores["FarmData"];
        assert_eq!(committed.version, 1);
        assert_eq!(store.count(), 1);
        // Aborted adds are never logged, but the generator still honours the log
        assert_eq!(store.next_key(), 4);
        assert_eq!(store.lookup("farmerNote", &Value::text("b")).unwrap(), vec![2]);
    }

    #[test]
    fn test_recover_drops_deleted_stores() {
        let entries = vec![
            upgrade_entry(1, &["FarmData", "Old"], &[]),
            LogEntry::Commit {
                txn_id: 1,
                mutations: vec![put("Old", 1, "x")],
                key_generators: BTreeMap::new(),
            },
            upgrade_entry(2, &["FarmData", "Old"], &["Old"]),
        ];
        let committed = Committed::recover(entries, &DatabaseConfig::default()).unwrap();
        assert_eq!(committed.version, 2);
        assert_eq!(committed.stores["Old"].count(), 0);
        assert_eq!(committed.schema().store_names(), vec!["FarmData", "Old"]);
    }

    #[test]
    fn test_recover_rejects_unknown_store() {
        let entries = vec![LogEntry::Commit {
            txn_id: 9,
            mutations: vec![put("Ghost", 1, "x")],
            key_generators: BTreeMap::new(),
        }];
        let err = Committed::recover(entries, &DatabaseConfig::default()).unwrap_err();
        assert_eq!(err.code(), "CORRUPTION");
    }

    #[test]
    fn test_recover_rejects_version_regression() {
        let entries = vec![upgrade_entry(2, &[], &[]), upgrade_entry(1, &[], &[])];
        assert!(Committed::recover(entries, &DatabaseConfig::default()).is_err());
    }
}
