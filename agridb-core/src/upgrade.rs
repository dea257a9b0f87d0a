/// Version upgrades
///
/// The upgrade callback passed to `Database::open` receives an
/// [`UpgradeTransaction`] and declares stores and indexes on it. Changes are
/// made on a copy of the committed state and published in one step when
/// the callback succeeds; a failing or panicking callback leaves the
/// database at its old version with its old schema.

use crate::index::IndexDef;
use crate::log::LogEntry;
use crate::schema::{DatabaseSchema, StoreOptions, StoreSchema};
use crate::store::StoreState;
use crate::{DatabaseConfig, Error, Result, Version};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Upgrade callback signature
pub type UpgradeFn = Box<dyn FnOnce(&mut UpgradeTransaction) -> Result<()> + Send>;

/// Schema changes of one version upgrade
pub struct UpgradeTransaction {
    old_version: Version,
    new_version: Version,
    stores: BTreeMap<String, Arc<StoreState>>,
    dropped: Vec<String>,
    config: DatabaseConfig,
}

impl UpgradeTransaction {
    pub(crate) fn new(
        old_version: Version,
        new_version: Version,
        stores: BTreeMap<String, Arc<StoreState>>,
        config: DatabaseConfig,
    ) -> Self {
        Self {
            old_version,
            new_version,
            stores,
            dropped: Vec::new(),
            config,
        }
    }

    /// Version the database had before this upgrade (0 when newly created)
    pub fn old_version(&self) -> Version {
        self.old_version
    }

    pub fn new_version(&self) -> Version {
        self.new_version
    }

    pub fn object_store_names(&self) -> Vec<String> {
        self.stores.keys().cloned().collect()
    }

    pub fn has_object_store(&self, name: &str) -> bool {
        self.stores.contains_key(name)
    }

    /// Declare a new, empty object store
    pub fn create_object_store(&mut self, name: &str, options: StoreOptions) -> Result<()> {
        if name.is_empty() {
            return Err(Error::Upgrade("Object store name cannot be empty".to_string()));
        }
        if self.stores.contains_key(name) {
            return Err(Error::Upgrade(format!("Object store '{}' already exists", name)));
        }
        let schema = StoreSchema::new(name, options, self.config.extra_attributes);
        self.stores.insert(
            name.to_string(),
            Arc::new(StoreState::new(schema, self.config.max_record_bytes)),
        );
        debug!("Upgrade {}: created store '{}'", self.new_version, name);
        Ok(())
    }

    /// Remove a store together with its records and indexes
    pub fn delete_object_store(&mut self, name: &str) -> Result<()> {
        if self.stores.remove(name).is_none() {
            return Err(Error::Upgrade(format!("Object store '{}' does not exist", name)));
        }
        self.dropped.push(name.to_string());
        debug!("Upgrade {}: deleted store '{}'", self.new_version, name);
        Ok(())
    }

    /// Declare an index and build it over the store's current records.
    ///
    /// Fails when a unique index would already be violated.
    pub fn create_index(&mut self, store: &str, def: IndexDef) -> Result<()> {
        let index = def.name.clone();
        self.store_mut(store)?.create_index(def)?;
        debug!("Upgrade {}: created index '{}' on '{}'", self.new_version, index, store);
        Ok(())
    }

    pub fn delete_index(&mut self, store: &str, index: &str) -> Result<()> {
        self.store_mut(store)?.delete_index(index)
    }

    fn store_mut(&mut self, name: &str) -> Result<&mut StoreState> {
        self.stores
            .get_mut(name)
            .map(Arc::make_mut)
            .ok_or_else(|| Error::Upgrade(format!("Object store '{}' does not exist", name)))
    }

    /// Resulting stores and the log entry that reproduces them
    pub(crate) fn finish(self) -> (BTreeMap<String, Arc<StoreState>>, LogEntry) {
        let schema = DatabaseSchema {
            version: self.new_version,
            stores: self
                .stores
                .iter()
                .map(|(name, store)| (name.clone(), store.schema().clone()))
                .collect(),
        };
        let entry = LogEntry::Upgrade {
            version: self.new_version,
            schema,
            dropped_stores: self.dropped,
        };
        (self.stores, entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::AttributeDef;
    use crate::{RecordBuilder, Value, ValueKind};

    fn fresh() -> UpgradeTransaction {
        UpgradeTransaction::new(0, 1, BTreeMap::new(), DatabaseConfig::default())
    }

    #[test]
    fn test_create_store_and_index() {
        let mut upgrade = fresh();
        let options = StoreOptions::new()
            .attribute(AttributeDef::new("farmerNote", ValueKind::Text).required());
        upgrade.create_object_store("FarmData", options).unwrap();
        upgrade
            .create_index("FarmData", IndexDef::new("farmerNote", "farmerNote"))
            .unwrap();

        assert_eq!(upgrade.object_store_names(), vec!["FarmData".to_string()]);
        assert_eq!((upgrade.old_version(), upgrade.new_version()), (0, 1));

        let (stores, entry) = upgrade.finish();
        assert!(stores["FarmData"].schema().index("farmerNote").is_some());
        match entry {
            LogEntry::Upgrade { version, schema, dropped_stores } => {
                assert_eq!(version, 1);
                assert_eq!(schema.store_names(), vec!["FarmData".to_string()]);
                assert!(dropped_stores.is_empty());
            }
            other => panic!("unexpected entry {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_store_rejected() {
        let mut upgrade = fresh();
        upgrade.create_object_store("FarmData", StoreOptions::new()).unwrap();
        let err = upgrade
            .create_object_store("FarmData", StoreOptions::new())
            .unwrap_err();
        assert_eq!(err.code(), "UPGRADE_ERROR");
    }

    #[test]
    fn test_index_on_missing_store() {
        let mut upgrade = fresh();
        let err = upgrade
            .create_index("Nope", IndexDef::new("a", "a"))
            .unwrap_err();
        assert!(matches!(err, Error::Upgrade(_)));
    }

    #[test]
    fn test_unique_index_over_duplicates_fails() {
        let mut store = StoreState::new(
            StoreSchema::new("FarmData", StoreOptions::new(), Default::default()),
            None,
        );
        let record = RecordBuilder::new().text("farmerNote", "same").build();
        store.add(record.clone()).unwrap();
        store.add(record).unwrap();

        let mut stores = BTreeMap::new();
        stores.insert("FarmData".to_string(), Arc::new(store));
        let mut upgrade = UpgradeTransaction::new(1, 2, stores, DatabaseConfig::default());

        let err = upgrade
            .create_index("FarmData", IndexDef::new("farmerNote", "farmerNote").unique())
            .unwrap_err();
        assert_eq!(err.code(), "UPGRADE_ERROR");

        // Failed declaration left the store unchanged
        let (stores, _) = upgrade.finish();
        assert!(stores["FarmData"].schema().index("farmerNote").is_none());
        assert_eq!(stores["FarmData"].count(), 2);
        assert!(stores["FarmData"].lookup("farmerNote", &Value::text("same")).is_err());
    }

    #[test]
    fn test_delete_store_is_recorded() {
        let mut upgrade = fresh();
        upgrade.create_object_store("Old", StoreOptions::new()).unwrap();
        upgrade.delete_object_store("Old").unwrap();
        assert!(!upgrade.has_object_store("Old"));
        assert!(upgrade.delete_object_store("Old").is_err());

        let (stores, entry) = upgrade.finish();
        assert!(stores.is_empty());
        assert!(matches!(entry, LogEntry::Upgrade { dropped_stores, .. } if dropped_stores == vec!["Old".to_string()]));
    }
}
