use agridb_core::request::ensure_blocking_allowed;
use agridb_core::{
    codec, AttributeDef, Database, DatabaseConfig, IndexDef, Key, Result, SequencePolicy,
    StoreOptions, TransactionMode, UpgradeTransaction, Value, ValueKind, Version,
};
use std::path::Path;
use tracing::debug;

pub use agridb_core::{Error as AgriError, Value as AgriValue};

pub mod record;
pub use record::{FarmRecord, StoredFarmRecord};

use record::{CROP_PHOTO, FARMER_NOTE, GPS_COORDINATES, SENSOR_READINGS, TIMESTAMP};

/// Name of the farm-data database
pub const DATABASE_NAME: &str = "AgricultureDB";
/// Schema version the client expects
pub const DATABASE_VERSION: Version = 1;
/// Store holding farm records
pub const FARM_STORE: &str = "FarmData";

/// Declared attributes of the farm-data store
pub fn farm_store_options() -> StoreOptions {
    StoreOptions::new()
        .attribute(AttributeDef::new(SENSOR_READINGS, ValueKind::Sequence).required())
        .attribute(AttributeDef::new(CROP_PHOTO, ValueKind::Text).with_description("Encoded crop photo"))
        .attribute(AttributeDef::new(FARMER_NOTE, ValueKind::Text).required())
        .attribute(AttributeDef::new(GPS_COORDINATES, ValueKind::Number).required())
        .attribute(AttributeDef::new(TIMESTAMP, ValueKind::Timestamp).required())
}

/// Version 1 upgrade: the farm-data store and one non-unique index per
/// attribute. Readings are indexed by their first element.
pub fn create_farm_schema(upgrade: &mut UpgradeTransaction) -> Result<()> {
    upgrade.create_object_store(FARM_STORE, farm_store_options())?;
    upgrade.create_index(
        FARM_STORE,
        IndexDef::new(SENSOR_READINGS, SENSOR_READINGS).sequence_policy(SequencePolicy::FirstElement),
    )?;
    for attribute in [CROP_PHOTO, FARMER_NOTE, GPS_COORDINATES, TIMESTAMP] {
        upgrade.create_index(FARM_STORE, IndexDef::new(attribute, attribute))?;
    }
    Ok(())
}

/// Client for the farm-data store.
///
/// The plain methods block until their transaction finishes and refuse to
/// run inside an async runtime; async callers use the `_async` variants.
#[derive(Debug, Clone)]
pub struct FarmDataClient {
    db: Database,
}

impl FarmDataClient {
    /// Open (or create) the farm database in directory `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(path, DatabaseConfig::default())
    }

    pub fn open_with_config(path: impl AsRef<Path>, config: DatabaseConfig) -> Result<Self> {
        let db = Database::open_with_config(path, config, DATABASE_VERSION, create_farm_schema)?;
        Self::from_database(db)
    }

    /// Open a volatile farm database
    pub fn open_in_memory(name: &str) -> Result<Self> {
        let db = Database::open_in_memory(name, DATABASE_VERSION, create_farm_schema)?;
        Self::from_database(db)
    }

    /// Wrap an already open database that has the farm-data store
    pub fn from_database(db: Database) -> Result<Self> {
        if db.store_schema(FARM_STORE).is_none() {
            return Err(AgriError::NotFound(format!("object store '{}'", FARM_STORE)));
        }
        Ok(Self { db })
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Insert a record; returns its key once the transaction committed
    pub fn store_record(&self, record: &FarmRecord) -> Result<Key> {
        ensure_blocking_allowed()?;
        let txn = self.db.transaction(&[FARM_STORE], TransactionMode::ReadWrite)?;
        let key = txn.object_store(FARM_STORE)?.add(record.to_record());
        let committed = txn.commit();

        let key = key.wait()?;
        committed.wait()?;
        debug!("Stored farm record {}", key);
        Ok(key)
    }

    /// Every stored record in key order
    pub fn retrieve_all(&self) -> Result<Vec<StoredFarmRecord>> {
        ensure_blocking_allowed()?;
        let txn = self.db.transaction(&[FARM_STORE], TransactionMode::ReadOnly)?;
        let entries = txn.object_store(FARM_STORE)?.get_all().wait()?;
        entries
            .iter()
            .map(|(key, record)| StoredFarmRecord::from_entry(*key, record))
            .collect()
    }

    pub fn get(&self, key: Key) -> Result<StoredFarmRecord> {
        ensure_blocking_allowed()?;
        let txn = self.db.transaction(&[FARM_STORE], TransactionMode::ReadOnly)?;
        let record = txn.object_store(FARM_STORE)?.get(key).wait()?;
        StoredFarmRecord::from_entry(key, &record)
    }

    pub fn delete(&self, key: Key) -> Result<()> {
        ensure_blocking_allowed()?;
        let txn = self.db.transaction(&[FARM_STORE], TransactionMode::ReadWrite)?;
        let deleted = txn.object_store(FARM_STORE)?.delete(key);
        let committed = txn.commit();

        deleted.wait()?;
        committed.wait()
    }

    /// Records whose first sensor reading equals `reading`
    pub fn find_by_sensor_reading(&self, reading: f64) -> Result<Vec<StoredFarmRecord>> {
        ensure_blocking_allowed()?;
        let txn = self.db.transaction(&[FARM_STORE], TransactionMode::ReadOnly)?;
        let entries = txn
            .object_store(FARM_STORE)?
            .index_get_all(SENSOR_READINGS, Value::number(reading))
            .wait()?;
        entries
            .iter()
            .map(|(key, record)| StoredFarmRecord::from_entry(*key, record))
            .collect()
    }

    /// All records as pretty JSON, timestamps in ISO form
    pub fn render_json(&self) -> Result<String> {
        ensure_blocking_allowed()?;
        let txn = self.db.transaction(&[FARM_STORE], TransactionMode::ReadOnly)?;
        let entries = txn.object_store(FARM_STORE)?.get_all().wait()?;
        codec::render_json_pretty(&entries)
    }

    /// `store_record` for async callers
    pub async fn store_record_async(&self, record: &FarmRecord) -> Result<Key> {
        let txn = self.db.transaction(&[FARM_STORE], TransactionMode::ReadWrite)?;
        let key = txn.object_store(FARM_STORE)?.add(record.to_record());
        let committed = txn.commit();

        let key = key.await?;
        committed.await?;
        debug!("Stored farm record {}", key);
        Ok(key)
    }

    /// `retrieve_all` for async callers
    pub async fn retrieve_all_async(&self) -> Result<Vec<StoredFarmRecord>> {
        let txn = self.db.transaction(&[FARM_STORE], TransactionMode::ReadOnly)?;
        let entries = txn.object_store(FARM_STORE)?.get_all().await?;
        entries
            .iter()
            .map(|(key, record)| StoredFarmRecord::from_entry(*key, record))
            .collect()
    }
}
