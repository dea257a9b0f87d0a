/// Object store state
///
/// One collection: records in primary-key order, the key generator, the
/// validator built from the declared attributes, and the index set. A
/// `StoreState` is a plain value; transactions work on copy-on-write
/// images of it and publish the image on commit.

use crate::index::{IndexDef, IndexSet};
use crate::schema::StoreSchema;
use crate::validation::Validator;
use crate::{Error, Key, Record, Result, Value};
use std::collections::BTreeMap;
use std::ops::Bound;

/// First key handed out by a fresh store
pub const FIRST_KEY: Key = 1;

#[derive(Debug, Clone)]
pub struct StoreState {
    schema: StoreSchema,
    validator: Validator,
    max_record_bytes: Option<usize>,
    records: BTreeMap<Key, Record>,
    indexes: IndexSet,
    next_key: Key,
}

impl StoreState {
    /// Create an empty store with the indexes its schema declares
    pub fn new(schema: StoreSchema, max_record_bytes: Option<usize>) -> Self {
        let validator = Validator::new(&schema.attributes, schema.extra_attributes)
            .with_max_record_bytes(max_record_bytes);
        let mut indexes = IndexSet::new();
        for def in &schema.indexes {
            // No records yet, so index creation cannot fail
            let _ = indexes.create(def.clone(), std::iter::empty());
        }
        Self {
            schema,
            validator,
            max_record_bytes,
            records: BTreeMap::new(),
            indexes,
            next_key: FIRST_KEY,
        }
    }

    pub fn name(&self) -> &str {
        &self.schema.name
    }

    pub fn schema(&self) -> &StoreSchema {
        &self.schema
    }

    pub fn next_key(&self) -> Key {
        self.next_key
    }

    pub fn count(&self) -> usize {
        self.records.len()
    }

    pub fn indexes(&self) -> &IndexSet {
        &self.indexes
    }

    /// Validate, allocate a key, index and store a record.
    ///
    /// Validation and unique checks run before anything is written, so a
    /// failed add leaves the key generator, records and indexes untouched.
    pub fn add(&mut self, record: Record) -> Result<Key> {
        let record = self.validator.validate(record)?;

        let key = self.next_key;
        let next_key = key.checked_add(1).ok_or_else(|| {
            Error::Constraint(format!("Key generator of store '{}' exhausted", self.schema.name))
        })?;

        self.indexes.insert(key, &record)?;
        self.records.insert(key, record);
        self.next_key = next_key;
        Ok(key)
    }

    pub fn get(&self, key: Key) -> Result<&Record> {
        self.records.get(&key).ok_or_else(|| self.not_found(key))
    }

    /// All records in primary-key order
    pub fn get_all(&self) -> Vec<(Key, Record)> {
        self.records
            .iter()
            .map(|(key, record)| (*key, record.clone()))
            .collect()
    }

    /// Remove a record and its index entries
    pub fn delete(&mut self, key: Key) -> Result<Record> {
        let record = self.records.remove(&key).ok_or_else(|| self.not_found(key))?;
        self.indexes.remove(key, &record);
        Ok(record)
    }

    pub fn lookup(&self, index: &str, value: &Value) -> Result<Vec<Key>> {
        self.indexes.lookup(index, value)
    }

    pub fn range(&self, index: &str, lower: Bound<&Value>, upper: Bound<&Value>) -> Result<Vec<Key>> {
        self.indexes.range(index, lower, upper)
    }

    /// Records for a list of keys, skipping keys that no longer exist
    pub fn records_for(&self, keys: &[Key]) -> Vec<(Key, Record)> {
        keys.iter()
            .filter_map(|key| self.records.get(key).map(|record| (*key, record.clone())))
            .collect()
    }

    fn not_found(&self, key: Key) -> Error {
        Error::NotFound(format!("key {} in store '{}'", key, self.schema.name))
    }

    /// Declare and build a new index over the current records
    pub(crate) fn create_index(&mut self, def: IndexDef) -> Result<()> {
        if self.schema.index(&def.name).is_some() {
            return Err(Error::Upgrade(format!(
                "Index '{}' already exists on store '{}'",
                def.name, self.schema.name
            )));
        }
        self.indexes.create(def.clone(), self.records.iter())?;
        self.schema.indexes.push(def);
        Ok(())
    }

    pub(crate) fn delete_index(&mut self, name: &str) -> Result<()> {
        if self.indexes.remove_index(name).is_none() {
            return Err(Error::Upgrade(format!(
                "Index '{}' does not exist on store '{}'",
                name, self.schema.name
            )));
        }
        self.schema.indexes.retain(|def| def.name != name);
        Ok(())
    }

    /// Swap in a new declaration, keeping records and the key generator.
    /// Indexes must be rebuilt afterwards.
    pub(crate) fn replace_schema(&mut self, schema: StoreSchema) {
        self.validator = Validator::new(&schema.attributes, schema.extra_attributes)
            .with_max_record_bytes(self.max_record_bytes);
        self.schema = schema;
    }

    /// Log replay: write a record without validation or indexing
    pub(crate) fn replay_put(&mut self, key: Key, record: Record) {
        self.records.insert(key, record);
        self.observe_key(key.saturating_add(1));
    }

    /// Log replay: remove a record without touching indexes
    pub(crate) fn replay_delete(&mut self, key: Key) {
        self.records.remove(&key);
    }

    /// Raise the key generator; it never moves backwards
    pub(crate) fn observe_key(&mut self, next_key: Key) {
        self.next_key = self.next_key.max(next_key);
    }

    pub(crate) fn rebuild_indexes(&mut self) -> Result<()> {
        self.indexes = IndexSet::build(&self.schema.indexes, self.records.iter())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::SequencePolicy;
    use crate::schema::StoreOptions;
    use crate::validation::{AttributeDef, ExtraAttributes};
    use crate::{RecordBuilder, ValueKind};

    fn farm_store() -> StoreState {
        let options = StoreOptions::new()
            .attribute(AttributeDef::new("sensorReadings", ValueKind::Sequence).required())
            .attribute(AttributeDef::new("cropPhoto", ValueKind::Text))
            .attribute(AttributeDef::new("farmerNote", ValueKind::Text).required());
        let mut store = StoreState::new(
            StoreSchema::new("FarmData", options, ExtraAttributes::Reject),
            None,
        );
        store
            .create_index(
                IndexDef::new("sensorReadings", "sensorReadings")
                    .sequence_policy(SequencePolicy::FirstElement),
            )
            .unwrap();
        store.create_index(IndexDef::new("farmerNote", "farmerNote")).unwrap();
        store
    }

    fn record(first: f64, note: &str) -> Record {
        RecordBuilder::new()
            .sequence("sensorReadings", vec![first, 1.0])
            .text("farmerNote", note)
            .build()
    }

    #[test]
    fn test_keys_strictly_increase() {
        let mut store = farm_store();
        let k1 = store.add(record(1.0, "a")).unwrap();
        let k2 = store.add(record(2.0, "b")).unwrap();
        let k3 = store.add(record(3.0, "c")).unwrap();
        assert_eq!((k1, k2, k3), (1, 2, 3));
    }

    #[test]
    fn test_failed_add_does_not_advance_generator() {
        let mut store = farm_store();
        let bad = RecordBuilder::new().text("farmerNote", "no readings").build();
        assert!(store.add(bad).is_err());
        assert_eq!(store.next_key(), FIRST_KEY);
        assert_eq!(store.count(), 0);
        assert!(store.lookup("farmerNote", &Value::text("no readings")).unwrap().is_empty());
    }

    #[test]
    fn test_delete_never_reuses_keys() {
        let mut store = farm_store();
        let k1 = store.add(record(1.0, "a")).unwrap();
        store.delete(k1).unwrap();
        let k2 = store.add(record(1.0, "a")).unwrap();
        assert!(k2 > k1);
        assert_eq!(store.lookup("farmerNote", &Value::text("a")).unwrap(), vec![k2]);
    }

    #[test]
    fn test_delete_missing_is_not_found() {
        let mut store = farm_store();
        let err = store.delete(42).unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
        assert!(store.get(42).is_err());
    }

    #[test]
    fn test_get_all_in_key_order() {
        let mut store = farm_store();
        for i in 0..5 {
            store.add(record(i as f64, "n")).unwrap();
        }
        let keys: Vec<Key> = store.get_all().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_index_tracks_shared_first_reading() {
        let mut store = farm_store();
        let a = store.add(record(23.0, "a")).unwrap();
        let b = store.add(record(23.0, "b")).unwrap();
        assert_eq!(store.lookup("sensorReadings", &Value::number(23.0)).unwrap(), vec![a, b]);
        assert_eq!(store.records_for(&[b, 99]).len(), 1);
    }

    #[test]
    fn test_replay_and_rebuild() {
        let mut store = farm_store();
        store.replay_put(5, record(9.0, "replayed"));
        store.replay_put(3, record(8.0, "older"));
        store.replay_delete(3);
        store.rebuild_indexes().unwrap();

        assert_eq!(store.next_key(), 6);
        assert_eq!(store.lookup("farmerNote", &Value::text("replayed")).unwrap(), vec![5]);
        assert!(store.lookup("farmerNote", &Value::text("older")).unwrap().is_empty());

        store.observe_key(4);
        assert_eq!(store.next_key(), 6);
    }

    #[test]
    fn test_delete_index() {
        let mut store = farm_store();
        store.delete_index("farmerNote").unwrap();
        assert!(store.schema().index("farmerNote").is_none());
        assert!(store.lookup("farmerNote", &Value::text("x")).is_err());
        assert!(store.delete_index("farmerNote").is_err());
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Op {
            Add(i8),
            Delete(u8),
        }

        fn op() -> impl Strategy<Value = Op> {
            prop_oneof![any::<i8>().prop_map(Op::Add), any::<u8>().prop_map(Op::Delete)]
        }

        proptest! {
            #[test]
            fn keys_increase_and_index_matches_records(ops in prop::collection::vec(op(), 1..60)) {
                let mut store = farm_store();
                let mut last_key = 0;
                for op in ops {
                    match op {
                        Op::Add(first) => {
                            let key = store.add(record(first as f64, "p")).unwrap();
                            prop_assert!(key > last_key);
                            last_key = key;
                        }
                        Op::Delete(slot) => {
                            let existing: Vec<Key> = store.get_all().into_iter().map(|(k, _)| k).collect();
                            if !existing.is_empty() {
                                let key = existing[slot as usize % existing.len()];
                                store.delete(key).unwrap();
                            }
                        }
                    }
                }

                let mut indexed = store.lookup("farmerNote", &Value::text("p")).unwrap();
                indexed.sort_unstable();
                let stored: Vec<Key> = store.get_all().into_iter().map(|(k, _)| k).collect();
                prop_assert_eq!(indexed, stored);
            }
        }
    }
}
