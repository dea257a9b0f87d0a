/// Secondary index support for object stores
///
/// Each index maps the value of one attribute to the set of primary keys of
/// the records holding that value. Indexes are non-unique unless declared
/// otherwise, and sequence attributes are indexed according to a
/// [`SequencePolicy`].

use crate::{Error, Key, Record, Result, Value};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

/// How a sequence-valued attribute turns into index keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SequencePolicy {
    /// The whole sequence is one composite key (default)
    Whole,
    /// One index entry per element
    EachElement,
    /// Only the first element is indexed
    FirstElement,
}

impl Default for SequencePolicy {
    fn default() -> Self {
        SequencePolicy::Whole
    }
}

/// Index definition, declared during an upgrade
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDef {
    /// Index name (unique per store)
    pub name: String,
    /// Attribute the index reads
    pub key_path: String,
    /// Reject a second record with the same value
    pub unique: bool,
    /// Strategy for sequence values
    pub sequence_policy: SequencePolicy,
}

impl IndexDef {
    /// Create a non-unique index over `key_path`
    pub fn new(name: impl Into<String>, key_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_path: key_path.into(),
            unique: false,
            sequence_policy: SequencePolicy::Whole,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn sequence_policy(mut self, policy: SequencePolicy) -> Self {
        self.sequence_policy = policy;
        self
    }

    /// Index keys a record contributes to this index
    pub fn keys_for(&self, record: &Record) -> Vec<IndexKey> {
        let value = match record.get(&self.key_path) {
            Some(value) => value,
            None => return Vec::new(),
        };

        match (value, self.sequence_policy) {
            (Value::Sequence(seq), SequencePolicy::EachElement) => {
                let unique: BTreeSet<IndexKey> =
                    seq.iter().map(|n| IndexKey::Number(normalize(*n))).collect();
                unique.into_iter().collect()
            }
            (Value::Sequence(seq), SequencePolicy::FirstElement) => seq
                .first()
                .map(|n| vec![IndexKey::Number(normalize(*n))])
                .unwrap_or_default(),
            (value, _) => vec![IndexKey::from_value(value)],
        }
    }
}

/// -0.0 and 0.0 index as the same key
fn normalize(n: f64) -> f64 {
    if n == 0.0 {
        0.0
    } else {
        n
    }
}

/// Totally ordered index key.
///
/// Ordering across kinds: numbers < timestamps < text < sequences.
#[derive(Debug, Clone)]
pub enum IndexKey {
    Number(f64),
    Timestamp(i64),
    Text(String),
    Sequence(Vec<f64>),
}

impl IndexKey {
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Number(n) => IndexKey::Number(normalize(*n)),
            Value::Timestamp(ts) => IndexKey::Timestamp(*ts),
            Value::Text(s) => IndexKey::Text(s.clone()),
            Value::Sequence(seq) => IndexKey::Sequence(seq.iter().map(|n| normalize(*n)).collect()),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            IndexKey::Number(_) => 0,
            IndexKey::Timestamp(_) => 1,
            IndexKey::Text(_) => 2,
            IndexKey::Sequence(_) => 3,
        }
    }
}

impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (IndexKey::Number(a), IndexKey::Number(b)) => a.total_cmp(b),
            (IndexKey::Timestamp(a), IndexKey::Timestamp(b)) => a.cmp(b),
            (IndexKey::Text(a), IndexKey::Text(b)) => a.cmp(b),
            (IndexKey::Sequence(a), IndexKey::Sequence(b)) => {
                for (x, y) in a.iter().zip(b) {
                    match x.total_cmp(y) {
                        Ordering::Equal => continue,
                        other => return other,
                    }
                }
                a.len().cmp(&b.len())
            }
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for IndexKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for IndexKey {}

/// One materialized index
#[derive(Debug, Clone)]
pub struct Index {
    def: IndexDef,
    entries: BTreeMap<IndexKey, BTreeSet<Key>>,
}

impl Index {
    pub fn new(def: IndexDef) -> Self {
        Self {
            def,
            entries: BTreeMap::new(),
        }
    }

    pub fn def(&self) -> &IndexDef {
        &self.def
    }

    /// Number of distinct index keys
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn check_unique(&self, key: Key, index_keys: &[IndexKey]) -> Result<()> {
        if !self.def.unique {
            return Ok(());
        }
        for index_key in index_keys {
            if let Some(bucket) = self.entries.get(index_key) {
                if bucket.iter().any(|existing| *existing != key) {
                    return Err(Error::Constraint(format!(
                        "Unique index '{}' already contains {:?}",
                        self.def.name, index_key
                    )));
                }
            }
        }
        Ok(())
    }

    fn insert_keys(&mut self, key: Key, index_keys: Vec<IndexKey>) {
        for index_key in index_keys {
            self.entries.entry(index_key).or_default().insert(key);
        }
    }

    fn remove(&mut self, key: Key, record: &Record) {
        for index_key in self.def.keys_for(record) {
            if let Some(bucket) = self.entries.get_mut(&index_key) {
                bucket.remove(&key);
                if bucket.is_empty() {
                    self.entries.remove(&index_key);
                }
            }
        }
    }

    /// Primary keys stored under `value`, ascending
    pub fn lookup(&self, value: &Value) -> Vec<Key> {
        self.entries
            .get(&IndexKey::from_value(value))
            .map(|bucket| bucket.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Primary keys for every index key within the bounds, in index order.
    /// A record matching several index keys is listed once.
    pub fn range(&self, lower: Bound<&Value>, upper: Bound<&Value>) -> Vec<Key> {
        let lower = lower.map(IndexKey::from_value);
        let upper = upper.map(IndexKey::from_value);
        if let (Bound::Included(lo) | Bound::Excluded(lo), Bound::Included(hi) | Bound::Excluded(hi)) =
            (&lower, &upper)
        {
            // BTreeMap::range panics on inverted bounds
            if lo > hi {
                return Vec::new();
            }
            if lo == hi && (matches!(lower, Bound::Excluded(_)) || matches!(upper, Bound::Excluded(_))) {
                return Vec::new();
            }
        }

        let mut seen = BTreeSet::new();
        let mut keys = Vec::new();
        for bucket in self.entries.range((lower, upper)).map(|(_, bucket)| bucket) {
            for key in bucket {
                if seen.insert(*key) {
                    keys.push(*key);
                }
            }
        }
        keys
    }
}

/// All indexes of one object store
#[derive(Debug, Clone, Default)]
pub struct IndexSet {
    indexes: BTreeMap<String, Index>,
}

impl IndexSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an index set over existing records
    pub fn build<'a>(
        defs: &[IndexDef],
        records: impl Iterator<Item = (&'a Key, &'a Record)> + Clone,
    ) -> Result<Self> {
        let mut set = Self::new();
        for def in defs {
            set.create(def.clone(), records.clone())?;
        }
        Ok(set)
    }

    /// Add an index and populate it from existing records
    pub fn create<'a>(
        &mut self,
        def: IndexDef,
        records: impl Iterator<Item = (&'a Key, &'a Record)>,
    ) -> Result<()> {
        if self.indexes.contains_key(&def.name) {
            return Err(Error::Upgrade(format!("Index '{}' already exists", def.name)));
        }

        let mut index = Index::new(def);
        for (key, record) in records {
            let index_keys = index.def.keys_for(record);
            index.check_unique(*key, &index_keys).map_err(|e| match e {
                Error::Constraint(msg) => Error::Upgrade(msg),
                other => other,
            })?;
            index.insert_keys(*key, index_keys);
        }

        self.indexes.insert(index.def.name.clone(), index);
        Ok(())
    }

    pub fn remove_index(&mut self, name: &str) -> Option<Index> {
        self.indexes.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&Index> {
        self.indexes.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.indexes.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.indexes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indexes.is_empty()
    }

    /// Index a newly written record.
    ///
    /// Every unique index is checked before any index is touched, so a
    /// rejected record leaves no entries behind.
    pub fn insert(&mut self, key: Key, record: &Record) -> Result<()> {
        let mut pending = Vec::with_capacity(self.indexes.len());
        for index in self.indexes.values() {
            let index_keys = index.def.keys_for(record);
            index.check_unique(key, &index_keys)?;
            pending.push(index_keys);
        }

        for (index, index_keys) in self.indexes.values_mut().zip(pending) {
            index.insert_keys(key, index_keys);
        }
        Ok(())
    }

    /// Remove every entry a record contributed
    pub fn remove(&mut self, key: Key, record: &Record) {
        for index in self.indexes.values_mut() {
            index.remove(key, record);
        }
    }

    pub fn lookup(&self, name: &str, value: &Value) -> Result<Vec<Key>> {
        Ok(self.require(name)?.lookup(value))
    }

    pub fn range(&self, name: &str, lower: Bound<&Value>, upper: Bound<&Value>) -> Result<Vec<Key>> {
        Ok(self.require(name)?.range(lower, upper))
    }

    fn require(&self, name: &str) -> Result<&Index> {
        self.indexes
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("index '{}'", name)))
    }
}
