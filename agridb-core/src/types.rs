use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Primary key - assigned by the store, strictly increasing per collection
pub type Key = u64;

/// Transaction identifier - monotonic per engine
pub type TxnId = u64;

/// Schema version of a database
pub type Version = u64;

/// Typed attribute value
///
/// There is no null variant: an absent attribute is simply not present
/// in the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Single floating-point scalar
    Number(f64),
    /// Ordered sequence of numbers
    Sequence(Vec<f64>),
    /// Free text, including pre-encoded binary blobs
    Text(String),
    /// Timestamp (i64 milliseconds since epoch, UTC)
    Timestamp(i64),
}

impl Value {
    pub fn number(n: f64) -> Self {
        Value::Number(n)
    }

    pub fn sequence(values: impl Into<Vec<f64>>) -> Self {
        Value::Sequence(values.into())
    }

    pub fn text(s: impl Into<String>) -> Self {
        Value::Text(s.into())
    }

    pub fn timestamp(millis: i64) -> Self {
        Value::Timestamp(millis)
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_sequence(&self) -> Option<&[f64]> {
        match self {
            Value::Sequence(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<i64> {
        match self {
            Value::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Number(_) => ValueKind::Number,
            Value::Sequence(_) => ValueKind::Sequence,
            Value::Text(_) => ValueKind::Text,
            Value::Timestamp(_) => ValueKind::Timestamp,
        }
    }

    /// Approximate in-memory payload size in bytes
    pub fn estimated_size(&self) -> usize {
        match self {
            Value::Number(_) => 8,
            Value::Sequence(v) => v.len() * 8,
            Value::Text(s) => s.len(),
            Value::Timestamp(_) => 8,
        }
    }
}

/// Attribute type tag, used by collection declarations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    Number,
    Sequence,
    Text,
    Timestamp,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Number => "number",
            ValueKind::Sequence => "sequence",
            ValueKind::Text => "text",
            ValueKind::Timestamp => "timestamp",
        };
        f.write_str(name)
    }
}

/// Record - attribute names mapped to values, kept in name order
pub type Record = BTreeMap<String, Value>;

/// Helper to build records
#[derive(Debug, Default)]
pub struct RecordBuilder {
    record: Record,
}

impl RecordBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn number(mut self, name: impl Into<String>, value: f64) -> Self {
        self.record.insert(name.into(), Value::Number(value));
        self
    }

    pub fn sequence(mut self, name: impl Into<String>, values: impl Into<Vec<f64>>) -> Self {
        self.record.insert(name.into(), Value::Sequence(values.into()));
        self
    }

    pub fn text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.record.insert(name.into(), Value::Text(value.into()));
        self
    }

    /// Insert a text attribute only when present
    pub fn optional_text(mut self, name: impl Into<String>, value: Option<impl Into<String>>) -> Self {
        if let Some(v) = value {
            self.record.insert(name.into(), Value::Text(v.into()));
        }
        self
    }

    pub fn timestamp(mut self, name: impl Into<String>, millis: i64) -> Self {
        self.record.insert(name.into(), Value::Timestamp(millis));
        self
    }

    pub fn value(mut self, name: impl Into<String>, value: Value) -> Self {
        self.record.insert(name.into(), value);
        self
    }

    pub fn build(self) -> Record {
        self.record
    }
}

/// CRC32 checksum helpers
pub mod checksum {
    /// Compute CRC32 checksum of data
    pub fn compute(data: &[u8]) -> u32 {
        crc32fast::hash(data)
    }

    /// Verify CRC32 checksum
    pub fn verify(data: &[u8], expected: u32) -> bool {
        crc32fast::hash(data) == expected
    }
}
