/// Record validation for AgriDB object stores
///
/// Checks a record against the attribute set a collection declared during
/// upgrade: type tags, required attributes, undeclared attributes and size.

use crate::{Error, Record, Result, Value, ValueKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What to do with attributes a collection did not declare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtraAttributes {
    /// Fail the write with a constraint error
    Reject,
    /// Strip them before storage
    Ignore,
}

impl Default for ExtraAttributes {
    fn default() -> Self {
        ExtraAttributes::Reject
    }
}

/// Declaration of one attribute of a collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeDef {
    /// Attribute name
    pub name: String,
    /// Type tag the value must carry
    pub kind: ValueKind,
    /// Whether this attribute must be present
    pub required: bool,
    /// Description (for documentation)
    pub description: Option<String>,
}

impl AttributeDef {
    /// Create an optional attribute declaration
    pub fn new(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
            description: None,
        }
    }

    /// Mark this attribute as required
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Add a description
    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }

    /// Validate a value against this declaration
    pub fn validate(&self, value: Option<&Value>) -> Result<()> {
        let val = match value {
            None if self.required => {
                return Err(Error::Constraint(format!(
                    "Required attribute '{}' is missing",
                    self.name
                )));
            }
            None => return Ok(()),
            Some(val) => val,
        };

        if val.kind() != self.kind {
            return Err(Error::Constraint(format!(
                "Attribute '{}' has wrong type (expected {}, got {})",
                self.name,
                self.kind,
                val.kind()
            )));
        }

        check_finite(&self.name, val)
    }
}

/// Numbers must be finite: NaN breaks equality and neither NaN nor
/// infinity survives JSON rendering.
fn check_finite(name: &str, value: &Value) -> Result<()> {
    let finite = match value {
        Value::Number(n) => n.is_finite(),
        Value::Sequence(v) => v.iter().all(|n| n.is_finite()),
        Value::Text(_) | Value::Timestamp(_) => true,
    };
    if finite {
        Ok(())
    } else {
        Err(Error::Constraint(format!(
            "Attribute '{}' contains a non-finite number",
            name
        )))
    }
}

/// Validator for records of one collection
#[derive(Debug, Clone)]
pub struct Validator {
    attributes: BTreeMap<String, AttributeDef>,
    extra: ExtraAttributes,
    max_record_bytes: Option<usize>,
}

impl Validator {
    /// Create a validator from attribute declarations.
    ///
    /// A validator without declarations accepts any attribute.
    pub fn new(attributes: &[AttributeDef], extra: ExtraAttributes) -> Self {
        Self {
            attributes: attributes
                .iter()
                .map(|def| (def.name.clone(), def.clone()))
                .collect(),
            extra,
            max_record_bytes: None,
        }
    }

    /// Cap the approximate encoded size of a record
    pub fn with_max_record_bytes(mut self, limit: Option<usize>) -> Self {
        self.max_record_bytes = limit;
        self
    }

    pub fn is_schema_free(&self) -> bool {
        self.attributes.is_empty()
    }

    /// Validate a record, returning the record that should be stored.
    ///
    /// Under [`ExtraAttributes::Ignore`] undeclared attributes are dropped
    /// from the returned record.
    pub fn validate(&self, mut record: Record) -> Result<Record> {
        if self.is_schema_free() {
            for (name, value) in &record {
                check_finite(name, value)?;
            }
        } else {
            for def in self.attributes.values() {
                def.validate(record.get(&def.name))?;
            }

            let undeclared: Vec<String> = record
                .keys()
                .filter(|name| !self.attributes.contains_key(*name))
                .cloned()
                .collect();

            if !undeclared.is_empty() {
                match self.extra {
                    ExtraAttributes::Reject => {
                        return Err(Error::Constraint(format!(
                            "Undeclared attributes: {}",
                            undeclared.join(", ")
                        )));
                    }
                    ExtraAttributes::Ignore => {
                        for name in &undeclared {
                            record.remove(name);
                        }
                    }
                }
            }
        }

        if let Some(limit) = self.max_record_bytes {
            let size: usize = record
                .iter()
                .map(|(name, value)| name.len() + value.estimated_size())
                .sum();
            if size > limit {
                return Err(Error::Constraint(format!(
                    "Record size {} exceeds maximum {}",
                    size, limit
                )));
            }
        }

        Ok(record)
    }
}
