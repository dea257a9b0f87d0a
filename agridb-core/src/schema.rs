/// Collection declarations
///
/// A database schema is the set of object stores, their declared attributes
/// and their index definitions. It only changes inside an upgrade.

use crate::index::IndexDef;
use crate::validation::{AttributeDef, ExtraAttributes};
use crate::Version;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Options for creating an object store during an upgrade
#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    /// Declared attributes (empty = schema-free store)
    pub attributes: Vec<AttributeDef>,
    /// Undeclared attribute policy (None = database default)
    pub extra_attributes: Option<ExtraAttributes>,
}

impl StoreOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an attribute
    pub fn attribute(mut self, def: AttributeDef) -> Self {
        self.attributes.push(def);
        self
    }

    pub fn extra_attributes(mut self, policy: ExtraAttributes) -> Self {
        self.extra_attributes = Some(policy);
        self
    }
}

/// Persisted declaration of one object store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSchema {
    pub name: String,
    pub attributes: Vec<AttributeDef>,
    pub extra_attributes: ExtraAttributes,
    pub indexes: Vec<IndexDef>,
}

impl StoreSchema {
    pub fn new(name: impl Into<String>, options: StoreOptions, default_extra: ExtraAttributes) -> Self {
        Self {
            name: name.into(),
            attributes: options.attributes,
            extra_attributes: options.extra_attributes.unwrap_or(default_extra),
            indexes: Vec::new(),
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeDef> {
        self.attributes.iter().find(|def| def.name == name)
    }

    pub fn index(&self, name: &str) -> Option<&IndexDef> {
        self.indexes.iter().find(|def| def.name == name)
    }
}

/// Versioned set of store declarations
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseSchema {
    pub version: Version,
    pub stores: BTreeMap<String, StoreSchema>,
}

impl DatabaseSchema {
    pub fn store_names(&self) -> Vec<String> {
        self.stores.keys().cloned().collect()
    }
}
