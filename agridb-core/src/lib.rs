pub mod error;
pub mod types;
pub mod config;
pub mod validation;
pub mod codec;
pub mod index;
pub mod schema;
pub mod store;
pub mod log;
pub mod memory_log;
pub mod request;
pub mod txn;
mod coordinator;
pub mod upgrade;
mod engine;
pub mod database;

pub use config::DatabaseConfig;
pub use database::Database;
pub use engine::Location;
pub use error::{Error, Result};
pub use index::{IndexDef, SequencePolicy};
pub use request::Request;
pub use schema::{DatabaseSchema, StoreOptions, StoreSchema};
pub use txn::{ObjectStore, Transaction, TransactionMode, TransactionScope, TransactionState};
pub use types::*;
pub use upgrade::UpgradeTransaction;
pub use validation::{AttributeDef, ExtraAttributes};
