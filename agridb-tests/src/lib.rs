/// Test utilities and helpers for AgriDB testing
///
/// Provides a farm database wrapper that manages its temporary directory,
/// record generators, and the reference scenario harness.

use agridb_api::{FarmDataClient, FarmRecord};
use agridb_core::{Database, TransactionMode, TransactionState, Version};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tempfile::TempDir;

pub mod harness;

/// Farm database wrapper that manages temporary directory lifecycle
pub struct TestDatabase {
    pub client: FarmDataClient,
    pub path: PathBuf,
    _temp_dir: Option<TempDir>,
}

impl TestDatabase {
    /// Create a new farm database in a temporary directory
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let path = temp_dir.path().join("AgricultureDB");
        let client = FarmDataClient::open(&path).expect("Failed to open database");

        Self {
            client,
            path,
            _temp_dir: Some(temp_dir),
        }
    }

    /// Open the farm database at a specific path (created when missing)
    pub fn open(path: PathBuf) -> Self {
        let client = FarmDataClient::open(&path).expect("Failed to open database");

        Self {
            client,
            path,
            _temp_dir: None,
        }
    }

    /// Create an in-memory farm database with a process-unique name
    pub fn in_memory() -> Self {
        static NEXT: AtomicUsize = AtomicUsize::new(0);
        let name = format!("test-db-{}", NEXT.fetch_add(1, Ordering::SeqCst));
        let client = FarmDataClient::open_in_memory(&name).expect("Failed to open in-memory database");

        Self {
            client,
            path: PathBuf::from(format!(":memory:{}", name)),
            _temp_dir: None,
        }
    }

    pub fn db(&self) -> &Database {
        self.client.database()
    }

    /// Get the database path
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Close and reopen the database (for testing persistence)
    pub fn reopen(self) -> Self {
        let Self {
            client,
            path,
            _temp_dir,
        } = self;
        drop(client);
        let client = FarmDataClient::open(&path).expect("Failed to reopen database");

        Self {
            client,
            path,
            _temp_dir,
        }
    }

    /// Close and reopen at a later schema version, after an upgrade made
    /// through another handle
    pub fn reopen_at(self, version: Version) -> Self {
        let Self {
            client,
            path,
            _temp_dir,
        } = self;
        drop(client);
        let db = Database::open(&path, version, agridb_api::create_farm_schema)
            .expect("Failed to reopen database");
        let client = FarmDataClient::from_database(db).expect("Missing farm store");

        Self {
            client,
            path,
            _temp_dir,
        }
    }

    /// Number of stored farm records
    pub fn count(&self) -> usize {
        let txn = self
            .db()
            .transaction(&[agridb_api::FARM_STORE], TransactionMode::ReadOnly)
            .expect("Failed to start transaction");
        txn.object_store(agridb_api::FARM_STORE)
            .expect("Missing farm store")
            .count()
            .wait()
            .expect("Failed to count records")
    }
}

impl Default for TestDatabase {
    fn default() -> Self {
        Self::new()
    }
}

/// Mock farm record generator for testing
pub struct MockDataGenerator {
    counter: u64,
}

impl MockDataGenerator {
    /// Create a new mock data generator
    pub fn new() -> Self {
        Self { counter: 0 }
    }

    /// Record derived from the current counter value (does not increment)
    pub fn record(&self) -> FarmRecord {
        let idx = self.counter;
        FarmRecord::new(
            vec![idx as f64, idx as f64 * 0.5],
            format!("note {}", idx),
            (idx % 180) as f64,
            1_700_000_000_000 + idx as i64 * 60_000,
        )
        .with_crop_photo(format!("data:image/png;base64,{:08}", idx))
    }

    /// Record with a note of the given size (does not increment counter)
    pub fn sized_record(&self, bytes: usize) -> FarmRecord {
        let mut record = self.record();
        record.farmer_note = "x".repeat(bytes);
        record
    }

    /// Increment the counter and return the new value
    pub fn next(&mut self) -> u64 {
        self.counter += 1;
        self.counter
    }

    /// Generate multiple records, advancing the counter for each
    pub fn batch(&mut self, count: usize) -> Vec<FarmRecord> {
        (0..count)
            .map(|_| {
                let record = self.record();
                self.next();
                record
            })
            .collect()
    }
}

impl Default for MockDataGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Poll until `state()` returns a terminal transaction state
pub fn wait_for_terminal(state: impl Fn() -> TransactionState, timeout: Duration) -> TransactionState {
    let deadline = Instant::now() + timeout;
    loop {
        let current = state();
        if current.is_terminal() || Instant::now() >= deadline {
            return current;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}
