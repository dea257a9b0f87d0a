/// Version upgrade tests for AgriDB
///
/// These tests verify that schema creation runs exactly once per version,
/// even when several threads open the same database at once, and that a
/// failed upgrade leaves the previous version and its data intact.

use agridb_api::{create_farm_schema, FarmDataClient, DATABASE_VERSION, FARM_STORE};
use agridb_core::{Database, Error, IndexDef, StoreOptions, TransactionMode, Value};
use agridb_test_utils::{MockDataGenerator, TestDatabase};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Barrier};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn test_concurrent_opens_upgrade_once() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().to_path_buf();
    let runs = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let path = path.clone();
            let runs = Arc::clone(&runs);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                Database::open(&path, DATABASE_VERSION, move |upgrade| {
                    runs.fetch_add(1, Ordering::SeqCst);
                    create_farm_schema(upgrade)
                })
                .unwrap()
            })
        })
        .collect();

    let dbs: Vec<Database> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    for db in &dbs {
        assert_eq!(db.version(), DATABASE_VERSION);
        assert_eq!(db.store_names(), vec![FARM_STORE.to_string()]);
    }

    // Every handle shares one database
    let client = FarmDataClient::from_database(dbs[0].clone()).unwrap();
    let key = client.store_record(&MockDataGenerator::new().record()).unwrap();
    let other = FarmDataClient::from_database(dbs[7].clone()).unwrap();
    assert_eq!(other.get(key).unwrap().id, key);
}

#[test]
fn test_upgrade_not_rerun_on_reopen() {
    let db = TestDatabase::new();
    let path = db.path().clone();
    drop(db);

    let ran = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&ran);
    let db = Database::open(&path, DATABASE_VERSION, move |upgrade| {
        counter.fetch_add(1, Ordering::SeqCst);
        create_farm_schema(upgrade)
    })
    .unwrap();

    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert_eq!(db.version(), DATABASE_VERSION);
}

#[test]
fn test_failed_upgrade_keeps_old_version() {
    let db = TestDatabase::new();
    let key = db.client.store_record(&MockDataGenerator::new().record()).unwrap();

    let err = Database::open(db.path(), 2, |upgrade| {
        upgrade.create_object_store("Harvests", StoreOptions::new())?;
        upgrade.delete_object_store(FARM_STORE)?;
        Err(Error::InvalidArgument("harvest schema incomplete".to_string()))
    })
    .unwrap_err();
    assert_eq!(err.code(), "UPGRADE_ERROR");
    assert!(err.to_string().contains("harvest schema incomplete"));

    // Nothing of the failed upgrade is visible, live or after reopen
    assert_eq!(db.db().version(), 1);
    assert_eq!(db.db().store_names(), vec![FARM_STORE.to_string()]);
    let db = db.reopen();
    assert_eq!(db.db().version(), 1);
    assert_eq!(db.client.get(key).unwrap().id, key);
}

#[test]
fn test_panicking_upgrade_keeps_old_version() {
    let db = TestDatabase::new();

    let err = Database::open(db.path(), 2, |_upgrade| panic!("schema bug")).unwrap_err();
    assert_eq!(err.code(), "UPGRADE_ERROR");
    assert_eq!(db.db().version(), 1);

    // The database stays usable
    db.client.store_record(&MockDataGenerator::new().record()).unwrap();
    assert_eq!(db.count(), 1);
}

#[test]
fn test_lower_version_refused() {
    let db = TestDatabase::new();
    Database::open(db.path(), 3, |upgrade| {
        upgrade.create_object_store("Harvests", StoreOptions::new())
    })
    .unwrap();

    let err = Database::open(db.path(), 2, |_| Ok(())).unwrap_err();
    assert_eq!(err.code(), "OPEN_ERROR");
    let err = Database::open(db.path(), 0, |_| Ok(())).unwrap_err();
    assert_eq!(err.code(), "OPEN_ERROR");
    assert_eq!(db.db().version(), 3);
}

#[test]
fn test_upgrade_sees_old_version() {
    let db = TestDatabase::new();
    let (tx, rx) = mpsc::channel();

    Database::open(db.path(), 5, move |upgrade| {
        tx.send((upgrade.old_version(), upgrade.new_version(), upgrade.object_store_names()))
            .unwrap();
        Ok(())
    })
    .unwrap();

    let (old, new, stores) = rx.recv().unwrap();
    assert_eq!(old, 1);
    assert_eq!(new, 5);
    assert_eq!(stores, vec![FARM_STORE.to_string()]);
}

#[test]
fn test_new_index_covers_existing_records() {
    let db = TestDatabase::new();
    let mut gen = MockDataGenerator::new();
    let keys: Vec<u64> = gen
        .batch(3)
        .iter()
        .map(|record| db.client.store_record(record).unwrap())
        .collect();

    Database::open(db.path(), 2, |upgrade| {
        upgrade.create_index(FARM_STORE, IndexDef::new("noteUnique", "farmerNote").unique())
    })
    .unwrap();

    let txn = db.db().transaction(&[FARM_STORE], TransactionMode::ReadWrite).unwrap();
    let store = txn.object_store(FARM_STORE).unwrap();
    let found = store.index_lookup("noteUnique", Value::text("note 1")).wait().unwrap();
    assert_eq!(found, vec![keys[1]]);

    // The unique index now rejects a duplicate note
    let err = store
        .add(MockDataGenerator::new().record().to_record())
        .wait()
        .unwrap_err();
    assert_eq!(err.code(), "CONSTRAINT_ERROR");
    drop(store);
    drop(txn);

    // The index is rebuilt from the log on reopen
    let db = db.reopen_at(2);
    let schema = db.db().store_schema(FARM_STORE).unwrap();
    assert!(schema.index("noteUnique").map(|def| def.unique).unwrap());
}

#[test]
fn test_unique_index_over_duplicates_fails_upgrade() {
    let db = TestDatabase::new();
    let record = MockDataGenerator::new().record();
    db.client.store_record(&record).unwrap();
    db.client.store_record(&record).unwrap();

    let err = Database::open(db.path(), 2, |upgrade| {
        upgrade.create_index(FARM_STORE, IndexDef::new("noteUnique", "farmerNote").unique())
    })
    .unwrap_err();
    assert_eq!(err.code(), "UPGRADE_ERROR");

    assert_eq!(db.db().version(), 1);
    assert!(db.db().store_schema(FARM_STORE).unwrap().index("noteUnique").is_none());
}

#[test]
fn test_deleted_store_stays_deleted() {
    let db = TestDatabase::new();
    db.client.store_record(&MockDataGenerator::new().record()).unwrap();

    Database::open(db.path(), 2, |upgrade| {
        upgrade.delete_object_store(FARM_STORE)?;
        upgrade.create_object_store(FARM_STORE, agridb_api::farm_store_options())
    })
    .unwrap();

    // Recreated store starts empty with a fresh key generator
    assert_eq!(db.count(), 0);
    let db = db.reopen_at(2);
    assert_eq!(db.count(), 0);
    assert_eq!(db.client.store_record(&MockDataGenerator::new().record()).unwrap(), 1);
}

#[test]
fn test_upgrade_waits_for_running_transactions() {
    let db = TestDatabase::new();
    let path = db.path().clone();

    let txn = db.db().transaction(&[FARM_STORE], TransactionMode::ReadWrite).unwrap();
    let store = txn.object_store(FARM_STORE).unwrap();
    store.add(MockDataGenerator::new().record().to_record()).wait().unwrap();

    let (tx, rx) = mpsc::channel();
    let opener = thread::spawn(move || {
        let upgraded = Database::open(&path, 2, |upgrade| {
            upgrade.create_object_store("Harvests", StoreOptions::new())
        });
        tx.send(upgraded.map(|db| db.version())).unwrap();
    });

    // Blocked behind the open readwrite transaction
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    assert_eq!(db.db().version(), 1);

    drop(store);
    txn.commit().wait().unwrap();
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap(), 2);
    opener.join().unwrap();

    // The committed record survived the upgrade
    assert_eq!(db.count(), 1);
    assert!(db.db().store_names().contains(&"Harvests".to_string()));
}
