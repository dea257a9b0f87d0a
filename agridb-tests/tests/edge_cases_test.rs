/// Edge cases and boundary condition tests for AgriDB

use agridb_api::{FarmDataClient, FarmRecord, FARM_STORE};
use agridb_core::{
    AttributeDef, Database, DatabaseConfig, ExtraAttributes, RecordBuilder, StoreOptions,
    TransactionMode, Value, ValueKind,
};
use agridb_test_utils::{MockDataGenerator, TestDatabase};
use std::ops::Bound;

#[test]
fn test_empty_database() {
    let db = TestDatabase::in_memory();

    assert!(db.client.retrieve_all().unwrap().is_empty());
    assert!(db.client.find_by_sensor_reading(1.0).unwrap().is_empty());
    assert_eq!(db.client.get(1).unwrap_err().code(), "NOT_FOUND");
    assert_eq!(db.client.render_json().unwrap(), "[]");
}

#[test]
fn test_single_record() {
    let db = TestDatabase::in_memory();
    let record = MockDataGenerator::new().record();

    let key = db.client.store_record(&record).unwrap();
    assert_eq!(key, 1);
    assert_eq!(db.client.get(key).unwrap().record, record);

    // Delete the only record
    db.client.delete(key).unwrap();
    assert!(db.client.retrieve_all().unwrap().is_empty());

    // Keys are never reused
    assert_eq!(db.client.store_record(&record).unwrap(), 2);
}

#[test]
fn test_absent_photo_differs_from_empty_photo() {
    let db = TestDatabase::in_memory();
    let absent = FarmRecord::new(vec![25.5, 58.0], "", 28.7041, 1_725_634_800_000);
    let empty = absent.clone().with_crop_photo("");

    let a = db.client.store_record(&absent).unwrap();
    let b = db.client.store_record(&empty).unwrap();

    assert_eq!(db.client.get(a).unwrap().record.crop_photo, None);
    assert_eq!(db.client.get(b).unwrap().record.crop_photo, Some(String::new()));

    // Only the present photo is indexed
    let txn = db.db().transaction(&[FARM_STORE], TransactionMode::ReadOnly).unwrap();
    let photos = txn
        .object_store(FARM_STORE)
        .unwrap()
        .index_lookup("cropPhoto", Value::text(""))
        .wait()
        .unwrap();
    assert_eq!(photos, vec![b]);
}

#[test]
fn test_empty_note_is_kept() {
    let db = TestDatabase::in_memory();
    let key = db
        .client
        .store_record(&FarmRecord::new(vec![1.0], "", 0.0, 0))
        .unwrap();

    let stored = db.client.get(key).unwrap();
    assert_eq!(stored.record.farmer_note, "");
}

#[test]
fn test_extreme_values() {
    let db = TestDatabase::in_memory();
    let record = FarmRecord::new(
        vec![f64::MAX, f64::MIN_POSITIVE, -f64::MAX, 0.0],
        "extreme",
        -180.0,
        i64::MAX / 1_000_000,
    );

    let key = db.client.store_record(&record).unwrap();
    assert_eq!(db.client.get(key).unwrap().record, record);
}

#[test]
fn test_negative_zero_matches_zero_in_index() {
    let db = TestDatabase::in_memory();
    let key = db
        .client
        .store_record(&FarmRecord::new(vec![-0.0, 1.0], "neg zero", 0.0, 0))
        .unwrap();

    let found: Vec<u64> = db
        .client
        .find_by_sensor_reading(0.0)
        .unwrap()
        .iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(found, vec![key]);
}

#[test]
fn test_non_finite_values_rejected() {
    let db = TestDatabase::in_memory();

    for record in [
        FarmRecord::new(vec![f64::NAN], "nan reading", 0.0, 0),
        FarmRecord::new(vec![1.0, f64::INFINITY], "inf reading", 0.0, 0),
        FarmRecord::new(vec![1.0], "inf gps", f64::NEG_INFINITY, 0),
    ] {
        let err = db.client.store_record(&record).unwrap_err();
        assert_eq!(err.code(), "CONSTRAINT_ERROR", "{}", record.farmer_note);
    }
    assert_eq!(db.count(), 0);
}

#[test]
fn test_unusual_characters() {
    let db = TestDatabase::in_memory();
    let notes = [
        "Unusual characters: !@#$%^&*()",
        "quotes \" and ' and \\ backslash",
        "line\nbreaks\tand tabs",
        "unicode: 🌾 maïs 稲 пшеница",
        "\u{0}nul byte",
    ];

    let keys: Vec<u64> = notes
        .iter()
        .map(|note| {
            db.client
                .store_record(&FarmRecord::new(vec![1.0], *note, 0.0, 0))
                .unwrap()
        })
        .collect();

    for (key, note) in keys.iter().zip(notes) {
        assert_eq!(db.client.get(*key).unwrap().record.farmer_note, note);
    }

    // JSON rendering escapes them
    let json: serde_json::Value = serde_json::from_str(&db.client.render_json().unwrap()).unwrap();
    assert_eq!(json[3]["farmerNote"], notes[3]);
}

#[test]
fn test_large_note_and_photo() {
    let db = TestDatabase::in_memory();
    let gen = MockDataGenerator::new();
    let mut record = gen.sized_record(256 * 1024);
    record.crop_photo = Some(format!("data:image/png;base64,{}", "A".repeat(512 * 1024)));

    let key = db.client.store_record(&record).unwrap();
    assert_eq!(db.client.get(key).unwrap().record, record);
}

#[test]
fn test_max_record_bytes() {
    let client = FarmDataClient::from_database(
        Database::open_in_memory_with_config(
            "edge-max-record-bytes",
            DatabaseConfig::new().with_max_record_bytes(1024),
            agridb_api::DATABASE_VERSION,
            agridb_api::create_farm_schema,
        )
        .unwrap(),
    )
    .unwrap();

    let gen = MockDataGenerator::new();
    client.store_record(&gen.sized_record(100)).unwrap();
    let err = client.store_record(&gen.sized_record(2048)).unwrap_err();
    assert_eq!(err.code(), "CONSTRAINT_ERROR");
    assert_eq!(client.retrieve_all().unwrap().len(), 1);
}

#[test]
fn test_missing_and_mistyped_attributes_rejected() {
    let db = TestDatabase::in_memory();
    let txn = db.db().transaction(&[FARM_STORE], TransactionMode::ReadWrite).unwrap();
    let store = txn.object_store(FARM_STORE).unwrap();

    let mut missing = MockDataGenerator::new().record().to_record();
    missing.remove("timestamp");
    let err = store.add(missing).wait().unwrap_err();
    assert_eq!(err.code(), "CONSTRAINT_ERROR");
    assert!(err.to_string().contains("timestamp"));
    drop(store);
    drop(txn);

    let txn = db.db().transaction(&[FARM_STORE], TransactionMode::ReadWrite).unwrap();
    let mut mistyped = MockDataGenerator::new().record().to_record();
    mistyped.insert("gpsCoordinates".to_string(), Value::text("28.6N"));
    let err = txn.object_store(FARM_STORE).unwrap().add(mistyped).wait().unwrap_err();
    assert_eq!(err.code(), "CONSTRAINT_ERROR");
    drop(txn);

    assert_eq!(db.count(), 0);
}

#[test]
fn test_undeclared_attribute_policies() {
    let db = Database::open_in_memory("edge-extra-attributes", 1, |upgrade| {
        let options = |policy| {
            StoreOptions::new()
                .attribute(AttributeDef::new("crop", ValueKind::Text).required())
                .extra_attributes(policy)
        };
        upgrade.create_object_store("strict", options(ExtraAttributes::Reject))?;
        upgrade.create_object_store("lenient", options(ExtraAttributes::Ignore))
    })
    .unwrap();

    let record = RecordBuilder::new()
        .text("crop", "wheat")
        .number("yield", 7.5)
        .build();

    let txn = db.transaction(&["strict"], TransactionMode::ReadWrite).unwrap();
    let err = txn.object_store("strict").unwrap().add(record.clone()).wait().unwrap_err();
    assert_eq!(err.code(), "CONSTRAINT_ERROR");
    drop(txn);

    let txn = db.transaction(&["lenient"], TransactionMode::ReadWrite).unwrap();
    let store = txn.object_store("lenient").unwrap();
    let key = store.add(record).wait().unwrap();
    let stored = store.get(key).wait().unwrap();
    assert!(!stored.contains_key("yield"));
    assert_eq!(stored["crop"], Value::text("wheat"));
}

#[test]
fn test_index_range_bounds() {
    let db = TestDatabase::in_memory();
    let keys: Vec<u64> = [-45.0, 0.0, 28.6, 40.7, 180.0]
        .iter()
        .map(|gps| {
            db.client
                .store_record(&FarmRecord::new(vec![1.0], "range", *gps, 0))
                .unwrap()
        })
        .collect();

    let txn = db.db().transaction(&[FARM_STORE], TransactionMode::ReadOnly).unwrap();
    let store = txn.object_store(FARM_STORE).unwrap();

    let inside = store
        .index_range(
            "gpsCoordinates",
            Bound::Included(Value::number(0.0)),
            Bound::Excluded(Value::number(40.7)),
        )
        .wait()
        .unwrap();
    assert_eq!(inside, vec![keys[1], keys[2]]);

    let all = store
        .index_range("gpsCoordinates", Bound::Unbounded, Bound::Unbounded)
        .wait()
        .unwrap();
    assert_eq!(all, keys);
}

#[test]
fn test_unknown_store_and_index() {
    let db = TestDatabase::in_memory();

    let err = db
        .db()
        .transaction(&["NoSuchStore"], TransactionMode::ReadOnly)
        .unwrap_err();
    assert_eq!(err.code(), "NOT_FOUND");

    let err = db.db().transaction(&[], TransactionMode::ReadOnly).unwrap_err();
    assert_eq!(err.code(), "INVALID_ARGUMENT");

    let txn = db.db().transaction(&[FARM_STORE], TransactionMode::ReadOnly).unwrap();
    assert_eq!(txn.object_store("Other").unwrap_err().code(), "NOT_FOUND");
    let err = txn
        .object_store(FARM_STORE)
        .unwrap()
        .index_lookup("noSuchIndex", Value::number(1.0))
        .wait()
        .unwrap_err();
    assert_eq!(err.code(), "NOT_FOUND");
}

#[test]
fn test_alternating_add_delete() {
    let db = TestDatabase::in_memory();
    let mut gen = MockDataGenerator::new();

    for record in gen.batch(50) {
        let key = db.client.store_record(&record).unwrap();
        db.client.delete(key).unwrap();
    }

    assert_eq!(db.count(), 0);
    assert_eq!(db.client.store_record(&gen.record()).unwrap(), 51);
}
