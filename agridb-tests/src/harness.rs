/// Reference scenario verification
///
/// Each scenario inserts one farm record, reads every record back in a new
/// transaction once the insert has committed, finds the inserted record by
/// its primary key and compares it field by field. The steps are chained
/// through completion callbacks, never by blocking on a result. Every comparison is a
/// named [`FieldCheck`], so a report points at the field that changed.

use agridb_api::record::SENSOR_READINGS;
use agridb_api::{FarmDataClient, FarmRecord, StoredFarmRecord, FARM_STORE};
use agridb_core::{codec, Database, Key, Record, TransactionMode, TransactionScope, Value};
use crossbeam::channel::{self, Sender};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Encoded photo used by the reference payloads
pub const CROP_PHOTO_SAMPLE: &str = "data:image/png;base64,iVBORw0KGgoAAAANSUhEUgAAA...";

/// One reference payload
#[derive(Debug, Clone)]
pub struct Scenario {
    pub name: String,
    pub payload: FarmRecord,
    /// Also insert a second record with the same first sensor reading in a
    /// concurrent transaction, and check both are found through the index
    pub twin: bool,
}

/// The five reference payloads
pub fn reference_scenarios() -> Vec<Scenario> {
    vec![
        Scenario {
            name: "Test 1: Valid Input Data".to_string(),
            payload: FarmRecord::new(
                vec![24.7, 56.3],
                "Inspected the field on a sunny morning. Found a few pest traces on the leaves.",
                28.6139,
                1_725_532_200_000, // 2024-09-05T10:30
            )
            .with_crop_photo(CROP_PHOTO_SAMPLE),
            twin: false,
        },
        Scenario {
            name: "Test 2: Empty Strings and Null Values".to_string(),
            payload: FarmRecord::new(vec![25.5, 58.0], "", 28.7041, 1_725_634_800_000), // 2024-09-06T15:00
            twin: false,
        },
        Scenario {
            name: "Test 3: Extreme and Large Values".to_string(),
            payload: FarmRecord::new(
                vec![150.0, 200.0],
                "This is a very long note to test the application's capability of handling large text inputs.",
                -180.0,
                1_735_689_540_000, // 2024-12-31T23:59
            )
            .with_crop_photo(CROP_PHOTO_SAMPLE),
            twin: false,
        },
        Scenario {
            name: "Test 4: Negative Values and Unusual Characters".to_string(),
            payload: FarmRecord::new(
                vec![-10.5, -20.0],
                "Unusual characters: !@#$%^&*()",
                -45.0,
                1_704_067_200_000, // 2024-01-01T00:00
            )
            .with_crop_photo(CROP_PHOTO_SAMPLE),
            twin: false,
        },
        Scenario {
            name: "Test 5: Realistic Farm Data".to_string(),
            payload: FarmRecord::new(
                vec![23.0, 55.0],
                "Regular checkup. Found slight discoloration in some leaves.",
                40.7128,
                1_728_564_300_000, // 2024-10-10T12:45
            )
            .with_crop_photo(CROP_PHOTO_SAMPLE),
            twin: true,
        },
    ]
}

/// Outcome of one named comparison
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldCheck {
    pub field: &'static str,
    pub passed: bool,
    pub expected: String,
    pub actual: String,
}

impl FieldCheck {
    fn new(field: &'static str, passed: bool, expected: String, actual: String) -> Self {
        Self {
            field,
            passed,
            expected,
            actual,
        }
    }
}

impl fmt::Display for FieldCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.passed {
            write!(f, "{}: ok", self.field)
        } else {
            write!(
                f,
                "{}: MISMATCH (expected {}, got {})",
                self.field, self.expected, self.actual
            )
        }
    }
}

/// Result of one scenario
#[derive(Debug, Clone)]
pub struct ScenarioReport {
    pub name: String,
    /// Key assigned to the inserted record
    pub key: Option<Key>,
    pub checks: Vec<FieldCheck>,
    /// Operation failure that stopped the scenario early
    pub error: Option<String>,
}

impl ScenarioReport {
    pub fn passed(&self) -> bool {
        self.error.is_none() && !self.checks.is_empty() && self.checks.iter().all(|c| c.passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &FieldCheck> {
        self.checks.iter().filter(|c| !c.passed)
    }

    pub fn check(&self, field: &str) -> Option<&FieldCheck> {
        self.checks.iter().find(|c| c.field == field)
    }

    fn aborted(name: &str, key: Option<Key>, checks: Vec<FieldCheck>, error: String) -> Self {
        Self {
            name: name.to_string(),
            key,
            checks,
            error: Some(error),
        }
    }

    fn finished(name: &str, key: Key, checks: Vec<FieldCheck>) -> Self {
        Self {
            name: name.to_string(),
            key: Some(key),
            checks,
            error: None,
        }
    }
}

impl fmt::Display for ScenarioReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verdict = if self.passed() { "passed" } else { "FAILED" };
        write!(f, "{}: {}", self.name, verdict)?;
        if let Some(error) = &self.error {
            write!(f, " ({})", error)?;
        }
        for check in &self.checks {
            write!(f, "\n  {}", check)?;
        }
        Ok(())
    }
}

fn shown<T: fmt::Debug>(value: &T) -> String {
    format!("{:?}", value)
}

fn photo_text(photo: &Option<String>) -> String {
    match photo {
        Some(text) => shown(text),
        None => "<absent>".to_string(),
    }
}

/// Timestamp after a text round trip: stored value -> ISO text -> parsed -> ISO text
fn round_trip_timestamp(millis: i64) -> Result<String, String> {
    let text = codec::format_timestamp(millis).map_err(|e| e.to_string())?;
    let parsed = codec::parse_timestamp(&text).map_err(|e| e.to_string())?;
    codec::format_timestamp(parsed).map_err(|e| e.to_string())
}

fn compare(expected: &FarmRecord, actual: &StoredFarmRecord) -> Vec<FieldCheck> {
    let actual = &actual.record;

    let expected_time = round_trip_timestamp(expected.timestamp).unwrap_or_else(|e| e);
    let actual_time = round_trip_timestamp(actual.timestamp).unwrap_or_else(|e| e);

    vec![
        FieldCheck::new(
            "sensor_readings",
            expected.sensor_readings == actual.sensor_readings,
            shown(&expected.sensor_readings),
            shown(&actual.sensor_readings),
        ),
        FieldCheck::new(
            "crop_photo",
            expected.crop_photo == actual.crop_photo,
            photo_text(&expected.crop_photo),
            photo_text(&actual.crop_photo),
        ),
        FieldCheck::new(
            "farmer_note",
            expected.farmer_note == actual.farmer_note,
            shown(&expected.farmer_note),
            shown(&actual.farmer_note),
        ),
        FieldCheck::new(
            "gps_coordinate",
            expected.gps_coordinate == actual.gps_coordinate,
            shown(&expected.gps_coordinate),
            shown(&actual.gps_coordinate),
        ),
        FieldCheck::new(
            "timestamp",
            expected.timestamp == actual.timestamp && expected_time == actual_time,
            expected_time,
            actual_time,
        ),
    ]
}

/// State of one scenario while its callbacks run on the coordinator thread
struct ScenarioRun {
    db: Database,
    scenario: Scenario,
    reports: Sender<ScenarioReport>,
    inserts: Mutex<Inserts>,
}

/// Slot 0 is the payload, slot 1 its twin
struct Inserts {
    added: [Option<Result<Key, String>>; 2],
    outcomes: [Option<Result<Key, String>>; 2],
    outstanding: usize,
}

impl ScenarioRun {
    fn payload(&self, slot: usize) -> FarmRecord {
        let mut payload = self.scenario.payload.clone();
        if slot == 1 {
            payload.farmer_note = format!("{} (twin)", payload.farmer_note);
        }
        payload
    }

    /// Start one insert transaction; its outcome arrives through callbacks
    fn insert(self: &Arc<Self>, slot: usize) {
        let started = self
            .db
            .transaction(&[FARM_STORE], TransactionMode::ReadWrite)
            .and_then(|txn| Ok((txn.object_store(FARM_STORE)?, txn)));
        let (store, txn) = match started {
            Ok(pair) => pair,
            Err(e) => return self.insert_done(slot, Err(e.to_string())),
        };

        let run = Arc::clone(self);
        store.add(self.payload(slot).to_record()).then(move |result, _| {
            run.inserts.lock().added[slot] = Some(result.map_err(|e| e.to_string()));
        });
        let run = Arc::clone(self);
        txn.finished().then(move |result, _| {
            run.insert_done(slot, result.map_err(|e| e.to_string()));
        });
        // Dropping the handles lets the transaction commit
    }

    /// Record a finished insert; the last one starts the read-back
    fn insert_done(self: &Arc<Self>, slot: usize, committed: Result<(), String>) {
        let outcomes = {
            let mut inserts = self.inserts.lock();
            let outcome = match (inserts.added[slot].take(), committed) {
                (Some(Err(e)), _) | (_, Err(e)) => Err(e),
                (Some(Ok(key)), Ok(())) => Ok(key),
                (None, Ok(())) => Err("committed without reporting a key".to_string()),
            };
            inserts.outcomes[slot] = Some(outcome);
            inserts.outstanding -= 1;
            if inserts.outstanding > 0 {
                return;
            }
            [inserts.outcomes[0].take(), inserts.outcomes[1].take()]
        };

        let name = self.scenario.name.as_str();
        let key = match outcomes[0].clone() {
            Some(Ok(key)) => key,
            Some(Err(e)) => return self.report(ScenarioReport::aborted(name, None, Vec::new(), format!("add failed: {}", e))),
            None => return self.report(ScenarioReport::aborted(name, None, Vec::new(), "add never finished".to_string())),
        };
        let twin_key = match outcomes[1].clone() {
            None => None,
            Some(Ok(key)) => Some(key),
            Some(Err(e)) => {
                return self.report(ScenarioReport::aborted(name, Some(key), Vec::new(), format!("twin add failed: {}", e)))
            }
        };
        self.read_back(key, twin_key);
    }

    /// Read every record in a new transaction once the inserts committed
    fn read_back(self: &Arc<Self>, key: Key, twin_key: Option<Key>) {
        let name = self.scenario.name.as_str();
        let started = self
            .db
            .transaction(&[FARM_STORE], TransactionMode::ReadOnly)
            .and_then(|txn| Ok((txn.object_store(FARM_STORE)?, txn)));
        let (store, _txn) = match started {
            Ok(pair) => pair,
            Err(e) => return self.report(ScenarioReport::aborted(name, Some(key), Vec::new(), format!("getAll failed: {}", e))),
        };

        let run = Arc::clone(self);
        store.get_all().then(move |result, scope| run.check_all(key, twin_key, result, scope));
    }

    fn check_all(
        self: Arc<Self>,
        key: Key,
        twin_key: Option<Key>,
        result: agridb_core::Result<Vec<(Key, Record)>>,
        scope: &TransactionScope,
    ) {
        let name = self.scenario.name.as_str();
        let entries = match result {
            Ok(entries) => entries,
            Err(e) => return self.report(ScenarioReport::aborted(name, Some(key), Vec::new(), format!("getAll failed: {}", e))),
        };

        let found = match entries.iter().find(|(id, _)| *id == key) {
            Some((id, record)) => match StoredFarmRecord::from_entry(*id, record) {
                Ok(found) => Some(found),
                Err(e) => {
                    return self.report(ScenarioReport::aborted(name, Some(key), Vec::new(), format!("decode failed: {}", e)))
                }
            },
            None => None,
        };
        let mut checks = vec![FieldCheck::new(
            "record_found",
            found.is_some(),
            format!("key {}", key),
            match found {
                Some(_) => format!("key {}", key),
                None => "<missing>".to_string(),
            },
        )];
        if let Some(found) = &found {
            checks.extend(compare(&self.scenario.payload, found));
        }

        let twin_key = match twin_key {
            Some(twin_key) => twin_key,
            None => return self.report(ScenarioReport::finished(name, key, checks)),
        };

        // Follow-up lookup in the same readonly transaction
        let first = self.scenario.payload.sensor_readings.first().copied().unwrap_or_default();
        let store = match scope.object_store(FARM_STORE) {
            Ok(store) => store,
            Err(e) => {
                return self.report(ScenarioReport::aborted(name, Some(key), checks, format!("index lookup failed: {}", e)))
            }
        };
        let run = Arc::clone(&self);
        store
            .index_lookup(SENSOR_READINGS, Value::number(first))
            .then(move |result, _| {
                let name = run.scenario.name.as_str();
                match result {
                    Ok(keys) => {
                        checks.push(FieldCheck::new(
                            "shared_reading_index",
                            keys.contains(&key) && keys.contains(&twin_key),
                            shown(&vec![key.min(twin_key), key.max(twin_key)]),
                            shown(&keys),
                        ));
                        run.report(ScenarioReport::finished(name, key, checks));
                    }
                    Err(e) => run.report(ScenarioReport::aborted(
                        name,
                        Some(key),
                        checks,
                        format!("index lookup failed: {}", e),
                    )),
                }
            });
    }

    fn report(&self, report: ScenarioReport) {
        if report.passed() {
            info!("{}: all checks passed", report.name);
        } else {
            if let Some(error) = &report.error {
                warn!("{}: {}", report.name, error);
            }
            for failure in report.failures() {
                warn!("{}: {}", report.name, failure);
            }
        }
        // The caller may have stopped listening
        let _ = self.reports.send(report);
    }
}

/// Insert the payload (and its twin, if any), then read back and compare.
///
/// Every step after the first is chained from the completion of the one
/// before it; only the final report is waited for here.
pub fn run_scenario(client: &FarmDataClient, scenario: &Scenario) -> ScenarioReport {
    debug!("Running {}", scenario.name);
    let (reports, receiver) = channel::bounded(1);

    let slots = if scenario.twin { 2 } else { 1 };
    let run = Arc::new(ScenarioRun {
        db: client.database().clone(),
        scenario: scenario.clone(),
        reports,
        inserts: Mutex::new(Inserts {
            added: [None, None],
            outcomes: [None, None],
            outstanding: slots,
        }),
    });
    for slot in 0..slots {
        run.insert(slot);
    }
    drop(run);

    receiver.recv().unwrap_or_else(|_| {
        ScenarioReport::aborted(
            &scenario.name,
            None,
            Vec::new(),
            "scenario dropped before reporting".to_string(),
        )
    })
}

/// Run every reference scenario in order
pub fn run_all(client: &FarmDataClient) -> Vec<ScenarioReport> {
    reference_scenarios()
        .iter()
        .map(|scenario| run_scenario(client, scenario))
        .collect()
}
