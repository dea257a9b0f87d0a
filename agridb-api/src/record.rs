/// Typed farm-data payload
///
/// Converts between the client's typed record and the attribute map the
/// core stores. The crop photo arrives already encoded (a data URL); it is
/// stored as opaque text.

use agridb_core::{codec, Error, Key, Record, RecordBuilder, Result, Value};
use serde::{Deserialize, Serialize};

pub const SENSOR_READINGS: &str = "sensorReadings";
pub const CROP_PHOTO: &str = "cropPhoto";
pub const FARMER_NOTE: &str = "farmerNote";
pub const GPS_COORDINATES: &str = "gpsCoordinates";
pub const TIMESTAMP: &str = "timestamp";

/// One field observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FarmRecord {
    pub sensor_readings: Vec<f64>,
    /// Pre-encoded photo; `None` is stored as an absent attribute
    pub crop_photo: Option<String>,
    pub farmer_note: String,
    #[serde(rename = "gpsCoordinates")]
    pub gps_coordinate: f64,
    /// Milliseconds since the Unix epoch, UTC
    pub timestamp: i64,
}

impl FarmRecord {
    pub fn new(
        sensor_readings: Vec<f64>,
        farmer_note: impl Into<String>,
        gps_coordinate: f64,
        timestamp: i64,
    ) -> Self {
        Self {
            sensor_readings,
            crop_photo: None,
            farmer_note: farmer_note.into(),
            gps_coordinate,
            timestamp,
        }
    }

    pub fn with_crop_photo(mut self, photo: impl Into<String>) -> Self {
        self.crop_photo = Some(photo.into());
        self
    }

    /// Parse comma-separated readings such as `"24.7, 56.3"`
    pub fn parse_sensor_readings(text: &str) -> Result<Vec<f64>> {
        text.split(',')
            .map(|part| {
                let part = part.trim();
                let reading: f64 = part.parse().map_err(|_| {
                    Error::InvalidArgument(format!("Invalid sensor reading {:?}", part))
                })?;
                if !reading.is_finite() {
                    return Err(Error::InvalidArgument(format!(
                        "Sensor reading must be finite, got {:?}",
                        part
                    )));
                }
                Ok(reading)
            })
            .collect()
    }

    /// Parse a timestamp; zone-less input such as `2024-09-05T10:30` is UTC
    pub fn parse_timestamp(text: &str) -> Result<i64> {
        codec::parse_timestamp(text)
    }

    /// Timestamp as `2024-09-05T10:30:00.000Z`
    pub fn timestamp_text(&self) -> Result<String> {
        codec::format_timestamp(self.timestamp)
    }

    pub fn to_record(&self) -> Record {
        RecordBuilder::new()
            .sequence(SENSOR_READINGS, self.sensor_readings.clone())
            .optional_text(CROP_PHOTO, self.crop_photo.clone())
            .text(FARMER_NOTE, self.farmer_note.clone())
            .number(GPS_COORDINATES, self.gps_coordinate)
            .timestamp(TIMESTAMP, self.timestamp)
            .build()
    }

    pub fn from_record(record: &Record) -> Result<Self> {
        Ok(Self {
            sensor_readings: field(record, SENSOR_READINGS, |v| v.as_sequence().map(<[f64]>::to_vec))?,
            crop_photo: match record.get(CROP_PHOTO) {
                None => None,
                Some(value) => Some(
                    value
                        .as_text()
                        .map(str::to_string)
                        .ok_or_else(|| mistyped(CROP_PHOTO, value))?,
                ),
            },
            farmer_note: field(record, FARMER_NOTE, |v| v.as_text().map(str::to_string))?,
            gps_coordinate: field(record, GPS_COORDINATES, Value::as_number)?,
            timestamp: field(record, TIMESTAMP, Value::as_timestamp)?,
        })
    }
}

fn field<T>(record: &Record, name: &str, extract: impl Fn(&Value) -> Option<T>) -> Result<T> {
    let value = record
        .get(name)
        .ok_or_else(|| Error::Corruption(format!("Stored farm record lacks '{}'", name)))?;
    extract(value).ok_or_else(|| mistyped(name, value))
}

fn mistyped(name: &str, value: &Value) -> Error {
    Error::Corruption(format!(
        "Stored farm record has '{}' of kind {}",
        name,
        value.kind()
    ))
}

/// A farm record with the key the store assigned
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredFarmRecord {
    pub id: Key,
    #[serde(flatten)]
    pub record: FarmRecord,
}

impl StoredFarmRecord {
    pub fn from_entry(id: Key, record: &Record) -> Result<Self> {
        Ok(Self {
            id,
            record: FarmRecord::from_record(record)?,
        })
    }
}
