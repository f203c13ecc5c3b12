use serde_json::{Map, Value};
use time::OffsetDateTime;

/// One decoded serial line; always a JSON object at top level.
pub type ParsedPacket = Map<String, Value>;

#[derive(Debug, Clone, PartialEq)]
pub struct SensorIdentity {
    pub hardware_id: i64,
    pub name: String,
    pub sensor_type: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub metadata: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub sensor_id: i64,
    pub timestamp: OffsetDateTime,
    pub sequence: Option<i64>,
    pub temperature_c: Option<f64>,
    pub humidity_pct: Option<f64>,
    pub capacitance: Option<f64>,
    pub battery_v: Option<f64>,
    pub signal_strength_dbm: Option<f64>,
}

/// A translated packet awaiting upload. Owned by exactly one of the queue
/// or the uploader at any time.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueItem {
    pub sensor: SensorIdentity,
    pub reading: Reading,
}
