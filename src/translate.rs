/// Mapping of decoded packets into database-ready sensor and reading records
use crc::{Crc, CRC_32_ISO_HDLC};
use serde_json::{json, Value};
use time::OffsetDateTime;

use crate::models::{ParsedPacket, QueueItem, Reading, SensorIdentity};

const HARDWARE_ID_BASE: i64 = 1000;
const METADATA_SOURCE: &str = "radio";
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Process-wide fallbacks applied when a packet carries no position.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TranslationDefaults {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// Stable identity for a sensor name: `1000 + (crc32(name) & 0x7FFFFFFF)`.
///
/// Always positive and above the reserved range, so the same name maps to
/// the same row across restarts without a registry lookup.
pub fn stable_hardware_id(name: &str) -> i64 {
    let checksum = CRC32.checksum(name.as_bytes());
    HARDWARE_ID_BASE + i64::from(checksum & 0x7FFF_FFFF)
}

fn resolve_name(packet: &ParsedPacket) -> String {
    match packet.get("name") {
        Some(Value::String(name)) if !name.is_empty() => name.clone(),
        _ => match packet.get("sensor_id") {
            None | Some(Value::Null) => "tx-unknown".to_string(),
            Some(Value::String(id)) => format!("tx-{}", id),
            Some(other) => format!("tx-{}", other),
        },
    }
}

fn number(packet: &ParsedPacket, key: &str) -> Option<f64> {
    packet.get(key).and_then(Value::as_f64)
}

fn integer(packet: &ParsedPacket, key: &str) -> Option<i64> {
    let value = packet.get(key)?;
    value.as_i64().or_else(|| {
        value
            .as_f64()
            .filter(|f| f.fract() == 0.0 && f.is_finite())
            .map(|f| f as i64)
    })
}

/// Current UTC time truncated to the microsecond `timestamptz` stores, so
/// the queued reading has the same `(sensor_id, ts)` key as its row.
fn receipt_time() -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    now.replace_nanosecond(now.nanosecond() / 1_000 * 1_000)
        .unwrap_or(now)
}

/// Translate a packet, stamping the reading with the current UTC time.
pub fn translate(packet: &ParsedPacket, defaults: &TranslationDefaults) -> QueueItem {
    translate_at(packet, defaults, receipt_time())
}

/// Translate a packet with an explicit receipt time.
pub fn translate_at(
    packet: &ParsedPacket,
    defaults: &TranslationDefaults,
    received_at: OffsetDateTime,
) -> QueueItem {
    let name = resolve_name(packet);
    let hardware_id = stable_hardware_id(&name);

    // Packet position only counts when both coordinates are present
    let (latitude, longitude) = match (number(packet, "gps_lat"), number(packet, "gps_long")) {
        (Some(lat), Some(lon)) => (Some(lat), Some(lon)),
        _ => (defaults.latitude, defaults.longitude),
    };

    let sensor_type = match packet.get("sensor_type") {
        Some(Value::String(kind)) => Some(kind.clone()),
        _ => None,
    };

    let mut metadata = json!({ "source": METADATA_SOURCE });
    if let Some(net) = packet.get("net").filter(|v| !v.is_null()) {
        metadata["net"] = net.clone();
    }

    let sensor = SensorIdentity {
        hardware_id,
        name,
        sensor_type,
        latitude,
        longitude,
        metadata,
    };

    let reading = Reading {
        sensor_id: hardware_id,
        timestamp: received_at,
        sequence: integer(packet, "sequence"),
        temperature_c: number(packet, "temperature_c"),
        humidity_pct: number(packet, "humidity_pct"),
        capacitance: number(packet, "capacitance_val"),
        battery_v: number(packet, "battery_v"),
        signal_strength_dbm: number(packet, "rssi_dbm"),
    };

    QueueItem { sensor, reading }
}
