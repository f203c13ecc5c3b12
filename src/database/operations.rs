/// Database operations for storing sensors and readings
use std::collections::HashMap;
use tokio_postgres::{Client, Transaction};

use crate::models::{QueueItem, SensorIdentity};

const UPSERT_SENSOR: &str = "INSERT INTO sensor (hardware_id, name, sensor_type, gps_latitude, gps_longitude, metadata)
     VALUES ($1::int8, $2::text, $3::text, $4::float8, $5::float8, $6::jsonb)
     ON CONFLICT (hardware_id) DO UPDATE SET
       name = EXCLUDED.name, sensor_type = EXCLUDED.sensor_type,
       gps_latitude = EXCLUDED.gps_latitude, gps_longitude = EXCLUDED.gps_longitude,
       metadata = EXCLUDED.metadata";

const INSERT_READING: &str = "INSERT INTO reading (sensor_id, ts, sequence, temperature_c, humidity_pct, capacitance_val, battery_v, rssi_dbm)
     VALUES ($1::int8, $2::timestamptz, $3::int8, $4::float8, $5::float8, $6::float8, $7::float8, $8::float8)
     ON CONFLICT (sensor_id, ts) DO NOTHING";

/// Distinct sensors of a batch keyed by hardware id.
///
/// Order follows first appearance; the values are those of the last
/// occurrence, since later packets carry the freshest name/position.
pub fn distinct_sensors(batch: &[QueueItem]) -> Vec<&SensorIdentity> {
    let mut order = Vec::new();
    let mut latest: HashMap<i64, &SensorIdentity> = HashMap::new();
    for item in batch {
        let id = item.sensor.hardware_id;
        if latest.insert(id, &item.sensor).is_none() {
            order.push(id);
        }
    }
    order.into_iter().filter_map(|id| latest.get(&id).copied()).collect()
}

/// Upsert every distinct sensor in the batch
///
/// # Arguments
/// * `tx` - Open transaction the upserts run in
/// * `batch` - Items whose sensors should exist before their readings
///
/// # Returns
/// Number of distinct sensors written
pub async fn ensure_sensors(
    tx: &Transaction<'_>,
    batch: &[QueueItem],
) -> Result<usize, tokio_postgres::Error> {
    let statement = tx.prepare(UPSERT_SENSOR).await?;
    let sensors = distinct_sensors(batch);
    for sensor in &sensors {
        tx.execute(
            &statement,
            &[
                &sensor.hardware_id,
                &sensor.name,
                &sensor.sensor_type,
                &sensor.latitude,
                &sensor.longitude,
                &sensor.metadata,
            ],
        )
        .await?;
    }
    Ok(sensors.len())
}

/// Insert readings, skipping any `(sensor_id, ts)` already stored.
///
/// Returns the number of rows actually inserted.
pub async fn insert_readings(
    tx: &Transaction<'_>,
    batch: &[QueueItem],
) -> Result<u64, tokio_postgres::Error> {
    let statement = tx.prepare(INSERT_READING).await?;
    let mut inserted = 0;
    for item in batch {
        let reading = &item.reading;
        inserted += tx
            .execute(
                &statement,
                &[
                    &reading.sensor_id,
                    &reading.timestamp,
                    &reading.sequence,
                    &reading.temperature_c,
                    &reading.humidity_pct,
                    &reading.capacitance,
                    &reading.battery_v,
                    &reading.signal_strength_dbm,
                ],
            )
            .await?;
    }
    Ok(inserted)
}

/// Store a batch atomically: sensors first, then readings, one commit.
///
/// The transaction rolls back on drop if any step fails.
///
/// # Arguments
/// * `client` - Connected client; the transaction borrows it mutably
/// * `batch` - Items to store, in queue order
///
/// # Returns
/// Sensor, insert and duplicate counts for logging
pub async fn flush_batch(
    client: &mut Client,
    batch: &[QueueItem],
) -> Result<FlushStats, tokio_postgres::Error> {
    let tx = client.transaction().await?;
    tx.batch_execute("SET LOCAL TIME ZONE 'UTC'").await?;
    let sensors = ensure_sensors(&tx, batch).await?;
    let inserted = insert_readings(&tx, batch).await?;
    tx.commit().await?;

    Ok(FlushStats {
        sensors,
        inserted,
        duplicates: batch.len() as u64 - inserted,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushStats {
    pub sensors: usize,
    pub inserted: u64,
    pub duplicates: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::{translate_at, TranslationDefaults};
    use serde_json::json;
    use time::OffsetDateTime;

    fn item(packet: serde_json::Value) -> QueueItem {
        let packet = packet.as_object().cloned().unwrap_or_default();
        translate_at(&packet, &TranslationDefaults::default(), OffsetDateTime::UNIX_EPOCH)
    }

    #[test]
    fn last_write_wins_per_sensor() {
        let batch = vec![
            item(json!({"name": "a", "gps_lat": 1.0, "gps_long": 1.0})),
            item(json!({"name": "b"})),
            item(json!({"name": "a", "gps_lat": 2.0, "gps_long": 2.0, "sensor_type": "soil"})),
        ];

        let sensors = distinct_sensors(&batch);
        let names: Vec<&str> = sensors.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(sensors[0].latitude, Some(2.0));
        assert_eq!(sensors[0].sensor_type.as_deref(), Some("soil"));
    }

    #[test]
    fn empty_batch_has_no_sensors() {
        assert!(distinct_sensors(&[]).is_empty());
    }
}
