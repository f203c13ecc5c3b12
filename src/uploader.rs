/// Periodic connectivity check and batch upload
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use crate::database::ReadingStore;
use crate::queue::DeliveryQueue;
use crate::utils::{format_datetime, sleep_or_cancel};

const FLUSH_FAILURE_PAUSE: Duration = Duration::from_secs(2);
const TICK_ERROR_PAUSE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Unreachable,
    Idle,
    Uploaded(usize),
    Requeued(usize),
    /// The connectivity check itself panicked
    Faulted,
}

/// One upload cycle: probe, then flush up to `batch_size` items.
///
/// The probe and the flush each run on their own task so a panic in the
/// store is contained. The batch stays owned here until the flush reports
/// success.
///
/// # Arguments
/// * `store` - Remote sink for readings
/// * `queue` - Delivery queue to drain from
/// * `batch_size` - Maximum number of items per flush
///
/// # Returns
/// What the cycle did; a failed or panicked flush puts the whole batch back
/// at the head of the queue and returns `Requeued`.
pub async fn tick<S>(store: &Arc<S>, queue: &DeliveryQueue, batch_size: usize) -> TickOutcome
where
    S: ReadingStore + 'static,
{
    info!("Connectivity check: testing reachability to database");
    let probe = {
        let store = Arc::clone(store);
        tokio::spawn(async move { store.probe_reachable().await })
    };
    let connected = match probe.await {
        Ok(connected) => connected,
        Err(e) => {
            error!("Connectivity check failed: {}", e);
            return TickOutcome::Faulted;
        }
    };
    info!(
        "Connectivity check result: {}",
        if connected { "connected" } else { "disconnected" }
    );
    if !connected {
        return TickOutcome::Unreachable;
    }

    let batch = queue.dequeue_batch(batch_size);
    if batch.is_empty() {
        debug!("Nothing to flush; queue_len={}", queue.len());
        return TickOutcome::Idle;
    }

    let flush = {
        let store = Arc::clone(store);
        let batch = batch.clone();
        tokio::spawn(async move { store.flush(&batch).await })
    };
    let count = batch.len();
    match flush.await {
        Ok(Ok(stored)) => {
            info!(
                "Uploaded {} measurement datapoint(s) at {}; queue_len={}",
                stored,
                format_datetime(&OffsetDateTime::now_utc()),
                queue.len()
            );
            TickOutcome::Uploaded(stored)
        }
        Ok(Err(e)) => {
            warn!("Flush failed ({}); requeueing {} item(s)", e, count);
            queue.requeue_front(batch);
            TickOutcome::Requeued(count)
        }
        Err(e) => {
            error!("Flush task failed ({}); requeueing {} item(s)", e, count);
            queue.requeue_front(batch);
            TickOutcome::Requeued(count)
        }
    }
}

/// Run the upload tick every `interval` until cancelled.
///
/// # Arguments
/// * `store` - Remote sink shared with the per-tick tasks
/// * `queue` - Delivery queue fed by the serial reader
/// * `batch_size` - Maximum number of items per flush
/// * `interval` - Pause between ticks; failed flushes wait longer
/// * `token` - Shutdown signal, observed between ticks
pub async fn run_uploader<S>(
    store: Arc<S>,
    queue: Arc<DeliveryQueue>,
    batch_size: usize,
    interval: Duration,
    token: CancellationToken,
) where
    S: ReadingStore + 'static,
{
    info!(
        "Uploader started: batch_size={} tick={:.1}s",
        batch_size,
        interval.as_secs_f64()
    );

    while !token.is_cancelled() {
        let pause = match tick(&store, &queue, batch_size).await {
            TickOutcome::Requeued(_) => FLUSH_FAILURE_PAUSE + interval,
            TickOutcome::Faulted => TICK_ERROR_PAUSE,
            _ => interval,
        };

        if !sleep_or_cancel(pause, &token).await {
            break;
        }
    }

    if queue.is_empty() {
        info!("Uploader stopped; queue drained");
    } else {
        warn!("Uploader stopped; {} item(s) left in queue will be lost", queue.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::operations::distinct_sensors;
    use crate::error::StoreError;
    use crate::models::{QueueItem, Reading, SensorIdentity};
    use crate::serial::reader::ingest_line;
    use crate::translate::TranslationDefaults;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// In-memory store with the same uniqueness rules as the schema.
    #[derive(Default)]
    struct MemoryStore {
        unreachable: AtomicBool,
        failing: AtomicBool,
        panicking_probe: AtomicBool,
        panicking_flush: AtomicBool,
        probes: AtomicUsize,
        flushes: AtomicUsize,
        sensor_upserts: Mutex<Vec<SensorIdentity>>,
        readings: Mutex<HashMap<(i64, OffsetDateTime), Reading>>,
        reading_inserts: AtomicUsize,
    }

    #[async_trait]
    impl ReadingStore for MemoryStore {
        async fn probe_reachable(&self) -> bool {
            self.probes.fetch_add(1, Ordering::SeqCst);
            if self.panicking_probe.load(Ordering::SeqCst) {
                panic!("driver bug");
            }
            !self.unreachable.load(Ordering::SeqCst)
        }

        async fn flush(&self, batch: &[QueueItem]) -> Result<usize, StoreError> {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            if self.panicking_flush.load(Ordering::SeqCst) {
                panic!("driver bug");
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(StoreError::Timeout(5));
            }

            let mut sensors = self.sensor_upserts.lock().unwrap();
            sensors.extend(distinct_sensors(batch).into_iter().cloned());
            let mut readings = self.readings.lock().unwrap();
            for item in batch {
                let key = (item.reading.sensor_id, item.reading.timestamp);
                if !readings.contains_key(&key) {
                    readings.insert(key, item.reading.clone());
                    self.reading_inserts.fetch_add(1, Ordering::SeqCst);
                }
            }
            Ok(batch.len())
        }
    }

    fn fill(queue: &DeliveryQueue, lines: &[&str]) {
        let defaults = TranslationDefaults::default();
        for line in lines {
            assert!(ingest_line(line, queue, &defaults));
            // Receipt timestamps must differ at database resolution
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[tokio::test]
    async fn three_lines_for_one_sensor_are_uploaded_in_one_tick() {
        let store = Arc::new(MemoryStore::default());
        let queue = DeliveryQueue::new();
        fill(
            &queue,
            &[
                r#"{"name":"bed-1","sequence":1,"battery_v":3.9}"#,
                r#"{"name":"bed-1","sequence":2,"battery_v":3.8}"#,
                r#"old | {"name":"bed-1","sequence":3}"#,
            ],
        );

        assert_eq!(tick(&store, &queue, 5000).await, TickOutcome::Uploaded(3));
        assert!(queue.is_empty());
        assert_eq!(store.sensor_upserts.lock().unwrap().len(), 1);
        assert_eq!(store.reading_inserts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn unreachable_store_leaves_queue_untouched() {
        let store = Arc::new(MemoryStore::default());
        store.unreachable.store(true, Ordering::SeqCst);
        let queue = DeliveryQueue::new();
        fill(&queue, &[r#"{"name":"a"}"#]);

        assert_eq!(tick(&store, &queue, 10).await, TickOutcome::Unreachable);
        assert_eq!(queue.len(), 1);
        assert_eq!(store.flushes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_queue_is_idle() {
        let store = Arc::new(MemoryStore::default());
        let queue = DeliveryQueue::new();
        assert_eq!(tick(&store, &queue, 10).await, TickOutcome::Idle);
        assert_eq!(store.flushes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_flush_restores_queue_order() {
        let store = Arc::new(MemoryStore::default());
        store.failing.store(true, Ordering::SeqCst);
        let queue = DeliveryQueue::new();
        fill(
            &queue,
            &[
                r#"{"name":"a","sequence":1}"#,
                r#"{"name":"b","sequence":2}"#,
                r#"{"name":"c","sequence":3}"#,
            ],
        );
        let before: Vec<QueueItem> = queue.dequeue_batch(10);
        for item in before.clone() {
            queue.enqueue(item);
        }

        assert_eq!(tick(&store, &queue, 2).await, TickOutcome::Requeued(2));
        assert_eq!(queue.dequeue_batch(10), before);
    }

    #[tokio::test]
    async fn panicking_flush_keeps_the_batch_in_order() {
        let store = Arc::new(MemoryStore::default());
        store.panicking_flush.store(true, Ordering::SeqCst);
        let queue = DeliveryQueue::new();
        fill(
            &queue,
            &[
                r#"{"name":"a","sequence":1}"#,
                r#"{"name":"b","sequence":2}"#,
                r#"{"name":"c","sequence":3}"#,
            ],
        );
        let before: Vec<QueueItem> = queue.dequeue_batch(10);
        for item in before.clone() {
            queue.enqueue(item);
        }

        assert_eq!(tick(&store, &queue, 2).await, TickOutcome::Requeued(2));
        assert_eq!(store.flushes.load(Ordering::SeqCst), 1);
        assert_eq!(queue.dequeue_batch(10), before);
    }

    #[tokio::test]
    async fn reflushing_the_same_item_stores_one_reading() {
        let store = Arc::new(MemoryStore::default());
        let queue = DeliveryQueue::new();
        fill(&queue, &[r#"{"name":"dup","temperature_c":4.5}"#]);
        let batch = queue.dequeue_batch(1);

        store.flush(&batch).await.unwrap();
        store.flush(&batch).await.unwrap();

        assert_eq!(store.readings.lock().unwrap().len(), 1);
        assert_eq!(store.reading_inserts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn loop_survives_a_panicking_tick_and_stops_on_cancel() {
        let store = Arc::new(MemoryStore::default());
        store.panicking_probe.store(true, Ordering::SeqCst);
        let queue = Arc::new(DeliveryQueue::new());
        fill(&queue, &[r#"{"name":"a"}"#]);
        let token = CancellationToken::new();

        let handle = tokio::spawn(run_uploader(
            Arc::clone(&store),
            Arc::clone(&queue),
            10,
            Duration::from_secs(90),
            token.clone(),
        ));

        // Panics pause 1 s between attempts rather than a full tick
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(store.probes.load(Ordering::SeqCst), 3);

        token.cancel();
        handle.await.unwrap();
        assert_eq!(queue.len(), 1);
    }
}
