use async_trait::async_trait;
use log::{debug, info};
use tokio::time::{timeout, Duration};

use crate::database::connection::{connect, prepare_target, ConnectTarget};
use crate::database::operations::flush_batch;
use crate::error::StoreError;
use crate::models::QueueItem;

/// Remote sink for queued readings.
#[async_trait]
pub trait ReadingStore: Send + Sync {
    /// Minimal round trip within the configured timeout. Never fails;
    /// any error means unreachable.
    async fn probe_reachable(&self) -> bool;

    /// Persist a non-empty batch in one transaction. On error nothing from
    /// the batch is stored. Returns the number of items handled.
    async fn flush(&self, batch: &[QueueItem]) -> Result<usize, StoreError>;
}

pub struct PostgresStore {
    target: ConnectTarget,
    connect_timeout: Duration,
}

impl PostgresStore {
    /// Prepare a store without connecting.
    ///
    /// # Arguments
    /// * `database_url` - PostgreSQL URL, optionally with `sslrootcert`
    /// * `connect_timeout` - Bound on each reachability check
    ///
    /// # Returns
    /// The store, or an error if the URL cannot be parsed
    pub fn new(database_url: &str, connect_timeout: Duration) -> Result<Self, StoreError> {
        Ok(Self {
            target: prepare_target(database_url, connect_timeout)?,
            connect_timeout,
        })
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let client = connect(&self.target).await?;
        client.simple_query("SELECT 1").await?;
        Ok(())
    }
}

#[async_trait]
impl ReadingStore for PostgresStore {
    async fn probe_reachable(&self) -> bool {
        match timeout(self.connect_timeout, self.ping()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!("DB not reachable: {}", e);
                false
            }
            Err(_) => {
                debug!("DB not reachable: {}", StoreError::Timeout(self.connect_timeout.as_secs()));
                false
            }
        }
    }

    async fn flush(&self, batch: &[QueueItem]) -> Result<usize, StoreError> {
        if batch.is_empty() {
            return Ok(0);
        }

        let mut client = connect(&self.target).await?;
        let stats = flush_batch(&mut client, batch).await?;
        info!(
            "Stored {} reading(s) for {} sensor(s); {} duplicate(s) skipped",
            stats.inserted, stats.sensors, stats.duplicates
        );
        Ok(batch.len())
    }
}
