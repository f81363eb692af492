/// Durable retry queue bridging the scheduler and the delivery path
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use log::{debug, error, info, warn};
use tokio::sync::{Mutex, Notify};

use crate::error::StorageError;
use crate::models::{DeliveryOutcome, Reading};
use crate::queue::storage::Storage;
use crate::runtime::Shutdown;

/// `deliver(reading) -> success | failure`
pub trait Deliver: Send + Sync {
    fn deliver<'a>(&'a self, reading: &'a Reading) -> BoxFuture<'a, DeliveryOutcome>;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: usize,
    pub quarantined: usize,
    /// True when a delivery failure stopped the pass early.
    pub halted: bool,
}

/// FIFO of undelivered readings, oldest timestamp first.
///
/// Enqueues are serialised by `write_lock`; at most one drain pass runs at a
/// time. An enqueue during a drain only adds a newer key, which the running
/// pass may or may not pick up. Storage calls run on the blocking pool.
pub struct RetryQueue {
    storage: Arc<dyn Storage>,
    write_lock: Mutex<()>,
    drain_lock: Mutex<()>,
}

impl RetryQueue {
    pub fn new(storage: Box<dyn Storage>) -> Self {
        RetryQueue {
            storage: Arc::from(storage),
            write_lock: Mutex::new(()),
            drain_lock: Mutex::new(()),
        }
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Storage) -> Result<T, StorageError> + Send + 'static,
    {
        let storage = self.storage.clone();
        tokio::task::spawn_blocking(move || op(storage.as_ref()))
            .await
            .map_err(|e| StorageError::Task(e.to_string()))?
    }

    /// Durably stores a reading and returns its key. Storage failures are
    /// returned as-is; there is no in-place retry.
    pub async fn enqueue(&self, reading: &Reading) -> Result<String, StorageError> {
        let data = serde_json::to_vec(reading).map_err(|source| StorageError::Serialize {
            key: reading.timestamp.clone(),
            source,
        })?;

        let _guard = self.write_lock.lock().await;
        let timestamp = reading.timestamp.clone();
        let key = self
            .blocking(move |storage| {
                let mut key = timestamp.clone();
                let mut suffix = 1;
                while storage.contains(&key)? {
                    key = format!("{}-{:03}", timestamp, suffix);
                    suffix += 1;
                }
                storage.put(&key, &data)?;
                Ok(key)
            })
            .await?;
        debug!("Queued reading {}", key);
        Ok(key)
    }

    pub async fn len(&self) -> Result<usize, StorageError> {
        self.blocking(|storage| Ok(storage.keys()?.len())).await
    }

    /// One drain pass over at most `max_batch` entries, oldest first.
    ///
    /// A delivered entry is deleted. The first failed delivery ends the pass
    /// and leaves that entry and everything after it untouched.
    pub async fn drain(
        &self,
        deliver: &dyn Deliver,
        max_batch: usize,
    ) -> Result<DrainReport, StorageError> {
        let _pass = self.drain_lock.lock().await;
        let mut keys = self.blocking(|storage| storage.keys()).await?;
        keys.sort();

        let mut report = DrainReport::default();
        for key in keys.into_iter().take(max_batch) {
            let lookup = key.clone();
            let Some(data) = self.blocking(move |storage| storage.get(&lookup)).await? else {
                continue;
            };
            let reading: Reading = match serde_json::from_slice(&data) {
                Ok(reading) => reading,
                Err(e) => {
                    warn!("Queue entry {} is unreadable: {}", key, e);
                    let bad = key.clone();
                    self.blocking(move |storage| storage.quarantine(&bad)).await?;
                    report.quarantined += 1;
                    continue;
                }
            };

            match deliver.deliver(&reading).await {
                DeliveryOutcome::Delivered => {
                    let done = key.clone();
                    self.blocking(move |storage| storage.remove(&done)).await?;
                    report.delivered += 1;
                }
                DeliveryOutcome::Failed => {
                    debug!("Delivery of {} failed, keeping backlog", key);
                    report.halted = true;
                    break;
                }
            }
        }
        Ok(report)
    }
}

/// Drains on every `trigger` notification and on a periodic fallback tick.
pub async fn run_drain_loop(
    queue: Arc<RetryQueue>,
    deliver: Arc<dyn Deliver>,
    trigger: Arc<Notify>,
    interval: Duration,
    max_batch: usize,
    mut shutdown: Shutdown,
) {
    info!(
        "Drain loop started (batch {}, fallback every {}s)",
        max_batch,
        interval.as_secs()
    );
    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            _ = trigger.notified() => {}
            _ = tokio::time::sleep(interval) => {}
        }

        match queue.drain(deliver.as_ref(), max_batch).await {
            Ok(report) if report.delivered > 0 || report.quarantined > 0 => {
                info!(
                    "Drain pass delivered {} reading(s){}",
                    report.delivered,
                    if report.halted { ", halted on failure" } else { "" }
                );
            }
            Ok(_) => {}
            Err(e) => error!("Drain pass aborted: {}", e),
        }
    }
    info!("Drain loop stopped");
}
