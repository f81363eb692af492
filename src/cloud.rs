/// Gateway upstream: readings received from nodes are queued durably and
/// drained towards a cloud sink.
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use log::{debug, error, info, warn};
use reqwest::Client;
use tokio::sync::{mpsc, Notify};

use crate::models::{DeliveryOutcome, Reading};
use crate::queue::{Deliver, RetryQueue};
use crate::runtime::Shutdown;

/// POSTs each reading as JSON; any 2xx counts as delivered.
pub struct HttpCloudSink {
    client: Client,
    url: String,
}

impl HttpCloudSink {
    pub fn new(url: &str, request_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(HttpCloudSink {
            client,
            url: url.to_string(),
        })
    }
}

impl Deliver for HttpCloudSink {
    fn deliver<'a>(&'a self, reading: &'a Reading) -> BoxFuture<'a, DeliveryOutcome> {
        Box::pin(async move {
            let response = match self.client.post(&self.url).json(reading).send().await {
                Ok(response) => response,
                Err(e) => {
                    debug!("Cloud upload of {} failed: {}", reading.timestamp, e);
                    return DeliveryOutcome::Failed;
                }
            };
            if response.status().is_success() {
                DeliveryOutcome::Delivered
            } else {
                warn!(
                    "Cloud rejected reading {} with status {}",
                    reading.timestamp,
                    response.status()
                );
                DeliveryOutcome::Failed
            }
        })
    }
}

/// Used when no cloud endpoint is configured: logs and acknowledges.
#[derive(Debug, Default)]
pub struct LogCloudSink;

impl Deliver for LogCloudSink {
    fn deliver<'a>(&'a self, reading: &'a Reading) -> BoxFuture<'a, DeliveryOutcome> {
        Box::pin(async move {
            info!(
                "Reading {} from {}: {} sensor value(s), aerator {:?}",
                reading.timestamp,
                reading.device_id,
                reading.sensors.len(),
                reading.aerator_status
            );
            DeliveryOutcome::Delivered
        })
    }
}

/// Moves readings from node connections into the gateway's retry queue and
/// nudges its drain loop.
pub async fn run_forwarder(
    mut inbound: mpsc::Receiver<Reading>,
    queue: Arc<RetryQueue>,
    drain_trigger: Arc<Notify>,
    mut shutdown: Shutdown,
) {
    loop {
        let reading = tokio::select! {
            _ = shutdown.wait() => break,
            reading = inbound.recv() => match reading {
                Some(reading) => reading,
                None => break,
            },
        };
        match queue.enqueue(&reading).await {
            Ok(key) => {
                debug!("Queued {} from {} for upload", key, reading.device_id);
                drain_trigger.notify_one();
            }
            Err(e) => error!("Dropping reading from {}: {}", reading.device_id, e),
        }
    }
    info!("Forwarder stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AeratorStatus;
    use crate::queue::storage::memory::MemoryStorage;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// One-shot HTTP server answering every request with `status_line`.
    async fn http_stub(status_line: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = vec![0u8; 8192];
                let _ = stream.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                    status_line
                );
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });
        format!("http://{}/readings", addr)
    }

    fn reading() -> Reading {
        Reading::new("node-a", Default::default(), AeratorStatus::On)
    }

    #[tokio::test]
    async fn http_sink_maps_status_codes() {
        let ok = HttpCloudSink::new(&http_stub("200 OK").await, Duration::from_secs(5)).unwrap();
        assert_eq!(ok.deliver(&reading()).await, DeliveryOutcome::Delivered);

        let down = HttpCloudSink::new(
            &http_stub("503 Service Unavailable").await,
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(down.deliver(&reading()).await, DeliveryOutcome::Failed);
    }

    #[tokio::test]
    async fn http_sink_fails_when_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let url = format!("http://{}/", addr);
        let sink = HttpCloudSink::new(&url, Duration::from_secs(2)).unwrap();
        assert_eq!(sink.deliver(&reading()).await, DeliveryOutcome::Failed);
    }

    #[tokio::test]
    async fn forwarder_queues_and_triggers_drain() {
        let queue = Arc::new(RetryQueue::new(Box::new(MemoryStorage::default())));
        let trigger = Arc::new(Notify::new());
        let (tx, rx) = mpsc::channel(4);
        let (_stop, shutdown) = Shutdown::channel();
        let task = tokio::spawn(run_forwarder(rx, queue.clone(), trigger.clone(), shutdown));

        tx.send(reading()).await.unwrap();
        trigger.notified().await;
        assert_eq!(queue.len().await.unwrap(), 1);

        drop(tx);
        task.await.unwrap();
    }
}
