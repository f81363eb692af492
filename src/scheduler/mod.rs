/// Relay-aligned sensor scheduler
///
/// Samples the aerator relay on a fixed tick, asks the duty-cycle bookkeeping
/// whether a read is due, and hands every captured reading to the registered
/// callbacks (normally: enqueue into the retry queue).
pub mod duty_cycle;

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::SensorError;
use crate::hardware::{RelaySource, SensorSource};
use crate::models::{AeratorStatus, Reading};
use crate::runtime::{RuntimeState, Shutdown};
use crate::utils::{format_datetime, scale_duration};

pub use duty_cycle::{DutyCycle, DutyCycleState, TickOutcome, READS_PER_PHASE};

pub type ReadingCallback = Box<dyn Fn(&Reading) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub device_id: String,
    pub on_duration: Duration,
    pub off_duration: Duration,
    pub tick: Duration,
    /// Wait between a trigger and the capture, for relay switching transients.
    pub settle_delay: Duration,
}

/// Cloneable handle for out-of-band capture requests.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<()>,
}

impl SchedulerHandle {
    #[cfg(test)]
    pub(crate) fn from_sender(tx: mpsc::Sender<()>) -> Self {
        SchedulerHandle { tx }
    }

    /// Requests an immediate reading. Returns false if one is already pending.
    pub fn read_now(&self) -> bool {
        self.tx.try_send(()).is_ok()
    }
}

pub struct Scheduler {
    config: SchedulerConfig,
    duty: DutyCycle,
    relay: Arc<dyn RelaySource>,
    sensors: Arc<dyn SensorSource>,
    runtime: RuntimeState,
    callbacks: Vec<ReadingCallback>,
    read_now_tx: mpsc::Sender<()>,
    read_now_rx: mpsc::Receiver<()>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        relay: Arc<dyn RelaySource>,
        sensors: Arc<dyn SensorSource>,
        runtime: RuntimeState,
    ) -> Self {
        let (read_now_tx, read_now_rx) = mpsc::channel(1);
        Scheduler {
            duty: DutyCycle::new(config.on_duration, config.off_duration),
            config,
            relay,
            sensors,
            runtime,
            callbacks: Vec::new(),
            read_now_tx,
            read_now_rx,
        }
    }

    pub fn on_reading(&mut self, callback: ReadingCallback) {
        self.callbacks.push(callback);
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            tx: self.read_now_tx.clone(),
        }
    }

    pub async fn run(mut self, mut shutdown: Shutdown) {
        info!(
            "Scheduler started: ON {} min / OFF {} min, {} reads per phase, tick {}s",
            self.config.on_duration.as_secs() / 60,
            self.config.off_duration.as_secs() / 60,
            READS_PER_PHASE,
            self.config.tick.as_secs()
        );

        let mut ticker = tokio::time::interval(self.config.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                Some(()) = self.read_now_rx.recv() => {
                    self.read_now().await;
                }
                _ = ticker.tick() => {
                    self.monitor_tick().await;
                }
            }
        }
        info!("Scheduler stopped");
    }

    async fn monitor_tick(&mut self) {
        let relay_state = match self.read_relay().await {
            Ok(state) => state,
            Err(e) => {
                warn!("Skipping scheduler tick: {}", e);
                return;
            }
        };

        let speed = self.runtime.speed_factor();
        match self.duty.tick(relay_state, Instant::now(), speed) {
            TickOutcome::Started { relay_state } | TickOutcome::PhaseChanged { relay_state } => {
                let phase = if relay_state { "ON" } else { "OFF" };
                let base = if relay_state {
                    self.config.on_duration
                } else {
                    self.config.off_duration
                };
                info!(
                    "Aerator phase {} started at {}, reads every {}s",
                    phase,
                    format_datetime(&time::OffsetDateTime::now_utc()),
                    scale_duration(base, speed).as_secs() / u64::from(READS_PER_PHASE)
                );
            }
            TickOutcome::Capture {
                relay_state,
                read_index,
            } => {
                debug!("Scheduled read {}/{} due", read_index, READS_PER_PHASE);
                if !self.config.settle_delay.is_zero() {
                    tokio::time::sleep(self.config.settle_delay).await;
                }
                self.capture(Some(relay_state)).await;
            }
            TickOutcome::Idle => {}
        }
    }

    /// Immediate capture outside the phase schedule; does not touch the read count.
    pub async fn read_now(&self) -> Option<Reading> {
        let relay_state = match self.read_relay().await {
            Ok(state) => Some(state),
            Err(e) => {
                warn!("On-demand read without relay state: {}", e);
                None
            }
        };
        self.capture(relay_state).await
    }

    async fn read_relay(&self) -> Result<bool, SensorError> {
        let relay = self.relay.clone();
        tokio::task::spawn_blocking(move || relay.read_state())
            .await
            .map_err(|e| SensorError::Relay(format!("task join error: {}", e)))?
    }

    async fn capture(&self, relay_state: Option<bool>) -> Option<Reading> {
        let sensors = self.sensors.clone();
        let values = tokio::task::spawn_blocking(move || sensors.capture())
            .await
            .map_err(|e| SensorError::Capture(format!("task join error: {}", e)))
            .and_then(|result| result);

        let values = match values {
            Ok(values) => values,
            Err(e) => {
                error!("Reading capture failed: {}", e);
                return None;
            }
        };

        let reading = Reading::new(
            &self.config.device_id,
            values,
            AeratorStatus::from(relay_state),
        );
        info!(
            "Captured reading {} (aerator {:?})",
            reading.timestamp, reading.aerator_status
        );
        for callback in &self.callbacks {
            callback(&reading);
        }
        Some(reading)
    }
}
