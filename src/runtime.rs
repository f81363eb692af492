/// Process-wide runtime state and the cooperative shutdown signal
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use log::{info, warn};
use tokio::sync::watch;

use crate::utils::{speed_factor_in_range, MAX_SPEED_FACTOR, MIN_SPEED_FACTOR};

#[derive(Debug)]
struct Inner {
    speed_factor: AtomicU64,
    reboot_requested: AtomicBool,
}

/// Shared handle to the speed factor and the reboot-request flag.
///
/// Cloning is cheap; all clones observe the same values. Readers may see a
/// value that is stale by at most one of their own ticks.
#[derive(Debug, Clone)]
pub struct RuntimeState {
    inner: Arc<Inner>,
}

impl RuntimeState {
    pub fn new(speed_factor: f64) -> Self {
        let state = RuntimeState {
            inner: Arc::new(Inner {
                speed_factor: AtomicU64::new(1.0f64.to_bits()),
                reboot_requested: AtomicBool::new(false),
            }),
        };
        state.set_speed_factor(speed_factor);
        state
    }

    pub fn speed_factor(&self) -> f64 {
        f64::from_bits(self.inner.speed_factor.load(Ordering::Acquire))
    }

    /// Returns false (and keeps the old value) for factors outside
    /// `MIN_SPEED_FACTOR..=MAX_SPEED_FACTOR`.
    pub fn set_speed_factor(&self, factor: f64) -> bool {
        if !speed_factor_in_range(factor) {
            warn!(
                "Ignoring speed factor {} (accepted {}..={})",
                factor, MIN_SPEED_FACTOR, MAX_SPEED_FACTOR
            );
            return false;
        }
        let previous = self
            .inner
            .speed_factor
            .swap(factor.to_bits(), Ordering::AcqRel);
        if f64::from_bits(previous) != factor {
            info!("Speed factor set to {}", factor);
        }
        true
    }

    pub fn reboot_requested(&self) -> bool {
        self.inner.reboot_requested.load(Ordering::Acquire)
    }

    pub fn request_reboot(&self) {
        if !self.inner.reboot_requested.swap(true, Ordering::AcqRel) {
            warn!("Reboot requested");
        }
    }

    pub fn clear_reboot_request(&self) {
        if self.inner.reboot_requested.swap(false, Ordering::AcqRel) {
            info!("Reboot request cleared");
        }
    }
}

/// Sender half of the shutdown signal. Dropping it also counts as shutdown.
#[derive(Debug)]
pub struct ShutdownTrigger(watch::Sender<bool>);

impl ShutdownTrigger {
    pub fn trigger(&self) {
        let _ = self.0.send(true);
    }
}

/// Cancellation token checked by every loop at its suspension points.
#[derive(Debug, Clone)]
pub struct Shutdown(watch::Receiver<bool>);

impl Shutdown {
    pub fn channel() -> (ShutdownTrigger, Shutdown) {
        let (tx, rx) = watch::channel(false);
        (ShutdownTrigger(tx), Shutdown(rx))
    }

    /// Resolves once shutdown has been triggered.
    pub async fn wait(&mut self) {
        // An error means the trigger was dropped, which is treated as shutdown.
        let _ = self.0.wait_for(|stop| *stop).await;
    }
}
