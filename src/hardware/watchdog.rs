/// Hardware watchdog feeding
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::time::{Instant, MissedTickBehavior};

use crate::runtime::Shutdown;

/// `feed_watchdog()`
pub trait Watchdog: Send + Sync {
    fn feed(&self) -> io::Result<()>;

    /// Stops the watchdog on a clean exit so the board is not reset.
    fn disarm(&self) -> io::Result<()> {
        Ok(())
    }
}

/// Linux watchdog character device (e.g. `/dev/watchdog`). Any write feeds
/// it; once opened, the device resets the board if feeding stops. Writing
/// the magic character `V` before closing disarms it.
pub struct DeviceWatchdog {
    file: Mutex<File>,
}

impl DeviceWatchdog {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new().write(true).open(path)?;
        Ok(DeviceWatchdog {
            file: Mutex::new(file),
        })
    }
}

impl DeviceWatchdog {
    fn write(&self, byte: &[u8]) -> io::Result<()> {
        let mut file = self
            .file
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "watchdog lock poisoned"))?;
        file.write_all(byte)?;
        file.flush()
    }
}

impl Watchdog for DeviceWatchdog {
    fn feed(&self) -> io::Result<()> {
        self.write(b"1")
    }

    fn disarm(&self) -> io::Result<()> {
        self.write(b"V")
    }
}

/// Stand-in used when no watchdog device is configured.
#[derive(Debug, Default)]
pub struct LogWatchdog;

impl Watchdog for LogWatchdog {
    fn feed(&self) -> io::Result<()> {
        debug!("Watchdog fed");
        Ok(())
    }
}

/// Feeds `watchdog` every `tick` for as long as `allow` says so.
///
/// Once `allow` returns false the feeder goes quiet and the device is left to
/// reset the board; feeding resumes if `allow` flips back first. On shutdown
/// the watchdog is disarmed, unless feeding had already stopped.
pub async fn run_watchdog_feeder<F>(
    watchdog: Arc<dyn Watchdog>,
    tick: Duration,
    mut allow: F,
    mut shutdown: Shutdown,
) where
    F: FnMut(Instant) -> bool,
{
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut feeding = true;

    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            _ = ticker.tick() => {}
        }

        let allowed = allow(Instant::now());
        if allowed != feeding {
            if allowed {
                info!("Resuming watchdog feeding");
            } else {
                warn!("Watchdog feeding stopped, board reset expected");
            }
            feeding = allowed;
        }
        if feeding {
            if let Err(e) = watchdog.feed() {
                warn!("Watchdog feed failed: {}", e);
            }
        }
    }

    if !feeding {
        warn!("Exiting with watchdog armed, board reset expected");
        return;
    }
    match watchdog.disarm() {
        Ok(()) => info!("Watchdog disarmed"),
        Err(e) => warn!("Watchdog disarm failed: {}", e),
    }
}
