/// Aerator relay state sources
use std::path::PathBuf;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::SensorError;
use crate::runtime::RuntimeState;
use crate::utils::scale_duration;

/// `get_relay_state()`: true while the aerator is energised. May block.
pub trait RelaySource: Send + Sync {
    fn read_state(&self) -> Result<bool, SensorError>;
}

/// Reads a sysfs GPIO `value` file (`/sys/class/gpio/gpioN/value`).
pub struct SysfsRelay {
    path: PathBuf,
}

impl SysfsRelay {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        SysfsRelay { path: path.into() }
    }
}

impl RelaySource for SysfsRelay {
    fn read_state(&self) -> Result<bool, SensorError> {
        let raw = std::fs::read_to_string(&self.path)
            .map_err(|e| SensorError::Relay(format!("{}: {}", self.path.display(), e)))?;
        match raw.trim() {
            "1" => Ok(true),
            "0" => Ok(false),
            other => Err(SensorError::Relay(format!(
                "unexpected gpio value {:?} in {}",
                other,
                self.path.display()
            ))),
        }
    }
}

/// Follows the configured ON/OFF cycle, compressed by the current speed factor.
/// Starts in the ON phase.
pub struct SimulatedRelay {
    started: Instant,
    on: Duration,
    off: Duration,
    runtime: RuntimeState,
}

impl SimulatedRelay {
    pub fn new(on: Duration, off: Duration, runtime: RuntimeState) -> Self {
        SimulatedRelay {
            started: Instant::now(),
            on,
            off,
            runtime,
        }
    }

    fn state_at(&self, now: Instant) -> bool {
        let speed = self.runtime.speed_factor();
        let on = scale_duration(self.on, speed).as_secs_f64();
        let off = scale_duration(self.off, speed).as_secs_f64();
        let period = on + off;
        if period <= 0.0 {
            return true;
        }
        let elapsed = now.saturating_duration_since(self.started).as_secs_f64();
        elapsed % period < on
    }
}

impl RelaySource for SimulatedRelay {
    fn read_state(&self) -> Result<bool, SensorError> {
        Ok(self.state_at(Instant::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_relay_alternates_phases() {
        let runtime = RuntimeState::new(60.0);
        let relay = SimulatedRelay::new(
            Duration::from_secs(3600),
            Duration::from_secs(1800),
            runtime,
        );
        let t0 = relay.started;
        // at 60x: ON for 60 s, OFF for 30 s
        assert!(relay.state_at(t0));
        assert!(relay.state_at(t0 + Duration::from_secs(59)));
        assert!(!relay.state_at(t0 + Duration::from_secs(61)));
        assert!(relay.state_at(t0 + Duration::from_secs(91)));
    }

    #[test]
    fn sysfs_relay_parses_gpio_values() {
        let dir = std::env::temp_dir().join(format!("relay-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("value");
        let relay = SysfsRelay::new(&path);

        std::fs::write(&path, "1\n").unwrap();
        assert!(relay.read_state().unwrap());
        std::fs::write(&path, "0\n").unwrap();
        assert!(!relay.read_state().unwrap());
        std::fs::write(&path, "x\n").unwrap();
        assert!(relay.read_state().is_err());

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
