pub mod link;
pub mod relay;
pub mod sensors;
pub mod watchdog;

pub use link::{HostLink, Link};
pub use relay::{RelaySource, SimulatedRelay, SysfsRelay};
pub use sensors::{SensorSource, SimulatedSensors};
pub use watchdog::{run_watchdog_feeder, DeviceWatchdog, LogWatchdog, Watchdog};
