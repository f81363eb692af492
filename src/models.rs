use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;
use tokio::time::Instant;

use crate::utils::timestamp_key;

/// Sensor name -> value. Values may be nested objects (pressure triples).
pub type SensorValues = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AeratorStatus {
    On,
    Off,
    Unknown,
}

impl From<Option<bool>> for AeratorStatus {
    fn from(relay: Option<bool>) -> Self {
        match relay {
            Some(true) => AeratorStatus::On,
            Some(false) => AeratorStatus::Off,
            None => AeratorStatus::Unknown,
        }
    }
}

/// Immutable snapshot produced by the scheduler. The timestamp doubles as the
/// queue key, so it is formatted to sort lexicographically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub timestamp: String,
    pub device_id: String,
    pub sensors: SensorValues,
    pub aerator_status: AeratorStatus,
}

impl Reading {
    pub fn new(device_id: &str, sensors: SensorValues, aerator_status: AeratorStatus) -> Self {
        Reading {
            timestamp: timestamp_key(&OffsetDateTime::now_utc()),
            device_id: device_id.to_string(),
            sensors,
            aerator_status,
        }
    }
}

/// Client connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    LinkConnecting,
    LinkUp,
    HandshakePending,
    Open,
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::LinkConnecting => "link-connecting",
            ConnectionState::LinkUp => "link-up",
            ConnectionState::HandshakePending => "handshake-pending",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// Server-side liveness bookkeeping for one accepted connection.
#[derive(Debug, Clone)]
pub struct HeartbeatRecord {
    pub client_id: u64,
    pub peer_address: SocketAddr,
    pub connected_at: OffsetDateTime,
    pub connect_time: Instant,
    pub last_pong_time: Instant,
}

impl HeartbeatRecord {
    pub fn new(client_id: u64, peer_address: SocketAddr, now: Instant) -> Self {
        HeartbeatRecord {
            client_id,
            peer_address,
            connected_at: OffsetDateTime::now_utc(),
            connect_time: now,
            last_pong_time: now,
        }
    }

    /// Records a liveness reply. Never moves `last_pong_time` backwards.
    pub fn touch(&mut self, now: Instant) {
        if now > self.last_pong_time {
            self.last_pong_time = now;
        }
    }
}

/// Administrative commands the gateway may push to a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Command {
    ReadNow,
    SetSpeed { factor: f64 },
    Reboot,
}

impl Command {
    pub fn parse(payload: &str) -> Option<Self> {
        serde_json::from_str(payload).ok()
    }
}

/// Result of handing a reading to a delivery collaborator. A failure is the
/// expected "still offline" case, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reading_serializes_status_uppercase() {
        let mut sensors = SensorValues::new();
        sensors.insert("ph".into(), json!(7.1));
        sensors.insert(
            "pressure".into(),
            json!({"p1": 101.2, "p2": 100.9, "p3": 101.0}),
        );
        let reading = Reading::new("node-a", sensors, AeratorStatus::On);
        let text = serde_json::to_string(&reading).unwrap();
        assert!(text.contains("\"aerator_status\":\"ON\""));

        let back: Reading = serde_json::from_str(&text).unwrap();
        assert_eq!(back, reading);
    }

    #[test]
    fn commands_parse_from_json() {
        assert_eq!(Command::parse(r#"{"cmd":"read_now"}"#), Some(Command::ReadNow));
        assert_eq!(
            Command::parse(r#"{"cmd":"set_speed","factor":12.0}"#),
            Some(Command::SetSpeed { factor: 12.0 })
        );
        assert_eq!(Command::parse(r#"{"cmd":"reboot"}"#), Some(Command::Reboot));
        assert_eq!(Command::parse("hello"), None);
    }

    #[test]
    fn heartbeat_touch_is_monotonic() {
        let start = Instant::now();
        let mut record = HeartbeatRecord::new(1, "127.0.0.1:9000".parse().unwrap(), start);
        let later = start + std::time::Duration::from_secs(5);
        record.touch(later);
        record.touch(start);
        assert_eq!(record.last_pong_time, later);
    }
}
