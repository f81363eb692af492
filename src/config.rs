use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use url::Url;

use crate::error::ConfigError;
use crate::utils::{speed_factor_in_range, MAX_SPEED_FACTOR, MIN_SPEED_FACTOR};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sensor node: scheduler, retry queue and the client transport.
    Node,
    /// Gateway: accepts node connections and forwards readings upstream.
    Gateway,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Node => f.write_str("node"),
            Role::Gateway => f.write_str("gateway"),
        }
    }
}

/// Where the node connects to, split out of `GATEWAY_URL`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayAddress {
    pub host: String,
    pub port: u16,
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub role: Role,
    pub device_id: String,
    pub gateway: GatewayAddress,
    pub listen_addr: String,
    pub queue_dir: PathBuf,
    pub speed_factor: f64,
    pub aerator_on: Duration,
    pub aerator_off: Duration,
    pub monitor_tick: Duration,
    pub relay_settle: Duration,
    pub relay_gpio_path: Option<PathBuf>,
    pub watchdog_device: Option<PathBuf>,
    pub cloud_url: Option<String>,
    pub ping_interval: Duration,
    pub drain_batch: usize,
    pub drain_interval: Duration,
    pub strict_handshake: bool,
}

impl NodeConfig {
    pub fn new() -> Result<Self, ConfigError> {
        // Load environment variables
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key lookup; unset keys take defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let role = match get("NODE_ROLE").as_deref() {
            None | Some("node") => Role::Node,
            Some("gateway") => Role::Gateway,
            Some(other) => {
                return Err(ConfigError::invalid(
                    "NODE_ROLE",
                    other,
                    "expected node or gateway",
                ))
            }
        };

        let gateway_url = get("GATEWAY_URL").unwrap_or_else(|| "ws://192.168.4.1:8765/ws".into());
        let gateway = parse_gateway_url(&gateway_url)?;

        let speed_factor: f64 = parse_or(&get, "SPEED_FACTOR", 1.0)?;
        if !speed_factor_in_range(speed_factor) {
            return Err(ConfigError::invalid(
                "SPEED_FACTOR",
                speed_factor.to_string(),
                format!("must be between {} and {}", MIN_SPEED_FACTOR, MAX_SPEED_FACTOR),
            ));
        }

        let aerator_on = minutes(&get, "AERATOR_ON_MINUTES", 120)?;
        let aerator_off = minutes(&get, "AERATOR_OFF_MINUTES", 120)?;
        let monitor_tick = positive_secs(&get, "MONITOR_TICK_SECS", 10)?;
        let ping_interval = positive_secs(&get, "PING_INTERVAL_SECS", 20)?;
        let drain_interval = positive_secs(&get, "DRAIN_INTERVAL_SECS", 60)?;

        let drain_batch: usize = parse_or(&get, "DRAIN_BATCH", 5)?;
        if drain_batch == 0 {
            return Err(ConfigError::invalid("DRAIN_BATCH", "0", "must be at least 1"));
        }

        let strict_handshake = match get("STRICT_HANDSHAKE").map(|v| v.to_ascii_lowercase()) {
            None => false,
            Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => true,
            Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => false,
            Some(v) => {
                return Err(ConfigError::invalid(
                    "STRICT_HANDSHAKE",
                    v,
                    "expected true or false",
                ))
            }
        };

        Ok(NodeConfig {
            role,
            device_id: get("DEVICE_ID").unwrap_or_else(|| "bioreactor-01".into()),
            gateway,
            listen_addr: get("LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0:8765".into()),
            queue_dir: get("QUEUE_DIR").unwrap_or_else(|| "./queue".into()).into(),
            speed_factor,
            aerator_on,
            aerator_off,
            monitor_tick,
            relay_settle: Duration::from_secs(parse_or(&get, "RELAY_SETTLE_SECS", 2)?),
            relay_gpio_path: get("RELAY_GPIO_PATH").map(PathBuf::from),
            watchdog_device: get("WATCHDOG_DEVICE").map(PathBuf::from),
            cloud_url: get("CLOUD_URL"),
            ping_interval,
            drain_batch,
            drain_interval,
            strict_handshake,
        })
    }
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(value) => value
            .parse()
            .map_err(|e: T::Err| ConfigError::invalid(key, value, e)),
        None => Ok(default),
    }
}

fn minutes<G>(get: &G, key: &'static str, default: u64) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    positive_secs(get, key, default).map(|d| d * 60)
}

fn positive_secs<G>(get: &G, key: &'static str, default: u64) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let value: u64 = parse_or(get, key, default)?;
    if value == 0 {
        return Err(ConfigError::invalid(key, "0", "must be greater than zero"));
    }
    Ok(Duration::from_secs(value))
}

pub fn parse_gateway_url(raw: &str) -> Result<GatewayAddress, ConfigError> {
    let url = Url::parse(raw).map_err(|e| ConfigError::invalid("GATEWAY_URL", raw, e))?;
    if url.scheme() != "ws" {
        return Err(ConfigError::invalid(
            "GATEWAY_URL",
            raw,
            "only ws:// is supported",
        ));
    }
    let host = url
        .host_str()
        .ok_or_else(|| ConfigError::invalid("GATEWAY_URL", raw, "missing host"))?;
    let port = url.port_or_known_default().unwrap_or(80);
    let mut path = url.path().to_string();
    if path.is_empty() {
        path.push('/');
    }
    if let Some(query) = url.query() {
        path.push('?');
        path.push_str(query);
    }
    Ok(GatewayAddress {
        host: host.to_string(),
        port,
        path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Result<NodeConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        NodeConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = config(&[]).unwrap();
        assert_eq!(config.role, Role::Node);
        assert_eq!(config.device_id, "bioreactor-01");
        assert_eq!(
            config.gateway,
            GatewayAddress {
                host: "192.168.4.1".into(),
                port: 8765,
                path: "/ws".into()
            }
        );
        assert_eq!(config.aerator_on, Duration::from_secs(120 * 60));
        assert_eq!(config.monitor_tick, Duration::from_secs(10));
        assert_eq!(config.relay_settle, Duration::from_secs(2));
        assert_eq!(config.ping_interval, Duration::from_secs(20));
        assert_eq!(config.drain_batch, 5);
        assert_eq!(config.speed_factor, 1.0);
        assert!(!config.strict_handshake);
        assert!(config.cloud_url.is_none());
    }

    #[test]
    fn overrides_are_parsed() {
        let config = config(&[
            ("NODE_ROLE", "gateway"),
            ("SPEED_FACTOR", "12"),
            ("AERATOR_OFF_MINUTES", "30"),
            ("STRICT_HANDSHAKE", "TRUE"),
            ("CLOUD_URL", "https://ingest.example.com/readings"),
            ("RELAY_SETTLE_SECS", "0"),
        ])
        .unwrap();
        assert_eq!(config.role, Role::Gateway);
        assert_eq!(config.speed_factor, 12.0);
        assert_eq!(config.aerator_off, Duration::from_secs(30 * 60));
        assert!(config.strict_handshake);
        assert_eq!(config.relay_settle, Duration::ZERO);
        assert_eq!(
            config.cloud_url.as_deref(),
            Some("https://ingest.example.com/readings")
        );
    }

    #[test]
    fn invalid_values_are_rejected() {
        for pairs in [
            [("NODE_ROLE", "relay")],
            [("SPEED_FACTOR", "0")],
            [("SPEED_FACTOR", "fast")],
            [("SPEED_FACTOR", "1e-300")],
            [("DRAIN_BATCH", "0")],
            [("MONITOR_TICK_SECS", "-1")],
            [("STRICT_HANDSHAKE", "maybe")],
            [("GATEWAY_URL", "http://10.0.0.1/ws")],
        ] {
            assert!(config(&pairs).is_err(), "{:?} should be rejected", pairs);
        }
    }

    #[test]
    fn gateway_url_defaults_port_and_path() {
        let addr = parse_gateway_url("ws://gateway.local").unwrap();
        assert_eq!(addr.port, 80);
        assert_eq!(addr.path, "/");

        let addr = parse_gateway_url("ws://10.0.0.1:9000/ws?node=a").unwrap();
        assert_eq!(addr.host, "10.0.0.1");
        assert_eq!(addr.port, 9000);
        assert_eq!(addr.path, "/ws?node=a");
    }
}
